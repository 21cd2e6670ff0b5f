//! Token-window body parser
//!
//! Extracts delimited documents from a streamed response body: bytes are
//! scanned for a begin token, captured until the end token completes, and
//! each completed span is handed back whole. Used to pull the WISPr XML
//! document out of captive-portal replies that bury it in HTML.

pub struct BodyParser {
    begin_token: Vec<u8>,
    end_token: Vec<u8>,
    matching_end: bool,
    token_pos: usize,
    content: Vec<u8>,
}

impl BodyParser {
    pub fn new(begin: &str, end: &str) -> Self {
        Self {
            begin_token: begin.as_bytes().to_vec(),
            end_token: end.as_bytes().to_vec(),
            matching_end: false,
            token_pos: 0,
            content: Vec::new(),
        }
    }

    fn token(&self) -> &[u8] {
        if self.matching_end {
            &self.end_token
        } else {
            &self.begin_token
        }
    }

    /// Feed one body chunk; returns any documents completed within it.
    pub fn feed(&mut self, mut data: &[u8]) -> Vec<String> {
        let mut documents = Vec::new();

        while !data.is_empty() {
            let expected = self.token()[self.token_pos];

            if self.token_pos == 0 {
                let Some(pos) = data.iter().position(|&b| b == expected) else {
                    if self.matching_end {
                        self.content.extend_from_slice(data);
                    }
                    break;
                };

                if self.matching_end {
                    self.content.extend_from_slice(&data[..=pos]);
                }
                data = &data[pos + 1..];
                self.token_pos = 1;
                continue;
            }

            let byte = data[0];
            if self.matching_end {
                self.content.push(byte);
            }

            data = &data[1..];
            if byte != expected {
                self.token_pos = 0;
                continue;
            }

            self.token_pos += 1;
            if self.token_pos < self.token().len() {
                continue;
            }

            if !self.matching_end {
                self.content.extend_from_slice(&self.begin_token);
                self.matching_end = true;
            } else {
                let doc = std::mem::take(&mut self.content);
                documents.push(String::from_utf8_lossy(&doc).into_owned());
                self.matching_end = false;
            }
            self.token_pos = 0;
        }

        documents
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BEGIN: &str = "<WISPAccessGatewayParam";
    const END: &str = "WISPAccessGatewayParam>";

    #[test]
    fn test_extracts_document() {
        let mut parser = BodyParser::new(BEGIN, END);
        let body = "<html><!-- <WISPAccessGatewayParam>\
                    <MessageType>100</MessageType>\
                    </WISPAccessGatewayParam> --></html>";
        let docs = parser.feed(body.as_bytes());
        assert_eq!(docs.len(), 1);
        assert!(docs[0].starts_with("<WISPAccessGatewayParam"));
        assert!(docs[0].ends_with("WISPAccessGatewayParam>"));
        assert!(docs[0].contains("<MessageType>100</MessageType>"));
    }

    #[test]
    fn test_document_split_across_chunks() {
        let mut parser = BodyParser::new(BEGIN, END);
        let body = "junk<WISPAccessGatewayParam><ResponseCode>50</ResponseCode>\
                    </WISPAccessGatewayParam>tail";

        let mut docs = Vec::new();
        for chunk in body.as_bytes().chunks(7) {
            docs.extend(parser.feed(chunk));
        }
        assert_eq!(docs.len(), 1);
        assert!(docs[0].contains("<ResponseCode>50</ResponseCode>"));
    }

    #[test]
    fn test_no_token_yields_nothing() {
        let mut parser = BodyParser::new(BEGIN, END);
        assert!(parser.feed(b"<html>plain portal page</html>").is_empty());
    }
}

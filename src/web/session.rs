//! Per-request session plumbing: URL parsing, response parsing, chunked
//! transfer decoding.
//!
//! The response parser is line-oriented through the header phase, then
//! hands the remainder to the body path. Chunked bodies run through a small
//! four-state decoder that tolerates size tokens split across reads.

use crate::error::{ConnError, ConnResult};
use std::collections::HashMap;

/// Where the request goes and what the request line says.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedUrl {
    /// Value of the Host header.
    pub host: String,
    /// Endpoint actually connected to (the proxy when one is set).
    pub connect_host: String,
    pub port: u16,
    /// Request-line target: path, or the absolute URL through a proxy.
    pub request: String,
    pub use_tls: bool,
}

/// Split an URL (and optional proxy) into connection endpoint, Host header
/// and request-line target. Through a proxy the request line carries the
/// absolute URL and Host keeps its explicit port.
pub fn parse_url(url: &str, proxy: Option<&str>) -> ConnResult<ParsedUrl> {
    let (scheme, rest) = match url.split_once("://") {
        Some((scheme, rest)) => (scheme, rest),
        None => ("http", url),
    };

    let (default_port, use_tls) = match scheme.to_ascii_lowercase().as_str() {
        "http" => (80, false),
        "https" => (443, true),
        other => {
            return Err(ConnError::InvalidArgument(format!("scheme {}", other)));
        }
    };

    let (hostport, path) = match rest.split_once('/') {
        Some((hostport, path)) => (hostport, path),
        None => (rest, ""),
    };

    let (hostname, explicit_port) = split_host_port(hostport);
    let port = explicit_port.unwrap_or(default_port);

    let (host, request) = if proxy.is_some() {
        (format!("{}:{}", hostname, port), url.to_string())
    } else {
        (hostname.to_string(), format!("/{}", path))
    };

    let Some(proxy) = proxy else {
        return Ok(ParsedUrl {
            host,
            connect_host: hostname.to_string(),
            port,
            request,
            use_tls,
        });
    };

    let proxy_rest = match proxy.split_once("://") {
        Some((scheme, rest)) => {
            if !scheme.eq_ignore_ascii_case("http") {
                return Err(ConnError::InvalidArgument(format!("proxy scheme {}", scheme)));
            }
            rest
        }
        None => proxy,
    };

    let proxy_hostport = proxy_rest.split('/').next().unwrap_or(proxy_rest);
    let (proxy_host, proxy_port) = split_host_port(proxy_hostport);

    Ok(ParsedUrl {
        host,
        connect_host: proxy_host.to_string(),
        port: proxy_port.unwrap_or(80),
        request,
        // Plain proxying only; an http proxy cannot carry our TLS session.
        use_tls: false,
    })
}

fn split_host_port(hostport: &str) -> (&str, Option<u16>) {
    if let Some((host, port)) = hostport.rsplit_once(':') {
        if let Ok(port) = port.parse::<u16>() {
            return (host, Some(port));
        }
    }
    (hostport, None)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Size,
    RBody,
    NBody,
    Data,
}

/// Decoder for `Transfer-Encoding: chunked` bodies. A size token split
/// between reads is reassembled in `token`.
pub struct ChunkDecoder {
    state: ChunkState,
    chunk_size: usize,
    chunk_left: usize,
    token: Vec<u8>,
    pub done: bool,
}

impl Default for ChunkDecoder {
    fn default() -> Self {
        Self {
            state: ChunkState::Size,
            chunk_size: 0,
            chunk_left: 0,
            token: Vec::new(),
            done: false,
        }
    }
}

impl ChunkDecoder {
    /// Feed raw body bytes; `emit` receives decoded data slices and returns
    /// whether to keep going. `Err` means malformed framing.
    pub fn feed(
        &mut self,
        mut data: &[u8],
        emit: &mut dyn FnMut(&[u8]) -> bool,
    ) -> Result<bool, ()> {
        while !data.is_empty() && !self.done {
            match self.state {
                ChunkState::Size => {
                    let Some(pos) = data.iter().position(|&b| b == b'\n') else {
                        self.token.extend_from_slice(data);
                        return Ok(true);
                    };

                    if pos == 0 && self.token.is_empty() {
                        return Err(());
                    }
                    self.token.extend_from_slice(&data[..pos]);
                    data = &data[pos + 1..];

                    if self.token.last() != Some(&b'\r') {
                        return Err(());
                    }
                    self.token.pop();

                    let digits: Vec<u8> = self
                        .token
                        .iter()
                        .copied()
                        .take_while(u8::is_ascii_hexdigit)
                        .collect();
                    if digits.is_empty() {
                        return Err(());
                    }
                    let text = std::str::from_utf8(&digits).map_err(|_| ())?;
                    let size = usize::from_str_radix(text, 16).map_err(|_| ())?;

                    self.chunk_size = size;
                    self.chunk_left = size;
                    self.state = ChunkState::Data;
                }
                ChunkState::RBody => {
                    if data[0] != b'\r' {
                        return Err(());
                    }
                    data = &data[1..];
                    self.state = ChunkState::NBody;
                }
                ChunkState::NBody => {
                    if data[0] != b'\n' {
                        return Err(());
                    }
                    data = &data[1..];
                    self.state = ChunkState::Size;
                }
                ChunkState::Data => {
                    if self.chunk_size == 0 {
                        self.done = true;
                        self.token.clear();
                        return Ok(true);
                    }

                    let take = self.chunk_left.min(data.len());
                    if !emit(&data[..take]) {
                        return Ok(false);
                    }
                    data = &data[take..];
                    self.chunk_left -= take;

                    if self.chunk_left == 0 {
                        self.token.clear();
                        self.state = ChunkState::RBody;
                    }
                }
            }
        }

        Ok(true)
    }
}

/// Line-oriented response parser: lenient status line, folded continuation
/// lines, duplicate headers joined with `"; "`, then the plain or chunked
/// body path.
pub struct ResponseParser {
    pub status: u16,
    pub headers: HashMap<String, String>,
    last_key: Option<String>,
    line: Vec<u8>,
    header_done: bool,
    use_chunk: bool,
    decoder: ChunkDecoder,
}

impl Default for ResponseParser {
    fn default() -> Self {
        Self {
            status: 0,
            headers: HashMap::new(),
            last_key: None,
            line: Vec::new(),
            header_done: false,
            use_chunk: false,
            decoder: ChunkDecoder::default(),
        }
    }
}

impl ResponseParser {
    /// Feed a read's worth of bytes. Body data flows to `emit`; its return
    /// value stops the session. `Err` is a framing error (reported as 400).
    pub fn feed(
        &mut self,
        mut data: &[u8],
        emit: &mut dyn FnMut(&[u8]) -> bool,
    ) -> Result<bool, ()> {
        if self.header_done {
            return self.handle_body(data, emit);
        }

        while !data.is_empty() {
            let Some(pos) = data.iter().position(|&b| b == b'\n') else {
                self.line.extend_from_slice(data);
                return Ok(true);
            };

            self.line.extend_from_slice(&data[..pos]);
            data = &data[pos + 1..];
            if self.line.last() == Some(&b'\r') {
                self.line.pop();
            }

            if self.line.is_empty() {
                self.header_done = true;

                if let Some(te) = self.headers.get("Transfer-Encoding") {
                    if te.contains("chunked") {
                        self.use_chunk = true;
                    }
                }

                return self.handle_body(data, emit);
            }

            let line = std::mem::take(&mut self.line);
            self.handle_header_line(&line);
        }

        Ok(true)
    }

    fn handle_header_line(&mut self, line: &[u8]) {
        let text = String::from_utf8_lossy(line);

        if self.status == 0 {
            if let Some(code) = parse_status_line(&text) {
                self.status = code;
                return;
            }
        }

        // Continuation lines fold into the previous header.
        if text.starts_with(' ') || text.starts_with('\t') {
            let folded = text.trim_start();
            if let Some(key) = &self.last_key {
                if let Some(value) = self.headers.get_mut(key) {
                    value.push(' ');
                    value.push_str(folded);
                }
            }
            return;
        }

        let Some((key, value)) = text.split_once(':') else {
            return;
        };
        let key = key.to_string();
        let value = value.trim_start().to_string();

        self.headers
            .entry(key.clone())
            .and_modify(|existing| {
                existing.push_str("; ");
                existing.push_str(&value);
            })
            .or_insert(value);
        self.last_key = Some(key);
    }

    fn handle_body(
        &mut self,
        data: &[u8],
        emit: &mut dyn FnMut(&[u8]) -> bool,
    ) -> Result<bool, ()> {
        if !self.use_chunk {
            if !data.is_empty() && !emit(data) {
                return Ok(false);
            }
            return Ok(true);
        }

        self.decoder.feed(data, emit)
    }
}

/// Lenient status-line scan: the numeric field after the HTTP version.
fn parse_status_line(line: &str) -> Option<u16> {
    if !line.starts_with("HTTP/") {
        return None;
    }
    line.split_whitespace().nth(1)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(parser: &mut ResponseParser, chunks: &[&[u8]]) -> (Vec<u8>, bool) {
        let mut body = Vec::new();
        let mut ok = true;
        for chunk in chunks {
            match parser.feed(chunk, &mut |data| {
                body.extend_from_slice(data);
                true
            }) {
                Ok(true) => {}
                Ok(false) => break,
                Err(()) => {
                    ok = false;
                    break;
                }
            }
        }
        (body, ok)
    }

    #[test]
    fn test_parse_url_plain() {
        let parsed = parse_url("http://ipv4.connman.net/online/status.html", None).unwrap();
        assert_eq!(parsed.host, "ipv4.connman.net");
        assert_eq!(parsed.connect_host, "ipv4.connman.net");
        assert_eq!(parsed.port, 80);
        assert_eq!(parsed.request, "/online/status.html");
        assert!(!parsed.use_tls);
    }

    #[test]
    fn test_parse_url_tls_and_port() {
        let parsed = parse_url("https://hotspot.example:8443/login", None).unwrap();
        assert_eq!(parsed.port, 8443);
        assert!(parsed.use_tls);
        assert_eq!(parsed.request, "/login");
    }

    #[test]
    fn test_parse_url_through_proxy() {
        let parsed = parse_url(
            "http://ipv4.connman.net/online/status.html",
            Some("http://proxy.example:3128"),
        )
        .unwrap();
        assert_eq!(parsed.host, "ipv4.connman.net:80");
        assert_eq!(parsed.connect_host, "proxy.example");
        assert_eq!(parsed.port, 3128);
        assert_eq!(parsed.request, "http://ipv4.connman.net/online/status.html");
    }

    #[test]
    fn test_parse_url_rejects_unknown_scheme() {
        assert!(parse_url("ftp://example.org/x", None).is_err());
    }

    #[test]
    fn test_plain_body() {
        let mut parser = ResponseParser::default();
        let (body, ok) = collect(
            &mut parser,
            &[b"HTTP/1.1 200 OK\r\nContent-Type: text/html\r\n\r\nhello"],
        );
        assert!(ok);
        assert_eq!(parser.status, 200);
        assert_eq!(body, b"hello");
    }

    #[test]
    fn test_header_fold_and_join() {
        let mut parser = ResponseParser::default();
        collect(
            &mut parser,
            &[b"HTTP/1.1 302 Found\r\nLocation: http://a/\r\n\tcontinued\r\nX-Dup: one\r\nX-Dup: two\r\n\r\n"],
        );
        assert_eq!(parser.headers.get("Location").unwrap(), "http://a/ continued");
        assert_eq!(parser.headers.get("X-Dup").unwrap(), "one; two");
    }

    #[test]
    fn test_chunked_body() {
        let mut parser = ResponseParser::default();
        let (body, ok) = collect(
            &mut parser,
            &[b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n"],
        );
        assert!(ok);
        assert_eq!(body, b"hello world");
    }

    #[test]
    fn test_chunk_size_token_split_across_reads() {
        let mut parser = ResponseParser::default();
        let (body, ok) = collect(
            &mut parser,
            &[
                b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n",
                b"b",
                b"\r",
                b"\nhello",
                b" world\r\n0\r\n\r\n",
            ],
        );
        assert!(ok);
        assert_eq!(body, b"hello world");
    }

    #[test]
    fn test_chunk_framing_error() {
        let mut parser = ResponseParser::default();
        let (_, ok) = collect(
            &mut parser,
            &[b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\nzz\r\nnope"],
        );
        assert!(!ok);
    }

    #[test]
    fn test_lenient_status_line() {
        assert_eq!(parse_status_line("HTTP/1.1 404 Not Found"), Some(404));
        assert_eq!(parse_status_line("HTTP/1.0 200"), Some(200));
        assert_eq!(parse_status_line("SIP/2.0 200 OK"), None);
    }
}

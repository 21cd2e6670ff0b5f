//! Small non-blocking HTTP client
//!
//! A client is bound to one interface index and address family; each request
//! runs as its own task on the loop, streaming body data to the caller's
//! result callback. POST bodies are pulled from a producer callback and
//! framed chunked when the producer promises more data. Cancellation aborts
//! the session task, which severs the callbacks and closes the socket.

pub mod parser;
pub mod session;

pub use parser::BodyParser;
pub use session::{parse_url, ParsedUrl, ResponseParser};

use crate::error::{ConnError, ConnResult};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;
use tracing::debug;

const RECEIVE_BUFFER_SIZE: usize = 2048;

/// Address family restriction for name resolution and connects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddressFamily {
    #[default]
    Unspec,
    Ipv4,
    Ipv6,
}

/// One delivery to the result callback: the parsed status, the current body
/// chunk (empty on the terminal call) and the response headers.
pub struct WebResult {
    pub status: u16,
    pub buffer: Vec<u8>,
    pub headers: HashMap<String, String>,
}

impl WebResult {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Terminal sentinel: no more body data will follow.
    pub fn is_final(&self) -> bool {
        self.buffer.is_empty()
    }
}

/// Return `true` to keep receiving, `false` to stop the request.
pub type ResultCallback = Box<dyn FnMut(&WebResult) -> bool + Send>;

/// Body producer for POST: returns the next buffer and whether more will
/// follow. `more == true` selects chunked transfer encoding.
pub type BodyProducer = Box<dyn FnMut() -> (Vec<u8>, bool) + Send>;

#[derive(Clone)]
struct Settings {
    index: i32,
    family: AddressFamily,
    proxy: Option<String>,
    accept: Option<String>,
    user_agent: Option<String>,
    ua_profile: Option<String>,
    http_version: Option<String>,
    close_connection: bool,
}

/// HTTP client factory bound to one egress interface.
pub struct WebClient {
    settings: Mutex<Settings>,
    next_id: AtomicU32,
    sessions: Mutex<HashMap<u32, JoinHandle<()>>>,
    closed: AtomicBool,
}

impl WebClient {
    /// `index` > 0 binds outbound sockets to that interface.
    pub fn new(index: i32) -> Self {
        Self {
            settings: Mutex::new(Settings {
                index,
                family: AddressFamily::Unspec,
                proxy: None,
                accept: Some("*/*".to_string()),
                user_agent: Some(format!("connctl/{}", crate::VERSION)),
                ua_profile: None,
                http_version: None,
                close_connection: false,
            }),
            next_id: AtomicU32::new(1),
            sessions: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn set_proxy(&self, proxy: Option<&str>) {
        self.settings.lock().unwrap().proxy = proxy.map(str::to_string);
    }

    pub fn set_address_family(&self, family: AddressFamily) {
        self.settings.lock().unwrap().family = family;
    }

    pub fn set_accept(&self, accept: Option<&str>) {
        self.settings.lock().unwrap().accept = accept.map(str::to_string);
    }

    pub fn set_user_agent(&self, agent: Option<&str>) {
        self.settings.lock().unwrap().user_agent = agent.map(str::to_string);
    }

    pub fn set_ua_profile(&self, profile: Option<&str>) {
        self.settings.lock().unwrap().ua_profile = profile.map(str::to_string);
    }

    pub fn set_http_version(&self, version: Option<&str>) {
        self.settings.lock().unwrap().http_version = version.map(str::to_string);
    }

    pub fn set_close_connection(&self, enabled: bool) {
        self.settings.lock().unwrap().close_connection = enabled;
    }

    /// Issue a GET; the returned id cancels the request.
    pub fn request_get(&self, url: &str, callback: ResultCallback) -> ConnResult<u32> {
        self.start_request(url, None, None, callback)
    }

    /// Issue a POST with a body producer.
    pub fn request_post(
        &self,
        url: &str,
        content_type: &str,
        producer: BodyProducer,
        callback: ResultCallback,
    ) -> ConnResult<u32> {
        self.start_request(url, Some(content_type.to_string()), Some(producer), callback)
    }

    fn start_request(
        &self,
        url: &str,
        content_type: Option<String>,
        producer: Option<BodyProducer>,
        callback: ResultCallback,
    ) -> ConnResult<u32> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ConnError::InvalidState("client closed".into()));
        }

        let settings = self.settings.lock().unwrap().clone();
        let parsed = parse_url(url, settings.proxy.as_deref())?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        debug!("request {} {} -> {}:{}", id, url, parsed.connect_host, parsed.port);

        let handle = tokio::spawn(run_session(parsed, settings, content_type, producer, callback));
        self.sessions.lock().unwrap().insert(id, handle);
        Ok(id)
    }

    /// Sever the request's callbacks and close its socket. Buffers already
    /// in flight to the callback may still have been delivered.
    pub fn cancel_request(&self, id: u32) -> bool {
        let handle = self.sessions.lock().unwrap().remove(&id);
        match handle {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Cancel every outstanding request.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let sessions = std::mem::take(&mut *self.sessions.lock().unwrap());
        for (_, handle) in sessions {
            handle.abort();
        }
    }
}

impl Drop for WebClient {
    fn drop(&mut self) {
        self.close();
    }
}

trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

async fn run_session(
    parsed: ParsedUrl,
    settings: Settings,
    content_type: Option<String>,
    mut producer: Option<BodyProducer>,
    mut callback: ResultCallback,
) {
    let mut parser = ResponseParser::default();

    let finish = |parser: &ResponseParser, status: u16, callback: &mut ResultCallback| {
        let result = WebResult {
            status: if status != 0 { status } else { parser.status },
            buffer: Vec::new(),
            headers: parser.headers.clone(),
        };
        callback(&result);
    };

    let addr = match resolve(&parsed, settings.family).await {
        Ok(addr) => addr,
        Err(_) => {
            finish(&parser, 404, &mut callback);
            return;
        }
    };

    let mut stream = match connect(addr, settings.index, &parsed).await {
        Ok(stream) => stream,
        Err(_) => {
            finish(&parser, 400, &mut callback);
            return;
        }
    };

    // First producer call decides between Content-Length and chunked.
    let (first_body, mut more) = match &mut producer {
        Some(produce) if content_type.is_some() => produce(),
        _ => (Vec::new(), false),
    };

    let request = build_request(&parsed, &settings, content_type.as_deref(), &first_body, more);
    if stream.write_all(&request).await.is_err() {
        finish(&parser, 400, &mut callback);
        return;
    }

    // Drain the producer when the body is chunked.
    while more {
        let (body, still_more) = producer.as_mut().map(|p| p()).unwrap_or((Vec::new(), false));
        more = still_more;

        let mut frame = Vec::new();
        if !body.is_empty() {
            frame.extend_from_slice(format!("{:x}\r\n", body.len()).as_bytes());
            frame.extend_from_slice(&body);
            frame.extend_from_slice(b"\r\n");
        }
        if !more {
            frame.extend_from_slice(b"0\r\n\r\n");
        }
        if !frame.is_empty() && stream.write_all(&frame).await.is_err() {
            finish(&parser, 400, &mut callback);
            return;
        }
    }

    let mut buf = [0u8; RECEIVE_BUFFER_SIZE];
    loop {
        let n = match stream.read(&mut buf).await {
            Ok(0) => {
                finish(&parser, 0, &mut callback);
                return;
            }
            Ok(n) => n,
            Err(_) => {
                finish(&parser, 0, &mut callback);
                return;
            }
        };

        let mut keep_going = true;
        let status = parser.status;
        let headers_snapshot: HashMap<String, String>;

        // Parse and deliver body chunks; the parser borrows change per call,
        // so stage chunks then emit with a fresh headers snapshot.
        let mut chunks: Vec<Vec<u8>> = Vec::new();
        let outcome = parser.feed(&buf[..n], &mut |chunk| {
            chunks.push(chunk.to_vec());
            true
        });
        headers_snapshot = parser.headers.clone();
        let status = if parser.status != 0 { parser.status } else { status };

        for chunk in chunks {
            let result = WebResult {
                status,
                buffer: chunk,
                headers: headers_snapshot.clone(),
            };
            if !callback(&result) {
                keep_going = false;
                break;
            }
        }

        match outcome {
            Ok(true) if keep_going => continue,
            Ok(_) => return,
            Err(()) => {
                finish(&parser, 400, &mut callback);
                return;
            }
        }
    }
}

async fn resolve(parsed: &ParsedUrl, family: AddressFamily) -> ConnResult<SocketAddr> {
    let family_matches = |addr: &SocketAddr| match family {
        AddressFamily::Unspec => true,
        AddressFamily::Ipv4 => addr.is_ipv4(),
        AddressFamily::Ipv6 => addr.is_ipv6(),
    };

    // Numeric hosts skip the resolver.
    if let Ok(ip) = parsed.connect_host.parse::<IpAddr>() {
        let addr = SocketAddr::new(ip, parsed.port);
        if !family_matches(&addr) {
            return Err(ConnError::InvalidArgument("address family mismatch".into()));
        }
        return Ok(addr);
    }

    let addrs = lookup_host((parsed.connect_host.as_str(), parsed.port))
        .await
        .map_err(|e| ConnError::Transport(format!("resolve {}: {}", parsed.connect_host, e)))?;

    addrs
        .into_iter()
        .find(family_matches)
        .ok_or_else(|| ConnError::Transport(format!("no address for {}", parsed.connect_host)))
}

async fn connect(addr: SocketAddr, index: i32, parsed: &ParsedUrl) -> ConnResult<Box<dyn AsyncStream>> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };

    if index > 0 {
        bind_to_device(&socket, index as u32)?;
    }

    let stream = socket
        .connect(addr)
        .await
        .map_err(|e| ConnError::Transport(format!("connect {}: {}", addr, e)))?;

    if !parsed.use_tls {
        return Ok(Box::new(stream));
    }

    Ok(Box::new(tls_connect(stream, &parsed.host).await?))
}

fn bind_to_device(socket: &TcpSocket, index: u32) -> ConnResult<()> {
    use std::os::fd::AsRawFd;

    let mut name = [0u8; libc::IF_NAMESIZE];
    let ret = unsafe { libc::if_indextoname(index, name.as_mut_ptr() as *mut libc::c_char) };
    if ret.is_null() {
        return Err(ConnError::NotFound(format!("interface index {}", index)));
    }

    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_BINDTODEVICE,
            name.as_ptr() as *const libc::c_void,
            libc::IF_NAMESIZE as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(ConnError::Io(std::io::Error::last_os_error()));
    }

    debug!("bound socket to interface index {}", index);
    Ok(())
}

async fn tls_connect(
    stream: TcpStream,
    host: &str,
) -> ConnResult<tokio_rustls::client::TlsStream<TcpStream>> {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    let hostname = host.split(':').next().unwrap_or(host).to_string();
    let server_name = rustls::pki_types::ServerName::try_from(hostname)
        .map_err(|_| ConnError::InvalidArgument(format!("TLS host {}", host)))?;

    TlsConnector::from(Arc::new(config))
        .connect(server_name, stream)
        .await
        .map_err(|e| ConnError::Transport(format!("TLS handshake: {}", e)))
}

/// First line, then headers in fixed order: Host, User-Agent, x-wap-profile,
/// Accept, Content-Type, body framing, Connection.
fn build_request(
    parsed: &ParsedUrl,
    settings: &Settings,
    content_type: Option<&str>,
    first_body: &[u8],
    more: bool,
) -> Vec<u8> {
    let version = settings.http_version.as_deref().unwrap_or("1.1");
    let method = if content_type.is_some() { "POST" } else { "GET" };

    let mut out = Vec::new();
    out.extend_from_slice(format!("{} {} HTTP/{}\r\n", method, parsed.request, version).as_bytes());
    out.extend_from_slice(format!("Host: {}\r\n", parsed.host).as_bytes());

    if let Some(agent) = &settings.user_agent {
        out.extend_from_slice(format!("User-Agent: {}\r\n", agent).as_bytes());
    }
    if let Some(profile) = &settings.ua_profile {
        out.extend_from_slice(format!("x-wap-profile: {}\r\n", profile).as_bytes());
    }
    if let Some(accept) = &settings.accept {
        out.extend_from_slice(format!("Accept: {}\r\n", accept).as_bytes());
    }

    if let Some(content_type) = content_type {
        out.extend_from_slice(format!("Content-Type: {}\r\n", content_type).as_bytes());
        if more {
            out.extend_from_slice(b"Transfer-Encoding: chunked\r\n");
        } else {
            out.extend_from_slice(format!("Content-Length: {}\r\n", first_body.len()).as_bytes());
        }
    }

    if settings.close_connection {
        out.extend_from_slice(b"Connection: close\r\n");
    }
    out.extend_from_slice(b"\r\n");

    if content_type.is_some() && !first_body.is_empty() {
        if more {
            out.extend_from_slice(format!("{:x}\r\n", first_body.len()).as_bytes());
            out.extend_from_slice(first_body);
            out.extend_from_slice(b"\r\n");
        } else {
            out.extend_from_slice(first_body);
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> Settings {
        Settings {
            index: 0,
            family: AddressFamily::Unspec,
            proxy: None,
            accept: None,
            user_agent: Some("connctl/test wispr".to_string()),
            ua_profile: None,
            http_version: None,
            close_connection: true,
        }
    }

    #[test]
    fn test_get_request_headers_in_order() {
        let parsed = parse_url("http://ipv4.connman.net/online/status.html", None).unwrap();
        let out = build_request(&parsed, &settings(), None, &[], false);
        let text = String::from_utf8(out).unwrap();

        assert!(text.starts_with("GET /online/status.html HTTP/1.1\r\n"));
        let host = text.find("Host: ipv4.connman.net\r\n").unwrap();
        let agent = text.find("User-Agent: connctl/test wispr\r\n").unwrap();
        let close = text.find("Connection: close\r\n").unwrap();
        assert!(host < agent && agent < close);
        assert!(!text.contains("Accept:"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_post_with_known_length() {
        let parsed = parse_url("https://hotspot.example/login", None).unwrap();
        let body = b"button=Login&UserName=alice";
        let out = build_request(
            &parsed,
            &settings(),
            Some("application/x-www-form-urlencoded"),
            body,
            false,
        );
        let text = String::from_utf8(out).unwrap();

        assert!(text.starts_with("POST /login HTTP/1.1\r\n"));
        assert!(text.contains("Content-Type: application/x-www-form-urlencoded\r\n"));
        assert!(text.contains(&format!("Content-Length: {}\r\n", body.len())));
        assert!(!text.contains("Transfer-Encoding"));
        assert!(text.ends_with("button=Login&UserName=alice"));
    }

    #[test]
    fn test_post_chunked_when_more_promised() {
        let parsed = parse_url("http://example.org/upload", None).unwrap();
        let out = build_request(&parsed, &settings(), Some("text/plain"), b"hello", true);
        let text = String::from_utf8(out).unwrap();

        assert!(text.contains("Transfer-Encoding: chunked\r\n"));
        assert!(!text.contains("Content-Length"));
        assert!(text.ends_with("5\r\nhello\r\n"));
    }

    #[tokio::test]
    async fn test_cancel_unknown_request() {
        let client = WebClient::new(0);
        assert!(!client.cancel_request(42));
    }
}

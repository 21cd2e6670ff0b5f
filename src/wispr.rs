//! WISPr / captive-portal engine
//!
//! Each (service, family) that reaches READY gets a probe context: an HTTP
//! client bound to the service's interface issues a GET against the
//! well-known status URL, the reply body is scanned for a WISPr gateway
//! document, and the verdict either promotes the family to ONLINE, walks
//! the WISPr login flow through the agent, or flags the service as login
//! required. Starting a probe for a context that already has one cancels
//! the old probe first.

use crate::config::OnlineCheckSettings;
use crate::error::{ConnError, ConnResult};
use crate::ipconfig::IpconfigType;
use crate::service::{CredentialAgent, ProxyMethod, ServiceEvent, ServiceManager, ServiceType};
use crate::web::{AddressFamily, BodyParser, WebClient, WebResult};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const WISPR_BEGIN_TOKEN: &str = "<WISPAccessGatewayParam";
const WISPR_END_TOKEN: &str = "WISPAccessGatewayParam>";

/// Parsed WISPr gateway reply. Unknown elements are skipped; repeated
/// elements keep their last value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WisprMessage {
    pub message_type: Option<i32>,
    pub response_code: Option<i32>,
    pub login_url: Option<String>,
    pub abort_login_url: Option<String>,
    pub logoff_url: Option<String>,
    pub access_procedure: Option<String>,
    pub access_location: Option<String>,
    pub location_name: Option<String>,
}

impl WisprMessage {
    fn assign(&mut self, element: &str, text: &str) {
        let text = text.trim();
        match element {
            "MessageType" => self.message_type = text.parse().ok(),
            "ResponseCode" => self.response_code = text.parse().ok(),
            "LoginURL" => self.login_url = Some(text.to_string()),
            "AbortLoginURL" => self.abort_login_url = Some(text.to_string()),
            "LogoffURL" => self.logoff_url = Some(text.to_string()),
            "AccessProcedure" => self.access_procedure = Some(text.to_string()),
            "AccessLocation" => self.access_location = Some(text.to_string()),
            "LocationName" => self.location_name = Some(text.to_string()),
            // NextURL, Delay, ReplyMessage, LoginResultsURL and anything a
            // vendor invents are recognized but unused.
            _ => {}
        }
    }
}

/// Minimal element/text scanner for the WISPr vocabulary; CDATA sections
/// are treated as plain text.
pub fn parse_wispr(document: &str) -> WisprMessage {
    let mut message = WisprMessage::default();
    let mut current: Option<String> = None;
    let mut rest = document;

    while let Some(open) = rest.find('<') {
        let text = &rest[..open];
        if let Some(element) = &current {
            if !text.trim().is_empty() {
                message.assign(element, text);
            }
        }
        rest = &rest[open..];

        if let Some(cdata) = rest.strip_prefix("<![CDATA[") {
            let Some(end) = cdata.find("]]>") else { break };
            if let Some(element) = &current {
                message.assign(element, &cdata[..end]);
            }
            rest = &cdata[end + 3..];
            continue;
        }

        let Some(close) = rest.find('>') else { break };
        let tag = &rest[1..close];
        rest = &rest[close + 1..];

        if let Some(name) = tag.strip_prefix('/') {
            if current.as_deref() == Some(name.trim()) {
                current = None;
            }
        } else if !tag.starts_with('?') && !tag.starts_with('!') {
            let name = tag
                .split_whitespace()
                .next()
                .unwrap_or("")
                .trim_end_matches('/');
            current = Some(name.to_string());
        }
    }

    message
}

/// Percent-escape for form values.
fn uri_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            other => out.push_str(&format!("%{:02X}", other)),
        }
    }
    out
}

fn login_form(username: &str, password: &str, status_url: &str) -> String {
    format!(
        "button=Login&UserName={}&Password={}&FNAME=0&OriginatingServer={}",
        uri_escape(username),
        uri_escape(password),
        uri_escape(status_url)
    )
}

struct FetchOutcome {
    status: u16,
    headers: HashMap<String, String>,
    message: WisprMessage,
    saw_document: bool,
}

/// One request through the probe client; body chunks stream through the
/// token-window parser looking for the WISPr document.
async fn fetch(
    client: &WebClient,
    url: &str,
    post_form: Option<String>,
) -> ConnResult<FetchOutcome> {
    let (tx, rx) = oneshot::channel();
    let state = Arc::new(StdMutex::new((
        BodyParser::new(WISPR_BEGIN_TOKEN, WISPR_END_TOKEN),
        Vec::<String>::new(),
        Some(tx),
    )));

    let callback = {
        let state = state.clone();
        Box::new(move |result: &WebResult| {
            let mut state = state.lock().unwrap();
            if result.is_final() {
                let documents = std::mem::take(&mut state.1);
                if let Some(tx) = state.2.take() {
                    let _ = tx.send((result.status, result.headers.clone(), documents));
                }
                return false;
            }
            let docs = state.0.feed(&result.buffer);
            state.1.extend(docs);
            true
        })
    };

    match post_form {
        Some(form) => {
            let mut body = Some(form.into_bytes());
            client.request_post(
                url,
                "application/x-www-form-urlencoded",
                Box::new(move || (body.take().unwrap_or_default(), false)),
                callback,
            )?;
        }
        None => {
            client.request_get(url, callback)?;
        }
    }

    let (status, headers, documents) = rx
        .await
        .map_err(|_| ConnError::Transport("probe cancelled".into()))?;

    let saw_document = !documents.is_empty();
    let message = documents
        .last()
        .map(|doc| parse_wispr(doc))
        .unwrap_or_default();

    Ok(FetchOutcome {
        status,
        headers,
        message,
        saw_document,
    })
}

enum ProbeVerdict {
    Online,
    LoginRequired,
    Failed,
}

pub struct WisprManager {
    services: ServiceManager,
    settings: OnlineCheckSettings,
    agent: Mutex<Arc<dyn CredentialAgent>>,
    portals: Mutex<HashMap<(String, IpconfigType), JoinHandle<()>>>,
}

impl WisprManager {
    pub fn new(services: ServiceManager, settings: OnlineCheckSettings) -> Arc<Self> {
        Arc::new(Self {
            services,
            settings,
            agent: Mutex::new(Arc::new(crate::service::NullAgent)),
            portals: Mutex::new(HashMap::new()),
        })
    }

    pub async fn set_agent(&self, agent: Arc<dyn CredentialAgent>) {
        *self.agent.lock().await = agent;
    }

    /// Follow service transitions: READY per family starts a probe,
    /// leaving the connected set cancels both.
    pub fn start(self: &Arc<Self>) {
        let wispr = self.clone();
        let mut events = self.services.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ServiceEvent::OnlineCheck { ident, family }) => {
                        wispr.start_probe(&ident, family).await;
                    }
                    Ok(ServiceEvent::OnlineCheckStop { ident }) => {
                        wispr.stop(&ident).await;
                    }
                    Ok(ServiceEvent::StateChanged { ident, state }) => {
                        // Probes only run while the service stays connected.
                        if !state.is_connected() && !state.is_connecting() {
                            wispr.stop(&ident).await;
                        }
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!("portal engine lagged {} events", n);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    /// Idempotent per context: a running probe for the same (service,
    /// family) is cancelled and replaced.
    pub async fn start_probe(self: &Arc<Self>, ident: &str, family: IpconfigType) {
        let snapshot = match self.services.snapshot(ident).await {
            Ok(snapshot) => snapshot,
            Err(_) => return,
        };

        // Portal detection only applies to link technologies.
        match snapshot.service_type {
            ServiceType::Ethernet
            | ServiceType::Wifi
            | ServiceType::Wimax
            | ServiceType::Bluetooth
            | ServiceType::Cellular => {}
            ServiceType::Unknown
            | ServiceType::System
            | ServiceType::Gps
            | ServiceType::Vpn
            | ServiceType::Gadget => return,
        }
        if snapshot.index <= 0 {
            return;
        }

        let key = (ident.to_string(), family);
        let mut portals = self.portals.lock().await;
        if let Some(previous) = portals.remove(&key) {
            previous.abort();
        }

        let wispr = self.clone();
        let ident = ident.to_string();
        let proxy = probe_proxy(snapshot.proxy_config, &snapshot.proxies);
        let index = snapshot.index;

        let task = tokio::spawn(async move {
            wispr.run_probe(&ident, family, index, proxy).await;
            wispr
                .portals
                .lock()
                .await
                .remove(&(ident.clone(), family));
        });
        portals.insert(key, task);
    }

    /// Cancel both family contexts of a service.
    pub async fn stop(&self, ident: &str) {
        let mut portals = self.portals.lock().await;
        for family in [IpconfigType::Ipv4, IpconfigType::Ipv6] {
            if let Some(task) = portals.remove(&(ident.to_string(), family)) {
                task.abort();
            }
        }
    }

    async fn run_probe(&self, ident: &str, family: IpconfigType, index: i32, proxy: Option<String>) {
        let status_url = match family {
            IpconfigType::Ipv4 => self.settings.status_url_ipv4.clone(),
            IpconfigType::Ipv6 => self.settings.status_url_ipv6.clone(),
        };

        let client = WebClient::new(index);
        client.set_address_family(match family {
            IpconfigType::Ipv4 => AddressFamily::Ipv4,
            IpconfigType::Ipv6 => AddressFamily::Ipv6,
        });
        client.set_accept(None);
        client.set_user_agent(Some(&format!("connctl/{} wispr", crate::VERSION)));
        client.set_close_connection(true);
        if let Some(proxy) = &proxy {
            client.set_proxy(Some(proxy));
        }

        debug!("portal probe for {} ({}) -> {}", ident, family.as_str(), status_url);

        match self.probe_once(&client, ident, &status_url).await {
            ProbeVerdict::Online => {
                info!("{} is online ({})", ident, family.as_str());
                self.services.online_check_result(ident, family, true).await;
            }
            ProbeVerdict::LoginRequired => {
                let _ = self.services.request_login(ident).await;
            }
            ProbeVerdict::Failed => {
                debug!("portal probe for {} failed", ident);
                self.services
                    .online_check_result(ident, family, false)
                    .await;
            }
        }
    }

    /// One full probe pass including the WISPr login exchange.
    async fn probe_once(&self, client: &WebClient, ident: &str, status_url: &str) -> ProbeVerdict {
        let mut url = status_url.to_string();
        let mut redirects = 0u32;
        // A successful login re-probes the status URL once more.
        let mut logins = 0u32;

        loop {
            let outcome = match fetch(client, &url, None).await {
                Ok(outcome) => outcome,
                Err(_) => return ProbeVerdict::Failed,
            };

            if outcome.saw_document {
                match self.handle_wispr_message(client, ident, status_url, &outcome).await {
                    WisprStep::Reprobe if logins == 0 => {
                        logins += 1;
                        url = status_url.to_string();
                        continue;
                    }
                    WisprStep::Reprobe => return ProbeVerdict::Failed,
                    WisprStep::Verdict(verdict) => return verdict,
                }
            }

            match outcome.status {
                200 => {
                    if outcome.headers.contains_key("X-ConnMan-Status") {
                        for header in
                            ["X-ConnMan-Client-IP", "X-ConnMan-Client-Country", "X-ConnMan-Client-Region"]
                        {
                            if let Some(value) = outcome.headers.get(header) {
                                info!("{}: {}", header.trim_start_matches("X-ConnMan-"), value);
                            }
                        }
                        return ProbeVerdict::Online;
                    }
                    return ProbeVerdict::LoginRequired;
                }
                302 => {
                    let Some(location) = outcome.headers.get("Location") else {
                        return ProbeVerdict::Failed;
                    };
                    if redirects > 0 {
                        return ProbeVerdict::Failed;
                    }
                    redirects += 1;
                    debug!("redirect URL: {}", location);
                    url = location.clone();
                }
                404 => return ProbeVerdict::Failed,
                _ => return ProbeVerdict::Failed,
            }
        }
    }

    async fn handle_wispr_message(
        &self,
        client: &WebClient,
        ident: &str,
        status_url: &str,
        outcome: &FetchOutcome,
    ) -> WisprStep {
        let message = &outcome.message;
        debug!(
            "WISPr message type {:?} response code {:?}",
            message.message_type, message.response_code
        );

        match message.message_type {
            Some(100) => {
                // Initial redirect: credentials required.
                let _ = self.services.request_login(ident).await;

                let agent = self.agent.lock().await.clone();
                let Ok((username, password)) = agent.request_login(ident).await else {
                    return WisprStep::Verdict(ProbeVerdict::LoginRequired);
                };

                let Some(login_url) = &message.login_url else {
                    return WisprStep::Verdict(ProbeVerdict::Failed);
                };

                let form = login_form(&username, &password, status_url);
                let login = match fetch(client, login_url, Some(form)).await {
                    Ok(login) => login,
                    Err(_) => return WisprStep::Verdict(ProbeVerdict::Failed),
                };

                match (login.message.message_type, login.message.response_code) {
                    (Some(120) | Some(140), Some(50)) => WisprStep::Reprobe,
                    _ => WisprStep::Verdict(ProbeVerdict::Failed),
                }
            }
            Some(120) | Some(140) => {
                if message.response_code == Some(50) {
                    WisprStep::Reprobe
                } else {
                    WisprStep::Verdict(ProbeVerdict::Failed)
                }
            }
            _ => WisprStep::Verdict(ProbeVerdict::Failed),
        }
    }
}

enum WisprStep {
    Reprobe,
    Verdict(ProbeVerdict),
}

fn probe_proxy(method: ProxyMethod, proxies: &[String]) -> Option<String> {
    let proxy = match method {
        ProxyMethod::Manual => proxies.first().cloned(),
        ProxyMethod::Direct => None,
        ProxyMethod::Unknown | ProxyMethod::Auto => std::env::var("http_proxy").ok(),
    };
    proxy.filter(|p| p != "DIRECT")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_login_required() {
        let doc = "<WISPAccessGatewayParam>\
                   <Redirect>\
                   <MessageType>100</MessageType>\
                   <ResponseCode>0</ResponseCode>\
                   <LoginURL>https://hotspot.example/login</LoginURL>\
                   </Redirect>\
                   </WISPAccessGatewayParam>";
        let message = parse_wispr(doc);
        assert_eq!(message.message_type, Some(100));
        assert_eq!(message.response_code, Some(0));
        assert_eq!(
            message.login_url.as_deref(),
            Some("https://hotspot.example/login")
        );
    }

    #[test]
    fn test_parse_ignores_unknown_elements() {
        let doc = "<WISPAccessGatewayParam>\
                   <VendorSpecific>opaque</VendorSpecific>\
                   <MessageType>120</MessageType>\
                   <NoSuchField>9</NoSuchField>\
                   <ResponseCode>50</ResponseCode>\
                   </WISPAccessGatewayParam>";
        let message = parse_wispr(doc);
        assert_eq!(message.message_type, Some(120));
        assert_eq!(message.response_code, Some(50));
        assert_eq!(message.login_url, None);
    }

    #[test]
    fn test_parse_cdata_text() {
        let doc = "<WISPAccessGatewayParam>\
                   <LocationName><![CDATA[Cafe & Bar]]></LocationName>\
                   <MessageType>100</MessageType>\
                   </WISPAccessGatewayParam>";
        let message = parse_wispr(doc);
        assert_eq!(message.location_name.as_deref(), Some("Cafe & Bar"));
    }

    #[test]
    fn test_login_form_encoding() {
        let form = login_form("alice", "pw", "http://ipv4.connman.net/online/status.html");
        assert_eq!(
            form,
            "button=Login&UserName=alice&Password=pw&FNAME=0&\
             OriginatingServer=http%3A%2F%2Fipv4.connman.net%2Fonline%2Fstatus.html"
        );
    }

    #[test]
    fn test_login_form_escapes_reserved() {
        let form = login_form("a&b", "p w=", "http://s/");
        assert!(form.contains("UserName=a%26b"));
        assert!(form.contains("Password=p%20w%3D"));
    }

    #[test]
    fn test_probe_proxy_selection() {
        assert_eq!(
            probe_proxy(ProxyMethod::Manual, &["proxy.lan:3128".to_string()]),
            Some("proxy.lan:3128".to_string())
        );
        assert_eq!(probe_proxy(ProxyMethod::Direct, &[]), None);
        assert_eq!(
            probe_proxy(ProxyMethod::Manual, &["DIRECT".to_string()]),
            None
        );
    }
}

//! 6-to-4 tunnel controller
//!
//! When a service's IPv4 side comes up with a globally routable address
//! and its IPv6 method is auto, a `sit` tunnel carries IPv6 through the
//! 2002::/16 relay: the tunnel gets the 2002:AABB:CCDD::1/64 address
//! derived from the IPv4 address and a default route via the anycast
//! relay, then an HTTP probe over the tunnel decides whether it stays.
//! The tunnel name is PID-qualified so concurrent managers never fight
//! over one device.

use crate::error::{ConnError, ConnResult};
use crate::inet::{self, Inet};
use crate::ipconfig::IpconfigMethod;
use crate::service::{ServiceEvent, ServiceManager, ServiceState};
use crate::web::{WebClient, WebResult};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};

const RELAY_GATEWAY: &str = "::192.88.99.1";
const TUNNEL_MTU: u32 = 1472;
const STATUS_URL: &str = "http://ipv6.connman.net/online/status.html";

/// 2002:AABB:CCDD::1 from the public IPv4 address.
fn sixtofour_address(address: Ipv4Addr) -> Ipv6Addr {
    let [a, b, c, d] = address.octets();
    Ipv6Addr::new(
        0x2002,
        u16::from_be_bytes([a, b]),
        u16::from_be_bytes([c, d]),
        0,
        0,
        0,
        0,
        1,
    )
}

/// The tunnel only works from a globally routable IPv4 address.
fn is_private(address: Ipv4Addr) -> bool {
    let [a, b, ..] = address.octets();
    a == 10 || (a == 192 && b == 168) || (a == 172 && (16..=31).contains(&b))
}

struct TunnelState {
    created: bool,
    pending: bool,
    address: Option<Ipv4Addr>,
    client: Option<Arc<WebClient>>,
}

pub struct SixToFour {
    services: ServiceManager,
    inet: Inet,
    tunnel_name: String,
    status_url: String,
    state: Mutex<TunnelState>,
}

impl SixToFour {
    pub fn new(services: ServiceManager, inet: Inet) -> Arc<Self> {
        Arc::new(Self {
            services,
            inet,
            tunnel_name: format!("tun6to4-{}", std::process::id()),
            status_url: STATUS_URL.to_string(),
            state: Mutex::new(TunnelState {
                created: false,
                pending: false,
                address: None,
                client: None,
            }),
        })
    }

    /// Track service transitions: ready services are probe candidates,
    /// disconnecting ones take their tunnel with them.
    pub fn start(self: &Arc<Self>) {
        let controller = self.clone();
        let mut events = self.services.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ServiceEvent::StateChanged { ident, state }) => match state {
                        ServiceState::Ready => {
                            if let Err(e) = controller.probe(&ident).await {
                                debug!("6to4 probe for {} skipped: {}", ident, e);
                            }
                        }
                        ServiceState::Disconnect
                        | ServiceState::Failure
                        | ServiceState::Idle => {
                            controller.remove(&ident).await;
                        }
                        _ => {}
                    },
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!("6to4 controller lagged {} events", n);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    /// Consider building the tunnel for this service. Requires an IPv6
    /// auto method and a public IPv4 address; refuses RFC1918 space.
    pub async fn probe(self: &Arc<Self>, ident: &str) -> ConnResult<()> {
        {
            let state = self.state.lock().await;
            if state.created || state.pending {
                return Ok(());
            }
        }

        let snapshot = self.services.snapshot(ident).await?;

        if IpconfigMethod::from_str(&snapshot.ipv6_method) != IpconfigMethod::Auto {
            return Err(ConnError::NotSupported("IPv6 method not auto".into()));
        }

        let Some(IpAddr::V4(address)) = snapshot.ipv4_address else {
            return Err(ConnError::InvalidState("no IPv4 address".into()));
        };

        if is_private(address) {
            return Err(ConnError::NotSupported(
                "no public IPv4 address for 6to4".into(),
            ));
        }

        {
            let mut state = self.state.lock().await;
            state.pending = true;
            state.address = Some(address);
        }

        match self.setup(address).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.teardown().await;
                Err(e)
            }
        }
    }

    async fn setup(self: &Arc<Self>, address: Ipv4Addr) -> ConnResult<()> {
        inet::tunnel_create(&self.tunnel_name, address)?;
        {
            let mut state = self.state.lock().await;
            state.created = true;
        }

        let index = inet::ifindex(&self.tunnel_name)?;
        self.inet.set_mtu(index, TUNNEL_MTU).await?;
        self.inet.ifup(index).await?;

        let local = sixtofour_address(address);
        debug!("6to4 address {}", local);
        self.inet.add_address_v6(index, local, 64).await?;

        let relay: Ipv6Addr = RELAY_GATEWAY.parse().expect("literal");
        self.inet.add_default_route_v6(index, relay, 1).await?;

        self.launch_probe(index as i32).await
    }

    /// Reachability check through the tunnel: 4xx tears it down, anything
    /// else (including server errors) keeps it.
    async fn launch_probe(self: &Arc<Self>, index: i32) -> ConnResult<()> {
        let client = Arc::new(WebClient::new(index));
        client.set_accept(None);
        client.set_user_agent(Some(&format!("connctl/{}", crate::VERSION)));
        client.set_close_connection(true);

        {
            let mut state = self.state.lock().await;
            state.client = Some(client.clone());
        }

        let (tx, rx) = oneshot::channel();
        let mut tx = Some(tx);
        client.request_get(
            &self.status_url,
            Box::new(move |result: &WebResult| {
                if result.is_final() {
                    if let Some(tx) = tx.take() {
                        let _ = tx.send(result.status);
                    }
                    return false;
                }
                true
            }),
        )?;

        let controller = self.clone();
        tokio::spawn(async move {
            let status = rx.await.unwrap_or(0);
            debug!("6to4 probe status {}", status);

            if (400..500).contains(&status) {
                controller.teardown().await;
            } else {
                let mut state = controller.state.lock().await;
                state.pending = false;
                state.client = None;
                info!("6to4 tunnel up");
            }
        });

        Ok(())
    }

    /// Tear the tunnel down when the service whose address backs it goes
    /// away.
    pub async fn remove(&self, ident: &str) {
        let tunnel_address = self.state.lock().await.address;
        let Some(tunnel_address) = tunnel_address else {
            return;
        };

        let matches = match self.services.snapshot(ident).await {
            Ok(snapshot) => snapshot.ipv4_address == Some(IpAddr::V4(tunnel_address)),
            // The service is gone; its address cannot be verified, the
            // tunnel has lost its underlay either way.
            Err(_) => true,
        };

        if matches {
            self.teardown().await;
        }
    }

    /// Reverse order of setup: route and address go with the device.
    async fn teardown(&self) {
        let mut state = self.state.lock().await;

        if let Some(client) = state.client.take() {
            client.close();
        }

        if state.created {
            if let Ok(index) = inet::ifindex(&self.tunnel_name) {
                let relay: Ipv6Addr = RELAY_GATEWAY.parse().expect("literal");
                let _ = self.inet.del_default_route_v6(index, relay).await;
                let _ = self.inet.ifdown(index).await;
            }
            if let Err(e) = inet::tunnel_destroy(&self.tunnel_name) {
                warn!("tunnel removal: {}", e);
            } else {
                state.created = false;
            }
        }

        state.pending = false;
        state.address = None;
    }

    /// Whether the running tunnel is backed by this IPv4 address.
    pub async fn check(&self, address: Ipv4Addr) -> bool {
        let state = self.state.lock().await;
        state.created && !state.pending && state.address == Some(address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::ServiceStore;

    #[test]
    fn test_sixtofour_address_encoding() {
        let v6 = sixtofour_address("1.2.3.4".parse().unwrap());
        assert_eq!(v6.to_string(), "2002:102:304::1");

        let v6 = sixtofour_address("203.0.113.17".parse().unwrap());
        assert_eq!(v6.segments()[0], 0x2002);
        assert_eq!(v6.segments()[1], 0xcb00);
        assert_eq!(v6.segments()[2], 0x7111);
        assert_eq!(v6.segments()[7], 1);
    }

    #[test]
    fn test_private_ranges_refused() {
        assert!(is_private("10.0.0.17".parse().unwrap()));
        assert!(is_private("192.168.1.1".parse().unwrap()));
        assert!(is_private("172.16.0.1".parse().unwrap()));
        assert!(is_private("172.31.255.1".parse().unwrap()));
        assert!(!is_private("172.32.0.1".parse().unwrap()));
        assert!(!is_private("8.8.8.8".parse().unwrap()));
        assert!(!is_private("203.0.113.17".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_probe_refuses_private_address() {
        let dir = tempfile::tempdir().unwrap();
        let services = ServiceManager::new(ServiceStore::new(dir.path()));
        services.start();

        let ident = "wifi_private_net_managed_psk";
        let mut desc =
            crate::service::ServiceDescriptor::new(ident, crate::service::ServiceType::Wifi);
        desc.index = 4;
        services.register(desc).await.unwrap();
        services
            .address_bound(
                ident,
                crate::ipconfig::IpconfigType::Ipv4,
                crate::ipconfig::IpconfigAddress {
                    address: Some("10.0.0.17".parse().unwrap()),
                    prefix: 8,
                    gateway: None,
                    broadcast: None,
                },
            )
            .await
            .unwrap();

        let inet = match Inet::new() {
            Ok(inet) => inet,
            // No netlink in the build sandbox; the gate below never
            // reaches the kernel anyway.
            Err(_) => return,
        };
        let controller = SixToFour::new(services, inet);

        let err = controller.probe(ident).await.unwrap_err();
        assert!(matches!(err, ConnError::NotSupported(_)));

        // No tunnel state was created and no probe is in flight.
        let state = controller.state.lock().await;
        assert!(!state.created);
        assert!(!state.pending);
    }
}

//! Tethering controller
//!
//! Brings up the `tether` bridge with the embedded DHCPv4 server, enables
//! IPv4 forwarding and installs the NAT masquerade for the current uplink
//! through the firewall engine. Private-network requests hand out a TUN
//! device with a point-to-point /24; the device and its NAT rules go away
//! with the requesting bus peer.

pub mod dhcp_server;

pub use dhcp_server::{DhcpMessage, DhcpMessageType, DhcpServer, DhcpServerConfig};

use crate::config::TetheringSettings;
use crate::error::{ConnError, ConnResult};
use crate::firewall::FirewallManager;
use crate::inet::{self, Inet};
use std::collections::HashMap;
use std::os::fd::OwnedFd;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub const BRIDGE_NAME: &str = "tether";
const BRIDGE_IP: &str = "192.168.218.1";
const BRIDGE_BCAST: &str = "192.168.218.255";
const BRIDGE_SUBNET: &str = "255.255.255.0";
const BRIDGE_IP_START: &str = "192.168.218.100";
const BRIDGE_IP_END: &str = "192.168.218.200";

const DEFAULT_MTU: u32 = 1500;

const PRIVATE_NETWORK_IP: &str = "192.168.219.1";
const PRIVATE_NETWORK_PEER_IP: &str = "192.168.219.2";
const PRIVATE_NETWORK_PREFIX: u8 = 24;
const PRIVATE_NETWORK_SECONDARY_DNS: &str = "8.8.4.4";

/// Reply data for a private-network request; the fd rides along in the
/// method reply and is owned by the requester from then on.
pub struct PrivateNetworkGrant {
    pub path: String,
    pub fd: OwnedFd,
    pub server_ip: String,
    pub peer_ip: String,
    pub primary_dns: String,
    pub secondary_dns: String,
}

struct PrivateNetwork {
    owner: String,
    interface: String,
    index: u32,
}

struct TetherState {
    enabled: u32,
    dhcp_server: Option<Arc<DhcpServer>>,
    default_interface: Option<String>,
    prior_ip_forward: Option<bool>,
    private_networks: HashMap<String, PrivateNetwork>,
}

pub struct TetheringManager {
    inet: Inet,
    firewall: Arc<FirewallManager>,
    settings: TetheringSettings,
    state: Mutex<TetherState>,
}

impl TetheringManager {
    pub fn new(inet: Inet, firewall: Arc<FirewallManager>, settings: TetheringSettings) -> Self {
        Self {
            inet,
            firewall,
            settings,
            state: Mutex::new(TetherState {
                enabled: 0,
                dhcp_server: None,
                default_interface: None,
                prior_ip_forward: None,
                private_networks: HashMap::new(),
            }),
        }
    }

    /// Bridge + DHCP + NAT. Reference counted: only the first enable does
    /// the work.
    pub async fn enable(&self) -> ConnResult<()> {
        let mut state = self.state.lock().await;
        state.enabled += 1;
        if state.enabled != 1 {
            return Ok(());
        }

        if let Err(e) = self.setup_bridge().await {
            state.enabled = 0;
            return Err(e);
        }

        let dhcp = Arc::new(DhcpServer::new(DhcpServerConfig {
            interface: BRIDGE_NAME.to_string(),
            server_ip: BRIDGE_IP.parse().expect("literal"),
            subnet_mask: BRIDGE_SUBNET.parse().expect("literal"),
            pool_start: BRIDGE_IP_START.parse().expect("literal"),
            pool_end: BRIDGE_IP_END.parse().expect("literal"),
            lease_time: Duration::from_secs(self.settings.dhcp_lease_time as u64),
            dns_server: self
                .settings
                .fallback_dns
                .parse()
                .unwrap_or_else(|_| BRIDGE_IP.parse().expect("literal")),
        }));

        if let Err(e) = dhcp.start().await {
            let _ = self.teardown_bridge().await;
            state.enabled = 0;
            return Err(e);
        }
        state.dhcp_server = Some(dhcp);

        let uplink = state.default_interface.clone();
        if let Err(e) = self.enable_nat(&mut state, uplink.as_deref()).await {
            warn!("NAT setup failed: {}", e);
        }

        info!("tethering started");
        Ok(())
    }

    /// Reverse of enable, once the last user goes away.
    pub async fn disable(&self) -> ConnResult<()> {
        let mut state = self.state.lock().await;
        if state.enabled == 0 {
            return Err(ConnError::AlreadyDisabled("tethering".into()));
        }
        state.enabled -= 1;
        if state.enabled != 0 {
            return Ok(());
        }

        self.disable_nat(&mut state).await;

        if let Some(dhcp) = state.dhcp_server.take() {
            dhcp.stop().await;
        }

        if let Err(e) = self.teardown_bridge().await {
            warn!("bridge teardown: {}", e);
        }

        info!("tethering stopped");
        Ok(())
    }

    /// The uplink changed; re-target the masquerade rule.
    pub async fn update_interface(&self, interface: Option<&str>) {
        debug!("tethering uplink now {:?}", interface);
        let mut state = self.state.lock().await;

        match interface {
            None => {
                self.disable_nat(&mut state).await;
                state.default_interface = None;
            }
            Some(name) => {
                state.default_interface = Some(name.to_string());
                if state.enabled > 0 || !state.private_networks.is_empty() {
                    if let Err(e) = self.enable_nat(&mut state, Some(name)).await {
                        warn!("NAT re-target failed: {}", e);
                    }
                }
            }
        }
    }

    async fn setup_bridge(&self) -> ConnResult<()> {
        inet::bridge_create(BRIDGE_NAME)?;
        if let Err(e) = inet::set_forward_delay(BRIDGE_NAME, 0).await {
            let _ = inet::bridge_remove(BRIDGE_NAME);
            return Err(e);
        }

        let index = inet::ifindex(BRIDGE_NAME)?;
        self.inet
            .add_address_v4(
                index,
                BRIDGE_IP.parse().expect("literal"),
                24,
                Some(BRIDGE_BCAST.parse().expect("literal")),
                None,
            )
            .await?;
        self.inet.ifup(index).await
    }

    async fn teardown_bridge(&self) -> ConnResult<()> {
        if let Ok(index) = inet::ifindex(BRIDGE_NAME) {
            let _ = self.inet.ifdown(index).await;
        }
        inet::bridge_remove(BRIDGE_NAME)
    }

    /// Forwarding on, POSTROUTING flushed, one masquerade for the uplink.
    async fn enable_nat(
        &self,
        state: &mut TetherState,
        interface: Option<&str>,
    ) -> ConnResult<()> {
        let Some(interface) = interface else {
            return Ok(());
        };

        let prior = inet::set_ip_forward(true).await?;
        if state.prior_ip_forward.is_none() {
            state.prior_ip_forward = Some(prior);
        }

        self.firewall.command("-t nat -F POSTROUTING")?;
        self.firewall.command(&format!(
            "-t nat -A POSTROUTING -o {} -j MASQUERADE",
            interface
        ))?;
        self.firewall.commit("nat")
    }

    async fn disable_nat(&self, state: &mut TetherState) {
        if let Some(prior) = state.prior_ip_forward.take() {
            if let Err(e) = inet::set_ip_forward(prior).await {
                warn!("restoring ip_forward: {}", e);
            }
        }

        if let Err(e) = self
            .firewall
            .command("-t nat -F POSTROUTING")
            .and_then(|_| self.firewall.commit("nat"))
        {
            warn!("NAT teardown: {}", e);
        }
    }

    /// Allocate a TUN device and a point-to-point network for one bus
    /// peer. The returned fd is the peer's to close.
    pub async fn private_network_request(&self, owner: &str) -> ConnResult<PrivateNetworkGrant> {
        let (fd, interface) = inet::create_tun()?;
        let path = format!("/tethering/{}", interface);

        let mut state = self.state.lock().await;
        if state.private_networks.contains_key(&path) {
            return Err(ConnError::AlreadyExists(path));
        }

        let index = inet::ifindex(&interface)?;
        self.inet.set_mtu(index, DEFAULT_MTU).await?;
        self.inet
            .add_address_v4(
                index,
                PRIVATE_NETWORK_IP.parse().expect("literal"),
                PRIVATE_NETWORK_PREFIX,
                None,
                Some(PRIVATE_NETWORK_PEER_IP.parse().expect("literal")),
            )
            .await?;
        self.inet.ifup(index).await?;

        let uplink = state.default_interface.clone();
        if let Err(e) = self.enable_nat(&mut state, uplink.as_deref()).await {
            warn!("NAT for private network: {}", e);
        }

        state.private_networks.insert(
            path.clone(),
            PrivateNetwork {
                owner: owner.to_string(),
                interface: interface.clone(),
                index,
            },
        );

        info!("private network {} for {}", interface, owner);
        Ok(PrivateNetworkGrant {
            path,
            fd,
            server_ip: PRIVATE_NETWORK_IP.to_string(),
            peer_ip: PRIVATE_NETWORK_PEER_IP.to_string(),
            primary_dns: self.settings.fallback_dns.clone(),
            secondary_dns: PRIVATE_NETWORK_SECONDARY_DNS.to_string(),
        })
    }

    pub async fn private_network_release(&self, path: &str) -> ConnResult<()> {
        let mut state = self.state.lock().await;
        let network = state
            .private_networks
            .remove(path)
            .ok_or_else(|| ConnError::PermissionDenied(format!("network {}", path)))?;

        debug!("releasing private network {}", network.interface);
        let _ = self.inet.ifdown(network.index).await;
        if state.private_networks.is_empty() && state.enabled == 0 {
            self.disable_nat(&mut state).await;
        }
        Ok(())
    }

    /// Drop every private network owned by a departed bus peer.
    pub async fn owner_disconnected(&self, owner: &str) {
        let paths: Vec<String> = {
            let state = self.state.lock().await;
            state
                .private_networks
                .iter()
                .filter(|(_, network)| network.owner == owner)
                .map(|(path, _)| path.clone())
                .collect()
        };

        for path in paths {
            debug!("{} died, releasing {}", owner, path);
            let _ = self.private_network_release(&path).await;
        }
    }

    /// The bridge name handed to technology drivers that bridge their
    /// interfaces into the tether network.
    pub fn bridge_name(&self) -> &'static str {
        BRIDGE_NAME
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_network_literals_parse() {
        let ip: Ipv4Addr = BRIDGE_IP.parse().unwrap();
        let start: Ipv4Addr = BRIDGE_IP_START.parse().unwrap();
        let end: Ipv4Addr = BRIDGE_IP_END.parse().unwrap();
        assert!(u32::from(start) > u32::from(ip));
        assert!(u32::from(end) > u32::from(start));

        let server: Ipv4Addr = PRIVATE_NETWORK_IP.parse().unwrap();
        let peer: Ipv4Addr = PRIVATE_NETWORK_PEER_IP.parse().unwrap();
        assert_ne!(server, peer);
    }
}

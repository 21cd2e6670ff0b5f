//! Per-family IP configuration state
//!
//! Each service owns one IPv4 and one IPv6 configuration. A configuration
//! is OFF until enabled; enabling a DHCP/AUTO method hands control to the
//! external address provisioner, while MANUAL/FIXED methods are bound as
//! soon as their static address is programmed. Observers receive the
//! up/down/lower-up/lower-down/bound/released callbacks as events tagged
//! with the owning service identifier.

use crate::error::{ConnError, ConnResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpconfigType {
    Ipv4,
    Ipv6,
}

impl IpconfigType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IpconfigType::Ipv4 => "IPv4",
            IpconfigType::Ipv6 => "IPv6",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IpconfigMethod {
    #[default]
    Unknown,
    Off,
    Fixed,
    Manual,
    /// DHCP for IPv4, router-advertisement autoconfiguration for IPv6.
    Dhcp,
    Auto,
}

impl IpconfigMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            IpconfigMethod::Unknown => "unknown",
            IpconfigMethod::Off => "off",
            IpconfigMethod::Fixed => "fixed",
            IpconfigMethod::Manual => "manual",
            IpconfigMethod::Dhcp => "dhcp",
            IpconfigMethod::Auto => "auto",
        }
    }

    pub fn from_str(value: &str) -> Self {
        match value {
            "off" => IpconfigMethod::Off,
            "fixed" => IpconfigMethod::Fixed,
            "manual" => IpconfigMethod::Manual,
            "dhcp" => IpconfigMethod::Dhcp,
            "auto" => IpconfigMethod::Auto,
            _ => IpconfigMethod::Unknown,
        }
    }

    /// Methods that wait on an external collaborator for an address.
    pub fn is_provisioned(&self) -> bool {
        matches!(self, IpconfigMethod::Dhcp | IpconfigMethod::Auto)
    }

    /// OFF and UNKNOWN contribute idle to the combined service state.
    pub fn is_off(&self) -> bool {
        matches!(self, IpconfigMethod::Off | IpconfigMethod::Unknown)
    }
}

/// Observer callbacks, delivered as events tagged with the service ident.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpconfigEvent {
    Up,
    Down,
    LowerUp,
    LowerDown,
    Bound,
    Released,
}

#[derive(Debug, Clone)]
pub struct IpconfigNotify {
    pub ident: String,
    pub config_type: IpconfigType,
    pub event: IpconfigEvent,
}

/// External DHCP client / IPv6 autoconfiguration collaborator. The daemon
/// wires the real clients in; tests substitute fakes that call back
/// through the notify channel.
#[async_trait]
pub trait AddressProvisioner: Send + Sync {
    async fn start(&self, index: i32, config_type: IpconfigType) -> ConnResult<()>;
    async fn stop(&self, index: i32, config_type: IpconfigType);
}

/// Provisioner that never binds an address. Stands in when no DHCP client
/// is wired up.
pub struct NullProvisioner;

#[async_trait]
impl AddressProvisioner for NullProvisioner {
    async fn start(&self, _index: i32, _config_type: IpconfigType) -> ConnResult<()> {
        Ok(())
    }

    async fn stop(&self, _index: i32, _config_type: IpconfigType) {}
}

/// Address data held by a configuration, either user-set (manual/fixed) or
/// learned from the provisioner.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IpconfigAddress {
    pub address: Option<IpAddr>,
    pub prefix: u8,
    pub gateway: Option<IpAddr>,
    pub broadcast: Option<IpAddr>,
}

pub struct Ipconfig {
    index: i32,
    config_type: IpconfigType,
    method: IpconfigMethod,
    /// User-provided configuration (manual/fixed).
    configured: IpconfigAddress,
    /// Address currently bound on the interface.
    system: IpconfigAddress,
    /// Proxy autoconfiguration URL learned from DHCP.
    pac: Option<String>,
    enabled: bool,
    ident: String,
    notify: mpsc::UnboundedSender<IpconfigNotify>,
}

impl Ipconfig {
    pub fn new(
        index: i32,
        config_type: IpconfigType,
        ident: &str,
        notify: mpsc::UnboundedSender<IpconfigNotify>,
    ) -> Self {
        let method = match config_type {
            IpconfigType::Ipv4 => IpconfigMethod::Dhcp,
            IpconfigType::Ipv6 => IpconfigMethod::Auto,
        };
        Self {
            index,
            config_type,
            method,
            configured: IpconfigAddress::default(),
            system: IpconfigAddress::default(),
            pac: None,
            enabled: false,
            ident: ident.to_string(),
            notify,
        }
    }

    pub fn index(&self) -> i32 {
        self.index
    }

    pub fn set_index(&mut self, index: i32) {
        self.index = index;
    }

    pub fn config_type(&self) -> IpconfigType {
        self.config_type
    }

    pub fn method(&self) -> IpconfigMethod {
        self.method
    }

    pub fn set_method(&mut self, method: IpconfigMethod) -> ConnResult<()> {
        if self.config_type == IpconfigType::Ipv4 && method == IpconfigMethod::Auto {
            return Err(ConnError::NotSupported("auto method is IPv6 only".into()));
        }
        if self.config_type == IpconfigType::Ipv6 && method == IpconfigMethod::Dhcp {
            return Err(ConnError::NotSupported("dhcp method is IPv4 only".into()));
        }
        self.method = method;
        Ok(())
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn configured_address(&self) -> &IpconfigAddress {
        &self.configured
    }

    pub fn set_configured_address(&mut self, address: IpconfigAddress) {
        self.configured = address;
    }

    /// The address visible to consumers: the bound one, else the
    /// configured one for static methods.
    pub fn local(&self) -> Option<IpAddr> {
        self.system.address.or(match self.method {
            IpconfigMethod::Manual | IpconfigMethod::Fixed => self.configured.address,
            _ => None,
        })
    }

    pub fn gateway(&self) -> Option<IpAddr> {
        self.system.gateway.or(match self.method {
            IpconfigMethod::Manual | IpconfigMethod::Fixed => self.configured.gateway,
            _ => None,
        })
    }

    pub fn prefix(&self) -> u8 {
        if self.system.address.is_some() {
            self.system.prefix
        } else {
            self.configured.prefix
        }
    }

    pub fn pac(&self) -> Option<&str> {
        self.pac.as_deref()
    }

    pub fn set_pac(&mut self, pac: Option<String>) {
        self.pac = pac;
    }

    /// Enter the enabled state. Returns whether an external provisioner
    /// must be started for an address to appear.
    pub fn enable(&mut self) -> bool {
        self.enabled = true;
        self.method.is_provisioned()
    }

    pub fn disable(&mut self) {
        self.enabled = false;
        self.system = IpconfigAddress::default();
        self.pac = None;
    }

    /// Record an acquired address and fire the ip-bound callback.
    pub fn address_bound(&mut self, address: IpconfigAddress) {
        self.system = address;
        self.emit(IpconfigEvent::Bound);
    }

    /// Drop the bound address and fire ip-released.
    pub fn address_released(&mut self) {
        self.system = IpconfigAddress::default();
        self.emit(IpconfigEvent::Released);
    }

    pub fn link_up(&self) {
        self.emit(IpconfigEvent::Up);
    }

    pub fn link_down(&self) {
        self.emit(IpconfigEvent::Down);
    }

    pub fn lower_up(&self) {
        self.emit(IpconfigEvent::LowerUp);
    }

    pub fn lower_down(&self) {
        self.emit(IpconfigEvent::LowerDown);
    }

    fn emit(&self, event: IpconfigEvent) {
        let _ = self.notify.send(IpconfigNotify {
            ident: self.ident.clone(),
            config_type: self.config_type,
            event,
        });
    }

    pub fn settings(&self) -> IpconfigSettings {
        IpconfigSettings {
            method: self.method.as_str().to_string(),
            address: self.configured.address.map(|a| a.to_string()),
            prefixlen: if self.configured.address.is_some() {
                Some(self.configured.prefix)
            } else {
                None
            },
            gateway: self.configured.gateway.map(|a| a.to_string()),
        }
    }

    pub fn apply_settings(&mut self, settings: &IpconfigSettings) {
        let method = IpconfigMethod::from_str(&settings.method);
        if method != IpconfigMethod::Unknown {
            let _ = self.set_method(method);
        }

        let mut configured = IpconfigAddress::default();
        if let Some(address) = settings.address.as_deref().and_then(|a| a.parse().ok()) {
            configured.address = Some(address);
            configured.prefix = settings.prefixlen.unwrap_or(0);
        }
        if let Some(gateway) = settings.gateway.as_deref().and_then(|a| a.parse().ok()) {
            configured.gateway = Some(gateway);
        }
        if configured != IpconfigAddress::default() {
            self.configured = configured;
        }
    }
}

/// Persisted per-family keys.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IpconfigSettings {
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefixlen: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(config_type: IpconfigType) -> (Ipconfig, mpsc::UnboundedReceiver<IpconfigNotify>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Ipconfig::new(3, config_type, "wifi_00_home_managed_psk", tx), rx)
    }

    #[test]
    fn test_default_methods_per_family() {
        let (v4, _rx) = config(IpconfigType::Ipv4);
        let (v6, _rx6) = config(IpconfigType::Ipv6);
        assert_eq!(v4.method(), IpconfigMethod::Dhcp);
        assert_eq!(v6.method(), IpconfigMethod::Auto);
    }

    #[test]
    fn test_method_family_guard() {
        let (mut v4, _rx) = config(IpconfigType::Ipv4);
        assert!(v4.set_method(IpconfigMethod::Auto).is_err());
        assert!(v4.set_method(IpconfigMethod::Manual).is_ok());

        let (mut v6, _rx6) = config(IpconfigType::Ipv6);
        assert!(v6.set_method(IpconfigMethod::Dhcp).is_err());
    }

    #[test]
    fn test_bound_event_carries_ident() {
        let (mut v4, mut rx) = config(IpconfigType::Ipv4);
        v4.enable();
        v4.address_bound(IpconfigAddress {
            address: Some("192.168.1.50".parse().unwrap()),
            prefix: 24,
            gateway: Some("192.168.1.1".parse().unwrap()),
            broadcast: None,
        });

        let notify = rx.try_recv().unwrap();
        assert_eq!(notify.ident, "wifi_00_home_managed_psk");
        assert_eq!(notify.config_type, IpconfigType::Ipv4);
        assert_eq!(notify.event, IpconfigEvent::Bound);
        assert_eq!(v4.local(), Some("192.168.1.50".parse().unwrap()));
    }

    #[test]
    fn test_disable_clears_bound_state() {
        let (mut v4, _rx) = config(IpconfigType::Ipv4);
        v4.enable();
        v4.address_bound(IpconfigAddress {
            address: Some("10.0.0.2".parse().unwrap()),
            prefix: 8,
            ..Default::default()
        });
        v4.disable();
        assert!(!v4.is_enabled());
        assert_eq!(v4.local(), None);
    }

    #[test]
    fn test_settings_roundtrip() {
        let (mut v4, _rx) = config(IpconfigType::Ipv4);
        v4.set_method(IpconfigMethod::Manual).unwrap();
        v4.set_configured_address(IpconfigAddress {
            address: Some("172.16.5.9".parse().unwrap()),
            prefix: 12,
            gateway: Some("172.16.0.1".parse().unwrap()),
            broadcast: None,
        });

        let settings = v4.settings();
        let (mut restored, _rx2) = config(IpconfigType::Ipv4);
        restored.apply_settings(&settings);

        assert_eq!(restored.method(), IpconfigMethod::Manual);
        assert_eq!(restored.configured_address(), v4.configured_address());
    }
}

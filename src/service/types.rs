//! Service enumerations and the combined-state rule
//!
//! Every classification a service carries is a closed enum with exhaustive
//! matching; string forms follow the bus and keyfile vocabulary.

/// Kind of network a service fronts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceType {
    Unknown,
    System,
    Ethernet,
    Wifi,
    Wimax,
    Bluetooth,
    Cellular,
    Gps,
    Vpn,
    Gadget,
}

impl ServiceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceType::Unknown => "unknown",
            ServiceType::System => "system",
            ServiceType::Ethernet => "ethernet",
            ServiceType::Wifi => "wifi",
            ServiceType::Wimax => "wimax",
            ServiceType::Bluetooth => "bluetooth",
            ServiceType::Cellular => "cellular",
            ServiceType::Gps => "gps",
            ServiceType::Vpn => "vpn",
            ServiceType::Gadget => "gadget",
        }
    }

    pub fn from_str(value: &str) -> Self {
        match value {
            "system" => ServiceType::System,
            "ethernet" => ServiceType::Ethernet,
            "wifi" => ServiceType::Wifi,
            "wimax" => ServiceType::Wimax,
            "bluetooth" => ServiceType::Bluetooth,
            "cellular" => ServiceType::Cellular,
            "gps" => ServiceType::Gps,
            "vpn" => ServiceType::Vpn,
            "gadget" => ServiceType::Gadget,
            _ => ServiceType::Unknown,
        }
    }

    /// Types that can be connected at all.
    pub fn is_connectable(&self) -> bool {
        !matches!(
            self,
            ServiceType::Unknown | ServiceType::System | ServiceType::Gps | ServiceType::Gadget
        )
    }
}

/// Wireless security of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Security {
    #[default]
    Unknown,
    None,
    Wep,
    Psk,
    Ieee8021x,
    Wpa,
    Rsn,
}

impl Security {
    pub fn as_str(&self) -> &'static str {
        match self {
            Security::Unknown => "unknown",
            Security::None => "none",
            Security::Wep => "wep",
            Security::Psk => "psk",
            Security::Ieee8021x => "ieee8021x",
            Security::Wpa => "wpa",
            Security::Rsn => "rsn",
        }
    }

    pub fn from_str(value: &str) -> Self {
        match value {
            "none" => Security::None,
            "wep" => Security::Wep,
            "psk" => Security::Psk,
            "ieee8021x" => Security::Ieee8021x,
            "wpa" => Security::Wpa,
            "rsn" => Security::Rsn,
            _ => Security::Unknown,
        }
    }

    /// Pre-shared-key class security; advertises WPS alongside.
    pub fn uses_psk(&self) -> bool {
        matches!(self, Security::Psk | Security::Wpa | Security::Rsn)
    }

    /// Requires a passphrase before a connect can be attempted.
    pub fn needs_passphrase(&self) -> bool {
        matches!(
            self,
            Security::Wep | Security::Psk | Security::Wpa | Security::Rsn
        )
    }
}

/// Per-family and combined service state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServiceState {
    #[default]
    Unknown,
    Idle,
    Association,
    Configuration,
    Ready,
    Online,
    Disconnect,
    Failure,
}

impl ServiceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceState::Unknown => "unknown",
            ServiceState::Idle => "idle",
            ServiceState::Association => "association",
            ServiceState::Configuration => "configuration",
            ServiceState::Ready => "ready",
            ServiceState::Online => "online",
            ServiceState::Disconnect => "disconnect",
            ServiceState::Failure => "failure",
        }
    }

    pub fn is_connecting(&self) -> bool {
        matches!(self, ServiceState::Association | ServiceState::Configuration)
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ServiceState::Ready | ServiceState::Online)
    }
}

/// Combine the two per-family states into the service state. Equal states
/// pass through; unknown and idle defer to the other side; otherwise the
/// stronger of online/ready/configuration/association/disconnect wins, and
/// only two failed families combine to failure.
pub fn combine_state(a: ServiceState, b: ServiceState) -> ServiceState {
    use ServiceState::*;

    if a == b {
        return a;
    }

    for state in [Unknown, Idle] {
        if a == state {
            return b;
        }
        if b == state {
            return a;
        }
    }

    for state in [Online, Ready, Configuration, Association, Disconnect] {
        if a == state || b == state {
            return state;
        }
    }

    Failure
}

/// Typed failure cause surfaced as the service Error property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServiceError {
    #[default]
    Unknown,
    OutOfRange,
    PinMissing,
    DhcpFailed,
    ConnectFailed,
    LoginFailed,
    AuthFailed,
    InvalidKey,
}

impl ServiceError {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceError::Unknown => "unknown",
            ServiceError::OutOfRange => "out-of-range",
            ServiceError::PinMissing => "pin-missing",
            ServiceError::DhcpFailed => "dhcp-failed",
            ServiceError::ConnectFailed => "connect-failed",
            ServiceError::LoginFailed => "login-failed",
            ServiceError::AuthFailed => "auth-failed",
            ServiceError::InvalidKey => "invalid-key",
        }
    }

    pub fn from_str(value: &str) -> Self {
        match value {
            "out-of-range" => ServiceError::OutOfRange,
            "pin-missing" => ServiceError::PinMissing,
            "dhcp-failed" => ServiceError::DhcpFailed,
            "connect-failed" => ServiceError::ConnectFailed,
            "login-failed" => ServiceError::LoginFailed,
            "auth-failed" => ServiceError::AuthFailed,
            "invalid-key" => ServiceError::InvalidKey,
            _ => ServiceError::Unknown,
        }
    }
}

/// Proxy configuration method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProxyMethod {
    #[default]
    Unknown,
    Direct,
    Manual,
    Auto,
}

impl ProxyMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyMethod::Unknown => "unknown",
            ProxyMethod::Direct => "direct",
            ProxyMethod::Manual => "manual",
            ProxyMethod::Auto => "auto",
        }
    }

    pub fn from_str(value: &str) -> Self {
        match value {
            "direct" => ProxyMethod::Direct,
            "manual" => ProxyMethod::Manual,
            "auto" => ProxyMethod::Auto,
            _ => ProxyMethod::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ServiceState::*;

    #[test]
    fn test_combine_identity() {
        for state in [
            Unknown,
            Idle,
            Association,
            Configuration,
            Ready,
            Online,
            Disconnect,
            Failure,
        ] {
            assert_eq!(combine_state(state, state), state);
        }
    }

    #[test]
    fn test_combine_unknown_and_idle_defer() {
        assert_eq!(combine_state(Unknown, Ready), Ready);
        assert_eq!(combine_state(Failure, Unknown), Failure);
        assert_eq!(combine_state(Idle, Online), Online);
        assert_eq!(combine_state(Configuration, Idle), Configuration);
    }

    #[test]
    fn test_combine_priority_order() {
        assert_eq!(combine_state(Online, Ready), Online);
        assert_eq!(combine_state(Ready, Configuration), Ready);
        assert_eq!(combine_state(Configuration, Association), Configuration);
        assert_eq!(combine_state(Association, Disconnect), Association);
        assert_eq!(combine_state(Disconnect, Failure), Disconnect);
    }

    #[test]
    fn test_combine_failure_only_with_failure() {
        // One failed family does not fail a service whose other family is
        // still making progress.
        assert_eq!(combine_state(Failure, Online), Online);
        assert_eq!(combine_state(Failure, Association), Association);
    }

    #[test]
    fn test_state_classification() {
        assert!(Association.is_connecting());
        assert!(Configuration.is_connecting());
        assert!(Ready.is_connected());
        assert!(Online.is_connected());
        assert!(!Idle.is_connecting());
        assert!(!Failure.is_connected());
    }

    #[test]
    fn test_string_roundtrips() {
        assert_eq!(ServiceType::from_str("wifi"), ServiceType::Wifi);
        assert_eq!(ServiceType::Wifi.as_str(), "wifi");
        assert_eq!(Security::from_str("psk"), Security::Psk);
        assert_eq!(ServiceError::from_str("invalid-key"), ServiceError::InvalidKey);
        assert_eq!(ProxyMethod::from_str("direct"), ProxyMethod::Direct);
    }
}

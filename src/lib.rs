//! connctl - Network Connection Manager Library
//!
//! Async connection-manager library providing:
//! - Service model with ranking and auto-connect policy
//! - Per-family IPv4/IPv6 configuration state machines
//! - Packet-filter rule engine with atomic table replacement
//! - 6-to-4 tunnel and tethering control (bridge, DHCPv4 server, NAT)
//! - WISPr captive-portal detection and login
//! - Small non-blocking HTTP client and supplicant RPC helpers
//!
//! The daemon (`connctld`) exposes the manager, service and clock objects
//! on the system bus.

pub mod error;
pub mod config;
pub mod inet;
pub mod firewall;
pub mod web;
pub mod supplicant;
pub mod ipconfig;
pub mod storage;
pub mod service;
pub mod connection;
pub mod sixtofour;
pub mod tether;
pub mod wispr;
pub mod agent;
pub mod session;
pub mod technology;
pub mod clock;
pub mod ntp;
pub mod dbus;

// Re-export commonly used types
pub use error::{ConnError, ConnResult};
pub use service::{
    Security, Service, ServiceError, ServiceEvent, ServiceId, ServiceManager, ServiceState,
    ServiceType,
};
pub use ipconfig::{Ipconfig, IpconfigEvent, IpconfigMethod, IpconfigType};
pub use firewall::{FirewallManager, RuleSpec};
pub use web::{WebClient, WebResult};
pub use connection::ConnectionManager;
pub use tether::TetheringManager;
pub use sixtofour::SixToFour;
pub use wispr::WisprManager;
pub use clock::Clock;
pub use session::SessionManager;
pub use technology::TechnologyRegistry;
pub use dbus::ConnDbusService;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

//! Error types for connctl

use std::fmt;
use std::io;

#[derive(Debug)]
pub enum ConnError {
    /// IO error
    Io(io::Error),
    /// Invalid argument
    InvalidArgument(String),
    /// Object not found (service, chain, rule, interface)
    NotFound(String),
    /// Already exists
    AlreadyExists(String),
    /// Already enabled
    AlreadyEnabled(String),
    /// Already disabled
    AlreadyDisabled(String),
    /// Permission denied
    PermissionDenied(String),
    /// Not supported
    NotSupported(String),
    /// Operation already in progress
    InProgress,
    /// Operation timed out
    Timeout(String),
    /// Missing credential (passphrase, identity)
    NoKey,
    /// Kernel or peer rejected the operation
    Rejected { op: String, errno: i32 },
    /// Transport failure (connect, send, recv)
    Transport(String),
    /// Protocol violation (malformed HTTP, chunk framing, netlink reply)
    Protocol(String),
    /// Parse error
    ParseError(String),
    /// Configuration error
    ConfigError(String),
    /// Operation not valid in the current state
    InvalidState(String),
    /// Agent or counter not registered
    NotRegistered(String),
}

impl fmt::Display for ConnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnError::Io(e) => write!(f, "IO error: {}", e),
            ConnError::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
            ConnError::NotFound(msg) => write!(f, "Not found: {}", msg),
            ConnError::AlreadyExists(msg) => write!(f, "Already exists: {}", msg),
            ConnError::AlreadyEnabled(msg) => write!(f, "Already enabled: {}", msg),
            ConnError::AlreadyDisabled(msg) => write!(f, "Already disabled: {}", msg),
            ConnError::PermissionDenied(msg) => write!(f, "Permission denied: {}", msg),
            ConnError::NotSupported(msg) => write!(f, "Not supported: {}", msg),
            ConnError::InProgress => write!(f, "Operation already in progress"),
            ConnError::Timeout(msg) => write!(f, "Timeout: {}", msg),
            ConnError::NoKey => write!(f, "Missing credentials"),
            ConnError::Rejected { op, errno } => {
                write!(f, "Operation '{}' rejected by kernel: errno {}", op, errno)
            }
            ConnError::Transport(msg) => write!(f, "Transport error: {}", msg),
            ConnError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            ConnError::ParseError(msg) => write!(f, "Parse error: {}", msg),
            ConnError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            ConnError::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            ConnError::NotRegistered(msg) => write!(f, "Not registered: {}", msg),
        }
    }
}

impl std::error::Error for ConnError {}

impl From<io::Error> for ConnError {
    fn from(error: io::Error) -> Self {
        ConnError::Io(error)
    }
}

impl ConnError {
    /// Stable D-Bus error name for this error, used at every RPC boundary.
    pub fn dbus_name(&self) -> &'static str {
        match self {
            ConnError::Io(_) => "net.connctl.Error.Failed",
            ConnError::InvalidArgument(_) | ConnError::ParseError(_) => {
                "net.connctl.Error.InvalidArguments"
            }
            ConnError::NotFound(_) => "net.connctl.Error.InvalidService",
            ConnError::AlreadyExists(_) => "net.connctl.Error.Failed",
            ConnError::AlreadyEnabled(_) => "net.connctl.Error.AlreadyEnabled",
            ConnError::AlreadyDisabled(_) => "net.connctl.Error.AlreadyDisabled",
            ConnError::PermissionDenied(_) => "net.connctl.Error.PermissionDenied",
            ConnError::NotSupported(_) => "net.connctl.Error.NotSupported",
            ConnError::InProgress => "net.connctl.Error.InProgress",
            ConnError::Timeout(_) => "net.connctl.Error.OperationTimeout",
            ConnError::NoKey => "net.connctl.Error.Failed",
            ConnError::Rejected { .. } => "net.connctl.Error.Failed",
            ConnError::Transport(_) | ConnError::Protocol(_) => "net.connctl.Error.Failed",
            ConnError::ConfigError(_) => "net.connctl.Error.Failed",
            ConnError::InvalidState(_) => "net.connctl.Error.InvalidProperty",
            ConnError::NotRegistered(_) => "net.connctl.Error.NotRegistered",
        }
    }
}

impl From<ConnError> for zbus::fdo::Error {
    fn from(error: ConnError) -> Self {
        zbus::fdo::Error::Failed(error.to_string())
    }
}

pub type ConnResult<T> = Result<T, ConnError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dbus_names_are_stable() {
        assert_eq!(
            ConnError::InProgress.dbus_name(),
            "net.connctl.Error.InProgress"
        );
        assert_eq!(
            ConnError::Timeout("connect".into()).dbus_name(),
            "net.connctl.Error.OperationTimeout"
        );
        assert_eq!(ConnError::NoKey.dbus_name(), "net.connctl.Error.Failed");
    }
}

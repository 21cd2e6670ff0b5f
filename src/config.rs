//! Configuration management for connctl

use crate::error::{ConnError, ConnResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main connctl configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnConfig {
    /// Configuration file paths
    #[serde(default)]
    pub paths: ConfigPaths,
    /// Online-check (captive portal) settings
    #[serde(default)]
    pub online_check: OnlineCheckSettings,
    /// Tethering settings
    #[serde(default)]
    pub tethering: TetheringSettings,
    /// Clock settings
    #[serde(default)]
    pub clock: ClockSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigPaths {
    /// Per-service settings directory
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,
    /// Runtime state directory
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnlineCheckSettings {
    /// Status URL probed over IPv4
    #[serde(default = "default_status_url_ipv4")]
    pub status_url_ipv4: String,
    /// Status URL probed over IPv6
    #[serde(default = "default_status_url_ipv6")]
    pub status_url_ipv6: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TetheringSettings {
    /// DHCP lease time handed to tethered clients (seconds)
    #[serde(default = "default_lease_time")]
    pub dhcp_lease_time: u32,
    /// Fallback DNS handed out when the local resolver takes no listener
    #[serde(default = "default_fallback_dns")]
    pub fallback_dns: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClockSettings {
    /// Fallback NTP servers used when no service provides timeservers
    #[serde(default)]
    pub timeservers: Vec<String>,
}

fn default_storage_dir() -> PathBuf {
    PathBuf::from("/var/lib/connctl")
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/run/connctl")
}

fn default_status_url_ipv4() -> String {
    "http://ipv4.connman.net/online/status.html".to_string()
}

fn default_status_url_ipv6() -> String {
    "http://ipv6.connman.net/online/status.html".to_string()
}

fn default_lease_time() -> u32 {
    24 * 3600
}

fn default_fallback_dns() -> String {
    "8.8.8.8".to_string()
}

impl Default for ConfigPaths {
    fn default() -> Self {
        Self {
            storage_dir: default_storage_dir(),
            state_dir: default_state_dir(),
        }
    }
}

impl Default for OnlineCheckSettings {
    fn default() -> Self {
        Self {
            status_url_ipv4: default_status_url_ipv4(),
            status_url_ipv6: default_status_url_ipv6(),
        }
    }
}

impl Default for TetheringSettings {
    fn default() -> Self {
        Self {
            dhcp_lease_time: default_lease_time(),
            fallback_dns: default_fallback_dns(),
        }
    }
}

impl Default for ClockSettings {
    fn default() -> Self {
        Self {
            timeservers: Vec::new(),
        }
    }
}

impl Default for ConnConfig {
    fn default() -> Self {
        Self {
            paths: ConfigPaths::default(),
            online_check: OnlineCheckSettings::default(),
            tethering: TetheringSettings::default(),
            clock: ClockSettings::default(),
        }
    }
}

impl ConnConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> ConnResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConnError::ConfigError(format!("Failed to read config: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| ConnError::ConfigError(format!("Failed to parse config: {}", e)))
    }

    /// Ensure all directories exist
    pub fn ensure_directories(&self) -> ConnResult<()> {
        for dir in [&self.paths.storage_dir, &self.paths.state_dir] {
            std::fs::create_dir_all(dir).map_err(|e| {
                ConnError::ConfigError(format!("Failed to create directory {:?}: {}", dir, e))
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ConnConfig::default();
        assert_eq!(config.tethering.dhcp_lease_time, 86400);
        assert!(config
            .online_check
            .status_url_ipv4
            .starts_with("http://ipv4."));
    }

    #[test]
    fn test_partial_config_parses() {
        let config: ConnConfig = toml::from_str(
            "[tethering]\nfallback_dns = \"9.9.9.9\"\n",
        )
        .unwrap();
        assert_eq!(config.tethering.fallback_dns, "9.9.9.9");
        assert_eq!(config.tethering.dhcp_lease_time, 86400);
    }
}

//! Per-service settings persistence
//!
//! One settings file per service identifier under the storage directory.
//! The key set is the stable on-disk vocabulary; everything a service needs
//! to come back after a restart lives here.

use crate::error::{ConnError, ConnResult};
use crate::ipconfig::IpconfigSettings;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ServiceSettings {
    #[serde(rename = "Name", skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Hex-encoded SSID bytes (wifi only).
    #[serde(rename = "SSID", skip_serializing_if = "Option::is_none")]
    pub ssid: Option<String>,
    #[serde(rename = "Frequency", skip_serializing_if = "Option::is_none")]
    pub frequency: Option<u32>,
    #[serde(rename = "Favorite", default)]
    pub favorite: bool,
    #[serde(rename = "AutoConnect", skip_serializing_if = "Option::is_none")]
    pub autoconnect: Option<bool>,
    /// Recorded failure cause; present only while the service is failed.
    #[serde(rename = "Failure", skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    /// ISO-8601 timestamp of the last user-visible edit.
    #[serde(rename = "Modified", skip_serializing_if = "Option::is_none")]
    pub modified: Option<String>,
    #[serde(rename = "Passphrase", skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<String>,
    #[serde(rename = "Nameservers", skip_serializing_if = "Option::is_none")]
    pub nameservers: Option<Vec<String>>,
    #[serde(rename = "Domains", skip_serializing_if = "Option::is_none")]
    pub domains: Option<Vec<String>>,
    #[serde(rename = "Proxy.Method", skip_serializing_if = "Option::is_none")]
    pub proxy_method: Option<String>,
    #[serde(rename = "Proxy.Servers", skip_serializing_if = "Option::is_none")]
    pub proxy_servers: Option<Vec<String>>,
    #[serde(rename = "Proxy.Excludes", skip_serializing_if = "Option::is_none")]
    pub proxy_excludes: Option<Vec<String>>,
    #[serde(rename = "Proxy.URL", skip_serializing_if = "Option::is_none")]
    pub proxy_url: Option<String>,
    #[serde(rename = "IPv4", skip_serializing_if = "Option::is_none")]
    pub ipv4: Option<IpconfigSettings>,
    #[serde(rename = "IPv6", skip_serializing_if = "Option::is_none")]
    pub ipv6: Option<IpconfigSettings>,
}

/// Filesystem store, one file per identifier.
#[derive(Clone)]
pub struct ServiceStore {
    dir: PathBuf,
}

impl ServiceStore {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn path_for(&self, identifier: &str) -> PathBuf {
        self.dir.join(format!("{}.settings", identifier))
    }

    pub async fn load(&self, identifier: &str) -> ConnResult<Option<ServiceSettings>> {
        let path = self.path_for(identifier);
        let contents = match fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(ConnError::Io(e)),
        };

        let settings = toml::from_str(&contents).map_err(|e| {
            ConnError::ParseError(format!("settings for {}: {}", identifier, e))
        })?;
        Ok(Some(settings))
    }

    pub async fn save(&self, identifier: &str, settings: &ServiceSettings) -> ConnResult<()> {
        fs::create_dir_all(&self.dir).await?;

        let contents = toml::to_string_pretty(settings)
            .map_err(|e| ConnError::ConfigError(format!("serialize settings: {}", e)))?;

        let path = self.path_for(identifier);
        debug!("saving service settings to {}", path.display());
        fs::write(&path, contents).await?;
        Ok(())
    }

    pub async fn remove(&self, identifier: &str) -> ConnResult<()> {
        let path = self.path_for(identifier);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ConnError::Io(e)),
        }
    }

    /// Identifiers with stored settings, for startup provisioning.
    pub async fn list(&self) -> ConnResult<Vec<String>> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(ConnError::Io(e)),
        };

        let mut identifiers = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                warn!("skipping non-UTF8 settings file");
                continue;
            };
            if let Some(ident) = name.strip_suffix(".settings") {
                identifiers.push(ident.to_string());
            }
        }

        identifiers.sort();
        Ok(identifiers)
    }
}

pub fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

pub fn hex_decode(text: &str) -> Option<Vec<u8>> {
    if text.len() % 2 != 0 {
        return None;
    }
    (0..text.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&text[i..i + 2], 16).ok())
        .collect()
}

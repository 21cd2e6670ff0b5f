//! Technology registry
//!
//! Tracks which technology kinds (wifi, ethernet, cellular, ...) the
//! driver layer has made available and which are enabled. The drivers
//! themselves are external collaborators; the registry answers the
//! manager's technology properties and validates enable/disable calls.

use crate::error::{ConnError, ConnResult};
use crate::service::ServiceType;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, Default)]
struct TechState {
    available: bool,
    enabled: bool,
    connected: bool,
}

#[derive(Default)]
pub struct TechnologyRegistry {
    technologies: Mutex<HashMap<ServiceType, TechState>>,
}

impl TechnologyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A driver announced itself for this technology kind.
    pub async fn set_available(&self, technology: ServiceType, available: bool) {
        let mut technologies = self.technologies.lock().await;
        let state = technologies.entry(technology).or_default();
        state.available = available;
        if !available {
            state.enabled = false;
            state.connected = false;
        }
        debug!(
            "technology {} available={}",
            technology.as_str(),
            available
        );
    }

    pub async fn enable(&self, technology: ServiceType) -> ConnResult<()> {
        let mut technologies = self.technologies.lock().await;
        let state = technologies
            .get_mut(&technology)
            .filter(|state| state.available)
            .ok_or_else(|| ConnError::NotFound(format!("technology {}", technology.as_str())))?;

        if state.enabled {
            return Err(ConnError::AlreadyEnabled(technology.as_str().into()));
        }
        state.enabled = true;
        info!("technology {} enabled", technology.as_str());
        Ok(())
    }

    pub async fn disable(&self, technology: ServiceType) -> ConnResult<()> {
        let mut technologies = self.technologies.lock().await;
        let state = technologies
            .get_mut(&technology)
            .ok_or_else(|| ConnError::NotFound(format!("technology {}", technology.as_str())))?;

        if !state.enabled {
            return Err(ConnError::AlreadyDisabled(technology.as_str().into()));
        }
        state.enabled = false;
        info!("technology {} disabled", technology.as_str());
        Ok(())
    }

    pub async fn set_connected(&self, technology: ServiceType, connected: bool) {
        let mut technologies = self.technologies.lock().await;
        if let Some(state) = technologies.get_mut(&technology) {
            state.connected = connected;
        }
    }

    pub async fn available(&self) -> Vec<String> {
        self.collect(|state| state.available).await
    }

    pub async fn enabled(&self) -> Vec<String> {
        self.collect(|state| state.enabled).await
    }

    pub async fn connected(&self) -> Vec<String> {
        self.collect(|state| state.connected).await
    }

    async fn collect(&self, filter: impl Fn(&TechState) -> bool) -> Vec<String> {
        let technologies = self.technologies.lock().await;
        let mut names: Vec<String> = technologies
            .iter()
            .filter(|(_, state)| filter(state))
            .map(|(technology, _)| technology.as_str().to_string())
            .collect();
        names.sort();
        names
    }

    /// Scan requests go to the driver layer; without drivers this is a
    /// validated no-op.
    pub async fn request_scan(&self, technology: Option<ServiceType>) -> ConnResult<()> {
        if let Some(technology) = technology {
            let technologies = self.technologies.lock().await;
            if !technologies
                .get(&technology)
                .map(|state| state.available)
                .unwrap_or(false)
            {
                return Err(ConnError::NotFound(format!(
                    "technology {}",
                    technology.as_str()
                )));
            }
        }
        debug!("scan requested");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_enable_disable_cycle() {
        let registry = TechnologyRegistry::new();
        registry.set_available(ServiceType::Wifi, true).await;

        registry.enable(ServiceType::Wifi).await.unwrap();
        assert!(matches!(
            registry.enable(ServiceType::Wifi).await,
            Err(ConnError::AlreadyEnabled(_))
        ));

        registry.disable(ServiceType::Wifi).await.unwrap();
        assert!(matches!(
            registry.disable(ServiceType::Wifi).await,
            Err(ConnError::AlreadyDisabled(_))
        ));
    }

    #[tokio::test]
    async fn test_unavailable_technology_rejected() {
        let registry = TechnologyRegistry::new();
        assert!(registry.enable(ServiceType::Cellular).await.is_err());
        assert!(registry.request_scan(Some(ServiceType::Wifi)).await.is_err());
        registry.request_scan(None).await.unwrap();
    }

    #[tokio::test]
    async fn test_lists() {
        let registry = TechnologyRegistry::new();
        registry.set_available(ServiceType::Wifi, true).await;
        registry.set_available(ServiceType::Ethernet, true).await;
        registry.enable(ServiceType::Ethernet).await.unwrap();
        registry.set_connected(ServiceType::Ethernet, true).await;

        assert_eq!(registry.available().await, vec!["ethernet", "wifi"]);
        assert_eq!(registry.enabled().await, vec!["ethernet"]);
        assert_eq!(registry.connected().await, vec!["ethernet"]);
    }
}

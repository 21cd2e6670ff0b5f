//! Application sessions
//!
//! A session is a bus peer's handle on the service collection: services it
//! uses are pinned with reference counts so they cannot be released while
//! the session lives. Session mode is a global policy switch that disables
//! auto-connect and direct user connects.

use crate::error::{ConnError, ConnResult};
use crate::service::ServiceManager;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

const SESSION_PATH_PREFIX: &str = "/net/connctl/session/";

struct Session {
    owner: String,
    pinned: Vec<String>,
}

pub struct SessionManager {
    services: ServiceManager,
    sessions: Mutex<HashMap<String, Session>>,
}

impl SessionManager {
    pub fn new(services: ServiceManager) -> Self {
        Self {
            services,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Create a session for the calling peer; returns its object path.
    pub async fn create(&self, owner: &str) -> ConnResult<String> {
        let path = format!("{}{}", SESSION_PATH_PREFIX, Uuid::new_v4().simple());

        let mut sessions = self.sessions.lock().await;
        sessions.insert(
            path.clone(),
            Session {
                owner: owner.to_string(),
                pinned: Vec::new(),
            },
        );

        info!("session {} created for {}", path, owner);
        Ok(path)
    }

    /// Destroy a session; only its creator may do so. All pinned services
    /// are released.
    pub async fn destroy(&self, path: &str, owner: &str) -> ConnResult<()> {
        let session = {
            let mut sessions = self.sessions.lock().await;
            match sessions.get(path) {
                Some(session) if session.owner == owner => sessions.remove(path),
                Some(_) => {
                    return Err(ConnError::PermissionDenied(format!("session {}", path)))
                }
                None => return Err(ConnError::NotFound(format!("session {}", path))),
            }
        };

        if let Some(session) = session {
            for ident in session.pinned {
                let _ = self.services.session_dec(&ident).await;
            }
            info!("session {} destroyed", path);
        }
        Ok(())
    }

    /// Pin a service into a session; the service cannot be released while
    /// pinned.
    pub async fn pin(&self, path: &str, ident: &str) -> ConnResult<()> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions
            .get_mut(path)
            .ok_or_else(|| ConnError::NotFound(format!("session {}", path)))?;

        self.services.session_inc(ident).await?;
        session.pinned.push(ident.to_string());
        debug!("session {} pinned {}", path, ident);
        Ok(())
    }

    pub async fn unpin(&self, path: &str, ident: &str) -> ConnResult<()> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions
            .get_mut(path)
            .ok_or_else(|| ConnError::NotFound(format!("session {}", path)))?;

        let Some(pos) = session.pinned.iter().position(|p| p == ident) else {
            return Err(ConnError::NotFound(format!("pin on {}", ident)));
        };
        session.pinned.remove(pos);
        drop(sessions);

        self.services.session_dec(ident).await?;
        Ok(())
    }

    /// Tear down every session a departed bus peer owned.
    pub async fn owner_disconnected(&self, owner: &str) {
        let paths: Vec<String> = {
            let sessions = self.sessions.lock().await;
            sessions
                .iter()
                .filter(|(_, session)| session.owner == owner)
                .map(|(path, _)| path.clone())
                .collect()
        };

        for path in paths {
            debug!("{} died, destroying session {}", owner, path);
            let _ = self.destroy(&path, owner).await;
        }
    }

    pub async fn count(&self) -> usize {
        self.sessions.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{ServiceDescriptor, ServiceType};
    use crate::storage::ServiceStore;

    async fn setup() -> (SessionManager, ServiceManager, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let services = ServiceManager::new(ServiceStore::new(dir.path()));
        services
            .register(ServiceDescriptor::new(
                "ethernet_ab_cable",
                ServiceType::Ethernet,
            ))
            .await
            .unwrap();
        let sessions = SessionManager::new(services.clone());
        (sessions, services, dir)
    }

    #[tokio::test]
    async fn test_create_destroy() {
        let (sessions, _services, _dir) = setup().await;

        let path = sessions.create(":1.42").await.unwrap();
        assert!(path.starts_with(SESSION_PATH_PREFIX));
        assert_eq!(sessions.count().await, 1);

        sessions.destroy(&path, ":1.42").await.unwrap();
        assert_eq!(sessions.count().await, 0);
    }

    #[tokio::test]
    async fn test_destroy_checks_owner() {
        let (sessions, _services, _dir) = setup().await;
        let path = sessions.create(":1.42").await.unwrap();

        let err = sessions.destroy(&path, ":1.99").await.unwrap_err();
        assert!(matches!(err, ConnError::PermissionDenied(_)));
    }

    #[tokio::test]
    async fn test_pin_blocks_release_until_destroy() {
        let (sessions, services, _dir) = setup().await;
        let path = sessions.create(":1.42").await.unwrap();

        sessions.pin(&path, "ethernet_ab_cable").await.unwrap();
        assert!(services.unregister("ethernet_ab_cable").await.is_err());

        sessions.destroy(&path, ":1.42").await.unwrap();
        services.unregister("ethernet_ab_cable").await.unwrap();
    }

    #[tokio::test]
    async fn test_owner_disconnect_cleans_up() {
        let (sessions, services, _dir) = setup().await;
        let path = sessions.create(":1.42").await.unwrap();
        sessions.pin(&path, "ethernet_ab_cable").await.unwrap();

        sessions.owner_disconnected(":1.42").await;
        assert_eq!(sessions.count().await, 0);
        services.unregister("ethernet_ab_cable").await.unwrap();
    }
}

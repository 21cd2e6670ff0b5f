//! Manager bus object
//!
//! The top-level object on the root path: aggregates services and
//! technologies, owns agent/counter registration, sessions, private
//! networks, and the global OfflineMode/SessionMode switches. Method names
//! and error names are the stable RPC surface; internal error kinds are
//! translated at this boundary.

use super::{install_agent, insert_value, CounterRegistry};
use crate::error::ConnError;
use crate::service::{
    Security, ServiceDescriptor, ServiceManager, ServiceType, SERVICE_PATH_PREFIX,
};
use crate::session::SessionManager;
use crate::storage::hex_encode;
use crate::technology::TechnologyRegistry;
use crate::tether::TetheringManager;
use crate::wispr::WisprManager;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info};
use zbus::message::Header;
use zbus::zvariant::{ObjectPath, OwnedObjectPath, OwnedValue, Value};
use zbus::{interface, Connection};

/// Stable RPC error names.
#[derive(Debug, zbus::DBusError)]
#[zbus(prefix = "net.connctl.Error")]
pub enum BusError {
    #[zbus(error)]
    ZBus(zbus::Error),
    Failed(String),
    InvalidArguments(String),
    InProgress(String),
    NotRegistered(String),
    AlreadyEnabled(String),
    AlreadyDisabled(String),
    NotSupported(String),
    OperationTimeout(String),
    PermissionDenied(String),
    InvalidProperty(String),
    InvalidService(String),
}

impl From<ConnError> for BusError {
    fn from(error: ConnError) -> Self {
        let message = error.to_string();
        match error {
            ConnError::InvalidArgument(_) | ConnError::ParseError(_) => {
                BusError::InvalidArguments(message)
            }
            ConnError::NotFound(_) => BusError::InvalidService(message),
            ConnError::AlreadyEnabled(_) => BusError::AlreadyEnabled(message),
            ConnError::AlreadyDisabled(_) => BusError::AlreadyDisabled(message),
            ConnError::PermissionDenied(_) => BusError::PermissionDenied(message),
            ConnError::NotSupported(_) => BusError::NotSupported(message),
            ConnError::InProgress => BusError::InProgress(message),
            ConnError::Timeout(_) => BusError::OperationTimeout(message),
            ConnError::NotRegistered(_) => BusError::NotRegistered(message),
            ConnError::InvalidState(_) => BusError::InvalidProperty(message),
            _ => BusError::Failed(message),
        }
    }
}

/// The registered agent (unique name, object path). One at a time,
/// process-wide, cleared when its owner leaves the bus.
static AGENT: AsyncMutex<Option<(String, String)>> = AsyncMutex::const_new(None);

pub(crate) async fn agent_owner_disconnected(services: &ServiceManager, owner: &str) {
    let mut agent = AGENT.lock().await;
    if let Some((sender, path)) = agent.as_ref() {
        if sender == owner {
            info!("agent {} at {} vanished", sender, path);
            *agent = None;
            services.clear_agent().await;
        }
    }
}

pub struct ManagerInterface {
    connection: Connection,
    services: ServiceManager,
    sessions: Arc<SessionManager>,
    technologies: Arc<TechnologyRegistry>,
    tethering: Arc<TetheringManager>,
    wispr: Arc<WisprManager>,
    counters: Arc<CounterRegistry>,
    offline_mode: AtomicBool,
}

impl ManagerInterface {
    pub fn new(
        connection: Connection,
        services: ServiceManager,
        sessions: Arc<SessionManager>,
        technologies: Arc<TechnologyRegistry>,
        tethering: Arc<TetheringManager>,
        wispr: Arc<WisprManager>,
        counters: Arc<CounterRegistry>,
    ) -> Self {
        Self {
            connection,
            services,
            sessions,
            technologies,
            tethering,
            wispr,
            counters,
            offline_mode: AtomicBool::new(false),
        }
    }

    async fn global_state(&self) -> &'static str {
        let connected = self
            .services
            .visible_services()
            .await
            .iter()
            .any(|snapshot| snapshot.state.is_connected());
        if connected {
            "online"
        } else {
            "idle"
        }
    }

    async fn is_idle(&self) -> bool {
        !self.services.visible_services().await.iter().any(|s| {
            s.state.is_connected() || s.state.is_connecting()
        })
    }

    fn sender_of(header: &Header<'_>) -> Result<String, BusError> {
        header
            .sender()
            .map(|sender| sender.to_string())
            .ok_or_else(|| BusError::InvalidArguments("anonymous caller".into()))
    }
}

#[interface(name = "net.connctl.Manager")]
impl ManagerInterface {
    async fn get_properties(&self) -> HashMap<String, OwnedValue> {
        let mut dict = HashMap::new();

        let paths: Vec<String> = self
            .services
            .visible_services()
            .await
            .into_iter()
            .map(|snapshot| snapshot.path)
            .collect();
        insert_value(&mut dict, "Services", Value::from(paths));

        insert_value(&mut dict, "State", Value::from(self.global_state().await));
        insert_value(
            &mut dict,
            "OfflineMode",
            Value::from(self.offline_mode.load(Ordering::SeqCst)),
        );
        insert_value(
            &mut dict,
            "SessionMode",
            Value::from(self.services.session_mode()),
        );

        let available = self.technologies.available().await;
        insert_value(&mut dict, "Technologies", Value::from(available.clone()));
        insert_value(&mut dict, "AvailableTechnologies", Value::from(available));
        insert_value(
            &mut dict,
            "EnabledTechnologies",
            Value::from(self.technologies.enabled().await),
        );
        insert_value(
            &mut dict,
            "ConnectedTechnologies",
            Value::from(self.technologies.connected().await),
        );

        let default_technology = match self.services.default_service().await {
            Some(ident) => self
                .services
                .snapshot(&ident)
                .await
                .map(|snapshot| snapshot.service_type.as_str().to_string())
                .unwrap_or_default(),
            None => String::new(),
        };
        insert_value(&mut dict, "DefaultTechnology", Value::from(default_technology));

        insert_value(&mut dict, "AvailableDebugs", Value::from(Vec::<String>::new()));
        insert_value(&mut dict, "EnabledDebugs", Value::from(Vec::<String>::new()));

        dict
    }

    async fn set_property(&self, name: &str, value: Value<'_>) -> Result<(), BusError> {
        match name {
            "OfflineMode" => {
                let enabled = bool::try_from(value)
                    .map_err(|_| BusError::InvalidArguments("OfflineMode wants a bool".into()))?;
                self.offline_mode.store(enabled, Ordering::SeqCst);
                info!("offline mode {}", if enabled { "on" } else { "off" });
                Ok(())
            }
            _ => Err(BusError::InvalidProperty(format!("property {}", name))),
        }
    }

    async fn get_state(&self) -> String {
        self.global_state().await.to_string()
    }

    /// Session mode switch. Enabling while the daemon is not idle defers
    /// the reply until the state observer reports idle.
    async fn set_session_mode(&self, enabled: bool) -> Result<(), BusError> {
        self.services.set_session_mode(enabled);
        info!("session mode {}", if enabled { "on" } else { "off" });

        if !enabled || self.is_idle().await {
            return Ok(());
        }

        let mut events = self.services.subscribe();
        loop {
            if self.is_idle().await {
                return Ok(());
            }
            match events.recv().await {
                Ok(_) => continue,
                Err(_) => return Ok(()),
            }
        }
    }

    async fn get_services(
        &self,
    ) -> Vec<(OwnedObjectPath, HashMap<String, OwnedValue>)> {
        let mut result = Vec::new();
        for snapshot in self.services.visible_services().await {
            let Ok(path) = ObjectPath::try_from(snapshot.path.as_str()) else {
                continue;
            };
            result.push((path.into(), super::service_object::properties(&snapshot)));
        }
        result
    }

    async fn lookup_service(&self, pattern: &str) -> Result<OwnedObjectPath, BusError> {
        let ident = self
            .services
            .lookup(pattern)
            .await
            .ok_or_else(|| BusError::InvalidService(format!("no match for {}", pattern)))?;

        let path = format!("{}{}", SERVICE_PATH_PREFIX, ident);
        ObjectPath::try_from(path)
            .map(Into::into)
            .map_err(|_| BusError::Failed("bad service path".into()))
    }

    /// Locate or create a service from the given settings and start a user
    /// connect; the reply carries the service path once it is ready.
    async fn connect_service(
        &self,
        settings: HashMap<String, OwnedValue>,
    ) -> Result<OwnedObjectPath, BusError> {
        if self.services.session_mode() {
            return Err(BusError::NotSupported("session mode active".into()));
        }

        let get_str = |key: &str| -> Option<String> {
            settings
                .get(key)
                .and_then(|value| String::try_from(value.clone()).ok())
        };

        let service_type = ServiceType::from_str(&get_str("Type").unwrap_or_default());
        let name = get_str("Name");
        let security = Security::from_str(&get_str("Security").unwrap_or_default());

        let existing = match name.as_deref() {
            Some(name) => self.services.lookup(name).await,
            None => None,
        };

        let ident = match existing {
            Some(ident) => ident,
            None => {
                let label = name.clone().unwrap_or_else(|| "hidden".to_string());
                let ident = match service_type {
                    ServiceType::Wifi => format!(
                        "wifi_unknown_{}_managed_{}",
                        hex_encode(label.as_bytes()),
                        security.as_str()
                    ),
                    other => format!("{}_unknown_{}", other.as_str(), hex_encode(label.as_bytes())),
                };

                let mut desc = ServiceDescriptor::new(&ident, service_type);
                desc.security = security;
                desc.name = name.clone();
                desc.hidden = name.is_none();
                desc.network_created = true;
                self.services.register(desc).await.map_err(BusError::from)?;
                ident
            }
        };

        if let Some(passphrase) = get_str("Passphrase") {
            self.services
                .set_passphrase(&ident, Some(passphrase))
                .await
                .map_err(BusError::from)?;
        }

        self.services.connect(&ident).await.map_err(BusError::from)?;

        let path = format!("{}{}", SERVICE_PATH_PREFIX, ident);
        ObjectPath::try_from(path)
            .map(Into::into)
            .map_err(|_| BusError::Failed("bad service path".into()))
    }

    /// VPN connects go through the provider layer; the provider appears as
    /// a vpn-type service.
    async fn connect_provider(
        &self,
        settings: HashMap<String, OwnedValue>,
    ) -> Result<OwnedObjectPath, BusError> {
        if self.services.session_mode() {
            return Err(BusError::NotSupported("session mode active".into()));
        }

        let get_str = |key: &str| -> Option<String> {
            settings
                .get(key)
                .and_then(|value| String::try_from(value.clone()).ok())
        };

        let host = get_str("Host")
            .ok_or_else(|| BusError::InvalidArguments("provider needs a Host".into()))?;
        let domain = get_str("VPN.Domain")
            .or_else(|| get_str("Domain"))
            .unwrap_or_default();

        let ident = format!("vpn_{}_{}", host, domain);
        let mut desc = ServiceDescriptor::new(&ident, ServiceType::Vpn);
        desc.name = get_str("Name");
        self.services.register(desc).await.map_err(BusError::from)?;

        self.services.connect(&ident).await.map_err(BusError::from)?;

        let path = format!("{}{}", SERVICE_PATH_PREFIX, ident);
        ObjectPath::try_from(path)
            .map(Into::into)
            .map_err(|_| BusError::Failed("bad service path".into()))
    }

    async fn register_agent(
        &self,
        #[zbus(header)] header: Header<'_>,
        path: OwnedObjectPath,
    ) -> Result<(), BusError> {
        let sender = Self::sender_of(&header)?;

        let mut agent = AGENT.lock().await;
        if agent.is_some() {
            return Err(BusError::Failed("agent already registered".into()));
        }
        *agent = Some((sender.clone(), path.to_string()));
        drop(agent);

        install_agent(
            &self.services,
            &self.wispr,
            self.connection.clone(),
            &sender,
            path,
        )
        .await;
        info!("agent registered by {}", sender);
        Ok(())
    }

    async fn unregister_agent(
        &self,
        #[zbus(header)] header: Header<'_>,
        path: OwnedObjectPath,
    ) -> Result<(), BusError> {
        let sender = Self::sender_of(&header)?;

        let mut agent = AGENT.lock().await;
        match agent.as_ref() {
            Some((registered_sender, registered_path))
                if *registered_sender == sender && *registered_path == path.to_string() =>
            {
                *agent = None;
                drop(agent);
                self.services.clear_agent().await;
                Ok(())
            }
            _ => Err(BusError::NotRegistered("agent".into())),
        }
    }

    async fn register_counter(
        &self,
        #[zbus(header)] header: Header<'_>,
        path: OwnedObjectPath,
        _accuracy: u32,
        period: u32,
    ) -> Result<(), BusError> {
        let sender = Self::sender_of(&header)?;
        self.counters
            .register(&sender, path.as_str(), period)
            .await
            .map_err(BusError::from)
    }

    async fn unregister_counter(
        &self,
        #[zbus(header)] header: Header<'_>,
        path: OwnedObjectPath,
    ) -> Result<(), BusError> {
        let sender = Self::sender_of(&header)?;
        self.counters
            .unregister(&sender, path.as_str())
            .await
            .map_err(BusError::from)
    }

    async fn create_session(
        &self,
        #[zbus(header)] header: Header<'_>,
    ) -> Result<OwnedObjectPath, BusError> {
        let sender = Self::sender_of(&header)?;
        let path = self.sessions.create(&sender).await.map_err(BusError::from)?;
        ObjectPath::try_from(path)
            .map(Into::into)
            .map_err(|_| BusError::Failed("bad session path".into()))
    }

    async fn destroy_session(
        &self,
        #[zbus(header)] header: Header<'_>,
        path: OwnedObjectPath,
    ) -> Result<(), BusError> {
        let sender = Self::sender_of(&header)?;
        self.sessions
            .destroy(path.as_str(), &sender)
            .await
            .map_err(BusError::from)
    }

    /// Hand out a TUN-backed private network; the fd in the reply belongs
    /// to the caller.
    async fn request_private_network(
        &self,
        #[zbus(header)] header: Header<'_>,
    ) -> Result<(OwnedObjectPath, HashMap<String, OwnedValue>, zbus::zvariant::OwnedFd), BusError>
    {
        let sender = Self::sender_of(&header)?;
        let grant = self
            .tethering
            .private_network_request(&sender)
            .await
            .map_err(BusError::from)?;

        let mut dict = HashMap::new();
        insert_value(&mut dict, "ServerIPv4", Value::from(grant.server_ip));
        insert_value(&mut dict, "PeerIPv4", Value::from(grant.peer_ip));
        insert_value(&mut dict, "PrimaryDNS", Value::from(grant.primary_dns));
        insert_value(&mut dict, "SecondaryDNS", Value::from(grant.secondary_dns));

        let path = ObjectPath::try_from(grant.path)
            .map_err(|_| BusError::Failed("bad network path".into()))?;

        Ok((path.into(), dict, grant.fd.into()))
    }

    async fn release_private_network(&self, path: OwnedObjectPath) -> Result<(), BusError> {
        self.tethering
            .private_network_release(path.as_str())
            .await
            .map_err(BusError::from)
    }

    async fn request_scan(&self, technology: &str) -> Result<(), BusError> {
        let kind = if technology.is_empty() {
            None
        } else {
            Some(ServiceType::from_str(technology))
        };
        self.technologies
            .request_scan(kind)
            .await
            .map_err(BusError::from)
    }

    async fn enable_technology(&self, technology: &str) -> Result<(), BusError> {
        debug!("enable technology {}", technology);
        self.technologies
            .enable(ServiceType::from_str(technology))
            .await
            .map_err(BusError::from)
    }

    async fn disable_technology(&self, technology: &str) -> Result<(), BusError> {
        debug!("disable technology {}", technology);
        self.technologies
            .disable(ServiceType::from_str(technology))
            .await
            .map_err(BusError::from)
    }
}

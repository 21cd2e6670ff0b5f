//! Service model: the ranked collection of candidate networks
//!
//! Each reachable network is one Service with per-family IP configuration
//! states combined into the visible service state. The manager owns the
//! sorted collection plus an identifier index, drives the connect state
//! machine with its 120-second deadline, runs the auto-connect policy over
//! the ranking, and persists user-visible settings on every edit. State
//! transitions fan out as broadcast events consumed by the route/resolver
//! integrator, the captive-portal engine and the bus layer.

pub mod ordering;
pub mod stats;
pub mod types;

pub use stats::{CounterSnapshot, CounterTable, ServiceStats, StatsData};
pub use types::{
    combine_state, ProxyMethod, Security, ServiceError, ServiceState, ServiceType,
};

use crate::error::{ConnError, ConnResult};
use crate::ipconfig::{
    Ipconfig, IpconfigAddress, IpconfigEvent, IpconfigNotify, IpconfigSettings, IpconfigType,
};
use crate::storage::{hex_decode, hex_encode, ServiceStore};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

pub type ServiceId = String;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(120);

/// Path prefix for service bus objects.
pub const SERVICE_PATH_PREFIX: &str = "/net/connctl/service/";

/// Notifications fanned out on every observable mutation, in mutation
/// order.
#[derive(Debug, Clone)]
pub enum ServiceEvent {
    /// Collection membership or ordering changed.
    ServicesChanged,
    /// The combined state of a service moved.
    StateChanged {
        ident: ServiceId,
        state: ServiceState,
    },
    /// A single bus-visible property changed.
    PropertyChanged { ident: ServiceId, name: String },
    /// The top connected service changed.
    DefaultChanged { ident: Option<ServiceId> },
    /// One IPv4 service entered or left the connected set (drives the
    /// rp_filter policy).
    Ipv4Connected { ident: ServiceId, connected: bool },
    /// A family reached READY; run the captive-portal probe.
    OnlineCheck {
        ident: ServiceId,
        family: IpconfigType,
    },
    /// The service left the connected set; cancel its probes.
    OnlineCheckStop { ident: ServiceId },
    /// Nameserver or domain data for a connected service changed.
    NameserversChanged { ident: ServiceId },
    /// The portal engine flagged a login requirement.
    LoginRequired { ident: ServiceId },
}

/// Driver-side connect/disconnect operations for the network (or VPN
/// provider) behind a service. Implementations complete asynchronously and
/// report progress through the manager's indication entry points.
#[async_trait]
pub trait NetworkBackend: Send + Sync {
    async fn connect(&self, ident: &str) -> ConnResult<()>;
    async fn disconnect(&self, ident: &str) -> ConnResult<()>;
}

/// Backend used when no driver layer is wired up.
pub struct NullBackend;

#[async_trait]
impl NetworkBackend for NullBackend {
    async fn connect(&self, _ident: &str) -> ConnResult<()> {
        Ok(())
    }

    async fn disconnect(&self, _ident: &str) -> ConnResult<()> {
        Ok(())
    }
}

/// Reply from a credential prompt.
#[derive(Debug, Clone, Default)]
pub struct AgentReply {
    pub identity: Option<String>,
    pub passphrase: Option<String>,
}

/// 802.1x provisioning strings for enterprise networks.
#[derive(Debug, Clone, Default)]
pub struct EapSettings {
    pub eap: Option<String>,
    pub identity: Option<String>,
    pub ca_cert_file: Option<String>,
    pub client_cert_file: Option<String>,
    pub private_key_file: Option<String>,
    pub private_key_passphrase: Option<String>,
    pub phase2: Option<String>,
}

/// The agent peer the core asks for user input.
#[async_trait]
pub trait CredentialAgent: Send + Sync {
    /// Prompt for a passphrase (and identity for EAP networks). An empty
    /// reply means the user declined.
    async fn request_passphrase(&self, ident: &str, name: Option<&str>) -> ConnResult<AgentReply>;
    /// Prompt for captive-portal login credentials.
    async fn request_login(&self, ident: &str) -> ConnResult<(String, String)>;
    /// Report a connect failure; `true` asks for a retry.
    async fn report_error(&self, ident: &str, error: &str) -> ConnResult<bool>;
}

/// Agent used until a real one registers.
pub struct NullAgent;

#[async_trait]
impl CredentialAgent for NullAgent {
    async fn request_passphrase(&self, _ident: &str, _name: Option<&str>) -> ConnResult<AgentReply> {
        Err(ConnError::NotRegistered("agent".into()))
    }

    async fn request_login(&self, _ident: &str) -> ConnResult<(String, String)> {
        Err(ConnError::NotRegistered("agent".into()))
    }

    async fn report_error(&self, _ident: &str, _error: &str) -> ConnResult<bool> {
        Ok(false)
    }
}

/// Creation-time description of a service, provided by the technology
/// drivers (or tests).
#[derive(Debug, Clone)]
pub struct ServiceDescriptor {
    pub identifier: String,
    pub service_type: ServiceType,
    pub security: Security,
    pub name: Option<String>,
    pub ssid: Option<Vec<u8>>,
    pub frequency: u32,
    pub index: i32,
    pub strength: u8,
    pub roaming: bool,
    pub hidden: bool,
    pub immutable: bool,
    pub wps: bool,
    /// The network was fabricated on behalf of a client request (hidden
    /// wifi); forget its settings when it is removed.
    pub network_created: bool,
}

impl ServiceDescriptor {
    pub fn new(identifier: &str, service_type: ServiceType) -> Self {
        Self {
            identifier: identifier.to_string(),
            service_type,
            security: Security::Unknown,
            name: None,
            ssid: None,
            frequency: 0,
            index: -1,
            strength: 0,
            roaming: false,
            hidden: false,
            immutable: false,
            wps: false,
            network_created: false,
        }
    }
}

pub struct Service {
    pub(crate) identifier: String,
    pub(crate) path: String,
    pub(crate) service_type: ServiceType,
    pub(crate) security: Security,
    pub(crate) state: ServiceState,
    pub(crate) state_ipv4: ServiceState,
    pub(crate) state_ipv6: ServiceState,
    pub(crate) error: ServiceError,
    pub(crate) strength: u8,
    pub(crate) favorite: bool,
    pub(crate) immutable: bool,
    pub(crate) hidden: bool,
    pub(crate) ignore: bool,
    pub(crate) autoconnect: bool,
    pub(crate) userconnect: bool,
    pub(crate) roaming: bool,
    pub(crate) login_required: bool,
    pub(crate) wps: bool,
    pub(crate) network_created: bool,
    /// Reconnect on unexpected idle; set when the service reaches ready.
    pub(crate) reconnect: bool,
    pub(crate) modified: DateTime<Utc>,
    pub(crate) order: i32,
    pub(crate) name: Option<String>,
    pub(crate) ssid: Option<Vec<u8>>,
    pub(crate) frequency: u32,
    pub(crate) index: i32,
    pub(crate) passphrase: Option<String>,
    pub(crate) agent_passphrase: Option<String>,
    pub(crate) identity: Option<String>,
    pub(crate) agent_identity: Option<String>,
    pub(crate) eap: Option<String>,
    pub(crate) ca_cert_file: Option<String>,
    pub(crate) client_cert_file: Option<String>,
    pub(crate) private_key_file: Option<String>,
    pub(crate) private_key_passphrase: Option<String>,
    pub(crate) phase2: Option<String>,
    pub(crate) domainname: Option<String>,
    pub(crate) nameservers: Vec<String>,
    pub(crate) nameservers_config: Vec<String>,
    pub(crate) nameservers_auto: Vec<String>,
    pub(crate) domains: Vec<String>,
    pub(crate) timeservers: Vec<String>,
    pub(crate) proxies: Vec<String>,
    pub(crate) excludes: Vec<String>,
    pub(crate) pac: Option<String>,
    pub(crate) proxy: ProxyMethod,
    pub(crate) proxy_config: ProxyMethod,
    pub(crate) ipconfig_ipv4: Ipconfig,
    pub(crate) ipconfig_ipv6: Ipconfig,
    pub(crate) stats: ServiceStats,
    pub(crate) stats_roaming: ServiceStats,
    pub(crate) counter_table: CounterTable,
    pub(crate) session_usage_count: u32,
    pub(crate) pending: Option<oneshot::Sender<ConnResult<()>>>,
    pub(crate) timeout: Option<AbortHandle>,
}

impl Service {
    fn new(desc: &ServiceDescriptor, notify: mpsc::UnboundedSender<IpconfigNotify>) -> Self {
        Self {
            identifier: desc.identifier.clone(),
            path: format!("{}{}", SERVICE_PATH_PREFIX, desc.identifier),
            service_type: desc.service_type,
            security: desc.security,
            state: ServiceState::Unknown,
            state_ipv4: ServiceState::Unknown,
            state_ipv6: ServiceState::Unknown,
            error: ServiceError::Unknown,
            strength: desc.strength,
            favorite: false,
            immutable: desc.immutable,
            hidden: desc.hidden,
            ignore: false,
            autoconnect: false,
            userconnect: false,
            roaming: desc.roaming,
            login_required: false,
            wps: desc.wps,
            network_created: desc.network_created,
            reconnect: false,
            modified: Utc::now(),
            order: 0,
            name: desc.name.clone(),
            ssid: desc.ssid.clone(),
            frequency: desc.frequency,
            index: desc.index,
            passphrase: None,
            agent_passphrase: None,
            identity: None,
            agent_identity: None,
            eap: None,
            ca_cert_file: None,
            client_cert_file: None,
            private_key_file: None,
            private_key_passphrase: None,
            phase2: None,
            domainname: None,
            nameservers: Vec::new(),
            nameservers_config: Vec::new(),
            nameservers_auto: Vec::new(),
            domains: Vec::new(),
            timeservers: Vec::new(),
            proxies: Vec::new(),
            excludes: Vec::new(),
            pac: None,
            proxy: ProxyMethod::Unknown,
            proxy_config: ProxyMethod::Unknown,
            ipconfig_ipv4: Ipconfig::new(desc.index, IpconfigType::Ipv4, &desc.identifier, notify.clone()),
            ipconfig_ipv6: Ipconfig::new(desc.index, IpconfigType::Ipv6, &desc.identifier, notify),
            stats: ServiceStats::default(),
            stats_roaming: ServiceStats::default(),
            counter_table: CounterTable::new(),
            session_usage_count: 0,
            pending: None,
            timeout: None,
        }
    }

    fn is_ignore(&self) -> bool {
        !self.autoconnect || self.roaming || self.ignore || self.state == ServiceState::Failure
    }

    fn ipconfig(&self, family: IpconfigType) -> &Ipconfig {
        match family {
            IpconfigType::Ipv4 => &self.ipconfig_ipv4,
            IpconfigType::Ipv6 => &self.ipconfig_ipv6,
        }
    }

    fn ipconfig_mut(&mut self, family: IpconfigType) -> &mut Ipconfig {
        match family {
            IpconfigType::Ipv4 => &mut self.ipconfig_ipv4,
            IpconfigType::Ipv6 => &mut self.ipconfig_ipv6,
        }
    }

    fn family_state(&self, family: IpconfigType) -> ServiceState {
        match family {
            IpconfigType::Ipv4 => self.state_ipv4,
            IpconfigType::Ipv6 => self.state_ipv6,
        }
    }

    /// Nameservers in effect: user-configured first, then discovered, then
    /// autoconfigured.
    pub(crate) fn effective_nameservers(&self) -> Vec<String> {
        if !self.nameservers_config.is_empty() {
            return self.nameservers_config.clone();
        }
        if !self.nameservers.is_empty() {
            return self.nameservers.clone();
        }
        self.nameservers_auto.clone()
    }

    fn settings(&self) -> crate::storage::ServiceSettings {
        let failed = self.state_ipv4 == ServiceState::Failure
            || self.state_ipv6 == ServiceState::Failure;

        crate::storage::ServiceSettings {
            name: self.name.clone(),
            ssid: self.ssid.as_deref().map(hex_encode),
            frequency: (self.frequency != 0).then_some(self.frequency),
            favorite: self.favorite,
            autoconnect: self.favorite.then_some(self.autoconnect),
            failure: (failed && self.error != ServiceError::Unknown)
                .then(|| self.error.as_str().to_string()),
            modified: Some(self.modified.to_rfc3339_opts(SecondsFormat::Secs, true)),
            passphrase: self.passphrase.clone().filter(|p| !p.is_empty()),
            nameservers: (!self.nameservers_config.is_empty())
                .then(|| self.nameservers_config.clone()),
            domains: (!self.domains.is_empty()).then(|| self.domains.clone()),
            proxy_method: (self.proxy_config != ProxyMethod::Unknown)
                .then(|| self.proxy_config.as_str().to_string()),
            proxy_servers: (!self.proxies.is_empty()).then(|| self.proxies.clone()),
            proxy_excludes: (!self.excludes.is_empty()).then(|| self.excludes.clone()),
            proxy_url: self.pac.clone(),
            ipv4: Some(self.ipconfig_ipv4.settings()),
            ipv6: Some(self.ipconfig_ipv6.settings()),
        }
    }

    fn apply_settings(&mut self, settings: &crate::storage::ServiceSettings) {
        if self.name.is_none() {
            self.name = settings.name.clone();
        }
        if self.ssid.is_none() {
            self.ssid = settings.ssid.as_deref().and_then(hex_decode);
        }
        self.favorite = settings.favorite;
        if let Some(autoconnect) = settings.autoconnect {
            self.autoconnect = autoconnect;
        }
        if let Some(failure) = &settings.failure {
            if !self.favorite {
                self.state_ipv4 = ServiceState::Failure;
                self.state_ipv6 = ServiceState::Failure;
                self.state = ServiceState::Failure;
            }
            self.error = ServiceError::from_str(failure);
        }
        if let Some(modified) = &settings.modified {
            if let Ok(parsed) = DateTime::parse_from_rfc3339(modified) {
                self.modified = parsed.with_timezone(&Utc);
            }
        }
        if let Some(passphrase) = &settings.passphrase {
            self.passphrase = Some(passphrase.clone());
        }
        if let Some(nameservers) = &settings.nameservers {
            self.nameservers_config = nameservers.clone();
        }
        if let Some(domains) = &settings.domains {
            self.domains = domains.clone();
        }
        if let Some(method) = &settings.proxy_method {
            self.proxy_config = ProxyMethod::from_str(method);
        }
        if let Some(servers) = &settings.proxy_servers {
            self.proxies = servers.clone();
        }
        if let Some(excludes) = &settings.proxy_excludes {
            self.excludes = excludes.clone();
        }
        if let Some(url) = &settings.proxy_url {
            self.pac = Some(url.clone());
        }
        if let Some(ipv4) = &settings.ipv4 {
            self.ipconfig_ipv4.apply_settings(ipv4);
        }
        if let Some(ipv6) = &settings.ipv6 {
            self.ipconfig_ipv6.apply_settings(ipv6);
        }
    }

    #[cfg(test)]
    pub(crate) fn for_tests(ident: &str, service_type: ServiceType) -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut desc = ServiceDescriptor::new(ident, service_type);
        desc.index = 1;
        let mut service = Self::new(&desc, tx);
        service.state = ServiceState::Idle;
        service
    }
}

/// Read-only view of a service for the bus layer and integrators.
#[derive(Debug, Clone)]
pub struct ServiceSnapshot {
    pub identifier: String,
    pub path: String,
    pub service_type: ServiceType,
    pub security: Security,
    pub state: ServiceState,
    pub state_ipv4: ServiceState,
    pub state_ipv6: ServiceState,
    pub error: ServiceError,
    pub strength: u8,
    pub favorite: bool,
    pub immutable: bool,
    pub hidden: bool,
    pub autoconnect: bool,
    pub roaming: bool,
    pub login_required: bool,
    pub wps: bool,
    pub name: Option<String>,
    pub index: i32,
    pub passphrase: Option<String>,
    pub nameservers: Vec<String>,
    pub nameservers_config: Vec<String>,
    pub effective_nameservers: Vec<String>,
    pub domains: Vec<String>,
    pub timeservers: Vec<String>,
    pub proxy: ProxyMethod,
    pub proxy_config: ProxyMethod,
    pub proxies: Vec<String>,
    pub excludes: Vec<String>,
    pub pac: Option<String>,
    pub ipv4_method: String,
    pub ipv4_address: Option<std::net::IpAddr>,
    pub ipv4_prefix: u8,
    pub ipv4_gateway: Option<std::net::IpAddr>,
    pub ipv6_method: String,
    pub ipv6_address: Option<std::net::IpAddr>,
    pub ipv6_prefix: u8,
    pub ipv6_gateway: Option<std::net::IpAddr>,
    pub stats: StatsData,
    pub stats_roaming: StatsData,
}

impl ServiceSnapshot {
    fn of(service: &Service) -> Self {
        Self {
            identifier: service.identifier.clone(),
            path: service.path.clone(),
            service_type: service.service_type,
            security: service.security,
            state: service.state,
            state_ipv4: service.state_ipv4,
            state_ipv6: service.state_ipv6,
            error: service.error,
            strength: service.strength,
            favorite: service.favorite,
            immutable: service.immutable,
            hidden: service.hidden,
            autoconnect: service.autoconnect,
            roaming: service.roaming,
            login_required: service.login_required,
            wps: service.wps,
            name: service.name.clone(),
            index: service.index,
            passphrase: service.passphrase.clone(),
            nameservers: service.nameservers.clone(),
            nameservers_config: service.nameservers_config.clone(),
            effective_nameservers: service.effective_nameservers(),
            domains: service.domains.clone(),
            timeservers: service.timeservers.clone(),
            proxy: service.proxy,
            proxy_config: service.proxy_config,
            proxies: service.proxies.clone(),
            excludes: service.excludes.clone(),
            pac: service.pac.clone(),
            ipv4_method: service.ipconfig_ipv4.method().as_str().to_string(),
            ipv4_address: service.ipconfig_ipv4.local(),
            ipv4_prefix: service.ipconfig_ipv4.prefix(),
            ipv4_gateway: service.ipconfig_ipv4.gateway(),
            ipv6_method: service.ipconfig_ipv6.method().as_str().to_string(),
            ipv6_address: service.ipconfig_ipv6.local(),
            ipv6_prefix: service.ipconfig_ipv6.prefix(),
            ipv6_gateway: service.ipconfig_ipv6.gateway(),
            stats: service.stats.snapshot(),
            stats_roaming: service.stats_roaming.snapshot(),
        }
    }
}

struct Registry {
    order: Vec<ServiceId>,
    services: HashMap<ServiceId, Service>,
    default_ident: Option<ServiceId>,
}

impl Registry {
    fn new() -> Self {
        Self {
            order: Vec::new(),
            services: HashMap::new(),
            default_ident: None,
        }
    }

    fn get(&self, ident: &str) -> ConnResult<&Service> {
        self.services
            .get(ident)
            .ok_or_else(|| ConnError::NotFound(format!("service {}", ident)))
    }

    fn get_mut(&mut self, ident: &str) -> ConnResult<&mut Service> {
        self.services
            .get_mut(ident)
            .ok_or_else(|| ConnError::NotFound(format!("service {}", ident)))
    }

    /// Stable re-sort; a service whose ranking key changed lands in its new
    /// position, ties keep their relative order.
    fn sort(&mut self) {
        let services = &self.services;
        self.order
            .sort_by(|a, b| ordering::compare(&services[a], &services[b]));
    }

    fn default_service(&self) -> Option<&ServiceId> {
        self.order
            .iter()
            .find(|ident| self.services[*ident].state.is_connected())
    }
}

enum Effect {
    Emit(ServiceEvent),
    Save(ServiceId),
    /// Drop the stored settings of a fabricated network.
    Forget(ServiceId),
    AutoConnect,
    IndicateState(ServiceId, ServiceState, IpconfigType),
    StartProvision(ServiceId, i32, IpconfigType),
    StopProvision(i32, IpconfigType),
    Disconnect(ServiceId),
    ReportError(ServiceId, ServiceError),
}

struct ManagerInner {
    registry: Mutex<Registry>,
    events: broadcast::Sender<ServiceEvent>,
    store: ServiceStore,
    backend: Box<dyn NetworkBackend>,
    agent: Mutex<Arc<dyn CredentialAgent>>,
    provisioner: Box<dyn crate::ipconfig::AddressProvisioner>,
    ipconfig_tx: mpsc::UnboundedSender<IpconfigNotify>,
    ipconfig_rx: Mutex<Option<mpsc::UnboundedReceiver<IpconfigNotify>>>,
    session_mode: AtomicBool,
    connect_timeout: Duration,
}

#[derive(Clone)]
pub struct ServiceManager {
    inner: Arc<ManagerInner>,
}

impl ServiceManager {
    pub fn new(store: ServiceStore) -> Self {
        Self::with_collaborators(store, Box::new(NullBackend), Box::new(crate::ipconfig::NullProvisioner))
    }

    pub fn with_collaborators(
        store: ServiceStore,
        backend: Box<dyn NetworkBackend>,
        provisioner: Box<dyn crate::ipconfig::AddressProvisioner>,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        let (ipconfig_tx, ipconfig_rx) = mpsc::unbounded_channel();

        Self {
            inner: Arc::new(ManagerInner {
                registry: Mutex::new(Registry::new()),
                events,
                store,
                backend,
                agent: Mutex::new(Arc::new(NullAgent)),
                provisioner,
                ipconfig_tx,
                ipconfig_rx: Mutex::new(Some(ipconfig_rx)),
                session_mode: AtomicBool::new(false),
                connect_timeout: CONNECT_TIMEOUT,
            }),
        }
    }

    #[cfg(test)]
    fn set_connect_timeout(&mut self, timeout: Duration) {
        Arc::get_mut(&mut self.inner)
            .expect("timeout set before sharing")
            .connect_timeout = timeout;
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.inner.events.subscribe()
    }

    pub async fn set_agent(&self, agent: Arc<dyn CredentialAgent>) {
        *self.inner.agent.lock().await = agent;
    }

    pub async fn clear_agent(&self) {
        *self.inner.agent.lock().await = Arc::new(NullAgent);
    }

    pub fn set_session_mode(&self, enabled: bool) {
        self.inner.session_mode.store(enabled, AtomicOrdering::SeqCst);
    }

    pub fn session_mode(&self) -> bool {
        self.inner.session_mode.load(AtomicOrdering::SeqCst)
    }

    /// Pump ipconfig observer events into the state machine.
    pub fn start(&self) {
        let manager = self.clone();
        tokio::spawn(async move {
            let rx = manager.inner.ipconfig_rx.lock().await.take();
            let Some(mut rx) = rx else { return };
            while let Some(notify) = rx.recv().await {
                manager.handle_ipconfig_notify(notify).await;
            }
        });
    }

    fn emit(&self, event: ServiceEvent) {
        let _ = self.inner.events.send(event);
    }

    /// Register (or revive) a service from a technology driver, loading any
    /// stored settings for its identifier.
    pub async fn register(&self, desc: ServiceDescriptor) -> ConnResult<ServiceId> {
        let stored = self.inner.store.load(&desc.identifier).await?;

        let mut registry = self.inner.registry.lock().await;
        if registry.services.contains_key(&desc.identifier) {
            let service = registry.get_mut(&desc.identifier)?;
            service.strength = desc.strength;
            service.index = desc.index;
            service.ipconfig_ipv4.set_index(desc.index);
            service.ipconfig_ipv6.set_index(desc.index);
            registry.sort();
            drop(registry);
            self.emit(ServiceEvent::ServicesChanged);
            return Ok(desc.identifier);
        }

        let mut service = Service::new(&desc, self.inner.ipconfig_tx.clone());
        if let Some(settings) = stored {
            service.apply_settings(&settings);
        }
        if service.state == ServiceState::Unknown {
            service.state = ServiceState::Idle;
            service.state_ipv4 = ServiceState::Idle;
            service.state_ipv6 = ServiceState::Idle;
        }

        info!("service {} registered", service.identifier);
        let ident = service.identifier.clone();
        registry.services.insert(ident.clone(), service);
        registry.order.push(ident.clone());
        registry.sort();
        drop(registry);

        self.emit(ServiceEvent::ServicesChanged);
        Ok(ident)
    }

    /// Drop a service whose network vanished. Pinned services stay until
    /// their sessions release them.
    pub async fn unregister(&self, ident: &str) -> ConnResult<()> {
        let mut registry = self.inner.registry.lock().await;
        let service = registry.get_mut(ident)?;
        if service.session_usage_count > 0 {
            return Err(ConnError::InvalidState(format!(
                "service {} pinned by sessions",
                ident
            )));
        }
        if let Some(pending) = service.pending.take() {
            let _ = pending.send(Err(ConnError::NotFound(format!("service {}", ident))));
        }
        if let Some(timeout) = service.timeout.take() {
            timeout.abort();
        }
        registry.services.remove(ident);
        registry.order.retain(|id| id != ident);
        registry.sort();
        drop(registry);

        self.emit(ServiceEvent::ServicesChanged);
        Ok(())
    }

    pub async fn services(&self) -> Vec<ServiceId> {
        let registry = self.inner.registry.lock().await;
        registry.order.clone()
    }

    /// Enumerable services, in ranking order; hidden ones are suppressed.
    pub async fn visible_services(&self) -> Vec<ServiceSnapshot> {
        let registry = self.inner.registry.lock().await;
        registry
            .order
            .iter()
            .filter(|ident| !registry.services[*ident].hidden)
            .map(|ident| ServiceSnapshot::of(&registry.services[ident]))
            .collect()
    }

    pub async fn snapshot(&self, ident: &str) -> ConnResult<ServiceSnapshot> {
        let registry = self.inner.registry.lock().await;
        Ok(ServiceSnapshot::of(registry.get(ident)?))
    }

    /// Find a service by identifier, name or bus path.
    pub async fn lookup(&self, pattern: &str) -> Option<ServiceId> {
        let registry = self.inner.registry.lock().await;
        registry
            .order
            .iter()
            .find(|ident| {
                let service = &registry.services[*ident];
                service.identifier == pattern
                    || service.path == pattern
                    || service.name.as_deref() == Some(pattern)
            })
            .cloned()
    }

    pub async fn default_service(&self) -> Option<ServiceId> {
        let registry = self.inner.registry.lock().await;
        registry.default_service().cloned()
    }

    /// User-initiated connect. Resolves when the service reaches ready or
    /// the attempt fails; at most one pending request per service, and one
    /// connecting service per technology type.
    pub async fn connect(&self, ident: &str) -> ConnResult<()> {
        if self.session_mode() {
            return Err(ConnError::NotSupported("session mode active".into()));
        }

        let rx = {
            let mut registry = self.inner.registry.lock().await;

            let connecting_same_type = {
                let service = registry.get(ident)?;
                let service_type = service.service_type;
                registry.order.iter().any(|other| {
                    *other != ident
                        && registry.services[other].service_type == service_type
                        && registry.services[other].state.is_connecting()
                })
            };
            if connecting_same_type {
                return Err(ConnError::InProgress);
            }

            let service = registry.get_mut(ident)?;
            if service.pending.is_some() {
                return Err(ConnError::InProgress);
            }

            service.ignore = false;
            service.userconnect = true;
            service.reconnect = false;

            let (tx, rx) = oneshot::channel();
            service.pending = Some(tx);
            rx
        };

        if let Err(e) = self.connect_internal(ident, true).await {
            if !matches!(e, ConnError::InProgress) {
                self.reply_pending(ident, Err(e)).await;
            }
        }

        rx.await
            .unwrap_or_else(|_| Err(ConnError::InvalidState("connect abandoned".into())))
    }

    /// Shared connect machinery for user and auto connects.
    async fn connect_internal(&self, ident: &str, user: bool) -> ConnResult<()> {
        enum Plan {
            NeedKey { wps: bool, name: Option<String> },
            Proceed { effects: Vec<Effect> },
        }

        let plan = {
            let mut registry = self.inner.registry.lock().await;
            let service = registry.get_mut(ident)?;

            if service.state.is_connected() {
                return Err(ConnError::AlreadyExists("already connected".into()));
            }
            if service.state.is_connecting() {
                return Err(ConnError::InProgress);
            }
            if !service.service_type.is_connectable() {
                return Err(ConnError::InvalidArgument(format!(
                    "service type {}",
                    service.service_type.as_str()
                )));
            }

            let missing_key = match service.service_type {
                ServiceType::Wifi => match service.security {
                    Security::Unknown | Security::None => false,
                    Security::Wep | Security::Psk | Security::Wpa | Security::Rsn => {
                        service.passphrase.is_none() && !service.wps
                    }
                    Security::Ieee8021x => {
                        if service.eap.is_none() {
                            return Err(ConnError::InvalidArgument("EAP method not set".into()));
                        }
                        // Fully-provisioned TLS networks never prompt.
                        if service.eap.as_deref() == Some("tls") {
                            false
                        } else {
                            (service.identity.is_none() && service.agent_identity.is_none())
                                || (service.passphrase.is_none()
                                    && service.agent_passphrase.is_none())
                        }
                    }
                },
                _ => false,
            };

            if missing_key {
                Plan::NeedKey {
                    wps: service.wps,
                    name: service.name.clone(),
                }
            } else {
                let mut effects = Vec::new();
                if service.ipconfig_ipv4.enable() {
                    effects.push(Effect::StartProvision(
                        ident.to_string(),
                        service.index,
                        IpconfigType::Ipv4,
                    ));
                }
                if service.ipconfig_ipv6.enable() {
                    effects.push(Effect::StartProvision(
                        ident.to_string(),
                        service.index,
                        IpconfigType::Ipv6,
                    ));
                }
                Plan::Proceed { effects }
            }
        };

        match plan {
            Plan::NeedKey { wps, name } => {
                if !user {
                    self.fail_families(ident, ServiceError::Unknown).await;
                    return Err(ConnError::NoKey);
                }

                let agent = self.inner.agent.lock().await.clone();
                match agent.request_passphrase(ident, name.as_deref()).await {
                    Ok(reply)
                        if reply.passphrase.is_some() || reply.identity.is_some() =>
                    {
                        self.apply_agent_credentials(ident, &reply).await?;
                        let result = Box::pin(self.connect_internal(ident, user)).await;
                        self.clear_agent_credentials(ident).await;
                        result
                    }
                    _ => {
                        // Declined; WPS-capable networks may still connect
                        // out-of-band, everything else fails. The pending
                        // reply carries NoKey, not the later failure code.
                        if !wps {
                            self.reply_pending(ident, Err(ConnError::NoKey)).await;
                            self.fail_families(ident, ServiceError::Unknown).await;
                        }
                        Err(ConnError::NoKey)
                    }
                }
            }
            Plan::Proceed { effects } => {
                self.run_effects(effects).await;

                match self.inner.backend.connect(ident).await {
                    Ok(()) => {
                        self.indicate_family(ident, ServiceState::Association, IpconfigType::Ipv4)
                            .await;
                        self.indicate_family(ident, ServiceState::Association, IpconfigType::Ipv6)
                            .await;
                        self.arm_connect_timeout(ident).await;
                        Ok(())
                    }
                    Err(e) => {
                        let _ = self.inner.backend.disconnect(ident).await;
                        self.fail_families(ident, ServiceError::ConnectFailed).await;
                        Err(e)
                    }
                }
            }
        }
    }

    async fn apply_agent_credentials(&self, ident: &str, reply: &AgentReply) -> ConnResult<()> {
        let mut registry = self.inner.registry.lock().await;
        let service = registry.get_mut(ident)?;

        if let Some(identity) = &reply.identity {
            service.agent_identity = Some(identity.clone());
        }
        if let Some(passphrase) = &reply.passphrase {
            match service.security {
                Security::Wep | Security::Psk | Security::Wpa | Security::Rsn => {
                    service.passphrase = Some(passphrase.clone());
                }
                Security::Ieee8021x => {
                    service.agent_passphrase = Some(passphrase.clone());
                }
                Security::Unknown | Security::None => {
                    debug!(
                        "passphrase for {} security ignored",
                        service.security.as_str()
                    );
                }
            }
        }
        Ok(())
    }

    /// Agent-provided credentials are never cached beyond the attempt.
    async fn clear_agent_credentials(&self, ident: &str) {
        let mut registry = self.inner.registry.lock().await;
        if let Ok(service) = registry.get_mut(ident) {
            service.agent_identity = None;
            service.agent_passphrase = None;
        }
    }

    fn arm_connect_timeout<'a>(
        &'a self,
        ident: &'a str,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            let mut registry = self.inner.registry.lock().await;
            let Ok(service) = registry.get_mut(ident) else {
                return;
            };
            if service.timeout.is_some() {
                return;
            }

            let manager = self.clone();
            let ident = ident.to_string();
            let timeout = self.inner.connect_timeout;
            let handle = tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                manager.connect_timeout_fired(&ident).await;
            });
            service.timeout = Some(handle.abort_handle());
        })
    }

    /// Connect deadline expiry: both families fail, the pending reply gets
    /// a timeout, and auto-connect may look for another candidate.
    async fn connect_timeout_fired(&self, ident: &str) {
        warn!("connect timeout for {}", ident);

        let (stop_provision, retry_auto) = {
            let mut registry = self.inner.registry.lock().await;
            let Ok(service) = registry.get_mut(ident) else {
                return;
            };
            service.timeout = None;

            let mut effects = Vec::new();
            if service.ipconfig_ipv4.is_enabled() {
                effects.push(Effect::StopProvision(service.index, IpconfigType::Ipv4));
            }
            if service.ipconfig_ipv6.is_enabled() {
                effects.push(Effect::StopProvision(service.index, IpconfigType::Ipv6));
            }
            service.ipconfig_ipv4.disable();
            service.ipconfig_ipv6.disable();

            let retry_auto = if let Some(pending) = service.pending.take() {
                let _ = pending.send(Err(ConnError::Timeout("connect".into())));
                false
            } else {
                true
            };

            (effects, retry_auto && !service.userconnect)
        };

        let _ = self.inner.backend.disconnect(ident).await;
        self.run_effects(stop_provision).await;
        self.fail_families(ident, ServiceError::ConnectFailed).await;

        if retry_auto {
            Box::pin(self.auto_connect()).await;
        }
    }

    async fn fail_families(&self, ident: &str, error: ServiceError) {
        {
            let mut registry = self.inner.registry.lock().await;
            if let Ok(service) = registry.get_mut(ident) {
                if error != ServiceError::Unknown {
                    service.error = error;
                }
            }
        }
        self.indicate_family(ident, ServiceState::Failure, IpconfigType::Ipv4)
            .await;
        self.indicate_family(ident, ServiceState::Failure, IpconfigType::Ipv6)
            .await;
    }

    async fn indicate_family(&self, ident: &str, state: ServiceState, family: IpconfigType) {
        if let Err(e) = self.ipconfig_indicate_state(ident, state, family).await {
            debug!("state indication for {} ignored: {}", ident, e);
        }
    }

    /// Per-family state entry point (spec F meets spec G): validates the
    /// transition, runs the family's entry actions, then recombines the
    /// service state.
    pub async fn ipconfig_indicate_state(
        &self,
        ident: &str,
        new_state: ServiceState,
        family: IpconfigType,
    ) -> ConnResult<()> {
        let effects = {
            let mut registry = self.inner.registry.lock().await;
            let service = registry.get_mut(ident)?;

            let old_state = service.family_state(family);
            if old_state == new_state {
                return Ok(());
            }

            let mut effects: Vec<Effect> = Vec::new();

            match new_state {
                ServiceState::Unknown | ServiceState::Idle => {
                    if service.state == ServiceState::Failure {
                        return Err(ConnError::InvalidState("failed service".into()));
                    }
                }
                ServiceState::Association => {}
                ServiceState::Configuration => {
                    if service.ipconfig_mut(family).enable() {
                        effects.push(Effect::StartProvision(
                            ident.to_string(),
                            service.index,
                            family,
                        ));
                    } else if !service.ipconfig(family).method().is_off() {
                        // Static methods bind as soon as they are
                        // configured; the integrator programs the address.
                        effects.push(Effect::IndicateState(
                            ident.to_string(),
                            ServiceState::Ready,
                            family,
                        ));
                    }
                }
                ServiceState::Ready => {
                    effects.push(Effect::Emit(ServiceEvent::NameserversChanged {
                        ident: ident.to_string(),
                    }));
                    effects.push(Effect::Emit(ServiceEvent::OnlineCheck {
                        ident: ident.to_string(),
                        family,
                    }));
                    if family == IpconfigType::Ipv4
                        && !service.ipconfig_ipv4.method().is_off()
                    {
                        effects.push(Effect::Emit(ServiceEvent::Ipv4Connected {
                            ident: ident.to_string(),
                            connected: true,
                        }));
                    }
                }
                ServiceState::Online => {}
                ServiceState::Disconnect => {
                    if service.state == ServiceState::Idle {
                        return Err(ConnError::InvalidState("idle service".into()));
                    }
                    if family == IpconfigType::Ipv4
                        && !service.ipconfig_ipv4.method().is_off()
                    {
                        effects.push(Effect::Emit(ServiceEvent::Ipv4Connected {
                            ident: ident.to_string(),
                            connected: false,
                        }));
                    }
                }
                ServiceState::Failure => {}
            }

            match family {
                IpconfigType::Ipv4 => service.state_ipv4 = new_state,
                IpconfigType::Ipv6 => service.state_ipv6 = new_state,
            }

            effects.extend(Self::recombine_state(&mut registry, ident));

            // An OFF family keeps contributing idle to the combination.
            if let Ok(service) = registry.get_mut(ident) {
                if service.ipconfig(family).method().is_off()
                    && service.family_state(family) != ServiceState::Idle
                {
                    match family {
                        IpconfigType::Ipv4 => service.state_ipv4 = ServiceState::Idle,
                        IpconfigType::Ipv6 => service.state_ipv6 = ServiceState::Idle,
                    }
                    effects.extend(Self::recombine_state(&mut registry, ident));
                }
            }

            effects
        };

        self.run_effects(effects).await;
        Ok(())
    }

    /// Recompute the combined state and derive the transition's side
    /// effects. Runs with the registry locked; effects run after.
    fn recombine_state(registry: &mut Registry, ident: &str) -> Vec<Effect> {
        let mut effects: Vec<Effect> = Vec::new();

        let Ok(service) = registry.get_mut(ident) else {
            return effects;
        };

        let old_state = service.state;
        let new_state = combine_state(service.state_ipv4, service.state_ipv6);
        if old_state == new_state {
            return effects;
        }

        // Only one service may be online as the default at a time.
        if new_state == ServiceState::Online {
            let default_online = registry
                .default_ident
                .as_deref()
                .filter(|default| *default != ident)
                .map(|default| registry.services[default].state == ServiceState::Online)
                .unwrap_or(false);
            if default_online {
                return effects;
            }
        }

        let service = registry.get_mut(ident).expect("checked above");
        service.state = new_state;
        debug!(
            "service {} state {} -> {}",
            ident,
            old_state.as_str(),
            new_state.as_str()
        );
        effects.push(Effect::Emit(ServiceEvent::StateChanged {
            ident: ident.to_string(),
            state: new_state,
        }));

        match new_state {
            ServiceState::Idle => {
                if old_state != ServiceState::Disconnect {
                    Self::reply_pending_locked(
                        service,
                        Err(ConnError::InvalidState("connection aborted".into())),
                    );
                    effects.push(Effect::Disconnect(ident.to_string()));
                }
                if service.reconnect {
                    effects.push(Effect::AutoConnect);
                }
            }
            ServiceState::Association | ServiceState::Configuration => {}
            ServiceState::Ready => {
                service.reconnect = true;
                if !service.favorite {
                    service.favorite = true;
                    if !service.immutable {
                        service.autoconnect = true;
                    }
                    // VPN favorites dominate the explicit order key.
                    if service.service_type == ServiceType::Vpn {
                        service.order = 10;
                    }
                    effects.push(Effect::Emit(ServiceEvent::PropertyChanged {
                        ident: ident.to_string(),
                        name: "Favorite".to_string(),
                    }));
                }
                Self::reply_pending_locked(service, Ok(()));
                service.userconnect = false;
                service.modified = Utc::now();
                if service.login_required {
                    service.login_required = false;
                    effects.push(Effect::Emit(ServiceEvent::PropertyChanged {
                        ident: ident.to_string(),
                        name: "LoginRequired".to_string(),
                    }));
                }
                effects.push(Effect::Save(ident.to_string()));
                effects.push(Effect::Emit(ServiceEvent::NameserversChanged {
                    ident: ident.to_string(),
                }));
            }
            ServiceState::Online => {
                if service.login_required {
                    service.login_required = false;
                    effects.push(Effect::Emit(ServiceEvent::PropertyChanged {
                        ident: ident.to_string(),
                        name: "LoginRequired".to_string(),
                    }));
                }
            }
            ServiceState::Disconnect => {
                effects.push(Effect::Emit(ServiceEvent::OnlineCheckStop {
                    ident: ident.to_string(),
                }));
                effects.push(Effect::Emit(ServiceEvent::NameserversChanged {
                    ident: ident.to_string(),
                }));
                // Connected services ranked below reset from online to
                // ready so the portal check reruns on the new default.
                for other in registry.order.clone() {
                    let other_service = &registry.services[&other];
                    if !other_service.state.is_connected() {
                        continue;
                    }
                    if other_service.state == ServiceState::Online {
                        break;
                    }
                    if other_service.state_ipv4 == ServiceState::Online {
                        effects.push(Effect::IndicateState(
                            other.clone(),
                            ServiceState::Ready,
                            IpconfigType::Ipv4,
                        ));
                    }
                    if other_service.state_ipv6 == ServiceState::Online {
                        effects.push(Effect::IndicateState(
                            other.clone(),
                            ServiceState::Ready,
                            IpconfigType::Ipv6,
                        ));
                    }
                }
            }
            ServiceState::Failure => {
                let error = registry.services[ident].error;
                let service = registry.get_mut(ident).expect("present");
                if service.userconnect {
                    effects.push(Effect::ReportError(ident.to_string(), error));
                } else {
                    Self::reply_pending_locked(
                        service,
                        Err(ConnError::Rejected {
                            op: "connect".to_string(),
                            errno: libc::EIO,
                        }),
                    );
                    effects.push(Effect::AutoConnect);
                }
                service.modified = Utc::now();
                effects.push(Effect::Save(ident.to_string()));
            }
            ServiceState::Unknown => {}
        }

        // Failure is sticky in `error` only while the state shows it.
        if new_state != ServiceState::Failure {
            registry.get_mut(ident).expect("present").error = ServiceError::Unknown;
        }

        registry.sort();
        effects.push(Effect::Emit(ServiceEvent::ServicesChanged));

        let default = registry.default_service().cloned();
        if default != registry.default_ident {
            registry.default_ident = default.clone();
            effects.push(Effect::Emit(ServiceEvent::DefaultChanged { ident: default }));
        }

        effects
    }

    fn reply_pending_locked(service: &mut Service, result: ConnResult<()>) {
        if let Some(timeout) = service.timeout.take() {
            timeout.abort();
        }
        if let Some(pending) = service.pending.take() {
            let _ = pending.send(result);
        }
    }

    async fn reply_pending(&self, ident: &str, result: ConnResult<()>) {
        let mut registry = self.inner.registry.lock().await;
        if let Ok(service) = registry.get_mut(ident) {
            Self::reply_pending_locked(service, result);
        }
    }

    async fn run_effects(&self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Emit(event) => self.emit(event),
                Effect::Save(ident) => {
                    let settings = {
                        let registry = self.inner.registry.lock().await;
                        registry.get(&ident).ok().map(|s| s.settings())
                    };
                    if let Some(settings) = settings {
                        if let Err(e) = self.inner.store.save(&ident, &settings).await {
                            warn!("saving {} failed: {}", ident, e);
                        }
                    }
                }
                Effect::Forget(ident) => {
                    if let Err(e) = self.inner.store.remove(&ident).await {
                        warn!("forgetting {} failed: {}", ident, e);
                    }
                }
                Effect::AutoConnect => Box::pin(self.auto_connect()).await,
                Effect::IndicateState(ident, state, family) => {
                    Box::pin(self.indicate_family(&ident, state, family)).await;
                }
                Effect::StartProvision(ident, index, family) => {
                    if let Err(e) = self.inner.provisioner.start(index, family).await {
                        warn!("address provisioning for {} failed: {}", ident, e);
                        Box::pin(self.fail_families(&ident, ServiceError::DhcpFailed)).await;
                    }
                }
                Effect::StopProvision(index, family) => {
                    self.inner.provisioner.stop(index, family).await;
                }
                Effect::Disconnect(ident) => {
                    if let Err(e) = Box::pin(self.disconnect_internal(&ident)).await {
                        debug!("implicit disconnect of {}: {}", ident, e);
                    }
                }
                Effect::ReportError(ident, error) => {
                    let agent = self.inner.agent.lock().await.clone();
                    let retry = agent
                        .report_error(&ident, error.as_str())
                        .await
                        .unwrap_or(false);
                    if retry {
                        let _ = Box::pin(self.connect_internal(&ident, true)).await;
                    } else {
                        self.reply_pending(
                            &ident,
                            Err(ConnError::Rejected {
                                op: "connect".to_string(),
                                errno: libc::EIO,
                            }),
                        )
                        .await;
                        let auto = {
                            let registry = self.inner.registry.lock().await;
                            registry
                                .get(&ident)
                                .map(|s| !s.userconnect)
                                .unwrap_or(false)
                        };
                        if auto {
                            Box::pin(self.auto_connect()).await;
                        }
                    }
                }
            }
        }
    }

    /// Walk the ranking for the best idle favorite and connect it. Stops
    /// at the first pending, connecting, connected or non-favorite entry.
    pub async fn auto_connect(&self) {
        if self.session_mode() {
            debug!("session mode enabled: auto connect disabled");
            return;
        }

        let candidate = {
            let registry = self.inner.registry.lock().await;
            let mut candidate = None;

            for ident in &registry.order {
                let service = &registry.services[ident];

                if service.pending.is_some() {
                    return;
                }
                if service.state.is_connecting() {
                    return;
                }
                if !service.favorite {
                    return;
                }
                if service.state.is_connected() {
                    return;
                }
                if !service.is_ignore() && service.state == ServiceState::Idle {
                    candidate = Some(ident.clone());
                    break;
                }
            }

            candidate
        };

        if let Some(ident) = candidate {
            info!("auto-connecting {}", ident);
            {
                let mut registry = self.inner.registry.lock().await;
                if let Ok(service) = registry.get_mut(&ident) {
                    service.userconnect = false;
                }
            }
            if let Err(e) = self.connect_internal(&ident, false).await {
                debug!("auto-connect of {} failed: {}", ident, e);
            }
        }
    }

    /// User-initiated disconnect.
    pub async fn disconnect(&self, ident: &str) -> ConnResult<()> {
        {
            let mut registry = self.inner.registry.lock().await;
            let service = registry.get_mut(ident)?;
            Self::reply_pending_locked(
                service,
                Err(ConnError::InvalidState("connection aborted".into())),
            );
            service.ignore = true;
            service.reconnect = false;
        }

        self.disconnect_internal(ident).await
    }

    async fn disconnect_internal(&self, ident: &str) -> ConnResult<()> {
        let was_active = {
            let registry = self.inner.registry.lock().await;
            let service = registry.get(ident)?;
            service.state.is_connected() || service.state.is_connecting()
        };

        self.inner.backend.disconnect(ident).await?;

        let effects = {
            let mut registry = self.inner.registry.lock().await;
            let service = registry.get_mut(ident)?;
            let mut effects = Vec::new();

            if service.ipconfig_ipv4.is_enabled() {
                effects.push(Effect::StopProvision(service.index, IpconfigType::Ipv4));
            }
            if service.ipconfig_ipv6.is_enabled() {
                effects.push(Effect::StopProvision(service.index, IpconfigType::Ipv6));
            }
            service.pac = None;
            service.ipconfig_ipv4.disable();
            service.ipconfig_ipv6.disable();
            effects
        };
        self.run_effects(effects).await;

        if was_active {
            self.indicate_family(ident, ServiceState::Disconnect, IpconfigType::Ipv4)
                .await;
            self.indicate_family(ident, ServiceState::Disconnect, IpconfigType::Ipv6)
                .await;
            self.indicate_family(ident, ServiceState::Idle, IpconfigType::Ipv4)
                .await;
            self.indicate_family(ident, ServiceState::Idle, IpconfigType::Ipv6)
                .await;
        }

        Ok(())
    }

    /// Remove a service: disconnect, forget credentials and favorite
    /// status. Ethernet and immutable services cannot be removed.
    pub async fn remove(&self, ident: &str) -> ConnResult<()> {
        {
            let registry = self.inner.registry.lock().await;
            let service = registry.get(ident)?;
            if service.service_type == ServiceType::Ethernet {
                return Err(ConnError::NotSupported("ethernet service".into()));
            }
            if service.immutable {
                return Err(ConnError::NotSupported("immutable service".into()));
            }
            if !service.favorite && service.state != ServiceState::Failure {
                return Err(ConnError::NotSupported("service not saved".into()));
            }
        }

        let _ = self.disconnect_internal(ident).await;

        let effects = {
            let mut registry = self.inner.registry.lock().await;
            let service = registry.get_mut(ident)?;
            service.passphrase = None;
            service.reconnect = false;
            service.state_ipv4 = ServiceState::Idle;
            service.state_ipv6 = ServiceState::Idle;
            service.state = ServiceState::Idle;
            service.favorite = false;
            service.autoconnect = false;
            service.modified = Utc::now();
            let network_created = service.network_created;
            registry.sort();

            let mut effects = vec![
                Effect::Emit(ServiceEvent::PropertyChanged {
                    ident: ident.to_string(),
                    name: "Favorite".to_string(),
                }),
                Effect::Save(ident.to_string()),
                Effect::Emit(ServiceEvent::ServicesChanged),
            ];
            // Fabricated networks leave nothing behind.
            if network_created {
                effects.push(Effect::Forget(ident.to_string()));
            }
            effects
        };
        self.run_effects(effects).await;
        Ok(())
    }

    /// Reorder one favorite around another; per-family states must be
    /// compatible (ready may move above online). The displaced online
    /// default drops to ready so the portal probe reruns.
    pub async fn move_service(&self, ident: &str, target: &str, before: bool) -> ConnResult<()> {
        let effects = {
            let mut registry = self.inner.registry.lock().await;

            {
                let service = registry.get(ident)?;
                if !service.favorite {
                    return Err(ConnError::NotSupported("service not favorite".into()));
                }
                let target_service = registry.get(target)?;
                if !target_service.favorite
                    || target == ident
                    || target_service.service_type == ServiceType::Vpn
                {
                    return Err(ConnError::InvalidArgument("invalid move target".into()));
                }

                let compatible = |a: ServiceState, b: ServiceState| {
                    a == b
                        || (a == ServiceState::Online && b == ServiceState::Ready)
                        || (b == ServiceState::Online && a == ServiceState::Ready)
                };

                let s4_off = service.ipconfig_ipv4.method().is_off();
                let s6_off = service.ipconfig_ipv6.method().is_off();
                let t4_off = target_service.ipconfig_ipv4.method().is_off();
                let t6_off = target_service.ipconfig_ipv6.method().is_off();

                // A family switched off on either side drops out of the
                // comparison; the remaining family must line up.
                if (t4_off || s4_off) && !(s6_off || t6_off) {
                    if !compatible(target_service.state_ipv6, service.state_ipv6) {
                        return Err(ConnError::InvalidArgument("states not compatible".into()));
                    }
                } else if (t6_off || s6_off) && !(s4_off || t4_off) {
                    if !compatible(target_service.state_ipv4, service.state_ipv4) {
                        return Err(ConnError::InvalidArgument("states not compatible".into()));
                    }
                } else if !compatible(target_service.state_ipv4, service.state_ipv4)
                    || !compatible(target_service.state_ipv6, service.state_ipv6)
                {
                    return Err(ConnError::InvalidArgument("states not compatible".into()));
                }
            }

            let mut effects: Vec<Effect> = Vec::new();

            // Whoever ends up below loses online status so the winner
            // re-derives its state from a fresh portal pass.
            let demoted = if before { target } else { ident };
            if let Some(default) = registry.default_service().cloned() {
                let default_service = registry.get_mut(&default)?;
                if default == demoted && default_service.state == ServiceState::Online {
                    default_service.state = ServiceState::Ready;
                }
            }
            let demoted_service = registry.get(demoted)?;
            if demoted_service.state_ipv4 == ServiceState::Online {
                effects.push(Effect::IndicateState(
                    demoted.to_string(),
                    ServiceState::Ready,
                    IpconfigType::Ipv4,
                ));
            }
            if demoted_service.state_ipv6 == ServiceState::Online {
                effects.push(Effect::IndicateState(
                    demoted.to_string(),
                    ServiceState::Ready,
                    IpconfigType::Ipv6,
                ));
            }

            registry.order.retain(|id| id != ident);
            let target_pos = registry
                .order
                .iter()
                .position(|id| id == target)
                .ok_or_else(|| ConnError::NotFound(format!("service {}", target)))?;
            let insert_at = if before { target_pos } else { target_pos + 1 };
            registry.order.insert(insert_at, ident.to_string());

            let service = registry.get_mut(ident)?;
            service.modified = Utc::now();
            effects.push(Effect::Save(ident.to_string()));
            effects.push(Effect::Emit(ServiceEvent::ServicesChanged));

            let default = registry.default_service().cloned();
            if default != registry.default_ident {
                registry.default_ident = default.clone();
                effects.push(Effect::Emit(ServiceEvent::DefaultChanged { ident: default }));
            }

            effects
        };

        self.run_effects(effects).await;
        Ok(())
    }

    // ---- driver-side indications -------------------------------------

    /// The link layer finished associating; both families move to
    /// configuration.
    pub async fn network_connected(&self, ident: &str) {
        self.indicate_family(ident, ServiceState::Configuration, IpconfigType::Ipv4)
            .await;
        self.indicate_family(ident, ServiceState::Configuration, IpconfigType::Ipv6)
            .await;
    }

    /// The link dropped underneath a connected service.
    pub async fn network_disconnected(&self, ident: &str) {
        self.indicate_family(ident, ServiceState::Disconnect, IpconfigType::Ipv4)
            .await;
        self.indicate_family(ident, ServiceState::Disconnect, IpconfigType::Ipv6)
            .await;
        self.indicate_family(ident, ServiceState::Idle, IpconfigType::Ipv4)
            .await;
        self.indicate_family(ident, ServiceState::Idle, IpconfigType::Ipv6)
            .await;
    }

    /// Driver-reported failure.
    pub async fn indicate_error(&self, ident: &str, error: ServiceError) -> ConnResult<()> {
        {
            let mut registry = self.inner.registry.lock().await;
            let service = registry.get_mut(ident)?;
            service.error = error;
            if error == ServiceError::InvalidKey {
                service.passphrase = None;
            }
        }
        self.indicate_family(ident, ServiceState::Failure, IpconfigType::Ipv4)
            .await;
        self.indicate_family(ident, ServiceState::Failure, IpconfigType::Ipv6)
            .await;
        Ok(())
    }

    /// Clear a recorded failure; the service returns to idle and becomes a
    /// candidate again.
    pub async fn clear_error(&self, ident: &str) -> ConnResult<()> {
        {
            let mut registry = self.inner.registry.lock().await;
            let service = registry.get_mut(ident)?;
            if service.state != ServiceState::Failure {
                return Err(ConnError::InvalidState("service not failed".into()));
            }
            service.state_ipv4 = ServiceState::Unknown;
            service.state_ipv6 = ServiceState::Unknown;
            service.state = ServiceState::Unknown;
            service.error = ServiceError::Unknown;
            if service.favorite {
                service.reconnect = true;
            }
        }
        self.indicate_family(ident, ServiceState::Idle, IpconfigType::Ipv6)
            .await;
        self.indicate_family(ident, ServiceState::Idle, IpconfigType::Ipv4)
            .await;
        Ok(())
    }

    async fn handle_ipconfig_notify(&self, notify: IpconfigNotify) {
        match notify.event {
            IpconfigEvent::Bound => {
                self.indicate_family(&notify.ident, ServiceState::Ready, notify.config_type)
                    .await;
            }
            IpconfigEvent::Released => {
                let method_off = {
                    let registry = self.inner.registry.lock().await;
                    registry
                        .get(&notify.ident)
                        .map(|s| s.ipconfig(notify.config_type).method().is_off())
                        .unwrap_or(false)
                };
                if method_off {
                    self.indicate_family(
                        &notify.ident,
                        ServiceState::Disconnect,
                        notify.config_type,
                    )
                    .await;
                }
                self.emit(ServiceEvent::NameserversChanged {
                    ident: notify.ident,
                });
            }
            IpconfigEvent::Up | IpconfigEvent::Down => {
                self.emit(ServiceEvent::PropertyChanged {
                    ident: notify.ident,
                    name: "Ethernet".to_string(),
                });
            }
            IpconfigEvent::LowerUp => {
                let mut registry = self.inner.registry.lock().await;
                if let Ok(service) = registry.get_mut(&notify.ident) {
                    if service.roaming {
                        service.stats_roaming.start();
                    } else {
                        service.stats.start();
                    }
                }
            }
            IpconfigEvent::LowerDown => {
                let effects = {
                    let mut registry = self.inner.registry.lock().await;
                    match registry.get_mut(&notify.ident) {
                        Ok(service) => {
                            if service.roaming {
                                service.stats_roaming.stop();
                            } else {
                                service.stats.stop();
                            }
                            vec![Effect::Save(notify.ident.clone())]
                        }
                        Err(_) => Vec::new(),
                    }
                };
                self.run_effects(effects).await;
            }
        }
    }

    /// Feed an acquired address into a family (DHCP client, autoconf or
    /// static configuration completion).
    pub async fn address_bound(
        &self,
        ident: &str,
        family: IpconfigType,
        address: IpconfigAddress,
    ) -> ConnResult<()> {
        let mut registry = self.inner.registry.lock().await;
        let service = registry.get_mut(ident)?;
        service.ipconfig_mut(family).address_bound(address);
        Ok(())
    }

    // ---- captive portal hooks ----------------------------------------

    /// Portal probe verdict for one family.
    pub async fn online_check_result(&self, ident: &str, family: IpconfigType, online: bool) {
        if online {
            self.indicate_family(ident, ServiceState::Online, family).await;
        }
    }

    /// The portal requires a login before traffic passes.
    pub async fn request_login(&self, ident: &str) -> ConnResult<()> {
        {
            let mut registry = self.inner.registry.lock().await;
            let service = registry.get_mut(ident)?;
            service.login_required = true;
        }
        self.emit(ServiceEvent::PropertyChanged {
            ident: ident.to_string(),
            name: "LoginRequired".to_string(),
        });
        self.emit(ServiceEvent::LoginRequired {
            ident: ident.to_string(),
        });
        Ok(())
    }

    // ---- property edits ----------------------------------------------

    /// 802.1x provisioning for enterprise wifi; the driver layer reads it
    /// back when preparing the supplicant network block.
    pub async fn set_eap_settings(&self, ident: &str, settings: EapSettings) -> ConnResult<()> {
        let mut registry = self.inner.registry.lock().await;
        let service = registry.get_mut(ident)?;
        service.eap = settings.eap;
        service.identity = settings.identity;
        service.ca_cert_file = settings.ca_cert_file;
        service.client_cert_file = settings.client_cert_file;
        service.private_key_file = settings.private_key_file;
        service.private_key_passphrase = settings.private_key_passphrase;
        service.phase2 = settings.phase2;
        Ok(())
    }

    pub async fn eap_settings(&self, ident: &str) -> ConnResult<EapSettings> {
        let registry = self.inner.registry.lock().await;
        let service = registry.get(ident)?;
        Ok(EapSettings {
            eap: service.eap.clone(),
            identity: service.identity.clone().or(service.agent_identity.clone()),
            ca_cert_file: service.ca_cert_file.clone(),
            client_cert_file: service.client_cert_file.clone(),
            private_key_file: service.private_key_file.clone(),
            private_key_passphrase: service.private_key_passphrase.clone(),
            phase2: service.phase2.clone(),
        })
    }

    pub async fn set_strength(&self, ident: &str, strength: u8) -> ConnResult<()> {
        let mut registry = self.inner.registry.lock().await;
        let service = registry.get_mut(ident)?;
        if service.strength == strength {
            return Ok(());
        }
        service.strength = strength;
        registry.sort();
        drop(registry);

        self.emit(ServiceEvent::PropertyChanged {
            ident: ident.to_string(),
            name: "Strength".to_string(),
        });
        self.emit(ServiceEvent::ServicesChanged);
        Ok(())
    }

    pub async fn set_autoconnect(&self, ident: &str, autoconnect: bool) -> ConnResult<()> {
        let effects = {
            let mut registry = self.inner.registry.lock().await;
            let service = registry.get_mut(ident)?;
            if !service.favorite {
                return Err(ConnError::InvalidState("service not favorite".into()));
            }
            service.autoconnect = autoconnect;
            service.modified = Utc::now();
            vec![
                Effect::Emit(ServiceEvent::PropertyChanged {
                    ident: ident.to_string(),
                    name: "AutoConnect".to_string(),
                }),
                Effect::Save(ident.to_string()),
            ]
        };
        self.run_effects(effects).await;
        Ok(())
    }

    pub async fn set_passphrase(&self, ident: &str, passphrase: Option<String>) -> ConnResult<()> {
        let effects = {
            let mut registry = self.inner.registry.lock().await;
            let service = registry.get_mut(ident)?;
            if service.immutable {
                return Err(ConnError::NotSupported("immutable service".into()));
            }
            validate_passphrase(service.security, passphrase.as_deref())?;
            service.passphrase = passphrase;
            service.modified = Utc::now();
            vec![
                Effect::Emit(ServiceEvent::PropertyChanged {
                    ident: ident.to_string(),
                    name: "Passphrase".to_string(),
                }),
                Effect::Save(ident.to_string()),
            ]
        };
        self.run_effects(effects).await;
        Ok(())
    }

    pub async fn set_nameservers_config(
        &self,
        ident: &str,
        nameservers: Vec<String>,
    ) -> ConnResult<()> {
        let effects = {
            let mut registry = self.inner.registry.lock().await;
            let service = registry.get_mut(ident)?;
            service.nameservers_config = nameservers;
            service.modified = Utc::now();
            vec![
                Effect::Emit(ServiceEvent::PropertyChanged {
                    ident: ident.to_string(),
                    name: "Nameservers.Configuration".to_string(),
                }),
                Effect::Emit(ServiceEvent::NameserversChanged {
                    ident: ident.to_string(),
                }),
                Effect::Save(ident.to_string()),
            ]
        };
        self.run_effects(effects).await;
        Ok(())
    }

    /// Nameservers discovered by the link layer (DHCP, RA).
    pub async fn set_nameservers_auto(
        &self,
        ident: &str,
        nameservers: Vec<String>,
    ) -> ConnResult<()> {
        {
            let mut registry = self.inner.registry.lock().await;
            let service = registry.get_mut(ident)?;
            service.nameservers_auto = nameservers;
        }
        self.emit(ServiceEvent::NameserversChanged {
            ident: ident.to_string(),
        });
        Ok(())
    }

    pub async fn set_domains_config(&self, ident: &str, domains: Vec<String>) -> ConnResult<()> {
        let effects = {
            let mut registry = self.inner.registry.lock().await;
            let service = registry.get_mut(ident)?;
            service.domains = domains;
            service.modified = Utc::now();
            vec![
                Effect::Emit(ServiceEvent::PropertyChanged {
                    ident: ident.to_string(),
                    name: "Domains.Configuration".to_string(),
                }),
                Effect::Emit(ServiceEvent::NameserversChanged {
                    ident: ident.to_string(),
                }),
                Effect::Save(ident.to_string()),
            ]
        };
        self.run_effects(effects).await;
        Ok(())
    }

    pub async fn set_proxy_config(
        &self,
        ident: &str,
        method: ProxyMethod,
        servers: Vec<String>,
        excludes: Vec<String>,
        url: Option<String>,
    ) -> ConnResult<()> {
        let effects = {
            let mut registry = self.inner.registry.lock().await;
            let service = registry.get_mut(ident)?;
            service.proxy_config = method;
            service.proxies = servers;
            service.excludes = excludes;
            service.pac = url;
            service.modified = Utc::now();
            vec![
                Effect::Emit(ServiceEvent::PropertyChanged {
                    ident: ident.to_string(),
                    name: "Proxy.Configuration".to_string(),
                }),
                Effect::Save(ident.to_string()),
            ]
        };
        self.run_effects(effects).await;
        Ok(())
    }

    pub async fn set_ipconfig(
        &self,
        ident: &str,
        family: IpconfigType,
        settings: IpconfigSettings,
    ) -> ConnResult<()> {
        let effects = {
            let mut registry = self.inner.registry.lock().await;
            let service = registry.get_mut(ident)?;
            service.ipconfig_mut(family).apply_settings(&settings);
            service.modified = Utc::now();
            vec![
                Effect::Emit(ServiceEvent::PropertyChanged {
                    ident: ident.to_string(),
                    name: format!("{}.Configuration", family.as_str()),
                }),
                Effect::Save(ident.to_string()),
            ]
        };
        self.run_effects(effects).await;
        Ok(())
    }

    pub async fn reset_counters(&self, ident: &str) -> ConnResult<()> {
        let mut registry = self.inner.registry.lock().await;
        let service = registry.get_mut(ident)?;
        service.stats.reset();
        service.stats_roaming.reset();
        // Counter peers see the zeroed history on their next push.
        for snapshot in service.counter_table.values_mut() {
            *snapshot = CounterSnapshot::default();
        }
        Ok(())
    }

    pub async fn update_stats(&self, ident: &str, data: &StatsData) -> ConnResult<()> {
        let mut registry = self.inner.registry.lock().await;
        let service = registry.get_mut(ident)?;
        if service.roaming {
            service.stats_roaming.update(data);
        } else {
            service.stats.update(data);
        }
        Ok(())
    }

    // ---- sessions ----------------------------------------------------

    pub async fn session_inc(&self, ident: &str) -> ConnResult<()> {
        let mut registry = self.inner.registry.lock().await;
        let service = registry.get_mut(ident)?;
        service.session_usage_count += 1;
        Ok(())
    }

    /// Returns `true` while other sessions still pin the service.
    pub async fn session_dec(&self, ident: &str) -> ConnResult<bool> {
        let mut registry = self.inner.registry.lock().await;
        let service = registry.get_mut(ident)?;
        service.session_usage_count = service.session_usage_count.saturating_sub(1);
        Ok(service.session_usage_count > 0)
    }
}

/// Passphrase validation per security: WEP wants 5/13 characters or 10/26
/// hex digits, PSK-class wants 8..=64 with 64 meaning raw hex.
fn validate_passphrase(security: Security, passphrase: Option<&str>) -> ConnResult<()> {
    let Some(passphrase) = passphrase else {
        return Ok(());
    };

    let valid = match security {
        Security::Wep => match passphrase.len() {
            5 | 13 => true,
            10 | 26 => passphrase.chars().all(|c| c.is_ascii_hexdigit()),
            _ => false,
        },
        Security::Psk | Security::Wpa | Security::Rsn => match passphrase.len() {
            64 => passphrase.chars().all(|c| c.is_ascii_hexdigit()),
            len => (8..64).contains(&len),
        },
        Security::Unknown | Security::None | Security::Ieee8021x => true,
    };

    if valid {
        Ok(())
    } else {
        Err(ConnError::InvalidArgument("passphrase".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn wifi_desc(ident: &str, security: Security) -> ServiceDescriptor {
        let mut desc = ServiceDescriptor::new(ident, ServiceType::Wifi);
        desc.security = security;
        desc.index = 3;
        desc.name = Some(format!("net-{}", ident));
        desc.strength = 50;
        desc
    }

    fn manager() -> (ServiceManager, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let manager = ServiceManager::new(ServiceStore::new(dir.path()));
        (manager, dir)
    }

    /// Agent handing out one fixed passphrase.
    struct FixedAgent {
        passphrase: Option<String>,
        prompts: StdMutex<u32>,
    }

    #[async_trait]
    impl CredentialAgent for FixedAgent {
        async fn request_passphrase(
            &self,
            _ident: &str,
            _name: Option<&str>,
        ) -> ConnResult<AgentReply> {
            *self.prompts.lock().unwrap() += 1;
            Ok(AgentReply {
                identity: None,
                passphrase: self.passphrase.clone(),
            })
        }

        async fn request_login(&self, _ident: &str) -> ConnResult<(String, String)> {
            Err(ConnError::NotRegistered("agent".into()))
        }

        async fn report_error(&self, _ident: &str, _error: &str) -> ConnResult<bool> {
            Ok(false)
        }
    }

    async fn drive_to_ready(manager: &ServiceManager, ident: &str) {
        manager.network_connected(ident).await;
        manager
            .address_bound(
                ident,
                IpconfigType::Ipv4,
                IpconfigAddress {
                    address: Some("192.168.1.10".parse().unwrap()),
                    prefix: 24,
                    gateway: Some("192.168.1.1".parse().unwrap()),
                    broadcast: None,
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_register_and_rank() {
        let (manager, _dir) = manager();
        manager.start();

        manager
            .register(wifi_desc("wifi_aa_one_managed_psk", Security::Psk))
            .await
            .unwrap();
        let mut eth = ServiceDescriptor::new("ethernet_bb_cable", ServiceType::Ethernet);
        eth.index = 2;
        manager.register(eth).await.unwrap();

        let services = manager.services().await;
        assert_eq!(services.len(), 2);
        // Equal on state/order/favorite; wifi ranks below other types.
        assert_eq!(services[0], "ethernet_bb_cable");
    }

    #[tokio::test]
    async fn test_psk_connect_happy_path_with_agent() {
        let (manager, _dir) = manager();
        manager.start();

        let ident = "wifi_dev_ssidA_managed_psk";
        manager
            .register(wifi_desc(ident, Security::Psk))
            .await
            .unwrap();
        manager
            .set_agent(Arc::new(FixedAgent {
                passphrase: Some("hunter2".to_string()),
                prompts: StdMutex::new(0),
            }))
            .await;

        let connect = {
            let manager = manager.clone();
            let ident = ident.to_string();
            tokio::spawn(async move { manager.connect(&ident).await })
        };

        // Let the connect reach association, then walk the families up.
        tokio::time::sleep(Duration::from_millis(50)).await;
        {
            let snapshot = manager.snapshot(ident).await.unwrap();
            assert_eq!(snapshot.state, ServiceState::Association);
            assert_eq!(snapshot.passphrase.as_deref(), Some("hunter2"));
        }

        drive_to_ready(&manager, ident).await;
        connect.await.unwrap().unwrap();

        let snapshot = manager.snapshot(ident).await.unwrap();
        assert_eq!(snapshot.state, ServiceState::Ready);
        assert!(snapshot.favorite);
        assert!(snapshot.autoconnect);

        // Persisted: passphrase, favorite, autoconnect. The save runs as a
        // post-transition effect; give it a beat.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let store = ServiceStore::new(_dir.path());
        let saved = store.load(ident).await.unwrap().unwrap();
        assert_eq!(saved.passphrase.as_deref(), Some("hunter2"));
        assert!(saved.favorite);
        assert_eq!(saved.autoconnect, Some(true));
    }

    #[tokio::test]
    async fn test_agent_refusal_fails_without_retry() {
        let (manager, _dir) = manager();
        manager.start();

        let ident = "wifi_dev_closed_managed_psk";
        manager
            .register(wifi_desc(ident, Security::Psk))
            .await
            .unwrap();
        let agent = Arc::new(FixedAgent {
            passphrase: None,
            prompts: StdMutex::new(0),
        });
        manager.set_agent(agent.clone()).await;

        let err = manager.connect(ident).await.unwrap_err();
        assert!(matches!(err, ConnError::NoKey));
        assert_eq!(*agent.prompts.lock().unwrap(), 1);

        let snapshot = manager.snapshot(ident).await.unwrap();
        assert_eq!(snapshot.state, ServiceState::Failure);
    }

    #[tokio::test]
    async fn test_combined_state_invariant() {
        let (manager, _dir) = manager();
        manager.start();

        let ident = "wifi_dev_inv_managed_none";
        manager
            .register(wifi_desc(ident, Security::None))
            .await
            .unwrap();

        let connect = {
            let manager = manager.clone();
            let ident = ident.to_string();
            tokio::spawn(async move { manager.connect(&ident).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        drive_to_ready(&manager, ident).await;
        connect.await.unwrap().unwrap();

        let snapshot = manager.snapshot(ident).await.unwrap();
        assert_eq!(
            snapshot.state,
            combine_state(snapshot.state_ipv4, snapshot.state_ipv6)
        );
    }

    #[tokio::test]
    async fn test_connect_timeout_fails_both_families() {
        let (mut manager, _dir) = manager();
        manager.set_connect_timeout(Duration::from_millis(50));
        manager.start();

        let ident = "wifi_dev_slow_managed_none";
        manager
            .register(wifi_desc(ident, Security::None))
            .await
            .unwrap();

        let err = manager.connect(ident).await.unwrap_err();
        assert!(matches!(err, ConnError::Timeout(_)));

        // The failure indication runs after the pending reply.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let snapshot = manager.snapshot(ident).await.unwrap();
        assert_eq!(snapshot.state, ServiceState::Failure);
    }

    #[tokio::test]
    async fn test_second_connect_same_type_rejected() {
        let (manager, _dir) = manager();
        manager.start();

        let a = "wifi_dev_a_managed_none";
        let b = "wifi_dev_b_managed_none";
        manager.register(wifi_desc(a, Security::None)).await.unwrap();
        manager.register(wifi_desc(b, Security::None)).await.unwrap();

        let connect = {
            let manager = manager.clone();
            let a = a.to_string();
            tokio::spawn(async move { manager.connect(&a).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let err = manager.connect(b).await.unwrap_err();
        assert!(matches!(err, ConnError::InProgress));

        drive_to_ready(&manager, a).await;
        connect.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_autoconnect_walks_ranking() {
        let (manager, _dir) = manager();
        manager.start();

        let ident = "wifi_dev_fav_managed_none";
        manager
            .register(wifi_desc(ident, Security::None))
            .await
            .unwrap();

        // Make it a favorite with autoconnect, as a completed connect would.
        {
            let mut registry = manager.inner.registry.lock().await;
            let service = registry.get_mut(ident).unwrap();
            service.favorite = true;
            service.autoconnect = true;
        }

        manager.auto_connect().await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let snapshot = manager.snapshot(ident).await.unwrap();
        assert_eq!(snapshot.state, ServiceState::Association);
    }

    #[tokio::test]
    async fn test_session_mode_disables_autoconnect() {
        let (manager, _dir) = manager();
        manager.start();

        let ident = "wifi_dev_sess_managed_none";
        manager
            .register(wifi_desc(ident, Security::None))
            .await
            .unwrap();
        {
            let mut registry = manager.inner.registry.lock().await;
            let service = registry.get_mut(ident).unwrap();
            service.favorite = true;
            service.autoconnect = true;
        }

        manager.set_session_mode(true);
        manager.auto_connect().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let snapshot = manager.snapshot(ident).await.unwrap();
        assert_eq!(snapshot.state, ServiceState::Idle);
    }

    #[tokio::test]
    async fn test_move_before_reorders_and_demotes() {
        let (manager, _dir) = manager();
        manager.start();

        let a = "wifi_dev_first_managed_none";
        let b = "wifi_dev_second_managed_none";
        manager.register(wifi_desc(a, Security::None)).await.unwrap();
        manager.register(wifi_desc(b, Security::None)).await.unwrap();

        {
            let mut registry = manager.inner.registry.lock().await;
            for (ident, s4) in [(a, ServiceState::Online), (b, ServiceState::Ready)] {
                let service = registry.get_mut(ident).unwrap();
                service.favorite = true;
                service.state_ipv4 = s4;
                service.state_ipv6 = ServiceState::Idle;
                service.state = s4;
            }
            registry.sort();
            registry.default_ident = registry.default_service().cloned();
        }
        assert_eq!(manager.default_service().await.as_deref(), Some(a));

        manager.move_service(b, a, true).await.unwrap();

        let order = manager.services().await;
        assert_eq!(order, vec![b.to_string(), a.to_string()]);
        assert_eq!(manager.default_service().await.as_deref(), Some(b));

        let demoted = manager.snapshot(a).await.unwrap();
        assert_eq!(demoted.state, ServiceState::Ready);
    }

    #[tokio::test]
    async fn test_move_rejects_non_favorites() {
        let (manager, _dir) = manager();
        manager.start();

        let a = "wifi_dev_na_managed_none";
        let b = "wifi_dev_nb_managed_none";
        manager.register(wifi_desc(a, Security::None)).await.unwrap();
        manager.register(wifi_desc(b, Security::None)).await.unwrap();

        let err = manager.move_service(a, b, true).await.unwrap_err();
        assert!(matches!(err, ConnError::NotSupported(_)));
    }

    #[tokio::test]
    async fn test_remove_clears_favorite_and_passphrase() {
        let (manager, dir) = manager();
        manager.start();

        let ident = "wifi_dev_gone_managed_psk";
        manager
            .register(wifi_desc(ident, Security::Psk))
            .await
            .unwrap();
        {
            let mut registry = manager.inner.registry.lock().await;
            let service = registry.get_mut(ident).unwrap();
            service.favorite = true;
            service.autoconnect = true;
            service.passphrase = Some("hunter2".to_string());
        }

        manager.remove(ident).await.unwrap();

        let snapshot = manager.snapshot(ident).await.unwrap();
        assert!(!snapshot.favorite);
        assert!(!snapshot.autoconnect);
        assert!(snapshot.passphrase.is_none());

        let store = ServiceStore::new(dir.path());
        let saved = store.load(ident).await.unwrap().unwrap();
        assert!(!saved.favorite);
        assert!(saved.passphrase.is_none());
    }

    #[tokio::test]
    async fn test_persistence_roundtrip_through_reregistration() {
        let (manager, dir) = manager();
        manager.start();

        let ident = "wifi_dev_persist_managed_psk";
        manager
            .register(wifi_desc(ident, Security::Psk))
            .await
            .unwrap();
        {
            let mut registry = manager.inner.registry.lock().await;
            let service = registry.get_mut(ident).unwrap();
            service.favorite = true;
        }
        manager
            .set_passphrase(ident, Some("hunter22".to_string()))
            .await
            .unwrap();
        manager
            .set_nameservers_config(ident, vec!["10.0.0.53".to_string()])
            .await
            .unwrap();
        manager
            .set_domains_config(ident, vec!["lan".to_string()])
            .await
            .unwrap();
        manager
            .set_proxy_config(
                ident,
                ProxyMethod::Manual,
                vec!["proxy.lan:3128".to_string()],
                vec!["internal.lan".to_string()],
                None,
            )
            .await
            .unwrap();
        manager.set_autoconnect(ident, true).await.unwrap();

        // A fresh manager over the same store revives the settings.
        let manager2 = ServiceManager::new(ServiceStore::new(dir.path()));
        manager2.start();
        manager2
            .register(wifi_desc(ident, Security::Psk))
            .await
            .unwrap();

        let snapshot = manager2.snapshot(ident).await.unwrap();
        assert!(snapshot.favorite);
        assert!(snapshot.autoconnect);
        assert_eq!(snapshot.passphrase.as_deref(), Some("hunter22"));
        assert_eq!(snapshot.nameservers_config, vec!["10.0.0.53".to_string()]);
        assert_eq!(snapshot.domains, vec!["lan".to_string()]);
        assert_eq!(snapshot.proxy_config, ProxyMethod::Manual);
        assert_eq!(snapshot.proxies, vec!["proxy.lan:3128".to_string()]);
        assert_eq!(snapshot.excludes, vec!["internal.lan".to_string()]);
    }

    #[tokio::test]
    async fn test_favorite_false_implies_autoconnect_false() {
        let (manager, _dir) = manager();
        manager.start();

        let ident = "wifi_dev_nofav_managed_none";
        manager
            .register(wifi_desc(ident, Security::None))
            .await
            .unwrap();

        let err = manager.set_autoconnect(ident, true).await.unwrap_err();
        assert!(matches!(err, ConnError::InvalidState(_)));
    }

    #[test]
    fn test_passphrase_validation() {
        assert!(validate_passphrase(Security::Psk, Some("hunter22")).is_ok());
        assert!(validate_passphrase(Security::Psk, Some("short")).is_err());
        assert!(validate_passphrase(Security::Psk, Some(&"a".repeat(64))).is_err());
        assert!(validate_passphrase(Security::Psk, Some(&"f".repeat(64))).is_ok());
        assert!(validate_passphrase(Security::Wep, Some("abcde")).is_ok());
        assert!(validate_passphrase(Security::Wep, Some("0102030405")).is_ok());
        assert!(validate_passphrase(Security::Wep, Some("xyz")).is_err());
    }

    #[tokio::test]
    async fn test_clear_error_returns_to_idle() {
        let (manager, _dir) = manager();
        manager.start();

        let ident = "wifi_dev_err_managed_none";
        manager
            .register(wifi_desc(ident, Security::None))
            .await
            .unwrap();
        manager
            .indicate_error(ident, ServiceError::ConnectFailed)
            .await
            .unwrap();

        let snapshot = manager.snapshot(ident).await.unwrap();
        assert_eq!(snapshot.state, ServiceState::Failure);
        assert_eq!(snapshot.error, ServiceError::ConnectFailed);

        manager.clear_error(ident).await.unwrap();
        let snapshot = manager.snapshot(ident).await.unwrap();
        assert_eq!(snapshot.state, ServiceState::Idle);
        assert_eq!(snapshot.error, ServiceError::Unknown);
    }

    #[tokio::test]
    async fn test_session_pin_blocks_unregister() {
        let (manager, _dir) = manager();
        manager.start();

        let ident = "wifi_dev_pin_managed_none";
        manager
            .register(wifi_desc(ident, Security::None))
            .await
            .unwrap();
        manager.session_inc(ident).await.unwrap();

        assert!(manager.unregister(ident).await.is_err());
        assert!(!manager.session_dec(ident).await.unwrap());
        manager.unregister(ident).await.unwrap();
    }
}

//! D-Bus control interface
//!
//! The daemon claims one well-known name on the system bus and exposes
//! three object kinds: the manager at the root path (services,
//! technologies, agents, counters, sessions, private networks), one
//! service object per registered service, and the clock on the manager
//! path. Peer lifetimes are tracked through NameOwnerChanged so agents,
//! counters, sessions and private networks die with their owners.

pub mod clock_object;
pub mod manager;
pub mod service_object;

pub use manager::ManagerInterface;

use crate::agent::AgentProxy;
use crate::clock::Clock;
use crate::error::ConnResult;
use crate::service::{ServiceEvent, ServiceManager, StatsData};
use crate::session::SessionManager;
use crate::technology::TechnologyRegistry;
use crate::tether::TetheringManager;
use crate::wispr::WisprManager;
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use zbus::zvariant::{OwnedValue, Value};
use zbus::Connection;

pub const BUS_NAME: &str = "net.connctl";
pub const MANAGER_PATH: &str = "/";
pub const MANAGER_INTERFACE: &str = "net.connctl.Manager";
pub const SERVICE_INTERFACE: &str = "net.connctl.Service";
pub const CLOCK_INTERFACE: &str = "net.connctl.Clock";

/// Registered traffic counter peer.
struct Counter {
    task: JoinHandle<()>,
}

pub struct CounterRegistry {
    services: ServiceManager,
    connection: Connection,
    counters: Mutex<HashMap<(String, String), Counter>>,
}

impl CounterRegistry {
    fn new(services: ServiceManager, connection: Connection) -> Self {
        Self {
            services,
            connection,
            counters: Mutex::new(HashMap::new()),
        }
    }

    /// Register a counter peer; it receives periodic Usage calls with the
    /// per-service statistics dictionaries.
    pub async fn register(&self, owner: &str, path: &str, period: u32) -> ConnResult<()> {
        let key = (owner.to_string(), path.to_string());
        let mut counters = self.counters.lock().await;
        if counters.contains_key(&key) {
            return Err(crate::error::ConnError::AlreadyExists(path.to_string()));
        }

        let services = self.services.clone();
        let connection = self.connection.clone();
        let owner_name = owner.to_string();
        let counter_path = path.to_string();
        let period = period.max(1);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(period as u64));
            loop {
                ticker.tick().await;
                for snapshot in services.visible_services().await {
                    if !snapshot.state.is_connected() {
                        continue;
                    }
                    let home = stats_dict(&snapshot.stats);
                    let roaming = stats_dict(&snapshot.stats_roaming);
                    let Ok(path) =
                        zbus::zvariant::ObjectPath::try_from(snapshot.path.as_str())
                    else {
                        continue;
                    };
                    if let Err(e) = connection
                        .call_method(
                            Some(owner_name.as_str()),
                            counter_path.as_str(),
                            Some("net.connctl.Counter"),
                            "Usage",
                            &(path, home, roaming),
                        )
                        .await
                    {
                        debug!("counter {} unreachable: {}", counter_path, e);
                    }
                }
            }
        });

        counters.insert(key, Counter { task });
        info!("counter {} registered for {}", path, owner);
        Ok(())
    }

    pub async fn unregister(&self, owner: &str, path: &str) -> ConnResult<()> {
        let key = (owner.to_string(), path.to_string());
        match self.counters.lock().await.remove(&key) {
            Some(counter) => {
                counter.task.abort();
                Ok(())
            }
            None => Err(crate::error::ConnError::NotRegistered(path.to_string())),
        }
    }

    async fn owner_disconnected(&self, owner: &str) {
        let mut counters = self.counters.lock().await;
        counters.retain(|(counter_owner, path), counter| {
            if counter_owner == owner {
                debug!("counter {} owner {} died", path, owner);
                counter.task.abort();
                false
            } else {
                true
            }
        });
    }
}

fn stats_dict(stats: &StatsData) -> HashMap<String, u32> {
    let mut dict = HashMap::new();
    dict.insert("RX.Bytes".to_string(), stats.rx_bytes as u32);
    dict.insert("RX.Packets".to_string(), stats.rx_packets as u32);
    dict.insert("RX.Errors".to_string(), stats.rx_errors as u32);
    dict.insert("RX.Dropped".to_string(), stats.rx_dropped as u32);
    dict.insert("TX.Bytes".to_string(), stats.tx_bytes as u32);
    dict.insert("TX.Packets".to_string(), stats.tx_packets as u32);
    dict.insert("TX.Errors".to_string(), stats.tx_errors as u32);
    dict.insert("TX.Dropped".to_string(), stats.tx_dropped as u32);
    dict.insert("Time".to_string(), stats.time as u32);
    dict
}

/// Everything the bus layer glues together.
pub struct ConnDbusService {
    pub connection: Connection,
    pub services: ServiceManager,
    pub counters: Arc<CounterRegistry>,
}

impl ConnDbusService {
    /// Connect to the system bus, claim the name and register all objects.
    pub async fn start(
        services: ServiceManager,
        sessions: Arc<SessionManager>,
        technologies: Arc<TechnologyRegistry>,
        tethering: Arc<TetheringManager>,
        wispr: Arc<WisprManager>,
        clock: Arc<Clock>,
    ) -> ConnResult<Self> {
        let connection = Connection::system()
            .await
            .map_err(|e| crate::error::ConnError::Transport(format!("system bus: {}", e)))?;

        let counters = Arc::new(CounterRegistry::new(services.clone(), connection.clone()));

        let manager = ManagerInterface::new(
            connection.clone(),
            services.clone(),
            sessions.clone(),
            technologies,
            tethering.clone(),
            wispr,
            counters.clone(),
        );

        connection
            .object_server()
            .at(MANAGER_PATH, manager)
            .await
            .map_err(|e| crate::error::ConnError::Transport(format!("object export: {}", e)))?;

        connection
            .object_server()
            .at(MANAGER_PATH, clock_object::ClockInterface::new(clock))
            .await
            .map_err(|e| crate::error::ConnError::Transport(format!("object export: {}", e)))?;

        connection
            .request_name(BUS_NAME)
            .await
            .map_err(|e| crate::error::ConnError::Transport(format!("bus name: {}", e)))?;

        info!("{} claimed on the system bus", BUS_NAME);

        let bus = Self {
            connection,
            services,
            counters,
        };
        bus.spawn_service_object_sync();
        bus.spawn_signal_forwarder();
        bus.spawn_peer_watch(sessions, tethering);
        Ok(bus)
    }

    /// Keep one bus object per registered service.
    fn spawn_service_object_sync(&self) {
        let connection = self.connection.clone();
        let services = self.services.clone();
        let mut events = self.services.subscribe();

        tokio::spawn(async move {
            let mut exported: HashSet<String> = HashSet::new();

            // Export whatever exists before the first change event.
            sync_service_objects(&connection, &services, &mut exported).await;

            loop {
                match events.recv().await {
                    Ok(ServiceEvent::ServicesChanged) => {
                        sync_service_objects(&connection, &services, &mut exported).await;
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                        sync_service_objects(&connection, &services, &mut exported).await;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    /// Translate model events into bus signals, in event order.
    fn spawn_signal_forwarder(&self) {
        let connection = self.connection.clone();
        let services = self.services.clone();
        let mut events = self.services.subscribe();

        tokio::spawn(async move {
            let mut global_state = "idle";
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!("signal forwarder lagged {} events", n);
                        continue;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                };

                match event {
                    ServiceEvent::StateChanged { ident, state } => {
                        let path = format!("{}{}", crate::service::SERVICE_PATH_PREFIX, ident);
                        emit_property_changed(
                            &connection,
                            &path,
                            SERVICE_INTERFACE,
                            "State",
                            Value::from(state.as_str()),
                        )
                        .await;

                        // The manager-level state follows the connected set.
                        let connected = services
                            .visible_services()
                            .await
                            .iter()
                            .any(|snapshot| snapshot.state.is_connected());
                        let new_global = if connected { "online" } else { "idle" };
                        if new_global != global_state {
                            global_state = new_global;
                            if let Err(e) = connection
                                .emit_signal(
                                    None::<zbus::names::BusName<'_>>,
                                    MANAGER_PATH,
                                    MANAGER_INTERFACE,
                                    "StateChanged",
                                    &(new_global,),
                                )
                                .await
                            {
                                debug!("StateChanged emission: {}", e);
                            }
                        }
                    }
                    ServiceEvent::PropertyChanged { ident, name } => {
                        let path = format!("{}{}", crate::service::SERVICE_PATH_PREFIX, ident);
                        if let Ok(snapshot) = services.snapshot(&ident).await {
                            if let Some(value) = service_object::property_value(&snapshot, &name) {
                                emit_property_changed(
                                    &connection,
                                    &path,
                                    SERVICE_INTERFACE,
                                    &name,
                                    value,
                                )
                                .await;
                            }
                        }
                    }
                    ServiceEvent::ServicesChanged => {
                        let paths: Vec<String> = services
                            .visible_services()
                            .await
                            .into_iter()
                            .map(|s| s.path)
                            .collect();
                        emit_property_changed(
                            &connection,
                            MANAGER_PATH,
                            MANAGER_INTERFACE,
                            "Services",
                            Value::from(paths),
                        )
                        .await;
                    }
                    ServiceEvent::DefaultChanged { ident } => {
                        let technology = match &ident {
                            Some(ident) => services
                                .snapshot(ident)
                                .await
                                .map(|s| s.service_type.as_str().to_string())
                                .unwrap_or_default(),
                            None => String::new(),
                        };
                        emit_property_changed(
                            &connection,
                            MANAGER_PATH,
                            MANAGER_INTERFACE,
                            "DefaultTechnology",
                            Value::from(technology),
                        )
                        .await;
                    }
                    _ => {}
                }
            }
        });
    }

    /// Follow bus peers: a vanished owner takes its agent, counters,
    /// sessions and private networks along.
    fn spawn_peer_watch(&self, sessions: Arc<SessionManager>, tethering: Arc<TetheringManager>) {
        let connection = self.connection.clone();
        let services = self.services.clone();
        let counters = self.counters.clone();

        tokio::spawn(async move {
            let dbus = match zbus::fdo::DBusProxy::new(&connection).await {
                Ok(dbus) => dbus,
                Err(e) => {
                    warn!("peer watch unavailable: {}", e);
                    return;
                }
            };
            let mut stream = match dbus.receive_name_owner_changed().await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("peer watch unavailable: {}", e);
                    return;
                }
            };

            while let Some(signal) = stream.next().await {
                let Ok(args) = signal.args() else { continue };
                // A unique name losing its owner means the peer is gone.
                if args.new_owner().is_none() && args.name().starts_with(':') {
                    let owner = args.name().to_string();
                    debug!("bus peer {} vanished", owner);
                    sessions.owner_disconnected(&owner).await;
                    tethering.owner_disconnected(&owner).await;
                    counters.owner_disconnected(&owner).await;
                    manager::agent_owner_disconnected(&services, &owner).await;
                }
            }
        });
    }
}

async fn sync_service_objects(
    connection: &Connection,
    services: &ServiceManager,
    exported: &mut HashSet<String>,
) {
    let current: HashMap<String, String> = services
        .visible_services()
        .await
        .into_iter()
        .map(|snapshot| (snapshot.identifier.clone(), snapshot.path))
        .collect();

    for (ident, path) in &current {
        if exported.contains(ident) {
            continue;
        }
        let iface = service_object::ServiceObject::new(services.clone(), ident.clone());
        match connection.object_server().at(path.as_str(), iface).await {
            Ok(_) => {
                exported.insert(ident.clone());
            }
            Err(e) => warn!("exporting {}: {}", path, e),
        }
    }

    let gone: Vec<String> = exported
        .iter()
        .filter(|ident| !current.contains_key(*ident))
        .cloned()
        .collect();
    for ident in gone {
        let path = format!("{}{}", crate::service::SERVICE_PATH_PREFIX, ident);
        let _ = connection
            .object_server()
            .remove::<service_object::ServiceObject, _>(path.as_str())
            .await;
        exported.remove(&ident);
    }
}

async fn emit_property_changed(
    connection: &Connection,
    path: &str,
    interface: &str,
    name: &str,
    value: Value<'_>,
) {
    if let Err(e) = connection
        .emit_signal(
            None::<zbus::names::BusName<'_>>,
            path,
            interface,
            "PropertyChanged",
            &(name, value),
        )
        .await
    {
        debug!("signal emission on {}: {}", path, e);
    }
}

/// Helper for building a{sv} replies.
pub(crate) fn insert_value(dict: &mut HashMap<String, OwnedValue>, key: &str, value: Value<'_>) {
    if let Ok(owned) = OwnedValue::try_from(value) {
        dict.insert(key.to_string(), owned);
    }
}

/// Register an agent proxy with the service and portal engines.
pub(crate) async fn install_agent(
    services: &ServiceManager,
    wispr: &WisprManager,
    connection: Connection,
    sender: &str,
    path: zbus::zvariant::OwnedObjectPath,
) {
    let agent = Arc::new(AgentProxy::new(connection, sender, path));
    services.set_agent(agent.clone()).await;
    wispr.set_agent(agent).await;
}

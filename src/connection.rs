//! Default-route and nameserver integrator
//!
//! Subscribes to service state transitions and keeps the kernel and the
//! resolver in line with the ranking: interface nameservers and search
//! domains are installed when a service reaches ready, host routes are
//! added for nameservers outside the interface subnet, the default gateway
//! follows the top connected service, and rp_filter switches to loose mode
//! while more than one IPv4 network is connected.

use crate::error::ConnResult;
use crate::inet::{self, Inet};
use crate::ipconfig::IpconfigMethod;
use crate::service::{ServiceEvent, ServiceManager, ServiceSnapshot, ServiceState};
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Kernel-side operations the integrator needs; `Inet` is the production
/// implementation, tests record calls instead.
#[async_trait]
pub trait RouteOps: Send + Sync {
    async fn add_address_v4(
        &self,
        index: u32,
        address: Ipv4Addr,
        prefix: u8,
    ) -> ConnResult<()>;
    async fn flush_addresses(&self, index: u32) -> ConnResult<()>;
    async fn add_default_route_v4(&self, index: u32, gateway: Ipv4Addr) -> ConnResult<()>;
    async fn del_default_route_v4(&self, index: u32, gateway: Ipv4Addr) -> ConnResult<()>;
    async fn add_default_route_v6(&self, index: u32, gateway: Ipv6Addr) -> ConnResult<()>;
    async fn del_default_route_v6(&self, index: u32, gateway: Ipv6Addr) -> ConnResult<()>;
    async fn add_host_route_v4(
        &self,
        index: u32,
        destination: Ipv4Addr,
        gateway: Option<Ipv4Addr>,
    ) -> ConnResult<()>;
    async fn del_host_route_v4(
        &self,
        index: u32,
        destination: Ipv4Addr,
        gateway: Option<Ipv4Addr>,
    ) -> ConnResult<()>;
    async fn set_rp_filter_loose(&self) -> ConnResult<i32>;
    async fn restore_rp_filter(&self, value: i32) -> ConnResult<()>;
}

#[async_trait]
impl RouteOps for Inet {
    async fn add_address_v4(&self, index: u32, address: Ipv4Addr, prefix: u8) -> ConnResult<()> {
        Inet::add_address_v4(self, index, address, prefix, None, None).await
    }

    async fn flush_addresses(&self, index: u32) -> ConnResult<()> {
        Inet::flush_addresses(self, index, false).await?;
        Inet::flush_addresses(self, index, true).await
    }

    async fn add_default_route_v4(&self, index: u32, gateway: Ipv4Addr) -> ConnResult<()> {
        Inet::add_default_route_v4(self, index, gateway).await
    }

    async fn del_default_route_v4(&self, index: u32, gateway: Ipv4Addr) -> ConnResult<()> {
        Inet::del_default_route_v4(self, index, gateway).await
    }

    async fn add_default_route_v6(&self, index: u32, gateway: Ipv6Addr) -> ConnResult<()> {
        Inet::add_default_route_v6(self, index, gateway, 0).await
    }

    async fn del_default_route_v6(&self, index: u32, gateway: Ipv6Addr) -> ConnResult<()> {
        Inet::del_default_route_v6(self, index, gateway).await
    }

    async fn add_host_route_v4(
        &self,
        index: u32,
        destination: Ipv4Addr,
        gateway: Option<Ipv4Addr>,
    ) -> ConnResult<()> {
        Inet::add_host_route_v4(self, index, destination, gateway).await
    }

    async fn del_host_route_v4(
        &self,
        index: u32,
        destination: Ipv4Addr,
        gateway: Option<Ipv4Addr>,
    ) -> ConnResult<()> {
        Inet::del_host_route_v4(self, index, destination, gateway).await
    }

    async fn set_rp_filter_loose(&self) -> ConnResult<i32> {
        inet::set_rp_filter_loose().await
    }

    async fn restore_rp_filter(&self, value: i32) -> ConnResult<()> {
        inet::restore_rp_filter(value).await
    }
}

/// Resolver state sink. The DNS proxy is an external collaborator; the
/// default implementation maintains a resolv.conf-style file.
#[async_trait]
pub trait ResolverOps: Send + Sync {
    async fn set_entries(
        &self,
        index: u32,
        nameservers: &[String],
        domains: &[String],
    ) -> ConnResult<()>;
    async fn remove_entries(&self, index: u32) -> ConnResult<()>;
    async fn flush_cache(&self);
}

pub struct FileResolver {
    path: std::path::PathBuf,
    entries: Mutex<HashMap<u32, (Vec<String>, Vec<String>)>>,
}

impl FileResolver {
    pub fn new<P: AsRef<std::path::Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            entries: Mutex::new(HashMap::new()),
        }
    }

    async fn write_out(&self) -> ConnResult<()> {
        let entries = self.entries.lock().await;
        let mut contents = String::from("# generated by connctld\n");

        let mut domains: Vec<&String> = Vec::new();
        for (servers, search) in entries.values() {
            for server in servers {
                contents.push_str(&format!("nameserver {}\n", server));
            }
            domains.extend(search.iter());
        }
        if !domains.is_empty() {
            contents.push_str("search");
            for domain in domains {
                contents.push(' ');
                contents.push_str(domain);
            }
            contents.push('\n');
        }

        tokio::fs::write(&self.path, contents).await?;
        Ok(())
    }
}

#[async_trait]
impl ResolverOps for FileResolver {
    async fn set_entries(
        &self,
        index: u32,
        nameservers: &[String],
        domains: &[String],
    ) -> ConnResult<()> {
        self.entries
            .lock()
            .await
            .insert(index, (nameservers.to_vec(), domains.to_vec()));
        self.write_out().await
    }

    async fn remove_entries(&self, index: u32) -> ConnResult<()> {
        self.entries.lock().await.remove(&index);
        self.write_out().await
    }

    async fn flush_cache(&self) {}
}

/// What we installed for one service, so teardown mirrors setup.
#[derive(Debug, Default, Clone)]
struct Installed {
    index: u32,
    host_routes: Vec<Ipv4Addr>,
    gateway_v4: Option<Ipv4Addr>,
    gateway_v6: Option<Ipv6Addr>,
    default_installed: bool,
}

struct IntegratorState {
    installed: HashMap<String, Installed>,
    connected_networks: i32,
    original_rp_filter: i32,
    default_ident: Option<String>,
}

pub struct ConnectionManager {
    services: ServiceManager,
    routes: Arc<dyn RouteOps>,
    resolver: Arc<dyn ResolverOps>,
    state: Mutex<IntegratorState>,
}

impl ConnectionManager {
    pub fn new(
        services: ServiceManager,
        routes: Arc<dyn RouteOps>,
        resolver: Arc<dyn ResolverOps>,
    ) -> Arc<Self> {
        Arc::new(Self {
            services,
            routes,
            resolver,
            state: Mutex::new(IntegratorState {
                installed: HashMap::new(),
                connected_networks: 0,
                original_rp_filter: 0,
                default_ident: None,
            }),
        })
    }

    /// Subscribe to service transitions and keep routes/resolver in sync.
    pub fn start(self: &Arc<Self>) {
        let integrator = self.clone();
        let mut events = self.services.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => integrator.handle_event(event).await,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!("integrator lagged {} events", n);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    async fn handle_event(&self, event: ServiceEvent) {
        match event {
            ServiceEvent::StateChanged { ident, state } => match state {
                ServiceState::Ready | ServiceState::Online => {
                    if let Err(e) = self.install(&ident).await {
                        warn!("network setup for {} failed: {}", ident, e);
                    }
                }
                ServiceState::Disconnect | ServiceState::Failure | ServiceState::Idle => {
                    self.uninstall(&ident).await;
                }
                _ => {}
            },
            ServiceEvent::NameserversChanged { ident } => {
                let installed = self.state.lock().await.installed.contains_key(&ident);
                if installed {
                    if let Err(e) = self.refresh_nameservers(&ident).await {
                        warn!("nameserver refresh for {} failed: {}", ident, e);
                    }
                }
            }
            ServiceEvent::DefaultChanged { ident } => {
                self.switch_default(ident).await;
            }
            ServiceEvent::Ipv4Connected { connected, .. } => {
                self.update_rp_filter(connected).await;
            }
            _ => {}
        }
    }

    async fn install(&self, ident: &str) -> ConnResult<()> {
        let snapshot = self.services.snapshot(ident).await?;
        if snapshot.index <= 0 {
            return Ok(());
        }
        let index = snapshot.index as u32;

        {
            let state = self.state.lock().await;
            if state.installed.contains_key(ident) {
                return Ok(());
            }
        }

        // Static methods carry their address here; dynamic ones were
        // programmed by the DHCP client already.
        if matches!(
            IpconfigMethod::from_str(&snapshot.ipv4_method),
            IpconfigMethod::Manual | IpconfigMethod::Fixed
        ) {
            if let Some(IpAddr::V4(address)) = snapshot.ipv4_address {
                if let Err(e) = self
                    .routes
                    .add_address_v4(index, address, snapshot.ipv4_prefix)
                    .await
                {
                    debug!("address install on {}: {}", ident, e);
                }
            }
        }

        let mut installed = Installed {
            index,
            ..Default::default()
        };
        installed.gateway_v4 = match snapshot.ipv4_gateway {
            Some(IpAddr::V4(gw)) => Some(gw),
            _ => None,
        };
        installed.gateway_v6 = match snapshot.ipv6_gateway {
            Some(IpAddr::V6(gw)) => Some(gw),
            _ => None,
        };

        // Nameservers outside the interface subnet need a host route so
        // their traffic stays on this link.
        installed.host_routes = self.install_nameservers(&snapshot, index).await?;

        let is_default = {
            let mut state = self.state.lock().await;
            state.installed.insert(ident.to_string(), installed);
            state.default_ident.as_deref() == Some(ident)
        };
        if is_default {
            self.install_default(ident).await;
        }

        info!("network configuration installed for {}", ident);
        Ok(())
    }

    async fn install_nameservers(
        &self,
        snapshot: &ServiceSnapshot,
        index: u32,
    ) -> ConnResult<Vec<Ipv4Addr>> {
        let nameservers = snapshot.effective_nameservers.clone();
        self.resolver
            .set_entries(index, &nameservers, &snapshot.domains)
            .await?;
        self.resolver.flush_cache().await;

        let subnet = match (snapshot.ipv4_address, snapshot.ipv4_prefix) {
            (Some(IpAddr::V4(address)), prefix) if prefix > 0 => Some((address, prefix)),
            _ => None,
        };
        let gateway = match snapshot.ipv4_gateway {
            Some(IpAddr::V4(gw)) => Some(gw),
            _ => None,
        };

        let mut host_routes = Vec::new();
        for server in &nameservers {
            let Ok(server) = server.parse::<Ipv4Addr>() else {
                continue;
            };
            let outside = match subnet {
                Some((address, prefix)) => !same_subnet(address, server, prefix),
                None => true,
            };
            if outside {
                if let Err(e) = self.routes.add_host_route_v4(index, server, gateway).await {
                    debug!("host route to {}: {}", server, e);
                } else {
                    host_routes.push(server);
                }
            }
        }

        Ok(host_routes)
    }

    async fn refresh_nameservers(&self, ident: &str) -> ConnResult<()> {
        let snapshot = self.services.snapshot(ident).await?;
        let (index, old_routes, gateway) = {
            let state = self.state.lock().await;
            let Some(installed) = state.installed.get(ident) else {
                return Ok(());
            };
            (
                installed.index,
                installed.host_routes.clone(),
                installed.gateway_v4,
            )
        };

        for server in old_routes {
            let _ = self.routes.del_host_route_v4(index, server, gateway).await;
        }
        let host_routes = self.install_nameservers(&snapshot, index).await?;

        let mut state = self.state.lock().await;
        if let Some(installed) = state.installed.get_mut(ident) {
            installed.host_routes = host_routes;
        }
        Ok(())
    }

    async fn uninstall(&self, ident: &str) {
        let installed = {
            let mut state = self.state.lock().await;
            state.installed.remove(ident)
        };
        let Some(installed) = installed else {
            return;
        };

        if installed.default_installed {
            if let Some(gateway) = installed.gateway_v4 {
                let _ = self
                    .routes
                    .del_default_route_v4(installed.index, gateway)
                    .await;
            }
            if let Some(gateway) = installed.gateway_v6 {
                let _ = self
                    .routes
                    .del_default_route_v6(installed.index, gateway)
                    .await;
            }
        }

        for server in installed.host_routes {
            let _ = self
                .routes
                .del_host_route_v4(installed.index, server, installed.gateway_v4)
                .await;
        }

        let _ = self.resolver.remove_entries(installed.index).await;
        self.resolver.flush_cache().await;
        let _ = self.routes.flush_addresses(installed.index).await;

        info!("network configuration removed for {}", ident);
    }

    /// Default switches atomically: the old gateway goes first, then the
    /// new one is installed.
    async fn switch_default(&self, new_default: Option<String>) {
        let previous = {
            let mut state = self.state.lock().await;
            let previous = state.default_ident.take();
            state.default_ident = new_default.clone();
            previous
        };

        if previous == new_default {
            return;
        }

        if let Some(old) = previous {
            let old_installed = {
                let mut state = self.state.lock().await;
                match state.installed.get_mut(&old) {
                    Some(installed) if installed.default_installed => {
                        installed.default_installed = false;
                        Some(installed.clone())
                    }
                    _ => None,
                }
            };
            if let Some(installed) = old_installed {
                if let Some(gateway) = installed.gateway_v4 {
                    let _ = self
                        .routes
                        .del_default_route_v4(installed.index, gateway)
                        .await;
                }
                if let Some(gateway) = installed.gateway_v6 {
                    let _ = self
                        .routes
                        .del_default_route_v6(installed.index, gateway)
                        .await;
                }
            }
        }

        if let Some(new) = new_default {
            self.install_default(&new).await;
        }
    }

    async fn install_default(&self, ident: &str) {
        let installed = {
            let state = self.state.lock().await;
            state.installed.get(ident).cloned()
        };
        let Some(installed) = installed else {
            return;
        };

        let mut ok = false;
        if let Some(gateway) = installed.gateway_v4 {
            match self
                .routes
                .add_default_route_v4(installed.index, gateway)
                .await
            {
                Ok(()) => ok = true,
                Err(e) => debug!("default route via {}: {}", gateway, e),
            }
        }
        if let Some(gateway) = installed.gateway_v6 {
            match self
                .routes
                .add_default_route_v6(installed.index, gateway)
                .await
            {
                Ok(()) => ok = true,
                Err(e) => debug!("v6 default route via {}: {}", gateway, e),
            }
        }

        if ok {
            let mut state = self.state.lock().await;
            if let Some(entry) = state.installed.get_mut(ident) {
                entry.default_installed = true;
            }
            info!("default route now via {}", ident);
        }
    }

    /// Loose-mode reverse-path filtering while several IPv4 networks are
    /// connected; the prior value comes back when only one remains.
    async fn update_rp_filter(&self, connected: bool) {
        let mut state = self.state.lock().await;

        if connected {
            if state.connected_networks == 1 {
                match self.routes.set_rp_filter_loose().await {
                    Ok(previous) => state.original_rp_filter = previous,
                    Err(e) => debug!("rp_filter switch failed: {}", e),
                }
            }
            state.connected_networks += 1;
        } else {
            if state.connected_networks == 2 {
                let _ = self
                    .routes
                    .restore_rp_filter(state.original_rp_filter)
                    .await;
            }
            state.connected_networks -= 1;
            if state.connected_networks < 0 {
                state.connected_networks = 0;
            }
        }

        debug!("connected IPv4 networks: {}", state.connected_networks);
    }
}

fn same_subnet(a: Ipv4Addr, b: Ipv4Addr, prefix: u8) -> bool {
    if prefix == 0 || prefix > 32 {
        return true;
    }
    let mask = u32::MAX << (32 - prefix);
    (u32::from(a) & mask) == (u32::from(b) & mask)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{Security, ServiceDescriptor, ServiceType};
    use crate::storage::ServiceStore;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingRoutes {
        pub log: StdMutex<Vec<String>>,
        pub rp_filter: StdMutex<i32>,
    }

    #[async_trait]
    impl RouteOps for RecordingRoutes {
        async fn add_address_v4(
            &self,
            index: u32,
            address: Ipv4Addr,
            prefix: u8,
        ) -> ConnResult<()> {
            self.log
                .lock()
                .unwrap()
                .push(format!("addr {} {}/{}", index, address, prefix));
            Ok(())
        }

        async fn flush_addresses(&self, index: u32) -> ConnResult<()> {
            self.log.lock().unwrap().push(format!("flush {}", index));
            Ok(())
        }

        async fn add_default_route_v4(&self, index: u32, gateway: Ipv4Addr) -> ConnResult<()> {
            self.log
                .lock()
                .unwrap()
                .push(format!("defroute add {} {}", index, gateway));
            Ok(())
        }

        async fn del_default_route_v4(&self, index: u32, gateway: Ipv4Addr) -> ConnResult<()> {
            self.log
                .lock()
                .unwrap()
                .push(format!("defroute del {} {}", index, gateway));
            Ok(())
        }

        async fn add_default_route_v6(&self, _index: u32, _gateway: Ipv6Addr) -> ConnResult<()> {
            Ok(())
        }

        async fn del_default_route_v6(&self, _index: u32, _gateway: Ipv6Addr) -> ConnResult<()> {
            Ok(())
        }

        async fn add_host_route_v4(
            &self,
            index: u32,
            destination: Ipv4Addr,
            _gateway: Option<Ipv4Addr>,
        ) -> ConnResult<()> {
            self.log
                .lock()
                .unwrap()
                .push(format!("hostroute add {} {}", index, destination));
            Ok(())
        }

        async fn del_host_route_v4(
            &self,
            index: u32,
            destination: Ipv4Addr,
            _gateway: Option<Ipv4Addr>,
        ) -> ConnResult<()> {
            self.log
                .lock()
                .unwrap()
                .push(format!("hostroute del {} {}", index, destination));
            Ok(())
        }

        async fn set_rp_filter_loose(&self) -> ConnResult<i32> {
            let previous = *self.rp_filter.lock().unwrap();
            *self.rp_filter.lock().unwrap() = 2;
            Ok(previous)
        }

        async fn restore_rp_filter(&self, value: i32) -> ConnResult<()> {
            *self.rp_filter.lock().unwrap() = value;
            Ok(())
        }
    }

    struct NullResolver;

    #[async_trait]
    impl ResolverOps for NullResolver {
        async fn set_entries(
            &self,
            _index: u32,
            _nameservers: &[String],
            _domains: &[String],
        ) -> ConnResult<()> {
            Ok(())
        }

        async fn remove_entries(&self, _index: u32) -> ConnResult<()> {
            Ok(())
        }

        async fn flush_cache(&self) {}
    }

    #[tokio::test]
    async fn test_rp_filter_counter() {
        let dir = tempfile::tempdir().unwrap();
        let services = ServiceManager::new(ServiceStore::new(dir.path()));
        let routes = Arc::new(RecordingRoutes::default());
        *routes.rp_filter.lock().unwrap() = 1;
        let integrator =
            ConnectionManager::new(services, routes.clone(), Arc::new(NullResolver));

        integrator.update_rp_filter(true).await;
        assert_eq!(*routes.rp_filter.lock().unwrap(), 1);

        // Second connected network switches to loose mode.
        integrator.update_rp_filter(true).await;
        assert_eq!(*routes.rp_filter.lock().unwrap(), 2);

        // Dropping back to one restores the saved value.
        integrator.update_rp_filter(false).await;
        assert_eq!(*routes.rp_filter.lock().unwrap(), 1);

        integrator.update_rp_filter(false).await;
        integrator.update_rp_filter(false).await; // never goes negative
    }

    #[tokio::test]
    async fn test_install_adds_host_route_for_offlink_nameserver() {
        let dir = tempfile::tempdir().unwrap();
        let services = ServiceManager::new(ServiceStore::new(dir.path()));
        services.start();

        let ident = "wifi_itest_net_managed_psk";
        let mut desc = ServiceDescriptor::new(ident, ServiceType::Wifi);
        desc.security = Security::Psk;
        desc.index = 7;
        services.register(desc).await.unwrap();
        services
            .set_nameservers_config(
                ident,
                vec!["192.168.1.53".to_string(), "8.8.8.8".to_string()],
            )
            .await
            .unwrap();
        services
            .address_bound(
                ident,
                crate::ipconfig::IpconfigType::Ipv4,
                crate::ipconfig::IpconfigAddress {
                    address: Some("192.168.1.77".parse().unwrap()),
                    prefix: 24,
                    gateway: Some("192.168.1.1".parse().unwrap()),
                    broadcast: None,
                },
            )
            .await
            .unwrap();

        let routes = Arc::new(RecordingRoutes::default());
        let integrator =
            ConnectionManager::new(services.clone(), routes.clone(), Arc::new(NullResolver));

        integrator.install(ident).await.unwrap();

        let log = routes.log.lock().unwrap().clone();
        // The on-link nameserver needs no route, the off-link one does.
        assert!(log.contains(&"hostroute add 7 8.8.8.8".to_string()));
        assert!(!log.iter().any(|l| l.contains("192.168.1.53")));
    }

    #[tokio::test]
    async fn test_default_switch_removes_old_then_adds_new() {
        let dir = tempfile::tempdir().unwrap();
        let services = ServiceManager::new(ServiceStore::new(dir.path()));
        services.start();

        let routes = Arc::new(RecordingRoutes::default());
        let integrator =
            ConnectionManager::new(services.clone(), routes.clone(), Arc::new(NullResolver));

        for (ident, index, gw) in [
            ("ethernet_a_cable", 2, "10.0.0.1"),
            ("wifi_b_net_managed_psk", 3, "192.168.1.1"),
        ] {
            let mut desc = ServiceDescriptor::new(
                ident,
                if index == 2 {
                    ServiceType::Ethernet
                } else {
                    ServiceType::Wifi
                },
            );
            desc.index = index;
            services.register(desc).await.unwrap();
            services
                .address_bound(
                    ident,
                    crate::ipconfig::IpconfigType::Ipv4,
                    crate::ipconfig::IpconfigAddress {
                        address: Some(if index == 2 {
                            "10.0.0.9".parse().unwrap()
                        } else {
                            "192.168.1.9".parse().unwrap()
                        }),
                        prefix: 24,
                        gateway: Some(gw.parse().unwrap()),
                        broadcast: None,
                    },
                )
                .await
                .unwrap();
        }

        integrator
            .switch_default(Some("ethernet_a_cable".to_string()))
            .await;
        integrator.install("ethernet_a_cable").await.unwrap();
        integrator.install("wifi_b_net_managed_psk").await.unwrap();

        integrator
            .switch_default(Some("wifi_b_net_managed_psk".to_string()))
            .await;

        let log = routes.log.lock().unwrap().clone();
        let del_pos = log
            .iter()
            .position(|l| l == "defroute del 2 10.0.0.1")
            .expect("old default removed");
        let add_pos = log
            .iter()
            .position(|l| l == "defroute add 3 192.168.1.1")
            .expect("new default added");
        assert!(del_pos < add_pos);
    }

    #[test]
    fn test_same_subnet() {
        let a: Ipv4Addr = "192.168.1.10".parse().unwrap();
        assert!(same_subnet(a, "192.168.1.53".parse().unwrap(), 24));
        assert!(!same_subnet(a, "8.8.8.8".parse().unwrap(), 24));
        assert!(same_subnet(a, "8.8.8.8".parse().unwrap(), 0));
    }
}

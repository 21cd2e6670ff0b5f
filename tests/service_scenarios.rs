//! End-to-end service lifecycle scenarios over the public API.

use async_trait::async_trait;
use libconnctl::error::{ConnError, ConnResult};
use libconnctl::ipconfig::{IpconfigAddress, IpconfigType};
use libconnctl::service::{
    AgentReply, CredentialAgent, Security, ServiceDescriptor, ServiceManager, ServiceState,
    ServiceType,
};
use libconnctl::storage::ServiceStore;
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct ScriptedAgent {
    passphrase: Option<String>,
    prompts: Mutex<u32>,
}

#[async_trait]
impl CredentialAgent for ScriptedAgent {
    async fn request_passphrase(&self, _ident: &str, _name: Option<&str>) -> ConnResult<AgentReply> {
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

fn wifi_descriptor(ident: &str, security: Security) -> ServiceDescriptor {
    let mut desc = ServiceDescriptor::new(ident, ServiceType::Wifi);
    desc.security = security;
    desc.index = 5;
    desc.name = Some(ident.rsplit('_').nth(2).unwrap_or("net").to_string());
    desc.strength = 60;
    desc
}

async fn bind_v4(services: &ServiceManager, ident: &str, address: &str, gateway: &str) {
    services
        .address_bound(
            ident,
            IpconfigType::Ipv4,
            IpconfigAddress {
                address: Some(address.parse().unwrap()),
                prefix: 24,
                gateway: Some(gateway.parse().unwrap()),
                broadcast: None,
            },
        )
        .await
        .unwrap();
}

/// Walk one service from idle to ready through the public indications.
async fn connect_to_ready(services: &ServiceManager, ident: &str, address: &str) {
    let connect = {
        let services = services.clone();
        let ident = ident.to_string();
        tokio::spawn(async move { services.connect(&ident).await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    services.network_connected(ident).await;
    bind_v4(services, ident, address, "192.168.1.1").await;

    connect.await.unwrap().unwrap();
}

#[tokio::test]
async fn psk_connect_happy_path_persists_credentials() {
    let dir = tempfile::tempdir().unwrap();
    let services = ServiceManager::new(ServiceStore::new(dir.path()));
    services.start();

    let ident = "wifi_dev_ssidA_managed_psk";
    services
        .register(wifi_descriptor(ident, Security::Psk))
        .await
        .unwrap();

    let agent = Arc::new(ScriptedAgent {
        passphrase: Some("hunter2".to_string()),
        prompts: Mutex::new(0),
    });
    services.set_agent(agent.clone()).await;

    connect_to_ready(&services, ident, "192.168.1.40").await;

    let snapshot = services.snapshot(ident).await.unwrap();
    assert_eq!(snapshot.state, ServiceState::Ready);
    assert!(snapshot.favorite);
    assert!(snapshot.autoconnect);
    assert_eq!(snapshot.passphrase.as_deref(), Some("hunter2"));
    assert_eq!(*agent.prompts.lock().unwrap(), 1);

    // Persisted settings carry passphrase, favorite and autoconnect.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let saved = ServiceStore::new(dir.path())
        .load(ident)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(saved.passphrase.as_deref(), Some("hunter2"));
    assert!(saved.favorite);
    assert_eq!(saved.autoconnect, Some(true));
}

#[tokio::test]
async fn agent_refusal_enters_failure_without_retry() {
    let dir = tempfile::tempdir().unwrap();
    let services = ServiceManager::new(ServiceStore::new(dir.path()));
    services.start();

    let ident = "wifi_dev_closed_managed_psk";
    services
        .register(wifi_descriptor(ident, Security::Psk))
        .await
        .unwrap();

    let agent = Arc::new(ScriptedAgent {
        passphrase: None,
        prompts: Mutex::new(0),
    });
    services.set_agent(agent.clone()).await;

    let err = services.connect(ident).await.unwrap_err();
    assert!(matches!(err, ConnError::NoKey));
    assert_eq!(*agent.prompts.lock().unwrap(), 1);

    let snapshot = services.snapshot(ident).await.unwrap();
    assert_eq!(snapshot.state, ServiceState::Failure);
}

#[tokio::test]
async fn online_promotion_follows_ready() {
    let dir = tempfile::tempdir().unwrap();
    let services = ServiceManager::new(ServiceStore::new(dir.path()));
    services.start();

    let ident = "wifi_dev_open_managed_none";
    services
        .register(wifi_descriptor(ident, Security::None))
        .await
        .unwrap();

    connect_to_ready(&services, ident, "192.168.1.41").await;

    // A transition into ONLINE is never observed before READY.
    let snapshot = services.snapshot(ident).await.unwrap();
    assert_eq!(snapshot.state, ServiceState::Ready);

    services
        .online_check_result(ident, IpconfigType::Ipv4, true)
        .await;
    let snapshot = services.snapshot(ident).await.unwrap();
    assert_eq!(snapshot.state, ServiceState::Online);
}

#[tokio::test]
async fn move_before_demotes_displaced_default() {
    let dir = tempfile::tempdir().unwrap();
    let services = ServiceManager::new(ServiceStore::new(dir.path()));
    services.start();

    let a = "wifi_dev_first_managed_none";
    let b = "wifi_dev_second_managed_none";
    services
        .register(wifi_descriptor(a, Security::None))
        .await
        .unwrap();
    services
        .register(wifi_descriptor(b, Security::None))
        .await
        .unwrap();

    connect_to_ready(&services, a, "192.168.1.50").await;
    services.online_check_result(a, IpconfigType::Ipv4, true).await;
    connect_to_ready(&services, b, "192.168.1.51").await;

    assert_eq!(services.default_service().await.as_deref(), Some(a));

    // B (ready) moves above A (online): A drops to ready, default flips.
    services.move_service(b, a, true).await.unwrap();

    let order = services.services().await;
    assert_eq!(order, vec![b.to_string(), a.to_string()]);
    assert_eq!(services.default_service().await.as_deref(), Some(b));

    let demoted = services.snapshot(a).await.unwrap();
    assert_eq!(demoted.state, ServiceState::Ready);
}

#[tokio::test]
async fn ranking_keys_hold_across_collection() {
    let dir = tempfile::tempdir().unwrap();
    let services = ServiceManager::new(ServiceStore::new(dir.path()));
    services.start();

    // A connected wifi, an idle favorite ethernet, a strong plain wifi.
    let connected = "wifi_dev_conn_managed_none";
    services
        .register(wifi_descriptor(connected, Security::None))
        .await
        .unwrap();
    connect_to_ready(&services, connected, "192.168.1.60").await;

    let mut eth = ServiceDescriptor::new("ethernet_dev_cable", ServiceType::Ethernet);
    eth.index = 6;
    services.register(eth).await.unwrap();

    let mut strong = wifi_descriptor("wifi_dev_strong_managed_none", Security::None);
    strong.strength = 90;
    services.register(strong).await.unwrap();

    let order = services.services().await;
    assert_eq!(order[0], connected);
    // Idle entries: ethernet outranks wifi at equal order/favorite.
    assert_eq!(order[1], "ethernet_dev_cable");
    assert_eq!(order[2], "wifi_dev_strong_managed_none");
}

#[tokio::test]
async fn disconnect_returns_service_to_idle() {
    let dir = tempfile::tempdir().unwrap();
    let services = ServiceManager::new(ServiceStore::new(dir.path()));
    services.start();

    let ident = "wifi_dev_cycle_managed_none";
    services
        .register(wifi_descriptor(ident, Security::None))
        .await
        .unwrap();

    connect_to_ready(&services, ident, "192.168.1.70").await;
    services.disconnect(ident).await.unwrap();

    let snapshot = services.snapshot(ident).await.unwrap();
    assert_eq!(snapshot.state, ServiceState::Idle);
    // Favorite status survives a disconnect.
    assert!(snapshot.favorite);
}

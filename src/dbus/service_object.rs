//! Per-service bus objects
//!
//! One object per registered service at `/net/connctl/service/<ident>`.
//! Properties mirror the model snapshot; SetProperty edits route through
//! the manager's typed setters so persistence and change signals follow
//! automatically.

use super::manager::BusError;
use crate::ipconfig::{IpconfigSettings, IpconfigType};
use crate::service::{ProxyMethod, ServiceManager, ServiceSnapshot};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use tracing::debug;
use zbus::interface;
use zbus::zvariant::{OwnedObjectPath, OwnedValue, Value};

pub struct ServiceObject {
    services: ServiceManager,
    ident: String,
}

impl ServiceObject {
    pub fn new(services: ServiceManager, ident: String) -> Self {
        Self { services, ident }
    }

    async fn snapshot(&self) -> Result<ServiceSnapshot, BusError> {
        self.services
            .snapshot(&self.ident)
            .await
            .map_err(BusError::from)
    }
}

fn prefix_to_netmask(prefix: u8) -> String {
    let mask = if prefix == 0 {
        0u32
    } else {
        u32::MAX << (32 - prefix.min(32))
    };
    Ipv4Addr::from(mask).to_string()
}

fn ipv4_dict(method: &str, snapshot: &ServiceSnapshot) -> HashMap<String, OwnedValue> {
    let mut dict = HashMap::new();
    super::insert_value(&mut dict, "Method", Value::from(method.to_string()));
    if let Some(address) = snapshot.ipv4_address {
        super::insert_value(&mut dict, "Address", Value::from(address.to_string()));
        super::insert_value(
            &mut dict,
            "Netmask",
            Value::from(prefix_to_netmask(snapshot.ipv4_prefix)),
        );
    }
    if let Some(gateway) = snapshot.ipv4_gateway {
        super::insert_value(&mut dict, "Gateway", Value::from(gateway.to_string()));
    }
    dict
}

fn ipv6_dict(method: &str, snapshot: &ServiceSnapshot) -> HashMap<String, OwnedValue> {
    let mut dict = HashMap::new();
    super::insert_value(&mut dict, "Method", Value::from(method.to_string()));
    if let Some(address) = snapshot.ipv6_address {
        super::insert_value(&mut dict, "Address", Value::from(address.to_string()));
        super::insert_value(&mut dict, "PrefixLength", Value::from(snapshot.ipv6_prefix));
    }
    if let Some(gateway) = snapshot.ipv6_gateway {
        super::insert_value(&mut dict, "Gateway", Value::from(gateway.to_string()));
    }
    dict
}

fn proxy_dict(snapshot: &ServiceSnapshot, configured: bool) -> HashMap<String, OwnedValue> {
    let mut dict = HashMap::new();
    let method = if configured {
        snapshot.proxy_config
    } else {
        snapshot.proxy
    };
    super::insert_value(&mut dict, "Method", Value::from(method.as_str().to_string()));
    if method == ProxyMethod::Manual {
        super::insert_value(&mut dict, "Servers", Value::from(snapshot.proxies.clone()));
        super::insert_value(&mut dict, "Excludes", Value::from(snapshot.excludes.clone()));
    }
    if let Some(url) = &snapshot.pac {
        super::insert_value(&mut dict, "URL", Value::from(url.clone()));
    }
    dict
}

fn security_list(snapshot: &ServiceSnapshot) -> Vec<String> {
    let mut list = vec![snapshot.security.as_str().to_string()];
    // WPS advertises alongside pre-shared-key security only.
    if snapshot.wps && snapshot.security.uses_psk() {
        list.push("wps".to_string());
    }
    list
}

/// Full a{sv} property dictionary for a service.
pub fn properties(snapshot: &ServiceSnapshot) -> HashMap<String, OwnedValue> {
    let mut dict = HashMap::new();

    super::insert_value(
        &mut dict,
        "Type",
        Value::from(snapshot.service_type.as_str().to_string()),
    );
    super::insert_value(&mut dict, "Security", Value::from(security_list(snapshot)));
    super::insert_value(
        &mut dict,
        "State",
        Value::from(snapshot.state.as_str().to_string()),
    );
    super::insert_value(
        &mut dict,
        "Error",
        Value::from(snapshot.error.as_str().to_string()),
    );
    super::insert_value(&mut dict, "Strength", Value::from(snapshot.strength));
    super::insert_value(&mut dict, "Favorite", Value::from(snapshot.favorite));
    super::insert_value(&mut dict, "Immutable", Value::from(snapshot.immutable));
    super::insert_value(&mut dict, "AutoConnect", Value::from(snapshot.autoconnect));
    super::insert_value(&mut dict, "Roaming", Value::from(snapshot.roaming));
    super::insert_value(
        &mut dict,
        "LoginRequired",
        Value::from(snapshot.login_required),
    );
    if let Some(name) = &snapshot.name {
        super::insert_value(&mut dict, "Name", Value::from(name.clone()));
    }
    if let Some(passphrase) = &snapshot.passphrase {
        super::insert_value(&mut dict, "Passphrase", Value::from(passphrase.clone()));
    }
    super::insert_value(
        &mut dict,
        "PassphraseRequired",
        Value::from(snapshot.security.needs_passphrase() && snapshot.passphrase.is_none()),
    );

    let mut ethernet = HashMap::new();
    super::insert_value(&mut ethernet, "Method", Value::from("auto"));
    super::insert_value(&mut ethernet, "Interface", Value::from(snapshot.index));
    super::insert_value(&mut dict, "Ethernet", Value::new(ethernet));

    super::insert_value(
        &mut dict,
        "IPv4",
        Value::new(ipv4_dict(&snapshot.ipv4_method, snapshot)),
    );
    super::insert_value(
        &mut dict,
        "IPv4.Configuration",
        Value::new(ipv4_dict(&snapshot.ipv4_method, snapshot)),
    );
    super::insert_value(
        &mut dict,
        "IPv6",
        Value::new(ipv6_dict(&snapshot.ipv6_method, snapshot)),
    );
    super::insert_value(
        &mut dict,
        "IPv6.Configuration",
        Value::new(ipv6_dict(&snapshot.ipv6_method, snapshot)),
    );

    super::insert_value(
        &mut dict,
        "Nameservers",
        Value::from(snapshot.effective_nameservers.clone()),
    );
    super::insert_value(
        &mut dict,
        "Nameservers.Configuration",
        Value::from(snapshot.nameservers_config.clone()),
    );
    super::insert_value(&mut dict, "Domains", Value::from(snapshot.domains.clone()));
    super::insert_value(
        &mut dict,
        "Domains.Configuration",
        Value::from(snapshot.domains.clone()),
    );
    super::insert_value(&mut dict, "Proxy", Value::new(proxy_dict(snapshot, false)));
    super::insert_value(
        &mut dict,
        "Proxy.Configuration",
        Value::new(proxy_dict(snapshot, true)),
    );

    dict
}

/// Value for one named property, used when emitting PropertyChanged.
pub fn property_value(snapshot: &ServiceSnapshot, name: &str) -> Option<Value<'static>> {
    match name {
        "State" => Some(Value::from(snapshot.state.as_str().to_string())),
        "Error" => Some(Value::from(snapshot.error.as_str().to_string())),
        "Strength" => Some(Value::from(snapshot.strength)),
        "Favorite" => Some(Value::from(snapshot.favorite)),
        "AutoConnect" => Some(Value::from(snapshot.autoconnect)),
        "LoginRequired" => Some(Value::from(snapshot.login_required)),
        "Passphrase" => Some(Value::from(
            snapshot.passphrase.clone().unwrap_or_default(),
        )),
        "Nameservers.Configuration" => {
            Some(Value::from(snapshot.nameservers_config.clone()))
        }
        "Domains.Configuration" => Some(Value::from(snapshot.domains.clone())),
        "Proxy.Configuration" => Some(Value::new(proxy_dict(snapshot, true))),
        "IPv4.Configuration" => Some(Value::new(ipv4_dict(&snapshot.ipv4_method, snapshot))),
        "IPv6.Configuration" => Some(Value::new(ipv6_dict(&snapshot.ipv6_method, snapshot))),
        _ => None,
    }
}

fn value_to_string(value: &Value<'_>) -> Result<String, BusError> {
    String::try_from(value.clone())
        .map_err(|_| BusError::InvalidArguments("expected a string".into()))
}

fn value_to_string_list(value: &Value<'_>) -> Result<Vec<String>, BusError> {
    Vec::<String>::try_from(value.clone())
        .map_err(|_| BusError::InvalidArguments("expected a string array".into()))
}

fn value_to_dict(value: &Value<'_>) -> Result<HashMap<String, OwnedValue>, BusError> {
    HashMap::<String, OwnedValue>::try_from(value.clone())
        .map_err(|_| BusError::InvalidArguments("expected a dictionary".into()))
}

fn dict_string(dict: &HashMap<String, OwnedValue>, key: &str) -> Option<String> {
    dict.get(key)
        .and_then(|value| String::try_from(value.clone()).ok())
}

fn netmask_to_prefix(netmask: &str) -> Option<u8> {
    netmask
        .parse::<Ipv4Addr>()
        .ok()
        .map(|mask| u32::from(mask).count_ones() as u8)
}

fn ident_from_path(path: &OwnedObjectPath) -> Result<String, BusError> {
    path.as_str()
        .strip_prefix(crate::service::SERVICE_PATH_PREFIX)
        .map(str::to_string)
        .ok_or_else(|| BusError::InvalidService(format!("path {}", path)))
}

#[interface(name = "net.connctl.Service")]
impl ServiceObject {
    async fn get_properties(&self) -> Result<HashMap<String, OwnedValue>, BusError> {
        Ok(properties(&self.snapshot().await?))
    }

    async fn set_property(&self, name: &str, value: Value<'_>) -> Result<(), BusError> {
        debug!("SetProperty {} on {}", name, self.ident);

        match name {
            "AutoConnect" => {
                let enabled = bool::try_from(&value)
                    .map_err(|_| BusError::InvalidArguments("expected a bool".into()))?;
                self.services
                    .set_autoconnect(&self.ident, enabled)
                    .await
                    .map_err(BusError::from)
            }
            "Passphrase" => {
                let passphrase = value_to_string(&value)?;
                let passphrase = (!passphrase.is_empty()).then_some(passphrase);
                self.services
                    .set_passphrase(&self.ident, passphrase)
                    .await
                    .map_err(BusError::from)
            }
            "Nameservers.Configuration" => {
                let mut nameservers = value_to_string_list(&value)?;
                nameservers.retain(|entry| !entry.is_empty());
                self.services
                    .set_nameservers_config(&self.ident, nameservers)
                    .await
                    .map_err(BusError::from)
            }
            "Domains.Configuration" => {
                let mut domains = value_to_string_list(&value)?;
                domains.retain(|entry| !entry.is_empty());
                self.services
                    .set_domains_config(&self.ident, domains)
                    .await
                    .map_err(BusError::from)
            }
            "Proxy.Configuration" => {
                let dict = value_to_dict(&value)?;
                let method = ProxyMethod::from_str(
                    &dict_string(&dict, "Method").unwrap_or_default(),
                );
                let servers = dict
                    .get("Servers")
                    .and_then(|value| Vec::<String>::try_from(value.clone()).ok())
                    .unwrap_or_default();
                let excludes = dict
                    .get("Excludes")
                    .and_then(|value| Vec::<String>::try_from(value.clone()).ok())
                    .unwrap_or_default();
                let url = dict_string(&dict, "URL");
                self.services
                    .set_proxy_config(&self.ident, method, servers, excludes, url)
                    .await
                    .map_err(BusError::from)
            }
            "IPv4.Configuration" => {
                let dict = value_to_dict(&value)?;
                let settings = IpconfigSettings {
                    method: dict_string(&dict, "Method").unwrap_or_default(),
                    address: dict_string(&dict, "Address"),
                    prefixlen: dict_string(&dict, "Netmask")
                        .as_deref()
                        .and_then(netmask_to_prefix),
                    gateway: dict_string(&dict, "Gateway"),
                };
                self.services
                    .set_ipconfig(&self.ident, IpconfigType::Ipv4, settings)
                    .await
                    .map_err(BusError::from)
            }
            "IPv6.Configuration" => {
                let dict = value_to_dict(&value)?;
                let settings = IpconfigSettings {
                    method: dict_string(&dict, "Method").unwrap_or_default(),
                    address: dict_string(&dict, "Address"),
                    prefixlen: dict
                        .get("PrefixLength")
                        .and_then(|value| u8::try_from(value.clone()).ok()),
                    gateway: dict_string(&dict, "Gateway"),
                };
                self.services
                    .set_ipconfig(&self.ident, IpconfigType::Ipv6, settings)
                    .await
                    .map_err(BusError::from)
            }
            _ => Err(BusError::InvalidProperty(format!("property {}", name))),
        }
    }

    async fn clear_property(&self, name: &str) -> Result<(), BusError> {
        match name {
            "Error" => self
                .services
                .clear_error(&self.ident)
                .await
                .map_err(BusError::from),
            _ => Err(BusError::InvalidProperty(format!("property {}", name))),
        }
    }

    /// User connect; replies when the service is ready or the attempt
    /// fails.
    async fn connect(&self) -> Result<(), BusError> {
        self.services
            .connect(&self.ident)
            .await
            .map_err(BusError::from)
    }

    async fn disconnect(&self) -> Result<(), BusError> {
        self.services
            .disconnect(&self.ident)
            .await
            .map_err(BusError::from)
    }

    async fn remove(&self) -> Result<(), BusError> {
        self.services
            .remove(&self.ident)
            .await
            .map_err(BusError::from)
    }

    async fn move_before(&self, service: OwnedObjectPath) -> Result<(), BusError> {
        let target = ident_from_path(&service)?;
        self.services
            .move_service(&self.ident, &target, true)
            .await
            .map_err(BusError::from)
    }

    async fn move_after(&self, service: OwnedObjectPath) -> Result<(), BusError> {
        let target = ident_from_path(&service)?;
        self.services
            .move_service(&self.ident, &target, false)
            .await
            .map_err(BusError::from)
    }

    async fn reset_counters(&self) -> Result<(), BusError> {
        self.services
            .reset_counters(&self.ident)
            .await
            .map_err(BusError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_netmask_conversion() {
        assert_eq!(prefix_to_netmask(24), "255.255.255.0");
        assert_eq!(prefix_to_netmask(16), "255.255.0.0");
        assert_eq!(netmask_to_prefix("255.255.255.0"), Some(24));
        assert_eq!(netmask_to_prefix("bogus"), None);
    }

    #[test]
    fn test_ident_from_path() {
        let path = OwnedObjectPath::try_from("/net/connctl/service/wifi_a_b_managed_psk").unwrap();
        assert_eq!(ident_from_path(&path).unwrap(), "wifi_a_b_managed_psk");

        let bad = OwnedObjectPath::try_from("/somewhere/else").unwrap();
        assert!(ident_from_path(&bad).is_err());
    }
}

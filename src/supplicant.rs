//! Supplicant RPC helpers
//!
//! Thin typed wrappers around asynchronous property Get/GetAll/Set and
//! plain method calls against the supplicant's bus service. Callers build
//! their arguments in a setup closure whose failure is surfaced instead of
//! sending a half-built message. `property_foreach` walks a returned
//! property dictionary, recursing into the nested `Properties` sub-dict
//! the supplicant hands back for interface capabilities.

use crate::error::{ConnError, ConnResult};
use serde::Serialize;
use std::collections::HashMap;
use tracing::debug;
use zbus::zvariant::{DynamicType, OwnedValue, Value};
use zbus::Connection;

const PROPERTIES_INTERFACE: &str = "org.freedesktop.DBus.Properties";

pub struct SupplicantBus {
    connection: Option<Connection>,
    service: String,
}

impl SupplicantBus {
    pub fn new(connection: Connection, service: &str) -> Self {
        Self {
            connection: Some(connection),
            service: service.to_string(),
        }
    }

    /// Helper without a live connection; every call fails with an invalid
    /// argument, matching the contract for an unconfigured helper.
    pub fn disconnected(service: &str) -> Self {
        Self {
            connection: None,
            service: service.to_string(),
        }
    }

    fn connection(&self) -> ConnResult<&Connection> {
        self.connection
            .as_ref()
            .ok_or_else(|| ConnError::InvalidArgument("no bus connection".into()))
    }

    fn check_strings(values: &[&str]) -> ConnResult<()> {
        if values.iter().any(|value| value.is_empty()) {
            return Err(ConnError::InvalidArgument("empty bus argument".into()));
        }
        Ok(())
    }

    /// GetAll on the given interface; the reply is the full property dict.
    pub async fn property_get_all(
        &self,
        path: &str,
        interface: &str,
    ) -> ConnResult<HashMap<String, OwnedValue>> {
        Self::check_strings(&[path, interface])?;
        let connection = self.connection()?;

        let reply = connection
            .call_method(
                Some(self.service.as_str()),
                path,
                Some(PROPERTIES_INTERFACE),
                "GetAll",
                &(interface,),
            )
            .await
            .map_err(map_call_error)?;

        reply
            .body()
            .deserialize()
            .map_err(|e| ConnError::Protocol(format!("GetAll reply: {}", e)))
    }

    /// Get one property as a variant.
    pub async fn property_get(
        &self,
        path: &str,
        interface: &str,
        name: &str,
    ) -> ConnResult<OwnedValue> {
        Self::check_strings(&[path, interface, name])?;
        let connection = self.connection()?;

        let reply = connection
            .call_method(
                Some(self.service.as_str()),
                path,
                Some(PROPERTIES_INTERFACE),
                "Get",
                &(interface, name),
            )
            .await
            .map_err(map_call_error)?;

        reply
            .body()
            .deserialize::<OwnedValue>()
            .map_err(|e| ConnError::Protocol(format!("Get reply: {}", e)))
    }

    /// Set one property; the setup closure produces the value and its
    /// failure aborts the call before anything is sent.
    pub async fn property_set<'a>(
        &self,
        path: &str,
        interface: &str,
        name: &str,
        setup: impl FnOnce() -> ConnResult<Value<'a>>,
    ) -> ConnResult<()> {
        Self::check_strings(&[path, interface, name])?;
        let value = setup()?;
        let connection = self.connection()?;

        connection
            .call_method(
                Some(self.service.as_str()),
                path,
                Some(PROPERTIES_INTERFACE),
                "Set",
                &(interface, name, value),
            )
            .await
            .map_err(map_call_error)?;
        Ok(())
    }

    /// Plain method call; the setup closure builds the body.
    pub async fn method_call<B>(
        &self,
        path: &str,
        interface: &str,
        method: &str,
        setup: impl FnOnce() -> ConnResult<B>,
    ) -> ConnResult<zbus::Message>
    where
        B: Serialize + DynamicType,
    {
        Self::check_strings(&[path, interface, method])?;
        let body = setup()?;
        let connection = self.connection()?;

        debug!("supplicant call {}.{} on {}", interface, method, path);
        connection
            .call_method(
                Some(self.service.as_str()),
                path,
                Some(interface),
                method,
                &body,
            )
            .await
            .map_err(map_call_error)
    }
}

fn map_call_error(error: zbus::Error) -> ConnError {
    match error {
        zbus::Error::MethodError(name, detail, _) => ConnError::Transport(format!(
            "{}: {}",
            name.as_str(),
            detail.unwrap_or_default()
        )),
        zbus::Error::InputOutput(e) => ConnError::Io(std::io::Error::new(e.kind(), e.to_string())),
        other => ConnError::Transport(other.to_string()),
    }
}

/// Walk a property dictionary: `(Some(key), Some(value))` per entry, with
/// nested `Properties` dictionaries flattened in, then one terminal
/// `(None, None)` call after the last entry.
pub fn property_foreach(
    properties: &HashMap<String, OwnedValue>,
    callback: &mut dyn FnMut(Option<&str>, Option<&OwnedValue>),
) {
    walk_properties(properties, callback);
    callback(None, None);
}

fn walk_properties(
    properties: &HashMap<String, OwnedValue>,
    callback: &mut dyn FnMut(Option<&str>, Option<&OwnedValue>),
) {
    for (key, value) in properties {
        if key == "Properties" {
            if let Ok(nested) = HashMap::<String, OwnedValue>::try_from(value.clone()) {
                walk_properties(&nested, callback);
                continue;
            }
        }
        callback(Some(key), Some(value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_disconnected_helper_rejects_calls() {
        let bus = SupplicantBus::disconnected("fi.w1.wpa_supplicant1");
        let err = bus
            .property_get("/fi/w1/wpa_supplicant1", "fi.w1.wpa_supplicant1", "State")
            .await
            .unwrap_err();
        assert!(matches!(err, ConnError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_empty_argument_rejected() {
        let bus = SupplicantBus::disconnected("fi.w1.wpa_supplicant1");
        let err = bus.property_get_all("", "iface").await.unwrap_err();
        assert!(matches!(err, ConnError::InvalidArgument(_)));
    }

    #[test]
    fn test_property_foreach_flattens_nested_properties() {
        let mut nested = HashMap::new();
        nested.insert(
            "Scan".to_string(),
            OwnedValue::try_from(Value::from("active")).unwrap(),
        );

        let mut properties: HashMap<String, OwnedValue> = HashMap::new();
        properties.insert(
            "State".to_string(),
            OwnedValue::try_from(Value::from("completed")).unwrap(),
        );
        properties.insert(
            "Properties".to_string(),
            OwnedValue::try_from(Value::new(nested)).unwrap(),
        );

        let mut seen = Vec::new();
        let mut terminal = 0;
        property_foreach(&properties, &mut |key, value| match key {
            Some(key) => {
                assert!(value.is_some());
                seen.push(key.to_string());
            }
            None => {
                assert!(value.is_none());
                terminal += 1;
            }
        });

        seen.sort();
        assert_eq!(seen, vec!["Scan".to_string(), "State".to_string()]);
        assert_eq!(terminal, 1);
    }

    #[test]
    fn test_setup_failure_surfaces() {
        // The closure runs before any message goes out; its error comes
        // straight back.
        let bus = SupplicantBus::disconnected("fi.w1.wpa_supplicant1");
        let result = futures::executor::block_on(bus.property_set(
            "/path",
            "iface",
            "Name",
            || Err(ConnError::InvalidArgument("bad value".into())),
        ));
        assert!(matches!(result, Err(ConnError::InvalidArgument(_))));
    }
}

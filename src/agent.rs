//! Agent peer proxy
//!
//! The agent is an external bus peer that answers credential prompts and
//! shows connection errors to the user. One agent registers at a time; its
//! unique bus name and object path come from RegisterAgent and every call
//! goes out as an asynchronous method call against that peer.

use crate::error::{ConnError, ConnResult};
use crate::service::{AgentReply, CredentialAgent};
use async_trait::async_trait;
use std::collections::HashMap;
use tracing::debug;
use zbus::zvariant::{OwnedValue, Value};
use zbus::Connection;

pub const AGENT_INTERFACE: &str = "net.connctl.Agent";
const AGENT_RETRY_ERROR: &str = "net.connctl.Agent.Error.Retry";

pub struct AgentProxy {
    connection: Connection,
    sender: String,
    path: zbus::zvariant::OwnedObjectPath,
}

impl AgentProxy {
    pub fn new(
        connection: Connection,
        sender: &str,
        path: zbus::zvariant::OwnedObjectPath,
    ) -> Self {
        Self {
            connection,
            sender: sender.to_string(),
            path,
        }
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    pub fn path(&self) -> &zbus::zvariant::OwnedObjectPath {
        &self.path
    }

    /// RequestInput with a field description dict; the reply maps field
    /// names to entered values.
    async fn request_input(
        &self,
        service_path: &str,
        fields: &[&str],
    ) -> ConnResult<HashMap<String, String>> {
        let mut request: HashMap<&str, HashMap<&str, Value>> = HashMap::new();
        for field in fields {
            let mut spec = HashMap::new();
            spec.insert("Type", Value::from(field_type(field)));
            spec.insert("Requirement", Value::from("mandatory"));
            request.insert(*field, spec);
        }

        let path = zbus::zvariant::ObjectPath::try_from(service_path)
            .map_err(|_| ConnError::InvalidArgument(format!("path {}", service_path)))?;

        let reply = self
            .connection
            .call_method(
                Some(self.sender.as_str()),
                self.path.as_ref(),
                Some(AGENT_INTERFACE),
                "RequestInput",
                &(path, request),
            )
            .await
            .map_err(|e| match e {
                zbus::Error::MethodError(name, _, _) => {
                    debug!("agent declined input: {}", name);
                    ConnError::NoKey
                }
                other => ConnError::Transport(format!("agent call: {}", other)),
            })?;

        let values: HashMap<String, OwnedValue> = reply
            .body()
            .deserialize()
            .map_err(|e| ConnError::Protocol(format!("agent reply: {}", e)))?;

        let mut result = HashMap::new();
        for (key, value) in values {
            if let Ok(text) = String::try_from(value) {
                result.insert(key, text);
            }
        }
        Ok(result)
    }
}

fn field_type(field: &str) -> &'static str {
    match field {
        "Passphrase" => "psk",
        "Password" => "password",
        _ => "string",
    }
}

#[async_trait]
impl CredentialAgent for AgentProxy {
    async fn request_passphrase(&self, ident: &str, _name: Option<&str>) -> ConnResult<AgentReply> {
        let service_path = format!("{}{}", crate::service::SERVICE_PATH_PREFIX, ident);
        let reply = self
            .request_input(&service_path, &["Passphrase", "Identity"])
            .await?;

        Ok(AgentReply {
            identity: reply.get("Identity").cloned(),
            passphrase: reply.get("Passphrase").cloned(),
        })
    }

    async fn request_login(&self, ident: &str) -> ConnResult<(String, String)> {
        let service_path = format!("{}{}", crate::service::SERVICE_PATH_PREFIX, ident);
        let reply = self
            .request_input(&service_path, &["Username", "Password"])
            .await?;

        match (reply.get("Username"), reply.get("Password")) {
            (Some(username), Some(password)) => Ok((username.clone(), password.clone())),
            _ => Err(ConnError::NoKey),
        }
    }

    async fn report_error(&self, ident: &str, error: &str) -> ConnResult<bool> {
        let service_path = format!("{}{}", crate::service::SERVICE_PATH_PREFIX, ident);
        let path = zbus::zvariant::ObjectPath::try_from(service_path.as_str())
            .map_err(|_| ConnError::InvalidArgument(format!("path {}", service_path)))?;

        let result = self
            .connection
            .call_method(
                Some(self.sender.as_str()),
                self.path.as_ref(),
                Some(AGENT_INTERFACE),
                "ReportError",
                &(path, error),
            )
            .await;

        match result {
            Ok(_) => Ok(false),
            Err(zbus::Error::MethodError(name, _, _)) => Ok(name.as_str() == AGENT_RETRY_ERROR),
            Err(e) => Err(ConnError::Transport(format!("agent call: {}", e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_types() {
        assert_eq!(field_type("Passphrase"), "psk");
        assert_eq!(field_type("Password"), "password");
        assert_eq!(field_type("Username"), "string");
    }
}

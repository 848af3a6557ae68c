//! Host representation and its mapping onto connection parameters.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::connection::{ConnectionInfo, ConnectionKind};
use crate::vars::VarMap;

/// A target host in the inventory. `name` is the primary key; the address
/// defaults to the name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Host {
    /// Inventory name (unique)
    pub name: String,
    /// Address to connect to; empty means the name
    pub address: String,
    /// Port; 0 means the transport default
    pub port: u16,
    /// Login user
    pub user: String,
    /// Password, when password auth applies
    pub password: Option<String>,
    /// Private key path, when key auth applies
    pub private_key: Option<String>,
    /// Groups this host belongs to
    pub groups: Vec<String>,
    /// Host variables
    pub variables: VarMap,
}

impl Host {
    /// Create a host named `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// The address to connect to: explicit address, else the name.
    pub fn effective_address(&self) -> &str {
        if self.address.is_empty() {
            &self.name
        } else {
            &self.address
        }
    }

    /// Set a host variable, mapping the `ansible_*` connection variables
    /// onto the strongly-typed fields.
    pub fn set_variable(&mut self, key: &str, value: JsonValue) {
        match key {
            "ansible_host" => {
                if let Some(s) = value.as_str() {
                    self.address = s.to_string();
                }
            }
            "ansible_port" => {
                if let Some(p) = value.as_u64() {
                    self.port = p as u16;
                }
            }
            "ansible_user" => {
                if let Some(s) = value.as_str() {
                    self.user = s.to_string();
                }
            }
            "ansible_password" => {
                if let Some(s) = value.as_str() {
                    self.password = Some(s.to_string());
                }
            }
            "ansible_ssh_private_key_file" => {
                if let Some(s) = value.as_str() {
                    self.private_key = Some(s.to_string());
                }
            }
            _ => {}
        }
        self.variables.insert(key.to_string(), value);
    }

    /// Build the connection parameters for this host.
    pub fn connection_info(&self) -> ConnectionInfo {
        let kind = match self
            .variables
            .get("ansible_connection")
            .and_then(JsonValue::as_str)
        {
            Some("local") => ConnectionKind::Local,
            Some("winrm") => ConnectionKind::Winrm,
            Some("ssh") => ConnectionKind::Ssh,
            _ => ConnectionKind::Unspecified,
        };
        let use_ssl = matches!(
            self.variables.get("ansible_winrm_ssl"),
            Some(JsonValue::Bool(true))
        );
        ConnectionInfo {
            kind,
            host: self.effective_address().to_string(),
            port: self.port,
            user: self.user.clone(),
            password: self.password.clone(),
            private_key: self.private_key.clone(),
            use_ssl,
            skip_verify: false,
            timeout: 0,
            variables: self.variables.clone(),
        }
    }
}

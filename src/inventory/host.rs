//! Host definition.
//!
//! A `Host` is an execution target: where to connect, as whom, which
//! variables apply, and which groups it belongs to.

use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{Error, Result};

/// A managed node
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Host {
    /// Inventory name
    pub name: String,
    /// Address to connect to, if different from the name
    #[serde(default)]
    pub address: Option<String>,
    /// Port override
    #[serde(default)]
    pub port: Option<u16>,
    /// Remote user
    #[serde(default)]
    pub user: Option<String>,
    /// Host-scoped variables
    #[serde(default)]
    pub variables: IndexMap<String, JsonValue>,
    /// Groups this host belongs to
    #[serde(default)]
    pub groups: Vec<String>,
}

impl Host {
    /// Create a new host with the given name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set the connection address
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    /// Set the port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Set the remote user
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Set a host variable
    pub fn with_var(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }

    /// Add the host to a group
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.add_to_group(group);
        self
    }

    /// Address to connect to, falling back to the name
    pub fn address(&self) -> &str {
        self.address.as_deref().unwrap_or(&self.name)
    }

    /// Add the host to a group (no-op if already a member)
    pub fn add_to_group(&mut self, group: impl Into<String>) {
        let group = group.into();
        if !self.groups.contains(&group) {
            self.groups.push(group);
        }
    }

    /// Check if host is in a group
    pub fn in_group(&self, group: &str) -> bool {
        self.groups.iter().any(|g| g == group)
    }

    /// Parse an inventory line such as `web1 ansible_host=10.0.0.1 ansible_port=2222`
    pub fn parse(input: &str) -> Result<Self> {
        let mut parts = input.split_whitespace();
        let name = parts
            .next()
            .ok_or_else(|| Error::Inventory("empty host definition".to_string()))?;
        let mut host = Host::new(name);

        for part in parts {
            let Some((key, value)) = part.split_once('=') else {
                return Err(Error::Inventory(format!(
                    "expected key=value in host definition, found '{}'",
                    part
                )));
            };
            match key {
                "ansible_host" => host.address = Some(value.to_string()),
                "ansible_port" => {
                    host.port = Some(value.parse().map_err(|_| {
                        Error::Inventory(format!("invalid port '{}' for host '{}'", value, name))
                    })?);
                }
                "ansible_user" => host.user = Some(value.to_string()),
                _ => {
                    host.variables
                        .insert(key.to_string(), JsonValue::String(value.to_string()));
                }
            }
        }

        Ok(host)
    }
}

impl PartialEq for Host {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for Host {}

impl std::hash::Hash for Host {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if let Some(addr) = &self.address {
            write!(f, " ({})", addr)?;
        }
        Ok(())
    }
}

//! Host resolution.
//!
//! The engine only consumes `get_hosts(pattern)`. [`StaticInventory`] is an
//! in-memory implementation understanding `all`, host names, group names
//! and comma-separated unions of those.

mod host;

pub use host::Host;

use indexmap::IndexMap;

use crate::error::{Error, Result};

/// Resolves host patterns to hosts.
pub trait Inventory: Send + Sync {
    /// Hosts matching `pattern`, in inventory order
    fn get_hosts(&self, pattern: &str) -> Result<Vec<Host>>;
}

/// An inventory held in memory.
#[derive(Debug, Clone, Default)]
pub struct StaticInventory {
    hosts: IndexMap<String, Host>,
}

impl StaticInventory {
    /// Create an empty inventory
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a host
    pub fn add_host(&mut self, host: Host) {
        self.hosts.insert(host.name.clone(), host);
    }

    /// Add a host, builder style
    pub fn with_host(mut self, host: Host) -> Self {
        self.add_host(host);
        self
    }

    /// Get a host by name
    pub fn get_host(&self, name: &str) -> Option<&Host> {
        self.hosts.get(name)
    }

    /// Number of hosts
    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    /// Check if the inventory has no hosts
    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    fn matching(&self, term: &str) -> Vec<&Host> {
        if term == "all" || term == "*" {
            return self.hosts.values().collect();
        }
        if let Some(host) = self.hosts.get(term) {
            return vec![host];
        }
        self.hosts.values().filter(|h| h.in_group(term)).collect()
    }
}

impl Inventory for StaticInventory {
    fn get_hosts(&self, pattern: &str) -> Result<Vec<Host>> {
        let pattern = pattern.trim();
        if pattern.is_empty() {
            return Err(Error::Inventory("empty host pattern".to_string()));
        }

        let mut selected: IndexMap<&str, &Host> = IndexMap::new();
        for term in pattern.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            let hosts = self.matching(term);
            if hosts.is_empty() {
                return Err(Error::Inventory(format!(
                    "pattern '{}' matched no hosts",
                    term
                )));
            }
            for host in hosts {
                selected.entry(host.name.as_str()).or_insert(host);
            }
        }

        Ok(selected.into_values().cloned().collect())
    }
}

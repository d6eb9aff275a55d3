//! Layered, copy-on-write variable scope.
//!
//! ```text
//! Global Scope (play vars, extra vars)
//!   └── Host Scope (inventory host vars)
//!         └── Registered Scope (results bound by `register`)
//!               └── Loop Scope (item, index_var, ansible_loop)
//!                     └── Result Scope (rc, stdout, ... for failed_when/until)
//! ```
//!
//! Later layers shadow earlier ones. Layers are shared behind `Arc`, so
//! deriving a child scope is a pointer copy plus the new layer.

use std::fmt;
use std::sync::Arc;

use serde_json::Value as JsonValue;

use super::{parse_path, resolve_segments, VarMap};

/// Scope level in the execution hierarchy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScopeLevel {
    /// Variables passed to the runner for every host
    Global,
    /// Variables of one inventory host
    Host,
    /// Results bound by `register` on earlier tasks
    Registered,
    /// Loop iteration variables (item, index_var, ansible_loop)
    Loop,
    /// Result fields exposed to failed_when / changed_when / until
    Result,
}

impl fmt::Display for ScopeLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScopeLevel::Global => "global",
            ScopeLevel::Host => "host",
            ScopeLevel::Registered => "registered",
            ScopeLevel::Loop => "loop",
            ScopeLevel::Result => "result",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone)]
struct Layer {
    level: ScopeLevel,
    vars: Arc<VarMap>,
}

/// An immutable stack of variable layers.
#[derive(Debug, Clone, Default)]
pub struct VariableScope {
    layers: Vec<Layer>,
}

impl VariableScope {
    /// Create an empty scope
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a scope with a single global layer
    pub fn from_vars(vars: VarMap) -> Self {
        Self::new().with_layer(ScopeLevel::Global, vars)
    }

    /// Derive a child scope with `vars` layered on top
    #[must_use]
    pub fn with_layer(&self, level: ScopeLevel, vars: VarMap) -> Self {
        self.with_shared_layer(level, Arc::new(vars))
    }

    /// Derive a child scope reusing an already shared layer
    #[must_use]
    pub fn with_shared_layer(&self, level: ScopeLevel, vars: Arc<VarMap>) -> Self {
        if vars.is_empty() {
            return self.clone();
        }
        let mut layers = self.layers.clone();
        layers.push(Layer { level, vars });
        Self { layers }
    }

    /// Look up a top-level variable, innermost layer first
    pub fn get(&self, name: &str) -> Option<&JsonValue> {
        self.layers.iter().rev().find_map(|layer| layer.vars.get(name))
    }

    /// Check if a top-level variable is defined in any layer
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Resolve a dotted/indexed path such as `config.database.host` or `items[0]`
    pub fn lookup_path(&self, path: &str) -> Option<&JsonValue> {
        let (root, segments) = parse_path(path)?;
        resolve_segments(self.get(&root)?, &segments)
    }

    /// The level of the innermost layer defining `name`
    pub fn level_of(&self, name: &str) -> Option<ScopeLevel> {
        self.layers
            .iter()
            .rev()
            .find(|layer| layer.vars.contains_key(name))
            .map(|layer| layer.level)
    }

    /// Merge all layers into one map (innermost wins)
    pub fn flatten(&self) -> VarMap {
        let mut merged = VarMap::new();
        for layer in &self.layers {
            for (key, value) in layer.vars.iter() {
                merged.insert(key.clone(), value.clone());
            }
        }
        merged
    }

    /// Number of layers
    pub fn depth(&self) -> usize {
        self.layers.len()
    }

    /// Check if the scope has no variables at all
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

impl From<VarMap> for VariableScope {
    fn from(vars: VarMap) -> Self {
        Self::from_vars(vars)
    }
}

//! Module system.
//!
//! A module performs one idempotent action on a host through a
//! [`Connection`]. The runner looks modules up in a [`ModuleRegistry`] by
//! [`ModuleKind`], validates task arguments with [`Module::validate`] before
//! any dispatch, and inspects [`Module::capabilities`] to decide how to
//! treat check mode.

pub mod assert;
pub mod command;
pub mod debug;
pub mod fail;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::connection::{Connection, ConnectionError};
use crate::error::{Error, Result};
use crate::vars::VariableScope;

/// Errors that can occur during module execution
#[derive(Error, Debug)]
pub enum ModuleError {
    /// Invalid parameter value
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Missing required parameter
    #[error("Missing required parameter: {0}")]
    MissingParameter(String),

    /// Execution failed
    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    /// Command returned non-zero exit code
    #[error("Command failed with exit code {code}: {message}")]
    CommandFailed {
        /// Exit code
        code: i32,
        /// Error output
        message: String,
    },

    /// Transport failure while talking to the host
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Unsupported operation
    #[error("Unsupported operation: {0}")]
    Unsupported(String),
}

/// Result type for module operations
pub type ModuleResult<T> = std::result::Result<T, ModuleError>;

/// Status of a module execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleStatus {
    /// Task made changes
    Changed,
    /// Task ran successfully, no changes needed
    Ok,
    /// Task failed
    Failed,
    /// Task was skipped
    Skipped,
}

impl fmt::Display for ModuleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleStatus::Changed => write!(f, "changed"),
            ModuleStatus::Ok => write!(f, "ok"),
            ModuleStatus::Failed => write!(f, "failed"),
            ModuleStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// Difference between current and desired state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diff {
    /// Description of the current state
    pub before: String,
    /// Description of the desired state
    pub after: String,
    /// Optional prepared diff text
    pub details: Option<String>,
}

impl Diff {
    /// Create a new diff
    pub fn new(before: impl Into<String>, after: impl Into<String>) -> Self {
        Self {
            before: before.into(),
            after: after.into(),
            details: None,
        }
    }

    /// Attach a prepared diff
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// Result of a module execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleOutput {
    /// Whether the module made any changes
    pub changed: bool,
    /// Human-readable message
    pub msg: String,
    /// Status of the execution
    pub status: ModuleStatus,
    /// Optional diff
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diff: Option<Diff>,
    /// Module-specific payload
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub data: IndexMap<String, JsonValue>,
    /// Standard output, for command-like modules
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    /// Standard error, for command-like modules
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    /// Exit code, for command-like modules
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rc: Option<i32>,
}

impl ModuleOutput {
    fn with_status(status: ModuleStatus, changed: bool, msg: String) -> Self {
        Self {
            changed,
            msg,
            status,
            diff: None,
            data: IndexMap::new(),
            stdout: None,
            stderr: None,
            rc: None,
        }
    }

    /// Create a new successful output with no changes
    pub fn ok(msg: impl Into<String>) -> Self {
        Self::with_status(ModuleStatus::Ok, false, msg.into())
    }

    /// Create a new successful output with changes
    pub fn changed(msg: impl Into<String>) -> Self {
        Self::with_status(ModuleStatus::Changed, true, msg.into())
    }

    /// Create a failed output
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::with_status(ModuleStatus::Failed, false, msg.into())
    }

    /// Create a skipped output
    pub fn skipped(msg: impl Into<String>) -> Self {
        Self::with_status(ModuleStatus::Skipped, false, msg.into())
    }

    /// Add a diff to the output
    pub fn with_diff(mut self, diff: Diff) -> Self {
        self.diff = Some(diff);
        self
    }

    /// Add data to the output
    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// Add command output
    pub fn with_command_output(
        mut self,
        stdout: Option<String>,
        stderr: Option<String>,
        rc: Option<i32>,
    ) -> Self {
        self.stdout = stdout;
        self.stderr = stderr;
        self.rc = rc;
        self
    }

    /// Check if the module reported failure
    pub fn is_failed(&self) -> bool {
        self.status == ModuleStatus::Failed
    }
}

/// Arguments passed to a module
pub type ModuleArgs = IndexMap<String, JsonValue>;

/// Context handed to a module for one unit of work
#[derive(Debug, Clone, Default)]
pub struct ModuleContext {
    /// Host the unit targets
    pub host: String,
    /// Name of the task being executed
    pub task_name: String,
    /// Whether to run in check mode (dry run)
    pub check_mode: bool,
    /// Whether to show diffs
    pub diff_mode: bool,
    /// Output verbosity requested by the caller
    pub verbosity: u8,
    /// Variables visible to the unit
    pub vars: VariableScope,
}

impl ModuleContext {
    /// Create a context for `host`
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Default::default()
        }
    }

    /// Set check mode
    pub fn with_check_mode(mut self, check_mode: bool) -> Self {
        self.check_mode = check_mode;
        self
    }

    /// Set diff mode
    pub fn with_diff_mode(mut self, diff_mode: bool) -> Self {
        self.diff_mode = diff_mode;
        self
    }

    /// Set variables
    pub fn with_vars(mut self, vars: VariableScope) -> Self {
        self.vars = vars;
        self
    }
}

/// What a module supports beyond plain execution
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleCapabilities {
    /// The module honours `_check_mode` and reports without changing state
    pub check_mode: bool,
    /// The module can report before/after diffs
    pub diff_mode: bool,
}

/// Documentation for one module option
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionDoc {
    /// Option name
    pub name: String,
    /// Whether the option must be present
    pub required: bool,
    /// What the option does
    pub description: String,
}

/// Module documentation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleDoc {
    /// Module name
    pub name: String,
    /// One-line description
    pub description: String,
    /// Accepted options
    pub options: Vec<OptionDoc>,
    /// Capabilities the module declares
    pub capabilities: ModuleCapabilities,
}

impl ModuleDoc {
    /// Create documentation for a module
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            options: Vec::new(),
            capabilities: ModuleCapabilities::default(),
        }
    }

    /// Document an option
    pub fn option(mut self, name: &str, required: bool, description: &str) -> Self {
        self.options.push(OptionDoc {
            name: name.to_string(),
            required,
            description: description.to_string(),
        });
        self
    }
}

/// Trait that all modules must implement
#[async_trait]
pub trait Module: Send + Sync {
    /// Returns the name of the module
    fn name(&self) -> &'static str;

    /// Returns a description of what the module does
    fn description(&self) -> &'static str;

    /// Execute the module against `connection`.
    ///
    /// Under check mode the runner only calls this for modules whose
    /// capabilities declare check mode support; `context.check_mode` is set
    /// and `args` carries `_check_mode: true`.
    async fn run(
        &self,
        context: &ModuleContext,
        connection: &dyn Connection,
        args: &ModuleArgs,
    ) -> ModuleResult<ModuleOutput>;

    /// Validate the arguments before execution
    fn validate(&self, args: &ModuleArgs) -> ModuleResult<()> {
        for param in self.required_params() {
            if !args.contains_key(*param) {
                return Err(ModuleError::MissingParameter(param.to_string()));
            }
        }
        Ok(())
    }

    /// Returns the list of required parameters
    fn required_params(&self) -> &[&'static str] {
        &[]
    }

    /// Returns what the module supports
    fn capabilities(&self) -> ModuleCapabilities {
        ModuleCapabilities::default()
    }

    /// Returns the module documentation
    fn documentation(&self) -> ModuleDoc {
        let mut doc = ModuleDoc::new(self.name(), self.description());
        for param in self.required_params() {
            doc = doc.option(param, true, "");
        }
        doc.capabilities = self.capabilities();
        doc
    }
}

/// Helper trait for extracting parameters
pub trait ParamExt {
    /// Get a string parameter
    fn get_string(&self, key: &str) -> ModuleResult<Option<String>>;
    /// Get a required string parameter
    fn get_string_required(&self, key: &str) -> ModuleResult<String>;
    /// Get a boolean parameter
    fn get_bool(&self, key: &str) -> ModuleResult<Option<bool>>;
    /// Get a boolean parameter with default
    fn get_bool_or(&self, key: &str, default: bool) -> bool;
    /// Get an integer parameter
    fn get_i64(&self, key: &str) -> ModuleResult<Option<i64>>;
    /// Get a list of strings (a comma-separated string is split)
    fn get_vec_string(&self, key: &str) -> ModuleResult<Option<Vec<String>>>;
}

impl ParamExt for ModuleArgs {
    fn get_string(&self, key: &str) -> ModuleResult<Option<String>> {
        match self.get(key) {
            Some(JsonValue::String(s)) => Ok(Some(s.clone())),
            Some(JsonValue::Null) | None => Ok(None),
            Some(v) => Ok(Some(v.to_string())),
        }
    }

    fn get_string_required(&self, key: &str) -> ModuleResult<String> {
        self.get_string(key)?
            .ok_or_else(|| ModuleError::MissingParameter(key.to_string()))
    }

    fn get_bool(&self, key: &str) -> ModuleResult<Option<bool>> {
        match self.get(key) {
            Some(JsonValue::Bool(b)) => Ok(Some(*b)),
            Some(JsonValue::String(s)) => match s.to_lowercase().as_str() {
                "true" | "yes" | "1" | "on" => Ok(Some(true)),
                "false" | "no" | "0" | "off" => Ok(Some(false)),
                _ => Err(ModuleError::InvalidParameter(format!(
                    "{} must be a boolean",
                    key
                ))),
            },
            Some(JsonValue::Null) | None => Ok(None),
            Some(_) => Err(ModuleError::InvalidParameter(format!(
                "{} must be a boolean",
                key
            ))),
        }
    }

    fn get_bool_or(&self, key: &str, default: bool) -> bool {
        self.get_bool(key).ok().flatten().unwrap_or(default)
    }

    fn get_i64(&self, key: &str) -> ModuleResult<Option<i64>> {
        match self.get(key) {
            Some(JsonValue::Number(n)) => n.as_i64().map(Some).ok_or_else(|| {
                ModuleError::InvalidParameter(format!("{} must be an integer", key))
            }),
            Some(JsonValue::String(s)) => s
                .parse()
                .map(Some)
                .map_err(|_| ModuleError::InvalidParameter(format!("{} must be an integer", key))),
            Some(JsonValue::Null) | None => Ok(None),
            Some(_) => Err(ModuleError::InvalidParameter(format!(
                "{} must be an integer",
                key
            ))),
        }
    }

    fn get_vec_string(&self, key: &str) -> ModuleResult<Option<Vec<String>>> {
        match self.get(key) {
            Some(JsonValue::Array(arr)) => Ok(Some(
                arr.iter()
                    .map(|item| match item {
                        JsonValue::String(s) => s.clone(),
                        v => v.to_string(),
                    })
                    .collect(),
            )),
            Some(JsonValue::String(s)) => {
                Ok(Some(s.split(',').map(|s| s.trim().to_string()).collect()))
            }
            Some(JsonValue::Null) | None => Ok(None),
            Some(_) => Err(ModuleError::InvalidParameter(format!(
                "{} must be a list",
                key
            ))),
        }
    }
}

/// Registry key of a module, e.g. `command` or `debug`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModuleKind(String);

impl ModuleKind {
    /// Create a module kind
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The key as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ModuleKind {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl std::borrow::Borrow<str> for ModuleKind {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Registry for looking up modules by kind
#[derive(Default)]
pub struct ModuleRegistry {
    modules: HashMap<ModuleKind, Arc<dyn Module>>,
}

impl fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("modules", &self.names())
            .finish()
    }
}

impl ModuleRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with the built-in logic modules
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(assert::AssertModule));
        registry.register(Arc::new(command::CommandModule));
        registry.register(Arc::new(debug::DebugModule));
        registry.register(Arc::new(fail::FailModule));
        registry
    }

    /// Register a module under its own name, replacing any previous one
    pub fn register(&mut self, module: Arc<dyn Module>) {
        self.modules.insert(ModuleKind::new(module.name()), module);
    }

    /// Get a module by name
    pub fn get(&self, name: &str) -> Option<Arc<dyn Module>> {
        self.modules.get(name).cloned()
    }

    /// Get a module by name or fail with [`Error::ModuleNotFound`]
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Module>> {
        self.get(name)
            .ok_or_else(|| Error::ModuleNotFound(name.to_string()))
    }

    /// Check if a module exists
    pub fn contains(&self, name: &str) -> bool {
        self.modules.contains_key(name)
    }

    /// Get all registered module names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.modules.keys().map(ModuleKind::as_str).collect();
        names.sort_unstable();
        names
    }
}

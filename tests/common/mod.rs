//! Shared test utilities for the Converge test suite.
//!
//! This module provides:
//! - A configurable [`MockModule`] that counts calls, records arguments and
//!   tracks how many calls were in flight at once
//! - A [`MockConnection`] and [`MockConnectionFactory`] that never touch a
//!   real host
//! - Small builders for hosts, variables and runners
//!
//! # Usage
//!
//! ```rust,ignore
//! mod common;
//! use common::*;
//! ```

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde_json::Value as JsonValue;

use converge::connection::{
    BoxedReader, CommandResult, Connection, ConnectionError, ConnectionFactory, ConnectionResult,
    ExecuteOptions,
};
use converge::executor::runner::{RunnerConfig, TaskRunner};
use converge::inventory::Host;
use converge::modules::{
    Module, ModuleArgs, ModuleCapabilities, ModuleContext, ModuleError, ModuleOutput,
    ModuleRegistry, ModuleResult,
};

// ============================================================================
// Helper Functions
// ============================================================================

/// Hosts with the given names
pub fn hosts(names: &[&str]) -> Vec<Host> {
    names.iter().map(|n| Host::new(*n)).collect()
}

/// Variables from a JSON object literal
pub fn vars(value: JsonValue) -> IndexMap<String, JsonValue> {
    match value {
        JsonValue::Object(map) => map.into_iter().collect(),
        other => panic!("expected an object, got {}", other),
    }
}

/// A registry with the built-ins plus `modules`
pub fn registry_with(modules: &[MockModule]) -> Arc<ModuleRegistry> {
    let mut registry = ModuleRegistry::with_builtins();
    for module in modules {
        registry.register(Arc::new(module.clone()));
    }
    Arc::new(registry)
}

/// A runner over mock connections with the built-ins plus `modules`
pub fn runner_with(modules: &[MockModule]) -> TaskRunner {
    TaskRunner::new(registry_with(modules))
        .with_connection_factory(Arc::new(MockConnectionFactory::new()))
}

/// Same as [`runner_with`] with an explicit configuration
pub fn runner_with_config(modules: &[MockModule], config: RunnerConfig) -> TaskRunner {
    runner_with(modules).with_config(config)
}

// ============================================================================
// Mock Module
// ============================================================================

#[derive(Debug, Default)]
struct MockState {
    calls: AtomicU32,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    args: RwLock<Vec<ModuleArgs>>,
    check_mode_calls: AtomicU32,
    hosts: RwLock<Vec<String>>,
}

struct InFlight<'a>(&'a MockState);

impl<'a> InFlight<'a> {
    fn enter(state: &'a MockState) -> Self {
        let now = state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        state.max_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(state)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A module whose behaviour is configured by the test.
///
/// Clones share their counters, so a test can keep a handle after
/// registering the module.
#[derive(Debug, Clone)]
pub struct MockModule {
    name: &'static str,
    outputs: Vec<ModuleOutput>,
    error: Option<String>,
    unreachable: bool,
    check_mode: bool,
    delay: Option<Duration>,
    panic_on_host: Option<String>,
    required_params: Vec<&'static str>,
    state: Arc<MockState>,
}

impl MockModule {
    /// A module returning an unchanged ok output
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            outputs: vec![ModuleOutput::ok("Mock module executed")],
            error: None,
            unreachable: false,
            check_mode: false,
            delay: None,
            panic_on_host: None,
            required_params: Vec::new(),
            state: Arc::new(MockState::default()),
        }
    }

    /// A module that always reports a change
    pub fn changed(name: &'static str) -> Self {
        Self::new(name).with_result(ModuleOutput::changed("Mock module changed something"))
    }

    /// Return `output` on every call
    pub fn with_result(mut self, output: ModuleOutput) -> Self {
        self.outputs = vec![output];
        self
    }

    /// Return the outputs in order, repeating the last one
    pub fn with_sequence(mut self, outputs: Vec<ModuleOutput>) -> Self {
        self.outputs = outputs;
        self
    }

    /// Fail every call with a module error
    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error = Some(message.into());
        self
    }

    /// Fail every call with a connection error
    pub fn unreachable(mut self) -> Self {
        self.unreachable = true;
        self
    }

    /// Declare check mode support
    pub fn with_check_mode(mut self) -> Self {
        self.check_mode = true;
        self
    }

    /// Sleep before answering
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Panic when run against `host`
    pub fn panic_on(mut self, host: impl Into<String>) -> Self {
        self.panic_on_host = Some(host.into());
        self
    }

    /// Require parameters
    pub fn with_required_params(mut self, params: Vec<&'static str>) -> Self {
        self.required_params = params;
        self
    }

    /// Number of calls made
    pub fn calls(&self) -> u32 {
        self.state.calls.load(Ordering::SeqCst)
    }

    /// Number of calls made in check mode
    pub fn check_mode_calls(&self) -> u32 {
        self.state.check_mode_calls.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneous calls observed
    pub fn max_in_flight(&self) -> usize {
        self.state.max_in_flight.load(Ordering::SeqCst)
    }

    /// Arguments of every call, in call order
    pub fn received_args(&self) -> Vec<ModuleArgs> {
        self.state.args.read().clone()
    }

    /// Hosts of every call, in call order
    pub fn received_hosts(&self) -> Vec<String> {
        self.state.hosts.read().clone()
    }
}

#[async_trait]
impl Module for MockModule {
    fn name(&self) -> &'static str {
        self.name
    }

    fn description(&self) -> &'static str {
        "A mock module for testing"
    }

    fn required_params(&self) -> &[&'static str] {
        &self.required_params
    }

    fn capabilities(&self) -> ModuleCapabilities {
        ModuleCapabilities {
            check_mode: self.check_mode,
            diff_mode: self.check_mode,
        }
    }

    async fn run(
        &self,
        context: &ModuleContext,
        _connection: &dyn Connection,
        args: &ModuleArgs,
    ) -> ModuleResult<ModuleOutput> {
        let call = self.state.calls.fetch_add(1, Ordering::SeqCst) as usize;
        if context.check_mode {
            self.state.check_mode_calls.fetch_add(1, Ordering::SeqCst);
        }
        self.state.args.write().push(args.clone());
        self.state.hosts.write().push(context.host.clone());
        let _guard = InFlight::enter(&self.state);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if self.panic_on_host.as_deref() == Some(context.host.as_str()) {
            panic!("mock module panicked on {}", context.host);
        }
        if let Some(message) = &self.error {
            return Err(ModuleError::ExecutionFailed(message.clone()));
        }
        if self.unreachable {
            return Err(ModuleError::Connection(ConnectionError::ConnectionFailed(
                "mock host is down".to_string(),
            )));
        }

        let index = call.min(self.outputs.len().saturating_sub(1));
        Ok(self
            .outputs
            .get(index)
            .cloned()
            .unwrap_or_else(|| ModuleOutput::ok("Mock module executed")))
    }
}

// ============================================================================
// Mock Connection
// ============================================================================

/// A connection that records commands and answers from a table.
#[derive(Debug)]
pub struct MockConnection {
    identifier: String,
    commands: RwLock<Vec<String>>,
    results: RwLock<HashMap<String, CommandResult>>,
    files: RwLock<HashMap<String, Vec<u8>>>,
}

impl MockConnection {
    /// Create a new mock connection with the given identifier.
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            commands: RwLock::new(Vec::new()),
            results: RwLock::new(HashMap::new()),
            files: RwLock::new(HashMap::new()),
        }
    }

    /// Set the result for a specific command.
    pub fn set_command_result(&self, command: impl Into<String>, result: CommandResult) {
        self.results.write().insert(command.into(), result);
    }

    /// Get all commands that were executed.
    pub fn get_commands(&self) -> Vec<String> {
        self.commands.read().clone()
    }
}

#[async_trait]
impl Connection for MockConnection {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    async fn execute(
        &self,
        command: &str,
        _options: Option<ExecuteOptions>,
    ) -> ConnectionResult<CommandResult> {
        self.commands.write().push(command.to_string());
        let configured = self.results.read().get(command).cloned();
        Ok(configured.unwrap_or_else(|| CommandResult::success(String::new(), String::new())))
    }

    async fn copy(
        &self,
        mut reader: BoxedReader,
        dest: &Path,
        _mode: Option<u32>,
    ) -> ConnectionResult<()> {
        use tokio::io::AsyncReadExt;
        let mut content = Vec::new();
        reader.read_to_end(&mut content).await?;
        self.files
            .write()
            .insert(dest.display().to_string(), content);
        Ok(())
    }

    async fn fetch(&self, path: &Path) -> ConnectionResult<BoxedReader> {
        let content = self
            .files
            .read()
            .get(&path.display().to_string())
            .cloned()
            .ok_or_else(|| {
                ConnectionError::TransferFailed(format!("{} not found", path.display()))
            })?;
        Ok(Box::new(std::io::Cursor::new(content)))
    }

    async fn close(&self) -> ConnectionResult<()> {
        Ok(())
    }
}

/// Hands out one shared [`MockConnection`] per host; listed hosts are
/// unreachable.
#[derive(Debug, Default)]
pub struct MockConnectionFactory {
    unreachable: HashSet<String>,
    connect_delay: Option<Duration>,
    connections: RwLock<HashMap<String, Arc<MockConnection>>>,
}

impl MockConnectionFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `host` unreachable
    pub fn with_unreachable(mut self, host: impl Into<String>) -> Self {
        self.unreachable.insert(host.into());
        self
    }

    /// Stall every connection attempt for `delay`
    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = Some(delay);
        self
    }

    /// The connection handed out for `host`, if any
    pub fn connection(&self, host: &str) -> Option<Arc<MockConnection>> {
        self.connections.read().get(host).cloned()
    }
}

#[async_trait]
impl ConnectionFactory for MockConnectionFactory {
    async fn connection_for(&self, host: &Host) -> ConnectionResult<Arc<dyn Connection>> {
        if let Some(delay) = self.connect_delay {
            tokio::time::sleep(delay).await;
        }
        if self.unreachable.contains(&host.name) {
            return Err(ConnectionError::ConnectionFailed(format!(
                "cannot reach {}",
                host.name
            )));
        }
        let connection: Arc<MockConnection> = Arc::clone(
            self.connections
                .write()
                .entry(host.name.clone())
                .or_insert_with(|| Arc::new(MockConnection::new(host.name.clone()))),
        );
        Ok(connection as Arc<dyn Connection>)
    }
}

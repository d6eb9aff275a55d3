//! The task runner.
//!
//! One call to [`TaskRunner::run`] takes a single task through validation,
//! tag selection, loop expansion and a concurrency-bounded fan-out over
//! every (host, item) unit. Each unit evaluates its `when` condition,
//! renders its arguments, intercepts check mode, dispatches the module with
//! retry/until polling and applies `changed_when`/`failed_when`. Results come
//! back in host-then-item order; `register` bindings and handler
//! notifications are applied once the whole fan-out has finished.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde_json::{json, Value as JsonValue};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, instrument, warn};

use super::async_jobs::AsyncJobManager;
use super::condition::{result_vars, ConditionEvaluator};
use super::context::{CancelReason, RunContext};
use super::task::{LoopControl, Task, TaskDiff, TaskResult};
use crate::connection::{Connection, ConnectionFactory, ConnectionInfo, LocalConnectionFactory};
use crate::error::{Error, Result};
use crate::handlers::HandlerManager;
use crate::inventory::Host;
use crate::modules::{Module, ModuleArgs, ModuleContext, ModuleError, ModuleOutput, ModuleRegistry, ModuleStatus};
use crate::tags::TagFilter;
use crate::template::{render_value, JinjaRenderer, TemplateRenderer};
use crate::vars::{is_truthy, ScopeLevel, VarMap, VariableScope};

/// Default number of units dispatched at once
pub const DEFAULT_FORKS: usize = 5;

/// Runner settings
#[derive(Debug, Clone, PartialEq)]
pub struct RunnerConfig {
    /// Maximum number of units in flight
    pub forks: usize,
    /// Dry-run: only check-mode capable modules are invoked
    pub check_mode: bool,
    /// Ask modules for before/after diffs
    pub diff_mode: bool,
    /// Tag selection
    pub tags: Vec<String>,
    /// Tags to skip
    pub skip_tags: Vec<String>,
    /// Treat undefined variables in conditions as errors
    pub strict_conditions: bool,
    /// Verbosity passed to modules
    pub verbosity: u8,
    /// Upper bound for a single module call
    pub task_timeout: Option<Duration>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            forks: DEFAULT_FORKS,
            check_mode: false,
            diff_mode: false,
            tags: Vec::new(),
            skip_tags: Vec::new(),
            strict_conditions: false,
            verbosity: 0,
            task_timeout: None,
        }
    }
}

/// Drives tasks across hosts.
pub struct TaskRunner {
    registry: Arc<ModuleRegistry>,
    config: RunnerConfig,
    semaphore: Arc<Semaphore>,
    tag_filter: TagFilter,
    connections: Arc<dyn ConnectionFactory>,
    renderer: Arc<dyn TemplateRenderer>,
    handlers: Arc<HandlerManager>,
    async_jobs: Arc<AsyncJobManager>,
    registered: Arc<RwLock<HashMap<String, VarMap>>>,
}

impl std::fmt::Debug for TaskRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRunner")
            .field("config", &self.config)
            .field("modules", &self.registry.names())
            .finish()
    }
}

impl TaskRunner {
    /// Create a runner over `registry` with default settings, local
    /// connections and the minijinja renderer
    pub fn new(registry: Arc<ModuleRegistry>) -> Self {
        Self {
            registry,
            config: RunnerConfig::default(),
            semaphore: Arc::new(Semaphore::new(DEFAULT_FORKS)),
            tag_filter: TagFilter::new(),
            connections: Arc::new(LocalConnectionFactory),
            renderer: Arc::new(JinjaRenderer::new()),
            handlers: Arc::new(HandlerManager::new()),
            async_jobs: Arc::new(AsyncJobManager::new()),
            registered: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Apply a full configuration
    pub fn with_config(mut self, config: RunnerConfig) -> Self {
        self.tag_filter = TagFilter::new()
            .with_tags(config.tags.clone())
            .with_skip_tags(config.skip_tags.clone());
        self.config = config;
        let forks = self.config.forks;
        self.set_max_concurrency(forks);
        self
    }

    /// Use `factory` to obtain host connections
    pub fn with_connection_factory(mut self, factory: Arc<dyn ConnectionFactory>) -> Self {
        self.connections = factory;
        self
    }

    /// Use `renderer` for argument templates
    pub fn with_renderer(mut self, renderer: Arc<dyn TemplateRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    /// Share an existing handler manager
    pub fn with_handler_manager(mut self, handlers: Arc<HandlerManager>) -> Self {
        self.handlers = handlers;
        self
    }

    /// Set the number of concurrently dispatched units (0 is treated as 1)
    pub fn set_max_concurrency(&mut self, forks: usize) {
        let forks = forks.max(1);
        self.config.forks = forks;
        self.semaphore = Arc::new(Semaphore::new(forks));
    }

    /// Replace the tag selection
    pub fn set_tags(&mut self, tags: Vec<String>) {
        self.tag_filter.set_tags(tags.clone());
        self.config.tags = tags;
    }

    /// Replace the skipped tags
    pub fn set_skip_tags(&mut self, tags: Vec<String>) {
        self.tag_filter.set_skip_tags(tags.clone());
        self.config.skip_tags = tags;
    }

    /// Toggle check mode
    pub fn set_check_mode(&mut self, check_mode: bool) {
        self.config.check_mode = check_mode;
    }

    /// Toggle diff mode
    pub fn set_diff_mode(&mut self, diff_mode: bool) {
        self.config.diff_mode = diff_mode;
    }

    /// Current settings
    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// The module registry
    pub fn registry(&self) -> &Arc<ModuleRegistry> {
        &self.registry
    }

    /// The handler manager notified by this runner
    pub fn handler_manager(&self) -> Arc<HandlerManager> {
        Arc::clone(&self.handlers)
    }

    /// Background jobs started by fire-and-forget tasks
    pub fn async_jobs(&self) -> Arc<AsyncJobManager> {
        Arc::clone(&self.async_jobs)
    }

    /// Variables registered for `host` so far
    pub fn registered_vars(&self, host: &str) -> VarMap {
        self.registered.read().get(host).cloned().unwrap_or_default()
    }

    /// Forget all registered variables
    pub fn clear_registered(&self) {
        self.registered.write().clear();
    }

    /// Run `task` against `hosts` with `vars` as the global scope.
    ///
    /// Returns `Err` only for structural problems detected before any unit is
    /// dispatched: an unknown module, invalid arguments, a condition that does
    /// not parse or a loop that cannot be resolved. Everything that goes wrong
    /// on a host is reported in that host's results.
    #[instrument(skip_all, fields(task = %task.name, module = %task.module, hosts = hosts.len()))]
    pub async fn run(
        &self,
        ctx: &RunContext,
        task: &Task,
        hosts: &[Host],
        vars: &IndexMap<String, JsonValue>,
    ) -> Result<Vec<TaskResult>> {
        self.run_task(ctx, task, hosts, vars, true).await
    }

    /// Run a handler. Identical to [`TaskRunner::run`] except that tag
    /// selection does not apply.
    pub async fn run_handler(
        &self,
        ctx: &RunContext,
        handler: &Task,
        hosts: &[Host],
        vars: &IndexMap<String, JsonValue>,
    ) -> Result<Vec<TaskResult>> {
        self.run_task(ctx, handler, hosts, vars, false).await
    }

    async fn run_task(
        &self,
        ctx: &RunContext,
        task: &Task,
        hosts: &[Host],
        vars: &IndexMap<String, JsonValue>,
        apply_tags: bool,
    ) -> Result<Vec<TaskResult>> {
        let module = self.registry.resolve(&task.module)?;
        module
            .validate(&task.args)
            .map_err(|e| Error::module_args(&task.module, e.to_string()))?;
        for condition in task.conditions() {
            ConditionEvaluator::validate(condition)?;
        }

        if apply_tags && !self.tag_filter.should_run(&task.tags) {
            debug!("Task '{}' skipped by tag selection", task.name);
            return Ok(hosts
                .iter()
                .map(|h| TaskResult::skipped(&h.name, &task.name, &task.module, "tags"))
                .collect());
        }

        let global = Arc::new(vars.clone());
        let mut units = Vec::new();
        let mut per_host = Vec::with_capacity(hosts.len());
        for host in hosts {
            let base = self.base_scope(&global, host);
            let items = ConditionEvaluator::new(base.clone())
                .strict(self.config.strict_conditions)
                .evaluate_loop_items(task.loop_source())?;

            match items {
                None => {
                    per_host.push(1);
                    units.push(Unit {
                        host: host.clone(),
                        scope: base,
                        item: None,
                    });
                }
                Some(items) => {
                    let length = items.len();
                    per_host.push(length);
                    for (index, item) in items.into_iter().enumerate() {
                        let meta = LoopItem { index, length, item };
                        let scope = base.with_layer(ScopeLevel::Loop, meta.overlay(&task.loop_control));
                        units.push(Unit {
                            host: host.clone(),
                            scope,
                            item: Some(meta),
                        });
                    }
                }
            }
        }

        info!("Dispatching {} unit(s) for task '{}'", units.len(), task.name);

        let shared = Arc::new(UnitShared {
            task: task.clone(),
            module,
            connections: Arc::clone(&self.connections),
            renderer: Arc::clone(&self.renderer),
            async_jobs: Arc::clone(&self.async_jobs),
            ctx: ctx.clone(),
            check_mode: self.config.check_mode,
            diff_mode: self.config.diff_mode,
            strict: self.config.strict_conditions,
            verbosity: self.config.verbosity,
            task_timeout: self.config.task_timeout,
        });

        let host_names: Vec<String> = units.iter().map(|u| u.host.name.clone()).collect();
        let handles: Vec<_> = units
            .into_iter()
            .map(|unit| {
                let shared = Arc::clone(&shared);
                let semaphore = Arc::clone(&self.semaphore);
                tokio::spawn(async move {
                    let _permit = match semaphore.acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => {
                            return TaskResult::failed(
                                &unit.host.name,
                                &shared.task.name,
                                &shared.task.module,
                                "worker pool closed",
                            )
                        }
                    };
                    shared.execute(unit).await
                })
            })
            .collect();

        let results: Vec<TaskResult> = join_all(handles)
            .await
            .into_iter()
            .zip(host_names)
            .map(|(joined, host)| match joined {
                Ok(result) => result,
                Err(e) => {
                    error!("Worker for host {} did not complete: {}", host, e);
                    TaskResult::failed(host, &task.name, &task.module, format!("worker panicked: {}", e))
                }
            })
            .collect();

        self.record(task, hosts, &per_host, &results);
        Ok(results)
    }

    fn base_scope(&self, global: &Arc<VarMap>, host: &Host) -> VariableScope {
        let mut host_vars = VarMap::new();
        host_vars.insert("inventory_hostname".to_string(), JsonValue::String(host.name.clone()));
        host_vars.insert("group_names".to_string(), json!(host.groups));
        host_vars.extend(host.variables.iter().map(|(k, v)| (k.clone(), v.clone())));

        VariableScope::new()
            .with_shared_layer(ScopeLevel::Global, Arc::clone(global))
            .with_layer(ScopeLevel::Host, host_vars)
            .with_layer(ScopeLevel::Registered, self.registered_vars(&host.name))
    }

    fn record(&self, task: &Task, hosts: &[Host], per_host: &[usize], results: &[TaskResult]) {
        if let Some(name) = task.register.as_ref() {
            let mut registered = self.registered.write();
            let mut offset = 0;
            for (host, count) in hosts.iter().zip(per_host) {
                let chunk = &results[offset..offset + count];
                offset += count;
                let value = if task.loop_source().is_some() {
                    TaskResult::to_registered_loop(chunk)
                } else if let Some(result) = chunk.first() {
                    result.to_registered()
                } else {
                    continue;
                };
                registered
                    .entry(host.name.clone())
                    .or_default()
                    .insert(name.clone(), value);
            }
        }

        if !task.notify.is_empty() && results.iter().any(|r| r.changed && !r.is_failed()) {
            debug!("Task '{}' notifies {:?}", task.name, task.notify);
            self.handlers.notify(&task.notify);
        }
    }
}

/// Loop position of a unit
#[derive(Debug, Clone)]
struct LoopItem {
    index: usize,
    length: usize,
    item: JsonValue,
}

impl LoopItem {
    fn metadata(&self, control: &LoopControl) -> JsonValue {
        let mut meta = serde_json::Map::new();
        meta.insert("index".to_string(), json!(self.index));
        meta.insert("index0".to_string(), json!(self.index));
        meta.insert("index1".to_string(), json!(self.index + 1));
        meta.insert("first".to_string(), json!(self.index == 0));
        meta.insert("last".to_string(), json!(self.index + 1 == self.length));
        meta.insert("length".to_string(), json!(self.length));
        meta.insert("revindex".to_string(), json!(self.length - self.index));
        meta.insert(control.loop_var.clone(), self.item.clone());
        JsonValue::Object(meta)
    }

    fn overlay(&self, control: &LoopControl) -> VarMap {
        let mut vars = VarMap::new();
        vars.insert("ansible_loop".to_string(), self.metadata(control));
        if let Some(index_var) = control.index_var.as_ref() {
            vars.insert(index_var.clone(), json!(self.index));
        }
        vars.insert(control.loop_var.clone(), self.item.clone());
        vars
    }
}

struct Unit {
    host: Host,
    scope: VariableScope,
    item: Option<LoopItem>,
}

/// State shared by every unit of one `run` call
struct UnitShared {
    task: Task,
    module: Arc<dyn Module>,
    connections: Arc<dyn ConnectionFactory>,
    renderer: Arc<dyn TemplateRenderer>,
    async_jobs: Arc<AsyncJobManager>,
    ctx: RunContext,
    check_mode: bool,
    diff_mode: bool,
    strict: bool,
    verbosity: u8,
    task_timeout: Option<Duration>,
}

impl UnitShared {
    async fn execute(&self, unit: Unit) -> TaskResult {
        let started = Instant::now();
        let mut result = self.execute_unit(&unit).await;
        if let Some(item) = unit.item.as_ref() {
            let control = &self.task.loop_control;
            result
                .data
                .insert("ansible_loop".to_string(), item.metadata(control));
            result
                .data
                .insert(control.loop_var.clone(), item.item.clone());
            if let Some(label) = control.label.as_ref() {
                if let Ok(rendered) = self.renderer.render(label, &unit.scope) {
                    result
                        .data
                        .insert("_ansible_item_label".to_string(), JsonValue::String(rendered));
                }
            }
        }
        result.duration = started.elapsed();
        result
    }

    fn evaluator(&self, scope: VariableScope) -> ConditionEvaluator {
        ConditionEvaluator::new(scope).strict(self.strict)
    }

    fn failed(&self, host: &Host, error: impl Into<String>) -> TaskResult {
        TaskResult::failed(&host.name, &self.task.name, &self.task.module, error)
    }

    async fn execute_unit(&self, unit: &Unit) -> TaskResult {
        let task = &self.task;
        let host = &unit.host;

        match self.evaluator(unit.scope.clone()).evaluate_when(task.when.as_ref()) {
            Ok(true) => {}
            Ok(false) => {
                debug!("Task '{}' skipped on {}: condition false", task.name, host.name);
                return TaskResult::skipped(&host.name, &task.name, &task.module, "conditional");
            }
            Err(e) => return self.failed(host, e.to_string()),
        }

        let check_mode = self.check_mode || unit.scope.get("ansible_check_mode").is_some_and(is_truthy);
        let diff_mode = self.diff_mode || unit.scope.get("ansible_diff_mode").is_some_and(is_truthy);

        if check_mode && !self.module.capabilities().check_mode {
            debug!(
                "Module '{}' does not support check mode, skipping on {}",
                task.module, host.name
            );
            let mut result = TaskResult::new(&host.name, &task.name, &task.module)
                .with_data("skipped", true)
                .with_data("reason", "module_no_check_support");
            result.simulated = true;
            result.message = "skipped: module does not support check mode".to_string();
            return result;
        }

        let mut args = ModuleArgs::with_capacity(task.args.len() + 2);
        for (key, value) in &task.args {
            match render_value(self.renderer.as_ref(), value, &unit.scope) {
                Ok(rendered) => {
                    args.insert(key.clone(), rendered);
                }
                Err(e) => return self.failed(host, e.to_string()),
            }
        }
        if check_mode {
            args.insert("_check_mode".to_string(), JsonValue::Bool(true));
        }
        if diff_mode {
            args.insert("_diff_mode".to_string(), JsonValue::Bool(true));
        }

        let connected = tokio::select! {
            biased;
            reason = self.ctx.cancelled() => {
                return cancelled(TaskResult::new(&host.name, &task.name, &task.module), reason);
            }
            connected = self.connect(host) => connected,
        };
        let connection = match connected {
            Ok(connection) => connection,
            Err(result) => return *result,
        };

        let module_ctx = ModuleContext {
            host: host.name.clone(),
            task_name: task.name.clone(),
            check_mode,
            diff_mode,
            verbosity: self.verbosity,
            vars: unit.scope.clone(),
        };
        let dispatch = Dispatch {
            module: Arc::clone(&self.module),
            connection,
            context: module_ctx,
            args,
            limit: if task.async_ > 0 {
                Some(Duration::from_secs(task.async_))
            } else {
                self.task_timeout
            },
            diff_mode,
        };

        if task.is_fire_and_forget() {
            let ctx = self.ctx.clone();
            let jid = self.async_jobs.submit(
                &host.name,
                &task.name,
                &task.module,
                task.async_,
                async move { dispatch.call(&ctx).await },
            );
            let mut result = TaskResult::new(&host.name, &task.name, &task.module)
                .with_data("started", 1)
                .with_data("finished", 0)
                .with_data("ansible_job_id", jid.clone());
            result.changed = true;
            result.message = format!("Async job started: {}", jid);
            return result;
        }

        let mut result = self.poll(unit, &dispatch).await;

        if !result.is_skipped() && !result.is_unreachable() && !is_cancelled(&result) {
            if let Err(e) = self.apply_overrides(unit, &mut result) {
                result.success = false;
                result.message = e.to_string();
                result.error = Some(e.to_string());
            }
        }

        if check_mode && !result.is_skipped() {
            result.simulated = true;
            result.data.insert("check_mode".to_string(), JsonValue::Bool(true));
            result
                .data
                .insert("would_change".to_string(), JsonValue::Bool(result.changed));
        }

        if !result.success && task.ignore_errors {
            debug!("Ignoring failure of '{}' on {}", task.name, host.name);
            result.ignored = true;
        }

        result
    }

    async fn connect(&self, host: &Host) -> std::result::Result<Arc<dyn Connection>, Box<TaskResult>> {
        let unreachable = |message: String| {
            warn!("Host {} unreachable: {}", host.name, message);
            Box::new(self.failed(host, message).with_data("unreachable", true))
        };

        let connection = self
            .connections
            .connection_for(host)
            .await
            .map_err(|e| unreachable(e.to_string()))?;
        connection
            .connect(&ConnectionInfo::from_host(host))
            .await
            .map_err(|e| unreachable(e.to_string()))?;
        Ok(connection)
    }

    /// Dispatch with retry/until polling. The last attempt's result is kept.
    async fn poll(&self, unit: &Unit, dispatch: &Dispatch) -> TaskResult {
        let task = &self.task;
        let max_attempts = task.retries.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let mut result = match self.ctx.reason() {
                Some(reason) => cancelled(self.failed(&unit.host, ""), reason),
                None => dispatch.call(&self.ctx).await,
            };
            result.attempts = attempt;

            if task.retries == 0 || is_cancelled(&result) {
                return result;
            }

            let done = match task.until.as_ref() {
                None => result.success,
                Some(until) => {
                    let scope = self.result_scope(&unit.scope, &result);
                    match self.evaluator(scope).evaluate_when(Some(until)) {
                        Ok(done) => done,
                        Err(e) => {
                            result.success = false;
                            result.message = e.to_string();
                            result.error = Some(e.to_string());
                            return result;
                        }
                    }
                }
            };
            if done || attempt >= max_attempts {
                if !done {
                    debug!(
                        "Task '{}' on {} exhausted {} attempt(s)",
                        task.name, unit.host.name, attempt
                    );
                }
                return result;
            }

            if let Some(reason) = self.ctx.reason() {
                return cancelled(result, reason);
            }
            debug!(
                "Retrying '{}' on {} (attempt {}/{})",
                task.name,
                unit.host.name,
                attempt + 1,
                max_attempts
            );
            if task.delay > 0 {
                tokio::select! {
                    biased;
                    reason = self.ctx.cancelled() => return cancelled(result, reason),
                    _ = tokio::time::sleep(Duration::from_secs(task.delay)) => {}
                }
            }
        }
    }

    /// Scope for `until`, `changed_when` and `failed_when`
    fn result_scope(&self, scope: &VariableScope, result: &TaskResult) -> VariableScope {
        let registered = result.to_registered();
        let mut vars = result_vars(result);
        if let Some(name) = self.task.register.as_ref() {
            vars.insert(name.clone(), registered.clone());
        }
        vars.insert("result".to_string(), registered);
        scope.with_layer(ScopeLevel::Result, vars)
    }

    fn apply_overrides(&self, unit: &Unit, result: &mut TaskResult) -> Result<()> {
        let task = &self.task;
        if task.changed_when.is_none() && task.failed_when.is_none() {
            return Ok(());
        }

        let evaluator = self.evaluator(self.result_scope(&unit.scope, result));
        result.changed = evaluator.evaluate_changed_when(task.changed_when.as_ref(), result)?;

        if task.failed_when.is_some() {
            let failed = evaluator.evaluate_failed_when(task.failed_when.as_ref(), result)?;
            result.success = !failed;
            if failed {
                if result.error.is_none() {
                    result.error = Some("failed_when condition was met".to_string());
                }
            } else {
                result.error = None;
            }
        }
        Ok(())
    }
}

/// One module call, ready to run in the foreground or in the background
struct Dispatch {
    module: Arc<dyn Module>,
    connection: Arc<dyn Connection>,
    context: ModuleContext,
    args: ModuleArgs,
    limit: Option<Duration>,
    diff_mode: bool,
}

impl Dispatch {
    async fn call(&self, ctx: &RunContext) -> TaskResult {
        let ModuleContext {
            host, task_name, ..
        } = &self.context;
        let module_name = self.module.name();
        let call = self
            .module
            .run(&self.context, self.connection.as_ref(), &self.args);
        let bounded = async {
            match self.limit {
                Some(limit) => tokio::time::timeout(limit, call).await.ok(),
                None => Some(call.await),
            }
        };

        let outcome = tokio::select! {
            biased;
            reason = ctx.cancelled() => {
                warn!("Module '{}' on {} cancelled: {}", module_name, host, reason);
                return cancelled(TaskResult::failed(host, task_name, module_name, ""), reason);
            }
            outcome = bounded => outcome,
        };

        match outcome {
            Some(Ok(output)) => from_output(host, task_name, module_name, output, self.diff_mode),
            Some(Err(ModuleError::Connection(e))) => {
                TaskResult::failed(host, task_name, module_name, e.to_string())
                    .with_data("unreachable", true)
            }
            Some(Err(e)) => TaskResult::failed(host, task_name, module_name, e.to_string()),
            None => {
                let secs = self.limit.map(|l| l.as_secs()).unwrap_or_default();
                TaskResult::failed(
                    host,
                    task_name,
                    module_name,
                    format!("Module '{}' timed out after {} seconds", module_name, secs),
                )
                .with_data("timed_out", true)
            }
        }
    }
}

fn from_output(
    host: &str,
    task_name: &str,
    module_name: &str,
    output: ModuleOutput,
    diff_mode: bool,
) -> TaskResult {
    let mut result = TaskResult::new(host, task_name, module_name);
    result.changed = output.changed;
    result.message = output.msg;
    result.data = output.data;
    if let Some(rc) = output.rc {
        result.data.insert("rc".to_string(), json!(rc));
    }
    if let Some(stdout) = output.stdout {
        result.data.insert("stdout".to_string(), JsonValue::String(stdout));
    }
    if let Some(stderr) = output.stderr {
        result.data.insert("stderr".to_string(), JsonValue::String(stderr));
    }

    match output.status {
        ModuleStatus::Failed => {
            result.success = false;
            result.error = Some(result.message.clone());
        }
        ModuleStatus::Skipped => {
            result.data.insert("skipped".to_string(), JsonValue::Bool(true));
        }
        ModuleStatus::Ok | ModuleStatus::Changed => {}
    }

    if diff_mode {
        result.diff = output.diff.map(|d| TaskDiff {
            before: Some(d.before),
            after: Some(d.after),
            prepared: d.details,
        });
    }
    result
}

fn cancelled(mut result: TaskResult, reason: CancelReason) -> TaskResult {
    let message = Error::Cancelled(reason.to_string()).to_string();
    result.success = false;
    result.message = message.clone();
    result.error = Some(message);
    result.data.insert("cancelled".to_string(), JsonValue::Bool(true));
    result
}

fn is_cancelled(result: &TaskResult) -> bool {
    result.data.get("cancelled").is_some_and(is_truthy)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner() -> TaskRunner {
        TaskRunner::new(Arc::new(ModuleRegistry::with_builtins()))
    }

    fn hosts(names: &[&str]) -> Vec<Host> {
        names.iter().map(|n| Host::new(*n)).collect()
    }

    #[test]
    fn test_loop_metadata() {
        let item = LoopItem {
            index: 2,
            length: 3,
            item: json!("c"),
        };
        let meta = item.metadata(&LoopControl::default());
        assert_eq!(meta["index"], 2);
        assert_eq!(meta["index1"], 3);
        assert_eq!(meta["first"], false);
        assert_eq!(meta["last"], true);
        assert_eq!(meta["item"], "c");
    }

    #[test]
    fn test_zero_forks_clamped() {
        let mut runner = runner();
        runner.set_max_concurrency(0);
        assert_eq!(runner.config().forks, 1);
    }

    #[tokio::test]
    async fn test_unknown_module_is_structural() {
        let runner = runner();
        let task = Task::new("nope", "does_not_exist");
        let err = runner
            .run(&RunContext::new(), &task, &hosts(&["h1"]), &IndexMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ModuleNotFound(_)));
    }

    #[tokio::test]
    async fn test_bad_condition_is_structural() {
        let runner = runner();
        let task = Task::new("t", "debug").when("x == (1");
        let err = runner
            .run(&RunContext::new(), &task, &hosts(&["h1"]), &IndexMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConditionSyntax { .. }));
    }

    #[tokio::test]
    async fn test_debug_loop_and_register() {
        let runner = runner();
        let task = Task::new("greet", "debug")
            .arg("msg", "hello {{ item }}")
            .loop_over(vec![json!("a"), json!("b")])
            .register("greeting");

        let results = runner
            .run(&RunContext::new(), &task, &hosts(&["h1"]), &IndexMap::new())
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].message, "hello a");
        assert_eq!(results[1].data["ansible_loop"]["last"], true);

        let registered = runner.registered_vars("h1");
        assert_eq!(registered["greeting"]["results"].as_array().unwrap().len(), 2);
    }
}

//! Sequential play driver.
//!
//! A play runs its tasks one after another, each through the full
//! [`TaskRunner`] fan-out, so a variable registered by one task is visible
//! to every later task. Hosts with an unignored failure drop out of the
//! remaining tasks. Pending handlers run once all tasks are done.

use std::collections::HashSet;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{info, instrument, warn};

use super::context::RunContext;
use super::runner::TaskRunner;
use super::task::{Task, TaskResult};
use super::ExecutionStats;
use crate::error::Result;
use crate::inventory::{Host, Inventory};

/// A list of tasks and handlers bound to a set of hosts
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Play {
    /// Play name
    #[serde(default)]
    pub name: String,
    /// Target hosts
    #[serde(default)]
    pub hosts: Vec<Host>,
    /// Play variables, the global scope of every task
    #[serde(default)]
    pub vars: IndexMap<String, JsonValue>,
    /// Tasks, in execution order
    #[serde(default)]
    pub tasks: Vec<Task>,
    /// Handlers, in registration order
    #[serde(default)]
    pub handlers: Vec<Task>,
    /// Run notified handlers even on hosts that failed
    #[serde(default)]
    pub force_handlers: bool,
}

impl Play {
    /// Create an empty play
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Create a play targeting the hosts `pattern` resolves to
    pub fn from_inventory(
        name: impl Into<String>,
        inventory: &dyn Inventory,
        pattern: &str,
    ) -> Result<Self> {
        Ok(Self {
            hosts: inventory.get_hosts(pattern)?,
            ..Self::new(name)
        })
    }

    /// Add a host
    pub fn host(mut self, host: Host) -> Self {
        self.hosts.push(host);
        self
    }

    /// Set a play variable
    pub fn var(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }

    /// Append a task
    pub fn task(mut self, task: Task) -> Self {
        self.tasks.push(task);
        self
    }

    /// Append a handler
    pub fn handler(mut self, handler: Task) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Set force_handlers
    pub fn force_handlers(mut self, force: bool) -> Self {
        self.force_handlers = force;
        self
    }
}

/// Outcome of a play
#[derive(Debug, Clone, Default)]
pub struct PlayRecap {
    /// Play name
    pub play: String,
    /// Per-host counters, in host order
    pub stats: IndexMap<String, ExecutionStats>,
    /// Every result, tasks first, then handlers
    pub results: Vec<TaskResult>,
}

impl PlayRecap {
    fn new(play: &Play) -> Self {
        Self {
            play: play.name.clone(),
            stats: play
                .hosts
                .iter()
                .map(|h| (h.name.clone(), ExecutionStats::default()))
                .collect(),
            results: Vec::new(),
        }
    }

    fn record(&mut self, results: Vec<TaskResult>) {
        for result in &results {
            self.stats
                .entry(result.host.clone())
                .or_default()
                .record(result);
        }
        self.results.extend(results);
    }

    /// Counters of one host
    pub fn host(&self, name: &str) -> Option<&ExecutionStats> {
        self.stats.get(name)
    }

    /// Counters summed over all hosts
    pub fn totals(&self) -> ExecutionStats {
        let mut total = ExecutionStats::default();
        for stats in self.stats.values() {
            total.merge(stats);
        }
        total
    }

    /// Check if any host failed or was unreachable
    pub fn has_failures(&self) -> bool {
        self.stats
            .values()
            .any(|s| s.failed > 0 || s.unreachable > 0)
    }
}

/// Runs plays through a [`TaskRunner`]
#[derive(Debug)]
pub struct PlayExecutor {
    runner: TaskRunner,
}

impl PlayExecutor {
    /// Create an executor around `runner`
    pub fn new(runner: TaskRunner) -> Self {
        Self { runner }
    }

    /// The underlying runner
    pub fn runner(&self) -> &TaskRunner {
        &self.runner
    }

    /// The underlying runner, mutably
    pub fn runner_mut(&mut self) -> &mut TaskRunner {
        &mut self.runner
    }

    /// Run a play.
    ///
    /// Structural task errors abort the play and are returned; host failures
    /// are counted in the recap. Handlers are cleared afterwards either way.
    #[instrument(skip_all, fields(play = %play.name, hosts = play.hosts.len()))]
    pub async fn run_play(&self, ctx: &RunContext, play: &Play) -> Result<PlayRecap> {
        let handlers = self.runner.handler_manager();
        let outcome = self.run_play_inner(ctx, play).await;
        handlers.clear();
        outcome
    }

    async fn run_play_inner(&self, ctx: &RunContext, play: &Play) -> Result<PlayRecap> {
        let handlers = self.runner.handler_manager();
        for handler in &play.handlers {
            handlers.register_handler(handler.clone())?;
        }

        info!("PLAY [{}]", play.name);
        let mut recap = PlayRecap::new(play);
        let mut active: Vec<Host> = play.hosts.clone();

        for task in &play.tasks {
            if active.is_empty() {
                warn!("No hosts remaining, stopping play '{}'", play.name);
                break;
            }
            if let Some(reason) = ctx.reason() {
                warn!("Stopping play '{}': {}", play.name, reason);
                break;
            }

            info!("TASK [{}]", task.name);
            let results = self.runner.run(ctx, task, &active, &play.vars).await?;
            let failed: HashSet<String> = results
                .iter()
                .filter(|r| r.is_failed())
                .map(|r| r.host.clone())
                .collect();
            recap.record(results);
            if !failed.is_empty() {
                active.retain(|h| !failed.contains(&h.name));
            }
        }

        let handler_hosts = if play.force_handlers {
            play.hosts.clone()
        } else {
            active
        };
        if handlers.has_pending() {
            if handler_hosts.is_empty() {
                warn!("Discarding pending handlers: no hosts left to run them on");
                handlers.get_pending_handlers();
            } else {
                info!("RUNNING HANDLERS [{}]", play.name);
                let results = handlers
                    .process_handlers(ctx, &self.runner, &handler_hosts, &play.vars)
                    .await?;
                recap.record(results);
            }
        }

        Ok(recap)
    }
}

//! Task definitions and per-unit results.
//!
//! This module provides:
//! - [`Task`] with module, args, conditions, loops and polling policy
//! - [`TaskResult`], the outcome of one (host, loop item) unit
//! - the registered-variable form bound by `register`

use std::time::Duration;

use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value as JsonValue};

pub use super::condition::Condition;
use crate::vars::is_truthy;

/// Status of a finished unit, as reported in a play recap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Completed without changes
    Ok,
    /// Completed with changes
    Changed,
    /// Failed
    Failed,
    /// Skipped (tags, condition or check mode)
    Skipped,
    /// Host was unreachable
    Unreachable,
}

/// Diff showing before/after state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskDiff {
    /// State before the change
    pub before: Option<String>,
    /// State after the change
    pub after: Option<String>,
    /// A prepared, already formatted diff
    pub prepared: Option<String>,
}

/// Outcome of one (host × loop item) execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    /// Target host
    pub host: String,
    /// Name of the task
    pub task_name: String,
    /// Module that ran (or would have run)
    pub module_name: String,
    /// Whether the unit succeeded
    pub success: bool,
    /// Whether the unit changed something
    pub changed: bool,
    /// True when produced under check mode
    pub simulated: bool,
    /// True when a failure was tolerated by `ignore_errors`
    pub ignored: bool,
    /// Human readable message
    pub message: String,
    /// Error detail for failed units
    pub error: Option<String>,
    /// Module payload plus loop metadata
    pub data: IndexMap<String, JsonValue>,
    /// Before/after diff (diff mode only)
    pub diff: Option<TaskDiff>,
    /// Wall time of the unit
    pub duration: Duration,
    /// Number of module dispatches made
    pub attempts: u32,
}

impl TaskResult {
    /// Create a successful, unchanged result
    pub fn new(
        host: impl Into<String>,
        task_name: impl Into<String>,
        module_name: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            task_name: task_name.into(),
            module_name: module_name.into(),
            success: true,
            changed: false,
            simulated: false,
            ignored: false,
            message: String::new(),
            error: None,
            data: IndexMap::new(),
            diff: None,
            duration: Duration::ZERO,
            attempts: 0,
        }
    }

    /// Create a skipped result carrying `skip_reason`
    pub fn skipped(
        host: impl Into<String>,
        task_name: impl Into<String>,
        module_name: impl Into<String>,
        reason: &str,
    ) -> Self {
        let mut result = Self::new(host, task_name, module_name);
        result.message = format!("skipped: {}", reason);
        result.data.insert("skipped".to_string(), JsonValue::Bool(true));
        result
            .data
            .insert("skip_reason".to_string(), JsonValue::String(reason.to_string()));
        result
    }

    /// Create a failed result
    pub fn failed(
        host: impl Into<String>,
        task_name: impl Into<String>,
        module_name: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        let error = error.into();
        let mut result = Self::new(host, task_name, module_name);
        result.success = false;
        result.message = error.clone();
        result.error = Some(error);
        result
    }

    /// Set a data entry
    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// Check if the unit was skipped
    pub fn is_skipped(&self) -> bool {
        self.data.get("skipped").is_some_and(is_truthy)
    }

    /// Check if the unit failed and the failure was not ignored
    pub fn is_failed(&self) -> bool {
        !self.success && !self.ignored
    }

    /// Check if the host could not be reached
    pub fn is_unreachable(&self) -> bool {
        self.data.get("unreachable").is_some_and(is_truthy)
    }

    /// Status as counted in a recap
    pub fn status(&self) -> TaskStatus {
        if self.is_unreachable() {
            TaskStatus::Unreachable
        } else if !self.success {
            TaskStatus::Failed
        } else if self.is_skipped() {
            TaskStatus::Skipped
        } else if self.changed {
            TaskStatus::Changed
        } else {
            TaskStatus::Ok
        }
    }

    /// The value bound under a `register` name.
    ///
    /// Module data is flattened to the top level the way modules return it,
    /// with the engine's own flags taking precedence.
    pub fn to_registered(&self) -> JsonValue {
        let mut map = serde_json::Map::new();
        for (key, value) in &self.data {
            map.insert(key.clone(), value.clone());
        }
        for (stream, lines) in [("stdout", "stdout_lines"), ("stderr", "stderr_lines")] {
            if map.contains_key(lines) {
                continue;
            }
            if let Some(text) = map.get(stream).and_then(|v| v.as_str()) {
                let split: Vec<JsonValue> = text.lines().map(JsonValue::from).collect();
                map.insert(lines.to_string(), JsonValue::Array(split));
            }
        }
        map.insert("changed".to_string(), JsonValue::Bool(self.changed));
        map.insert("failed".to_string(), JsonValue::Bool(!self.success));
        map.insert("skipped".to_string(), JsonValue::Bool(self.is_skipped()));
        map.insert("msg".to_string(), JsonValue::String(self.message.clone()));
        if self.attempts > 0 {
            map.insert("attempts".to_string(), JsonValue::from(self.attempts));
        }
        if self.ignored {
            map.insert("ignored".to_string(), JsonValue::Bool(true));
        }
        if let Some(ref diff) = self.diff {
            map.insert(
                "diff".to_string(),
                serde_json::to_value(diff).unwrap_or(JsonValue::Null),
            );
        }
        JsonValue::Object(map)
    }

    /// The value bound under a `register` name for a looped task
    pub fn to_registered_loop(results: &[TaskResult]) -> JsonValue {
        let changed = results.iter().any(|r| r.changed);
        let failed = results.iter().any(|r| !r.success);
        let skipped = !results.is_empty() && results.iter().all(TaskResult::is_skipped);
        let msg = if failed {
            "One or more items failed"
        } else {
            "All items completed"
        };
        json!({
            "results": results.iter().map(TaskResult::to_registered).collect::<Vec<_>>(),
            "changed": changed,
            "failed": failed,
            "skipped": skipped,
            "msg": msg,
        })
    }
}

/// Loop behaviour overrides
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopControl {
    /// Name the current item is bound under
    #[serde(default = "default_loop_var")]
    pub loop_var: String,
    /// Optional name the 0-based index is bound under
    #[serde(default)]
    pub index_var: Option<String>,
    /// Template used to label items in output
    #[serde(default)]
    pub label: Option<String>,
}

impl Default for LoopControl {
    fn default() -> Self {
        Self {
            loop_var: default_loop_var(),
            index_var: None,
            label: None,
        }
    }
}

fn default_loop_var() -> String {
    "item".to_string()
}

/// A task to be executed
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Task {
    /// Task name (displayed during execution)
    #[serde(default)]
    pub name: String,
    /// Module key in the registry
    pub module: String,
    /// Module arguments
    #[serde(default)]
    pub args: IndexMap<String, JsonValue>,
    /// Conditional expression(s)
    #[serde(default)]
    pub when: Option<Condition>,
    /// Tags for task filtering
    #[serde(default, deserialize_with = "string_or_vec")]
    pub tags: Vec<String>,
    /// Loop source
    #[serde(default, rename = "loop")]
    pub loop_: Option<JsonValue>,
    /// Legacy loop source, used when `loop` is absent
    #[serde(default)]
    pub with_items: Option<JsonValue>,
    /// Loop variable names
    #[serde(default)]
    pub loop_control: LoopControl,
    /// Variable name to register the result under
    #[serde(default)]
    pub register: Option<String>,
    /// Maximum number of attempts when polling
    #[serde(default)]
    pub retries: u32,
    /// Seconds between attempts
    #[serde(default)]
    pub delay: u64,
    /// Condition ending the retry loop
    #[serde(default)]
    pub until: Option<Condition>,
    /// Whether to tolerate failures
    #[serde(default)]
    pub ignore_errors: bool,
    /// Condition overriding the module's changed flag
    #[serde(default)]
    pub changed_when: Option<Condition>,
    /// Condition overriding the module's success flag
    #[serde(default)]
    pub failed_when: Option<Condition>,
    /// Handlers to notify on change
    #[serde(default, deserialize_with = "string_or_vec")]
    pub notify: Vec<String>,
    /// Topics this handler subscribes to
    #[serde(default, deserialize_with = "string_or_vec")]
    pub listen: Vec<String>,
    /// Maximum runtime in seconds (0 disables)
    #[serde(default, rename = "async")]
    pub async_: u64,
    /// Poll interval; `Some(0)` means fire-and-forget
    #[serde(default)]
    pub poll: Option<u64>,
}

fn string_or_vec<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::One(s)) => s
            .split(',')
            .map(|part| part.trim().to_string())
            .filter(|part| !part.is_empty())
            .collect(),
        Some(OneOrMany::Many(v)) => v,
    })
}

impl Task {
    /// Create a new task with the given name and module
    pub fn new(name: impl Into<String>, module: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            module: module.into(),
            ..Default::default()
        }
    }

    /// Add an argument to the task
    pub fn arg(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.args.insert(key.into(), value.into());
        self
    }

    /// Set the when condition
    pub fn when(mut self, condition: impl Into<Condition>) -> Self {
        self.when = Some(condition.into());
        self
    }

    /// Add a tag
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Loop over literal items
    pub fn loop_over(mut self, items: Vec<JsonValue>) -> Self {
        self.loop_ = Some(JsonValue::Array(items));
        self
    }

    /// Loop over an expression (`"{{ pkgs }}"`, `"1-5"`, ...)
    pub fn loop_expr(mut self, expr: impl Into<String>) -> Self {
        self.loop_ = Some(JsonValue::String(expr.into()));
        self
    }

    /// Set the loop variable name
    pub fn loop_var(mut self, name: impl Into<String>) -> Self {
        self.loop_control.loop_var = name.into();
        self
    }

    /// Set the loop index variable name
    pub fn index_var(mut self, name: impl Into<String>) -> Self {
        self.loop_control.index_var = Some(name.into());
        self
    }

    /// Set the register variable
    pub fn register(mut self, name: impl Into<String>) -> Self {
        self.register = Some(name.into());
        self
    }

    /// Set retries and delay (seconds)
    pub fn retries(mut self, retries: u32, delay: u64) -> Self {
        self.retries = retries;
        self.delay = delay;
        self
    }

    /// Set the until condition
    pub fn until(mut self, condition: impl Into<Condition>) -> Self {
        self.until = Some(condition.into());
        self
    }

    /// Set ignore_errors
    pub fn ignore_errors(mut self, ignore: bool) -> Self {
        self.ignore_errors = ignore;
        self
    }

    /// Set the changed_when condition
    pub fn changed_when(mut self, condition: impl Into<Condition>) -> Self {
        self.changed_when = Some(condition.into());
        self
    }

    /// Set the failed_when condition
    pub fn failed_when(mut self, condition: impl Into<Condition>) -> Self {
        self.failed_when = Some(condition.into());
        self
    }

    /// Add a handler to notify
    pub fn notify(mut self, handler: impl Into<String>) -> Self {
        self.notify.push(handler.into());
        self
    }

    /// Add a listen topic
    pub fn listen(mut self, topic: impl Into<String>) -> Self {
        self.listen.push(topic.into());
        self
    }

    /// Set async timeout and poll interval
    pub fn async_poll(mut self, async_secs: u64, poll: u64) -> Self {
        self.async_ = async_secs;
        self.poll = Some(poll);
        self
    }

    /// The loop source, `loop` taking precedence over `with_items`
    pub fn loop_source(&self) -> Option<&JsonValue> {
        self.loop_.as_ref().or(self.with_items.as_ref())
    }

    /// Every condition attached to the task
    pub fn conditions(&self) -> impl Iterator<Item = &Condition> {
        [
            self.when.as_ref(),
            self.until.as_ref(),
            self.changed_when.as_ref(),
            self.failed_when.as_ref(),
        ]
        .into_iter()
        .flatten()
    }

    /// Check if the task runs in the background without waiting
    pub fn is_fire_and_forget(&self) -> bool {
        self.async_ > 0 && self.poll == Some(0)
    }
}

//! Core execution engine.
//!
//! This module provides:
//! - [`condition`]: the condition and loop-expression evaluator
//! - [`task`]: task definitions and per-unit results
//! - [`runner`]: the per-task fan-out with retries, loops and check mode
//! - [`context`]: cancellation and deadlines
//! - [`async_jobs`]: background (`poll: 0`) units
//! - [`play`]: the sequential play driver

pub mod async_jobs;
pub mod condition;
pub mod context;
pub mod play;
pub mod runner;
pub mod task;

use serde::{Deserialize, Serialize};

use self::task::{TaskResult, TaskStatus};

pub use self::condition::ConditionEvaluator;
pub use self::context::{CancelReason, RunContext};
pub use self::play::{Play, PlayExecutor, PlayRecap};
pub use self::runner::{RunnerConfig, TaskRunner};
pub use self::task::{Task, TaskDiff};

/// Statistics collected during execution
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionStats {
    pub ok: usize,
    pub changed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub ignored: usize,
    pub unreachable: usize,
}

impl ExecutionStats {
    /// Count one result
    pub fn record(&mut self, result: &TaskResult) {
        match result.status() {
            TaskStatus::Ok => self.ok += 1,
            TaskStatus::Changed => self.changed += 1,
            TaskStatus::Failed if result.ignored => self.ignored += 1,
            TaskStatus::Failed => self.failed += 1,
            TaskStatus::Skipped => self.skipped += 1,
            TaskStatus::Unreachable => self.unreachable += 1,
        }
    }

    pub fn merge(&mut self, other: &ExecutionStats) {
        self.ok += other.ok;
        self.changed += other.changed;
        self.failed += other.failed;
        self.skipped += other.skipped;
        self.ignored += other.ignored;
        self.unreachable += other.unreachable;
    }
}

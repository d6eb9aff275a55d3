//! # Converge - An Async Task Execution Engine
//!
//! Converge executes Ansible-style tasks across sets of hosts: it evaluates
//! `when` conditions, expands loops, fans units out under a concurrency
//! bound, polls with `retries`/`until`, honours check and diff mode, applies
//! `changed_when`/`failed_when`, binds `register` results and drives
//! handler notifications.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                     PlayExecutor (sequential tasks)                  │
//! └─────────────────────────────────────────────────────────────────────┘
//!                                    │
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                TaskRunner (tags, loops, retries, forks)              │
//! └─────────────────────────────────────────────────────────────────────┘
//!          │                         │                         │
//!          ▼                         ▼                         ▼
//! ┌─────────────────┐   ┌─────────────────────┐   ┌─────────────────────┐
//! │   Condition     │   │   Module Registry   │   │   HandlerManager    │
//! │   Evaluator     │   │   + Connections     │   │   (notify/listen)   │
//! └─────────────────┘   └─────────────────────┘   └─────────────────────┘
//! ```
//!
//! ## Quick Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use converge::prelude::*;
//! use indexmap::IndexMap;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let runner = TaskRunner::new(Arc::new(ModuleRegistry::with_builtins()));
//!     let task = Task::new("greet", "debug")
//!         .arg("msg", "hello {{ item }}")
//!         .loop_over(vec!["a".into(), "b".into()]);
//!
//!     let hosts = vec![Host::new("localhost")];
//!     let results = runner
//!         .run(&RunContext::new(), &task, &hosts, &IndexMap::new())
//!         .await?;
//!     assert_eq!(results.len(), 2);
//!     Ok(())
//! }
//! ```

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

/// Convenient re-exports of commonly used types and traits.
pub mod prelude {
    pub use crate::connection::{
        CommandResult, Connection, ConnectionError, ConnectionFactory, ConnectionResult,
        ExecuteOptions, LocalConnection, LocalConnectionFactory, StreamEvent,
    };
    pub use crate::error::{Error, Result};
    pub use crate::executor::async_jobs::AsyncJobManager;
    pub use crate::executor::condition::{Condition, ConditionEvaluator};
    pub use crate::executor::context::RunContext;
    pub use crate::executor::play::{Play, PlayExecutor, PlayRecap};
    pub use crate::executor::runner::{RunnerConfig, TaskRunner};
    pub use crate::executor::task::{LoopControl, Task, TaskResult, TaskStatus};
    pub use crate::executor::ExecutionStats;
    pub use crate::handlers::HandlerManager;
    pub use crate::inventory::{Host, Inventory, StaticInventory};
    pub use crate::modules::{
        Module, ModuleArgs, ModuleCapabilities, ModuleContext, ModuleError, ModuleOutput,
        ModuleRegistry, ModuleResult,
    };
    pub use crate::tags::TagFilter;
    pub use crate::template::{JinjaRenderer, TemplateRenderer};
    pub use crate::vars::{ScopeLevel, VariableScope};
}

/// Error types
pub mod error;

/// Configuration loading
pub mod config;

/// Logging setup
pub mod logging;

/// Layered variable scopes
pub mod vars;

/// Condition evaluation, task running and play driving
pub mod executor;

/// Handler registration and notification
pub mod handlers;

/// Tag selection
pub mod tags;

/// Module trait, registry and built-in modules
pub mod modules;

/// Transports to managed hosts
pub mod connection;

/// Host resolution
pub mod inventory;

/// Argument templating
pub mod template;

pub use error::{Error, Result};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

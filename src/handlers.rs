//! Handler registration and notification.
//!
//! Handlers are tasks that run only when notified. They are:
//!
//! - **Notified by tasks**: a task that reports `changed` pushes its
//!   `notify` names here
//! - **Deduplicated**: the pending set holds each handler at most once
//! - **Ordered**: pending handlers run in registration order, never in
//!   notification order
//! - **Chainable**: handlers may notify other handlers, which run in the
//!   same [`HandlerManager::process_handlers`] call
//!
//! # Listen Directive
//!
//! A handler is reachable by its own name and by every topic in its
//! `listen` list:
//!
//! ```yaml
//! handlers:
//!   - name: restart nginx
//!     listen: restart web services
//!     service:
//!       name: nginx
//!       state: restarted
//! ```

use std::collections::{BTreeSet, HashMap, HashSet};

use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use serde_json::Value as JsonValue;
use tracing::{debug, info, instrument, warn};

use crate::error::{Error, Result};
use crate::executor::context::RunContext;
use crate::executor::runner::TaskRunner;
use crate::executor::task::{Task, TaskResult};
use crate::inventory::Host;

#[derive(Debug, Default)]
struct Registry {
    slots: Vec<Task>,
    by_name: HashMap<String, usize>,
    by_topic: HashMap<String, Vec<usize>>,
}

impl Registry {
    fn reindex_topics(&mut self) {
        self.by_topic.clear();
        for (slot, handler) in self.slots.iter().enumerate() {
            for topic in &handler.listen {
                let slots = self.by_topic.entry(topic.clone()).or_default();
                if !slots.contains(&slot) {
                    slots.push(slot);
                }
            }
        }
    }

    fn resolve(&self, name: &str) -> Vec<usize> {
        let mut slots: Vec<usize> = self.by_name.get(name).copied().into_iter().collect();
        if let Some(topic) = self.by_topic.get(name) {
            slots.extend(topic.iter().copied());
        }
        slots
    }
}

/// Tracks registered handlers and the set of handlers awaiting execution.
///
/// All methods take `&self`; the manager is shared through an `Arc` with the
/// runner's in-flight workers.
#[derive(Debug, Default)]
pub struct HandlerManager {
    registry: RwLock<Registry>,
    pending: Mutex<BTreeSet<usize>>,
}

impl HandlerManager {
    /// Create an empty handler manager
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler.
    ///
    /// Registering a name that already exists replaces the handler but keeps
    /// its position in the run order.
    pub fn register_handler(&self, handler: Task) -> Result<()> {
        if handler.name.trim().is_empty() {
            return Err(Error::HandlerValidation(
                "handler name must not be empty".to_string(),
            ));
        }

        let mut registry = self.registry.write();
        match registry.by_name.get(&handler.name).copied() {
            Some(slot) => {
                debug!("Replacing handler '{}'", handler.name);
                registry.slots[slot] = handler;
            }
            None => {
                let slot = registry.slots.len();
                debug!("Registering handler '{}' at slot {}", handler.name, slot);
                registry.by_name.insert(handler.name.clone(), slot);
                registry.slots.push(handler);
            }
        }
        registry.reindex_topics();
        Ok(())
    }

    /// Mark handlers as pending by name or listen topic.
    ///
    /// Names that match neither a handler nor a topic are logged and ignored.
    pub fn notify(&self, names: &[String]) {
        if names.is_empty() {
            return;
        }

        let registry = self.registry.read();
        let mut pending = self.pending.lock();
        for name in names {
            let slots = registry.resolve(name);
            if slots.is_empty() {
                warn!("Notified handler '{}' is not defined", name);
                continue;
            }
            for slot in slots {
                if pending.insert(slot) {
                    debug!("Handler '{}' is now pending", registry.slots[slot].name);
                }
            }
        }
    }

    /// Drain the pending set, returning handlers in registration order
    pub fn get_pending_handlers(&self) -> Vec<Task> {
        let registry = self.registry.read();
        let drained = std::mem::take(&mut *self.pending.lock());
        drained
            .into_iter()
            .filter_map(|slot| registry.slots.get(slot).cloned())
            .collect()
    }

    /// Run every pending handler against `hosts`.
    ///
    /// Handlers notified while this call is running are picked up before it
    /// returns. A handler runs at most once per call; later notifications of
    /// a handler that already ran are discarded.
    #[instrument(skip_all, fields(hosts = hosts.len()))]
    pub async fn process_handlers(
        &self,
        ctx: &RunContext,
        runner: &TaskRunner,
        hosts: &[Host],
        vars: &IndexMap<String, JsonValue>,
    ) -> Result<Vec<TaskResult>> {
        let mut ran: HashSet<String> = HashSet::new();
        let mut results = Vec::new();

        loop {
            let batch: Vec<Task> = self
                .get_pending_handlers()
                .into_iter()
                .filter(|h| !ran.contains(&h.name))
                .collect();
            if batch.is_empty() {
                break;
            }

            for handler in batch {
                if ctx.is_cancelled() {
                    warn!("Skipping handler '{}': run cancelled", handler.name);
                    continue;
                }
                info!("Running handler '{}'", handler.name);
                ran.insert(handler.name.clone());
                let outcome = runner.run_handler(ctx, &handler, hosts, vars).await?;
                results.extend(outcome);
            }
        }

        Ok(results)
    }

    /// Check if any handler is registered
    pub fn has_handlers(&self) -> bool {
        !self.registry.read().slots.is_empty()
    }

    /// Check if any handler is pending
    pub fn has_pending(&self) -> bool {
        !self.pending.lock().is_empty()
    }

    /// Registered handler names in registration order
    pub fn handler_names(&self) -> Vec<String> {
        self.registry
            .read()
            .slots
            .iter()
            .map(|h| h.name.clone())
            .collect()
    }

    /// Remove all handlers and pending notifications
    pub fn clear(&self) {
        *self.registry.write() = Registry::default();
        self.pending.lock().clear();
    }
}

//! Tracking for fire-and-forget (`async` + `poll: 0`) units.
//!
//! ```yaml
//! - name: Run long operation
//!   command: /usr/bin/long_operation
//!   async: 3600
//!   poll: 0
//!   register: job
//! ```
//!
//! The unit returns immediately with an `ansible_job_id`; the outcome is
//! retrieved later through [`AsyncJobManager::status`] or
//! [`AsyncJobManager::wait`].

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use tokio::sync::watch;
use tracing::{debug, info};
use uuid::Uuid;

use crate::executor::task::TaskResult;

/// Status of an async job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AsyncJobStatus {
    /// Still running
    Running,
    /// Completed; the unit itself may have failed
    Finished,
    /// Exceeded its `async` budget
    TimedOut,
}

/// Snapshot of an async job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsyncJobInfo {
    /// Job identifier
    pub jid: String,
    /// Host the job runs on
    pub host: String,
    /// Task name
    pub task_name: String,
    /// Current status
    pub status: AsyncJobStatus,
    /// Unit result once finished
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResult>,
    /// Start time (Unix timestamp)
    pub started: i64,
    /// Maximum allowed runtime in seconds
    pub async_timeout: u64,
}

impl AsyncJobInfo {
    /// Whether the job has stopped running
    pub fn is_finished(&self) -> bool {
        self.status != AsyncJobStatus::Running
    }

    /// Status in the shape `async_status` reports
    pub fn to_json(&self) -> JsonValue {
        let mut value = json!({
            "ansible_job_id": self.jid,
            "started": 1,
            "finished": if self.is_finished() { 1 } else { 0 },
        });
        if let (Some(result), Some(obj)) = (&self.result, value.as_object_mut()) {
            if let JsonValue::Object(registered) = result.to_registered() {
                for (k, v) in registered {
                    obj.entry(k).or_insert(v);
                }
            }
        }
        value
    }
}

struct Job {
    info: AsyncJobInfo,
    done: watch::Receiver<bool>,
}

/// Registry of background units
#[derive(Default)]
pub struct AsyncJobManager {
    jobs: std::sync::Arc<RwLock<HashMap<String, Job>>>,
}

impl std::fmt::Debug for AsyncJobManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncJobManager")
            .field("jobs", &self.jobs.read().len())
            .finish()
    }
}

impl AsyncJobManager {
    /// Create an empty manager
    pub fn new() -> Self {
        Self::default()
    }

    /// Generate an Ansible-style job id (`<unix time>.<random>`)
    pub fn generate_job_id() -> String {
        let uuid = Uuid::new_v4().simple().to_string();
        format!("{}.{}", chrono::Utc::now().timestamp(), &uuid[..16])
    }

    /// Spawn `work` in the background, bounded by `async_timeout` seconds.
    ///
    /// Returns the job id immediately.
    pub fn submit<F>(
        &self,
        host: &str,
        task_name: &str,
        module: &str,
        async_timeout: u64,
        work: F,
    ) -> String
    where
        F: Future<Output = TaskResult> + Send + 'static,
    {
        let jid = Self::generate_job_id();
        let (done_tx, done_rx) = watch::channel(false);

        let info = AsyncJobInfo {
            jid: jid.clone(),
            host: host.to_string(),
            task_name: task_name.to_string(),
            status: AsyncJobStatus::Running,
            result: None,
            started: chrono::Utc::now().timestamp(),
            async_timeout,
        };
        self.jobs.write().insert(
            jid.clone(),
            Job {
                info,
                done: done_rx,
            },
        );

        let jobs = std::sync::Arc::clone(&self.jobs);
        let job_id = jid.clone();
        let host = host.to_string();
        let task_name = task_name.to_string();
        let module = module.to_string();
        tokio::spawn(async move {
            let outcome = tokio::time::timeout(Duration::from_secs(async_timeout), work).await;
            let (status, result) = match outcome {
                Ok(result) => (AsyncJobStatus::Finished, result),
                Err(_) => (
                    AsyncJobStatus::TimedOut,
                    TaskResult::failed(
                        host,
                        task_name,
                        module,
                        format!("Job timed out after {} seconds", async_timeout),
                    )
                    .with_data("timed_out", true),
                ),
            };
            debug!("Async job {} ended with status {:?}", job_id, status);
            if let Some(job) = jobs.write().get_mut(&job_id) {
                job.info.status = status;
                job.info.result = Some(result);
            }
            let _ = done_tx.send(true);
        });

        info!("Async job submitted: jid={}", jid);
        jid
    }

    /// Current snapshot of a job
    pub fn status(&self, jid: &str) -> Option<AsyncJobInfo> {
        self.jobs.read().get(jid).map(|job| job.info.clone())
    }

    /// Wait until a job stops running and return its final snapshot
    pub async fn wait(&self, jid: &str) -> Option<AsyncJobInfo> {
        let mut done = self.jobs.read().get(jid).map(|job| job.done.clone())?;
        // The final state is stored before the flag flips.
        let _ = done.wait_for(|finished| *finished).await;
        self.status(jid)
    }

    /// Ids of jobs still running
    pub fn running(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .jobs
            .read()
            .values()
            .filter(|job| !job.info.is_finished())
            .map(|job| job.info.jid.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Forget finished jobs
    pub fn cleanup(&self) {
        self.jobs.write().retain(|_, job| !job.info.is_finished());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_id_format() {
        let jid = AsyncJobManager::generate_job_id();
        let (secs, random) = jid.split_once('.').unwrap();
        assert!(secs.parse::<i64>().is_ok());
        assert_eq!(random.len(), 16);
    }

    #[tokio::test]
    async fn test_submit_and_wait() {
        let manager = AsyncJobManager::new();
        let jid = manager.submit("web1", "sleepy", "command", 5, async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            TaskResult::new("web1", "sleepy", "command").with_data("rc", 0)
        });

        let info = manager.status(&jid).unwrap();
        assert_eq!(info.status, AsyncJobStatus::Running);

        let info = manager.wait(&jid).await.unwrap();
        assert_eq!(info.status, AsyncJobStatus::Finished);
        assert!(info.result.as_ref().unwrap().success);
        assert_eq!(info.to_json()["finished"], 1);
        assert!(manager.running().is_empty());
    }

    #[tokio::test]
    async fn test_timeout() {
        let manager = AsyncJobManager::new();
        let jid = manager.submit("web1", "hang", "command", 0, async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            TaskResult::new("web1", "hang", "command")
        });

        let info = manager.wait(&jid).await.unwrap();
        assert_eq!(info.status, AsyncJobStatus::TimedOut);
        let result = info.result.unwrap();
        assert!(!result.success);
        assert_eq!(result.data["timed_out"], true);

        manager.cleanup();
        assert!(manager.status(&jid).is_none());
    }

    #[tokio::test]
    async fn test_unknown_job() {
        let manager = AsyncJobManager::new();
        assert!(manager.wait("nope").await.is_none());
    }
}

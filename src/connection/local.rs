//! Local connection module
//!
//! Runs commands and file operations on the control node itself.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::{
    BoxedReader, CommandResult, Connection, ConnectionError, ConnectionFactory,
    ConnectionResult, ExecuteOptions, StreamEvent,
};
use crate::inventory::Host;

/// Local connection for executing commands on the current host
#[derive(Debug, Clone)]
pub struct LocalConnection {
    identifier: String,
}

impl LocalConnection {
    /// Create a new local connection named after this machine
    pub fn new() -> Self {
        let identifier = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "localhost".to_string());

        Self { identifier }
    }

    /// Create a local connection with a custom identifier
    pub fn with_identifier(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
        }
    }

    fn build_command(&self, command: &str, options: &ExecuteOptions) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);

        if let Some(cwd) = &options.cwd {
            cmd.current_dir(cwd);
        }
        for (key, value) in &options.env {
            cmd.env(key, value);
        }

        // A dropped future (cancellation, deadline) must not leave the child running
        cmd.kill_on_drop(true)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        cmd
    }
}

impl Default for LocalConnection {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connection for LocalConnection {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    async fn execute(
        &self,
        command: &str,
        options: Option<ExecuteOptions>,
    ) -> ConnectionResult<CommandResult> {
        let options = options.unwrap_or_default();
        debug!(command = %command, "Executing local command");

        let child = self.build_command(command, &options).spawn().map_err(|e| {
            ConnectionError::ExecutionFailed(format!("Failed to spawn process: {}", e))
        })?;

        let output = if let Some(timeout_secs) = options.timeout {
            let timeout = tokio::time::Duration::from_secs(timeout_secs);
            match tokio::time::timeout(timeout, child.wait_with_output()).await {
                Ok(result) => result.map_err(|e| {
                    ConnectionError::ExecutionFailed(format!("Failed to wait for process: {}", e))
                })?,
                Err(_) => return Err(ConnectionError::Timeout(timeout_secs)),
            }
        } else {
            child.wait_with_output().await.map_err(|e| {
                ConnectionError::ExecutionFailed(format!("Failed to wait for process: {}", e))
            })?
        };

        let exit_code = output.status.code().unwrap_or(-1);
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        trace!(exit_code = %exit_code, stdout_len = %stdout.len(), stderr_len = %stderr.len(), "Command completed");

        if output.status.success() {
            Ok(CommandResult::success(stdout, stderr))
        } else {
            Ok(CommandResult::failure(exit_code, stdout, stderr))
        }
    }

    async fn execute_stream(
        &self,
        command: &str,
        options: Option<ExecuteOptions>,
    ) -> ConnectionResult<mpsc::Receiver<StreamEvent>> {
        let options = options.unwrap_or_default();
        debug!(command = %command, "Streaming local command");

        let mut child = self.build_command(command, &options).spawn().map_err(|e| {
            ConnectionError::ExecutionFailed(format!("Failed to spawn process: {}", e))
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ConnectionError::ExecutionFailed("stdout not captured".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ConnectionError::ExecutionFailed("stderr not captured".into()))?;

        let (tx, rx) = mpsc::channel(64);

        let err_tx = tx.clone();
        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if err_tx.send(StreamEvent::Stderr(line)).await.is_err() {
                    break;
                }
            }
        });

        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tx.send(StreamEvent::Stdout(line)).await.is_err() {
                    break;
                }
            }
            let _ = stderr_task.await;
            let code = match child.wait().await {
                Ok(status) => status.code().unwrap_or(-1),
                Err(_) => -1,
            };
            let _ = tx.send(StreamEvent::Exit(code)).await;
        });

        Ok(rx)
    }

    async fn copy(&self, mut reader: BoxedReader, dest: &Path, mode: Option<u32>) -> ConnectionResult<()> {
        debug!(dst = %dest.display(), "Writing file locally");

        if let Some(parent) = dest.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    ConnectionError::TransferFailed(format!(
                        "Failed to create directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let mut file = tokio::fs::File::create(dest).await.map_err(|e| {
            ConnectionError::TransferFailed(format!("Failed to create {}: {}", dest.display(), e))
        })?;
        tokio::io::copy(&mut reader, &mut file).await.map_err(|e| {
            ConnectionError::TransferFailed(format!("Failed to write {}: {}", dest.display(), e))
        })?;

        if let Some(mode) = mode {
            set_mode(dest, mode).await?;
        }

        Ok(())
    }

    async fn fetch(&self, path: &Path) -> ConnectionResult<BoxedReader> {
        debug!(src = %path.display(), "Opening file locally");

        let file = tokio::fs::File::open(path).await.map_err(|e| {
            ConnectionError::TransferFailed(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Ok(Box::new(file))
    }

    async fn close(&self) -> ConnectionResult<()> {
        Ok(())
    }
}

#[cfg(unix)]
async fn set_mode(path: &Path, mode: u32) -> ConnectionResult<()> {
    use std::os::unix::fs::PermissionsExt;

    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .await
        .map_err(|e| {
            ConnectionError::TransferFailed(format!(
                "Failed to set mode {:o} on {}: {}",
                mode,
                path.display(),
                e
            ))
        })
}

#[cfg(not(unix))]
async fn set_mode(_path: &Path, _mode: u32) -> ConnectionResult<()> {
    Ok(())
}

/// Factory returning a [`LocalConnection`] for every host.
#[derive(Debug, Clone, Default)]
pub struct LocalConnectionFactory;

#[async_trait]
impl ConnectionFactory for LocalConnectionFactory {
    async fn connection_for(&self, host: &Host) -> ConnectionResult<Arc<dyn Connection>> {
        Ok(Arc::new(LocalConnection::with_identifier(host.name.clone())))
    }
}

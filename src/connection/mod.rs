//! Connection layer for host communication.
//!
//! Modules never know how a host is reached; they receive a
//! [`Connection`] and call `execute`, `copy` or `fetch` on it. Transports
//! implement the trait, and a [`ConnectionFactory`] hands the runner one
//! connection per target host.
//!
//! # Example
//!
//! ```rust,ignore
//! use converge::connection::{Connection, ExecuteOptions, LocalConnection};
//!
//! let conn = LocalConnection::new();
//! let result = conn.execute("uname -a", None).await?;
//! println!("Output: {}", result.stdout);
//!
//! let opts = ExecuteOptions::new().with_cwd("/opt/app").with_timeout(30);
//! let result = conn.execute("./healthcheck", Some(opts)).await?;
//! ```

/// Local execution connection implementation.
pub mod local;

pub use local::{LocalConnection, LocalConnectionFactory};

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;

use crate::inventory::Host;

/// Errors that can occur while talking to a host.
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// Failed to establish initial connection to the host.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Authentication was rejected by the remote host.
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Command execution failed (not to be confused with non-zero exit code).
    #[error("Command execution failed: {0}")]
    ExecutionFailed(String),

    /// File upload or download operation failed.
    #[error("File transfer failed: {0}")]
    TransferFailed(String),

    /// Connection or operation timed out.
    #[error("Connection timeout after {0} seconds")]
    Timeout(u64),

    /// The specified host could not be resolved.
    #[error("Host not found: {0}")]
    HostNotFound(String),

    /// I/O error during connection operations.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Connection was closed unexpectedly.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The requested operation is not supported by this transport.
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),
}

/// Result type for connection operations.
pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// Where and as whom to connect.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Inventory name of the host
    pub host: String,
    /// Address to connect to (falls back to the host name)
    pub address: String,
    /// Port, if not the transport default
    pub port: Option<u16>,
    /// Remote user
    pub user: Option<String>,
}

impl ConnectionInfo {
    /// Build connection info for an inventory host
    pub fn from_host(host: &Host) -> Self {
        Self {
            host: host.name.clone(),
            address: host.address().to_string(),
            port: host.port,
            user: host.user.clone(),
        }
    }
}

/// The result of executing a command on a connection.
#[derive(Debug, Clone)]
pub struct CommandResult {
    /// Exit code of the command (0 typically indicates success).
    pub exit_code: i32,
    /// Content written to standard output.
    pub stdout: String,
    /// Content written to standard error.
    pub stderr: String,
    /// Convenience flag: `true` if `exit_code == 0`.
    pub success: bool,
}

impl CommandResult {
    /// Create a new successful command result
    pub fn success(stdout: String, stderr: String) -> Self {
        Self {
            exit_code: 0,
            stdout,
            stderr,
            success: true,
        }
    }

    /// Create a new failed command result
    pub fn failure(exit_code: i32, stdout: String, stderr: String) -> Self {
        Self {
            exit_code,
            stdout,
            stderr,
            success: false,
        }
    }

    /// Get the combined output (stdout + stderr)
    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// Options for command execution
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Working directory for the command
    pub cwd: Option<String>,
    /// Environment variables to set
    pub env: HashMap<String, String>,
    /// Timeout in seconds (None for no timeout)
    pub timeout: Option<u64>,
}

impl ExecuteOptions {
    /// Create new execute options
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the working directory
    pub fn with_cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Add an environment variable
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Set the timeout
    pub fn with_timeout(mut self, timeout: u64) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Incremental output from a streaming command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// A line written to standard output
    Stdout(String),
    /// A line written to standard error
    Stderr(String),
    /// The command exited with this code; always the last event
    Exit(i32),
}

/// Boxed reader handed to [`Connection::copy`] and returned by [`Connection::fetch`].
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// The main connection trait that all transport implementations must implement
#[async_trait]
pub trait Connection: Send + Sync {
    /// Get the connection identifier (hostname or container name)
    fn identifier(&self) -> &str;

    /// Establish the transport session
    async fn connect(&self, info: &ConnectionInfo) -> ConnectionResult<()> {
        let _ = info;
        Ok(())
    }

    /// Execute a command on the host
    async fn execute(
        &self,
        command: &str,
        options: Option<ExecuteOptions>,
    ) -> ConnectionResult<CommandResult>;

    /// Execute a command, delivering output as it is produced.
    ///
    /// Transports without streaming support keep the default, which reports
    /// the operation as unsupported.
    async fn execute_stream(
        &self,
        command: &str,
        options: Option<ExecuteOptions>,
    ) -> ConnectionResult<mpsc::Receiver<StreamEvent>> {
        let _ = (command, options);
        Err(ConnectionError::UnsupportedOperation(format!(
            "streaming execution on '{}'",
            self.identifier()
        )))
    }

    /// Write everything from `reader` to `dest` on the host
    async fn copy(&self, reader: BoxedReader, dest: &Path, mode: Option<u32>) -> ConnectionResult<()>;

    /// Open a file on the host for reading
    async fn fetch(&self, path: &Path) -> ConnectionResult<BoxedReader>;

    /// Close the connection
    async fn close(&self) -> ConnectionResult<()>;
}

/// Hands out a connection for each target host.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Get a connected transport for `host`
    async fn connection_for(&self, host: &Host) -> ConnectionResult<Arc<dyn Connection>>;
}

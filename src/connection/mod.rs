//! Connection layer for remote host communication.
//!
//! This module provides a unified interface for executing commands and
//! transferring files across transports. All transports implement the
//! [`Connection`] trait; [`create_connection`] picks the variant from a
//! [`ConnectionInfo`]. Streaming execution yields [`StreamEvent`]s on a
//! bounded channel terminated by exactly one `Done` or `Error` event.

/// Local execution transport.
pub mod local;

/// Connection pooling with health checks and idle eviction.
pub mod pool;

/// Pure Rust SSH transport using russh.
pub mod ssh;

/// WinRM (WS-Management) transport for Windows hosts.
pub mod winrm;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::vars::VarMap;

/// Default SSH port.
pub const DEFAULT_SSH_PORT: u16 = 22;
/// Default WinRM HTTP port.
pub const DEFAULT_WINRM_PORT: u16 = 5985;
/// Default WinRM HTTPS port.
pub const DEFAULT_WINRM_SSL_PORT: u16 = 5986;

/// Bound of the per-call stream event channel.
pub(crate) const STREAM_BUFFER: usize = 100;

/// Errors that can occur during connection operations.
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// Failed to establish the initial connection.
    #[error("Connection to '{host}' failed: {message}")]
    ConnectionFailed {
        /// Target host
        host: String,
        /// Error message
        message: String,
    },

    /// Authentication was rejected by the remote host.
    #[error("Authentication failed for '{host}': {message}")]
    AuthenticationFailed {
        /// Target host
        host: String,
        /// Error message
        message: String,
    },

    /// An operation was attempted before `connect` or after `close`.
    #[error("Not connected to '{host}'")]
    NotConnected {
        /// Target host
        host: String,
    },

    /// Command execution failed (distinct from a non-zero exit code).
    #[error("Execution failed on '{host}': {message}")]
    ExecutionFailed {
        /// Target host
        host: String,
        /// Error message
        message: String,
    },

    /// File upload or download failed.
    #[error("File transfer failed: {0}")]
    TransferFailed(String),

    /// Connection or operation timed out.
    #[error("Operation on '{host}' timed out after {seconds} seconds")]
    Timeout {
        /// Target host
        host: String,
        /// Timeout that fired
        seconds: u64,
    },

    /// The operation was cancelled.
    #[error("Operation cancelled")]
    Cancelled,

    /// No connection could be leased from the pool.
    #[error("Connection pool exhausted")]
    PoolExhausted,

    /// Configuration is invalid or incomplete.
    #[error("Invalid connection configuration: {0}")]
    InvalidConfig(String),

    /// I/O error during connection operations.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for connection operations.
pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// Transport selector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionKind {
    /// Direct execution on the control node
    Local,
    /// SSH transport
    Ssh,
    /// WinRM transport
    Winrm,
    /// Unspecified: SSH, or local for localhost literals
    #[default]
    #[serde(rename = "")]
    Unspecified,
}

/// Everything needed to reach one host.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionInfo {
    /// Transport selector
    #[serde(rename = "type")]
    pub kind: ConnectionKind,
    /// Host name or address
    pub host: String,
    /// Port; 0 means the transport default
    pub port: u16,
    /// Login user
    pub user: String,
    /// Password, when password auth applies
    pub password: Option<String>,
    /// Private key path, when key auth applies
    pub private_key: Option<String>,
    /// Use HTTPS for WinRM
    pub use_ssl: bool,
    /// Skip TLS certificate verification
    pub skip_verify: bool,
    /// Connect timeout in seconds; 0 means the pool default
    pub timeout: u64,
    /// Free-form per-host variables
    pub variables: VarMap,
}

impl ConnectionInfo {
    /// Build an info for `host` with everything else defaulted.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Default::default()
        }
    }

    /// Resolve the `Unspecified` kind: local for localhost literals,
    /// SSH otherwise.
    pub fn effective_kind(&self) -> ConnectionKind {
        match self.kind {
            ConnectionKind::Unspecified => {
                if matches!(self.host.as_str(), "localhost" | "127.0.0.1" | "::1" | "") {
                    ConnectionKind::Local
                } else {
                    ConnectionKind::Ssh
                }
            }
            kind => kind,
        }
    }

    /// Port with transport defaults applied (22 for SSH and local,
    /// 5985/5986 for WinRM depending on SSL).
    pub fn effective_port(&self) -> u16 {
        if self.port != 0 {
            return self.port;
        }
        match self.effective_kind() {
            ConnectionKind::Winrm => {
                if self.use_ssl {
                    DEFAULT_WINRM_SSL_PORT
                } else {
                    DEFAULT_WINRM_PORT
                }
            }
            _ => DEFAULT_SSH_PORT,
        }
    }

    /// Whether this host is reached over WinRM.
    pub fn is_windows(&self) -> bool {
        self.effective_kind() == ConnectionKind::Winrm
    }

    /// Pool key: `host:port:user`.
    pub fn pool_key(&self) -> String {
        format!("{}:{}:{}", self.host, self.effective_port(), self.user)
    }
}

/// Callback invoked for each output line during streaming execution.
pub type OutputCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Callback invoked for progress updates.
pub type ProgressCallback = Arc<dyn Fn(&ProgressInfo) + Send + Sync>;

/// Options for command execution.
#[derive(Clone, Default)]
pub struct ExecuteOptions {
    /// Timeout in seconds (None for no timeout)
    pub timeout: Option<u64>,
    /// Working directory for the command
    pub working_dir: Option<String>,
    /// Environment variables to set
    pub env: IndexMap<String, String>,
    /// Run as this user (sudo -u / su)
    pub user: Option<String>,
    /// Run with privilege escalation
    pub sudo: bool,
    /// Shell selector (WinRM: "cmd" or "powershell")
    pub shell: Option<String>,
    /// Emit output line events during execution
    pub stream_output: bool,
    /// Per-line output callback
    pub output_callback: Option<OutputCallback>,
    /// Progress callback
    pub progress_callback: Option<ProgressCallback>,
    /// Cancellation scope for this call
    pub cancellation: CancellationToken,
}

impl std::fmt::Debug for ExecuteOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecuteOptions")
            .field("timeout", &self.timeout)
            .field("working_dir", &self.working_dir)
            .field("env", &self.env)
            .field("user", &self.user)
            .field("sudo", &self.sudo)
            .field("shell", &self.shell)
            .field("stream_output", &self.stream_output)
            .field("output_callback", &self.output_callback.is_some())
            .field("progress_callback", &self.progress_callback.is_some())
            .finish()
    }
}

impl ExecuteOptions {
    /// Create default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the timeout.
    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout = Some(seconds);
        self
    }

    /// Set the working directory.
    pub fn with_working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Add an environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Escalate to `user` (root when None) via sudo.
    pub fn with_sudo(mut self, user: Option<String>) -> Self {
        self.sudo = true;
        self.user = user;
        self
    }

    /// Bind this call to a cancellation scope.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }
}

/// The result of executing a command over a connection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandResult {
    /// Exit code of the command
    pub exit_code: i32,
    /// Standard output
    pub stdout: String,
    /// Standard error
    pub stderr: String,
    /// Convenience flag: `exit_code == 0`
    pub success: bool,
}

impl CommandResult {
    /// Successful result.
    pub fn success(stdout: String, stderr: String) -> Self {
        Self {
            exit_code: 0,
            stdout,
            stderr,
            success: true,
        }
    }

    /// Failed result.
    pub fn failure(exit_code: i32, stdout: String, stderr: String) -> Self {
        Self {
            exit_code,
            stdout,
            stderr,
            success: false,
        }
    }

    /// Combined stdout and stderr.
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

/// Progress of a long-running operation. Percentages are monotonically
/// non-decreasing for a given operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressInfo {
    /// Operation stage ("executing", "transferring", "completed", ...)
    pub stage: String,
    /// Completion percentage in [0, 100]
    pub percentage: f32,
    /// Human-readable progress message
    pub message: String,
    /// Current step, when steps apply
    pub step_number: Option<u32>,
    /// Total steps, when steps apply
    pub total_steps: Option<u32>,
    /// Total bytes, for transfers
    pub bytes_total: Option<u64>,
    /// Transferred bytes, for transfers
    pub bytes_done: Option<u64>,
    /// When this update was produced
    pub timestamp: DateTime<Utc>,
}

impl ProgressInfo {
    /// Create a progress update for `stage`.
    pub fn new(stage: impl Into<String>, percentage: f32, message: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            percentage: percentage.clamp(0.0, 100.0),
            message: message.into(),
            step_number: None,
            total_steps: None,
            bytes_total: None,
            bytes_done: None,
            timestamp: Utc::now(),
        }
    }

    /// Attach byte counters.
    pub fn with_bytes(mut self, done: u64, total: Option<u64>) -> Self {
        self.bytes_done = Some(done);
        self.bytes_total = total;
        self
    }
}

/// Status of a step within a multi-step operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    /// Not yet started
    Pending,
    /// In progress
    Running,
    /// Finished successfully
    Completed,
    /// Finished with an error
    Failed,
    /// Intentionally not run
    Skipped,
}

/// One step of a multi-step operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepInfo {
    /// Unique step id
    pub id: String,
    /// Step name
    pub name: String,
    /// What the step does
    pub description: String,
    /// Current status
    pub status: StepStatus,
    /// When the step started
    pub start_time: DateTime<Utc>,
    /// When the step ended, once terminal
    pub end_time: Option<DateTime<Utc>>,
    /// Duration in seconds, once terminal
    pub duration: Option<f64>,
    /// Free-form metadata
    pub metadata: VarMap,
}

impl StepInfo {
    /// Create a pending step.
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            description: description.into(),
            status: StepStatus::Pending,
            start_time: Utc::now(),
            end_time: None,
            duration: None,
            metadata: VarMap::new(),
        }
    }

    /// Transition to a terminal status, stamping end time and duration.
    pub fn finish(mut self, status: StepStatus) -> Self {
        let end = Utc::now();
        self.duration = (end - self.start_time).to_std().ok().map(|d| d.as_secs_f64());
        self.end_time = Some(end);
        self.status = status;
        self
    }
}

/// Events emitted on the streaming execution channel.
///
/// The channel closes after a terminal event; exactly one terminal event
/// (`Done` xor `Error`) is produced per `execute_stream` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// A line of standard output
    Stdout {
        /// Line content without the trailing newline
        data: String,
        /// When the line was read
        timestamp: DateTime<Utc>,
    },
    /// A line of standard error
    Stderr {
        /// Line content without the trailing newline
        data: String,
        /// When the line was read
        timestamp: DateTime<Utc>,
    },
    /// Progress update
    Progress {
        /// The update
        progress: ProgressInfo,
    },
    /// A step began
    StepStart {
        /// The step
        step: StepInfo,
    },
    /// A step changed
    StepUpdate {
        /// The step
        step: StepInfo,
    },
    /// A step finished
    StepEnd {
        /// The step
        step: StepInfo,
    },
    /// Terminal: the command finished
    Done {
        /// Final command result
        result: CommandResult,
        /// When the command finished
        timestamp: DateTime<Utc>,
    },
    /// Terminal: the stream failed
    Error {
        /// Failure detail
        error: String,
        /// When the failure was observed
        timestamp: DateTime<Utc>,
    },
}

impl StreamEvent {
    /// A line of stdout, stamped now.
    pub fn stdout(data: impl Into<String>) -> Self {
        Self::Stdout {
            data: data.into(),
            timestamp: Utc::now(),
        }
    }

    /// A line of stderr, stamped now.
    pub fn stderr(data: impl Into<String>) -> Self {
        Self::Stderr {
            data: data.into(),
            timestamp: Utc::now(),
        }
    }

    /// A progress update.
    pub fn progress(progress: ProgressInfo) -> Self {
        Self::Progress { progress }
    }

    /// The terminal success event.
    pub fn done(result: CommandResult) -> Self {
        Self::Done {
            result,
            timestamp: Utc::now(),
        }
    }

    /// The terminal failure event.
    pub fn error(error: impl Into<String>) -> Self {
        Self::Error {
            error: error.into(),
            timestamp: Utc::now(),
        }
    }

    /// Whether this event ends the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Done { .. } | StreamEvent::Error { .. })
    }
}

/// Receiver half of a streaming execution channel.
pub type EventStream = mpsc::Receiver<StreamEvent>;

/// Adapt an event channel into a `Stream` for combinator-style consumers.
pub fn into_event_stream(rx: EventStream) -> tokio_stream::wrappers::ReceiverStream<StreamEvent> {
    tokio_stream::wrappers::ReceiverStream::new(rx)
}

/// A readable handle to fetched file content.
pub type FetchReader = Box<dyn AsyncRead + Send + Unpin>;

/// The connection contract every transport implements.
///
/// State machine: *New → Connected → Closed*. Every operation except
/// `close` and `is_connected` fails with [`ConnectionError::NotConnected`]
/// before `connect` succeeds or after `close`. `connect` on a connected
/// connection is idempotent (it may rebind the info); `close` is idempotent.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Target description for error tagging.
    fn host(&self) -> String;

    /// Establish the transport.
    async fn connect(&mut self, info: ConnectionInfo) -> ConnectionResult<()>;

    /// Execute a command and wait for completion.
    async fn execute(
        &self,
        command: &str,
        options: &ExecuteOptions,
    ) -> ConnectionResult<CommandResult>;

    /// Execute a command, streaming events until a terminal event.
    async fn execute_stream(
        &self,
        command: &str,
        options: &ExecuteOptions,
    ) -> ConnectionResult<EventStream>;

    /// Stream `src` to the remote path `dest` with `mode` permissions.
    async fn copy(
        &self,
        src: &mut (dyn AsyncRead + Send + Unpin),
        dest: &str,
        mode: u32,
    ) -> ConnectionResult<()>;

    /// Open a reader over the remote file `src`.
    async fn fetch(&self, src: &str) -> ConnectionResult<FetchReader>;

    /// Release transport resources. Idempotent.
    async fn close(&mut self) -> ConnectionResult<()>;

    /// Whether the transport is currently usable.
    fn is_connected(&self) -> bool;

    /// Cheap liveness probe.
    async fn ping(&self) -> ConnectionResult<()>;

    /// Whether `path` exists as a regular file.
    async fn file_exists(&self, path: &str) -> ConnectionResult<bool> {
        let result = self
            .execute(
                &format!("test -f {}", shell_words::quote(path)),
                &ExecuteOptions::default(),
            )
            .await?;
        Ok(result.success)
    }

    /// Create `path` (and parents) with `mode` permissions.
    async fn create_directory(&self, path: &str, mode: u32) -> ConnectionResult<()> {
        let quoted = shell_words::quote(path).into_owned();
        let result = self
            .execute(
                &format!("mkdir -p {} && chmod {:o} {}", quoted, mode, quoted),
                &ExecuteOptions::default(),
            )
            .await?;
        if result.success {
            Ok(())
        } else {
            Err(ConnectionError::TransferFailed(format!(
                "mkdir {} failed: {}",
                path, result.stderr
            )))
        }
    }

    /// Remove the file at `path`, ignoring absence.
    async fn remove_file(&self, path: &str) -> ConnectionResult<()> {
        let result = self
            .execute(
                &format!("rm -f {}", shell_words::quote(path)),
                &ExecuteOptions::default(),
            )
            .await?;
        if result.success {
            Ok(())
        } else {
            Err(ConnectionError::TransferFailed(format!(
                "rm {} failed: {}",
                path, result.stderr
            )))
        }
    }
}

/// Build the transport variant selected by `info`, not yet connected.
pub fn create_connection(info: &ConnectionInfo) -> Box<dyn Connection> {
    match info.effective_kind() {
        ConnectionKind::Local => Box::new(local::LocalConnection::new()),
        ConnectionKind::Winrm => Box::new(winrm::WinRmConnection::new()),
        _ => Box::new(ssh::SshConnection::new()),
    }
}

/// Wrap a shell command with escalation, working directory, and environment
/// for transports that execute through a remote shell.
pub(crate) fn wrap_shell_command(command: &str, options: &ExecuteOptions) -> String {
    let mut inner = String::new();
    for (key, value) in &options.env {
        inner.push_str(&format!(
            "export {}={}; ",
            key,
            shell_words::quote(value)
        ));
    }
    if let Some(dir) = &options.working_dir {
        inner.push_str(&format!("cd {} && ", shell_words::quote(dir)));
    }
    inner.push_str(command);

    if options.sudo {
        let user = options.user.as_deref().unwrap_or("root");
        format!("sudo -u {} sh -c {}", user, shell_words::quote(&inner))
    } else if let Some(user) = &options.user {
        format!("su -c {} {}", shell_words::quote(&inner), user)
    } else {
        inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_kind_and_port() {
        let info = ConnectionInfo::new("localhost");
        assert_eq!(info.effective_kind(), ConnectionKind::Local);
        assert_eq!(info.effective_port(), 22);

        let info = ConnectionInfo::new("web01.example.com");
        assert_eq!(info.effective_kind(), ConnectionKind::Ssh);
        assert_eq!(info.effective_port(), 22);

        let mut info = ConnectionInfo::new("win01");
        info.kind = ConnectionKind::Winrm;
        assert_eq!(info.effective_port(), 5985);
        info.use_ssl = true;
        assert_eq!(info.effective_port(), 5986);
        assert!(info.is_windows());

        info.port = 12345;
        assert_eq!(info.effective_port(), 12345);
    }

    #[test]
    fn test_pool_key() {
        let mut info = ConnectionInfo::new("web01");
        info.user = "deploy".into();
        assert_eq!(info.pool_key(), "web01:22:deploy");
    }

    #[test]
    fn test_command_result() {
        let ok = CommandResult::success("out".into(), String::new());
        assert!(ok.success);
        assert_eq!(ok.exit_code, 0);
        assert_eq!(ok.combined_output(), "out");

        let failed = CommandResult::failure(2, "out".into(), "err".into());
        assert!(!failed.success);
        assert_eq!(failed.combined_output(), "out\nerr");
    }

    #[test]
    fn test_stream_event_terminality() {
        assert!(!StreamEvent::stdout("line").is_terminal());
        assert!(!StreamEvent::progress(ProgressInfo::new("executing", 0.0, "")).is_terminal());
        assert!(StreamEvent::done(CommandResult::success(String::new(), String::new())).is_terminal());
        assert!(StreamEvent::error("boom").is_terminal());
    }

    #[test]
    fn test_progress_clamps_percentage() {
        assert_eq!(ProgressInfo::new("s", 150.0, "").percentage, 100.0);
        assert_eq!(ProgressInfo::new("s", -3.0, "").percentage, 0.0);
    }

    #[test]
    fn test_step_finish_stamps_duration() {
        let step = StepInfo::new("probe", "run probe").finish(StepStatus::Completed);
        assert_eq!(step.status, StepStatus::Completed);
        assert!(step.end_time.is_some());
        assert!(step.duration.is_some());
    }

    #[test]
    fn test_wrap_shell_command() {
        let opts = ExecuteOptions::new()
            .with_working_dir("/opt/app")
            .with_env("FOO", "bar baz");
        let wrapped = wrap_shell_command("ls", &opts);
        assert_eq!(wrapped, "export FOO='bar baz'; cd /opt/app && ls");

        let opts = ExecuteOptions::new().with_sudo(Some("deploy".into()));
        let wrapped = wrap_shell_command("whoami", &opts);
        assert!(wrapped.starts_with("sudo -u deploy sh -c "));
    }
}

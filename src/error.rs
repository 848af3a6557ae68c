//! Error types for Muster.
//!
//! Each subsystem defines its own `thiserror` enum (`ConnectionError`,
//! `VaultError`, `ModuleError`, ...); this module aggregates them into the
//! crate-level [`Error`] used at the engine boundary.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for Muster operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type for Muster.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Task Errors
    // ========================================================================
    /// Task execution failed.
    #[error("Task '{task}' failed on host '{host}': {message}")]
    TaskFailed {
        /// Task name
        task: String,
        /// Target host
        host: String,
        /// Error message
        message: String,
    },

    /// Task timeout.
    #[error("Task '{task}' timed out on host '{host}' after {timeout_secs} seconds")]
    TaskTimeout {
        /// Task name
        task: String,
        /// Target host
        host: String,
        /// Timeout in seconds
        timeout_secs: u64,
    },

    // ========================================================================
    // Subsystem Errors
    // ========================================================================
    /// Connection-layer error.
    #[error(transparent)]
    Connection(#[from] crate::connection::ConnectionError),

    /// Module lookup, validation, or execution error.
    #[error(transparent)]
    Module(#[from] crate::modules::ModuleError),

    /// Vault encryption/decryption error.
    #[error(transparent)]
    Vault(#[from] crate::vault::VaultError),

    /// Inventory loading or pattern-resolution error.
    #[error(transparent)]
    Inventory(#[from] crate::inventory::InventoryError),

    /// Condition evaluation error.
    #[error(transparent)]
    Condition(#[from] crate::executor::condition::ConditionError),

    /// Template rendering error.
    #[error(transparent)]
    Template(#[from] crate::template::TemplateError),

    // ========================================================================
    // Handler Errors
    // ========================================================================
    /// Handler not found.
    #[error("Handler '{0}' not found")]
    HandlerNotFound(String),

    /// Handler registration rejected.
    #[error("Invalid handler: {0}")]
    InvalidHandler(String),

    // ========================================================================
    // Strategy Errors
    // ========================================================================
    /// Strategy-level failure (non-ignored host failure under linear).
    #[error("Execution stopped: {failed} host(s) failed on task '{task}'")]
    StrategyStopped {
        /// Task that triggered the stop
        task: String,
        /// Number of failed hosts
        failed: usize,
        /// Hosts that failed
        hosts: Vec<String>,
    },

    /// The run was cancelled.
    #[error("Execution cancelled")]
    Cancelled,

    // ========================================================================
    // IO / Serialization
    // ========================================================================
    /// File not found.
    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parsing error.
    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    /// JSON parsing error.
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Creates a new task failed error.
    pub fn task_failed(
        task: impl Into<String>,
        host: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::TaskFailed {
            task: task.into(),
            host: host.into(),
            message: message.into(),
        }
    }

    /// Returns the conventional exit code for this error when the engine is
    /// embedded in a CLI: 2 user error, 3 unreachable hosts, 4 failed hosts,
    /// 130 interrupted.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Module(crate::modules::ModuleError::NotFound(_))
            | Error::Module(crate::modules::ModuleError::InvalidParameter(_))
            | Error::Module(crate::modules::ModuleError::MissingParameter(_))
            | Error::Condition(_)
            | Error::Template(_)
            | Error::Inventory(_)
            | Error::Vault(_)
            | Error::YamlParse(_)
            | Error::JsonParse(_) => 2,
            Error::Connection(_) => 3,
            Error::TaskFailed { .. } | Error::TaskTimeout { .. } | Error::StrategyStopped { .. } => 4,
            Error::Cancelled => 130,
            _ => 1,
        }
    }
}

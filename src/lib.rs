//! # Muster - Configuration Management and Remote Execution Engine
//!
//! Muster is an async-first execution engine for declarative automation:
//! plays composed of tasks invoke named modules against an inventory of
//! hosts, over pooled SSH, WinRM, or local transports.
//!
//! ## Core Concepts
//!
//! - **Inventory**: Hosts and groups (with the implicit `all`), loaded
//!   from a YAML document, with glob patterns and `[01:05]` range
//!   expansion
//! - **Tasks**: One module invocation with arguments, conditions, loops,
//!   retries, and notification policy
//! - **Modules**: Units of work that validate their arguments and run
//!   over a connection
//! - **Strategies**: Scheduling disciplines over the (tasks × hosts)
//!   matrix - linear, free, host-pinned, and debug
//! - **Handlers**: Deferred tasks triggered by change notifications
//! - **Facts**: System information gathered from hosts into the variable
//!   store
//! - **Vault**: `$ANSIBLE_VAULT`-format encrypted secrets, file and
//!   inline forms
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                         Outer driver                          │
//! │        (resolves hosts, iterates plays, picks strategy)       │
//! └───────────────────────────────────────────────────────────────┘
//!          │                    │                       │
//!          ▼                    ▼                       ▼
//! ┌────────────────┐  ┌──────────────────┐  ┌─────────────────────┐
//! │   Inventory    │  │   Task Runner    │  │   Variable Store    │
//! │ (hosts+groups) │  │ (when/loops/retry│  │ (facts < vars, deep │
//! │                │  │  register/notify)│  │  merge, snapshots)  │
//! └────────────────┘  └──────────────────┘  └─────────────────────┘
//!                               │
//!                               ▼
//! ┌───────────────────────────────────────────────────────────────┐
//! │                       Connection Pool                         │
//! │     (keyed leases, health checks, idle eviction, retry)       │
//! └───────────────────────────────────────────────────────────────┘
//!                               │
//!                ┌──────────────┼──────────────┐
//!                ▼              ▼              ▼
//!           ┌────────┐    ┌─────────┐    ┌─────────┐
//!           │ Local  │    │   SSH   │    │  WinRM  │
//!           └────────┘    └─────────┘    └─────────┘
//! ```
//!
//! ## Quick Example
//!
//! ```rust,ignore
//! use muster::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> muster::error::Result<()> {
//!     let inventory = Inventory::from_file("inventory.yml")?;
//!     let hosts: Vec<Host> = inventory.get_hosts("web*")?.into_iter().cloned().collect();
//!
//!     let runner = Arc::new(TaskRunner::new(
//!         Arc::new(ModuleRegistry::with_builtins()),
//!         Arc::new(ConnectionPool::new()),
//!         Arc::new(VariableStore::new()),
//!         Arc::new(HandlerManager::new()),
//!         RunnerOptions::default(),
//!     ));
//!
//!     let task = Task::new("check uptime", "command")
//!         .with_arg("cmd", serde_json::json!("uptime"));
//!     let ctx = tokio_util::sync::CancellationToken::new();
//!     let results = runner.run(&ctx, &task, &hosts, &Default::default()).await?;
//!     for result in results {
//!         println!("{}: {}", result.host, result.message);
//!     }
//!     Ok(())
//! }
//! ```

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

// Re-export commonly used items in prelude
pub mod prelude {
    //! Convenient re-exports of commonly used types and traits.

    pub use crate::connection::local::LocalConnection;
    pub use crate::connection::pool::{ConnectionPool, PoolConfig, PooledConnection};
    pub use crate::connection::ssh::SshConnection;
    pub use crate::connection::winrm::WinRmConnection;
    pub use crate::connection::{
        CommandResult, Connection, ConnectionError, ConnectionInfo, ConnectionKind,
        ExecuteOptions, ProgressInfo, StepInfo, StepStatus, StreamEvent,
    };

    pub use crate::error::{Error, Result};

    pub use crate::executor::condition::{Condition, ConditionEvaluator};
    pub use crate::executor::task::{RunnerOptions, TaskRunner};
    pub use crate::executor::{
        run_strategy, ExecutionStats, HostTaskExecutor, Strategy, StrategyOptions,
        StrategyOutcome,
    };

    pub use crate::facts::FactGatherer;
    pub use crate::handlers::HandlerManager;
    pub use crate::inventory::{Group, Host, Inventory};
    pub use crate::modules::{Module, ModuleError, ModuleRegistry};
    pub use crate::playbook::{Play, Task, TaskResult};
    pub use crate::template::TemplateEngine;
    pub use crate::vars::{merge_vars, VarMap, VariableStore};
    pub use crate::vault::{Vault, VaultManager};
}

// ============================================================================
// Core Modules
// ============================================================================

/// Error types and result aliases.
pub mod error;

/// Task, play, and result data model.
pub mod playbook;

/// Layered variable and fact storage with deep merge.
pub mod vars;

// ============================================================================
// Infrastructure
// ============================================================================

/// Connection layer: local, SSH, and WinRM transports plus pooling.
pub mod connection;

/// System fact gathering over a connection.
pub mod facts;

/// Host and group inventory management.
pub mod inventory;

// ============================================================================
// Execution Engine
// ============================================================================

/// Strategies, condition evaluation, and the task runner.
pub mod executor;

/// Handler registration and change-notification queueing.
pub mod handlers;

// ============================================================================
// Modules (built-in task implementations)
// ============================================================================

/// Built-in modules: command, shell, debug, set_fact, copy, ping.
pub mod modules;

// ============================================================================
// Templating and Secrets
// ============================================================================

/// Template rendering and the filter library.
pub mod template;

/// Vault-encrypted secrets (AES-256-CTR + HMAC-SHA-256 + PBKDF2).
pub mod vault;

/// Returns the current crate version.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

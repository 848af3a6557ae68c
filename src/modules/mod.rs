//! Module system: the named units of work tasks invoke.
//!
//! A module validates its arguments (pure) and runs over a connection to
//! produce a [`TaskResult`]. The registry maps names to modules; lookup of
//! an unknown name fails with [`ModuleError::NotFound`].
//!
//! Modules receive three conventional argument keys when present:
//! `_check_mode` (dry-run, no mutation), `_diff` (include before/after in
//! `data.diff`), and `_task_vars` (the effective variable view).

pub mod command;
pub mod copy;
pub mod debug;
pub mod ping;
pub mod set_fact;
pub mod shell;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::connection::{Connection, ConnectionError};
use crate::playbook::TaskResult;
use crate::vars::VarMap;

/// Errors that can occur during module validation or execution.
#[derive(Error, Debug)]
pub enum ModuleError {
    /// No module registered under this name.
    #[error("Module '{0}' not found")]
    NotFound(String),

    /// An argument has an invalid value.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// A required argument is missing.
    #[error("Missing required parameter: {0}")]
    MissingParameter(String),

    /// The module failed while running.
    #[error("Module execution failed: {0}")]
    ExecutionFailed(String),

    /// Transport failure during the run.
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// Result type for module operations.
pub type ModuleResult<T> = Result<T, ModuleError>;

/// Human-readable module documentation.
#[derive(Debug, Clone, Default)]
pub struct ModuleDoc {
    /// Module name
    pub name: &'static str,
    /// One-line description
    pub description: &'static str,
    /// Parameter descriptions as (name, required, description)
    pub parameters: Vec<(&'static str, bool, &'static str)>,
}

/// The contract every module implements.
#[async_trait]
pub trait Module: Send + Sync {
    /// The module's registry name.
    fn name(&self) -> &'static str;

    /// Validate arguments without performing I/O.
    fn validate(&self, args: &VarMap) -> ModuleResult<()>;

    /// Run the module over `conn`. Implementations set `success`,
    /// `changed`, and `host` (from the connection) and populate `data`.
    async fn run(
        &self,
        ctx: &CancellationToken,
        conn: &dyn Connection,
        args: &VarMap,
    ) -> ModuleResult<TaskResult>;

    /// Optional documentation.
    fn documentation(&self) -> Option<ModuleDoc> {
        None
    }
}

/// Whether the conventional `_check_mode` key requests a dry run.
pub fn check_mode(args: &VarMap) -> bool {
    matches!(args.get("_check_mode"), Some(JsonValue::Bool(true)))
}

/// Whether the conventional `_diff` key requests before/after output.
pub fn diff_mode(args: &VarMap) -> bool {
    matches!(args.get("_diff"), Some(JsonValue::Bool(true)))
}

/// The effective variable view forwarded by the runner, when present.
pub fn task_vars(args: &VarMap) -> VarMap {
    match args.get("_task_vars") {
        Some(JsonValue::Object(map)) => map
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
        _ => VarMap::new(),
    }
}

/// Fetch a required string argument.
pub fn required_str(args: &VarMap, key: &str) -> ModuleResult<String> {
    match args.get(key) {
        Some(JsonValue::String(s)) if !s.is_empty() => Ok(s.clone()),
        Some(JsonValue::String(_)) => Err(ModuleError::InvalidParameter(format!(
            "'{}' must not be empty",
            key
        ))),
        Some(other) => Err(ModuleError::InvalidParameter(format!(
            "'{}' must be a string, got {}",
            key, other
        ))),
        None => Err(ModuleError::MissingParameter(key.to_string())),
    }
}

/// Fetch an optional string argument.
pub fn optional_str(args: &VarMap, key: &str) -> Option<String> {
    match args.get(key) {
        Some(JsonValue::String(s)) => Some(s.clone()),
        Some(JsonValue::Number(n)) => Some(n.to_string()),
        Some(JsonValue::Bool(b)) => Some(b.to_string()),
        _ => None,
    }
}

/// Registration and lookup of named modules.
pub struct ModuleRegistry {
    modules: HashMap<String, Arc<dyn Module>>,
}

impl ModuleRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            modules: HashMap::new(),
        }
    }

    /// Create a registry with the built-in modules registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(command::CommandModule));
        registry.register(Arc::new(shell::ShellModule));
        registry.register(Arc::new(debug::DebugModule));
        registry.register(Arc::new(set_fact::SetFactModule));
        registry.register(Arc::new(copy::CopyModule));
        registry.register(Arc::new(ping::PingModule));
        registry
    }

    /// Register a module under its name.
    pub fn register(&mut self, module: Arc<dyn Module>) {
        self.modules.insert(module.name().to_string(), module);
    }

    /// Look up a module by name.
    pub fn lookup(&self, name: &str) -> ModuleResult<Arc<dyn Module>> {
        self.modules
            .get(name)
            .cloned()
            .ok_or_else(|| ModuleError::NotFound(name.to_string()))
    }

    /// Registered module names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.modules.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_registry_builtins() {
        let registry = ModuleRegistry::with_builtins();
        let names = registry.names();
        assert!(names.contains(&"command".to_string()));
        assert!(names.contains(&"shell".to_string()));
        assert!(names.contains(&"debug".to_string()));
        assert!(names.contains(&"set_fact".to_string()));
        assert!(names.contains(&"copy".to_string()));
        assert!(names.contains(&"ping".to_string()));
    }

    #[test]
    fn test_lookup_unknown_module() {
        let registry = ModuleRegistry::with_builtins();
        assert!(matches!(
            registry.lookup("no_such_module"),
            Err(ModuleError::NotFound(_))
        ));
    }

    #[test]
    fn test_conventional_keys() {
        let args: VarMap = [
            ("_check_mode".to_string(), json!(true)),
            ("_diff".to_string(), json!(false)),
            ("_task_vars".to_string(), json!({"env": "prod"})),
        ]
        .into_iter()
        .collect();

        assert!(check_mode(&args));
        assert!(!diff_mode(&args));
        assert_eq!(task_vars(&args).get("env"), Some(&json!("prod")));
    }

    #[test]
    fn test_required_str() {
        let args: VarMap = [
            ("cmd".to_string(), json!("uptime")),
            ("empty".to_string(), json!("")),
            ("num".to_string(), json!(7)),
        ]
        .into_iter()
        .collect();

        assert_eq!(required_str(&args, "cmd").unwrap(), "uptime");
        assert!(matches!(
            required_str(&args, "empty"),
            Err(ModuleError::InvalidParameter(_))
        ));
        assert!(matches!(
            required_str(&args, "num"),
            Err(ModuleError::InvalidParameter(_))
        ));
        assert!(matches!(
            required_str(&args, "missing"),
            Err(ModuleError::MissingParameter(_))
        ));
    }
}

//! Task and play definitions, plus the canonical per-host execution record.
//!
//! A [`Task`] is one invocation of a module with arguments, conditions, and
//! retry/notification policy. A [`TaskResult`] is the typed record a module
//! run produces for a single host.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::executor::condition::Condition;

/// Loop bookkeeping knobs (`loop_control` in task syntax).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopControl {
    /// Variable name the current item is bound to.
    #[serde(default = "default_loop_var")]
    pub loop_var: String,
    /// Optional variable name receiving the zero-based loop index.
    #[serde(default)]
    pub index_var: Option<String>,
    /// Optional label template used when reporting loop iterations.
    #[serde(default)]
    pub label: Option<String>,
}

fn default_loop_var() -> String {
    "item".to_string()
}

impl Default for LoopControl {
    fn default() -> Self {
        Self {
            loop_var: default_loop_var(),
            index_var: None,
            label: None,
        }
    }
}

/// A task to be executed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Task {
    /// Task name (displayed during execution)
    pub name: String,
    /// Module to execute
    pub module: String,
    /// Module arguments
    pub args: IndexMap<String, JsonValue>,
    /// Task-level variables (win over play vars)
    pub vars: IndexMap<String, JsonValue>,
    /// Conditional guarding execution
    pub when: Option<Condition>,
    /// Overrides the failure verdict of the result
    pub failed_when: Option<Condition>,
    /// Overrides the changed verdict of the result
    pub changed_when: Option<Condition>,
    /// Items to iterate over (literal sequence, variable name, or "N-M" range)
    #[serde(rename = "loop", alias = "with_items")]
    pub loop_items: Option<JsonValue>,
    /// Loop variable naming
    pub loop_control: LoopControl,
    /// Store the final result under this variable name
    pub register: Option<String>,
    /// Handlers to notify when the task reports a change
    pub notify: Vec<String>,
    /// Tags for run filtering
    pub tags: Vec<String>,
    /// Retry attempts beyond the first (total attempts = retries + 1)
    pub retries: u32,
    /// Seconds to sleep between attempts
    pub delay: u64,
    /// Retry until this condition holds
    pub until: Option<Condition>,
    /// Report failures but do not stop the run
    pub ignore_errors: bool,
    /// Extra environment for the module invocation
    pub environment: IndexMap<String, String>,
    /// Privilege escalation
    #[serde(rename = "become")]
    pub become_: bool,
    /// User to escalate to
    pub become_user: Option<String>,
    /// Additional notification topic this task answers to (handlers only)
    pub listen: Option<String>,
}

impl Task {
    /// Create a task invoking `module` with no arguments.
    pub fn new(name: impl Into<String>, module: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            module: module.into(),
            ..Default::default()
        }
    }

    /// Set a module argument.
    pub fn with_arg(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.args.insert(key.into(), value);
        self
    }

    /// Set the `when` condition.
    pub fn with_when(mut self, cond: impl Into<Condition>) -> Self {
        self.when = Some(cond.into());
        self
    }

    /// Set the register name.
    pub fn with_register(mut self, name: impl Into<String>) -> Self {
        self.register = Some(name.into());
        self
    }

    /// Set the tags.
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }
}

/// A named group of tasks bound to a host pattern.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Play {
    /// Play name
    pub name: String,
    /// Host pattern resolved against the inventory
    pub hosts: String,
    /// Play-level variables
    pub vars: IndexMap<String, JsonValue>,
    /// Tasks in execution order
    pub tasks: Vec<Task>,
    /// Handlers notifiable by this play's tasks
    pub handlers: Vec<Task>,
    /// Gather facts before the first task
    pub gather_facts: bool,
}

/// The typed record produced by one (task, host) execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    /// Host the task ran on
    pub host: String,
    /// Task name
    pub task_name: String,
    /// Module that produced this result
    pub module_name: String,
    /// Whether the invocation succeeded
    pub success: bool,
    /// Whether the invocation changed remote state
    pub changed: bool,
    /// Human-readable message
    pub message: String,
    /// Failure detail, when `success` is false
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Wall-clock start
    pub start_time: DateTime<Utc>,
    /// Wall-clock end
    pub end_time: DateTime<Utc>,
    /// Duration in seconds
    pub duration: f64,
    /// Module-specific payload (`stdout`, `stderr`, `cmd`, `exit_code`, ...)
    pub data: IndexMap<String, JsonValue>,
}

impl TaskResult {
    /// Create a result skeleton for `host`; timing starts now.
    pub fn new(host: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            host: host.into(),
            task_name: String::new(),
            module_name: String::new(),
            success: true,
            changed: false,
            message: String::new(),
            error: None,
            start_time: now,
            end_time: now,
            duration: 0.0,
            data: IndexMap::new(),
        }
    }

    /// Create a successful result.
    pub fn ok(host: impl Into<String>, message: impl Into<String>) -> Self {
        let mut r = Self::new(host);
        r.message = message.into();
        r.finish()
    }

    /// Create a successful result that changed state.
    pub fn changed(host: impl Into<String>, message: impl Into<String>) -> Self {
        let mut r = Self::new(host);
        r.changed = true;
        r.message = message.into();
        r.finish()
    }

    /// Create a failed result.
    pub fn failed(host: impl Into<String>, error: impl Into<String>) -> Self {
        let mut r = Self::new(host);
        let error = error.into();
        r.success = false;
        r.message = error.clone();
        r.error = Some(error);
        r.finish()
    }

    /// Create a skipped result; skipped results count as successful and
    /// carry `data.skipped = true`.
    pub fn skipped(host: impl Into<String>, reason: impl Into<String>) -> Self {
        let mut r = Self::new(host);
        r.message = format!("Skipped: {}", reason.into());
        r.data.insert("skipped".into(), JsonValue::Bool(true));
        r.finish()
    }

    /// Stamp the end time and duration.
    pub fn finish(mut self) -> Self {
        self.end_time = Utc::now();
        self.duration = (self.end_time - self.start_time)
            .to_std()
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        self
    }

    /// Whether this result represents a skipped task.
    pub fn is_skipped(&self) -> bool {
        matches!(self.data.get("skipped"), Some(JsonValue::Bool(true)))
    }

    /// Attach a data entry.
    pub fn with_data(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    /// The result's exit code, when the module recorded one.
    pub fn exit_code(&self) -> Option<i64> {
        self.data.get("exit_code").and_then(JsonValue::as_i64)
    }

    /// Serialize into the variable-store shape used by `register` and the
    /// `result` view of `failed_when`/`changed_when`/`until` conditions.
    pub fn to_value(&self) -> JsonValue {
        let mut map = serde_json::Map::new();
        map.insert("host".into(), JsonValue::String(self.host.clone()));
        map.insert("task".into(), JsonValue::String(self.task_name.clone()));
        map.insert("success".into(), JsonValue::Bool(self.success));
        map.insert("failed".into(), JsonValue::Bool(!self.success));
        map.insert("changed".into(), JsonValue::Bool(self.changed));
        map.insert("msg".into(), JsonValue::String(self.message.clone()));
        if let Some(err) = &self.error {
            map.insert("error".into(), JsonValue::String(err.clone()));
        }
        if let Some(rc) = self.exit_code() {
            map.insert("rc".into(), JsonValue::from(rc));
        }
        for (k, v) in &self.data {
            map.entry(k.clone()).or_insert_with(|| v.clone());
        }
        JsonValue::Object(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_builder() {
        let task = Task::new("install nginx", "command")
            .with_arg("cmd", JsonValue::String("apt install nginx".into()))
            .with_register("install_out")
            .with_tags(["web", "packages"]);

        assert_eq!(task.name, "install nginx");
        assert_eq!(task.module, "command");
        assert_eq!(task.register.as_deref(), Some("install_out"));
        assert_eq!(task.tags, vec!["web", "packages"]);
        assert_eq!(task.loop_control.loop_var, "item");
    }

    #[test]
    fn test_task_deserializes_with_items_alias() {
        let yaml = r#"
name: add users
module: user
args: { state: present }
with_items: [alice, bob]
"#;
        let task: Task = serde_yaml::from_str(yaml).unwrap();
        let items = task.loop_items.unwrap();
        assert_eq!(items.as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_result_skipped_shape() {
        let r = TaskResult::skipped("web01", "condition was false");
        assert!(r.success);
        assert!(!r.changed);
        assert!(r.is_skipped());
        assert!(r.message.contains("Skipped"));
    }

    #[test]
    fn test_result_to_value_exposes_rc() {
        let r = TaskResult::ok("web01", "done").with_data("exit_code", JsonValue::from(3));
        let v = r.to_value();
        assert_eq!(v["rc"], JsonValue::from(3));
        assert_eq!(v["failed"], JsonValue::Bool(false));
    }
}

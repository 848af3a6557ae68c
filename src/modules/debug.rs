//! Debug module: print a message or a variable during a run.

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tokio_util::sync::CancellationToken;

use super::{optional_str, task_vars, Module, ModuleDoc, ModuleResult};
use crate::connection::Connection;
use crate::playbook::TaskResult;
use crate::vars::{lookup_path, VarMap};

/// Module that reports a message without touching the target.
pub struct DebugModule;

#[async_trait]
impl Module for DebugModule {
    fn name(&self) -> &'static str {
        "debug"
    }

    fn validate(&self, _args: &VarMap) -> ModuleResult<()> {
        Ok(())
    }

    async fn run(
        &self,
        _ctx: &CancellationToken,
        conn: &dyn Connection,
        args: &VarMap,
    ) -> ModuleResult<TaskResult> {
        let host = conn.host();

        let mut result = if let Some(var) = optional_str(args, "var") {
            let vars = task_vars(args);
            let value = lookup_path(&vars, &var).unwrap_or(JsonValue::Null);
            let rendered = match &value {
                JsonValue::String(s) => s.clone(),
                other => other.to_string(),
            };
            let mut r = TaskResult::ok(host, format!("{} = {}", var, rendered));
            r.data.insert(var, value);
            r
        } else {
            let msg = optional_str(args, "msg").unwrap_or_else(|| "Hello world!".to_string());
            let mut r = TaskResult::ok(host, msg.clone());
            r.data.insert("msg".into(), JsonValue::String(msg));
            r
        };
        result.module_name = self.name().to_string();
        Ok(result)
    }

    fn documentation(&self) -> Option<ModuleDoc> {
        Some(ModuleDoc {
            name: "debug",
            description: "Print a message or variable value",
            parameters: vec![
                ("msg", false, "Message to print"),
                ("var", false, "Variable path to print instead of msg"),
            ],
        })
    }
}

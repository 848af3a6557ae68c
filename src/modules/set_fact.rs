//! set_fact module: bind values into the variable store for the rest of
//! the run.
//!
//! Every argument that does not start with an underscore becomes a fact.
//! The task runner merges `data.ansible_facts` into the store.

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tokio_util::sync::CancellationToken;

use super::{Module, ModuleDoc, ModuleError, ModuleResult};
use crate::connection::Connection;
use crate::playbook::TaskResult;
use crate::vars::VarMap;

/// Module that contributes facts without touching the target.
pub struct SetFactModule;

#[async_trait]
impl Module for SetFactModule {
    fn name(&self) -> &'static str {
        "set_fact"
    }

    fn validate(&self, args: &VarMap) -> ModuleResult<()> {
        if args.keys().all(|k| k.starts_with('_')) {
            return Err(ModuleError::MissingParameter(
                "set_fact requires at least one fact".into(),
            ));
        }
        Ok(())
    }

    async fn run(
        &self,
        _ctx: &CancellationToken,
        conn: &dyn Connection,
        args: &VarMap,
    ) -> ModuleResult<TaskResult> {
        let facts: serde_json::Map<String, JsonValue> = args
            .iter()
            .filter(|(k, _)| !k.starts_with('_'))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let count = facts.len();
        let mut result = TaskResult::ok(conn.host(), format!("Set {} fact(s)", count));
        result.module_name = self.name().to_string();
        result
            .data
            .insert("ansible_facts".into(), JsonValue::Object(facts));
        Ok(result)
    }

    fn documentation(&self) -> Option<ModuleDoc> {
        Some(ModuleDoc {
            name: "set_fact",
            description: "Set variables for the remainder of the run",
            parameters: vec![("<any>", true, "Each key/value pair becomes a fact")],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::local::LocalConnection;
    use crate::connection::{Connection as _, ConnectionInfo};
    use serde_json::json;

    #[tokio::test]
    async fn test_set_fact_collects_pairs() {
        let mut conn = LocalConnection::new();
        conn.connect(ConnectionInfo::new("localhost")).await.unwrap();

        let args: VarMap = [
            ("app_version".to_string(), json!("1.2.3")),
            ("replicas".to_string(), json!(3)),
            ("_check_mode".to_string(), json!(false)),
        ]
        .into_iter()
        .collect();

        let ctx = CancellationToken::new();
        let result = SetFactModule.run(&ctx, &conn, &args).await.unwrap();
        let facts = result.data["ansible_facts"].as_object().unwrap();
        assert_eq!(facts.len(), 2);
        assert_eq!(facts["app_version"], json!("1.2.3"));
        assert_eq!(facts["replicas"], json!(3));
    }

    #[test]
    fn test_validate_rejects_empty() {
        let args: VarMap = [("_check_mode".to_string(), json!(true))].into_iter().collect();
        assert!(SetFactModule.validate(&args).is_err());
    }
}

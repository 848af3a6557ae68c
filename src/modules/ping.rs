//! Ping module: verify the transport round-trips.

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tokio_util::sync::CancellationToken;

use super::{Module, ModuleDoc, ModuleResult};
use crate::connection::Connection;
use crate::playbook::TaskResult;
use crate::vars::VarMap;

/// Module that probes connectivity and answers `pong`.
pub struct PingModule;

#[async_trait]
impl Module for PingModule {
    fn name(&self) -> &'static str {
        "ping"
    }

    fn validate(&self, _args: &VarMap) -> ModuleResult<()> {
        Ok(())
    }

    async fn run(
        &self,
        _ctx: &CancellationToken,
        conn: &dyn Connection,
        _args: &VarMap,
    ) -> ModuleResult<TaskResult> {
        let host = conn.host();
        let mut result = match conn.ping().await {
            Ok(()) => {
                let mut r = TaskResult::ok(host, "pong");
                r.data.insert("ping".into(), JsonValue::String("pong".into()));
                r
            }
            Err(e) => TaskResult::failed(host, e.to_string()),
        };
        result.module_name = self.name().to_string();
        Ok(result)
    }

    fn documentation(&self) -> Option<ModuleDoc> {
        Some(ModuleDoc {
            name: "ping",
            description: "Verify the connection to the host",
            parameters: vec![],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::local::LocalConnection;
    use crate::connection::{Connection as _, ConnectionInfo};

    #[tokio::test]
    async fn test_ping_pong() {
        let mut conn = LocalConnection::new();
        conn.connect(ConnectionInfo::new("localhost")).await.unwrap();
        let ctx = CancellationToken::new();
        let result = PingModule.run(&ctx, &conn, &VarMap::new()).await.unwrap();
        assert!(result.success);
        assert_eq!(result.data["ping"], serde_json::json!("pong"));
    }
}

//! Copy module: place content or a local file on the target host.
//!
//! Content is compared against the remote file first so an unchanged file
//! reports `changed=false`. With `_diff`, before/after text lands in
//! `data.diff`; with `_check_mode` nothing is written.

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

use super::{
    check_mode, diff_mode, optional_str, required_str, Module, ModuleDoc, ModuleError,
    ModuleResult,
};
use crate::connection::Connection;
use crate::playbook::TaskResult;
use crate::vars::VarMap;

/// Module that writes files over the connection's copy primitive.
pub struct CopyModule;

fn parse_mode(args: &VarMap) -> ModuleResult<u32> {
    match args.get("mode") {
        None => Ok(0o644),
        Some(JsonValue::Number(n)) => n
            .as_u64()
            .map(|m| m as u32)
            .ok_or_else(|| ModuleError::InvalidParameter("mode must be a positive integer".into())),
        Some(JsonValue::String(s)) => u32::from_str_radix(s.trim_start_matches("0o"), 8)
            .map_err(|_| ModuleError::InvalidParameter(format!("invalid octal mode '{}'", s))),
        Some(other) => Err(ModuleError::InvalidParameter(format!(
            "mode must be an octal string or integer, got {}",
            other
        ))),
    }
}

async fn source_bytes(args: &VarMap) -> ModuleResult<Vec<u8>> {
    if let Some(content) = optional_str(args, "content") {
        return Ok(content.into_bytes());
    }
    let src = required_str(args, "src")
        .map_err(|_| ModuleError::MissingParameter("either 'content' or 'src'".into()))?;
    tokio::fs::read(&src)
        .await
        .map_err(|e| ModuleError::ExecutionFailed(format!("cannot read src {}: {}", src, e)))
}

#[async_trait]
impl Module for CopyModule {
    fn name(&self) -> &'static str {
        "copy"
    }

    fn validate(&self, args: &VarMap) -> ModuleResult<()> {
        required_str(args, "dest")?;
        if optional_str(args, "content").is_none() && optional_str(args, "src").is_none() {
            return Err(ModuleError::MissingParameter(
                "either 'content' or 'src'".into(),
            ));
        }
        parse_mode(args).map(|_| ())
    }

    async fn run(
        &self,
        _ctx: &CancellationToken,
        conn: &dyn Connection,
        args: &VarMap,
    ) -> ModuleResult<TaskResult> {
        let host = conn.host();
        let dest = required_str(args, "dest")?;
        let mode = parse_mode(args)?;
        let payload = source_bytes(args).await?;

        // Read the current remote content to decide whether anything
        // changes.
        let existing: Option<Vec<u8>> = if conn.file_exists(&dest).await? {
            let mut reader = conn.fetch(&dest).await?;
            let mut buf = Vec::new();
            reader
                .read_to_end(&mut buf)
                .await
                .map_err(|e| ModuleError::ExecutionFailed(format!("fetch failed: {}", e)))?;
            Some(buf)
        } else {
            None
        };

        let unchanged = existing.as_deref() == Some(payload.as_slice());

        let mut result = TaskResult::new(host);
        result.module_name = self.name().to_string();
        result.data.insert("dest".into(), JsonValue::String(dest.clone()));

        if diff_mode(args) {
            let before = existing
                .as_ref()
                .map(|b| String::from_utf8_lossy(b).into_owned())
                .unwrap_or_default();
            let after = String::from_utf8_lossy(&payload).into_owned();
            result.data.insert(
                "diff".into(),
                serde_json::json!({ "before": before, "after": after }),
            );
        }

        if unchanged {
            result.message = format!("{} is already up to date", dest);
            return Ok(result.finish());
        }

        if check_mode(args) {
            result.changed = true;
            result.message = format!("{} would be updated (check mode)", dest);
            return Ok(result.finish());
        }

        let mut src = std::io::Cursor::new(payload);
        conn.copy(&mut src, &dest, mode).await?;

        result.changed = true;
        result.message = format!("{} written", dest);
        Ok(result.finish())
    }

    fn documentation(&self) -> Option<ModuleDoc> {
        Some(ModuleDoc {
            name: "copy",
            description: "Copy content or a local file to the target host",
            parameters: vec![
                ("dest", true, "Remote destination path"),
                ("content", false, "Literal file content"),
                ("src", false, "Local source path (alternative to content)"),
                ("mode", false, "Octal file mode, default 0644"),
            ],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::local::LocalConnection;
    use crate::connection::{Connection as _, ConnectionInfo};
    use serde_json::json;

    fn args(pairs: &[(&str, JsonValue)]) -> VarMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    async fn local() -> LocalConnection {
        let mut conn = LocalConnection::new();
        conn.connect(ConnectionInfo::new("localhost")).await.unwrap();
        conn
    }

    #[test]
    fn test_validate() {
        let module = CopyModule;
        assert!(module
            .validate(&args(&[("dest", json!("/tmp/x")), ("content", json!("hi"))]))
            .is_ok());
        assert!(module.validate(&args(&[("content", json!("hi"))])).is_err());
        assert!(module.validate(&args(&[("dest", json!("/tmp/x"))])).is_err());
        assert!(module
            .validate(&args(&[
                ("dest", json!("/tmp/x")),
                ("content", json!("hi")),
                ("mode", json!("notoctal")),
            ]))
            .is_err());
    }

    #[test]
    fn test_parse_mode() {
        assert_eq!(parse_mode(&args(&[])).unwrap(), 0o644);
        assert_eq!(parse_mode(&args(&[("mode", json!("0600"))])).unwrap(), 0o600);
        assert_eq!(
            parse_mode(&args(&[("mode", json!("0o755"))])).unwrap(),
            0o755
        );
    }

    #[tokio::test]
    async fn test_copy_writes_and_is_idempotent() {
        let conn = local().await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("app.conf");
        let dest_str = dest.to_string_lossy().to_string();

        let module = CopyModule;
        let ctx = CancellationToken::new();
        let call_args = args(&[
            ("dest", json!(dest_str)),
            ("content", json!("port = 8080\n")),
        ]);

        let result = module.run(&ctx, &conn, &call_args).await.unwrap();
        assert!(result.success);
        assert!(result.changed);
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "port = 8080\n");

        // Second run with identical content reports no change.
        let result = module.run(&ctx, &conn, &call_args).await.unwrap();
        assert!(result.success);
        assert!(!result.changed);
    }

    #[tokio::test]
    async fn test_copy_check_mode_and_diff() {
        let conn = local().await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("app.conf");
        std::fs::write(&dest, "old\n").unwrap();

        let module = CopyModule;
        let ctx = CancellationToken::new();
        let call_args = args(&[
            ("dest", json!(dest.to_string_lossy())),
            ("content", json!("new\n")),
            ("_check_mode", json!(true)),
            ("_diff", json!(true)),
        ]);

        let result = module.run(&ctx, &conn, &call_args).await.unwrap();
        assert!(result.changed);
        assert_eq!(result.data["diff"]["before"], json!("old\n"));
        assert_eq!(result.data["diff"]["after"], json!("new\n"));
        // Check mode left the file alone.
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "old\n");
    }
}

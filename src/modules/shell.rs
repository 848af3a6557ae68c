//! Shell module: run a command line through the remote shell.
//!
//! Unlike the command module, the command string reaches the shell
//! verbatim, so pipes, redirects, and globbing work.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::command::run_command_line;
use super::{required_str, Module, ModuleDoc, ModuleResult};
use crate::connection::Connection;
use crate::playbook::TaskResult;
use crate::vars::VarMap;

/// Module for executing shell command lines.
pub struct ShellModule;

#[async_trait]
impl Module for ShellModule {
    fn name(&self) -> &'static str {
        "shell"
    }

    fn validate(&self, args: &VarMap) -> ModuleResult<()> {
        required_str(args, "cmd").map(|_| ())
    }

    async fn run(
        &self,
        ctx: &CancellationToken,
        conn: &dyn Connection,
        args: &VarMap,
    ) -> ModuleResult<TaskResult> {
        let command_line = required_str(args, "cmd")?;
        run_command_line(self.name(), command_line, ctx, conn, args).await
    }

    fn documentation(&self) -> Option<ModuleDoc> {
        Some(ModuleDoc {
            name: "shell",
            description: "Execute a command line through the shell",
            parameters: vec![
                ("cmd", true, "Shell command line"),
                ("chdir", false, "Directory to run in"),
                ("creates", false, "Skip when this path exists"),
                ("removes", false, "Skip when this path is absent"),
                ("timeout", false, "Per-run timeout in seconds"),
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

    #[tokio::test]
    async fn test_shell_pipes_work() {
        let mut conn = LocalConnection::new();
        conn.connect(ConnectionInfo::new("localhost")).await.unwrap();

        let module = ShellModule;
        let args: VarMap = [(
            "cmd".to_string(),
            json!("printf 'a\\nb\\nc\\n' | wc -l | tr -d ' '"),
        )]
        .into_iter()
        .collect();

        let ctx = CancellationToken::new();
        let result = module.run(&ctx, &conn, &args).await.unwrap();
        assert!(result.success);
        assert_eq!(result.data["stdout"].as_str().unwrap().trim(), "3");
    }

    #[test]
    fn test_validate_requires_cmd() {
        let module = ShellModule;
        assert!(module.validate(&VarMap::new()).is_err());
    }
}

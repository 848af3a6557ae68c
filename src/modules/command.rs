//! Command module: run a command on the target host.
//!
//! Arguments are taken as `cmd` (split into words) or `argv` (explicit
//! word list) and re-quoted before execution, so shell metacharacters are
//! not interpreted. Use the shell module for pipes and redirects.

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tokio_util::sync::CancellationToken;

use super::{
    check_mode, optional_str, Module, ModuleDoc, ModuleError, ModuleResult,
};
use crate::connection::{Connection, ExecuteOptions};
use crate::playbook::TaskResult;
use crate::vars::VarMap;

/// Module for executing commands without shell interpretation.
pub struct CommandModule;

/// Resolve `cmd`/`argv` into a safely quoted command line.
pub(crate) fn build_command_line(args: &VarMap) -> ModuleResult<String> {
    if let Some(JsonValue::Array(argv)) = args.get("argv") {
        let words: Vec<String> = argv
            .iter()
            .map(|v| match v {
                JsonValue::String(s) => Ok(s.clone()),
                other => Err(ModuleError::InvalidParameter(format!(
                    "argv entries must be strings, got {}",
                    other
                ))),
            })
            .collect::<ModuleResult<_>>()?;
        if words.is_empty() {
            return Err(ModuleError::InvalidParameter("argv cannot be empty".into()));
        }
        return Ok(shell_words::join(&words));
    }

    let cmd = optional_str(args, "cmd")
        .ok_or_else(|| ModuleError::MissingParameter("either 'cmd' or 'argv'".into()))?;
    let words = shell_words::split(&cmd)
        .map_err(|e| ModuleError::InvalidParameter(format!("cannot parse cmd: {}", e)))?;
    if words.is_empty() {
        return Err(ModuleError::InvalidParameter("cmd cannot be empty".into()));
    }
    Ok(shell_words::join(&words))
}

/// `creates`/`removes` guards: Some(reason) when the command should be
/// skipped.
pub(crate) async fn creates_removes_guard(
    conn: &dyn Connection,
    args: &VarMap,
) -> ModuleResult<Option<String>> {
    if let Some(creates) = optional_str(args, "creates") {
        if conn.file_exists(&creates).await? {
            return Ok(Some(format!("'{}' exists", creates)));
        }
    }
    if let Some(removes) = optional_str(args, "removes") {
        if !conn.file_exists(&removes).await? {
            return Ok(Some(format!("'{}' does not exist", removes)));
        }
    }
    Ok(None)
}

/// Shared execution path for the command and shell modules.
pub(crate) async fn run_command_line(
    module_name: &'static str,
    command_line: String,
    ctx: &CancellationToken,
    conn: &dyn Connection,
    args: &VarMap,
) -> ModuleResult<TaskResult> {
    let host = conn.host();

    if let Some(reason) = creates_removes_guard(conn, args).await? {
        let mut result = TaskResult::ok(host, format!("Skipped, {}", reason));
        result.module_name = module_name.to_string();
        result.data.insert("cmd".into(), JsonValue::String(command_line));
        return Ok(result);
    }

    if check_mode(args) {
        let mut result = TaskResult::ok(host, "Command would run (check mode)");
        result.module_name = module_name.to_string();
        result.data.insert("cmd".into(), JsonValue::String(command_line));
        result.data.insert("skipped".into(), JsonValue::Bool(true));
        return Ok(result);
    }

    let mut options = ExecuteOptions::default().with_cancellation(ctx.clone());
    if let Some(chdir) = optional_str(args, "chdir") {
        options.working_dir = Some(chdir);
    }
    if let Some(timeout) = args.get("timeout").and_then(JsonValue::as_u64) {
        options.timeout = Some(timeout);
    }

    let output = conn.execute(&command_line, &options).await?;

    let mut result = TaskResult::new(host);
    result.module_name = module_name.to_string();
    result.success = output.success;
    // A command that ran and exited zero is reported as a change.
    result.changed = output.success;
    result.message = if output.success {
        "Command executed".to_string()
    } else {
        format!("Command failed with exit code {}", output.exit_code)
    };
    if !output.success {
        result.error = Some(output.stderr.trim_end().to_string());
    }
    result
        .data
        .insert("cmd".into(), JsonValue::String(command_line));
    result
        .data
        .insert("stdout".into(), JsonValue::String(output.stdout));
    result
        .data
        .insert("stderr".into(), JsonValue::String(output.stderr));
    result
        .data
        .insert("exit_code".into(), JsonValue::from(output.exit_code));
    Ok(result.finish())
}

#[async_trait]
impl Module for CommandModule {
    fn name(&self) -> &'static str {
        "command"
    }

    fn validate(&self, args: &VarMap) -> ModuleResult<()> {
        build_command_line(args).map(|_| ())
    }

    async fn run(
        &self,
        ctx: &CancellationToken,
        conn: &dyn Connection,
        args: &VarMap,
    ) -> ModuleResult<TaskResult> {
        let command_line = build_command_line(args)?;
        run_command_line(self.name(), command_line, ctx, conn, args).await
    }

    fn documentation(&self) -> Option<ModuleDoc> {
        Some(ModuleDoc {
            name: "command",
            description: "Execute commands without going through a shell",
            parameters: vec![
                ("cmd", false, "Command line to run (either this or argv)"),
                ("argv", false, "Command as an explicit word list"),
                ("chdir", false, "Directory to run in"),
                ("creates", false, "Skip when this path exists"),
                ("removes", false, "Skip when this path is absent"),
                ("timeout", false, "Per-run timeout in seconds"),
            ],
        })
    }
}

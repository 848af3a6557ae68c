//! Task runner: orchestrates a single task across hosts.
//!
//! The pipeline per task: tag filter, `when` evaluation, module lookup and
//! validation, loop expansion, then per-host execution (connection lease,
//! variable view, argument rendering, retry loop with `until`,
//! `changed_when`/`failed_when` overrides), followed by `register` and
//! handler notification.

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::connection::pool::ConnectionPool;
use crate::error::Result;
use crate::executor::condition::{
    evaluate_changed_when, evaluate_failed_when, evaluate_loop_items, evaluate_when, result_view,
    ConditionEvaluator,
};
use crate::executor::HostTaskExecutor;
use crate::handlers::HandlerManager;
use crate::inventory::Host;
use crate::modules::ModuleRegistry;
use crate::playbook::{Task, TaskResult};
use crate::template::render_args;
use crate::vars::{merge_vars, VarMap, VariableStore};

/// Runner tuning.
#[derive(Debug, Clone)]
pub struct RunnerOptions {
    /// Concurrent per-host slots within one task
    pub forks: usize,
    /// Run tag filter; empty means run everything
    pub tags: Vec<String>,
    /// Dry-run: forwarded to modules as `_check_mode`
    pub check_mode: bool,
    /// Forwarded to modules as `_diff`
    pub diff_mode: bool,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            forks: 5,
            tags: Vec::new(),
            check_mode: false,
            diff_mode: false,
        }
    }
}

/// Orchestrates single-task execution over the shared collaborators.
pub struct TaskRunner {
    registry: Arc<ModuleRegistry>,
    pool: Arc<ConnectionPool>,
    store: Arc<VariableStore>,
    handlers: Arc<HandlerManager>,
    options: RunnerOptions,
}

impl TaskRunner {
    /// Create a runner over the shared collaborators.
    pub fn new(
        registry: Arc<ModuleRegistry>,
        pool: Arc<ConnectionPool>,
        store: Arc<VariableStore>,
        handlers: Arc<HandlerManager>,
        options: RunnerOptions,
    ) -> Self {
        Self {
            registry,
            pool,
            store,
            handlers,
            options,
        }
    }

    /// The shared variable store.
    pub fn store(&self) -> &Arc<VariableStore> {
        &self.store
    }

    /// Whether the run tag filter admits this task.
    fn tags_admit(&self, task: &Task) -> bool {
        if self.options.tags.is_empty() {
            return true;
        }
        let runner_tags = &self.options.tags;
        if task.tags.is_empty() {
            return runner_tags.iter().any(|t| t == "always" || t == "all");
        }
        task.tags
            .iter()
            .any(|t| t == "always" || runner_tags.contains(t))
    }

    fn skipped_results(task: &Task, hosts: &[Host], reason: &str) -> Vec<TaskResult> {
        hosts
            .iter()
            .map(|host| {
                let mut result = TaskResult::skipped(&host.name, reason);
                result.task_name = task.name.clone();
                result.module_name = task.module.clone();
                result
            })
            .collect()
    }

    /// Run `task` across `hosts` with `vars` as the base variable view.
    pub async fn run(
        &self,
        ctx: &CancellationToken,
        task: &Task,
        hosts: &[Host],
        vars: &VarMap,
    ) -> Result<Vec<TaskResult>> {
        if hosts.is_empty() {
            return Ok(Vec::new());
        }

        if !self.tags_admit(task) {
            trace!(task = %task.name, "excluded by tag filter");
            return Ok(Self::skipped_results(task, hosts, "excluded by tags"));
        }

        // Task vars win over the caller's view.
        let merged = merge_vars(vars, &task.vars);

        if !evaluate_when(task.when.as_ref(), &merged)? {
            debug!(task = %task.name, "when condition false, skipping");
            return Ok(Self::skipped_results(task, hosts, "condition was false"));
        }

        let module = self.registry.lookup(&task.module)?;
        module.validate(&task.args)?;

        // Loop expansion: one pass per item, or a single pass.
        let passes: Vec<Option<(usize, JsonValue, usize)>> = match &task.loop_items {
            Some(loop_value) => {
                let items = evaluate_loop_items(loop_value, &merged)?;
                let total = items.len();
                items
                    .into_iter()
                    .enumerate()
                    .map(|(i, item)| Some((i, item, total)))
                    .collect()
            }
            None => vec![None],
        };

        let mut all_results = Vec::new();
        for pass in passes {
            if ctx.is_cancelled() {
                return Err(crate::error::Error::Cancelled);
            }
            let mut pass_vars = merged.clone();
            let loop_meta = pass.map(|(index, item, total)| {
                pass_vars.insert(task.loop_control.loop_var.clone(), item.clone());
                if let Some(index_var) = &task.loop_control.index_var {
                    pass_vars.insert(index_var.clone(), JsonValue::from(index));
                }
                (index, item, total)
            });

            let mut results = self
                .fan_out(ctx, task, hosts, &pass_vars, loop_meta.as_ref())
                .await;
            all_results.append(&mut results);
        }

        // Contribute set_fact output to the store.
        for result in &all_results {
            if let Some(JsonValue::Object(facts)) = result.data.get("ansible_facts") {
                for (key, value) in facts {
                    self.store.set(key.clone(), value.clone());
                }
            }
        }

        if let Some(register) = &task.register {
            let value = if all_results.len() == 1 {
                all_results[0].to_value()
            } else {
                JsonValue::Object(
                    [(
                        "results".to_string(),
                        JsonValue::Array(all_results.iter().map(TaskResult::to_value).collect()),
                    )]
                    .into_iter()
                    .collect(),
                )
            };
            self.store.register(register.clone(), value);
        }

        if !task.notify.is_empty() && all_results.iter().any(|r| r.changed) {
            self.handlers.notify(&task.notify);
        }

        Ok(all_results)
    }

    /// Run one pass of the task across all hosts, bounded by `forks`.
    async fn fan_out(
        &self,
        ctx: &CancellationToken,
        task: &Task,
        hosts: &[Host],
        pass_vars: &VarMap,
        loop_meta: Option<&(usize, JsonValue, usize)>,
    ) -> Vec<TaskResult> {
        let semaphore = Arc::new(Semaphore::new(self.options.forks.max(1)));

        let handles: Vec<_> = hosts
            .iter()
            .map(|host| {
                let semaphore = Arc::clone(&semaphore);
                let registry = Arc::clone(&self.registry);
                let pool = Arc::clone(&self.pool);
                let task = task.clone();
                let host = host.clone();
                let pass_vars = pass_vars.clone();
                let loop_meta = loop_meta.cloned();
                let options = self.options.clone();
                let ctx = ctx.clone();

                tokio::spawn(async move {
                    let _permit = semaphore.acquire().await;
                    execute_on_host(
                        &ctx,
                        &registry,
                        &pool,
                        &options,
                        &task,
                        &host,
                        &pass_vars,
                        loop_meta.as_ref(),
                    )
                    .await
                })
            })
            .collect();

        let mut results = Vec::new();
        for joined in join_all(handles).await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => warn!(error = %e, "host execution panicked"),
            }
        }
        results
    }

    /// Adapter exposing the full per-host pipeline to the strategies.
    pub fn as_executor(self: &Arc<Self>) -> Arc<dyn HostTaskExecutor> {
        Arc::new(RunnerExecutor {
            runner: Arc::clone(self),
        })
    }
}

struct RunnerExecutor {
    runner: Arc<TaskRunner>,
}

#[async_trait]
impl HostTaskExecutor for RunnerExecutor {
    async fn execute(
        &self,
        ctx: &CancellationToken,
        task: &Task,
        host: &Host,
    ) -> Result<Vec<TaskResult>> {
        let vars = self.runner.store.get_all();
        self.runner
            .run(ctx, task, std::slice::from_ref(host), &vars)
            .await
    }
}

/// The per-(task, host) pipeline: lease a connection, build the host view,
/// render arguments, and drive the retry loop.
#[allow(clippy::too_many_arguments)]
async fn execute_on_host(
    ctx: &CancellationToken,
    registry: &ModuleRegistry,
    pool: &ConnectionPool,
    options: &RunnerOptions,
    task: &Task,
    host: &Host,
    pass_vars: &VarMap,
    loop_meta: Option<&(usize, JsonValue, usize)>,
) -> TaskResult {
    let module = match registry.lookup(&task.module) {
        Ok(module) => module,
        Err(e) => return failed_result(task, host, e.to_string()),
    };

    // Effective view: pass vars < host vars < connection built-ins.
    let mut host_view = merge_vars(pass_vars, &host.variables);
    host_view.insert(
        "inventory_hostname".into(),
        JsonValue::String(host.name.clone()),
    );
    host_view.insert(
        "ansible_host".into(),
        JsonValue::String(host.effective_address().to_string()),
    );
    host_view.insert("ansible_port".into(), JsonValue::from(host.port));
    host_view.insert(
        "ansible_user".into(),
        JsonValue::String(host.user.clone()),
    );
    for (key, value) in &task.environment {
        host_view.insert(
            format!("ansible_env_{}", key),
            JsonValue::String(value.clone()),
        );
    }

    // Render argument string leaves against the host view.
    let mut args = render_args(&task.args, &host_view);
    if options.check_mode {
        args.insert("_check_mode".into(), JsonValue::Bool(true));
    }
    if options.diff_mode {
        args.insert("_diff".into(), JsonValue::Bool(true));
    }
    args.insert(
        "_task_vars".into(),
        JsonValue::Object(host_view.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
    );

    let lease = match pool.get(ctx, &host.connection_info()).await {
        Ok(lease) => lease,
        Err(e) => {
            let mut result = failed_result(task, host, format!("connection failed: {}", e));
            result.data.insert("unreachable".into(), JsonValue::Bool(true));
            return result;
        }
    };

    let attempts = task.retries + 1;
    let mut final_result = None;

    for attempt in 1..=attempts {
        if ctx.is_cancelled() {
            final_result = Some(failed_result(task, host, "cancelled".to_string()));
            break;
        }

        let mut result = {
            let conn = lease.connection.lock().await;
            match module.run(ctx, conn.as_ref(), &args).await {
                Ok(result) => result,
                Err(e) => failed_result(task, host, e.to_string()),
            }
        };
        result.task_name = task.name.clone();
        if result.module_name.is_empty() {
            result.module_name = task.module.clone();
        }
        if result.host.is_empty() {
            result.host = host.name.clone();
        }
        apply_overrides(task, &mut result, &host_view);
        if let Some((index, item, total)) = loop_meta {
            attach_loop_metadata(&mut result, task, *index, item, *total);
        }

        // `until` met stops retrying; otherwise failures burn attempts.
        let until_met = match task.until.as_ref() {
            Some(cond) => {
                let view = result_view(&host_view, &result);
                ConditionEvaluator::new(&view).evaluate(cond).unwrap_or(false)
            }
            None => false,
        };
        if task.until.is_some() && until_met {
            final_result = Some(result);
            break;
        }
        let retry = attempt < attempts && !result.success;
        if !retry {
            final_result = Some(result);
            break;
        }

        debug!(
            task = %task.name,
            host = %host.name,
            attempt,
            "attempt failed, retrying"
        );
        final_result = Some(result);
        if task.delay > 0 {
            tokio::select! {
                _ = ctx.cancelled() => break,
                _ = tokio::time::sleep(std::time::Duration::from_secs(task.delay)) => {}
            }
        }
    }

    pool.release(lease).await;

    let mut result = final_result.unwrap_or_else(|| {
        failed_result(task, host, "no attempt executed".to_string())
    });

    // ignore_errors reports the failure but keeps it non-fatal.
    if !result.success && task.ignore_errors {
        if result.error.is_none() {
            result.error = Some(result.message.clone());
        }
        result
            .data
            .insert("ignore_errors".into(), JsonValue::Bool(true));
    }
    result
}

fn failed_result(task: &Task, host: &Host, message: String) -> TaskResult {
    let mut result = TaskResult::failed(&host.name, message);
    result.task_name = task.name.clone();
    result.module_name = task.module.clone();
    result
}

/// Apply `changed_when` and `failed_when` to a module result.
fn apply_overrides(task: &Task, result: &mut TaskResult, view: &VarMap) {
    match evaluate_changed_when(task.changed_when.as_ref(), result, view) {
        Ok(changed) => result.changed = changed,
        Err(e) => warn!(task = %task.name, error = %e, "changed_when evaluation failed"),
    }
    match evaluate_failed_when(task.failed_when.as_ref(), result, view) {
        Ok(failed) => {
            if failed && result.success {
                result.success = false;
                result.error = Some(format!(
                    "failed_when condition met for task '{}'",
                    task.name
                ));
            } else if !failed && !result.success && task.failed_when.is_some() {
                // failed_when can also rescue an otherwise failed result.
                result.success = true;
                result.error = None;
            }
        }
        Err(e) => warn!(task = %task.name, error = %e, "failed_when evaluation failed"),
    }
}

fn attach_loop_metadata(
    result: &mut TaskResult,
    task: &Task,
    index: usize,
    item: &JsonValue,
    total: usize,
) {
    result
        .data
        .insert(task.loop_control.loop_var.clone(), item.clone());
    result.data.insert(
        "ansible_loop".into(),
        serde_json::json!({
            "index": index + 1,
            "index0": index,
            "first": index == 0,
            "last": index + 1 == total,
            "length": total,
        }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::pool::PoolConfig;
    use crate::connection::ConnectionKind;
    use serde_json::json;

    fn local_host(name: &str) -> Host {
        let mut host = Host::new(name);
        host.set_variable("ansible_connection", json!("local"));
        host
    }

    fn runner(options: RunnerOptions) -> Arc<TaskRunner> {
        Arc::new(TaskRunner::new(
            Arc::new(ModuleRegistry::with_builtins()),
            Arc::new(ConnectionPool::with_config(PoolConfig::default())),
            Arc::new(VariableStore::new()),
            Arc::new(HandlerManager::new()),
            options,
        ))
    }

    #[tokio::test]
    async fn test_empty_hosts_is_empty_result() {
        let runner = runner(RunnerOptions::default());
        let ctx = CancellationToken::new();
        let task = Task::new("noop", "debug");
        let results = runner.run(&ctx, &task, &[], &VarMap::new()).await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_when_false_skips_all_hosts() {
        let runner = runner(RunnerOptions::default());
        let ctx = CancellationToken::new();
        let task = Task::new("guarded", "debug").with_when("env == 'prod'");
        let vars: VarMap = [("env".to_string(), json!("dev"))].into_iter().collect();
        let hosts = [local_host("h1"), local_host("h2")];

        let results = runner.run(&ctx, &task, &hosts, &vars).await.unwrap();
        assert_eq!(results.len(), 2);
        for result in &results {
            assert!(result.success);
            assert!(!result.changed);
            assert!(result.is_skipped());
            assert!(result.message.contains("Skipped"));
        }
    }

    #[tokio::test]
    async fn test_tag_filter() {
        let options = RunnerOptions {
            tags: vec!["deploy".to_string()],
            ..Default::default()
        };
        let runner = runner(options);
        let ctx = CancellationToken::new();
        let hosts = [local_host("h1")];

        // Untagged task is excluded when the filter has no always/all.
        let untagged = Task::new("untagged", "debug");
        let results = runner
            .run(&ctx, &untagged, &hosts, &VarMap::new())
            .await
            .unwrap();
        assert!(results[0].is_skipped());

        // A task sharing a tag runs.
        let tagged = Task::new("tagged", "debug").with_tags(["deploy"]);
        let results = runner
            .run(&ctx, &tagged, &hosts, &VarMap::new())
            .await
            .unwrap();
        assert!(!results[0].is_skipped());

        // `always` runs under any filter.
        let always = Task::new("always-on", "debug").with_tags(["always"]);
        let results = runner
            .run(&ctx, &always, &hosts, &VarMap::new())
            .await
            .unwrap();
        assert!(!results[0].is_skipped());
    }

    #[tokio::test]
    async fn test_unknown_module_short_circuits() {
        let runner = runner(RunnerOptions::default());
        let ctx = CancellationToken::new();
        let task = Task::new("bad", "no_such_module");
        let err = runner
            .run(&ctx, &task, &[local_host("h1")], &VarMap::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no_such_module"));
    }

    #[tokio::test]
    async fn test_argument_rendering_with_host_builtins() {
        let runner = runner(RunnerOptions::default());
        let ctx = CancellationToken::new();
        let task = Task::new("greet", "debug")
            .with_arg("msg", json!("host={{ inventory_hostname }} env={{ env }}"));
        let vars: VarMap = [("env".to_string(), json!("prod"))].into_iter().collect();

        let results = runner
            .run(&ctx, &task, &[local_host("h1")], &vars)
            .await
            .unwrap();
        assert_eq!(results[0].message, "host=h1 env=prod");
    }

    #[tokio::test]
    async fn test_loop_produces_result_per_item() {
        let runner = runner(RunnerOptions::default());
        let ctx = CancellationToken::new();
        let mut task = Task::new("loopy", "debug").with_arg("msg", json!("item={{ item }}"));
        task.loop_items = Some(json!(["a", "b", "c"]));

        let results = runner
            .run(&ctx, &task, &[local_host("h1")], &VarMap::new())
            .await
            .unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].message, "item=a");
        assert_eq!(results[2].message, "item=c");
        assert_eq!(results[0].data["ansible_loop"]["first"], json!(true));
        assert_eq!(results[2].data["ansible_loop"]["last"], json!(true));
        assert_eq!(results[1].data["ansible_loop"]["index"], json!(2));
    }

    #[tokio::test]
    async fn test_loop_range_and_index_var() {
        let runner = runner(RunnerOptions::default());
        let ctx = CancellationToken::new();
        let mut task = Task::new("range", "debug")
            .with_arg("msg", json!("n={{ n }} i={{ idx }}"));
        task.loop_items = Some(json!("1-3"));
        task.loop_control.loop_var = "n".into();
        task.loop_control.index_var = Some("idx".into());

        let results = runner
            .run(&ctx, &task, &[local_host("h1")], &VarMap::new())
            .await
            .unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].message, "n=1 i=0");
        assert_eq!(results[2].message, "n=3 i=2");
    }

    #[tokio::test]
    async fn test_register_stores_result() {
        let runner = runner(RunnerOptions::default());
        let ctx = CancellationToken::new();
        let task = Task::new("capture", "shell")
            .with_arg("cmd", json!("echo captured"))
            .with_register("out");

        runner
            .run(&ctx, &task, &[local_host("h1")], &VarMap::new())
            .await
            .unwrap();

        let registered = runner.store().get("out").unwrap();
        assert_eq!(registered["rc"], json!(0));
        assert!(registered["stdout"].as_str().unwrap().contains("captured"));
        assert_eq!(registered["failed"], json!(false));
    }

    #[tokio::test]
    async fn test_retry_until_succeeds() {
        let runner = runner(RunnerOptions::default());
        let ctx = CancellationToken::new();
        let dir = tempfile::tempdir().unwrap();
        let counter = dir.path().join("count");

        // Fails twice, then exits 0: appends a line per attempt.
        let script = format!(
            "echo x >> {c}; test $(wc -l < {c}) -ge 3",
            c = counter.to_string_lossy()
        );
        let mut task = Task::new("flaky", "shell").with_arg("cmd", json!(script));
        task.retries = 3;
        task.delay = 0;
        task.until = Some("result.rc == 0".into());

        let results = runner
            .run(&ctx, &task, &[local_host("h1")], &VarMap::new())
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].success);
        assert_eq!(results[0].data["exit_code"], json!(0));
        assert_eq!(std::fs::read_to_string(&counter).unwrap().lines().count(), 3);
    }

    #[tokio::test]
    async fn test_failed_when_promotes_success_to_failure() {
        let runner = runner(RunnerOptions::default());
        let ctx = CancellationToken::new();
        let mut task = Task::new("strict", "shell").with_arg("cmd", json!("echo WARNING"));
        task.failed_when = Some("'WARNING' in stdout".into());

        let results = runner
            .run(&ctx, &task, &[local_host("h1")], &VarMap::new())
            .await
            .unwrap();
        assert!(!results[0].success);
        assert!(results[0].error.as_ref().unwrap().contains("failed_when"));
    }

    #[tokio::test]
    async fn test_changed_when_false_forces_unchanged() {
        let runner = runner(RunnerOptions::default());
        let ctx = CancellationToken::new();
        let mut task = Task::new("query", "shell").with_arg("cmd", json!("echo state"));
        task.changed_when = Some(crate::executor::condition::Condition::Bool(false));

        let results = runner
            .run(&ctx, &task, &[local_host("h1")], &VarMap::new())
            .await
            .unwrap();
        assert!(results[0].success);
        assert!(!results[0].changed);
    }

    #[tokio::test]
    async fn test_notify_on_change() {
        let registry = Arc::new(ModuleRegistry::with_builtins());
        let pool = Arc::new(ConnectionPool::with_config(PoolConfig::default()));
        let store = Arc::new(VariableStore::new());
        let handlers = Arc::new(HandlerManager::new());
        handlers
            .register_handler(Task::new("restart app", "debug"))
            .unwrap();

        let runner = Arc::new(TaskRunner::new(
            registry,
            pool,
            store,
            Arc::clone(&handlers),
            RunnerOptions::default(),
        ));

        let ctx = CancellationToken::new();
        let mut task = Task::new("update config", "shell").with_arg("cmd", json!("true"));
        task.notify = vec!["restart app".to_string()];

        runner
            .run(&ctx, &task, &[local_host("h1")], &VarMap::new())
            .await
            .unwrap();
        assert_eq!(handlers.pending(), vec!["restart app"]);
    }

    #[tokio::test]
    async fn test_set_fact_flows_into_store() {
        let runner = runner(RunnerOptions::default());
        let ctx = CancellationToken::new();
        let task = Task::new("facts", "set_fact").with_arg("app_port", json!(8081));

        runner
            .run(&ctx, &task, &[local_host("h1")], &VarMap::new())
            .await
            .unwrap();
        assert_eq!(runner.store().get("app_port"), Some(json!(8081)));
    }

    #[tokio::test]
    async fn test_environment_exposed_as_ansible_env() {
        let runner = runner(RunnerOptions::default());
        let ctx = CancellationToken::new();
        let mut task = Task::new("envy", "debug")
            .with_arg("msg", json!("{{ ansible_env_DEPLOY_ENV }}"));
        task.environment
            .insert("DEPLOY_ENV".to_string(), "staging".to_string());

        let results = runner
            .run(&ctx, &task, &[local_host("h1")], &VarMap::new())
            .await
            .unwrap();
        assert_eq!(results[0].message, "staging");
    }

    #[tokio::test]
    async fn test_check_mode_propagates() {
        let options = RunnerOptions {
            check_mode: true,
            ..Default::default()
        };
        let runner = runner(options);
        let ctx = CancellationToken::new();
        let task = Task::new("guarded", "shell").with_arg("cmd", json!("echo mutation"));

        let results = runner
            .run(&ctx, &task, &[local_host("h1")], &VarMap::new())
            .await
            .unwrap();
        // The shell module reports check mode without running the command.
        assert!(results[0].success);
        assert!(results[0].data.get("stdout").is_none());
    }

    #[tokio::test]
    async fn test_ignore_errors_marks_result() {
        let runner = runner(RunnerOptions::default());
        let ctx = CancellationToken::new();
        let mut task = Task::new("brittle", "shell").with_arg("cmd", json!("false"));
        task.ignore_errors = true;

        let results = runner
            .run(&ctx, &task, &[local_host("h1")], &VarMap::new())
            .await
            .unwrap();
        assert!(!results[0].success);
        assert_eq!(results[0].data["ignore_errors"], json!(true));
        assert!(results[0].error.is_some());
    }
}

//! Execution engine: strategies over the (tasks × hosts) matrix and the
//! task runner.
//!
//! A [`Strategy`] decides scheduling discipline; the per-(task, host) work
//! is abstracted behind [`HostTaskExecutor`] so strategies are testable in
//! isolation. Fan-out is bounded by a `forks` semaphore and every blocking
//! point honors the run's cancellation token.

pub mod condition;
pub mod task;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::Error;
use crate::inventory::Host;
use crate::playbook::{Task, TaskResult};

/// Scheduling discipline over tasks and hosts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Run each task on all hosts before the next task
    #[default]
    Linear,
    /// Each host runs the whole task list independently
    Free,
    /// Like Free, but results are reported per host, contiguously
    HostPinned,
    /// Strict sequential execution consulting a debugger
    Debug,
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Linear => write!(f, "linear"),
            Self::Free => write!(f, "free"),
            Self::HostPinned => write!(f, "host_pinned"),
            Self::Debug => write!(f, "debug"),
        }
    }
}

/// Per-(task, host) execution abstraction the strategies schedule.
///
/// One invocation may yield several results (loop expansion), so the unit
/// of scheduling returns a sequence.
#[async_trait]
pub trait HostTaskExecutor: Send + Sync {
    /// Run one task on one host.
    async fn execute(
        &self,
        ctx: &CancellationToken,
        task: &Task,
        host: &Host,
    ) -> crate::error::Result<Vec<TaskResult>>;
}

/// Hook consulted by the debug strategy around every execution.
pub trait Debugger: Send + Sync {
    /// Return false to skip this (task, host) pair.
    fn before_task(&self, task: &Task, host: &Host) -> bool;
    /// Observe the produced result.
    fn after_task(&self, result: &TaskResult);
}

/// Strategy tuning.
#[derive(Clone)]
pub struct StrategyOptions {
    /// Concurrent per-host executor slots
    pub forks: usize,
    /// Debugger consulted by [`Strategy::Debug`]
    pub debugger: Option<Arc<dyn Debugger>>,
}

impl Default for StrategyOptions {
    fn default() -> Self {
        Self {
            forks: 5,
            debugger: None,
        }
    }
}

/// What a strategy run produced: every collected result, plus the error
/// that stopped the run early, if one did.
#[derive(Debug, Default)]
pub struct StrategyOutcome {
    /// Results in strategy order
    pub results: Vec<TaskResult>,
    /// Present when the run stopped before completing the matrix
    pub error: Option<Error>,
}

impl StrategyOutcome {
    fn completed(results: Vec<TaskResult>) -> Self {
        Self {
            results,
            error: None,
        }
    }

    fn stopped(results: Vec<TaskResult>, error: Error) -> Self {
        Self {
            results,
            error: Some(error),
        }
    }
}

/// Aggregated per-run counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutionStats {
    /// Successful, unchanged results
    pub ok: usize,
    /// Successful results that changed state
    pub changed: usize,
    /// Failed results
    pub failed: usize,
    /// Skipped results
    pub skipped: usize,
    /// Hosts that could not be reached
    pub unreachable: usize,
}

impl ExecutionStats {
    /// Tally a result sequence.
    pub fn from_results(results: &[TaskResult]) -> Self {
        let mut stats = Self::default();
        for result in results {
            let unreachable = matches!(
                result.data.get("unreachable"),
                Some(serde_json::Value::Bool(true))
            );
            if result.is_skipped() {
                stats.skipped += 1;
            } else if unreachable {
                stats.unreachable += 1;
            } else if !result.success {
                stats.failed += 1;
            } else if result.changed {
                stats.changed += 1;
            } else {
                stats.ok += 1;
            }
        }
        stats
    }

    /// Merge another tally into this one.
    pub fn merge(&mut self, other: &Self) {
        self.ok += other.ok;
        self.changed += other.changed;
        self.failed += other.failed;
        self.skipped += other.skipped;
        self.unreachable += other.unreachable;
    }
}

/// Run `tasks` over `hosts` under the given strategy.
pub async fn run_strategy(
    strategy: Strategy,
    ctx: &CancellationToken,
    tasks: &[Task],
    hosts: &[Host],
    executor: Arc<dyn HostTaskExecutor>,
    options: &StrategyOptions,
) -> StrategyOutcome {
    if tasks.is_empty() || hosts.is_empty() {
        return StrategyOutcome::completed(Vec::new());
    }
    debug!(
        strategy = %strategy,
        tasks = tasks.len(),
        hosts = hosts.len(),
        forks = options.forks,
        "running strategy"
    );
    match strategy {
        Strategy::Linear => run_linear(ctx, tasks, hosts, executor, options).await,
        Strategy::Free => run_free(ctx, tasks, hosts, executor, options, false).await,
        Strategy::HostPinned => run_free(ctx, tasks, hosts, executor, options, true).await,
        Strategy::Debug => run_debug(ctx, tasks, hosts, executor, options).await,
    }
}

/// Execute one pair, folding executor errors into a failed result.
async fn execute_pair(
    executor: &dyn HostTaskExecutor,
    ctx: &CancellationToken,
    task: &Task,
    host: &Host,
) -> Vec<TaskResult> {
    match executor.execute(ctx, task, host).await {
        Ok(results) => results,
        Err(e) => {
            warn!(host = %host.name, task = %task.name, error = %e, "executor error");
            let mut result = TaskResult::failed(&host.name, e.to_string());
            result.task_name = task.name.clone();
            result.module_name = task.module.clone();
            vec![result]
        }
    }
}

async fn run_linear(
    ctx: &CancellationToken,
    tasks: &[Task],
    hosts: &[Host],
    executor: Arc<dyn HostTaskExecutor>,
    options: &StrategyOptions,
) -> StrategyOutcome {
    let semaphore = Arc::new(Semaphore::new(options.forks.max(1)));
    let mut all = Vec::new();

    for task in tasks {
        if ctx.is_cancelled() {
            return StrategyOutcome::stopped(all, Error::Cancelled);
        }

        let mut join = JoinSet::new();
        for host in hosts {
            let semaphore = Arc::clone(&semaphore);
            let executor = Arc::clone(&executor);
            let task = task.clone();
            let host = host.clone();
            let ctx = ctx.clone();
            join.spawn(async move {
                let _permit = semaphore.acquire().await;
                execute_pair(executor.as_ref(), &ctx, &task, &host).await
            });
        }

        let mut task_results = Vec::new();
        while let Some(joined) = join.join_next().await {
            match joined {
                Ok(results) => task_results.extend(results),
                Err(e) => warn!(error = %e, "executor task panicked"),
            }
        }

        let mut failed_hosts: Vec<String> = task_results
            .iter()
            .filter(|r| !r.success)
            .map(|r| r.host.clone())
            .collect();
        failed_hosts.dedup();
        all.extend(task_results);

        if ctx.is_cancelled() {
            return StrategyOutcome::stopped(all, Error::Cancelled);
        }
        if !failed_hosts.is_empty() && !task.ignore_errors {
            let error = Error::StrategyStopped {
                task: task.name.clone(),
                failed: failed_hosts.len(),
                hosts: failed_hosts,
            };
            return StrategyOutcome::stopped(all, error);
        }
    }

    StrategyOutcome::completed(all)
}

async fn run_free(
    ctx: &CancellationToken,
    tasks: &[Task],
    hosts: &[Host],
    executor: Arc<dyn HostTaskExecutor>,
    options: &StrategyOptions,
    contiguous: bool,
) -> StrategyOutcome {
    let semaphore = Arc::new(Semaphore::new(options.forks.max(1)));
    let tasks: Arc<Vec<Task>> = Arc::new(tasks.to_vec());
    let results = Arc::new(Mutex::new(Vec::new()));
    let failed_hosts = Arc::new(Mutex::new(Vec::new()));

    let mut join = JoinSet::new();
    for host in hosts {
        let semaphore = Arc::clone(&semaphore);
        let executor = Arc::clone(&executor);
        let tasks = Arc::clone(&tasks);
        let results = Arc::clone(&results);
        let failed_hosts = Arc::clone(&failed_hosts);
        let host = host.clone();
        let ctx = ctx.clone();

        join.spawn(async move {
            let mut host_results = Vec::new();
            for task in tasks.iter() {
                if ctx.is_cancelled() {
                    break;
                }
                let mut pair_results = {
                    let _permit = semaphore.acquire().await;
                    execute_pair(executor.as_ref(), &ctx, task, &host).await
                };
                let failed =
                    pair_results.iter().any(|r| !r.success) && !task.ignore_errors;
                if contiguous {
                    host_results.append(&mut pair_results);
                } else {
                    results.lock().await.append(&mut pair_results);
                }
                if failed {
                    failed_hosts
                        .lock()
                        .await
                        .push((host.name.clone(), task.name.clone()));
                    // This host stops; the others keep running.
                    break;
                }
            }
            if contiguous {
                results.lock().await.append(&mut host_results);
            }
        });
    }

    while let Some(joined) = join.join_next().await {
        if let Err(e) = joined {
            warn!(error = %e, "host task panicked");
        }
    }

    let results = Arc::try_unwrap(results)
        .map(Mutex::into_inner)
        .unwrap_or_default();
    if ctx.is_cancelled() {
        return StrategyOutcome::stopped(results, Error::Cancelled);
    }
    let failed = Arc::try_unwrap(failed_hosts)
        .map(Mutex::into_inner)
        .unwrap_or_default();
    if let Some((_, task)) = failed.first() {
        let error = Error::StrategyStopped {
            task: task.clone(),
            failed: failed.len(),
            hosts: failed.iter().map(|(h, _)| h.clone()).collect(),
        };
        return StrategyOutcome::stopped(results, error);
    }
    StrategyOutcome::completed(results)
}

async fn run_debug(
    ctx: &CancellationToken,
    tasks: &[Task],
    hosts: &[Host],
    executor: Arc<dyn HostTaskExecutor>,
    options: &StrategyOptions,
) -> StrategyOutcome {
    let mut all = Vec::new();

    for task in tasks {
        for host in hosts {
            if ctx.is_cancelled() {
                return StrategyOutcome::stopped(all, Error::Cancelled);
            }
            if let Some(debugger) = &options.debugger {
                if !debugger.before_task(task, host) {
                    let mut result = TaskResult::skipped(&host.name, "skipped by debugger");
                    result.task_name = task.name.clone();
                    result.module_name = task.module.clone();
                    all.push(result);
                    continue;
                }
            }
            let results = execute_pair(executor.as_ref(), ctx, task, host).await;
            if let Some(debugger) = &options.debugger {
                for result in &results {
                    debugger.after_task(result);
                }
            }
            let failed = results.iter().any(|r| !r.success) && !task.ignore_errors;
            let failed_host = host.name.clone();
            all.extend(results);
            if failed {
                let error = Error::StrategyStopped {
                    task: task.name.clone(),
                    failed: 1,
                    hosts: vec![failed_host],
                };
                return StrategyOutcome::stopped(all, error);
            }
        }
    }

    StrategyOutcome::completed(all)
}

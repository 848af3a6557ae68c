//! End-to-end engine tests: inventory → runner → strategies → handlers,
//! over local connections.

use std::sync::Arc;

use muster::prelude::*;
use serde_json::json;
use tokio_util::sync::CancellationToken;

const INVENTORY: &str = r#"
all:
  vars:
    env: staging
  children:
    web:
      vars:
        role: web
      hosts:
        web[01:02]:
          ansible_connection: local
"#;

struct Fixture {
    runner: Arc<TaskRunner>,
    handlers: Arc<HandlerManager>,
    store: Arc<VariableStore>,
    hosts: Vec<Host>,
    inventory: Inventory,
}

fn fixture() -> Fixture {
    let inventory = Inventory::from_yaml(INVENTORY).unwrap();
    let hosts: Vec<Host> = inventory
        .get_hosts("web")
        .unwrap()
        .into_iter()
        .cloned()
        .collect();

    let store = Arc::new(VariableStore::new());
    let handlers = Arc::new(HandlerManager::new());
    let runner = Arc::new(TaskRunner::new(
        Arc::new(ModuleRegistry::with_builtins()),
        Arc::new(ConnectionPool::new()),
        Arc::clone(&store),
        Arc::clone(&handlers),
        RunnerOptions::default(),
    ));

    Fixture {
        runner,
        handlers,
        store,
        hosts,
        inventory,
    }
}

#[tokio::test]
async fn inventory_view_feeds_argument_rendering() {
    let fx = fixture();
    let ctx = CancellationToken::new();

    let vars = fx.inventory.host_vars("web01").unwrap();
    let task = Task::new("announce", "debug")
        .with_arg("msg", json!("{{ inventory_hostname }} is a {{ role }} in {{ env }}"));

    let results = fx
        .runner
        .run(&ctx, &task, &fx.hosts[..1], &vars)
        .await
        .unwrap();
    assert_eq!(results[0].message, "web01 is a web in staging");
}

#[tokio::test]
async fn linear_strategy_runs_full_matrix() {
    let fx = fixture();
    let ctx = CancellationToken::new();

    let tasks = vec![
        Task::new("first", "shell").with_arg("cmd", json!("echo one")),
        Task::new("second", "debug").with_arg("msg", json!("two")),
    ];

    let outcome = run_strategy(
        Strategy::Linear,
        &ctx,
        &tasks,
        &fx.hosts,
        fx.runner.as_executor(),
        &StrategyOptions::default(),
    )
    .await;

    assert!(outcome.error.is_none());
    assert_eq!(outcome.results.len(), 4);
    let stats = ExecutionStats::from_results(&outcome.results);
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.skipped, 0);
    // Shell tasks report changed, debug tasks report ok.
    assert_eq!(stats.changed, 2);
    assert_eq!(stats.ok, 2);
}

#[tokio::test]
async fn linear_failure_stops_following_tasks() {
    let fx = fixture();
    let ctx = CancellationToken::new();

    let tasks = vec![
        Task::new("breaks", "shell").with_arg("cmd", json!("exit 3")),
        Task::new("never runs", "debug"),
    ];

    let outcome = run_strategy(
        Strategy::Linear,
        &ctx,
        &tasks,
        &fx.hosts,
        fx.runner.as_executor(),
        &StrategyOptions::default(),
    )
    .await;

    assert!(matches!(outcome.error, Some(Error::StrategyStopped { .. })));
    // Only the first task's two host results were produced.
    assert_eq!(outcome.results.len(), 2);
    assert!(outcome.results.iter().all(|r| r.task_name == "breaks"));
    assert!(outcome.results.iter().all(|r| !r.success));
    assert_eq!(
        outcome.results[0].data["exit_code"],
        json!(3),
        "exit code surfaces in result data"
    );
}

#[tokio::test]
async fn register_condition_chain_between_tasks() {
    let fx = fixture();
    let ctx = CancellationToken::new();

    // Task 1 registers output; task 2 is guarded on it.
    let probe = Task::new("probe", "shell")
        .with_arg("cmd", json!("echo ready"))
        .with_register("probe_out");
    fx.runner
        .run(&ctx, &probe, &fx.hosts[..1], &fx.store.get_all())
        .await
        .unwrap();

    let guarded = Task::new("gated", "debug")
        .with_arg("msg", json!("went through"))
        .with_when("'ready' in probe_out.stdout");
    let results = fx
        .runner
        .run(&ctx, &guarded, &fx.hosts[..1], &fx.store.get_all())
        .await
        .unwrap();
    assert!(!results[0].is_skipped());
    assert_eq!(results[0].message, "went through");

    let blocked = Task::new("blocked", "debug").with_when("'absent' in probe_out.stdout");
    let results = fx
        .runner
        .run(&ctx, &blocked, &fx.hosts[..1], &fx.store.get_all())
        .await
        .unwrap();
    assert!(results[0].is_skipped());
}

#[tokio::test]
async fn notified_handlers_run_once_after_batch() {
    let fx = fixture();
    let ctx = CancellationToken::new();

    fx.handlers
        .register_handler(
            Task::new("restart app", "shell").with_arg("cmd", json!("echo restarting")),
        )
        .unwrap();

    // Two changing tasks notify the same handler.
    for name in ["change one", "change two"] {
        let mut task = Task::new(name, "shell").with_arg("cmd", json!("true"));
        task.notify = vec!["restart app".to_string()];
        fx.runner
            .run(&ctx, &task, &fx.hosts, &fx.store.get_all())
            .await
            .unwrap();
    }

    let handler_results = fx
        .handlers
        .process_handlers(&ctx, &fx.runner, &fx.hosts, &fx.store.get_all())
        .await
        .unwrap();
    // One deduplicated handler, run across both hosts.
    assert_eq!(handler_results.len(), 2);
    assert!(handler_results.iter().all(|r| r.task_name == "restart app"));

    // The queue is drained.
    let again = fx
        .handlers
        .process_handlers(&ctx, &fx.runner, &fx.hosts, &fx.store.get_all())
        .await
        .unwrap();
    assert!(again.is_empty());
}

#[tokio::test]
async fn gathered_facts_guard_later_tasks() {
    let fx = fixture();
    let ctx = CancellationToken::new();

    let mut conn = LocalConnection::new();
    conn.connect(ConnectionInfo::new("localhost")).await.unwrap();
    let facts = FactGatherer::new().gather(&conn).await;
    assert!(facts.contains_key("ansible_system"));
    fx.store.set_facts(facts);

    let task = Task::new("unix only", "debug")
        .with_arg("msg", json!("{{ ansible_system }}"))
        .with_when("ansible_system is defined");
    let results = fx
        .runner
        .run(&ctx, &task, &fx.hosts[..1], &fx.store.get_all())
        .await
        .unwrap();
    assert!(!results[0].is_skipped());
    assert!(!results[0].message.is_empty());
}

#[tokio::test]
async fn vaulted_inventory_variable_decrypts_before_use() {
    let vault = Vault::new("vault-pw");
    let secret = vault.encrypt_string("s3cret-token").unwrap();

    let mut store_value = json!({ "api_token": secret, "plain": "ok" });
    let mut manager = VaultManager::new();
    manager.add_password(None, "vault-pw");
    manager.process_variables(&mut store_value).unwrap();

    assert_eq!(store_value["api_token"], json!("s3cret-token"));
    assert_eq!(store_value["plain"], json!("ok"));
}

#[tokio::test]
async fn free_strategy_lets_healthy_hosts_finish() {
    let fx = fixture();
    let ctx = CancellationToken::new();

    // Fails only on web01 via a host-var driven guard.
    let tasks = vec![
        Task::new("t1", "shell").with_arg("cmd", json!("true")),
        Task::new("t2", "shell").with_arg(
            "cmd",
            json!("test {{ inventory_hostname }} != web01"),
        ),
        Task::new("t3", "debug"),
    ];

    let outcome = run_strategy(
        Strategy::Free,
        &ctx,
        &tasks,
        &fx.hosts,
        fx.runner.as_executor(),
        &StrategyOptions::default(),
    )
    .await;

    let web01: Vec<_> = outcome.results.iter().filter(|r| r.host == "web01").collect();
    let web02: Vec<_> = outcome.results.iter().filter(|r| r.host == "web02").collect();
    assert_eq!(web01.len(), 2, "web01 stops after its t2 failure");
    assert_eq!(web02.len(), 3, "web02 completes all tasks");
    match outcome.error {
        Some(Error::StrategyStopped { hosts, .. }) => assert_eq!(hosts, vec!["web01"]),
        other => panic!("expected StrategyStopped, got {:?}", other),
    }
}

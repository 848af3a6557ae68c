//! Handler management: deferred tasks triggered by change notifications.
//!
//! Handlers register under their name and, when set, their `listen` topic.
//! Notifications accumulate in first-notify order, deduplicated, until a
//! batch boundary drains them.

use indexmap::IndexMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::executor::task::TaskRunner;
use crate::inventory::Host;
use crate::playbook::{Task, TaskResult};
use crate::vars::VarMap;

/// Deduplicating notification queue over registered handlers.
#[derive(Default)]
pub struct HandlerManager {
    inner: Mutex<State>,
}

#[derive(Default)]
struct State {
    /// Handlers by name, and additionally by `listen` topic
    handlers: IndexMap<String, Arc<Task>>,
    /// Pending notification names in first-notify order
    pending: Vec<String>,
}

impl HandlerManager {
    /// Create an empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler task; it becomes addressable by `name` and, when
    /// set, by its `listen` topic.
    pub fn register_handler(&self, task: Task) -> Result<()> {
        if task.name.is_empty() {
            return Err(Error::InvalidHandler("handler has no name".into()));
        }
        let mut state = self.inner.lock();
        let task = Arc::new(task);
        if let Some(listen) = task.listen.clone().filter(|l| !l.is_empty()) {
            state.handlers.insert(listen, Arc::clone(&task));
        }
        state.handlers.insert(task.name.clone(), task);
        Ok(())
    }

    /// Number of distinct registered names and topics.
    pub fn len(&self) -> usize {
        self.inner.lock().handlers.len()
    }

    /// Whether no handler is registered.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().handlers.is_empty()
    }

    /// Queue notifications. Names without a registered handler are skipped
    /// with a warning; names already pending are not queued twice.
    pub fn notify(&self, names: &[String]) {
        let mut state = self.inner.lock();
        for name in names {
            if !state.handlers.contains_key(name) {
                warn!(handler = %name, "notify for unknown handler, skipping");
                continue;
            }
            if state.pending.iter().any(|p| p == name) {
                continue;
            }
            debug!(handler = %name, "handler notified");
            state.pending.push(name.clone());
        }
    }

    /// Names currently pending, in order.
    pub fn pending(&self) -> Vec<String> {
        self.inner.lock().pending.clone()
    }

    /// Drain the queue in insertion order, deduplicating by resolved
    /// handler identity. A second call sees an empty queue.
    pub fn get_pending_handlers(&self) -> Vec<Arc<Task>> {
        let mut state = self.inner.lock();
        let pending = std::mem::take(&mut state.pending);

        let mut seen = Vec::new();
        let mut resolved = Vec::new();
        for name in pending {
            if let Some(task) = state.handlers.get(&name) {
                if seen.contains(&task.name) {
                    continue;
                }
                seen.push(task.name.clone());
                resolved.push(Arc::clone(task));
            }
        }
        resolved
    }

    /// Drain the queue and run each handler through the runner over
    /// `hosts`, aggregating results.
    pub async fn process_handlers(
        &self,
        ctx: &CancellationToken,
        runner: &TaskRunner,
        hosts: &[Host],
        vars: &VarMap,
    ) -> Result<Vec<TaskResult>> {
        let handlers = self.get_pending_handlers();
        if handlers.is_empty() {
            return Ok(Vec::new());
        }
        debug!(count = handlers.len(), "running notified handlers");

        let mut results = Vec::new();
        for handler in handlers {
            let mut batch = runner.run(ctx, &handler, hosts, vars).await?;
            results.append(&mut batch);
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler(name: &str) -> Task {
        Task::new(name, "debug")
    }

    fn listening_handler(name: &str, listen: &str) -> Task {
        let mut task = Task::new(name, "debug");
        task.listen = Some(listen.to_string());
        task
    }

    #[test]
    fn test_register_rejects_nameless() {
        let manager = HandlerManager::new();
        let err = manager.register_handler(Task::new("", "debug")).unwrap_err();
        assert!(matches!(err, Error::InvalidHandler(_)));
    }

    #[test]
    fn test_notify_dedup_and_order() {
        let manager = HandlerManager::new();
        manager.register_handler(handler("restart nginx")).unwrap();
        manager.register_handler(handler("reload systemd")).unwrap();

        manager.notify(&[
            "restart nginx".into(),
            "unknown handler".into(),
            "reload systemd".into(),
            "restart nginx".into(),
        ]);

        assert_eq!(manager.pending(), vec!["restart nginx", "reload systemd"]);

        let drained = manager.get_pending_handlers();
        let names: Vec<&str> = drained.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["restart nginx", "reload systemd"]);

        // A second drain sees an empty queue.
        assert!(manager.get_pending_handlers().is_empty());
        assert!(manager.pending().is_empty());
    }

    #[test]
    fn test_listen_topic_resolves_to_same_handler() {
        let manager = HandlerManager::new();
        manager
            .register_handler(listening_handler("restart web", "web services"))
            .unwrap();

        // Notify by both the name and the topic; identity dedup collapses
        // them into one run.
        manager.notify(&["web services".into(), "restart web".into()]);
        let drained = manager.get_pending_handlers();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].name, "restart web");
    }
}

//! A non-owning handle for poking a task from host code.

use std::sync::{
    Arc, Weak,
    atomic::{AtomicBool, Ordering},
};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// State shared between a task and its handles. Owned by the task.
pub(crate) struct TaskShared {
    pub(crate) cancel: CancellationToken,
    pub(crate) idle_notify: Notify,
    pub(crate) is_running: AtomicBool,
}

impl TaskShared {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            cancel: CancellationToken::new(),
            idle_notify: Notify::new(),
            is_running: AtomicBool::new(false),
        })
    }

    pub(crate) fn set_running(&self, running: bool) {
        self.is_running.store(running, Ordering::Release);
        if !running {
            self.idle_notify.notify_waiters();
        }
    }
}

/// A cloneable, non-owning handle to a task.
///
/// The host keeps handles for dispatch; the task never points back at the
/// host. Once the task is dropped every operation reports the task as gone.
#[derive(Clone)]
pub struct TaskHandle {
    task_id: String,
    shared: Weak<TaskShared>,
}

impl TaskHandle {
    pub(crate) fn new(task_id: impl Into<String>, shared: &Arc<TaskShared>) -> Self {
        Self {
            task_id: task_id.into(),
            shared: Arc::downgrade(shared),
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Whether the task still exists
    pub fn is_alive(&self) -> bool {
        self.shared.strong_count() > 0
    }

    /// Request cancellation. Returns `false` if the task is gone.
    pub fn abort(&self) -> bool {
        match self.shared.upgrade() {
            Some(shared) => {
                shared.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Whether the task loop is currently running
    pub fn is_running(&self) -> bool {
        self.shared
            .upgrade()
            .is_some_and(|s| s.is_running.load(Ordering::Acquire))
    }

    /// Wait until the task loop becomes idle (or the task is gone)
    pub async fn wait_for_idle(&self) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let notified = shared.idle_notify.notified();
        if !shared.is_running.load(Ordering::Acquire) {
            return;
        }
        notified.await;
    }

    /// Wait until idle, with a timeout.
    /// Returns `true` if idle was reached, `false` on timeout.
    pub async fn wait_for_idle_timeout(&self, timeout: std::time::Duration) -> bool {
        tokio::time::timeout(timeout, self.wait_for_idle())
            .await
            .is_ok()
    }
}

//! Durable conversation log contract

use async_trait::async_trait;
use kestrel_ai::Message;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::context::TruncationRange;
use crate::error::{Error, Result};

/// Everything needed to reopen a task
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub messages: Vec<Message>,
    pub deleted_range: Option<TruncationRange>,
    pub request_log: Vec<serde_json::Value>,
}

/// Append-only store for a task's log.
///
/// Every call must be durable when it returns: the loop relies on it before
/// starting the next request.
#[async_trait]
pub trait PersistenceStore: Send + Sync {
    /// Append a message to the log
    async fn append_message(&self, task_id: &str, message: &Message) -> Result<()>;

    /// Record a new version of an existing message (user content merged into it)
    async fn replace_message(&self, task_id: &str, index: usize, message: &Message)
    -> Result<()>;

    /// Record the elided range
    async fn save_deleted_range(
        &self,
        task_id: &str,
        range: Option<TruncationRange>,
    ) -> Result<()>;

    /// Append a per-request metrics record
    async fn append_request_record(&self, task_id: &str, record: &serde_json::Value)
    -> Result<()>;

    /// Load a task, if it exists
    async fn load(&self, task_id: &str) -> Result<Option<TaskSnapshot>>;
}

/// Store kept in process memory
#[derive(Default)]
pub struct InMemoryStore {
    tasks: Mutex<HashMap<String, TaskSnapshot>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the stored snapshot
    pub fn snapshot(&self, task_id: &str) -> Option<TaskSnapshot> {
        self.tasks.lock().get(task_id).cloned()
    }
}

#[async_trait]
impl PersistenceStore for InMemoryStore {
    async fn append_message(&self, task_id: &str, message: &Message) -> Result<()> {
        self.tasks
            .lock()
            .entry(task_id.to_string())
            .or_default()
            .messages
            .push(message.clone());
        Ok(())
    }

    async fn replace_message(
        &self,
        task_id: &str,
        index: usize,
        message: &Message,
    ) -> Result<()> {
        let mut tasks = self.tasks.lock();
        let slot = tasks
            .get_mut(task_id)
            .and_then(|t| t.messages.get_mut(index))
            .ok_or_else(|| {
                Error::Persistence(format!("no message {} in task {}", index, task_id))
            })?;
        *slot = message.clone();
        Ok(())
    }

    async fn save_deleted_range(
        &self,
        task_id: &str,
        range: Option<TruncationRange>,
    ) -> Result<()> {
        self.tasks
            .lock()
            .entry(task_id.to_string())
            .or_default()
            .deleted_range = range;
        Ok(())
    }

    async fn append_request_record(
        &self,
        task_id: &str,
        record: &serde_json::Value,
    ) -> Result<()> {
        self.tasks
            .lock()
            .entry(task_id.to_string())
            .or_default()
            .request_log
            .push(record.clone());
        Ok(())
    }

    async fn load(&self, task_id: &str) -> Result<Option<TaskSnapshot>> {
        Ok(self.snapshot(task_id))
    }
}

//! JSONL task logs: one file per task, every write synced before returning

use async_trait::async_trait;
use kestrel_agent::{Error, PersistenceStore, Result, TaskSnapshot, TruncationRange};
use kestrel_ai::Message;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

/// Entry types of a task log
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum LogEntry {
    Message {
        message: Message,
        timestamp: i64,
    },
    /// User content merged into the message at `index`
    ReplaceMessage {
        index: usize,
        message: Message,
        timestamp: i64,
    },
    DeletedRange {
        range: Option<TruncationRange>,
    },
    Request {
        record: serde_json::Value,
    },
}

/// Summary of a stored task
#[derive(Debug, Clone)]
pub struct TaskInfo {
    pub id: String,
    pub modified: Option<chrono::DateTime<chrono::Utc>>,
    pub message_count: usize,
}

pub struct JsonlStore {
    dir: PathBuf,
}

impl JsonlStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, task_id: &str) -> Result<PathBuf> {
        let valid = !task_id.is_empty()
            && task_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(Error::Persistence(format!("invalid task id: {:?}", task_id)));
        }
        Ok(self.dir.join(format!("{}.jsonl", task_id)))
    }

    async fn append(&self, task_id: &str, entry: &LogEntry) -> Result<()> {
        let path = self.path_for(task_id)?;
        fs::create_dir_all(&self.dir).await?;
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        file.sync_data().await?;
        Ok(())
    }

    /// Stored tasks, most recently modified first
    pub async fn list_tasks(&self) -> Result<Vec<TaskInfo>> {
        if !fs::try_exists(&self.dir).await? {
            return Ok(vec![]);
        }
        let mut tasks = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some("jsonl") {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let modified = entry
                .metadata()
                .await
                .ok()
                .and_then(|m| m.modified().ok())
                .map(chrono::DateTime::<chrono::Utc>::from);
            let message_count = match self.load(id).await {
                Ok(Some(snapshot)) => snapshot.messages.len(),
                _ => 0,
            };
            tasks.push(TaskInfo {
                id: id.to_string(),
                modified,
                message_count,
            });
        }
        tasks.sort_by(|a, b| b.modified.cmp(&a.modified));
        Ok(tasks)
    }
}

#[async_trait]
impl PersistenceStore for JsonlStore {
    async fn append_message(&self, task_id: &str, message: &Message) -> Result<()> {
        let entry = LogEntry::Message {
            message: message.clone(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        };
        self.append(task_id, &entry).await
    }

    async fn replace_message(&self, task_id: &str, index: usize, message: &Message) -> Result<()> {
        let entry = LogEntry::ReplaceMessage {
            index,
            message: message.clone(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        };
        self.append(task_id, &entry).await
    }

    async fn save_deleted_range(&self, task_id: &str, range: Option<TruncationRange>) -> Result<()> {
        self.append(task_id, &LogEntry::DeletedRange { range }).await
    }

    async fn append_request_record(&self, task_id: &str, record: &serde_json::Value) -> Result<()> {
        let entry = LogEntry::Request {
            record: record.clone(),
        };
        self.append(task_id, &entry).await
    }

    async fn load(&self, task_id: &str) -> Result<Option<TaskSnapshot>> {
        let path = self.path_for(task_id)?;
        let file = match fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut snapshot = TaskSnapshot::default();
        let mut lines = BufReader::new(file).lines();
        let mut line_no = 0;
        while let Some(line) = lines.next_line().await? {
            line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            let entry = match serde_json::from_str::<LogEntry>(&line) {
                Ok(entry) => entry,
                Err(e) => {
                    // A torn final write is the only expected way to get here
                    tracing::warn!("Skipping unreadable line {} of {}: {}", line_no, path.display(), e);
                    continue;
                }
            };
            match entry {
                LogEntry::Message { message, .. } => snapshot.messages.push(message),
                LogEntry::ReplaceMessage { index, message, .. } => {
                    match snapshot.messages.get_mut(index) {
                        Some(slot) => *slot = message,
                        None => {
                            return Err(Error::Persistence(format!(
                                "{}: replace of unknown message {}",
                                path.display(),
                                index
                            )));
                        }
                    }
                }
                LogEntry::DeletedRange { range } => snapshot.deleted_range = range,
                LogEntry::Request { record } => snapshot.request_log.push(record),
            }
        }
        Ok(Some(snapshot))
    }
}

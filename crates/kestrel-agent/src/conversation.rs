//! Per-task conversation state: the append-only exchange log, the elided
//! range, usage totals and the request log.

use kestrel_ai::{ContentBlock, Message, Role, Usage};
use serde::{Deserialize, Serialize};

use crate::context::TruncationRange;

/// How a user turn landed in the log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Appended {
    /// A new message was pushed at this index
    New(usize),
    /// The content was merged into the existing user message at this index
    Merged(usize),
}

impl Appended {
    pub fn index(&self) -> usize {
        match self {
            Appended::New(i) | Appended::Merged(i) => *i,
        }
    }
}

/// Metrics recorded for every provider request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestRecord {
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cache_writes: u64,
    pub cache_reads: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_reason: Option<String>,
    #[serde(default)]
    pub timestamp: i64,
}

impl RequestRecord {
    pub fn from_usage(usage: &Usage, cost: f64) -> Self {
        Self {
            tokens_in: usage.input_tokens,
            tokens_out: usage.output_tokens,
            cache_writes: usage.cache_write_tokens,
            cache_reads: usage.cache_read_tokens,
            cost: Some(cost),
            cancel_reason: None,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Tokens the request occupied in the context window
    pub fn context_tokens(&self) -> u64 {
        self.tokens_in + self.tokens_out + self.cache_writes + self.cache_reads
    }
}

/// Conversation state owned by exactly one task
#[derive(Debug, Default)]
pub struct Conversation {
    messages: Vec<Message>,
    deleted_range: Option<TruncationRange>,
    /// Usage across every request of the task
    pub total_usage: Usage,
    /// Input plus output tokens, checked against the task budget
    pub total_task_tokens: u64,
    /// Request records as persisted; older entries may predate the current schema
    request_log: Vec<serde_json::Value>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted state
    pub fn restore(
        messages: Vec<Message>,
        deleted_range: Option<TruncationRange>,
        request_log: Vec<serde_json::Value>,
    ) -> Self {
        let mut total_usage = Usage::default();
        let mut total_task_tokens = 0;
        for record in &request_log {
            if let Ok(r) = serde_json::from_value::<RequestRecord>(record.clone()) {
                total_usage.input_tokens += r.tokens_in;
                total_usage.output_tokens += r.tokens_out;
                total_usage.cache_write_tokens += r.cache_writes;
                total_usage.cache_read_tokens += r.cache_reads;
                if let Some(cost) = r.cost {
                    total_usage.total_cost = Some(total_usage.total_cost.unwrap_or(0.0) + cost);
                }
                total_task_tokens += r.tokens_in + r.tokens_out;
            }
        }
        Self {
            messages,
            deleted_range,
            total_usage,
            total_task_tokens,
            request_log,
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn deleted_range(&self) -> Option<TruncationRange> {
        self.deleted_range
    }

    pub(crate) fn set_deleted_range(&mut self, range: Option<TruncationRange>) {
        self.deleted_range = range;
    }

    /// Append a message, returning its index
    pub(crate) fn push(&mut self, message: Message) -> usize {
        self.messages.push(message);
        self.messages.len() - 1
    }

    /// Append user content. When the log already ends in a user message
    /// (e.g. tool results), the content joins it so roles keep alternating.
    pub(crate) fn push_user_content(&mut self, content: Vec<ContentBlock>) -> Appended {
        if let Some(last) = self.messages.last_mut() {
            if last.role == Role::User {
                last.content.extend(content);
                return Appended::Merged(self.messages.len() - 1);
            }
        }
        Appended::New(self.push(Message::user_with_content(content)))
    }

    pub(crate) fn record_request(&mut self, record: serde_json::Value) {
        self.request_log.push(record);
    }

    /// The most recent request record, if any
    pub fn last_request(&self) -> Option<&serde_json::Value> {
        self.request_log.last()
    }

    pub fn request_log(&self) -> &[serde_json::Value] {
        &self.request_log
    }
}

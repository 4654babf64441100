//! Conversation window management
//!
//! When a conversation grows too large for the model's context window, a
//! contiguous middle region of history is elided from outgoing requests. The
//! first message (the task) and the most recent messages are always kept, and
//! the underlying log is never modified.

use kestrel_ai::{Message, ModelInfo, Role};
use serde::{Deserialize, Serialize};

use crate::conversation::RequestRecord;

/// Configuration for the outgoing window
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// History longer than this is truncated even without token pressure
    pub max_history_messages: usize,
    /// Messages at the end of history that are never elided
    pub keep_last: usize,
    /// Histories this short are never truncated
    pub min_messages_to_keep: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_history_messages: 50,
            keep_last: 4,
            min_messages_to_keep: 6,
        }
    }
}

/// Inclusive index range of history elided from outgoing requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TruncationRange {
    pub start: usize,
    pub end: usize,
}

impl TruncationRange {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    /// Number of elided messages
    pub fn len(&self) -> usize {
        self.end + 1 - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }
}

/// Why a truncation was triggered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TruncationPressure {
    /// The last request used most of the context window
    Tokens,
    /// History exceeds the message cap
    Length,
}

impl TruncationPressure {
    /// Share of the middle region kept after truncation
    pub fn keep_ratio(self) -> f64 {
        match self {
            TruncationPressure::Tokens => 0.25,
            TruncationPressure::Length => 0.5,
        }
    }
}

/// The outgoing window for one request
#[derive(Debug, Clone)]
pub struct ContextWindow {
    /// Range elided from the log after this computation
    pub deleted_range: Option<TruncationRange>,
    /// Whether the range changed
    pub updated: bool,
    /// History with the elided range spliced out
    pub messages: Vec<Message>,
}

/// Decides which part of history is sent to the provider
#[derive(Debug, Clone, Default)]
pub struct ContextManager {
    config: ContextConfig,
}

impl ContextManager {
    pub fn new(config: ContextConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// Build the outgoing window, growing the elided range when the previous
    /// request came close to the context limit or history is too long.
    ///
    /// `previous_request` is the persisted record of the last request. A
    /// record that cannot be read only disables the token trigger.
    pub fn compute_window(
        &self,
        history: &[Message],
        current: Option<TruncationRange>,
        previous_request: Option<&serde_json::Value>,
        model: &ModelInfo,
    ) -> ContextWindow {
        let mut range = current;
        let mut updated = false;

        if let Some(pressure) = self.pressure(history, previous_request, model) {
            let next = self.next_truncation_range(history, current, pressure.keep_ratio());
            if next != current {
                tracing::debug!(
                    "Truncating history ({:?} pressure): {:?} -> {:?}",
                    pressure,
                    current,
                    next
                );
                range = next;
                updated = true;
            }
        }

        ContextWindow {
            deleted_range: range,
            updated,
            messages: truncated_messages(history, range),
        }
    }

    fn pressure(
        &self,
        history: &[Message],
        previous_request: Option<&serde_json::Value>,
        model: &ModelInfo,
    ) -> Option<TruncationPressure> {
        if let Some(record) = previous_request {
            match serde_json::from_value::<RequestRecord>(record.clone()) {
                Ok(record) => {
                    if record.context_tokens() >= u64::from(model.max_allowed_tokens()) {
                        return Some(TruncationPressure::Tokens);
                    }
                }
                Err(e) => {
                    tracing::warn!("Ignoring unreadable request record: {}", e);
                }
            }
        }

        if history.len() > self.config.max_history_messages {
            return Some(TruncationPressure::Length);
        }
        None
    }

    /// Compute the next elided range.
    ///
    /// The range always starts at index 1 and only grows: the zone available
    /// for removal lies after the current range and before the last
    /// `keep_last` messages. Returns `current` when nothing can be removed.
    pub fn next_truncation_range(
        &self,
        history: &[Message],
        current: Option<TruncationRange>,
        keep_ratio: f64,
    ) -> Option<TruncationRange> {
        let len = history.len();
        if len <= self.config.min_messages_to_keep {
            return current;
        }

        // First index of the protected tail
        let tail_start = len.saturating_sub(self.config.keep_last).max(1);
        let available_start = current.map(|r| r.end + 1).unwrap_or(1);
        if tail_start <= available_start {
            return current;
        }
        let available_end = tail_start - 1;
        let available = tail_start - available_start;

        let keep_ratio = keep_ratio.clamp(0.0, 1.0);
        let mut remove = (available as f64 * (1.0 - keep_ratio)).floor() as usize;
        // Remove whole user/assistant pairs
        if remove % 2 == 1 {
            remove -= 1;
        }
        if remove == 0 {
            return current;
        }

        let mut end = (available_start + remove - 1).min(available_end);
        if history[end + 1].role == Role::User && end >= available_start {
            end = end.saturating_sub(1).max(available_start - 1);
        }

        let start = 1;
        if start > end {
            tracing::warn!(
                "Truncation produced an empty range (start {} > end {}), keeping {:?}",
                start,
                end,
                current
            );
            return current;
        }
        Some(TruncationRange::new(start, end))
    }
}

/// History with `range` spliced out. The input is left untouched.
pub fn truncated_messages(history: &[Message], range: Option<TruncationRange>) -> Vec<Message> {
    match range {
        Some(r) if r.start < history.len() && !r.is_empty() => {
            let end = r.end.min(history.len() - 1);
            history[..r.start]
                .iter()
                .chain(history[end + 1..].iter())
                .cloned()
                .collect()
        }
        _ => history.to_vec(),
    }
}

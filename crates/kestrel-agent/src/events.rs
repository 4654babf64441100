//! Task event types

use kestrel_ai::{ApiStreamChunk, Usage};
use serde::{Deserialize, Serialize};

use crate::context::TruncationRange;
use crate::task::LoopState;

/// Events emitted while a task runs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// Task started processing its first message
    TaskStarted { task_id: String },

    /// The loop moved to a new state
    StateChanged { state: LoopState },

    /// A new request to the provider is about to be made
    TurnStarted { turn_number: u32 },

    /// A text, reasoning or error chunk for presentation
    StreamChunk { chunk: ApiStreamChunk },

    /// Usage of the current request and of the whole task
    UsageUpdated { request: Usage, total: Usage },

    /// The outgoing window elides a larger part of history
    ContextTruncated {
        range: TruncationRange,
        outgoing_messages: usize,
    },

    /// A failed request is being issued again
    ApiRetried { reason: String },

    /// Tool execution started
    ToolExecutionStart {
        tool_call_id: String,
        tool_name: String,
        arguments: serde_json::Value,
    },

    /// Tool execution completed
    ToolExecutionEnd {
        tool_call_id: String,
        tool_name: String,
        result: String,
        is_error: bool,
    },

    /// A tool call was not executed
    ToolSkipped {
        tool_call_id: String,
        tool_name: String,
        reason: String,
    },

    /// Full-autonomy recovery is consulting the analysis service
    RecoveryStarted { attempt: u32, error: String },

    /// A turn completed
    TurnEnded { turn_number: u32, usage: Usage },

    /// The completion tool ran
    TaskCompleted,

    /// The task was aborted
    TaskAborted { reason: String },

    /// Error occurred
    Error { message: String },
}

impl AgentEvent {
    /// Check if this is a terminal event
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AgentEvent::TaskCompleted | AgentEvent::TaskAborted { .. }
        )
    }
}

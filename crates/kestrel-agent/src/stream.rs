//! Consuming one provider response
//!
//! The orchestrator opens the provider stream, handles failures of the first
//! chunk (automatic truncate-and-retry, flaky-provider backoff, or asking the
//! human), then drains the rest of the stream in arrival order. Structured
//! function calls and usage are collected out of band; text, reasoning and
//! error chunks are forwarded to subscribers and to a [`ChunkSink`].

use async_trait::async_trait;
use futures::StreamExt;
use kestrel_ai::{
    ApiStreamChunk, ChunkStream, ContentBlock, FunctionCall, Message, ProviderClient, ToolChoice,
    ToolDefinition, Usage,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::approval::{ApprovalChannel, AskKind, AskResponse};
use crate::context::{ContextManager, TruncationPressure, TruncationRange, truncated_messages};
use crate::events::AgentEvent;

/// Shown instead of the raw provider error when truncating would help
pub const CONTEXT_EXCEEDED_RETRY: &str =
    "Context window exceeded. Click retry to truncate the conversation and try again.";

/// Outgoing histories this short cannot be usefully truncated
const MIN_TRUNCATABLE_MESSAGES: usize = 3;

/// Automatic retry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Pause before retrying a flaky provider's failed first chunk
    pub flaky_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            flaky_backoff_ms: 1000,
        }
    }
}

impl RetryConfig {
    pub fn flaky_backoff(&self) -> Duration {
        Duration::from_millis(self.flaky_backoff_ms)
    }
}

/// Why a stream ended early
#[derive(Debug, Clone, PartialEq)]
pub enum StreamFailure {
    /// The user aborted the task
    Cancelled,
    /// The user rejected a tool while the response streamed
    ToolRejected { feedback: Option<String> },
    /// The first chunk failed and the human declined to retry
    RetryDeclined {
        message: String,
        /// Overflow with too little history left to truncate
        context_exhausted: bool,
    },
    /// The provider failed mid-stream
    Provider(String),
}

impl StreamFailure {
    /// Cancellations and rejections end the loop without recovery
    pub fn is_user_interruption(&self) -> bool {
        matches!(
            self,
            StreamFailure::Cancelled | StreamFailure::ToolRejected { .. }
        )
    }

    pub fn message(&self) -> String {
        match self {
            StreamFailure::Cancelled => "User cancelled".to_string(),
            StreamFailure::ToolRejected { .. } => "User rejected tool".to_string(),
            StreamFailure::RetryDeclined { message, .. } => message.clone(),
            StreamFailure::Provider(message) => message.clone(),
        }
    }
}

/// What a sink wants after seeing a chunk
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkControl {
    Continue,
    Stop(StreamFailure),
}

/// Receives forwarded chunks (text, reasoning, error) as they arrive
#[async_trait]
pub trait ChunkSink: Send {
    async fn on_chunk(&mut self, chunk: &ApiStreamChunk) -> ChunkControl;

    /// Called before every attempt; state from a failed attempt is discarded
    fn reset(&mut self) {}
}

/// Sink that only lets chunks through
pub struct PassthroughSink;

#[async_trait]
impl ChunkSink for PassthroughSink {
    async fn on_chunk(&mut self, _chunk: &ApiStreamChunk) -> ChunkControl {
        ChunkControl::Continue
    }
}

/// Inputs of one request
pub struct StreamRequest<'a> {
    pub system_prompt: &'a str,
    /// The full log; the outgoing window is derived from it
    pub history: &'a [Message],
    pub deleted_range: Option<TruncationRange>,
    /// Persisted record of the previous request
    pub previous_request: Option<&'a serde_json::Value>,
    pub tools: Option<&'a [ToolDefinition]>,
    pub tool_choice: Option<&'a ToolChoice>,
}

/// Everything collected from one response
#[derive(Debug, Default)]
pub struct StreamOutcome {
    /// Structured calls, in arrival order
    pub native_calls: Vec<FunctionCall>,
    /// Concatenated text chunks
    pub text: String,
    pub usage: Usage,
    pub terminal_error: Option<StreamFailure>,
    /// Elided range after any truncation done for this request
    pub deleted_range: Option<TruncationRange>,
    /// An automatic retry was spent on this request
    pub auto_retried: bool,
}

impl StreamOutcome {
    fn failed(
        failure: StreamFailure,
        deleted_range: Option<TruncationRange>,
        auto_retried: bool,
    ) -> Self {
        Self {
            terminal_error: Some(failure),
            deleted_range,
            auto_retried,
            ..Default::default()
        }
    }
}

enum FirstChunk {
    Cancelled,
    Failed(kestrel_ai::Error),
}

/// Drives one provider request through to its last chunk
pub struct StreamOrchestrator {
    provider: Arc<dyn ProviderClient>,
    approval: Arc<dyn ApprovalChannel>,
    context: ContextManager,
    retry: RetryConfig,
    events: broadcast::Sender<AgentEvent>,
    cancel: CancellationToken,
}

impl StreamOrchestrator {
    pub fn new(
        provider: Arc<dyn ProviderClient>,
        approval: Arc<dyn ApprovalChannel>,
        context: ContextManager,
        retry: RetryConfig,
        events: broadcast::Sender<AgentEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            provider,
            approval,
            context,
            retry,
            events,
            cancel,
        }
    }

    /// Issue the request and consume the response.
    ///
    /// Failures never escape as errors: they end up in
    /// [`StreamOutcome::terminal_error`] next to whatever was received.
    pub async fn consume(
        &self,
        request: StreamRequest<'_>,
        sink: &mut dyn ChunkSink,
    ) -> StreamOutcome {
        let model = self.provider.model();
        let window = self.context.compute_window(
            request.history,
            request.deleted_range,
            request.previous_request,
            &model,
        );
        let mut range = window.deleted_range;
        if window.updated {
            self.emit_truncated(range, window.messages.len());
        }
        let mut messages = window.messages;
        let mut auto_retried = false;

        let (first, mut stream) = loop {
            sink.reset();
            let error = match self.open(&request, &messages).await {
                Ok(opened) => break opened,
                Err(FirstChunk::Cancelled) => {
                    return StreamOutcome::failed(StreamFailure::Cancelled, range, auto_retried);
                }
                Err(FirstChunk::Failed(e)) => e,
            };
            let overflow = error.is_context_overflow();
            tracing::warn!("First chunk failed (overflow: {}): {}", overflow, error);

            let truncate_now = overflow && model.requires_explicit_truncation;
            if !auto_retried && (truncate_now || model.retry_first_chunk_failure) {
                auto_retried = true;
                if overflow {
                    self.truncate(request.history, &mut range, &mut messages);
                }
                if !truncate_now {
                    tokio::select! {
                        _ = self.cancel.cancelled() => {
                            return StreamOutcome::failed(StreamFailure::Cancelled, range, auto_retried);
                        }
                        _ = tokio::time::sleep(self.retry.flaky_backoff()) => {}
                    }
                }
                let _ = self.events.send(AgentEvent::ApiRetried {
                    reason: error.format_with_status(),
                });
                continue;
            }

            let context_exhausted = overflow && messages.len() <= MIN_TRUNCATABLE_MESSAGES;
            let message = if overflow && !context_exhausted {
                auto_retried = false;
                CONTEXT_EXCEEDED_RETRY.to_string()
            } else {
                error.format_with_status()
            };
            let answer = match self.approval.ask(AskKind::ApiRequestFailed, &message).await {
                Ok(answer) => answer,
                Err(e) => {
                    tracing::warn!("Could not ask about failed request: {}", e);
                    AskResponse::no()
                }
            };
            if self.cancel.is_cancelled() {
                return StreamOutcome::failed(StreamFailure::Cancelled, range, auto_retried);
            }
            if !answer.is_yes() {
                return StreamOutcome::failed(
                    StreamFailure::RetryDeclined {
                        message,
                        context_exhausted,
                    },
                    range,
                    auto_retried,
                );
            }
            if overflow {
                self.truncate(request.history, &mut range, &mut messages);
            }
            let _ = self.events.send(AgentEvent::ApiRetried { reason: message });
        };

        let mut outcome = StreamOutcome {
            deleted_range: range,
            auto_retried,
            ..Default::default()
        };
        let mut next = Some(first);
        loop {
            if let Some(chunk) = next.take() {
                if let Some(failure) = self.handle_chunk(chunk, &mut outcome, sink).await {
                    outcome.terminal_error = Some(failure);
                    break;
                }
            }
            if self.cancel.is_cancelled() {
                outcome.terminal_error = Some(StreamFailure::Cancelled);
                break;
            }
            next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    outcome.terminal_error = Some(StreamFailure::Cancelled);
                    break;
                }
                item = stream.next() => match item {
                    Some(Ok(chunk)) => Some(chunk),
                    Some(Err(e)) => {
                        outcome.terminal_error = Some(StreamFailure::Provider(e.format_with_status()));
                        break;
                    }
                    None => break,
                },
            };
        }
        outcome
    }

    /// Create the stream and wait for its first chunk
    async fn open(
        &self,
        request: &StreamRequest<'_>,
        messages: &[Message],
    ) -> std::result::Result<(ApiStreamChunk, ChunkStream), FirstChunk> {
        let mut stream = tokio::select! {
            _ = self.cancel.cancelled() => return Err(FirstChunk::Cancelled),
            created = self.provider.create_message(
                request.system_prompt,
                messages,
                request.tools,
                request.tool_choice,
            ) => created.map_err(FirstChunk::Failed)?,
        };
        let first = tokio::select! {
            _ = self.cancel.cancelled() => return Err(FirstChunk::Cancelled),
            item = stream.next() => match item {
                Some(Ok(chunk)) => chunk,
                Some(Err(e)) => return Err(FirstChunk::Failed(e)),
                None => return Err(FirstChunk::Failed(kestrel_ai::Error::StreamEnded)),
            },
        };
        Ok((first, stream))
    }

    async fn handle_chunk(
        &self,
        chunk: ApiStreamChunk,
        outcome: &mut StreamOutcome,
        sink: &mut dyn ChunkSink,
    ) -> Option<StreamFailure> {
        match &chunk {
            ApiStreamChunk::FunctionCalls { calls } => {
                outcome.native_calls.extend(calls.iter().cloned());
                return None;
            }
            ApiStreamChunk::Usage(usage) => {
                outcome.usage.add(usage);
                return None;
            }
            ApiStreamChunk::Text { text } => outcome.text.push_str(text),
            ApiStreamChunk::Reasoning { .. } | ApiStreamChunk::Error { .. } => {}
        }

        let _ = self.events.send(AgentEvent::StreamChunk {
            chunk: chunk.clone(),
        });
        if let ApiStreamChunk::Error { message } = &chunk {
            return Some(StreamFailure::Provider(message.clone()));
        }
        match sink.on_chunk(&chunk).await {
            ChunkControl::Continue => None,
            ChunkControl::Stop(failure) => Some(failure),
        }
    }

    /// Grow the elided range aggressively and rebuild the outgoing window
    fn truncate(
        &self,
        history: &[Message],
        range: &mut Option<TruncationRange>,
        messages: &mut Vec<Message>,
    ) {
        let next = self.context.next_truncation_range(
            history,
            *range,
            TruncationPressure::Tokens.keep_ratio(),
        );
        if next == *range {
            tracing::info!("Nothing left to truncate; retrying with the same window");
            return;
        }
        *range = next;
        *messages = truncated_messages(history, next);
        self.emit_truncated(next, messages.len());
    }

    fn emit_truncated(&self, range: Option<TruncationRange>, outgoing_messages: usize) {
        if let Some(range) = range {
            let _ = self.events.send(AgentEvent::ContextTruncated {
                range,
                outgoing_messages,
            });
        }
    }
}

/// Close out partial assistant output after an interrupted stream, so the
/// log stays resumable and roles keep alternating.
pub fn finalize_interrupted(text: &str, failure: &StreamFailure) -> Message {
    let marker = match failure {
        StreamFailure::Cancelled => "[Response interrupted by user]",
        _ => "[Response interrupted by API Error]",
    };
    let text = text.trim_end();
    let content = if text.is_empty() {
        marker.to_string()
    } else {
        format!("{}\n\n{}", text, marker)
    };
    Message::assistant(vec![ContentBlock::text(content)])
}

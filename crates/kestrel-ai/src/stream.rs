//! Streaming chunk types

use serde::{Deserialize, Serialize};
use std::pin::Pin;
use tokio_stream::Stream;

use crate::error::Result;
use crate::types::UsageChunk;

/// A structured function call emitted by a provider with native tool support
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    /// Provider-assigned call id, when the provider supplies one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

impl FunctionCall {
    pub fn new(name: impl Into<String>, args: serde_json::Value) -> Self {
        Self {
            id: None,
            name: name.into(),
            args,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

/// One element of a provider response stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ApiStreamChunk {
    /// Assistant text delta
    Text { text: String },
    /// Reasoning/thinking delta
    Reasoning { reasoning: String },
    /// Token usage, mid-stream and/or at the end
    Usage(UsageChunk),
    /// Structured tool calls (native function-calling providers)
    FunctionCalls { calls: Vec<FunctionCall> },
    /// Provider-side error reported inside the stream
    Error { message: String },
}

impl ApiStreamChunk {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn usage(input_tokens: u64, output_tokens: u64) -> Self {
        Self::Usage(UsageChunk {
            input_tokens,
            output_tokens,
            ..Default::default()
        })
    }

    /// Whether UI-facing consumers should see this chunk
    pub fn is_forwarded(&self) -> bool {
        matches!(
            self,
            ApiStreamChunk::Text { .. }
                | ApiStreamChunk::Reasoning { .. }
                | ApiStreamChunk::Error { .. }
        )
    }
}

/// A pull-based stream of response chunks
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<ApiStreamChunk>> + Send>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_wire_format() {
        let chunk: ApiStreamChunk = serde_json::from_str(
            r#"{"type":"usage","inputTokens":12,"outputTokens":3,"totalCost":0.01}"#,
        )
        .unwrap();
        match chunk {
            ApiStreamChunk::Usage(u) => {
                assert_eq!(u.input_tokens, 12);
                assert_eq!(u.cache_read_tokens, None);
                assert_eq!(u.total_cost, Some(0.01));
            }
            other => panic!("expected usage, got {:?}", other),
        }

        let calls: ApiStreamChunk = serde_json::from_str(
            r#"{"type":"function_calls","calls":[{"name":"read_file","args":{"path":"x"}}]}"#,
        )
        .unwrap();
        assert!(!calls.is_forwarded());
        assert!(ApiStreamChunk::text("hi").is_forwarded());
    }
}

//! Replayed provider responses
//!
//! A replay script is a JSON file describing the model and, in order, what
//! each request should receive:
//!
//! ```json
//! {
//!   "model": { "id": "replay", "supports_native_function_calling": true },
//!   "responses": [
//!     [ { "type": "text", "text": "Listing files." },
//!       { "type": "function_calls", "calls": [ { "name": "list_files", "args": { "path": "." } } ] },
//!       { "type": "usage", "input_tokens": 120, "output_tokens": 30 } ],
//!     { "error": { "status": 500, "message": "upstream unavailable" } }
//!   ],
//!   "recovery": [ { "analysis": "...", "next_actions": [] } ]
//! }
//! ```

use async_trait::async_trait;
use kestrel_agent::{RecoveryAnalysisService, RecoveryRequest, RecoveryResult};
use kestrel_ai::{
    ApiStreamChunk, ChunkStream, Message, ModelInfo, ProviderClient, ToolChoice, ToolDefinition,
};
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::VecDeque;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct ReplayError {
    #[serde(default)]
    pub status: Option<u16>,
    pub message: String,
}

impl ReplayError {
    fn into_error(self) -> kestrel_ai::Error {
        match self.status {
            Some(status) => kestrel_ai::Error::api_status(status, self.message),
            None => kestrel_ai::Error::api(self.message),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ReplayResponse {
    /// Streamed in order, then the stream ends
    Chunks(Vec<ApiStreamChunk>),
    /// The request itself fails
    Failure { error: ReplayError },
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ReplayScript {
    pub model: ModelInfo,
    pub responses: Vec<ReplayResponse>,
    pub recovery: Vec<RecoveryResult>,
}

impl ReplayScript {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// Hands out scripted responses, one per request
pub struct ReplayProvider {
    model: ModelInfo,
    responses: Mutex<VecDeque<ReplayResponse>>,
}

impl ReplayProvider {
    pub fn new(model: ModelInfo, responses: Vec<ReplayResponse>) -> Self {
        Self {
            model,
            responses: Mutex::new(responses.into()),
        }
    }
}

#[async_trait]
impl ProviderClient for ReplayProvider {
    async fn create_message(
        &self,
        _system_prompt: &str,
        history: &[Message],
        tools: Option<&[ToolDefinition]>,
        _tool_choice: Option<&ToolChoice>,
    ) -> kestrel_ai::Result<ChunkStream> {
        tracing::debug!(
            "Replay request with {} messages and {} tools",
            history.len(),
            tools.map_or(0, |t| t.len())
        );
        let next = self.responses.lock().pop_front();
        match next {
            Some(ReplayResponse::Chunks(chunks)) => {
                let items: Vec<kestrel_ai::Result<ApiStreamChunk>> =
                    chunks.into_iter().map(Ok).collect();
                Ok(Box::pin(tokio_stream::iter(items)))
            }
            Some(ReplayResponse::Failure { error }) => Err(error.into_error()),
            None => Err(kestrel_ai::Error::api("replay script has no responses left")),
        }
    }

    fn model(&self) -> ModelInfo {
        self.model.clone()
    }
}

/// Answers recovery requests from the script's `recovery` list
pub struct ReplayRecovery {
    results: Mutex<VecDeque<RecoveryResult>>,
}

impl ReplayRecovery {
    pub fn new(results: Vec<RecoveryResult>) -> Self {
        Self {
            results: Mutex::new(results.into()),
        }
    }
}

#[async_trait]
impl RecoveryAnalysisService for ReplayRecovery {
    async fn analyze_and_recover(&self, request: &RecoveryRequest) -> kestrel_agent::Result<RecoveryResult> {
        tracing::debug!("Recovery requested: {}", request.error_description);
        self.results
            .lock()
            .pop_front()
            .ok_or_else(|| kestrel_agent::Error::Recovery("no scripted recovery left".into()))
    }
}

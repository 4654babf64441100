//! Scripted collaborators shared by the unit tests

use async_trait::async_trait;
use futures::StreamExt;
use kestrel_ai::{
    ApiStreamChunk, ChunkStream, Message, ModelInfo, ProviderClient, ToolChoice, ToolDefinition,
};
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::approval::{ApprovalChannel, AskKind, AskResponse, SayKind};
use crate::recovery::{RecoveryAnalysisService, RecoveryRequest, RecoveryResult};
use crate::tool::{ToolError, ToolExecutor, ToolResponse};

/// One scripted provider response
pub(crate) enum Script {
    /// Stream these items, then end
    Chunks(Vec<kestrel_ai::Result<ApiStreamChunk>>),
    /// `create_message` fails outright
    Fail(kestrel_ai::Error),
    /// Stream these items, then hang until dropped
    Stall(Vec<kestrel_ai::Result<ApiStreamChunk>>),
}

impl Script {
    pub(crate) fn text(text: &str) -> Self {
        Script::Chunks(vec![
            Ok(ApiStreamChunk::text(text)),
            Ok(ApiStreamChunk::usage(100, 20)),
        ])
    }

    pub(crate) fn calls(calls: Vec<kestrel_ai::FunctionCall>) -> Self {
        Script::Chunks(vec![
            Ok(ApiStreamChunk::FunctionCalls { calls }),
            Ok(ApiStreamChunk::usage(100, 20)),
        ])
    }
}

pub(crate) struct ScriptedProvider {
    model: ModelInfo,
    scripts: Mutex<VecDeque<Script>>,
    /// Outgoing history of every request
    pub(crate) requests: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedProvider {
    pub(crate) fn new(model: ModelInfo, scripts: Vec<Script>) -> Arc<Self> {
        Arc::new(Self {
            model,
            scripts: Mutex::new(scripts.into()),
            requests: Mutex::new(vec![]),
        })
    }

    pub(crate) fn request_count(&self) -> usize {
        self.requests.lock().len()
    }
}

#[async_trait]
impl ProviderClient for ScriptedProvider {
    async fn create_message(
        &self,
        _system_prompt: &str,
        history: &[Message],
        _tools: Option<&[ToolDefinition]>,
        _tool_choice: Option<&ToolChoice>,
    ) -> kestrel_ai::Result<ChunkStream> {
        self.requests.lock().push(history.to_vec());
        let script = self.scripts.lock().pop_front();
        match script {
            Some(Script::Chunks(items)) => Ok(Box::pin(tokio_stream::iter(items))),
            Some(Script::Stall(items)) => Ok(Box::pin(
                tokio_stream::iter(items).chain(futures::stream::pending()),
            )),
            Some(Script::Fail(e)) => Err(e),
            None => Err(kestrel_ai::Error::api("no scripted response left")),
        }
    }

    fn model(&self) -> ModelInfo {
        self.model.clone()
    }
}

/// Answers asks from a queue; an empty queue answers "no"
#[derive(Default)]
pub(crate) struct ScriptedApproval {
    answers: Mutex<VecDeque<AskResponse>>,
    pub(crate) asks: Mutex<Vec<(AskKind, String)>>,
    pub(crate) says: Mutex<Vec<(SayKind, String)>>,
}

impl ScriptedApproval {
    pub(crate) fn new(answers: Vec<AskResponse>) -> Arc<Self> {
        Arc::new(Self {
            answers: Mutex::new(answers.into()),
            ..Default::default()
        })
    }

    pub(crate) fn ask_kinds(&self) -> Vec<AskKind> {
        self.asks.lock().iter().map(|(k, _)| *k).collect()
    }
}

#[async_trait]
impl ApprovalChannel for ScriptedApproval {
    async fn ask(&self, kind: AskKind, payload: &str) -> crate::Result<AskResponse> {
        self.asks.lock().push((kind, payload.to_string()));
        Ok(self
            .answers
            .lock()
            .pop_front()
            .unwrap_or_else(AskResponse::no))
    }

    async fn say(&self, kind: SayKind, text: &str) {
        self.says.lock().push((kind, text.to_string()));
    }
}

/// Executes any advertised tool by echoing its name; names in `failing` error.
/// Unknown tools and missing required params fail like a registry would.
pub(crate) struct RecordingExecutor {
    definitions: Vec<ToolDefinition>,
    failing: HashSet<String>,
    never_ready: bool,
    pub(crate) calls: Mutex<Vec<(String, serde_json::Value)>>,
}

impl RecordingExecutor {
    pub(crate) fn new(tools: &[(&str, &[&str])]) -> Self {
        let definitions = tools
            .iter()
            .map(|(name, required)| {
                ToolDefinition::new(
                    *name,
                    format!("{} tool", name),
                    serde_json::json!({
                        "type": "object",
                        "properties": required
                            .iter()
                            .map(|p| (p.to_string(), serde_json::json!({"type": "string"})))
                            .collect::<serde_json::Map<_, _>>(),
                        "required": required,
                    }),
                )
            })
            .collect();
        Self {
            definitions,
            failing: HashSet::new(),
            never_ready: false,
            calls: Mutex::new(vec![]),
        }
    }

    /// The usual tool set: read_file, list_files, write_to_file, attempt_completion
    pub(crate) fn standard() -> Self {
        Self::new(&[
            ("read_file", &["path"]),
            ("list_files", &["path"]),
            ("write_to_file", &["path", "content"]),
            ("attempt_completion", &["result"]),
        ])
    }

    pub(crate) fn failing(mut self, name: &str) -> Self {
        self.failing.insert(name.to_string());
        self
    }

    /// `wait_until_ready` never resolves
    pub(crate) fn never_ready(mut self) -> Self {
        self.never_ready = true;
        self
    }

    pub(crate) fn called(&self) -> Vec<String> {
        self.calls.lock().iter().map(|(n, _)| n.clone()).collect()
    }
}

#[async_trait]
impl ToolExecutor for RecordingExecutor {
    async fn execute_by_name(
        &self,
        name: &str,
        args: serde_json::Value,
        cancel: CancellationToken,
    ) -> Result<ToolResponse, ToolError> {
        if cancel.is_cancelled() {
            return Err(ToolError::Cancelled);
        }
        self.calls.lock().push((name.to_string(), args.clone()));
        if self.failing.contains(name) {
            return Err(ToolError::Failed(format!("{} exploded", name)));
        }
        let Some(definition) = self.definitions.iter().find(|d| d.name == name) else {
            return Err(ToolError::NotFound(name.to_string()));
        };
        if let Some(missing) = definition
            .required_params()
            .into_iter()
            .find(|p| args.get(*p).is_none())
        {
            return Err(ToolError::InvalidArguments(format!(
                "missing required property '{}'",
                missing
            )));
        }
        Ok(ToolResponse::text(format!("{} ok", name)))
    }

    fn tool_definitions(&self) -> Vec<ToolDefinition> {
        self.definitions.clone()
    }

    async fn wait_until_ready(&self) {
        if self.never_ready {
            futures::future::pending::<()>().await;
        }
    }
}

/// Recovery service answering from a queue; an empty queue is a service error
#[derive(Default)]
pub(crate) struct ScriptedRecovery {
    results: Mutex<VecDeque<RecoveryResult>>,
    pub(crate) requests: Mutex<Vec<RecoveryRequest>>,
}

impl ScriptedRecovery {
    pub(crate) fn new(results: Vec<RecoveryResult>) -> Arc<Self> {
        Arc::new(Self {
            results: Mutex::new(results.into()),
            requests: Mutex::new(vec![]),
        })
    }
}

#[async_trait]
impl RecoveryAnalysisService for ScriptedRecovery {
    async fn analyze_and_recover(&self, request: &RecoveryRequest) -> crate::Result<RecoveryResult> {
        self.requests.lock().push(request.clone());
        self.results
            .lock()
            .pop_front()
            .ok_or_else(|| crate::Error::Recovery("analysis unavailable".into()))
    }
}

/// `n` messages alternating user/assistant, starting with user
pub(crate) fn alternating(n: usize) -> Vec<Message> {
    (0..n)
        .map(|i| {
            if i % 2 == 0 {
                Message::user(format!("u{}", i))
            } else {
                Message::assistant(vec![kestrel_ai::ContentBlock::text(format!("a{}", i))])
            }
        })
        .collect()
}

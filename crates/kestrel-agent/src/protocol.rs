//! Turning a model response into tool executions and results
//!
//! Two modes, chosen once per model:
//!
//! * native: the provider hands over structured calls ([`run_native`])
//! * tags: calls are parsed out of the streamed text and each one is
//!   approved by the human as soon as its closing tag arrives
//!   ([`TagToolSession`])
//!
//! Either way every tool use in the assistant message gets exactly one
//! result, in the same order, in the following user message.

use async_trait::async_trait;
use kestrel_ai::{ApiStreamChunk, ContentBlock, FunctionCall, Message, ToolDefinition};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::approval::{ApprovalChannel, AskKind};
use crate::autonomy::should_auto_approve;
use crate::config::AutoApprovalSettings;
use crate::events::AgentEvent;
use crate::parser::{AssistantBlock, clean_text, finalize_blocks, parse_assistant_message};
use crate::stream::{ChunkControl, ChunkSink, StreamFailure};
use crate::tool::{ToolError, ToolExecutor, ToolResult};

/// Stands in for a response with nothing in it
pub const EMPTY_RESPONSE_PLACEHOLDER: &str = "(No actionable content generated)";

const CANCELLED_RESULT: &str = "Tool execution cancelled";
const PRIOR_REJECTION: &str = "Skipped due to prior tool rejection.";

/// Outcome of the tool phase of a turn
#[derive(Debug, Clone)]
pub struct ToolTurnResult {
    /// At least one tool actually ran
    pub executed_any: bool,
    /// User message with one result per tool use, if any tool was requested
    pub tool_results_message: Option<Message>,
    /// The completion tool ran without error
    pub detected_completion_signal: bool,
    /// Assistant message to append: text plus tool uses
    pub assistant_message: Message,
    /// First tool failure, worded for recovery analysis
    pub tool_error: Option<String>,
    /// The human rejected a tool
    pub rejected: bool,
    /// Malformed tool calls in this response
    pub mistakes: u32,
    /// Calls that ran without asking
    pub auto_approved: u32,
}

/// What tool execution needs from the task
#[derive(Clone)]
pub struct ToolContext {
    pub executor: Arc<dyn ToolExecutor>,
    pub events: broadcast::Sender<AgentEvent>,
    pub cancel: CancellationToken,
    pub completion_tool: String,
}

/// Id for a call the provider did not name
fn call_id(turn: &str, index: usize) -> String {
    format!("call_{}_{}", turn, index)
}

fn turn_nonce() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Collects results in call order
#[derive(Default)]
struct ResultBatch {
    results: Vec<ContentBlock>,
    executed_any: bool,
    completed: bool,
    tool_error: Option<String>,
    mistakes: u32,
}

impl ResultBatch {
    fn into_message(self) -> Option<Message> {
        if self.results.is_empty() {
            None
        } else {
            Some(Message::user_with_content(self.results))
        }
    }
}

impl ToolContext {
    /// Run one call and record its result
    async fn execute(
        &self,
        batch: &mut ResultBatch,
        id: &str,
        name: &str,
        args: serde_json::Value,
    ) {
        if self.cancel.is_cancelled() {
            self.skip(batch, ToolResult::error(id, CANCELLED_RESULT), name);
            return;
        }

        let _ = self.events.send(AgentEvent::ToolExecutionStart {
            tool_call_id: id.to_string(),
            tool_name: name.to_string(),
            arguments: args.clone(),
        });
        let result = match self
            .executor
            .execute_by_name(name, args, self.cancel.clone())
            .await
        {
            Ok(response) => ToolResult::success(id, response.into_content()),
            Err(e) => {
                tracing::warn!("Tool '{}' failed: {}", name, e);
                if matches!(e, ToolError::InvalidArguments(_) | ToolError::NotFound(_)) {
                    batch.mistakes += 1;
                }
                if batch.tool_error.is_none() {
                    batch.tool_error = Some(format!("Tool execution failed for {}: {}", name, e));
                }
                ToolResult::error(id, format!("[Tool Error]: {}", e))
            }
        };
        let _ = self.events.send(AgentEvent::ToolExecutionEnd {
            tool_call_id: id.to_string(),
            tool_name: name.to_string(),
            result: result.text_content(),
            is_error: result.is_error,
        });

        batch.executed_any = true;
        if name == self.completion_tool && !result.is_error {
            batch.completed = true;
        }
        batch.results.push(result.into_block());
    }

    /// Record a result for a call that did not run
    fn skip(&self, batch: &mut ResultBatch, result: ToolResult, name: &str) {
        let _ = self.events.send(AgentEvent::ToolSkipped {
            tool_call_id: result.tool_use_id.clone(),
            tool_name: name.to_string(),
            reason: result.text_content(),
        });
        batch.results.push(result.into_block());
    }
}

fn assistant_message(mut content: Vec<ContentBlock>) -> Message {
    content.retain(ContentBlock::is_meaningful);
    if content.is_empty() {
        content.push(ContentBlock::text(EMPTY_RESPONSE_PLACEHOLDER));
    }
    Message::assistant(content)
}

/// Execute structured calls in order. Failures become error results; they
/// never stop the batch.
pub async fn run_native(ctx: &ToolContext, calls: Vec<FunctionCall>, text: &str) -> ToolTurnResult {
    let nonce = turn_nonce();
    let calls: Vec<(String, FunctionCall)> = calls
        .into_iter()
        .enumerate()
        .map(|(i, call)| {
            let id = call.id.clone().unwrap_or_else(|| call_id(&nonce, i));
            (id, call)
        })
        .collect();

    let mut content = vec![ContentBlock::text(text.trim())];
    content.extend(
        calls
            .iter()
            .map(|(id, call)| ContentBlock::tool_use(id, &call.name, call.args.clone())),
    );

    let mut batch = ResultBatch::default();
    for (id, call) in calls {
        ctx.execute(&mut batch, &id, &call.name, call.args).await;
    }

    let mistakes = batch.mistakes;
    ToolTurnResult {
        executed_any: batch.executed_any,
        detected_completion_signal: batch.completed,
        tool_error: batch.tool_error.take(),
        tool_results_message: batch.into_message(),
        assistant_message: assistant_message(content),
        rejected: false,
        mistakes,
        auto_approved: 0,
    }
}

/// What happens to a parsed tool block
#[derive(Debug, Clone, PartialEq)]
enum Decision {
    Approved,
    /// Rejected by the human, with optional feedback
    Rejected(Option<String>),
    /// Malformed call; the message goes back to the model
    Invalid(String),
    /// Came after a rejection
    AfterRejection,
}

/// Tag-mode tool handling. Feeds on streamed text, asking for approval of
/// each tool block as soon as it is complete; [`TagToolSession::finish`]
/// runs the approved calls once the stream is over.
pub struct TagToolSession {
    tool_names: Vec<String>,
    definitions: Vec<ToolDefinition>,
    approval: Arc<dyn ApprovalChannel>,
    auto_approval: AutoApprovalSettings,
    text: String,
    decisions: Vec<Decision>,
    rejected: bool,
    mistakes: u32,
    auto_approved: u32,
}

impl TagToolSession {
    pub fn new(
        definitions: Vec<ToolDefinition>,
        approval: Arc<dyn ApprovalChannel>,
        auto_approval: AutoApprovalSettings,
    ) -> Self {
        Self {
            tool_names: definitions.iter().map(|d| d.name.clone()).collect(),
            definitions,
            approval,
            auto_approval,
            text: String::new(),
            decisions: vec![],
            rejected: false,
            mistakes: 0,
            auto_approved: 0,
        }
    }

    /// Whether a tool was rejected during this response
    pub fn is_rejected(&self) -> bool {
        self.rejected
    }

    async fn decide(&mut self, name: &str, params: &BTreeMap<String, String>) -> Decision {
        if self.rejected {
            return Decision::AfterRejection;
        }

        let missing = self
            .definitions
            .iter()
            .find(|d| d.name == name)
            .and_then(|d| {
                d.required_params()
                    .into_iter()
                    .find(|p| params.get(*p).is_none_or(|v| v.is_empty()))
                    .map(str::to_string)
            });
        if let Some(param) = missing {
            self.mistakes += 1;
            return Decision::Invalid(format!(
                "Missing required parameter '{}' for tool '{}'",
                param, name
            ));
        }

        if should_auto_approve(&self.auto_approval, name, params) {
            self.auto_approved += 1;
            return Decision::Approved;
        }

        let payload = serde_json::json!({ "tool": name, "params": params }).to_string();
        match self.approval.ask(AskKind::Tool, &payload).await {
            Ok(answer) if answer.is_yes() => Decision::Approved,
            Ok(answer) => {
                self.rejected = true;
                Decision::Rejected(answer.feedback().map(str::to_string))
            }
            Err(e) => {
                tracing::warn!("Tool approval failed, treating as rejection: {}", e);
                self.rejected = true;
                Decision::Rejected(None)
            }
        }
    }

    /// Decide every complete tool block not decided yet. Returns the feedback
    /// of a rejection made along the way.
    async fn decide_pending(&mut self, blocks: &[AssistantBlock]) -> Option<Option<String>> {
        let mut rejection = None;
        let pending: Vec<(String, BTreeMap<String, String>)> = blocks
            .iter()
            .filter_map(|b| match b {
                AssistantBlock::ToolUse {
                    name,
                    params,
                    partial: false,
                } => Some((name.clone(), params.clone())),
                _ => None,
            })
            .skip(self.decisions.len())
            .collect();
        for (name, params) in pending {
            let decision = self.decide(&name, &params).await;
            if let Decision::Rejected(feedback) = &decision {
                rejection = Some(feedback.clone());
            }
            self.decisions.push(decision);
        }
        rejection
    }

    /// Settle any blocks completed by the end of the stream, then execute
    /// approved calls in order.
    pub async fn finish(mut self, ctx: &ToolContext) -> ToolTurnResult {
        let mut blocks = parse_assistant_message(&self.text, &self.tool_names);
        finalize_blocks(&mut blocks);
        if !ctx.cancel.is_cancelled() {
            self.decide_pending(&blocks).await;
        }

        let nonce = turn_nonce();
        let mut content = Vec::new();
        let mut calls = Vec::new();
        for block in blocks {
            match block {
                AssistantBlock::Text { content: text, .. } => {
                    content.push(ContentBlock::text(clean_text(&text)))
                }
                AssistantBlock::ToolUse { name, params, .. } => {
                    let id = call_id(&nonce, calls.len());
                    let input: serde_json::Map<String, serde_json::Value> = params
                        .into_iter()
                        .map(|(k, v)| (k, serde_json::Value::String(v)))
                        .collect();
                    let input = serde_json::Value::Object(input);
                    content.push(ContentBlock::tool_use(&id, &name, input.clone()));
                    calls.push((id, name, input));
                }
            }
        }

        let mut batch = ResultBatch::default();
        for (index, (id, name, input)) in calls.into_iter().enumerate() {
            // Undecided only when cancelled before the stream ended
            let decision = self
                .decisions
                .get(index)
                .cloned()
                .unwrap_or(Decision::Invalid(CANCELLED_RESULT.to_string()));
            match decision {
                Decision::Approved => ctx.execute(&mut batch, &id, &name, input).await,
                Decision::Rejected(feedback) => ctx.skip(
                    &mut batch,
                    ToolResult::skipped(&id, &name, feedback.as_deref()),
                    &name,
                ),
                Decision::Invalid(message) => {
                    ctx.skip(&mut batch, ToolResult::error(&id, message), &name)
                }
                Decision::AfterRejection => {
                    ctx.skip(&mut batch, ToolResult::error(&id, PRIOR_REJECTION), &name)
                }
            }
        }

        let mistakes = self.mistakes + batch.mistakes;
        ToolTurnResult {
            executed_any: batch.executed_any,
            detected_completion_signal: batch.completed,
            tool_error: batch.tool_error.take(),
            tool_results_message: batch.into_message(),
            assistant_message: assistant_message(content),
            rejected: self.rejected,
            mistakes,
            auto_approved: self.auto_approved,
        }
    }
}

#[async_trait]
impl ChunkSink for TagToolSession {
    async fn on_chunk(&mut self, chunk: &ApiStreamChunk) -> ChunkControl {
        let ApiStreamChunk::Text { text } = chunk else {
            return ChunkControl::Continue;
        };
        self.text.push_str(text);
        let blocks = parse_assistant_message(&self.text, &self.tool_names);
        match self.decide_pending(&blocks).await {
            Some(feedback) => ChunkControl::Stop(StreamFailure::ToolRejected { feedback }),
            None => ChunkControl::Continue,
        }
    }

    fn reset(&mut self) {
        self.text.clear();
        self.decisions.clear();
        self.rejected = false;
        self.mistakes = 0;
        self.auto_approved = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::AskResponse;
    use crate::testing::{RecordingExecutor, ScriptedApproval};

    fn ctx(executor: RecordingExecutor) -> (ToolContext, Arc<RecordingExecutor>) {
        let executor = Arc::new(executor);
        let (events, _) = broadcast::channel(64);
        (
            ToolContext {
                executor: executor.clone(),
                events,
                cancel: CancellationToken::new(),
                completion_tool: "attempt_completion".into(),
            },
            executor,
        )
    }

    fn paired(result: &ToolTurnResult) -> Vec<(String, String)> {
        let uses: Vec<String> = result
            .assistant_message
            .tool_uses()
            .iter()
            .map(|(id, _, _)| id.to_string())
            .collect();
        let results: Vec<String> = result
            .tool_results_message
            .as_ref()
            .map(|m| m.tool_results().iter().map(|(id, _)| id.to_string()).collect())
            .unwrap_or_default();
        uses.into_iter().zip(results).collect()
    }

    fn result_texts(result: &ToolTurnResult) -> Vec<String> {
        result
            .tool_results_message
            .as_ref()
            .map(|m| {
                m.content
                    .iter()
                    .filter_map(|b| match b {
                        ContentBlock::ToolResult { content, .. } => Some(
                            content
                                .iter()
                                .filter_map(|c| c.as_text())
                                .collect::<Vec<_>>()
                                .join("\n"),
                        ),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn test_native_failure_does_not_stop_batch() {
        let (ctx, executor) = ctx(RecordingExecutor::standard().failing("read_file"));
        let calls = vec![
            FunctionCall::new("read_file", serde_json::json!({"path": "a.rs"})),
            FunctionCall::new("list_files", serde_json::json!({"path": "."})),
        ];
        let result = run_native(&ctx, calls, "Looking around.").await;

        assert!(result.executed_any);
        assert_eq!(executor.called(), vec!["read_file", "list_files"]);
        let message = result.tool_results_message.as_ref().unwrap();
        let flags: Vec<bool> = message.tool_results().iter().map(|(_, e)| *e).collect();
        assert_eq!(flags, vec![true, false]);
        assert_eq!(
            result_texts(&result),
            vec!["[Tool Error]: read_file exploded", "list_files ok"]
        );
        assert_eq!(
            result.tool_error.as_deref(),
            Some("Tool execution failed for read_file: read_file exploded")
        );
        assert!(paired(&result).iter().all(|(u, r)| u == r));
        assert_eq!(paired(&result).len(), 2);
    }

    #[tokio::test]
    async fn test_native_malformed_calls_count_as_mistakes() {
        let (ctx, _) = ctx(RecordingExecutor::standard().failing("read_file"));
        let calls = vec![
            FunctionCall::new("write_to_file", serde_json::json!({"path": "a.rs"})),
            FunctionCall::new("search_web", serde_json::json!({})),
            FunctionCall::new("read_file", serde_json::json!({"path": "a.rs"})),
        ];
        let result = run_native(&ctx, calls, "").await;

        // Only the missing param and the unknown tool are the model's fault
        assert_eq!(result.mistakes, 2);
        assert_eq!(paired(&result).len(), 3);
    }

    #[tokio::test]
    async fn test_native_keeps_provider_ids() {
        let (ctx, _) = ctx(RecordingExecutor::standard());
        let calls = vec![
            FunctionCall::new("list_files", serde_json::json!({"path": "."})).with_id("toolu_1"),
            FunctionCall::new("list_files", serde_json::json!({"path": "src"})),
        ];
        let result = run_native(&ctx, calls, "").await;
        let pairs = paired(&result);
        assert_eq!(pairs[0].0, "toolu_1");
        assert!(pairs[1].0.starts_with("call_") && pairs[1].0.ends_with("_1"));
        assert!(pairs.iter().all(|(u, r)| u == r));
    }

    #[tokio::test]
    async fn test_completion_signal_requires_success() {
        let (ok_ctx, _) = ctx(RecordingExecutor::standard());
        let call = || vec![FunctionCall::new("attempt_completion", serde_json::json!({"result": "done"}))];
        assert!(run_native(&ok_ctx, call(), "").await.detected_completion_signal);

        let (bad_ctx, _) = ctx(RecordingExecutor::standard().failing("attempt_completion"));
        assert!(!run_native(&bad_ctx, call(), "").await.detected_completion_signal);
    }

    #[tokio::test]
    async fn test_cancelled_calls_do_not_run() {
        let (ctx, executor) = ctx(RecordingExecutor::standard());
        ctx.cancel.cancel();
        let calls = vec![FunctionCall::new("list_files", serde_json::json!({"path": "."}))];
        let result = run_native(&ctx, calls, "").await;
        assert!(!result.executed_any);
        assert!(executor.called().is_empty());
        assert_eq!(result_texts(&result), vec![CANCELLED_RESULT]);
    }

    #[tokio::test]
    async fn test_empty_response_gets_placeholder() {
        let (ctx, _) = ctx(RecordingExecutor::standard());
        let result = run_native(&ctx, vec![], "  ").await;
        assert!(result.tool_results_message.is_none());
        assert!(!result.executed_any);
        assert_eq!(result.assistant_message.text(), EMPTY_RESPONSE_PLACEHOLDER);
    }

    fn session(approval: Arc<ScriptedApproval>, settings: AutoApprovalSettings) -> TagToolSession {
        TagToolSession::new(
            RecordingExecutor::standard().tool_definitions(),
            approval,
            settings,
        )
    }

    #[tokio::test]
    async fn test_tag_block_approved_across_chunks() {
        let approval = ScriptedApproval::new(vec![AskResponse::yes()]);
        let mut session = session(approval.clone(), AutoApprovalSettings::default());
        for piece in ["Let me read.\n<read_", "file><path>src/", "main.rs</path></read_file>"] {
            let control = session.on_chunk(&ApiStreamChunk::text(piece)).await;
            assert_eq!(control, ChunkControl::Continue);
        }
        assert_eq!(approval.ask_kinds(), vec![AskKind::Tool]);
        let payload: serde_json::Value =
            serde_json::from_str(&approval.asks.lock()[0].1).unwrap();
        assert_eq!(payload["params"]["path"], "src/main.rs");

        let (ctx, executor) = ctx(RecordingExecutor::standard());
        let result = session.finish(&ctx).await;
        assert_eq!(executor.called(), vec!["read_file"]);
        assert_eq!(result.assistant_message.text(), "Let me read.");
        assert_eq!(paired(&result).len(), 1);
        assert!(!result.rejected);
    }

    #[tokio::test]
    async fn test_tag_rejection_skips_rest() {
        let approval = ScriptedApproval::new(vec![
            AskResponse::yes(),
            AskResponse::no().with_text("wrong file"),
        ]);
        let mut session = session(approval.clone(), AutoApprovalSettings::default());
        let text = "<read_file><path>a</path></read_file>\
                    <read_file><path>b</path></read_file>\
                    <list_files><path>.</path></list_files>";
        let control = session.on_chunk(&ApiStreamChunk::text(text)).await;
        assert_eq!(
            control,
            ChunkControl::Stop(StreamFailure::ToolRejected {
                feedback: Some("wrong file".into())
            })
        );
        assert_eq!(approval.asks.lock().len(), 2);

        let (ctx, executor) = ctx(RecordingExecutor::standard());
        let result = session.finish(&ctx).await;
        assert!(result.rejected);
        assert_eq!(executor.called(), vec!["read_file"]);
        assert_eq!(
            result_texts(&result),
            vec![
                "read_file ok",
                "[Tool Skipped: read_file - wrong file]",
                PRIOR_REJECTION,
            ]
        );
        assert_eq!(paired(&result).len(), 3);
    }

    #[tokio::test]
    async fn test_tag_missing_parameter_is_a_mistake() {
        let approval = ScriptedApproval::new(vec![]);
        let mut session = session(approval.clone(), AutoApprovalSettings::default());
        session
            .on_chunk(&ApiStreamChunk::text(
                "<write_to_file><path>x.txt</path></write_to_file>",
            ))
            .await;
        assert!(approval.asks.lock().is_empty());

        let (ctx, executor) = ctx(RecordingExecutor::standard());
        let result = session.finish(&ctx).await;
        assert_eq!(result.mistakes, 1);
        assert!(executor.called().is_empty());
        assert_eq!(
            result_texts(&result),
            vec!["Missing required parameter 'content' for tool 'write_to_file'"]
        );
    }

    #[tokio::test]
    async fn test_tag_auto_approval_skips_ask() {
        let mut settings = AutoApprovalSettings {
            enabled: true,
            ..Default::default()
        };
        settings.actions.read_files = true;
        let approval = ScriptedApproval::new(vec![]);
        let mut session = session(approval.clone(), settings);
        session
            .on_chunk(&ApiStreamChunk::text("<list_files><path>.</path></list_files>"))
            .await;
        let (ctx, _) = ctx(RecordingExecutor::standard());
        let result = session.finish(&ctx).await;
        assert!(approval.asks.lock().is_empty());
        assert_eq!(result.auto_approved, 1);
        assert!(result.executed_any);
    }

    #[tokio::test]
    async fn test_block_completed_at_stream_end_is_decided_in_finish() {
        let approval = ScriptedApproval::new(vec![AskResponse::yes()]);
        let mut session = session(approval.clone(), AutoApprovalSettings::default());
        // Closing tag never arrives; the stream end completes the block
        session
            .on_chunk(&ApiStreamChunk::text("<read_file><path>a</path>"))
            .await;
        assert!(approval.asks.lock().is_empty());
        let (ctx, executor) = ctx(RecordingExecutor::standard());
        session.finish(&ctx).await;
        assert_eq!(approval.asks.lock().len(), 1);
        assert_eq!(executor.called(), vec!["read_file"]);
    }

    #[tokio::test]
    async fn test_reset_discards_attempt_state() {
        let approval = ScriptedApproval::new(vec![AskResponse::no()]);
        let mut session = session(approval, AutoApprovalSettings::default());
        session
            .on_chunk(&ApiStreamChunk::text("<read_file><path>a</path></read_file>"))
            .await;
        assert!(session.is_rejected());
        session.reset();
        assert!(!session.is_rejected());
        let (ctx, _) = ctx(RecordingExecutor::standard());
        let result = session.finish(&ctx).await;
        assert!(result.tool_results_message.is_none());
    }
}

//! The task loop
//!
//! A [`Task`] owns its conversation and autonomy counters and drives turns
//! iteratively: limit checks, one provider request, the tool phase, then a
//! continuation decision. Every append reaches the persistence store before
//! the next request is issued.

use kestrel_ai::{ContentBlock, Message, ProviderClient};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::approval::{ApprovalChannel, AskKind, AskResponse, SayKind};
use crate::autonomy::{AutonomyState, TurnSummary, TurnVerdict};
use crate::config::AgentConfig;
use crate::context::{ContextManager, TruncationRange};
use crate::conversation::{Appended, Conversation, RequestRecord};
use crate::error::{Error, Result};
use crate::events::AgentEvent;
use crate::handle::{TaskHandle, TaskShared};
use crate::parser::clean_text;
use crate::persistence::PersistenceStore;
use crate::protocol::{TagToolSession, ToolContext, ToolTurnResult, run_native};
use crate::recovery::{
    RecoveryAnalysisService, RecoveryCoordinator, RecoveryOutcome, error_description,
};
use crate::stream::{
    PassthroughSink, StreamFailure, StreamOrchestrator, StreamRequest, finalize_interrupted,
};
use crate::tool::ToolExecutor;

const MISTAKE_LIMIT_PROMPT: &str = "The agent is having trouble. This may indicate a failure in its \
    thought process or an inability to use a tool properly. Continue the task?";

/// Where the loop currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Idle,
    AwaitingApiResponse,
    ExecutingTools,
    AwaitingUserApproval,
    Recovering,
    Completed,
    Aborted,
}

/// How a run of the loop ended
#[derive(Debug, Clone, PartialEq)]
pub enum LoopOutcome {
    /// The completion tool ran
    Completed,
    /// Control is back with the human
    TurnEnded,
    /// Recovery needs the human's input
    AwaitingUser { question: String },
    /// The request failed and was not retried
    Failed { message: String },
    /// The task is over and cannot be continued
    Aborted { reason: String },
}

/// Collaborators and settings a task is built from
pub struct TaskParts {
    /// Generated when absent; required by [`Task::resume`]
    pub task_id: Option<String>,
    pub config: AgentConfig,
    pub provider: Arc<dyn ProviderClient>,
    pub executor: Arc<dyn ToolExecutor>,
    pub approval: Arc<dyn ApprovalChannel>,
    /// Full autonomy ends the turn instead of recovering when absent
    pub recovery: Option<Arc<dyn RecoveryAnalysisService>>,
    pub store: Arc<dyn PersistenceStore>,
}

/// What follows a step of the loop
enum Step {
    /// Issue another request with this user content (may be empty)
    Next(Vec<ContentBlock>),
    Finish(LoopOutcome),
}

/// One autonomous coding task
pub struct Task {
    task_id: String,
    config: AgentConfig,
    provider: Arc<dyn ProviderClient>,
    executor: Arc<dyn ToolExecutor>,
    approval: Arc<dyn ApprovalChannel>,
    recovery: Option<RecoveryCoordinator>,
    store: Arc<dyn PersistenceStore>,
    context: ContextManager,
    conversation: Conversation,
    autonomy: AutonomyState,
    state: LoopState,
    goal: String,
    shared: Arc<TaskShared>,
    event_tx: broadcast::Sender<AgentEvent>,
    turn: u32,
}

impl Task {
    /// Create a fresh task
    pub fn new(parts: TaskParts) -> Result<Self> {
        parts.config.validate()?;
        let task_id = parts
            .task_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        Ok(Self::assemble(task_id, parts, Conversation::new()))
    }

    /// Reopen a task from its persisted log
    pub async fn resume(parts: TaskParts) -> Result<Self> {
        parts.config.validate()?;
        let task_id = parts
            .task_id
            .clone()
            .ok_or_else(|| Error::Persistence("resuming requires a task id".into()))?;
        let snapshot = parts
            .store
            .load(&task_id)
            .await?
            .ok_or_else(|| Error::Persistence(format!("task {} not found", task_id)))?;
        let conversation =
            Conversation::restore(snapshot.messages, snapshot.deleted_range, snapshot.request_log);
        let mut task = Self::assemble(task_id, parts, conversation);
        task.goal = task
            .conversation
            .messages()
            .first()
            .map(|m| {
                let text = m.text();
                text.trim_start_matches("<task>\n")
                    .trim_end_matches("\n</task>")
                    .to_string()
            })
            .unwrap_or_default();
        tracing::info!(
            "Resumed task {} with {} messages",
            task.task_id,
            task.conversation.len()
        );
        Ok(task)
    }

    fn assemble(task_id: String, parts: TaskParts, conversation: Conversation) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        let recovery = parts
            .recovery
            .map(|service| RecoveryCoordinator::new(service, parts.config.limits.max_recovery_failures));
        Self {
            task_id,
            context: ContextManager::new(parts.config.context.clone()),
            autonomy: AutonomyState::new(&parts.config.autonomy),
            config: parts.config,
            provider: parts.provider,
            executor: parts.executor,
            approval: parts.approval,
            recovery,
            store: parts.store,
            conversation,
            state: LoopState::Idle,
            goal: String::new(),
            shared: TaskShared::new(),
            event_tx,
            turn: 0,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Subscribe to task events
    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.event_tx.subscribe()
    }

    /// A non-owning handle for aborting and watching the task from elsewhere
    pub fn handle(&self) -> TaskHandle {
        TaskHandle::new(&self.task_id, &self.shared)
    }

    /// Abort the task. In-flight streams are torn down at the next chunk.
    pub fn abort(&self) {
        self.shared.cancel.cancel();
    }

    pub fn history(&self) -> &[Message] {
        self.conversation.messages()
    }

    pub fn deleted_range(&self) -> Option<TruncationRange> {
        self.conversation.deleted_range()
    }

    pub fn autonomy(&self) -> &AutonomyState {
        &self.autonomy
    }

    pub fn total_usage(&self) -> &kestrel_ai::Usage {
        &self.conversation.total_usage
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Begin the task with its goal
    pub async fn start(&mut self, goal: &str, images: &[String]) -> Result<LoopOutcome> {
        let _ = self.event_tx.send(AgentEvent::TaskStarted {
            task_id: self.task_id.clone(),
        });
        self.goal = goal.to_string();
        let mut content = vec![ContentBlock::text(format!("<task>\n{}\n</task>", goal))];
        content.extend(image_blocks(images));
        self.run_loop(content).await
    }

    /// Continue with a human message after the loop ended
    pub async fn send(&mut self, text: &str, images: &[String]) -> Result<LoopOutcome> {
        if self.state == LoopState::Aborted || self.shared.cancel.is_cancelled() {
            return Err(Error::Aborted("the task was aborted".into()));
        }
        self.autonomy.reset_steps();
        let mut content = vec![ContentBlock::text(text)];
        content.extend(image_blocks(images));
        self.run_loop(content).await
    }

    /// Run turns until the loop ends
    pub async fn run_loop(&mut self, initial_user_content: Vec<ContentBlock>) -> Result<LoopOutcome> {
        self.shared.set_running(true);
        let result = self.drive(initial_user_content).await;
        if let Err(e) = &result {
            let _ = self.event_tx.send(AgentEvent::Error {
                message: e.to_string(),
            });
        }
        if !matches!(self.state, LoopState::Completed | LoopState::Aborted) {
            self.set_state(LoopState::Idle);
        }
        self.shared.set_running(false);
        result
    }

    async fn drive(&mut self, initial_user_content: Vec<ContentBlock>) -> Result<LoopOutcome> {
        let mut pending = initial_user_content;
        loop {
            match self.turn_once(std::mem::take(&mut pending)).await? {
                Step::Next(content) => pending = content,
                Step::Finish(outcome) => return Ok(outcome),
            }
        }
    }

    async fn turn_once(&mut self, mut pending: Vec<ContentBlock>) -> Result<Step> {
        if self.shared.cancel.is_cancelled() {
            return Ok(Step::Finish(self.mark_aborted("User cancelled")));
        }
        if let Some(outcome) = self.check_limits(&mut pending).await? {
            return Ok(Step::Finish(outcome));
        }

        let wait = self.config.registry_ready_timeout();
        let executor = self.executor.clone();
        let cancel = self.shared.cancel.clone();
        let ready = tokio::select! {
            _ = cancel.cancelled() => None,
            ready = tokio::time::timeout(wait, executor.wait_until_ready()) => Some(ready.is_ok()),
        };
        match ready {
            None => return Ok(Step::Finish(self.mark_aborted("User cancelled"))),
            Some(false) => tracing::warn!(
                "Tool registry not ready after {:?}; continuing without waiting",
                wait
            ),
            Some(true) => {}
        }

        if !pending.is_empty() {
            self.append_user(pending).await?;
        }

        self.turn += 1;
        let _ = self.event_tx.send(AgentEvent::TurnStarted {
            turn_number: self.turn,
        });
        self.set_state(LoopState::AwaitingApiResponse);

        let model = self.provider.model();
        let native = model.supports_native_function_calling;
        let definitions = self.executor.tool_definitions();
        let orchestrator = StreamOrchestrator::new(
            self.provider.clone(),
            self.approval.clone(),
            self.context.clone(),
            self.config.retry.clone(),
            self.event_tx.clone(),
            self.shared.cancel.clone(),
        );
        let mut tag_session = TagToolSession::new(
            definitions.clone(),
            self.approval.clone(),
            self.config.auto_approval.clone(),
        );
        let request = StreamRequest {
            system_prompt: self.config.system_prompt.as_deref().unwrap_or_default(),
            history: self.conversation.messages(),
            deleted_range: self.conversation.deleted_range(),
            previous_request: self.conversation.last_request(),
            tools: native.then_some(definitions.as_slice()),
            tool_choice: None,
        };
        let outcome = if native {
            orchestrator.consume(request, &mut PassthroughSink).await
        } else {
            orchestrator.consume(request, &mut tag_session).await
        };

        if outcome.deleted_range != self.conversation.deleted_range() {
            self.conversation.set_deleted_range(outcome.deleted_range);
            self.store
                .save_deleted_range(&self.task_id, outcome.deleted_range)
                .await?;
        }
        let usage = self
            .record_usage(&outcome.usage, &model.cost, outcome.terminal_error.as_ref())
            .await?;

        let ctx = ToolContext {
            executor: self.executor.clone(),
            events: self.event_tx.clone(),
            cancel: self.shared.cancel.clone(),
            completion_tool: self.config.completion_tool.clone(),
        };

        if let Some(failure) = outcome.terminal_error {
            return self
                .handle_stream_failure(failure, &outcome.text, tag_session, &ctx, usage)
                .await;
        }

        self.set_state(LoopState::ExecutingTools);
        let turn = if native {
            run_native(&ctx, outcome.native_calls, &outcome.text).await
        } else {
            tag_session.finish(&ctx).await
        };
        self.apply_tool_turn(&turn).await?;
        let _ = self.event_tx.send(AgentEvent::TurnEnded {
            turn_number: self.turn,
            usage,
        });

        if self.shared.cancel.is_cancelled() {
            return Ok(Step::Finish(self.mark_aborted("User cancelled")));
        }

        let summary = TurnSummary {
            completed: turn.detected_completion_signal,
            executed_tool: turn.executed_any,
            error: turn.tool_error.clone(),
        };
        match self.autonomy.decide(&summary) {
            TurnVerdict::Complete => {
                self.set_state(LoopState::Completed);
                let _ = self.event_tx.send(AgentEvent::TaskCompleted);
                Ok(Step::Finish(LoopOutcome::Completed))
            }
            TurnVerdict::Continue => Ok(Step::Next(vec![])),
            TurnVerdict::EndTurn => Ok(Step::Finish(LoopOutcome::TurnEnded)),
            TurnVerdict::AskToContinue => self.ask_to_continue(&summary).await,
            TurnVerdict::Recover => self.recover(summary.error.as_deref()).await,
        }
    }

    /// Token budget, mistake and auto-approval limits. Guidance given while
    /// continuing is added to `pending`.
    async fn check_limits(&mut self, pending: &mut Vec<ContentBlock>) -> Result<Option<LoopOutcome>> {
        if let Some(max) = self.config.limits.max_task_tokens {
            if self.conversation.total_task_tokens >= max {
                tracing::warn!(
                    "Task token limit ({}) reached: {} used",
                    max,
                    self.conversation.total_task_tokens
                );
                let answer = self
                    .ask(
                        AskKind::TaskTokenLimitReached,
                        &format!(
                            "Task has exceeded the configured token limit ({}). Continue anyway? \
                             (This may incur further costs)",
                            max
                        ),
                    )
                    .await?;
                if !answer.is_yes() {
                    return Ok(Some(self.mark_aborted("Task token limit reached")));
                }
            }
        }

        if self.autonomy.consecutive_mistakes >= self.config.limits.max_consecutive_mistakes {
            let answer = self.ask(AskKind::MistakeLimitReached, MISTAKE_LIMIT_PROMPT).await?;
            if !answer.is_affirmative() {
                return Ok(Some(self.mark_aborted("Too many consecutive mistakes")));
            }
            if let Some(feedback) = answer.feedback() {
                pending.push(ContentBlock::text(too_many_mistakes(feedback)));
                pending.extend(image_blocks(&answer.images));
            }
            self.autonomy.consecutive_mistakes = 0;
        }

        let settings = &self.config.auto_approval;
        if settings.enabled
            && self.autonomy.consecutive_auto_approved_requests >= settings.max_requests
        {
            let prompt = format!(
                "The agent has auto-approved {} API requests. Reset the count and proceed with the task?",
                settings.max_requests
            );
            let answer = self.ask(AskKind::AutoApprovalMaxReached, &prompt).await?;
            if !answer.is_yes() {
                return Ok(Some(self.mark_aborted("Auto-approval limit reached")));
            }
            self.autonomy.consecutive_auto_approved_requests = 0;
        }
        Ok(None)
    }

    async fn handle_stream_failure(
        &mut self,
        failure: StreamFailure,
        text: &str,
        tag_session: TagToolSession,
        ctx: &ToolContext,
        usage: kestrel_ai::Usage,
    ) -> Result<Step> {
        match failure {
            StreamFailure::ToolRejected { .. } => {
                // Approved calls before the rejection still run
                self.set_state(LoopState::ExecutingTools);
                let turn = tag_session.finish(ctx).await;
                self.apply_tool_turn(&turn).await?;
                let _ = self.event_tx.send(AgentEvent::TurnEnded {
                    turn_number: self.turn,
                    usage,
                });
                Ok(Step::Finish(LoopOutcome::TurnEnded))
            }
            StreamFailure::Cancelled => {
                self.append(finalize_interrupted(&clean_text(text), &failure))
                    .await?;
                Ok(Step::Finish(self.mark_aborted("User cancelled")))
            }
            StreamFailure::RetryDeclined {
                context_exhausted: true,
                ..
            } => {
                self.append(finalize_interrupted(&clean_text(text), &failure))
                    .await?;
                self.mark_aborted(&Error::ContextExhausted.to_string());
                Err(Error::ContextExhausted)
            }
            other => {
                self.append(finalize_interrupted(&clean_text(text), &other))
                    .await?;
                let message = other.message();
                if self.autonomy.mode == crate::autonomy::AutonomyMode::Full {
                    return self.recover(Some(&message)).await;
                }
                let _ = self.event_tx.send(AgentEvent::Error {
                    message: message.clone(),
                });
                self.approval.say(SayKind::Error, &message).await;
                Ok(Step::Finish(LoopOutcome::Failed { message }))
            }
        }
    }

    /// Step budget spent: keep going only with the human's consent
    async fn ask_to_continue(&mut self, summary: &TurnSummary) -> Result<Step> {
        let prompt = format!(
            "Agent has completed {} autonomous steps. Continue? (Yes/No)",
            self.autonomy.max_autonomous_steps
        );
        let answer = self.ask(AskKind::AutonomyStepLimitReached, &prompt).await?;
        if !answer.is_affirmative() {
            return Ok(Step::Finish(self.mark_aborted("Autonomous step limit reached")));
        }
        self.autonomy.reset_steps();

        let mut guidance = Vec::new();
        if let Some(text) = answer.feedback() {
            guidance.push(ContentBlock::text(text));
            guidance.extend(image_blocks(&answer.images));
        }
        if summary.executed_tool || !guidance.is_empty() {
            Ok(Step::Next(guidance))
        } else {
            Ok(Step::Finish(LoopOutcome::TurnEnded))
        }
    }

    async fn recover(&mut self, error: Option<&str>) -> Result<Step> {
        let Some(coordinator) = &self.recovery else {
            tracing::debug!("No recovery service configured; ending turn");
            return Ok(Step::Finish(LoopOutcome::TurnEnded));
        };
        self.state = LoopState::Recovering;
        let _ = self.event_tx.send(AgentEvent::StateChanged {
            state: LoopState::Recovering,
        });
        let _ = self.event_tx.send(AgentEvent::RecoveryStarted {
            attempt: self.autonomy.consecutive_recovery_failures + 1,
            error: error_description(error),
        });

        let outcome = coordinator
            .attempt(
                &mut self.autonomy,
                &self.goal,
                self.conversation.messages(),
                error,
            )
            .await;
        let message = outcome.message();
        match outcome {
            RecoveryOutcome::Resume(text) => Ok(Step::Next(vec![ContentBlock::text(text)])),
            RecoveryOutcome::Clarify { .. } | RecoveryOutcome::SuggestTool { .. } => {
                let question = message.unwrap_or_default();
                self.approval.say(SayKind::Info, &question).await;
                Ok(Step::Finish(LoopOutcome::AwaitingUser { question }))
            }
            RecoveryOutcome::Exhausted { .. } => {
                let reason = message.unwrap_or_default();
                self.approval.say(SayKind::Error, &reason).await;
                Ok(Step::Finish(self.mark_aborted(&reason)))
            }
            RecoveryOutcome::GaveUp(reason) => {
                self.approval.say(SayKind::Error, &reason).await;
                Ok(Step::Finish(LoopOutcome::Failed { message: reason }))
            }
        }
    }

    /// Append the tool phase's messages and fold its counters into autonomy
    async fn apply_tool_turn(&mut self, turn: &ToolTurnResult) -> Result<()> {
        self.append(turn.assistant_message.clone()).await?;
        if let Some(results) = &turn.tool_results_message {
            self.append(results.clone()).await?;
        }
        self.autonomy.consecutive_mistakes += turn.mistakes;
        if turn.auto_approved > 0 {
            self.autonomy.consecutive_auto_approved_requests += 1;
        }
        if turn.executed_any && turn.tool_error.is_none() {
            self.autonomy.record_successful_tools();
        }
        Ok(())
    }

    /// Persist the request's metrics and fold them into the task totals
    async fn record_usage(
        &mut self,
        usage: &kestrel_ai::Usage,
        cost_info: &kestrel_ai::CostInfo,
        failure: Option<&StreamFailure>,
    ) -> Result<kestrel_ai::Usage> {
        let mut usage = usage.clone();
        let cost = usage.cost_or_calculated(cost_info);
        usage.total_cost = Some(cost);

        let mut record = RequestRecord::from_usage(&usage, cost);
        record.cancel_reason = match failure {
            Some(StreamFailure::Cancelled) => Some("user_cancelled".to_string()),
            Some(_) => Some("streaming_failed".to_string()),
            None => None,
        };
        let record = serde_json::to_value(&record)?;
        self.store
            .append_request_record(&self.task_id, &record)
            .await?;
        self.conversation.record_request(record);

        self.conversation.total_usage.merge(&usage);
        self.conversation.total_task_tokens += usage.input_tokens + usage.output_tokens;
        let _ = self.event_tx.send(AgentEvent::UsageUpdated {
            request: usage.clone(),
            total: self.conversation.total_usage.clone(),
        });
        Ok(usage)
    }

    async fn ask(&mut self, kind: AskKind, payload: &str) -> Result<AskResponse> {
        let previous = self.state;
        self.set_state(LoopState::AwaitingUserApproval);
        let answer = self.approval.ask(kind, payload).await?;
        self.set_state(previous);
        Ok(answer)
    }

    async fn append(&mut self, message: Message) -> Result<()> {
        self.store.append_message(&self.task_id, &message).await?;
        self.conversation.push(message);
        Ok(())
    }

    async fn append_user(&mut self, content: Vec<ContentBlock>) -> Result<()> {
        let appended = self.conversation.push_user_content(content);
        let index = appended.index();
        let message = &self.conversation.messages()[index];
        match appended {
            Appended::New(_) => self.store.append_message(&self.task_id, message).await,
            Appended::Merged(_) => {
                self.store
                    .replace_message(&self.task_id, index, message)
                    .await
            }
        }
    }

    fn set_state(&mut self, state: LoopState) {
        if self.state != state {
            self.state = state;
            let _ = self.event_tx.send(AgentEvent::StateChanged { state });
        }
    }

    fn mark_aborted(&mut self, reason: &str) -> LoopOutcome {
        tracing::info!("Task {} aborted: {}", self.task_id, reason);
        self.shared.cancel.cancel();
        self.set_state(LoopState::Aborted);
        let _ = self.event_tx.send(AgentEvent::TaskAborted {
            reason: reason.to_string(),
        });
        LoopOutcome::Aborted {
            reason: reason.to_string(),
        }
    }
}

fn too_many_mistakes(feedback: &str) -> String {
    format!(
        "You seem to be having trouble proceeding. The user has provided the following feedback \
         to help guide you:\n<feedback>\n{}\n</feedback>",
        feedback
    )
}

/// Image blocks from data URLs (`data:image/png;base64,...`) or raw base64
fn image_blocks(images: &[String]) -> Vec<ContentBlock> {
    images
        .iter()
        .map(|image| {
            match image
                .strip_prefix("data:")
                .and_then(|rest| rest.split_once(";base64,"))
            {
                Some((media_type, data)) => ContentBlock::image(data, media_type),
                None => ContentBlock::image(image.as_str(), "image/png"),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autonomy::AutonomyMode;
    use crate::persistence::InMemoryStore;
    use crate::recovery::RecoveryResult;
    use crate::testing::{RecordingExecutor, Script, ScriptedApproval, ScriptedProvider, ScriptedRecovery};
    use kestrel_ai::{FunctionCall, ModelInfo, Role};
    use std::time::Duration;

    struct Harness {
        task: Task,
        provider: Arc<ScriptedProvider>,
        approval: Arc<ScriptedApproval>,
        executor: Arc<RecordingExecutor>,
        store: Arc<InMemoryStore>,
    }

    fn native() -> ModelInfo {
        ModelInfo::new("m", 128_000).with_native_function_calling(true)
    }

    fn harness(
        model: ModelInfo,
        scripts: Vec<Script>,
        answers: Vec<AskResponse>,
        config: AgentConfig,
        recovery: Option<Arc<ScriptedRecovery>>,
    ) -> Harness {
        harness_with(RecordingExecutor::standard(), model, scripts, answers, config, recovery)
    }

    fn harness_with(
        executor: RecordingExecutor,
        model: ModelInfo,
        scripts: Vec<Script>,
        answers: Vec<AskResponse>,
        config: AgentConfig,
        recovery: Option<Arc<ScriptedRecovery>>,
    ) -> Harness {
        let provider = ScriptedProvider::new(model, scripts);
        let approval = ScriptedApproval::new(answers);
        let executor = Arc::new(executor);
        let store = Arc::new(InMemoryStore::new());
        let task = Task::new(TaskParts {
            task_id: Some("task-1".into()),
            config,
            provider: provider.clone(),
            executor: executor.clone(),
            approval: approval.clone(),
            recovery: recovery.map(|r| r as Arc<dyn RecoveryAnalysisService>),
            store: store.clone(),
        })
        .unwrap();
        Harness {
            task,
            provider,
            approval,
            executor,
            store,
        }
    }

    fn config(mode: AutonomyMode, steps: u32) -> AgentConfig {
        let mut config = AgentConfig::default();
        config.autonomy.mode = mode;
        config.autonomy.max_autonomous_steps = steps;
        config
    }

    fn list_files() -> Script {
        Script::calls(vec![FunctionCall::new(
            "list_files",
            serde_json::json!({"path": "."}),
        )])
    }

    fn complete() -> Script {
        Script::calls(vec![FunctionCall::new(
            "attempt_completion",
            serde_json::json!({"result": "done"}),
        )])
    }

    fn roles_alternate(history: &[Message]) -> bool {
        history.windows(2).all(|w| w[0].role != w[1].role)
    }

    #[tokio::test]
    async fn test_completion_ends_task() {
        let mut h = harness(
            native(),
            vec![complete()],
            vec![],
            config(AutonomyMode::TurnBased, 10),
            None,
        );
        let mut events = h.task.subscribe();
        let outcome = h.task.start("Write hello world", &[]).await.unwrap();

        assert_eq!(outcome, LoopOutcome::Completed);
        assert_eq!(h.task.state(), LoopState::Completed);
        assert_eq!(h.task.history().len(), 3);
        assert!(h.task.history()[0].text().contains("<task>\nWrite hello world\n</task>"));

        let snapshot = h.store.snapshot("task-1").unwrap();
        assert_eq!(snapshot.messages, h.task.history());
        assert_eq!(snapshot.request_log.len(), 1);

        let mut saw_completed = false;
        while let Ok(event) = events.try_recv() {
            saw_completed |= matches!(event, AgentEvent::TaskCompleted);
        }
        assert!(saw_completed);
    }

    #[tokio::test]
    async fn test_turn_based_hands_back_and_resumes() {
        let mut h = harness(
            native(),
            vec![list_files(), Script::text("Here is the listing.")],
            vec![],
            config(AutonomyMode::TurnBased, 10),
            None,
        );
        assert_eq!(h.task.start("List files", &[]).await.unwrap(), LoopOutcome::TurnEnded);
        assert_eq!(h.provider.request_count(), 1);
        // user, assistant(tool use), user(results)
        assert_eq!(h.task.history().len(), 3);

        let outcome = h.task.send("Now summarize", &[]).await.unwrap();
        assert_eq!(outcome, LoopOutcome::TurnEnded);
        // The message merged into the trailing tool-result message
        assert_eq!(h.task.history().len(), 4);
        assert!(roles_alternate(h.task.history()));
        assert!(h.task.history()[2].text().contains("Now summarize"));
        assert_eq!(h.store.snapshot("task-1").unwrap().messages, h.task.history());
        assert_eq!(h.task.total_usage().input_tokens, 200);
    }

    #[tokio::test]
    async fn test_step_limit_pauses_after_exactly_s_steps() {
        let mut h = harness(
            native(),
            vec![list_files(), list_files(), list_files(), list_files()],
            vec![AskResponse::no()],
            config(AutonomyMode::StepLimited, 3),
            None,
        );
        let outcome = h.task.start("Explore", &[]).await.unwrap();

        assert_eq!(h.provider.request_count(), 3);
        assert_eq!(h.approval.ask_kinds(), vec![AskKind::AutonomyStepLimitReached]);
        assert_eq!(
            h.approval.asks.lock()[0].1,
            "Agent has completed 3 autonomous steps. Continue? (Yes/No)"
        );
        assert!(matches!(outcome, LoopOutcome::Aborted { .. }));
        assert!(h.task.send("more", &[]).await.is_err());
    }

    #[tokio::test]
    async fn test_step_limit_continue_resets_budget() {
        let mut h = harness(
            native(),
            vec![list_files(), list_files(), Script::text("All listed.")],
            vec![AskResponse::yes()],
            config(AutonomyMode::StepLimited, 2),
            None,
        );
        let outcome = h.task.start("Explore", &[]).await.unwrap();
        assert_eq!(outcome, LoopOutcome::TurnEnded);
        assert_eq!(h.provider.request_count(), 3);
        assert_eq!(h.task.autonomy().steps_remaining, 1);
    }

    #[tokio::test]
    async fn test_recovery_instruction_resumes_loop() {
        let recovery = ScriptedRecovery::new(vec![serde_json::from_value::<RecoveryResult>(
            serde_json::json!({
                "analysis": "no tool used",
                "next_actions": [{"type": "instruction", "details": {"instruction_text": "Use a tool."}}]
            }),
        )
        .unwrap()]);
        let mut h = harness(
            native(),
            vec![Script::text("I think..."), complete()],
            vec![],
            config(AutonomyMode::Full, 10),
            Some(recovery.clone()),
        );
        let outcome = h.task.start("Finish up", &[]).await.unwrap();

        assert_eq!(outcome, LoopOutcome::Completed);
        let history = h.task.history();
        assert_eq!(history[2].text(), "[Autonomous Recovery]: Use a tool.");
        assert_eq!(history[2].role, Role::User);
        assert!(roles_alternate(history));
        assert_eq!(h.task.autonomy().consecutive_recovery_failures, 0);
        assert_eq!(
            recovery.requests.lock()[0].error_description,
            "Agent produced text response instead of expected action/tool use."
        );
    }

    #[tokio::test]
    async fn test_recovery_ceiling_aborts_on_fourth_failure() {
        let clarify = || {
            serde_json::from_value::<RecoveryResult>(serde_json::json!({
                "analysis": "unclear",
                "next_actions": [{"type": "clarification_request", "details": {"question": "Which file?"}}]
            }))
            .unwrap()
        };
        let recovery = ScriptedRecovery::new(vec![clarify(), clarify(), clarify()]);
        let mut h = harness(
            native(),
            (0..4).map(|i| Script::text(&format!("musing {}", i))).collect(),
            vec![],
            config(AutonomyMode::Full, 10),
            Some(recovery.clone()),
        );

        let outcome = h.task.start("Do it", &[]).await.unwrap();
        assert!(matches!(outcome, LoopOutcome::AwaitingUser { ref question } if question.contains("Which file?")));
        for expected in 2..=3 {
            let outcome = h.task.send("keep going", &[]).await.unwrap();
            assert!(matches!(outcome, LoopOutcome::AwaitingUser { .. }));
            assert_eq!(h.task.autonomy().consecutive_recovery_failures, expected);
        }
        let outcome = h.task.send("keep going", &[]).await.unwrap();
        assert_eq!(
            outcome,
            LoopOutcome::Aborted {
                reason: "Agent failed to recover after 3 attempts. Task aborted.".into()
            }
        );
        assert_eq!(recovery.requests.lock().len(), 3);
        assert_eq!(h.task.state(), LoopState::Aborted);
    }

    #[tokio::test]
    async fn test_cancel_finalizes_partial_output() {
        let mut h = harness(
            native(),
            vec![Script::Stall(vec![Ok(kestrel_ai::ApiStreamChunk::text("Halfway"))])],
            vec![],
            config(AutonomyMode::TurnBased, 10),
            None,
        );
        let handle = h.task.handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            assert!(handle.abort());
        });
        let outcome = h.task.start("Long job", &[]).await.unwrap();

        assert_eq!(
            outcome,
            LoopOutcome::Aborted {
                reason: "User cancelled".into()
            }
        );
        let last = h.task.history().last().unwrap().clone();
        assert_eq!(last.text(), "Halfway\n\n[Response interrupted by user]");
        let snapshot = h.store.snapshot("task-1").unwrap();
        assert_eq!(snapshot.messages.last(), Some(&last));
        assert_eq!(
            snapshot.request_log[0]["cancelReason"],
            serde_json::json!("user_cancelled")
        );
        assert!(!h.task.handle().is_running());
    }

    #[tokio::test]
    async fn test_declined_retry_fails_turn() {
        let mut h = harness(
            native(),
            vec![Script::Fail(kestrel_ai::Error::api_status(500, "boom"))],
            vec![AskResponse::no()],
            config(AutonomyMode::TurnBased, 10),
            None,
        );
        let outcome = h.task.start("Try", &[]).await.unwrap();
        assert_eq!(
            outcome,
            LoopOutcome::Failed {
                message: "500 - API error: boom".into()
            }
        );
        assert_eq!(h.task.history()[1].text(), "[Response interrupted by API Error]");
        assert!(roles_alternate(h.task.history()));
    }

    #[tokio::test]
    async fn test_mistake_limit_asks_and_injects_guidance() {
        let missing = || Script::text("<write_to_file><path>x.txt</path></write_to_file>");
        let mut h = harness(
            ModelInfo::new("m", 128_000),
            vec![missing(), missing(), missing(), Script::text("ok")],
            vec![AskResponse::message("put the content in")],
            config(AutonomyMode::TurnBased, 10),
            None,
        );
        h.task.start("Write a file", &[]).await.unwrap();
        h.task.send("again", &[]).await.unwrap();
        h.task.send("again", &[]).await.unwrap();
        assert_eq!(h.task.autonomy().consecutive_mistakes, 3);
        assert!(h.approval.asks.lock().is_empty());

        h.task.send("again", &[]).await.unwrap();
        assert_eq!(h.approval.ask_kinds(), vec![AskKind::MistakeLimitReached]);
        assert_eq!(h.task.autonomy().consecutive_mistakes, 0);
        let requests = h.provider.requests.lock();
        let last_user = requests[3].last().unwrap().text();
        assert!(last_user.contains("You seem to be having trouble proceeding"));
        assert!(last_user.contains("put the content in"));
        assert!(h.executor.called().is_empty());
    }

    #[tokio::test]
    async fn test_token_budget_pause_can_abort() {
        let mut config = config(AutonomyMode::TurnBased, 10);
        config.limits.max_task_tokens = Some(100);
        let mut h = harness(native(), vec![Script::text("hi")], vec![AskResponse::no()], config, None);

        assert_eq!(h.task.start("Go", &[]).await.unwrap(), LoopOutcome::TurnEnded);
        let outcome = h.task.send("more", &[]).await.unwrap();
        assert!(matches!(outcome, LoopOutcome::Aborted { .. }));
        assert_eq!(h.approval.ask_kinds(), vec![AskKind::TaskTokenLimitReached]);
        assert_eq!(h.provider.request_count(), 1);
    }

    #[tokio::test]
    async fn test_native_malformed_calls_reach_mistake_limit() {
        let missing = || {
            Script::calls(vec![FunctionCall::new(
                "write_to_file",
                serde_json::json!({"path": "x.txt"}),
            )])
        };
        let mut h = harness(
            native(),
            vec![missing(), missing(), missing(), Script::text("ok")],
            vec![AskResponse::no()],
            config(AutonomyMode::TurnBased, 10),
            None,
        );
        h.task.start("Write a file", &[]).await.unwrap();
        h.task.send("again", &[]).await.unwrap();
        h.task.send("again", &[]).await.unwrap();
        assert_eq!(h.task.autonomy().consecutive_mistakes, 3);
        assert!(h.approval.asks.lock().is_empty());

        let outcome = h.task.send("again", &[]).await.unwrap();
        assert!(matches!(outcome, LoopOutcome::Aborted { .. }));
        assert_eq!(h.approval.ask_kinds(), vec![AskKind::MistakeLimitReached]);
        assert_eq!(h.provider.request_count(), 3);
    }

    #[tokio::test]
    async fn test_auto_approval_limit_resets_on_continue() {
        let mut config = config(AutonomyMode::TurnBased, 10);
        config.auto_approval.enabled = true;
        config.auto_approval.max_requests = 2;
        let mut h = harness(
            native(),
            vec![Script::text("hi")],
            vec![AskResponse::yes()],
            config,
            None,
        );
        h.task.autonomy.consecutive_auto_approved_requests = 2;

        assert_eq!(h.task.start("Go", &[]).await.unwrap(), LoopOutcome::TurnEnded);
        assert_eq!(h.approval.ask_kinds(), vec![AskKind::AutoApprovalMaxReached]);
        assert_eq!(h.task.autonomy().consecutive_auto_approved_requests, 0);
        assert_eq!(h.provider.request_count(), 1);
    }

    #[tokio::test]
    async fn test_auto_approval_limit_decline_aborts() {
        let mut config = config(AutonomyMode::TurnBased, 10);
        config.auto_approval.enabled = true;
        config.auto_approval.max_requests = 2;
        let mut h = harness(native(), vec![Script::text("hi")], vec![AskResponse::no()], config, None);
        h.task.autonomy.consecutive_auto_approved_requests = 2;

        let outcome = h.task.start("Go", &[]).await.unwrap();
        assert!(matches!(outcome, LoopOutcome::Aborted { .. }));
        assert_eq!(h.task.state(), LoopState::Aborted);
        assert_eq!(h.provider.request_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_registry_wait_is_bounded() {
        let mut h = harness_with(
            RecordingExecutor::standard().never_ready(),
            native(),
            vec![complete()],
            vec![],
            config(AutonomyMode::TurnBased, 10),
            None,
        );
        let started = tokio::time::Instant::now();
        assert_eq!(h.task.start("Finish", &[]).await.unwrap(), LoopOutcome::Completed);
        assert!(started.elapsed() >= Duration::from_secs(10));
        assert_eq!(h.provider.request_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_during_registry_wait() {
        let mut h = harness_with(
            RecordingExecutor::standard().never_ready(),
            native(),
            vec![complete()],
            vec![],
            config(AutonomyMode::TurnBased, 10),
            None,
        );
        let handle = h.task.handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            handle.abort();
        });

        let started = tokio::time::Instant::now();
        let outcome = h.task.start("Finish", &[]).await.unwrap();
        assert!(matches!(outcome, LoopOutcome::Aborted { .. }));
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(h.provider.request_count(), 0);
    }

    #[tokio::test]
    async fn test_tag_rejection_ends_turn_with_results() {
        let mut h = harness(
            ModelInfo::new("m", 128_000),
            vec![Script::text("<read_file><path>secret.txt</path></read_file>")],
            vec![AskResponse::no().with_text("not that one")],
            config(AutonomyMode::Full, 10),
            None,
        );
        let outcome = h.task.start("Read", &[]).await.unwrap();
        assert_eq!(outcome, LoopOutcome::TurnEnded);
        let history = h.task.history();
        assert_eq!(history.len(), 3);
        assert_eq!(history[2].tool_results(), vec![(history[1].tool_uses()[0].0, true)]);
        assert!(h.executor.called().is_empty());
    }

    #[tokio::test]
    async fn test_resume_restores_log_and_totals() {
        let mut h = harness(
            native(),
            vec![list_files()],
            vec![],
            config(AutonomyMode::TurnBased, 10),
            None,
        );
        h.task.start("List", &[]).await.unwrap();

        let resumed = Task::resume(TaskParts {
            task_id: Some("task-1".into()),
            config: AgentConfig::default(),
            provider: h.provider.clone(),
            executor: h.executor.clone(),
            approval: h.approval.clone(),
            recovery: None,
            store: h.store.clone(),
        })
        .await
        .unwrap();
        assert_eq!(resumed.history(), h.task.history());
        assert_eq!(resumed.total_usage().input_tokens, 100);
        assert_eq!(resumed.goal, "List");
    }

    #[test]
    fn test_image_blocks_parse_data_urls() {
        let blocks = image_blocks(&["data:image/jpeg;base64,AAAA".into(), "BBBB".into()]);
        assert_eq!(
            blocks,
            vec![
                ContentBlock::image("AAAA", "image/jpeg"),
                ContentBlock::image("BBBB", "image/png")
            ]
        );
    }
}

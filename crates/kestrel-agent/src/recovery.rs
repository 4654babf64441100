//! Full-autonomy recovery
//!
//! When a turn in full autonomy produces no tool execution or fails, an
//! external analysis service is asked what to do next. Exactly one outcome is
//! acted on, and a hard ceiling on consecutive failures keeps the agent from
//! repairing itself forever.

use async_trait::async_trait;
use kestrel_ai::{ContentBlock, Message};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::autonomy::AutonomyState;
use crate::error::Result;

/// Messages of recent state handed to the service
const RECENT_STATE_MESSAGES: usize = 4;
/// Tool invocations kept in the action history
const ACTION_HISTORY_LIMIT: usize = 20;

/// Prefix of user messages synthesized from a recovery instruction
pub const RECOVERY_PREFIX: &str = "[Autonomous Recovery]:";

/// Input of one recovery analysis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryRequest {
    #[serde(rename = "task_goal")]
    pub goal: String,
    /// The last few messages, as JSON
    #[serde(rename = "agent_state")]
    pub recent_state: serde_json::Value,
    #[serde(rename = "error_details")]
    pub error_description: String,
    /// Recent tool invocations, oldest first
    pub action_history: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryActionKind {
    Instruction,
    ClarificationRequest,
    ToolUse,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryAction {
    #[serde(rename = "type")]
    pub kind: RecoveryActionKind,
    #[serde(default)]
    pub details: serde_json::Value,
}

impl RecoveryAction {
    fn detail(&self, key: &str) -> Option<&str> {
        self.details
            .get(key)
            .and_then(|v| v.as_str())
            .filter(|s| !s.trim().is_empty())
    }
}

/// What the analysis service proposes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecoveryResult {
    #[serde(default)]
    pub analysis: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery_strategy: Option<String>,
    #[serde(default)]
    pub next_actions: Vec<RecoveryAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence_score: Option<f64>,
}

/// The collaborator that analyses a stuck task
#[async_trait]
pub trait RecoveryAnalysisService: Send + Sync {
    async fn analyze_and_recover(&self, request: &RecoveryRequest) -> Result<RecoveryResult>;
}

/// How the loop proceeds after a recovery attempt
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryOutcome {
    /// Continue with this synthesized user message
    Resume(String),
    /// Ask the human the suggested question; the loop ends
    Clarify { analysis: String, question: String },
    /// A tool was suggested; the human decides, the loop ends
    SuggestTool {
        analysis: String,
        tool_name: Option<String>,
    },
    /// The failure ceiling was exceeded; the task aborts
    Exhausted { attempts: u32 },
    /// No usable proposal; the loop ends
    GaveUp(String),
}

impl RecoveryOutcome {
    /// Text shown to the human for outcomes that end the loop
    pub fn message(&self) -> Option<String> {
        match self {
            RecoveryOutcome::Resume(_) => None,
            RecoveryOutcome::Clarify { analysis, question } => Some(format!(
                "Recovery Analysis: {}\nSuggested Question: {}",
                analysis, question
            )),
            RecoveryOutcome::SuggestTool {
                analysis,
                tool_name,
            } => Some(format!(
                "Recovery Analysis: {}\nAgent wants to use tool: {}. Please advise.",
                analysis,
                tool_name.as_deref().unwrap_or("unknown")
            )),
            RecoveryOutcome::Exhausted { attempts } => {
                Some(crate::Error::RecoveryExhausted { attempts: *attempts }.to_string())
            }
            RecoveryOutcome::GaveUp(reason) => Some(reason.clone()),
        }
    }
}

/// Describe what went wrong in a turn for the analysis service
pub fn error_description(error: Option<&str>) -> String {
    match error {
        Some(e) => format!("Error occurred: {}", e),
        None => "Agent produced text response instead of expected action/tool use.".to_string(),
    }
}

/// Assemble a request from the log
pub fn build_request(goal: &str, history: &[Message], error: Option<&str>) -> RecoveryRequest {
    let recent = &history[history.len().saturating_sub(RECENT_STATE_MESSAGES)..];
    RecoveryRequest {
        goal: if goal.trim().is_empty() {
            "Unknown Task Goal".to_string()
        } else {
            goal.to_string()
        },
        recent_state: serde_json::to_value(recent).unwrap_or_default(),
        error_description: error_description(error),
        action_history: action_history(history),
    }
}

/// Tool invocations with their result status, most recent last
fn action_history(history: &[Message]) -> Vec<serde_json::Value> {
    let outcomes: HashMap<&str, bool> = history
        .iter()
        .flat_map(|m| m.tool_results())
        .collect();
    let actions: Vec<serde_json::Value> = history
        .iter()
        .flat_map(|m| m.content.iter())
        .filter_map(|block| match block {
            ContentBlock::ToolUse { id, name, input } => Some(serde_json::json!({
                "tool": name,
                "input": input,
                "is_error": outcomes.get(id.as_str()).copied(),
            })),
            _ => None,
        })
        .collect();
    let skip = actions.len().saturating_sub(ACTION_HISTORY_LIMIT);
    actions.into_iter().skip(skip).collect()
}

/// Applies the recovery policy against the task's autonomy counters
pub struct RecoveryCoordinator {
    service: Arc<dyn RecoveryAnalysisService>,
    max_failures: u32,
}

impl RecoveryCoordinator {
    pub fn new(service: Arc<dyn RecoveryAnalysisService>, max_failures: u32) -> Self {
        Self {
            service,
            max_failures,
        }
    }

    /// Count a failed turn and, while under the ceiling, ask for a way forward
    pub async fn attempt(
        &self,
        state: &mut AutonomyState,
        goal: &str,
        history: &[Message],
        error: Option<&str>,
    ) -> RecoveryOutcome {
        state.consecutive_recovery_failures += 1;
        let failures = state.consecutive_recovery_failures;
        if failures > self.max_failures {
            tracing::error!("Maximum recovery attempts ({}) reached", failures - 1);
            return RecoveryOutcome::Exhausted {
                attempts: failures - 1,
            };
        }

        let request = build_request(goal, history, error);
        tracing::info!(
            "Attempting recovery (attempt {}): {}",
            failures,
            request.error_description
        );
        let result = match self.service.analyze_and_recover(&request).await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!("Recovery analysis failed: {}", e);
                return RecoveryOutcome::GaveUp(format!(
                    "Failed to perform recovery analysis: {}",
                    e
                ));
            }
        };

        let Some(action) = result.next_actions.first() else {
            return RecoveryOutcome::GaveUp(format!(
                "Recovery Analysis: {}\nNo clear next action proposed.",
                result.analysis
            ));
        };
        match action.kind {
            RecoveryActionKind::Instruction => {
                let instruction = action
                    .detail("instruction_text")
                    .unwrap_or(result.analysis.trim());
                if instruction.is_empty() {
                    tracing::warn!("Recovery instruction was empty; ending loop");
                    return RecoveryOutcome::GaveUp(
                        "Recovery Analysis: (none)\nNo clear next action proposed.".to_string(),
                    );
                }
                state.consecutive_recovery_failures = 0;
                RecoveryOutcome::Resume(format!("{} {}", RECOVERY_PREFIX, instruction))
            }
            RecoveryActionKind::ClarificationRequest => RecoveryOutcome::Clarify {
                analysis: result.analysis.clone(),
                question: action
                    .detail("question")
                    .unwrap_or("Please provide guidance.")
                    .to_string(),
            },
            RecoveryActionKind::ToolUse => RecoveryOutcome::SuggestTool {
                analysis: result.analysis.clone(),
                tool_name: action
                    .detail("tool_name")
                    .or_else(|| action.detail("toolName"))
                    .map(str::to_string),
            },
            RecoveryActionKind::Unknown => {
                tracing::warn!("Unknown recovery action type; ending loop");
                RecoveryOutcome::GaveUp(format!(
                    "Recovery Analysis: {}\nNo clear next action proposed.",
                    result.analysis
                ))
            }
        }
    }
}

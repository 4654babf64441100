//! Autonomy policy: how far the agent runs before a human must weigh in

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::config::{AutoApprovalSettings, AutonomyConfig};

/// How many turns run without mandatory human input
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutonomyMode {
    /// Every model response hands control back to the human
    #[default]
    TurnBased,
    /// Up to N turns run automatically, then the human is asked
    StepLimited,
    /// Runs until completion, with automatic recovery on failure
    Full,
}

/// Per-task counters. Owned and mutated only by the loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutonomyState {
    pub mode: AutonomyMode,
    pub max_autonomous_steps: u32,
    pub steps_remaining: u32,
    pub consecutive_mistakes: u32,
    pub consecutive_auto_approved_requests: u32,
    pub consecutive_recovery_failures: u32,
}

/// What one turn achieved, as far as continuation is concerned
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TurnSummary {
    /// The completion tool executed
    pub completed: bool,
    /// At least one tool executed
    pub executed_tool: bool,
    /// Tool or stream error that should be analysed
    pub error: Option<String>,
}

impl TurnSummary {
    /// Tools ran and nothing failed
    pub fn made_progress(&self) -> bool {
        self.executed_tool && self.error.is_none()
    }
}

/// Continuation verdict for a finished turn
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnVerdict {
    /// The task is done
    Complete,
    /// Issue the next request automatically
    Continue,
    /// Hand control back to the human
    EndTurn,
    /// Step budget spent; ask whether to keep going
    AskToContinue,
    /// Full mode without progress; consult recovery
    Recover,
}

impl AutonomyState {
    pub fn new(config: &AutonomyConfig) -> Self {
        Self {
            mode: config.mode,
            max_autonomous_steps: config.max_autonomous_steps,
            steps_remaining: config.max_autonomous_steps,
            consecutive_mistakes: 0,
            consecutive_auto_approved_requests: 0,
            consecutive_recovery_failures: 0,
        }
    }

    /// Tools ran cleanly: mistakes and recovery failures start over
    pub fn record_successful_tools(&mut self) {
        self.consecutive_mistakes = 0;
        self.consecutive_recovery_failures = 0;
    }

    pub fn reset_steps(&mut self) {
        self.steps_remaining = self.max_autonomous_steps;
    }

    /// Decide what follows a turn. In step-limited mode this consumes a step.
    pub fn decide(&mut self, turn: &TurnSummary) -> TurnVerdict {
        if turn.completed {
            return TurnVerdict::Complete;
        }
        match self.mode {
            AutonomyMode::TurnBased => TurnVerdict::EndTurn,
            AutonomyMode::StepLimited => {
                // A failed turn hands back to the human without spending a step
                if turn.error.is_some() {
                    return TurnVerdict::EndTurn;
                }
                self.steps_remaining = self.steps_remaining.saturating_sub(1);
                if self.steps_remaining == 0 {
                    TurnVerdict::AskToContinue
                } else if turn.made_progress() {
                    TurnVerdict::Continue
                } else {
                    TurnVerdict::EndTurn
                }
            }
            AutonomyMode::Full => {
                if turn.made_progress() {
                    TurnVerdict::Continue
                } else {
                    TurnVerdict::Recover
                }
            }
        }
    }
}

/// Auto-approval category of a tool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolCategory {
    ReadFiles,
    EditFiles,
    ExecuteCommands,
    UseBrowser,
    UseMcp,
    Other,
}

impl ToolCategory {
    pub fn of(tool_name: &str) -> Self {
        match tool_name {
            "read_file" | "list_files" | "list_code_definition_names" | "search_files" => {
                ToolCategory::ReadFiles
            }
            "write_to_file" | "replace_in_file" => ToolCategory::EditFiles,
            "execute_command" => ToolCategory::ExecuteCommands,
            "browser_action" => ToolCategory::UseBrowser,
            "use_mcp_tool" | "access_mcp_resource" => ToolCategory::UseMcp,
            _ => ToolCategory::Other,
        }
    }
}

/// Whether a tool call may run without asking the human
pub fn should_auto_approve(
    settings: &AutoApprovalSettings,
    tool_name: &str,
    params: &BTreeMap<String, String>,
) -> bool {
    if !settings.enabled {
        return false;
    }
    let actions = &settings.actions;
    match ToolCategory::of(tool_name) {
        ToolCategory::ReadFiles => actions.read_files,
        ToolCategory::EditFiles => actions.edit_files,
        ToolCategory::ExecuteCommands => {
            let flagged = params
                .get("requires_approval")
                .is_some_and(|v| v.trim().eq_ignore_ascii_case("true"));
            actions.execute_commands && !flagged
        }
        ToolCategory::UseBrowser => actions.use_browser,
        ToolCategory::UseMcp => actions.use_mcp,
        ToolCategory::Other => false,
    }
}

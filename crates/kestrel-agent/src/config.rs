//! Task configuration passed in at construction

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::autonomy::AutonomyMode;
use crate::context::ContextConfig;
use crate::error::{Error, Result};
use crate::stream::RetryConfig;

/// Name of the tool whose successful execution completes a task
pub const DEFAULT_COMPLETION_TOOL: &str = "attempt_completion";

/// Everything a task needs to know about policy. Built once by the host and
/// handed to the task; nothing in the core reads global settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// System prompt sent with every request
    pub system_prompt: Option<String>,
    pub autonomy: AutonomyConfig,
    pub auto_approval: AutoApprovalSettings,
    pub context: ContextConfig,
    pub limits: LimitConfig,
    pub retry: RetryConfig,
    /// How long to wait for the tool registry before proceeding without it
    pub registry_ready_timeout_ms: u64,
    /// Tool that signals task completion
    pub completion_tool: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            system_prompt: None,
            autonomy: AutonomyConfig::default(),
            auto_approval: AutoApprovalSettings::default(),
            context: ContextConfig::default(),
            limits: LimitConfig::default(),
            retry: RetryConfig::default(),
            registry_ready_timeout_ms: 10_000,
            completion_tool: DEFAULT_COMPLETION_TOOL.to_string(),
        }
    }
}

impl AgentConfig {
    pub fn registry_ready_timeout(&self) -> Duration {
        Duration::from_millis(self.registry_ready_timeout_ms)
    }

    /// Reject configurations the loop cannot honor
    pub fn validate(&self) -> Result<()> {
        if self.autonomy.mode == AutonomyMode::StepLimited && self.autonomy.max_autonomous_steps == 0
        {
            return Err(Error::Config(
                "max_autonomous_steps must be at least 1 in step_limited mode".into(),
            ));
        }
        if self.auto_approval.enabled && self.auto_approval.max_requests == 0 {
            return Err(Error::Config(
                "auto_approval.max_requests must be at least 1 when enabled".into(),
            ));
        }
        if self.context.keep_last == 0 {
            return Err(Error::Config("context.keep_last must be at least 1".into()));
        }
        if self.completion_tool.trim().is_empty() {
            return Err(Error::Config("completion_tool must not be empty".into()));
        }
        Ok(())
    }
}

/// Autonomy policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutonomyConfig {
    pub mode: AutonomyMode,
    /// Turns run without asking, in step_limited mode
    pub max_autonomous_steps: u32,
}

impl Default for AutonomyConfig {
    fn default() -> Self {
        Self {
            mode: AutonomyMode::TurnBased,
            max_autonomous_steps: 10,
        }
    }
}

/// Which tool categories may run without a per-call approval
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoApprovalActions {
    pub read_files: bool,
    pub edit_files: bool,
    pub execute_commands: bool,
    pub use_browser: bool,
    pub use_mcp: bool,
}

/// Batch auto-approval settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoApprovalSettings {
    pub enabled: bool,
    /// Consecutive auto-approved requests before the loop pauses
    pub max_requests: u32,
    pub actions: AutoApprovalActions,
}

impl Default for AutoApprovalSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            max_requests: 20,
            actions: AutoApprovalActions::default(),
        }
    }
}

/// Safety limits checked before every request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitConfig {
    pub max_consecutive_mistakes: u32,
    pub max_recovery_failures: u32,
    /// Task-wide token budget (input + output); unlimited when unset
    pub max_task_tokens: Option<u64>,
}

impl Default for LimitConfig {
    fn default() -> Self {
        Self {
            max_consecutive_mistakes: 3,
            max_recovery_failures: 3,
            max_task_tokens: None,
        }
    }
}

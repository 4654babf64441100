//! Model metadata and context-window budgeting

use serde::{Deserialize, Serialize};

use crate::types::CostInfo;

/// Context window assumed when a provider does not report one
pub const DEFAULT_CONTEXT_WINDOW: u32 = 128_000;

/// Model metadata as reported by a provider client.
///
/// The agent core never branches on provider identity; everything it needs to
/// know about a provider's behavior is expressed by these capability flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelInfo {
    /// Model identifier (e.g., "claude-sonnet-4-5")
    pub id: String,
    /// Context window size in tokens
    pub context_window: u32,
    /// Maximum output tokens
    pub max_output_tokens: u32,
    /// Whether the model emits structured function calls
    pub supports_native_function_calling: bool,
    /// Context overflows must be resolved by truncating history before a retry
    pub requires_explicit_truncation: bool,
    /// A failed first chunk is worth one automatic retry after a short backoff
    pub retry_first_chunk_failure: bool,
    /// Cost per million tokens
    pub cost: CostInfo,
}

impl Default for ModelInfo {
    fn default() -> Self {
        Self {
            id: String::new(),
            context_window: DEFAULT_CONTEXT_WINDOW,
            max_output_tokens: 8192,
            supports_native_function_calling: false,
            requires_explicit_truncation: false,
            retry_first_chunk_failure: false,
            cost: CostInfo::default(),
        }
    }
}

impl ModelInfo {
    /// Create model info with the given id and context window
    pub fn new(id: impl Into<String>, context_window: u32) -> Self {
        Self {
            id: id.into(),
            context_window,
            ..Default::default()
        }
    }

    pub fn with_native_function_calling(mut self, enabled: bool) -> Self {
        self.supports_native_function_calling = enabled;
        self
    }

    pub fn with_explicit_truncation(mut self, enabled: bool) -> Self {
        self.requires_explicit_truncation = enabled;
        self
    }

    pub fn with_first_chunk_retry(mut self, enabled: bool) -> Self {
        self.retry_first_chunk_failure = enabled;
        self
    }

    /// Context window, falling back to the default when unreported
    pub fn effective_context_window(&self) -> u32 {
        if self.context_window == 0 {
            DEFAULT_CONTEXT_WINDOW
        } else {
            self.context_window
        }
    }

    /// Token count at which history must be truncated before the next request.
    ///
    /// Small windows reserve a fixed margin; large windows reserve 20%.
    pub fn max_allowed_tokens(&self) -> u32 {
        let window = self.effective_context_window();
        match window {
            64_000 => window - 27_000,
            128_000 => window - 30_000,
            200_000 => window - 40_000,
            _ => {
                let fixed = window.saturating_sub(40_000);
                let fraction = (window as f64 * 0.8) as u32;
                fixed.max(fraction)
            }
        }
    }
}

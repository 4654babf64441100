//! Human-in-the-loop approval contract

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// What the human is being asked about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AskKind {
    /// Approve a tool invocation (tag-parsing mode)
    Tool,
    /// Too many consecutive mistakes
    MistakeLimitReached,
    /// Too many consecutive auto-approved requests
    AutoApprovalMaxReached,
    /// The task-wide token budget is spent
    TaskTokenLimitReached,
    /// The autonomous step budget is spent
    AutonomyStepLimitReached,
    /// A provider request failed; retry?
    ApiRequestFailed,
}

/// Informational messages shown to the human
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SayKind {
    Info,
    Error,
    ApiRequestRetried,
}

/// The human's decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AskDecision {
    Yes,
    No,
    /// Free-form reply; counts as "continue" where the loop accepts guidance
    MessageResponse,
}

/// Answer from the approval channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AskResponse {
    pub response: AskDecision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Base64 data URLs or raw base64 images attached by the human
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
}

impl AskResponse {
    pub fn yes() -> Self {
        Self {
            response: AskDecision::Yes,
            text: None,
            images: vec![],
        }
    }

    pub fn no() -> Self {
        Self {
            response: AskDecision::No,
            text: None,
            images: vec![],
        }
    }

    pub fn message(text: impl Into<String>) -> Self {
        Self {
            response: AskDecision::MessageResponse,
            text: Some(text.into()),
            images: vec![],
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn is_yes(&self) -> bool {
        self.response == AskDecision::Yes
    }

    /// `Yes` or a message reply
    pub fn is_affirmative(&self) -> bool {
        matches!(
            self.response,
            AskDecision::Yes | AskDecision::MessageResponse
        )
    }

    /// Non-empty text attached to the answer
    pub fn feedback(&self) -> Option<&str> {
        self.text.as_deref().filter(|t| !t.trim().is_empty())
    }
}

/// The collaborator that relays questions to a human
#[async_trait]
pub trait ApprovalChannel: Send + Sync {
    /// Ask and wait for an answer
    async fn ask(&self, kind: AskKind, payload: &str) -> Result<AskResponse>;

    /// Show a message without waiting
    async fn say(&self, kind: SayKind, text: &str);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_affirmative_answers() {
        assert!(AskResponse::yes().is_affirmative());
        assert!(AskResponse::message("try again").is_affirmative());
        assert!(!AskResponse::no().is_affirmative());
        assert!(!AskResponse::message("try again").is_yes());
    }

    #[test]
    fn test_feedback_ignores_blank_text() {
        assert_eq!(AskResponse::no().with_text("  ").feedback(), None);
        assert_eq!(AskResponse::no().with_text("nope").feedback(), Some("nope"));
    }

    #[test]
    fn test_response_wire_format() {
        let r: AskResponse =
            serde_json::from_str(r#"{"response":"message_response","text":"go on"}"#).unwrap();
        assert_eq!(r.response, AskDecision::MessageResponse);
        assert!(r.images.is_empty());
    }
}

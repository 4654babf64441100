//! Error types for kestrel-agent

use thiserror::Error;

/// Result type alias using kestrel-agent Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while running a task
#[derive(Error, Debug)]
pub enum Error {
    /// An error from the provider layer
    #[error(transparent)]
    Ai(#[from] kestrel_ai::Error),

    /// The user cancelled the running task
    #[error("User cancelled")]
    Cancelled,

    /// The user rejected a tool invocation
    #[error("User rejected tool")]
    ToolRejected,

    /// The task was aborted and cannot continue
    #[error("Task aborted: {0}")]
    Aborted(String),

    /// Full-autonomy recovery hit its ceiling
    #[error("Agent failed to recover after {attempts} attempts. Task aborted.")]
    RecoveryExhausted { attempts: u32 },

    /// The context window stays exceeded and too little history is left to truncate
    #[error("Context window exceeded and the conversation is too short to truncate further")]
    ContextExhausted,

    /// The persistence collaborator failed
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// The approval channel failed to deliver an answer
    #[error("Approval channel error: {0}")]
    Approval(String),

    /// The recovery analysis service failed
    #[error("Recovery service error: {0}")]
    Recovery(String),

    /// Configuration could not be loaded
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A generic agent error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Check if this error indicates a context overflow
    pub fn is_context_overflow(&self) -> bool {
        match self {
            Error::Ai(e) => e.is_context_overflow(),
            Error::ContextExhausted => true,
            _ => false,
        }
    }

    /// Interruptions initiated by the user end the loop without recovery
    pub fn is_user_interruption(&self) -> bool {
        matches!(self, Error::Cancelled | Error::ToolRejected)
    }
}

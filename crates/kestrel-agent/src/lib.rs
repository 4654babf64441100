//! kestrel-agent: the autonomous task loop
//!
//! This crate drives a coding task against a model provider: it keeps the
//! conversation within the context window, consumes streamed responses,
//! runs tool calls in either native or tag protocol, and decides after each
//! turn whether to keep going, ask the human, or attempt recovery.

pub mod approval;
pub mod autonomy;
pub mod config;
pub mod context;
pub mod conversation;
pub mod error;
pub mod events;
pub mod handle;
pub mod parser;
pub mod persistence;
pub mod protocol;
pub mod recovery;
pub mod stream;
pub mod task;
pub mod tool;

#[cfg(test)]
mod testing;

pub use approval::{ApprovalChannel, AskDecision, AskKind, AskResponse, SayKind};
pub use autonomy::{AutonomyMode, AutonomyState};
pub use config::{AgentConfig, AutoApprovalSettings, AutonomyConfig, LimitConfig};
pub use context::{ContextConfig, ContextManager, TruncationRange};
pub use conversation::{Conversation, RequestRecord};
pub use error::{Error, Result};
pub use events::AgentEvent;
pub use handle::TaskHandle;
pub use persistence::{InMemoryStore, PersistenceStore, TaskSnapshot};
pub use recovery::{RecoveryAnalysisService, RecoveryRequest, RecoveryResult};
pub use stream::RetryConfig;
pub use task::{LoopOutcome, LoopState, Task, TaskParts};
pub use tool::{BoxedTool, Tool, ToolError, ToolExecutor, ToolRegistry, ToolResponse};

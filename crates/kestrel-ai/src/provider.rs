//! Provider client contract

use async_trait::async_trait;

use crate::{ChunkStream, Message, ModelInfo, Result, ToolChoice, ToolDefinition};

/// A model provider. One implementation per provider; request shaping and
/// authentication stay behind this trait.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Start a streamed completion for the given history
    async fn create_message(
        &self,
        system_prompt: &str,
        history: &[Message],
        tools: Option<&[ToolDefinition]>,
        tool_choice: Option<&ToolChoice>,
    ) -> Result<ChunkStream>;

    /// Metadata and capability flags of the active model
    fn model(&self) -> ModelInfo;
}

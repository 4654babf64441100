//! Tool execution collaborator and the built-in registry

use async_trait::async_trait;
use kestrel_ai::{ContentBlock, ToolDefinition};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Output of a tool: plain text or a list of text/image blocks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolResponse {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl ToolResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    /// Convert into result content. Empty output becomes "(No output)" and
    /// non text/image blocks are dropped.
    pub fn into_content(self) -> Vec<ContentBlock> {
        let blocks: Vec<ContentBlock> = match self {
            ToolResponse::Text(text) => vec![ContentBlock::Text { text }],
            ToolResponse::Blocks(blocks) => blocks
                .into_iter()
                .filter(|b| matches!(b, ContentBlock::Text { .. } | ContentBlock::Image { .. }))
                .collect(),
        };
        let empty = blocks.iter().all(|b| match b {
            ContentBlock::Text { text } => text.is_empty(),
            _ => false,
        });
        if empty {
            vec![ContentBlock::text("(No output)")]
        } else {
            blocks
        }
    }
}

/// Failures raised by a tool executor. They never leave the tool protocol:
/// every one becomes an error tool result.
#[derive(Error, Debug)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("{0}")]
    Failed(String),
}

/// Result of one tool invocation, paired with its invocation id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_use_id: String,
    /// Content to return to the model
    pub content: Vec<ContentBlock>,
    /// Whether the execution resulted in an error
    pub is_error: bool,
}

impl ToolResult {
    /// Create a successful result
    pub fn success(tool_use_id: impl Into<String>, content: Vec<ContentBlock>) -> Self {
        Self {
            tool_use_id: tool_use_id.into(),
            content,
            is_error: false,
        }
    }

    /// Create an error result
    pub fn error(tool_use_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            tool_use_id: tool_use_id.into(),
            content: vec![ContentBlock::text(message)],
            is_error: true,
        }
    }

    /// Result for a call that was never executed
    pub fn skipped(
        tool_use_id: impl Into<String>,
        tool_name: &str,
        feedback: Option<&str>,
    ) -> Self {
        let reason = feedback
            .filter(|f| !f.trim().is_empty())
            .unwrap_or("Not approved");
        Self::error(
            tool_use_id,
            format!("[Tool Skipped: {} - {}]", tool_name, reason),
        )
    }

    /// Get the text content as a single string
    pub fn text_content(&self) -> String {
        self.content
            .iter()
            .filter_map(|c| c.as_text())
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn into_block(self) -> ContentBlock {
        ContentBlock::ToolResult {
            tool_use_id: self.tool_use_id,
            content: self.content,
            is_error: self.is_error,
        }
    }
}

/// The collaborator that runs tools by name
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Execute a tool with the given arguments
    async fn execute_by_name(
        &self,
        name: &str,
        args: serde_json::Value,
        cancel: CancellationToken,
    ) -> Result<ToolResponse, ToolError>;

    /// Tools advertised to the model
    fn tool_definitions(&self) -> Vec<ToolDefinition>;

    /// Resolves once external tool providers are connected
    async fn wait_until_ready(&self) {}
}

/// Trait for a single executable tool
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name (used in API calls and tags)
    fn name(&self) -> &str;

    /// Tool description for the model
    fn description(&self) -> &str;

    /// JSON Schema for parameters
    fn parameters_schema(&self) -> serde_json::Value;

    /// Execute the tool with the given arguments
    async fn execute(
        &self,
        arguments: serde_json::Value,
        cancel: CancellationToken,
    ) -> Result<ToolResponse, ToolError>;
}

/// Type alias for a boxed tool
pub type BoxedTool = Arc<dyn Tool>;

/// A `ToolExecutor` over a set of in-process tools, validating arguments
/// against each tool's schema before dispatch.
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<BoxedTool>,
    /// Cached compiled JSON schema validators keyed by tool name
    schema_cache: HashMap<String, Arc<jsonschema::Validator>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tool
    pub fn add(&mut self, tool: BoxedTool) {
        self.cache_tool_schema(&tool);
        self.tools.retain(|t| t.name() != tool.name());
        self.tools.push(tool);
    }

    /// Builder-style add
    pub fn with(mut self, tool: BoxedTool) -> Self {
        self.add(tool);
        self
    }

    pub fn tool_names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    fn cache_tool_schema(&mut self, tool: &BoxedTool) {
        let schema = tool.parameters_schema();
        match jsonschema::validator_for(&schema) {
            Ok(validator) => {
                self.schema_cache
                    .insert(tool.name().to_string(), Arc::new(validator));
            }
            Err(e) => {
                tracing::warn!(
                    "Invalid parameter schema for tool '{}', skipping validation: {}",
                    tool.name(),
                    e
                );
            }
        }
    }
}

#[async_trait]
impl ToolExecutor for ToolRegistry {
    async fn execute_by_name(
        &self,
        name: &str,
        args: serde_json::Value,
        cancel: CancellationToken,
    ) -> Result<ToolResponse, ToolError> {
        let tool = self
            .tools
            .iter()
            .find(|t| t.name() == name)
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;

        if let Some(err) = self
            .schema_cache
            .get(name)
            .and_then(|validator| validate_with_validator(&args, validator))
        {
            return Err(ToolError::InvalidArguments(err));
        }

        if cancel.is_cancelled() {
            return Err(ToolError::Cancelled);
        }
        tool.execute(args, cancel).await
    }

    fn tool_definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .iter()
            .map(|t| ToolDefinition::new(t.name(), t.description(), t.parameters_schema()))
            .collect()
    }
}

/// Validate tool arguments using a pre-compiled validator.
/// Returns `Some(error_message)` if validation fails, `None` if valid.
fn validate_with_validator(
    args: &serde_json::Value,
    validator: &jsonschema::Validator,
) -> Option<String> {
    let errors: Vec<String> = validator
        .iter_errors(args)
        .map(|e| {
            let path = e.instance_path.to_string();
            if path.is_empty() {
                e.to_string()
            } else {
                format!("{}: {}", path, e)
            }
        })
        .collect();

    if errors.is_empty() {
        None
    } else {
        Some(errors.join("; "))
    }
}

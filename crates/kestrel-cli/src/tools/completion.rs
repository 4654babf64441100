//! Task completion tool

use async_trait::async_trait;
use kestrel_agent::{Tool, ToolError, ToolResponse};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use super::required_str;

/// Signals that the task is done. The loop ends when this runs without error.
pub struct CompletionTool {
    name: String,
}

impl CompletionTool {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl Tool for CompletionTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Present the result of the task once it is complete."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "result": {
                    "type": "string",
                    "description": "Final summary of what was done"
                }
            },
            "required": ["result"]
        })
    }

    async fn execute(
        &self,
        arguments: serde_json::Value,
        _cancel: CancellationToken,
    ) -> Result<ToolResponse, ToolError> {
        let result = required_str(&arguments, "result")?;
        Ok(ToolResponse::text(result))
    }
}

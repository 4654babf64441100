//! File writing tool

use async_trait::async_trait;
use kestrel_agent::{Tool, ToolError, ToolResponse};
use serde_json::json;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio_util::sync::CancellationToken;

use super::{required_str, resolve};

pub struct WriteFileTool {
    root: PathBuf,
}

impl WriteFileTool {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_to_file"
    }

    fn description(&self) -> &str {
        "Write content to a file, replacing it if it exists. Parent directories are created."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path of the file, relative to the working directory"
                },
                "content": {
                    "type": "string",
                    "description": "Complete new content of the file"
                }
            },
            "required": ["path", "content"]
        })
    }

    async fn execute(
        &self,
        arguments: serde_json::Value,
        cancel: CancellationToken,
    ) -> Result<ToolResponse, ToolError> {
        let path_str = required_str(&arguments, "path")?;
        let content = required_str(&arguments, "content")?;
        let path = resolve(&self.root, path_str)?;

        if cancel.is_cancelled() {
            return Err(ToolError::Cancelled);
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| ToolError::Failed(format!("Failed to create directory: {}", e)))?;
        }
        fs::write(&path, content)
            .await
            .map_err(|e| ToolError::Failed(format!("Failed to write {}: {}", path_str, e)))?;

        tracing::debug!("Wrote {} bytes to {}", content.len(), path.display());
        Ok(ToolResponse::text(format!(
            "Successfully wrote {} bytes to {}",
            content.len(),
            path_str
        )))
    }
}

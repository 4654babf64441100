//! File reading tool

use async_trait::async_trait;
use kestrel_agent::{Tool, ToolError, ToolResponse};
use serde_json::json;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio_util::sync::CancellationToken;

use super::{required_str, resolve};

const MAX_LINES: usize = 2000;
const MAX_LINE_LENGTH: usize = 2000;

pub struct ReadFileTool {
    root: PathBuf,
}

impl ReadFileTool {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read the contents of a file in the working directory. For large files, use offset and limit."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path of the file, relative to the working directory"
                },
                "offset": {
                    "type": "integer",
                    "description": "Line number to start reading from (1-indexed)"
                },
                "limit": {
                    "type": "integer",
                    "description": "Maximum number of lines to read"
                }
            },
            "required": ["path"]
        })
    }

    async fn execute(
        &self,
        arguments: serde_json::Value,
        cancel: CancellationToken,
    ) -> Result<ToolResponse, ToolError> {
        let path_str = required_str(&arguments, "path")?;
        let path = resolve(&self.root, path_str)?;

        if cancel.is_cancelled() {
            return Err(ToolError::Cancelled);
        }

        let content = fs::read_to_string(&path)
            .await
            .map_err(|e| ToolError::Failed(format!("Failed to read {}: {}", path_str, e)))?;

        let lines: Vec<&str> = content.lines().collect();
        let total_lines = lines.len();
        if total_lines == 0 {
            return Ok(ToolResponse::text("(empty file)"));
        }

        let offset = arguments
            .get("offset")
            .and_then(|v| v.as_u64())
            .map(|o| (o as usize).saturating_sub(1))
            .unwrap_or(0);
        let limit = arguments
            .get("limit")
            .and_then(|v| v.as_u64())
            .map(|l| l as usize)
            .unwrap_or(MAX_LINES);

        if offset >= total_lines {
            return Err(ToolError::InvalidArguments(format!(
                "Offset {} is beyond end of file ({} lines total)",
                offset + 1,
                total_lines
            )));
        }

        let end = (offset + limit).min(total_lines);
        let mut had_truncated = false;
        let selected: Vec<String> = lines[offset..end]
            .iter()
            .map(|line| match line.char_indices().nth(MAX_LINE_LENGTH) {
                Some((cut, _)) => {
                    had_truncated = true;
                    line[..cut].to_string()
                }
                None => line.to_string(),
            })
            .collect();
        let mut output = selected.join("\n");

        let mut notices = Vec::new();
        if had_truncated {
            notices.push(format!("Some lines were truncated to {} characters", MAX_LINE_LENGTH));
        }
        if end < total_lines {
            notices.push(format!(
                "{} more lines not shown. Use offset={} to continue reading",
                total_lines - end,
                end + 1
            ));
        }
        if !notices.is_empty() {
            output.push_str(&format!("\n\n... ({})", notices.join(". ")));
        }

        Ok(ToolResponse::text(output))
    }
}

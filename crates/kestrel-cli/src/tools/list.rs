//! Directory listing tool

use async_trait::async_trait;
use kestrel_agent::{Tool, ToolError, ToolResponse};
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

use super::resolve;

const DEFAULT_LIMIT: usize = 200;
const SKIPPED_DIRS: &[&str] = &["node_modules", "target", ".git"];

pub struct ListFilesTool {
    root: PathBuf,
}

impl ListFilesTool {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }
}

#[async_trait]
impl Tool for ListFilesTool {
    fn name(&self) -> &str {
        "list_files"
    }

    fn description(&self) -> &str {
        "List files and directories. Directories end with '/'."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Directory to list, relative to the working directory"
                },
                "recursive": {
                    "type": "boolean",
                    "description": "Whether to list recursively (default: false)"
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
        let path_str = arguments.get("path").and_then(|v| v.as_str()).unwrap_or(".");
        let path = resolve(&self.root, path_str)?;
        let recursive = arguments
            .get("recursive")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        if !path.is_dir() {
            return Err(ToolError::Failed(format!("Not a directory: {}", path_str)));
        }

        let mut entries = Vec::new();
        collect(&path, &path, recursive, &cancel, &mut entries)
            .map_err(|e| ToolError::Failed(format!("Error reading {}: {}", path_str, e)))?;
        if cancel.is_cancelled() {
            return Err(ToolError::Cancelled);
        }

        if entries.is_empty() {
            return Ok(ToolResponse::text("(empty directory)"));
        }
        let truncated = entries.len() >= DEFAULT_LIMIT;
        let mut output = entries.join("\n");
        if truncated {
            output.push_str(&format!("\n\n(showing first {} entries)", DEFAULT_LIMIT));
        }
        Ok(ToolResponse::text(output))
    }
}

fn collect(
    base: &Path,
    dir: &Path,
    recursive: bool,
    cancel: &CancellationToken,
    entries: &mut Vec<String>,
) -> std::io::Result<()> {
    let mut items: Vec<_> = fs::read_dir(dir)?.flatten().collect();
    items.sort_by_key(|e| e.path());

    for entry in items {
        if cancel.is_cancelled() || entries.len() >= DEFAULT_LIMIT {
            break;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') {
            continue;
        }

        let full_path = entry.path();
        let relative = full_path.strip_prefix(base).unwrap_or(&full_path);
        if full_path.is_dir() {
            entries.push(format!("{}/", relative.display()));
            if recursive && !SKIPPED_DIRS.contains(&name.as_str()) {
                collect(base, &full_path, recursive, cancel, entries)?;
            }
        } else {
            entries.push(relative.display().to_string());
        }
    }
    Ok(())
}

//! Built-in tools for the harness

mod completion;
mod list;
mod read;
mod write;

pub use completion::CompletionTool;
pub use list::ListFilesTool;
pub use read::ReadFileTool;
pub use write::WriteFileTool;

use kestrel_agent::{ToolError, ToolRegistry};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

/// Registry with every built-in tool, rooted at `root`
pub fn registry(root: &Path, completion_tool: &str) -> ToolRegistry {
    ToolRegistry::new()
        .with(Arc::new(ReadFileTool::new(root)))
        .with(Arc::new(ListFilesTool::new(root)))
        .with(Arc::new(WriteFileTool::new(root)))
        .with(Arc::new(CompletionTool::new(completion_tool)))
}

/// Resolve a model-supplied path against the working root. Paths that climb
/// out of the root are refused.
pub(crate) fn resolve(root: &Path, path: &str) -> Result<PathBuf, ToolError> {
    let relative = Path::new(path);
    if relative.is_absolute() {
        return if relative.starts_with(root) {
            Ok(relative.to_path_buf())
        } else {
            Err(ToolError::InvalidArguments(format!(
                "path is outside the working directory: {}",
                path
            )))
        };
    }

    let mut depth = 0usize;
    for component in relative.components() {
        match component {
            Component::ParentDir if depth == 0 => {
                return Err(ToolError::InvalidArguments(format!(
                    "path is outside the working directory: {}",
                    path
                )));
            }
            Component::ParentDir => depth -= 1,
            Component::Normal(_) => depth += 1,
            _ => {}
        }
    }
    Ok(root.join(relative))
}

pub(crate) fn required_str<'a>(args: &'a serde_json::Value, key: &str) -> Result<&'a str, ToolError> {
    args.get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| ToolError::InvalidArguments(format!("Missing '{}' argument", key)))
}

#[cfg(test)]
pub(crate) fn temp_root() -> PathBuf {
    let dir = std::env::temp_dir().join(format!("kestrel-tools-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

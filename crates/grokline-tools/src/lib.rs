//! Built-in tools for GrokLine -- filesystem, shell and memory.
//!
//! Each tool implements [`grokline_agent::Tool`] and is registered through
//! [`builtin_registry`].  Filesystem tools are confined to a [`Workspace`].

pub mod error;
pub mod filesystem;
pub mod memory;
pub mod shell;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use grokline_agent::ToolRegistry;

pub use error::{Result, ToolError};
pub use filesystem::{ListDirectoryTool, ReadFileTool, ReplaceTool, Workspace, WriteFileTool};
pub use memory::{MEMORY_FILE_NAME, SaveMemoryTool, load_memories};
pub use shell::ShellTool;

/// Default location of the memory file, `~/.grokline/GROKLINE.md`.
pub fn default_memory_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".grokline").join(MEMORY_FILE_NAME))
}

/// Registry holding every built-in tool.
///
/// The shell tool is returned separately so the caller can extend its
/// allow-list after the registry is shared.
pub fn builtin_registry(workspace_root: &Path, memory_path: &Path) -> (ToolRegistry, Arc<ShellTool>) {
    let workspace = Arc::new(Workspace::new(workspace_root));
    let shell = Arc::new(ShellTool::new(workspace.clone()));

    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(ListDirectoryTool::new(workspace.clone())));
    registry.register(Arc::new(ReadFileTool::new(workspace.clone())));
    registry.register(Arc::new(WriteFileTool::new(workspace.clone())));
    registry.register(Arc::new(ReplaceTool::new(workspace)));
    registry.register(shell.clone());
    registry.register(Arc::new(SaveMemoryTool::new(memory_path)));

    tracing::debug!(tools = ?registry.names(), "built-in tools registered");
    (registry, shell)
}

//! Long-term memory -- facts the model asks to remember across sessions.
//!
//! Facts are appended as bullet points under a dedicated section of a
//! markdown file.  The session refreshes its memory after every successful
//! `save_memory` call, see [`grokline_agent::scheduler::MEMORY_TOOL_NAME`].

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use grokline_agent::scheduler::MEMORY_TOOL_NAME;
use grokline_agent::{Tool, ToolResult};
use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{Result, ToolError};
use crate::filesystem::{ensure_not_cancelled, require_str};

/// Default file name of the memory file.
pub const MEMORY_FILE_NAME: &str = "GROKLINE.md";

/// Heading of the section facts are appended to.
pub const MEMORY_SECTION_HEADER: &str = "## GrokLine Added Memories";

/// Persists facts to the memory file.
pub struct SaveMemoryTool {
    path: PathBuf,
}

impl SaveMemoryTool {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn save(&self, args: &Map<String, Value>) -> Result<ToolResult> {
        let fact = require_str(args, "fact", MEMORY_TOOL_NAME)?.trim();
        if fact.is_empty() {
            return Err(ToolError::InvalidParams {
                tool_name: MEMORY_TOOL_NAME.into(),
                reason: "`fact` must be a non-empty string".into(),
            });
        }

        let current = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };
        let updated = append_fact(&current, fact);

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, updated).await?;
        info!(path = %self.path.display(), "memory saved");

        Ok(ToolResult {
            llm_content: json!({
                "success": true,
                "message": format!("Okay, I've remembered that: \"{fact}\""),
            })
            .to_string(),
            return_display: format!("Okay, I've remembered that: \"{fact}\""),
        })
    }
}

/// Insert `fact` as a bullet at the end of the memory section, creating the
/// section when it is missing.
fn append_fact(content: &str, fact: &str) -> String {
    // Leading dashes would nest the bullet.
    let fact = fact.trim_start_matches('-').trim();
    let entry = format!("- {fact}");

    let Some(header_at) = content.find(MEMORY_SECTION_HEADER) else {
        let mut out = content.trim_end().to_owned();
        if !out.is_empty() {
            out.push_str("\n\n");
        }
        out.push_str(MEMORY_SECTION_HEADER);
        out.push('\n');
        out.push_str(&entry);
        out.push('\n');
        return out;
    };

    let section_start = header_at + MEMORY_SECTION_HEADER.len();
    let section_end = content[section_start..]
        .find("\n## ")
        .map_or(content.len(), |i| section_start + i);

    let before = &content[..section_start];
    let section = content[section_start..section_end].trim_end();
    let after = &content[section_end..];

    let mut out = String::with_capacity(content.len() + entry.len() + 2);
    out.push_str(before);
    out.push_str(section);
    out.push('\n');
    out.push_str(&entry);
    out.push('\n');
    if !after.is_empty() {
        out.push_str(after);
    }
    out
}

/// Facts recorded in the memory file, in file order.
pub async fn load_memories(path: &Path) -> Vec<String> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "no memory file");
            return Vec::new();
        }
    };
    let Some(header_at) = content.find(MEMORY_SECTION_HEADER) else {
        return Vec::new();
    };
    content[header_at + MEMORY_SECTION_HEADER.len()..]
        .lines()
        .take_while(|line| !line.starts_with("## "))
        .filter_map(|line| line.trim().strip_prefix("- "))
        .map(str::to_owned)
        .collect()
}

#[async_trait]
impl Tool for SaveMemoryTool {
    fn name(&self) -> &str {
        MEMORY_TOOL_NAME
    }

    fn description(&self) -> &str {
        "Saves a specific, concise fact about the user or their preferences to long-term memory. \
         Use it only when the user explicitly asks you to remember something."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "fact": { "type": "string", "description": "The fact to remember, as one clear sentence" }
            },
            "required": ["fact"]
        })
    }

    async fn execute(
        &self,
        args: &Map<String, Value>,
        cancel: &CancellationToken,
    ) -> grokline_agent::Result<ToolResult> {
        ensure_not_cancelled(cancel, MEMORY_TOOL_NAME)?;
        Ok(self.save(args).await?)
    }
}

//! Filesystem tools -- list, read, write and edit files inside a workspace.
//!
//! All paths are resolved relative to the workspace root and validated
//! against path traversal (e.g. `../../etc/passwd`).  Tools that change files
//! ask for approval with a unified diff of the proposed change.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use grokline_agent::{ConfirmationDetails, Tool, ToolResult};
use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Result, ToolError};

/// Maximum characters returned per file read to limit token usage.
/// Approximately 4 000 tokens at typical tokenization rates.
const MAX_FILE_READ_CHARS: usize = 16_000;

// ---------------------------------------------------------------------------
// Workspace
// ---------------------------------------------------------------------------

/// The directory tree the filesystem tools may touch.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    /// Create a workspace rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let root = root.canonicalize().unwrap_or(root);
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a model-supplied path against the root and reject anything
    /// that escapes it.
    pub(crate) fn resolve(&self, raw_path: &str, tool_name: &str) -> Result<PathBuf> {
        let candidate = if Path::new(raw_path).is_absolute() {
            PathBuf::from(raw_path)
        } else {
            self.root.join(raw_path)
        };

        // The target may not exist yet, so canonicalize() is not an option.
        let normalized = normalize_path(&candidate);

        if !normalized.starts_with(&self.root) {
            return Err(ToolError::InvalidParams {
                tool_name: tool_name.to_string(),
                reason: format!(
                    "path `{raw_path}` resolves to `{}` which is outside the workspace `{}`",
                    normalized.display(),
                    self.root.display(),
                ),
            });
        }

        Ok(normalized)
    }

    /// Path relative to the root, for titles and messages.
    fn display(&self, path: &Path) -> String {
        match path.strip_prefix(&self.root) {
            Ok(relative) if relative.as_os_str().is_empty() => ".".to_owned(),
            Ok(relative) => relative.display().to_string(),
            Err(_) => path.display().to_string(),
        }
    }
}

/// Normalize a path by resolving `.` and `..` components without touching the
/// filesystem.
fn normalize_path(path: &Path) -> PathBuf {
    let mut components = Vec::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                if matches!(components.last(), Some(Component::Normal(_))) {
                    components.pop();
                } else {
                    components.push(component);
                }
            }
            Component::CurDir => {}
            _ => components.push(component),
        }
    }
    components.iter().collect()
}

/// Extract a required string field from the call arguments.
pub(crate) fn require_str<'a>(
    args: &'a Map<String, Value>,
    field: &str,
    tool_name: &str,
) -> Result<&'a str> {
    args.get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| ToolError::InvalidParams {
            tool_name: tool_name.to_string(),
            reason: format!("missing required string field `{field}`"),
        })
}

pub(crate) fn ensure_not_cancelled(cancel: &CancellationToken, tool_name: &str) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(ToolError::Cancelled {
            tool_name: tool_name.to_string(),
        });
    }
    Ok(())
}

/// Unified diff of `old` against `new`.
fn unified_diff(file_name: &str, old: &str, new: &str) -> String {
    similar::TextDiff::from_lines(old, new)
        .unified_diff()
        .context_radius(3)
        .header(&format!("{file_name}\tCurrent"), &format!("{file_name}\tProposed"))
        .to_string()
}

async fn read_if_exists(path: &Path) -> Result<Option<String>> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

// ---------------------------------------------------------------------------
// list_directory
// ---------------------------------------------------------------------------

/// Lists the entries of a directory, directories first.
pub struct ListDirectoryTool {
    workspace: Arc<Workspace>,
}

impl ListDirectoryTool {
    pub const NAME: &'static str = "list_directory";

    pub fn new(workspace: Arc<Workspace>) -> Self {
        Self { workspace }
    }

    async fn list(&self, args: &Map<String, Value>) -> Result<ToolResult> {
        let raw = args.get("path").and_then(Value::as_str).unwrap_or(".");
        let path = self.workspace.resolve(raw, Self::NAME)?;
        debug!(path = %path.display(), "listing directory");

        let mut entries: Vec<(bool, String)> = Vec::new();
        let mut read_dir = tokio::fs::read_dir(&path).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            let is_dir = entry.file_type().await?.is_dir();
            entries.push((is_dir, entry.file_name().to_string_lossy().into_owned()));
        }
        entries.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));

        let shown = self.workspace.display(&path);
        if entries.is_empty() {
            return Ok(ToolResult::text(format!("Directory {shown} is empty.")));
        }

        let listing: Vec<String> = entries
            .iter()
            .map(|(is_dir, name)| if *is_dir { format!("[DIR] {name}") } else { name.clone() })
            .collect();
        Ok(ToolResult {
            llm_content: format!("Directory listing for {shown}:\n{}", listing.join("\n")),
            return_display: format!("Listed {} item(s).", entries.len()),
        })
    }
}

#[async_trait]
impl Tool for ListDirectoryTool {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn description(&self) -> &str {
        "Lists the names of files and subdirectories directly within a directory."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Directory path (default: workspace root)" }
            }
        })
    }

    async fn execute(
        &self,
        args: &Map<String, Value>,
        cancel: &CancellationToken,
    ) -> grokline_agent::Result<ToolResult> {
        ensure_not_cancelled(cancel, Self::NAME)?;
        Ok(self.list(args).await?)
    }
}

// ---------------------------------------------------------------------------
// read_file
// ---------------------------------------------------------------------------

/// Reads a text file, optionally a window of its lines.
pub struct ReadFileTool {
    workspace: Arc<Workspace>,
}

impl ReadFileTool {
    pub const NAME: &'static str = "read_file";

    pub fn new(workspace: Arc<Workspace>) -> Self {
        Self { workspace }
    }

    async fn read(&self, args: &Map<String, Value>) -> Result<ToolResult> {
        let raw = require_str(args, "absolute_path", Self::NAME)?;
        let path = self.workspace.resolve(raw, Self::NAME)?;
        debug!(path = %path.display(), "reading file");

        let content = tokio::fs::read_to_string(&path).await?;
        let offset = args.get("offset").and_then(Value::as_u64).map(|n| n as usize);
        let limit = args.get("limit").and_then(Value::as_u64).map(|n| n as usize);

        let mut body = match (offset, limit) {
            (None, None) => content,
            (offset, limit) => {
                let lines: Vec<&str> = content.lines().collect();
                let total = lines.len();
                let start = offset.unwrap_or(0).min(total);
                let end = limit.map_or(total, |l| start.saturating_add(l).min(total));
                format!(
                    "[File content truncated: showing lines {}-{} of {total} total lines.]\n{}",
                    start + 1,
                    end,
                    lines[start..end].join("\n")
                )
            }
        };

        // Truncate at a char boundary, then say so.
        let total_chars = body.len();
        if total_chars > MAX_FILE_READ_CHARS {
            let mut end = MAX_FILE_READ_CHARS;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            body.truncate(end);
            body.push_str(&format!(
                "\n\n[... file truncated at {end} chars ({total_chars} total). \
                 Use offset and limit to read more.]"
            ));
        }

        Ok(ToolResult {
            llm_content: body,
            return_display: format!("Read {}", self.workspace.display(&path)),
        })
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn description(&self) -> &str {
        "Reads and returns the content of a text file. Use offset and limit to page through large files."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "absolute_path": { "type": "string", "description": "Path to the file to read" },
                "offset": { "type": "integer", "description": "0-based line to start reading from" },
                "limit": { "type": "integer", "description": "Maximum number of lines to read" }
            },
            "required": ["absolute_path"]
        })
    }

    async fn execute(
        &self,
        args: &Map<String, Value>,
        cancel: &CancellationToken,
    ) -> grokline_agent::Result<ToolResult> {
        ensure_not_cancelled(cancel, Self::NAME)?;
        Ok(self.read(args).await?)
    }
}

// ---------------------------------------------------------------------------
// write_file
// ---------------------------------------------------------------------------

/// Writes a whole file, creating parent directories as needed.
pub struct WriteFileTool {
    workspace: Arc<Workspace>,
}

impl WriteFileTool {
    pub const NAME: &'static str = "write_file";

    pub fn new(workspace: Arc<Workspace>) -> Self {
        Self { workspace }
    }

    async fn confirmation(&self, args: &Map<String, Value>) -> Result<ConfirmationDetails> {
        let raw = require_str(args, "file_path", Self::NAME)?;
        let content = require_str(args, "content", Self::NAME)?;
        let path = self.workspace.resolve(raw, Self::NAME)?;
        let current = read_if_exists(&path).await?.unwrap_or_default();
        let shown = self.workspace.display(&path);
        Ok(ConfirmationDetails::Edit {
            title: format!("Confirm Write: {shown}"),
            file_path: path.display().to_string(),
            diff: unified_diff(&shown, &current, content),
        })
    }

    async fn write(&self, args: &Map<String, Value>) -> Result<ToolResult> {
        let raw = require_str(args, "file_path", Self::NAME)?;
        let content = require_str(args, "content", Self::NAME)?;
        let path = self.workspace.resolve(raw, Self::NAME)?;
        debug!(path = %path.display(), "writing file");

        let previous = read_if_exists(&path).await?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, content).await?;

        let shown = self.workspace.display(&path);
        let llm_content = match previous {
            Some(_) => format!("Successfully overwrote file: {}.", path.display()),
            None => format!("Successfully created and wrote to new file: {}.", path.display()),
        };
        Ok(ToolResult {
            llm_content,
            return_display: unified_diff(&shown, previous.as_deref().unwrap_or_default(), content),
        })
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn description(&self) -> &str {
        "Writes content to a file, replacing it if it exists and creating it otherwise."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "file_path": { "type": "string", "description": "Path to the file to write" },
                "content": { "type": "string", "description": "Content to write" }
            },
            "required": ["file_path", "content"]
        })
    }

    fn modifies_files(&self) -> bool {
        true
    }

    async fn should_confirm_execute(
        &self,
        args: &Map<String, Value>,
        _cancel: &CancellationToken,
    ) -> grokline_agent::Result<Option<ConfirmationDetails>> {
        Ok(Some(self.confirmation(args).await?))
    }

    async fn execute(
        &self,
        args: &Map<String, Value>,
        cancel: &CancellationToken,
    ) -> grokline_agent::Result<ToolResult> {
        ensure_not_cancelled(cancel, Self::NAME)?;
        Ok(self.write(args).await?)
    }
}

// ---------------------------------------------------------------------------
// replace
// ---------------------------------------------------------------------------

/// Replaces exact text in a file.
pub struct ReplaceTool {
    workspace: Arc<Workspace>,
}

/// A computed edit: the file, its old and new content.
struct PlannedEdit {
    path: PathBuf,
    current: Option<String>,
    updated: String,
}

impl ReplaceTool {
    pub const NAME: &'static str = "replace";

    pub fn new(workspace: Arc<Workspace>) -> Self {
        Self { workspace }
    }

    fn failure(reason: impl Into<String>) -> ToolError {
        ToolError::ExecutionFailed {
            tool_name: Self::NAME.to_string(),
            reason: reason.into(),
        }
    }

    async fn plan(&self, args: &Map<String, Value>) -> Result<PlannedEdit> {
        let raw = require_str(args, "file_path", Self::NAME)?;
        let old_string = require_str(args, "old_string", Self::NAME)?;
        let new_string = require_str(args, "new_string", Self::NAME)?;
        let expected = args
            .get("expected_replacements")
            .and_then(Value::as_u64)
            .unwrap_or(1) as usize;
        let path = self.workspace.resolve(raw, Self::NAME)?;
        let current = read_if_exists(&path).await?;

        let updated = match (&current, old_string.is_empty()) {
            (None, true) => new_string.to_owned(),
            (None, false) => {
                return Err(Self::failure(format!(
                    "file not found: {}. Use an empty old_string to create a new file.",
                    path.display()
                )));
            }
            (Some(_), true) => {
                return Err(Self::failure(format!(
                    "attempted to create a file that already exists: {}",
                    path.display()
                )));
            }
            (Some(content), false) => {
                let occurrences = content.matches(old_string).count();
                if occurrences == 0 {
                    return Err(Self::failure(format!(
                        "could not find the string to replace in {}. Read the file first; \
                         old_string must match exactly, including whitespace.",
                        path.display()
                    )));
                }
                if occurrences != expected {
                    return Err(Self::failure(format!(
                        "expected {expected} occurrence(s) but found {occurrences} in {}",
                        path.display()
                    )));
                }
                content.replace(old_string, new_string)
            }
        };

        Ok(PlannedEdit {
            path,
            current,
            updated,
        })
    }
}

#[async_trait]
impl Tool for ReplaceTool {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn description(&self) -> &str {
        "Replaces text in a file. old_string must match the current content exactly; \
         read the file first. Replaces expected_replacements occurrences (default 1). \
         An empty old_string creates a new file."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "file_path": { "type": "string", "description": "Path to the file to edit" },
                "old_string": { "type": "string", "description": "Exact text to replace" },
                "new_string": { "type": "string", "description": "Replacement text" },
                "expected_replacements": { "type": "integer", "description": "Number of occurrences to replace (default 1)" }
            },
            "required": ["file_path", "old_string", "new_string"]
        })
    }

    fn modifies_files(&self) -> bool {
        true
    }

    async fn should_confirm_execute(
        &self,
        args: &Map<String, Value>,
        _cancel: &CancellationToken,
    ) -> grokline_agent::Result<Option<ConfirmationDetails>> {
        // An edit that cannot be computed is reported by execute().
        let Ok(edit) = self.plan(args).await else {
            return Ok(None);
        };
        let shown = self.workspace.display(&edit.path);
        Ok(Some(ConfirmationDetails::Edit {
            title: format!("Confirm Edit: {shown}"),
            file_path: edit.path.display().to_string(),
            diff: unified_diff(&shown, edit.current.as_deref().unwrap_or_default(), &edit.updated),
        }))
    }

    async fn execute(
        &self,
        args: &Map<String, Value>,
        cancel: &CancellationToken,
    ) -> grokline_agent::Result<ToolResult> {
        ensure_not_cancelled(cancel, Self::NAME)?;
        let edit = self.plan(args).await?;
        debug!(path = %edit.path.display(), "applying edit");

        if let Some(parent) = edit.path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(ToolError::from)?;
        }
        tokio::fs::write(&edit.path, &edit.updated)
            .await
            .map_err(ToolError::from)?;

        let shown = self.workspace.display(&edit.path);
        let llm_content = match edit.current {
            Some(_) => format!("Successfully modified file: {}.", edit.path.display()),
            None => format!("Created new file: {} with provided content.", edit.path.display()),
        };
        Ok(ToolResult {
            llm_content,
            return_display: unified_diff(
                &shown,
                edit.current.as_deref().unwrap_or_default(),
                &edit.updated,
            ),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn args(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    fn workspace() -> (tempfile::TempDir, Arc<Workspace>) {
        let dir = tempfile::tempdir().unwrap();
        let ws = Arc::new(Workspace::new(dir.path()));
        (dir, ws)
    }

    #[test]
    fn path_traversal_is_blocked() {
        let ws = Workspace::new("/tmp/sandbox-does-not-exist");
        let err = ws.resolve("../../etc/passwd", "read_file").unwrap_err();
        assert!(err.to_string().contains("outside the workspace"));
    }

    #[test]
    fn normalize_path_resolves_parent_and_current_components() {
        assert_eq!(
            normalize_path(Path::new("/tmp/sandbox/sub/../other")),
            PathBuf::from("/tmp/sandbox/other")
        );
        assert_eq!(
            normalize_path(Path::new("/tmp/./sandbox/./file.txt")),
            PathBuf::from("/tmp/sandbox/file.txt")
        );
    }

    #[tokio::test]
    async fn list_directory_puts_directories_first() {
        let (dir, ws) = workspace();
        std::fs::write(dir.path().join("b.txt"), "b").unwrap();
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();
        std::fs::create_dir(dir.path().join("src")).unwrap();

        let result = ListDirectoryTool::new(ws)
            .execute(&args(json!({"path": "."})), &CancellationToken::new())
            .await
            .unwrap();

        assert!(result.llm_content.ends_with("[DIR] src\na.txt\nb.txt"), "{}", result.llm_content);
        assert_eq!(result.return_display, "Listed 3 item(s).");
    }

    #[tokio::test]
    async fn read_file_pages_by_lines() {
        let (dir, ws) = workspace();
        std::fs::write(dir.path().join("notes.txt"), "one\ntwo\nthree\nfour").unwrap();
        let tool = ReadFileTool::new(ws);
        let cancel = CancellationToken::new();

        let full = tool
            .execute(&args(json!({"absolute_path": "notes.txt"})), &cancel)
            .await
            .unwrap();
        assert_eq!(full.llm_content, "one\ntwo\nthree\nfour");

        let window = tool
            .execute(&args(json!({"absolute_path": "notes.txt", "offset": 1, "limit": 2})), &cancel)
            .await
            .unwrap();
        assert!(window.llm_content.starts_with("[File content truncated: showing lines 2-3 of 4"));
        assert!(window.llm_content.ends_with("two\nthree"));
    }

    #[tokio::test]
    async fn read_file_requires_path() {
        let (_dir, ws) = workspace();
        let err = ReadFileTool::new(ws)
            .execute(&Map::new(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("absolute_path"));
    }

    #[tokio::test]
    async fn write_file_asks_with_a_diff_and_creates_parents() {
        let (dir, ws) = workspace();
        let tool = WriteFileTool::new(ws);
        let cancel = CancellationToken::new();
        let call = args(json!({"file_path": "src/new.rs", "content": "fn main() {}\n"}));

        let details = tool.should_confirm_execute(&call, &cancel).await.unwrap().unwrap();
        let ConfirmationDetails::Edit { title, diff, .. } = details else {
            panic!("expected edit confirmation");
        };
        assert_eq!(title, "Confirm Write: src/new.rs");
        assert!(diff.contains("+fn main() {}"));
        assert!(tool.modifies_files());

        let result = tool.execute(&call, &cancel).await.unwrap();
        assert!(result.llm_content.starts_with("Successfully created"));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("src/new.rs")).unwrap(),
            "fn main() {}\n"
        );
    }

    #[tokio::test]
    async fn replace_edits_exact_occurrences() {
        let (dir, ws) = workspace();
        let file = dir.path().join("greeting.txt");
        std::fs::write(&file, "Hello, World!").unwrap();
        let tool = ReplaceTool::new(ws);
        let cancel = CancellationToken::new();

        let call = args(json!({
            "file_path": file.to_string_lossy(),
            "old_string": "World",
            "new_string": "Rust",
        }));
        assert!(tool.should_confirm_execute(&call, &cancel).await.unwrap().is_some());
        tool.execute(&call, &cancel).await.unwrap();
        assert_eq!(std::fs::read_to_string(&file).unwrap(), "Hello, Rust!");
    }

    #[tokio::test]
    async fn replace_rejects_missing_and_ambiguous_text() {
        let (dir, ws) = workspace();
        let file = dir.path().join("data.txt");
        std::fs::write(&file, "aaa bbb aaa").unwrap();
        let tool = ReplaceTool::new(ws);
        let cancel = CancellationToken::new();

        let missing = args(json!({"file_path": "data.txt", "old_string": "zzz", "new_string": "y"}));
        assert!(tool.should_confirm_execute(&missing, &cancel).await.unwrap().is_none());
        let err = tool.execute(&missing, &cancel).await.unwrap_err();
        assert!(err.to_string().contains("could not find the string"));

        let ambiguous = args(json!({"file_path": "data.txt", "old_string": "aaa", "new_string": "c"}));
        let err = tool.execute(&ambiguous, &cancel).await.unwrap_err();
        assert!(err.to_string().contains("expected 1 occurrence(s) but found 2"));

        let both = args(json!({
            "file_path": "data.txt",
            "old_string": "aaa",
            "new_string": "c",
            "expected_replacements": 2,
        }));
        tool.execute(&both, &cancel).await.unwrap();
        assert_eq!(std::fs::read_to_string(&file).unwrap(), "c bbb c");
    }

    #[tokio::test]
    async fn replace_with_empty_old_string_creates_file() {
        let (dir, ws) = workspace();
        let tool = ReplaceTool::new(ws);
        let call = args(json!({"file_path": "fresh.txt", "old_string": "", "new_string": "hi"}));
        let result = tool.execute(&call, &CancellationToken::new()).await.unwrap();
        assert!(result.llm_content.starts_with("Created new file"));
        assert_eq!(std::fs::read_to_string(dir.path().join("fresh.txt")).unwrap(), "hi");

        let err = tool.execute(&call, &CancellationToken::new()).await.unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[tokio::test]
    async fn cancelled_calls_do_nothing() {
        let (dir, ws) = workspace();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let call = args(json!({"file_path": "x.txt", "content": "x"}));
        let err = WriteFileTool::new(ws).execute(&call, &cancel).await.unwrap_err();
        assert!(matches!(err, grokline_agent::AgentError::Cancelled));
        assert!(!dir.path().join("x.txt").exists());
    }
}

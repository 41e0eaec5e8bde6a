//! Shell tool -- run a command through `sh -c` in the workspace.  The
//! optional `directory` must stay inside the workspace.
//!
//! Every command needs approval unless its root command was allow-listed
//! for the session.  Output is truncated to [`MAX_OUTPUT_BYTES`] per stream.
//! Commands have no time limit; cancelling the call kills the child.

use std::collections::HashSet;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use grokline_agent::{ConfirmationDetails, Tool, ToolResult};
use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Result, ToolError};
use crate::filesystem::{Workspace, ensure_not_cancelled, require_str};

/// Maximum output size in bytes (100 KB).  Stdout and stderr are each
/// truncated independently.
const MAX_OUTPUT_BYTES: usize = 100 * 1024;

/// Runs shell commands.
pub struct ShellTool {
    workspace: Arc<Workspace>,
    /// Root commands the user already approved for this session.
    allowed_roots: Mutex<HashSet<String>>,
}

impl ShellTool {
    pub const NAME: &'static str = "run_shell_command";

    pub fn new(workspace: Arc<Workspace>) -> Self {
        Self {
            workspace,
            allowed_roots: Mutex::new(HashSet::new()),
        }
    }

    /// Skip the approval prompt for commands starting with `root`.
    pub fn allow_root_command(&self, root: impl Into<String>) {
        self.allowed_roots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(root.into());
    }

    async fn run(&self, args: &Map<String, Value>, cancel: &CancellationToken) -> Result<ToolResult> {
        let command = require_str(args, "command", Self::NAME)?;
        let working_dir = match args.get("directory").and_then(Value::as_str) {
            Some(dir) => self.workspace.resolve(dir, Self::NAME)?,
            None => self.workspace.root().to_path_buf(),
        };

        debug!(command, working_dir = %working_dir.display(), "executing shell command");

        let child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ToolError::ExecutionFailed {
                tool_name: Self::NAME.into(),
                reason: format!("failed to spawn process: {e}"),
            })?;

        // Dropping the future drops the child, which kills it.
        let output = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!(command, "shell command cancelled");
                return Err(ToolError::Cancelled { tool_name: Self::NAME.into() });
            }
            output = child.wait_with_output() => output?,
        };

        let exit_code = output.status.code();
        let (stdout, stdout_truncated) = truncate_output(&output.stdout);
        let (stderr, stderr_truncated) = truncate_output(&output.stderr);
        debug!(?exit_code, stdout_truncated, stderr_truncated, "command completed");

        let or_empty = |s: &str| if s.trim().is_empty() { "(empty)".to_owned() } else { s.to_owned() };
        let exit = exit_code.map_or_else(|| "(none, terminated by signal)".to_owned(), |c| c.to_string());
        let llm_content = format!(
            "Command: {command}\nDirectory: {}\nStdout: {}\nStderr: {}\nExit Code: {exit}",
            working_dir.display(),
            or_empty(&stdout),
            or_empty(&stderr),
        );

        let mut display = stdout.trim_end().to_owned();
        if !stderr.trim().is_empty() {
            if !display.is_empty() {
                display.push('\n');
            }
            display.push_str(stderr.trim_end());
        }
        if exit_code != Some(0) {
            if !display.is_empty() {
                display.push('\n');
            }
            display.push_str(&format!("Command exited with code {exit}"));
        }

        Ok(ToolResult {
            llm_content,
            return_display: display,
        })
    }
}

/// First word of a command, the unit of session allow-listing.
fn root_command(command: &str) -> Option<&str> {
    command
        .split(|c: char| c.is_whitespace() || matches!(c, ';' | '&' | '|'))
        .find(|s| !s.is_empty())
}

/// Truncate raw command output to [`MAX_OUTPUT_BYTES`], converting to a
/// lossy UTF-8 string.  Returns `(output_string, was_truncated)`.
fn truncate_output(raw: &[u8]) -> (String, bool) {
    if raw.len() <= MAX_OUTPUT_BYTES {
        (String::from_utf8_lossy(raw).into_owned(), false)
    } else {
        let mut s = String::from_utf8_lossy(&raw[..MAX_OUTPUT_BYTES]).into_owned();
        s.push_str("\n... [output truncated at 100 KB]");
        (s, true)
    }
}

#[async_trait]
impl Tool for ShellTool {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn description(&self) -> &str {
        "Executes a shell command with `sh -c` and returns stdout, stderr and the exit code."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": { "type": "string", "description": "The shell command to execute" },
                "description": { "type": "string", "description": "Short explanation shown to the user" },
                "directory": { "type": "string", "description": "Directory relative to the workspace root (optional)" }
            },
            "required": ["command"]
        })
    }

    async fn should_confirm_execute(
        &self,
        args: &Map<String, Value>,
        _cancel: &CancellationToken,
    ) -> grokline_agent::Result<Option<ConfirmationDetails>> {
        let command = require_str(args, "command", Self::NAME)?;
        let allowed = root_command(command).is_some_and(|root| {
            self.allowed_roots
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .contains(root)
        });
        if allowed {
            return Ok(None);
        }
        Ok(Some(ConfirmationDetails::Exec {
            title: "Confirm Shell Command".into(),
            command: command.to_owned(),
        }))
    }

    async fn execute(
        &self,
        args: &Map<String, Value>,
        cancel: &CancellationToken,
    ) -> grokline_agent::Result<ToolResult> {
        ensure_not_cancelled(cancel, Self::NAME)?;
        Ok(self.run(args, cancel).await?)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! The terminal side of a session: rendering events, approval prompts and
//! memory refresh.

use std::collections::HashMap;
use std::io::{self, Write as _};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use async_trait::async_trait;
use grokline_agent::{
    AgentError, ConfirmationDetails, ConfirmationOutcome, GrokChat, SessionHost,
    ToolCallRequestInfo, ToolCallStatus, TrackedToolCall, TurnEvent,
};
use grokline_tools::load_memories;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tracing::{info, warn};

use crate::helpers::{compose_system_instruction, env_non_empty};

/// Line reader shared by the REPL prompt and approval prompts.
pub type InputLines = Arc<tokio::sync::Mutex<Lines<BufReader<Stdin>>>>;

pub fn stdin_lines() -> InputLines {
    Arc::new(tokio::sync::Mutex::new(BufReader::new(tokio::io::stdin()).lines()))
}

/// Where the system instruction comes from, for rebuilding it when memory
/// changes.
pub struct PromptSource {
    pub base: Option<String>,
    pub workspace_root: PathBuf,
    pub memory_path: PathBuf,
}

impl PromptSource {
    pub async fn build(&self) -> String {
        let memories = load_memories(&self.memory_path).await;
        compose_system_instruction(self.base.as_deref(), &self.workspace_root, &memories)
    }
}

/// [`SessionHost`] for an interactive terminal.
pub struct TerminalHost {
    input: InputLines,
    prompt: PromptSource,
    chat: OnceLock<Arc<GrokChat>>,
    /// Last status printed per call id.
    shown: Mutex<HashMap<String, ToolCallStatus>>,
    /// Model text was printed without a trailing newline.
    mid_line: AtomicBool,
}

impl TerminalHost {
    pub fn new(input: InputLines, prompt: PromptSource) -> Self {
        Self {
            input,
            prompt,
            chat: OnceLock::new(),
            shown: Mutex::new(HashMap::new()),
            mid_line: AtomicBool::new(false),
        }
    }

    /// Attach the conversation whose system instruction memory refreshes
    /// rewrite.
    pub fn attach_chat(&self, chat: Arc<GrokChat>) {
        if self.chat.set(chat).is_err() {
            warn!("terminal host already attached to a chat");
        }
    }

    /// Read one line of user input; `None` at end of input.
    pub async fn read_line(&self) -> Option<String> {
        match self.input.lock().await.next_line().await {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "failed to read input");
                None
            }
        }
    }

    /// Terminate a partially printed line of model text.
    pub fn end_line(&self) {
        if self.mid_line.swap(false, Ordering::SeqCst) {
            println!();
        }
    }

    async fn open_in_editor(&self, editor: &str, diff: &str) {
        let file = match tempfile::Builder::new().suffix(".diff").tempfile() {
            Ok(file) => file,
            Err(e) => {
                eprintln!("  Could not create a temp file: {e}");
                return;
            }
        };
        if let Err(e) = std::fs::write(file.path(), diff) {
            eprintln!("  Could not write the diff: {e}");
            return;
        }

        let mut words = editor.split_whitespace();
        let Some(program) = words.next() else {
            return;
        };
        let status = tokio::process::Command::new(program)
            .args(words)
            .arg(file.path())
            .status()
            .await;
        match status {
            Ok(status) if status.success() => {}
            Ok(status) => eprintln!("  Editor exited with {status}"),
            Err(e) => eprintln!("  Could not start `{editor}`: {e}"),
        }
    }
}

fn flush() {
    io::stdout().flush().ok();
}

/// Map an answer typed at the approval prompt.
fn parse_answer(answer: &str) -> Option<ConfirmationOutcome> {
    match answer.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => Some(ConfirmationOutcome::ProceedOnce),
        "a" | "always" => Some(ConfirmationOutcome::ProceedAlways),
        "n" | "no" => Some(ConfirmationOutcome::Cancel),
        _ => None,
    }
}

fn status_line(call: &TrackedToolCall) -> Option<String> {
    let name = call.name();
    match call.status {
        ToolCallStatus::Executing => Some(format!("  [running] {name}")),
        ToolCallStatus::Success => {
            let display = call.result_display.as_deref().unwrap_or_default().trim_end();
            if display.is_empty() {
                Some(format!("  [ok] {name}"))
            } else {
                Some(format!("  [ok] {name}\n{display}"))
            }
        }
        ToolCallStatus::Error => Some(format!(
            "  [error] {name}: {}",
            call.error.as_deref().unwrap_or("unknown error")
        )),
        ToolCallStatus::Cancelled => Some(format!("  [cancelled] {name}")),
        ToolCallStatus::Validating | ToolCallStatus::Scheduled | ToolCallStatus::AwaitingApproval => None,
    }
}

#[async_trait]
impl SessionHost for TerminalHost {
    fn on_event(&self, event: &TurnEvent) {
        match event {
            TurnEvent::Content(text) => {
                print!("{text}");
                flush();
                self.mid_line.store(!text.ends_with('\n'), Ordering::SeqCst);
            }
            TurnEvent::Thought(thought) => {
                self.end_line();
                if !thought.subject.is_empty() {
                    println!("  (thinking) {}", thought.subject);
                }
            }
            TurnEvent::ToolCallRequest(_) => self.end_line(),
            TurnEvent::UserCancelled => {
                self.end_line();
                println!("  Request cancelled.");
            }
            TurnEvent::Error(error) => {
                self.end_line();
                match error.status {
                    Some(status) => eprintln!("  Error ({status}): {}", error.message),
                    None => eprintln!("  Error: {}", error.message),
                }
            }
            TurnEvent::ChatCompressed(info) => {
                self.end_line();
                println!(
                    "  Chat history compressed from {} to {} tokens.",
                    info.original_token_count, info.new_token_count
                );
            }
            TurnEvent::MaxSessionTurns => {
                self.end_line();
                println!(
                    "  The session reached its turn limit. Raise max_session_turns to continue."
                );
            }
        }
    }

    fn on_tool_calls_updated(&self, calls: &[TrackedToolCall]) {
        let mut shown = self.shown.lock().unwrap_or_else(PoisonError::into_inner);
        for call in calls {
            if shown.get(call.call_id()) == Some(&call.status) {
                continue;
            }
            shown.insert(call.call_id().to_owned(), call.status);
            if let Some(line) = status_line(call) {
                self.end_line();
                println!("{line}");
            }
        }
    }

    async fn request_approval(
        &self,
        call: &ToolCallRequestInfo,
        details: &ConfirmationDetails,
    ) -> ConfirmationOutcome {
        self.end_line();
        println!();
        println!("  {}", details.title());
        let diff = match details {
            ConfirmationDetails::Edit { diff, .. } => {
                println!("{diff}");
                Some(diff)
            }
            ConfirmationDetails::Exec { command, .. } => {
                println!("    $ {command}");
                None
            }
            ConfirmationDetails::Info { prompt, .. } => {
                println!("    {prompt}");
                None
            }
        };
        let editor = diff.and(self.preferred_editor());

        loop {
            if editor.is_some() {
                print!("  Allow {}? [y]es / [a]lways / [n]o / [e]ditor: ", call.name);
            } else {
                print!("  Allow {}? [y]es / [a]lways / [n]o: ", call.name);
            }
            flush();

            let Some(answer) = self.read_line().await else {
                return ConfirmationOutcome::Cancel;
            };
            if let Some(outcome) = parse_answer(&answer) {
                info!(tool = %call.name, call_id = %call.call_id, ?outcome, "approval answered");
                return outcome;
            }
            if let (Some(editor), Some(diff)) = (editor.as_deref(), diff) {
                if answer.trim().eq_ignore_ascii_case("e") {
                    self.open_in_editor(editor, diff).await;
                }
            }
        }
    }

    fn preferred_editor(&self) -> Option<String> {
        env_non_empty("VISUAL").or_else(|| env_non_empty("EDITOR"))
    }

    fn on_auth_error(&self, error: &AgentError) {
        self.end_line();
        eprintln!("  Authentication failed: {error}");
        eprintln!("  Check GROK_API_KEY and restart GrokLine.");
    }

    async fn refresh_memory(&self) {
        let Some(chat) = self.chat.get() else {
            return;
        };
        chat.set_system_instruction(Some(self.prompt.build().await));
        info!("memory refreshed");
    }

    fn on_model_fallback(&self, from: &str, to: &str) {
        self.end_line();
        println!("  Quota exceeded for {from}. Switched to {to} for the rest of this session.");
    }

    fn on_info(&self, message: &str) {
        self.end_line();
        println!("  {message}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn tracked(status: ToolCallStatus, display: Option<&str>, error: Option<&str>) -> TrackedToolCall {
        TrackedToolCall {
            request: ToolCallRequestInfo {
                call_id: "c1".into(),
                name: "read_file".into(),
                args: Map::new(),
                is_client_initiated: false,
                prompt_id: "p".into(),
            },
            status,
            confirmation: None,
            response_parts: Vec::new(),
            result_display: display.map(str::to_owned),
            error: error.map(str::to_owned),
            submitted: false,
        }
    }

    #[test]
    fn answers_map_to_outcomes() {
        assert_eq!(parse_answer("y"), Some(ConfirmationOutcome::ProceedOnce));
        assert_eq!(parse_answer(" Always "), Some(ConfirmationOutcome::ProceedAlways));
        assert_eq!(parse_answer("NO"), Some(ConfirmationOutcome::Cancel));
        assert_eq!(parse_answer("e"), None);
        assert_eq!(parse_answer(""), None);
    }

    #[test]
    fn status_lines_for_terminal_calls() {
        assert_eq!(
            status_line(&tracked(ToolCallStatus::Success, Some("Read src/main.rs\n"), None)).as_deref(),
            Some("  [ok] read_file\nRead src/main.rs")
        );
        assert_eq!(
            status_line(&tracked(ToolCallStatus::Error, None, Some("boom"))).as_deref(),
            Some("  [error] read_file: boom")
        );
        assert!(status_line(&tracked(ToolCallStatus::AwaitingApproval, None, None)).is_none());
    }
}

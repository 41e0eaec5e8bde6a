//! The turn engine: one request/response exchange with the model.
//!
//! A [`Turn`] opens a stream for the outbound message, classifies every
//! chunk into [`TurnEvent`]s and stops at the first of stream exhaustion,
//! cancellation or a backend error.  Tool calls requested during the turn
//! are collected in [`Turn::pending_tool_calls`] for the scheduler.
//!
//! History is only updated when the turn completes: the user message and the
//! consolidated model output are appended together.

use std::sync::{Arc, LazyLock};

use futures::StreamExt;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::chat::GrokChat;
use crate::error::{AgentError, Result, StructuredError};
use crate::llm::types::{Content, FinishReason, FunctionCall, GenerationResponse, Part};
use crate::reporting::ErrorReporter;

/// Name used when the backend requests a tool call without a name.
const UNNAMED_TOOL: &str = "undefined_tool_name";

/// Bold markdown span holding a thought's subject.
static THOUGHT_SUBJECT: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?s)\*\*(.*?)\*\*").ok());

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// A reasoning summary: the bolded subject and the rest of the text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThoughtSummary {
    pub subject: String,
    pub description: String,
}

impl ThoughtSummary {
    /// Split raw thought text into subject and description.
    pub fn parse(raw: &str) -> Self {
        let Some(re) = THOUGHT_SUBJECT.as_ref() else {
            return Self {
                subject: String::new(),
                description: raw.trim().to_owned(),
            };
        };
        let subject = re
            .captures(raw)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().trim().to_owned())
            .unwrap_or_default();
        let description = re.replace(raw, "").trim().to_owned();
        Self {
            subject,
            description,
        }
    }
}

/// A tool invocation requested during a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequestInfo {
    pub call_id: String,
    pub name: String,
    pub args: Map<String, Value>,
    /// `true` for calls started by the user interface rather than the model.
    /// Their results are never sent to the model.
    pub is_client_initiated: bool,
    pub prompt_id: String,
}

/// Token counts before and after a history compression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatCompressionInfo {
    pub original_token_count: u32,
    pub new_token_count: u32,
}

/// Everything a turn reports to its caller.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    /// Model text, in stream order.
    Content(String),
    /// Model reasoning.
    Thought(ThoughtSummary),
    /// The model requested a tool call.
    ToolCallRequest(ToolCallRequestInfo),
    /// The turn stopped because the cancellation token fired.
    UserCancelled,
    /// The backend failed; the turn is over but the session is usable.
    Error(StructuredError),
    /// History was compressed before the turn started.
    ChatCompressed(ChatCompressionInfo),
    /// The session turn ceiling was reached; no request was sent.
    MaxSessionTurns,
}

/// How a turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    Completed,
    Cancelled,
    Errored,
}

// ---------------------------------------------------------------------------
// Turn
// ---------------------------------------------------------------------------

/// One exchange with the model.
pub struct Turn {
    chat: Arc<GrokChat>,
    reporter: Arc<dyn ErrorReporter>,
    prompt_id: String,
    pending_tool_calls: Vec<ToolCallRequestInfo>,
    finish_reason: Option<FinishReason>,
}

impl Turn {
    pub fn new(
        chat: Arc<GrokChat>,
        reporter: Arc<dyn ErrorReporter>,
        prompt_id: impl Into<String>,
    ) -> Self {
        Self {
            chat,
            reporter,
            prompt_id: prompt_id.into(),
            pending_tool_calls: Vec::new(),
            finish_reason: None,
        }
    }

    /// The prompt this turn belongs to.
    pub fn prompt_id(&self) -> &str {
        &self.prompt_id
    }

    /// Tool calls requested so far, in request order.
    pub fn pending_tool_calls(&self) -> &[ToolCallRequestInfo] {
        &self.pending_tool_calls
    }

    /// Take ownership of the requested tool calls.
    pub fn take_pending_tool_calls(&mut self) -> Vec<ToolCallRequestInfo> {
        std::mem::take(&mut self.pending_tool_calls)
    }

    /// The last finish reason the backend reported.
    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.finish_reason
    }

    /// Run the turn, delivering events to `on_event` in stream order.
    ///
    /// # Errors
    ///
    /// Only authorization failures are returned as errors; the caller must
    /// re-authenticate.  Every other backend failure becomes a
    /// [`TurnEvent::Error`] and [`TurnOutcome::Errored`].
    pub async fn run<F>(
        &mut self,
        parts: Vec<Part>,
        cancel: &CancellationToken,
        on_event: &mut F,
    ) -> Result<TurnOutcome>
    where
        F: FnMut(TurnEvent),
    {
        let message = Content::user(parts);

        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            opened = self.chat.send_message_stream(&message) => Some(opened),
        };
        let mut stream = match opened {
            None => {
                on_event(TurnEvent::UserCancelled);
                return Ok(TurnOutcome::Cancelled);
            }
            Some(Err(e)) => return self.fail(e, &message, cancel, on_event).await,
            Some(Ok(stream)) => stream,
        };

        let mut model_parts: Vec<Part> = Vec::new();
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    on_event(TurnEvent::UserCancelled);
                    return Ok(TurnOutcome::Cancelled);
                }
                next = stream.next() => next,
            };

            match next {
                None => break,
                Some(Err(e)) => return self.fail(e, &message, cancel, on_event).await,
                Some(Ok(response)) => {
                    if cancel.is_cancelled() {
                        on_event(TurnEvent::UserCancelled);
                        return Ok(TurnOutcome::Cancelled);
                    }
                    self.process_chunk(response, &mut model_parts, on_event);
                }
            }
        }

        tracing::debug!(
            prompt_id = %self.prompt_id,
            tool_calls = self.pending_tool_calls.len(),
            "turn complete"
        );
        self.chat.record_exchange(message, model_parts);
        Ok(TurnOutcome::Completed)
    }

    fn process_chunk<F>(&mut self, response: GenerationResponse, model_parts: &mut Vec<Part>, on_event: &mut F)
    where
        F: FnMut(TurnEvent),
    {
        if let Some(reason) = response.finish_reason() {
            self.finish_reason = Some(reason);
        }

        if let Some(Part::Text {
            text,
            thought: true,
        }) = response.parts().first()
        {
            on_event(TurnEvent::Thought(ThoughtSummary::parse(text)));
            model_parts.push(Part::thought(text.clone()));
            return;
        }

        let text = response.text();
        if !text.is_empty() {
            model_parts.push(Part::text(text.clone()));
            on_event(TurnEvent::Content(text));
        }

        for call in response.function_calls() {
            let info = self.register_call(call);
            model_parts.push(Part::FunctionCall(FunctionCall {
                id: Some(info.call_id.clone()),
                name: info.name.clone(),
                args: info.args.clone(),
            }));
            on_event(TurnEvent::ToolCallRequest(info));
        }
    }

    fn register_call(&mut self, call: &FunctionCall) -> ToolCallRequestInfo {
        let name = if call.name.is_empty() {
            UNNAMED_TOOL.to_owned()
        } else {
            call.name.clone()
        };
        let call_id = call
            .id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| generate_call_id(&name));

        tracing::debug!(prompt_id = %self.prompt_id, call_id = %call_id, tool = %name, "tool call requested");

        let info = ToolCallRequestInfo {
            call_id,
            name,
            args: call.args.clone(),
            is_client_initiated: false,
            prompt_id: self.prompt_id.clone(),
        };
        self.pending_tool_calls.push(info.clone());
        info
    }

    async fn fail<F>(
        &mut self,
        error: AgentError,
        message: &Content,
        cancel: &CancellationToken,
        on_event: &mut F,
    ) -> Result<TurnOutcome>
    where
        F: FnMut(TurnEvent),
    {
        if error.is_unauthorized() {
            return Err(error);
        }
        if cancel.is_cancelled() {
            on_event(TurnEvent::UserCancelled);
            return Ok(TurnOutcome::Cancelled);
        }

        let mut context = self.chat.history();
        context.push(message.clone());
        self.reporter
            .report(&error, "Error when talking to the Grok API", &context, "turn")
            .await;

        let structured = StructuredError::from(&error);
        tracing::warn!(prompt_id = %self.prompt_id, status = ?structured.status, error = %structured.message, "turn failed");
        on_event(TurnEvent::Error(structured));
        Ok(TurnOutcome::Errored)
    }
}

/// Call id for a call the backend did not label: name, time and a random
/// suffix.
fn generate_call_id(name: &str) -> String {
    let millis = chrono::Utc::now().timestamp_millis();
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{name}-{millis}-{}", &suffix[..12])
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{
        RecordingReporter, ScriptedGenerator, call_chunk, text_chunk, thought_chunk,
    };
    use serde_json::json;

    fn turn_with(generator: Arc<ScriptedGenerator>) -> (Turn, Arc<GrokChat>, Arc<RecordingReporter>) {
        let chat = Arc::new(GrokChat::new(generator, "grok-4-0709", Default::default()));
        let reporter = Arc::new(RecordingReporter::default());
        let turn = Turn::new(chat.clone(), reporter.clone(), "prompt-1");
        (turn, chat, reporter)
    }

    async fn run(turn: &mut Turn, text: &str, cancel: &CancellationToken) -> (Result<TurnOutcome>, Vec<TurnEvent>) {
        let mut events = Vec::new();
        let outcome = turn
            .run(vec![Part::text(text)], cancel, &mut |e| events.push(e))
            .await;
        (outcome, events)
    }

    #[test]
    fn thought_subject_is_extracted() {
        let thought = ThoughtSummary::parse("**Planning the search** I will look at src first.");
        assert_eq!(thought.subject, "Planning the search");
        assert_eq!(thought.description, "I will look at src first.");

        let thought = ThoughtSummary::parse("no subject here");
        assert_eq!(thought.subject, "");
        assert_eq!(thought.description, "no subject here");

        let thought = ThoughtSummary::parse("**multi\nline** rest");
        assert_eq!(thought.subject, "multi\nline");
    }

    #[test]
    fn generated_call_ids_are_unique() {
        let a = generate_call_id("read_file");
        let b = generate_call_id("read_file");
        assert!(a.starts_with("read_file-"));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn content_events_in_order_and_history_recorded() {
        let generator = Arc::new(ScriptedGenerator::new());
        generator.push_stream(vec![text_chunk("Hello"), text_chunk(" world")]);
        let (mut turn, chat, _) = turn_with(generator);

        let (outcome, events) = run(&mut turn, "hi", &CancellationToken::new()).await;
        assert_eq!(outcome.unwrap(), TurnOutcome::Completed);
        assert_eq!(
            events,
            vec![
                TurnEvent::Content("Hello".into()),
                TurnEvent::Content(" world".into())
            ]
        );

        let history = chat.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].parts[0].as_text(), Some("Hello world"));
    }

    #[tokio::test]
    async fn function_call_chunk_emits_request_without_content() {
        let generator = Arc::new(ScriptedGenerator::new());
        generator.push_stream(vec![call_chunk(None, "list_dir", json!({"path": "."}))]);
        let (mut turn, chat, _) = turn_with(generator);

        let (outcome, events) = run(&mut turn, "list files", &CancellationToken::new()).await;
        assert_eq!(outcome.unwrap(), TurnOutcome::Completed);
        assert_eq!(events.len(), 1);
        let TurnEvent::ToolCallRequest(info) = &events[0] else {
            panic!("expected a tool call request, got {:?}", events[0]);
        };
        assert_eq!(info.name, "list_dir");
        assert_eq!(info.args["path"], ".");
        assert!(!info.is_client_initiated);
        assert_eq!(info.prompt_id, "prompt-1");
        assert_eq!(turn.pending_tool_calls().len(), 1);
        assert_eq!(turn.finish_reason(), Some(FinishReason::Stop));

        let Part::FunctionCall(recorded) = &chat.history()[1].parts[0] else {
            panic!("expected a function call in history");
        };
        assert_eq!(recorded.id.as_deref(), Some(info.call_id.as_str()));
    }

    #[tokio::test]
    async fn thought_chunk_never_contributes_content() {
        let generator = Arc::new(ScriptedGenerator::new());
        generator.push_stream(vec![thought_chunk("**Thinking** hard"), text_chunk("Done")]);
        let (mut turn, _, _) = turn_with(generator);

        let (_, events) = run(&mut turn, "q", &CancellationToken::new()).await;
        assert_eq!(
            events,
            vec![
                TurnEvent::Thought(ThoughtSummary {
                    subject: "Thinking".into(),
                    description: "hard".into()
                }),
                TurnEvent::Content("Done".into()),
            ]
        );
    }

    #[tokio::test]
    async fn cancellation_before_chunk_discards_it() {
        let generator = Arc::new(ScriptedGenerator::new());
        let cancel = CancellationToken::new();
        generator.push_stream_cancelling(
            vec![text_chunk("should not appear"), call_chunk(None, "shell", json!({}))],
            cancel.clone(),
        );
        let (mut turn, chat, _) = turn_with(generator);

        let (outcome, events) = run(&mut turn, "q", &cancel).await;
        assert_eq!(outcome.unwrap(), TurnOutcome::Cancelled);
        assert_eq!(events, vec![TurnEvent::UserCancelled]);
        assert!(turn.pending_tool_calls().is_empty());
        assert_eq!(chat.history_len(), 0, "cancelled turns leave history alone");
    }

    #[tokio::test]
    async fn already_cancelled_token_sends_nothing() {
        let generator = Arc::new(ScriptedGenerator::new());
        generator.push_stream(vec![text_chunk("x")]);
        let (mut turn, _, _) = turn_with(generator.clone());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let (outcome, events) = run(&mut turn, "q", &cancel).await;
        assert_eq!(outcome.unwrap(), TurnOutcome::Cancelled);
        assert_eq!(events, vec![TurnEvent::UserCancelled]);
    }

    #[tokio::test]
    async fn backend_error_is_reported_and_emitted() {
        let generator = Arc::new(ScriptedGenerator::new());
        generator.push_chunks(vec![
            Ok(text_chunk("partial")),
            Err(AgentError::Api {
                status: 500,
                message: "server exploded".into(),
            }),
        ]);
        let (mut turn, chat, reporter) = turn_with(generator);

        let (outcome, events) = run(&mut turn, "q", &CancellationToken::new()).await;
        assert_eq!(outcome.unwrap(), TurnOutcome::Errored);
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[1],
            TurnEvent::Error(StructuredError {
                message: "server exploded".into(),
                status: Some(500)
            })
        );
        assert_eq!(reporter.operations(), vec!["turn".to_owned()]);
        assert_eq!(chat.history_len(), 0);
    }

    #[tokio::test]
    async fn open_failure_is_an_error_event() {
        let generator = Arc::new(ScriptedGenerator::new());
        generator.push_open_error(AgentError::Api {
            status: 429,
            message: "quota".into(),
        });
        let (mut turn, _, _) = turn_with(generator);

        let (outcome, events) = run(&mut turn, "q", &CancellationToken::new()).await;
        assert_eq!(outcome.unwrap(), TurnOutcome::Errored);
        let TurnEvent::Error(err) = &events[0] else {
            panic!("expected error event");
        };
        assert!(err.is_quota_exceeded());
    }

    #[tokio::test]
    async fn unauthorized_is_propagated() {
        let generator = Arc::new(ScriptedGenerator::new());
        generator.push_open_error(AgentError::Unauthorized {
            message: "bad key".into(),
        });
        let (mut turn, _, reporter) = turn_with(generator);

        let (outcome, events) = run(&mut turn, "q", &CancellationToken::new()).await;
        assert!(outcome.unwrap_err().is_unauthorized());
        assert!(events.is_empty());
        assert!(reporter.operations().is_empty());
    }

    #[tokio::test]
    async fn cancellation_racing_an_error_reports_cancellation() {
        let generator = Arc::new(ScriptedGenerator::new());
        let cancel = CancellationToken::new();
        generator.push_chunks_cancelling(
            vec![Err(AgentError::Stream {
                reason: "connection reset".into(),
            })],
            cancel.clone(),
        );
        let (mut turn, _, reporter) = turn_with(generator);

        let (outcome, events) = run(&mut turn, "q", &cancel).await;
        assert_eq!(outcome.unwrap(), TurnOutcome::Cancelled);
        assert_eq!(events, vec![TurnEvent::UserCancelled]);
        assert!(reporter.operations().is_empty());
    }

    #[tokio::test]
    async fn unnamed_call_gets_placeholder_name() {
        let generator = Arc::new(ScriptedGenerator::new());
        generator.push_stream(vec![call_chunk(Some("c1"), "", json!({}))]);
        let (mut turn, _, _) = turn_with(generator);

        run(&mut turn, "q", &CancellationToken::new()).await.0.unwrap();
        assert_eq!(turn.pending_tool_calls()[0].name, "undefined_tool_name");
        assert_eq!(turn.pending_tool_calls()[0].call_id, "c1");
    }
}

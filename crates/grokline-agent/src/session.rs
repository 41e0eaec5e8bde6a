//! Session driver: user queries, the agentic loop and quota fallback.
//!
//! [`AgentSession::submit_query`] runs a user query to completion: one turn,
//! then the tool batch it requested, then continuation turns carrying the
//! tool results until the model stops asking for tools.  Continuations go
//! through the same entry point as user queries and share the
//! one-active-turn guard, so two turns never append to history at once.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::chat::GrokChat;
use crate::checkpoint::{Checkpointer, SnapshotService};
use crate::client::{AgentClient, TurnReport};
use crate::compaction::CompressionConfig;
use crate::config::{DEFAULT_GROK_FLASH_MODEL, SessionConfig};
use crate::error::{AgentError, Result};
use crate::llm::generator::ContentGenerator;
use crate::llm::types::{Content, Part};
use crate::reporting::ErrorReporter;
use crate::scheduler::{
    ConfirmationOutcome, ContinuationAction, ProcessedCallIds, SchedulerConfig, SchedulerHost,
    StreamingState, ToolScheduler, TrackedToolCall, streaming_state,
};
use crate::tools::{ConfirmationDetails, ToolRegistry};
use crate::turn::{ToolCallRequestInfo, TurnEvent, TurnOutcome};

/// Separator between the session id and the prompt counter in prompt ids.
const PROMPT_ID_SEPARATOR: &str = "########";

// ---------------------------------------------------------------------------
// Host
// ---------------------------------------------------------------------------

/// The user interface side of a session.
#[async_trait]
pub trait SessionHost: Send + Sync {
    /// Every turn event, in stream order.
    fn on_event(&self, event: &TurnEvent);

    /// Tool call status changed.
    fn on_tool_calls_updated(&self, _calls: &[TrackedToolCall]) {}

    /// Ask the user whether a tool call may run.
    async fn request_approval(
        &self,
        call: &ToolCallRequestInfo,
        details: &ConfirmationDetails,
    ) -> ConfirmationOutcome;

    /// Editor the user prefers for reviewing changes.
    fn preferred_editor(&self) -> Option<String> {
        None
    }

    /// The backend rejected the credentials; the user must re-authenticate.
    fn on_auth_error(&self, _error: &AgentError) {}

    /// Long-term memory changed and should be reloaded.
    async fn refresh_memory(&self) {}

    /// The session switched models after a quota error.
    fn on_model_fallback(&self, _from: &str, _to: &str) {}

    /// Informational message for the user.
    fn on_info(&self, _message: &str) {}
}

struct HostBridge(Arc<dyn SessionHost>);

#[async_trait]
impl SchedulerHost for HostBridge {
    fn on_update(&self, calls: &[TrackedToolCall]) {
        self.0.on_tool_calls_updated(calls);
    }

    async fn request_approval(
        &self,
        call: &ToolCallRequestInfo,
        details: &ConfirmationDetails,
    ) -> ConfirmationOutcome {
        self.0.request_approval(call, details).await
    }
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

/// Something to send to the model.
#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    /// Typed by the user.  Starts a new prompt.
    User(Vec<Part>),
    /// Tool results fed back to the model under an existing prompt.
    Continuation { parts: Vec<Part>, prompt_id: String },
}

impl Query {
    /// A user query with a single text part.
    pub fn text(text: impl Into<String>) -> Self {
        Self::User(vec![Part::text(text)])
    }

    pub fn is_continuation(&self) -> bool {
        matches!(self, Self::Continuation { .. })
    }
}

/// Clears the responding flag when the query that set it finishes.
struct RespondingGuard<'a> {
    flag: &'a AtomicBool,
    owned: bool,
}

impl Drop for RespondingGuard<'_> {
    fn drop(&mut self) {
        if self.owned {
            self.flag.store(false, Ordering::SeqCst);
        }
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// One interactive conversation with its tools.
pub struct AgentSession {
    id: String,
    client: AgentClient,
    scheduler: ToolScheduler,
    host: Arc<dyn SessionHost>,
    bridge: HostBridge,
    responding: AtomicBool,
    prompt_count: AtomicU32,
    model_switched: AtomicBool,
    cancel: Mutex<CancellationToken>,
}

impl AgentSession {
    pub fn new(client: AgentClient, scheduler: ToolScheduler, host: Arc<dyn SessionHost>) -> Self {
        client.chat().set_tools(scheduler.registry().declarations());
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            client,
            scheduler,
            bridge: HostBridge(host.clone()),
            host,
            responding: AtomicBool::new(false),
            prompt_count: AtomicU32::new(0),
            model_switched: AtomicBool::new(false),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    /// Assemble a session from configuration.
    ///
    /// Checkpoints are recorded only when `config.checkpointing` is set and a
    /// snapshot service is available.
    pub fn from_config(
        config: &SessionConfig,
        generator: Arc<dyn ContentGenerator>,
        registry: Arc<ToolRegistry>,
        host: Arc<dyn SessionHost>,
        reporter: Arc<dyn ErrorReporter>,
        snapshots: Option<Arc<dyn SnapshotService>>,
        auto_approve: bool,
    ) -> Self {
        let chat = GrokChat::new(generator, config.effective_model(), config.generation_config())
            .with_system_instruction(config.system_instruction.clone());
        let client = AgentClient::new(Arc::new(chat), reporter)
            .with_compression(CompressionConfig::from(config))
            .with_turn_limit(config.turn_limit());

        let mut scheduler = ToolScheduler::new(
            registry,
            SchedulerConfig {
                max_concurrency: config.max_tool_concurrency,
                auto_approve,
            },
            ProcessedCallIds::default(),
        );
        if config.checkpointing {
            if let Some(snapshots) = snapshots {
                scheduler = scheduler.with_checkpointer(Checkpointer::new(&config.project_temp_dir, snapshots));
            }
        }

        Self::new(client, scheduler, host)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn client(&self) -> &AgentClient {
        &self.client
    }

    pub fn scheduler(&self) -> &ToolScheduler {
        &self.scheduler
    }

    pub fn host(&self) -> &Arc<dyn SessionHost> {
        &self.host
    }

    /// Whether a turn or its tool calls are running.
    pub fn is_responding(&self) -> bool {
        self.responding.load(Ordering::SeqCst)
    }

    pub fn streaming_state(&self) -> StreamingState {
        streaming_state(self.is_responding(), &self.scheduler.pending())
    }

    /// Cancel the active turn and its tool calls.
    pub fn cancel(&self) {
        let token = self.cancel.lock().unwrap_or_else(PoisonError::into_inner);
        if !token.is_cancelled() {
            info!(session_id = %self.id, "cancelling active turn");
            token.cancel();
        }
    }

    fn next_prompt_id(&self) -> String {
        let count = self.prompt_count.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{}{PROMPT_ID_SEPARATOR}{count}", self.id)
    }

    fn fresh_cancel_token(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.cancel.lock().unwrap_or_else(PoisonError::into_inner) = token.clone();
        token
    }

    fn current_cancel_token(&self) -> CancellationToken {
        self.cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Take the responding flag.  A user query fails with
    /// [`AgentError::Busy`] while another turn is active; a continuation
    /// joins it.
    fn acquire(&self, continuation: bool) -> Result<RespondingGuard<'_>> {
        let owned = self
            .responding
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if !owned && !continuation {
            return Err(AgentError::Busy);
        }
        Ok(RespondingGuard {
            flag: &self.responding,
            owned,
        })
    }

    /// Run a query and every continuation it leads to.
    ///
    /// # Errors
    ///
    /// [`AgentError::Busy`] when a user query arrives while a turn is
    /// active, and authorization failures, which are also reported to
    /// [`SessionHost::on_auth_error`].
    pub async fn submit_query(&self, query: Query) -> Result<()> {
        let query_is_continuation = query.is_continuation();
        let _guard = self.acquire(query_is_continuation)?;

        let (mut parts, mut prompt_id, cancel) = match query {
            Query::User(parts) => {
                self.model_switched.store(false, Ordering::SeqCst);
                (parts, self.next_prompt_id(), self.fresh_cancel_token())
            }
            Query::Continuation { parts, prompt_id } => (parts, prompt_id, self.current_cancel_token()),
        };

        let mut continuation = query_is_continuation;
        loop {
            match self.run_turn(parts, &prompt_id, continuation, &cancel).await? {
                Some(Query::Continuation {
                    parts: next_parts,
                    prompt_id: next_id,
                }) => {
                    info!(prompt_id = %next_id, "continuing with tool results");
                    parts = next_parts;
                    prompt_id = next_id;
                    continuation = true;
                }
                Some(Query::User(_)) | None => return Ok(()),
            }
        }
    }

    /// One turn plus its tool batch.  Returns the continuation, if any.
    ///
    /// A turn that fails with a quota error is retried once on the flash
    /// model.
    async fn run_turn(
        &self,
        parts: Vec<Part>,
        prompt_id: &str,
        continuation: bool,
        cancel: &CancellationToken,
    ) -> Result<Option<Query>> {
        let (mut report, quota_exceeded) = self
            .send_turn(parts.clone(), prompt_id, continuation, cancel)
            .await?;
        if quota_exceeded && self.fall_back_to_flash_model() && report.outcome == TurnOutcome::Errored {
            info!(prompt_id, "retrying the turn on the fallback model");
            report = self.send_turn(parts, prompt_id, continuation, cancel).await?.0;
        }

        let Some(mut turn) = report.turn else {
            return Ok(None);
        };
        if report.outcome != TurnOutcome::Completed {
            return Ok(None);
        }

        let requests = turn.take_pending_tool_calls();
        if requests.is_empty() {
            return Ok(None);
        }

        let history = self.client.chat().history();
        let batch = self
            .scheduler
            .schedule(requests, &history, cancel, &self.bridge)
            .await;
        Ok(self.finish_batch(&batch, cancel.is_cancelled()).await)
    }

    /// Send one turn, forwarding its events to the host.  Also reports
    /// whether the turn hit a quota error.
    async fn send_turn(
        &self,
        parts: Vec<Part>,
        prompt_id: &str,
        continuation: bool,
        cancel: &CancellationToken,
    ) -> Result<(TurnReport, bool)> {
        let host = self.host.clone();
        let mut quota_exceeded = false;
        let mut on_event = |event: TurnEvent| {
            if let TurnEvent::Error(error) = &event {
                quota_exceeded |= error.is_quota_exceeded();
            }
            host.on_event(&event);
        };

        let result = self
            .client
            .send_message_stream(parts, cancel, prompt_id, continuation, &mut on_event)
            .await;
        match result {
            Ok(report) => Ok((report, quota_exceeded)),
            Err(e) => {
                if e.is_unauthorized() {
                    warn!(error = %e, "backend rejected credentials");
                    self.host.on_auth_error(&e);
                }
                Err(e)
            }
        }
    }

    /// Apply the continuation plan of a completed batch.  After a
    /// cancellation the results are recorded but never sent.
    async fn finish_batch(&self, batch: &[TrackedToolCall], cancelled: bool) -> Option<Query> {
        let plan = self
            .scheduler
            .plan(batch, self.model_switched.load(Ordering::SeqCst));

        if plan.refresh_memory {
            info!(calls = plan.memory_call_ids.len(), "refreshing memory");
            self.host.refresh_memory().await;
        }
        self.scheduler.mark_submitted(&plan.submitted_call_ids);

        let chat = self.client.chat();
        match plan.action {
            ContinuationAction::None => None,
            ContinuationAction::AppendCancelled(content) => {
                info!("all tool calls cancelled, recording responses without a new turn");
                chat.add_history(content);
                None
            }
            ContinuationAction::SuppressedByQuotaFallback(content) => {
                chat.add_history(content);
                self.host.on_info(
                    "Tool results were recorded but not sent because the model was switched after a quota error.",
                );
                None
            }
            ContinuationAction::Continue { parts, .. } if cancelled => {
                info!("turn cancelled during the batch, recording tool results without a new turn");
                chat.add_history(Content::user(parts));
                None
            }
            ContinuationAction::Continue { parts, prompt_id } => {
                Some(Query::Continuation { parts, prompt_id })
            }
        }
    }

    /// Switch to the flash model after a quota error.  Happens at most once
    /// per user query; returns whether the switch happened now.
    fn fall_back_to_flash_model(&self) -> bool {
        let chat = self.client.chat();
        let current = chat.model();
        if current == DEFAULT_GROK_FLASH_MODEL || self.model_switched.swap(true, Ordering::SeqCst) {
            return false;
        }
        warn!(from = %current, to = DEFAULT_GROK_FLASH_MODEL, "quota exceeded, falling back to flash model");
        chat.set_model(DEFAULT_GROK_FLASH_MODEL);
        self.host.on_model_fallback(&current, DEFAULT_GROK_FLASH_MODEL);
        true
    }

    /// Run a tool on behalf of the user interface.  The result is never sent
    /// to the model.
    ///
    /// # Errors
    ///
    /// [`AgentError::Busy`] while a turn is active and
    /// [`AgentError::UnknownTool`] for unregistered tools.
    pub async fn schedule_client_tool(
        &self,
        name: &str,
        args: Map<String, Value>,
    ) -> Result<TrackedToolCall> {
        if self.scheduler.registry().get(name).is_none() {
            return Err(AgentError::UnknownTool {
                tool_name: name.to_owned(),
            });
        }
        let _guard = self.acquire(false)?;
        let cancel = self.fresh_cancel_token();

        let request = ToolCallRequestInfo {
            call_id: format!("{name}-client-{}", chrono::Utc::now().timestamp_millis()),
            name: name.to_owned(),
            args,
            is_client_initiated: true,
            prompt_id: self.next_prompt_id(),
        };
        let history = self.client.chat().history();
        let batch = self
            .scheduler
            .schedule(vec![request], &history, &cancel, &self.bridge)
            .await;
        self.finish_batch(&batch, cancel.is_cancelled()).await;

        batch
            .into_iter()
            .next()
            .ok_or_else(|| AgentError::Internal("client tool batch was empty".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::types::GenerationConfig;
    use crate::test_support::{RecordingReporter, ScriptedGenerator, text_chunk};

    #[derive(Default)]
    struct QuietHost {
        events: Mutex<Vec<TurnEvent>>,
    }

    #[async_trait]
    impl SessionHost for QuietHost {
        fn on_event(&self, event: &TurnEvent) {
            self.events.lock().unwrap().push(event.clone());
        }
        async fn request_approval(
            &self,
            _: &ToolCallRequestInfo,
            _: &ConfirmationDetails,
        ) -> ConfirmationOutcome {
            ConfirmationOutcome::ProceedOnce
        }
    }

    fn session(generator: Arc<ScriptedGenerator>) -> AgentSession {
        let chat = Arc::new(GrokChat::new(generator, "grok-3", GenerationConfig::default()));
        let client = AgentClient::new(chat, Arc::new(RecordingReporter::default()));
        let scheduler = ToolScheduler::new(
            Arc::new(ToolRegistry::new()),
            SchedulerConfig::default(),
            ProcessedCallIds::default(),
        );
        AgentSession::new(client, scheduler, Arc::new(QuietHost::default()))
    }

    #[test]
    fn prompt_ids_count_up_within_the_session() {
        let session = session(Arc::new(ScriptedGenerator::new()));
        let first = session.next_prompt_id();
        let second = session.next_prompt_id();
        assert_eq!(first, format!("{}########1", session.id()));
        assert_eq!(second, format!("{}########2", session.id()));
    }

    #[test]
    fn user_query_is_rejected_while_responding() {
        let session = session(Arc::new(ScriptedGenerator::new()));
        let _guard = session.acquire(false).unwrap();
        assert!(matches!(session.acquire(false), Err(AgentError::Busy)));
        assert!(session.acquire(true).is_ok());
        assert!(session.is_responding());
    }

    #[test]
    fn guard_releases_only_when_owned() {
        let session = session(Arc::new(ScriptedGenerator::new()));
        {
            let _outer = session.acquire(false).unwrap();
            {
                let _joined = session.acquire(true).unwrap();
            }
            assert!(session.is_responding());
        }
        assert!(!session.is_responding());
        assert_eq!(session.streaming_state(), StreamingState::Idle);
    }

    #[tokio::test]
    async fn simple_query_completes_and_releases() {
        let generator = Arc::new(ScriptedGenerator::new());
        generator.push_stream(vec![text_chunk("hi there")]);
        let session = session(generator);

        session.submit_query(Query::text("hello")).await.unwrap();

        assert!(!session.is_responding());
        assert_eq!(session.client().chat().history_len(), 2);
    }

    #[tokio::test]
    async fn client_tool_requires_registered_tool() {
        let session = session(Arc::new(ScriptedGenerator::new()));
        let err = session
            .schedule_client_tool("missing", Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::UnknownTool { .. }));
    }

    #[test]
    fn cancel_fires_current_token() {
        let session = session(Arc::new(ScriptedGenerator::new()));
        let token = session.fresh_cancel_token();
        session.cancel();
        assert!(token.is_cancelled());
    }
}

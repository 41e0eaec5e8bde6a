//! Tool-call scheduler: approval, bounded concurrent execution and
//! continuation planning.
//!
//! Every call requested during a turn moves through
//!
//! ```text
//! validating -> awaiting_approval -> scheduled -> executing -> success | error | cancelled
//!            \____________________/
//! ```
//!
//! Approval is asked for one call at a time.  Approved calls then run
//! concurrently, bounded by a semaphore; a failing or panicking tool only
//! affects its own call.  [`ToolScheduler::schedule`] returns once every call
//! of the batch is terminal, and [`plan_continuation`] decides what the
//! session does with the results.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures::StreamExt;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;

use crate::checkpoint::Checkpointer;
use crate::llm::types::{Content, Part, merge_part_lists};
use crate::tools::{ConfirmationDetails, Tool, ToolRegistry, ToolResult};
use crate::turn::ToolCallRequestInfo;

/// Name of the tool that persists long-term memory.
pub const MEMORY_TOOL_NAME: &str = "save_memory";

/// Call ids whose memory side effect already ran.  Owned by the session
/// and handed to the scheduler.
pub type ProcessedCallIds = Arc<Mutex<HashSet<String>>>;

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Lifecycle state of one tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    Validating,
    AwaitingApproval,
    Scheduled,
    Executing,
    Success,
    Error,
    Cancelled,
}

impl ToolCallStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Error | Self::Cancelled)
    }
}

/// The user's answer to an approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationOutcome {
    /// Run this call.
    ProceedOnce,
    /// Run this call and every later call of the same tool.
    ProceedAlways,
    /// Do not run this call.
    Cancel,
}

/// A tool call and everything known about it so far.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedToolCall {
    pub request: ToolCallRequestInfo,
    pub status: ToolCallStatus,
    /// Present while (and after) the call needed approval.
    pub confirmation: Option<ConfirmationDetails>,
    /// The function-response parts sent back to the model.  Set once the
    /// call is terminal.
    pub response_parts: Vec<Part>,
    /// What to show the user for a finished call.
    pub result_display: Option<String>,
    /// Failure description for `error` calls.
    pub error: Option<String>,
    /// Whether the result has been handed back to the conversation.
    pub submitted: bool,
}

impl TrackedToolCall {
    fn new(request: ToolCallRequestInfo) -> Self {
        Self {
            request,
            status: ToolCallStatus::Validating,
            confirmation: None,
            response_parts: Vec::new(),
            result_display: None,
            error: None,
            submitted: false,
        }
    }

    pub fn call_id(&self) -> &str {
        &self.request.call_id
    }

    pub fn name(&self) -> &str {
        &self.request.name
    }

    fn respond(&mut self, status: ToolCallStatus, response: Value) {
        self.status = status;
        self.response_parts = vec![Part::function_response(
            self.request.call_id.clone(),
            self.request.name.clone(),
            response,
        )];
    }

    fn succeed(&mut self, result: ToolResult) {
        self.respond(ToolCallStatus::Success, json!({ "output": result.llm_content }));
        self.result_display = Some(result.return_display);
    }

    fn fail(&mut self, message: String) {
        self.respond(ToolCallStatus::Error, json!({ "error": message }));
        self.result_display = Some(message.clone());
        self.error = Some(message);
    }

    fn cancel(&mut self, reason: &str) {
        let message = format!("[Operation Cancelled] Reason: {reason}");
        self.respond(ToolCallStatus::Cancelled, json!({ "error": message }));
        self.result_display = Some(message);
    }
}

/// Coarse state of the session, derived for the user interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamingState {
    Idle,
    Responding,
    WaitingForConfirmation,
}

/// Derive the streaming state from the turn flag and the tracked calls.
pub fn streaming_state(is_responding: bool, calls: &[TrackedToolCall]) -> StreamingState {
    if calls
        .iter()
        .any(|c| c.status == ToolCallStatus::AwaitingApproval)
    {
        return StreamingState::WaitingForConfirmation;
    }
    let tools_busy = calls.iter().any(|c| {
        !c.status.is_terminal() || (!c.submitted && !c.request.is_client_initiated)
    });
    if is_responding || tools_busy {
        StreamingState::Responding
    } else {
        StreamingState::Idle
    }
}

// ---------------------------------------------------------------------------
// Host
// ---------------------------------------------------------------------------

/// What the scheduler needs from whoever drives it.
#[async_trait]
pub trait SchedulerHost: Send + Sync {
    /// Called after every status change with a snapshot of the batch.
    fn on_update(&self, _calls: &[TrackedToolCall]) {}

    /// Called exactly once per batch, after every call is terminal.
    fn on_batch_complete(&self, _calls: &[TrackedToolCall]) {}

    /// Ask the user whether a call may run.
    async fn request_approval(
        &self,
        call: &ToolCallRequestInfo,
        details: &ConfirmationDetails,
    ) -> ConfirmationOutcome;
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Scheduler options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Maximum number of calls executing at once.
    pub max_concurrency: usize,
    /// Approve every call without asking.
    pub auto_approve: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            auto_approve: false,
        }
    }
}

enum ExecOutcome {
    Success(ToolResult),
    Failed(String),
    Cancelled,
}

/// Owns the lifecycle of tool calls for one session.
pub struct ToolScheduler {
    registry: Arc<ToolRegistry>,
    semaphore: Arc<Semaphore>,
    config: SchedulerConfig,
    checkpointer: Option<Checkpointer>,
    always_allowed: Mutex<HashSet<String>>,
    processed_memory_ids: ProcessedCallIds,
    calls: Mutex<Vec<TrackedToolCall>>,
}

impl ToolScheduler {
    pub fn new(
        registry: Arc<ToolRegistry>,
        config: SchedulerConfig,
        processed_memory_ids: ProcessedCallIds,
    ) -> Self {
        Self {
            registry,
            semaphore: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            config,
            checkpointer: None,
            always_allowed: Mutex::new(HashSet::new()),
            processed_memory_ids,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Record recovery checkpoints before file-mutating calls.
    pub fn with_checkpointer(mut self, checkpointer: Checkpointer) -> Self {
        self.checkpointer = Some(checkpointer);
        self
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Snapshot of the current batch.
    pub fn pending(&self) -> Vec<TrackedToolCall> {
        self.lock_calls().clone()
    }

    /// Flag calls as handed back to the conversation.
    pub fn mark_submitted(&self, call_ids: &[String]) {
        let mut calls = self.lock_calls();
        for call in calls.iter_mut() {
            if call_ids.iter().any(|id| id == call.call_id()) {
                call.submitted = true;
            }
        }
    }

    fn lock_calls(&self) -> std::sync::MutexGuard<'_, Vec<TrackedToolCall>> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update<F>(&self, index: usize, host: &dyn SchedulerHost, f: F)
    where
        F: FnOnce(&mut TrackedToolCall),
    {
        let snapshot = {
            let mut calls = self.lock_calls();
            if let Some(call) = calls.get_mut(index) {
                f(call);
                tracing::debug!(call_id = %call.call_id(), tool = %call.name(), status = ?call.status, "tool call updated");
            }
            calls.clone()
        };
        host.on_update(&snapshot);
    }

    fn status_of(&self, index: usize) -> Option<ToolCallStatus> {
        self.lock_calls().get(index).map(|c| c.status)
    }

    fn is_always_allowed(&self, name: &str) -> bool {
        self.always_allowed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(name)
    }

    /// Run a batch to completion and return its terminal calls, in request
    /// order.
    ///
    /// `history` is the conversation at the time of the request; it is stored
    /// in recovery checkpoints.
    pub async fn schedule(
        &self,
        requests: Vec<ToolCallRequestInfo>,
        history: &[Content],
        cancel: &CancellationToken,
        host: &dyn SchedulerHost,
    ) -> Vec<TrackedToolCall> {
        if requests.is_empty() {
            return Vec::new();
        }

        tracing::info!(count = requests.len(), "scheduling tool calls");
        {
            let snapshot: Vec<_> = requests.into_iter().map(TrackedToolCall::new).collect();
            *self.lock_calls() = snapshot.clone();
            host.on_update(&snapshot);
        }

        let count = self.lock_calls().len();
        let mut runnable: Vec<(usize, Arc<dyn Tool>, Map<String, Value>)> = Vec::new();
        for index in 0..count {
            if let Some(tool) = self.validate(index, history, cancel, host).await {
                let args = self.lock_calls()[index].request.args.clone();
                runnable.push((index, tool, args));
            }
        }

        self.execute(runnable, cancel, host).await;

        let batch = self.pending();
        host.on_batch_complete(&batch);
        batch
    }

    /// Move one call from `validating` to `scheduled`, or to a terminal
    /// state.  Returns the tool when the call may run.
    async fn validate(
        &self,
        index: usize,
        history: &[Content],
        cancel: &CancellationToken,
        host: &dyn SchedulerHost,
    ) -> Option<Arc<dyn Tool>> {
        let request = self.lock_calls()[index].request.clone();

        if cancel.is_cancelled() {
            self.update(index, host, |c| c.cancel("User cancelled tool execution."));
            return None;
        }

        let Some(tool) = self.registry.get(&request.name) else {
            tracing::warn!(tool = %request.name, "model requested an unknown tool");
            let message = format!("Tool \"{}\" not found in registry.", request.name);
            self.update(index, host, |c| c.fail(message));
            return None;
        };

        let details = match tool.should_confirm_execute(&request.args, cancel).await {
            Ok(details) => details,
            Err(e) => {
                self.update(index, host, |c| c.fail(e.to_string()));
                return None;
            }
        };

        let Some(details) = details else {
            self.update(index, host, |c| c.status = ToolCallStatus::Scheduled);
            return Some(tool);
        };

        if tool.modifies_files() {
            if let Some(checkpointer) = &self.checkpointer {
                checkpointer.checkpoint(&request, history).await;
            }
        }

        if self.config.auto_approve || self.is_always_allowed(&request.name) {
            self.update(index, host, |c| {
                c.confirmation = Some(details);
                c.status = ToolCallStatus::Scheduled;
            });
            return Some(tool);
        }

        self.update(index, host, |c| {
            c.confirmation = Some(details.clone());
            c.status = ToolCallStatus::AwaitingApproval;
        });

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            outcome = host.request_approval(&request, &details) => Some(outcome),
        };

        match outcome {
            None => {
                self.update(index, host, |c| c.cancel("User cancelled tool execution."));
                None
            }
            Some(ConfirmationOutcome::Cancel) => {
                tracing::info!(call_id = %request.call_id, tool = %request.name, "tool call rejected by user");
                self.update(index, host, |c| c.cancel("User did not allow tool call"));
                None
            }
            Some(outcome) => {
                if outcome == ConfirmationOutcome::ProceedAlways {
                    self.always_allowed
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .insert(request.name.clone());
                }
                self.update(index, host, |c| c.status = ToolCallStatus::Scheduled);
                Some(tool)
            }
        }
    }

    /// Execute scheduled calls concurrently and wait for all of them.
    async fn execute(
        &self,
        runnable: Vec<(usize, Arc<dyn Tool>, Map<String, Value>)>,
        cancel: &CancellationToken,
        host: &dyn SchedulerHost,
    ) {
        let (started_tx, mut started_rx) = mpsc::unbounded_channel::<usize>();
        let mut running: FuturesUnordered<BoxFuture<'static, (usize, ExecOutcome)>> =
            FuturesUnordered::new();

        for (index, tool, args) in runnable {
            running.push(Box::pin(execute_call(
                index,
                tool,
                args,
                cancel.clone(),
                self.semaphore.clone(),
                started_tx.clone(),
            )));
        }
        drop(started_tx);

        while !running.is_empty() {
            tokio::select! {
                biased;
                Some(index) = started_rx.recv() => {
                    if self.status_of(index) == Some(ToolCallStatus::Scheduled) {
                        self.update(index, host, |c| c.status = ToolCallStatus::Executing);
                    }
                }
                Some((index, outcome)) = running.next() => {
                    let ran = !matches!(outcome, ExecOutcome::Cancelled);
                    if ran && self.status_of(index) == Some(ToolCallStatus::Scheduled) {
                        self.update(index, host, |c| c.status = ToolCallStatus::Executing);
                    }
                    self.update(index, host, |c| match outcome {
                        ExecOutcome::Success(result) => c.succeed(result),
                        ExecOutcome::Failed(message) => c.fail(message),
                        ExecOutcome::Cancelled => c.cancel("User cancelled tool execution."),
                    });
                }
            }
        }
    }
}

async fn execute_call(
    index: usize,
    tool: Arc<dyn Tool>,
    args: Map<String, Value>,
    cancel: CancellationToken,
    semaphore: Arc<Semaphore>,
    started: mpsc::UnboundedSender<usize>,
) -> (usize, ExecOutcome) {
    let permit = tokio::select! {
        biased;
        _ = cancel.cancelled() => return (index, ExecOutcome::Cancelled),
        permit = semaphore.acquire_owned() => permit,
    };
    let Ok(_permit) = permit else {
        return (index, ExecOutcome::Failed("tool scheduler is shut down".into()));
    };
    let _ = started.send(index);

    let name = tool.name().to_owned();
    let task_cancel = cancel.clone();
    let mut handle = tokio::spawn(async move { tool.execute(&args, &task_cancel).await });

    let outcome = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            handle.abort();
            ExecOutcome::Cancelled
        }
        joined = &mut handle => match joined {
            Ok(Ok(result)) => ExecOutcome::Success(result),
            Ok(Err(e)) => {
                tracing::warn!(tool = %name, error = %e, "tool execution failed");
                ExecOutcome::Failed(e.to_string())
            }
            Err(e) => {
                tracing::error!(tool = %name, error = %e, "tool task panicked");
                ExecOutcome::Failed(format!("tool `{name}` crashed: {e}"))
            }
        },
    };
    (index, outcome)
}

// ---------------------------------------------------------------------------
// Continuation planning
// ---------------------------------------------------------------------------

/// What to do with a completed batch.
#[derive(Debug, Clone, PartialEq)]
pub enum ContinuationAction {
    /// Nothing to send back.
    None,
    /// Every model call was cancelled: record the cancelled responses in
    /// history without calling the backend.
    AppendCancelled(Content),
    /// Send the merged responses to the model as a new turn.
    Continue { parts: Vec<Part>, prompt_id: String },
    /// The session fell back to another model after a quota error.  The
    /// responses are recorded in history but no turn is started.
    SuppressedByQuotaFallback(Content),
}

/// The decision for one batch.
#[derive(Debug, Clone, PartialEq)]
pub struct ContinuationPlan {
    /// Run the memory refresh side effect.
    pub refresh_memory: bool,
    /// Memory call ids that triggered it.
    pub memory_call_ids: Vec<String>,
    /// Calls to flag as submitted.
    pub submitted_call_ids: Vec<String>,
    pub action: ContinuationAction,
}

/// Decide what happens after a batch completes.
///
/// Pure: `processed_memory_ids` is only read; the caller records
/// [`ContinuationPlan::memory_call_ids`].
pub fn plan_continuation(
    batch: &[TrackedToolCall],
    processed_memory_ids: &HashSet<String>,
    model_switched: bool,
) -> ContinuationPlan {
    let finished: Vec<&TrackedToolCall> = batch
        .iter()
        .filter(|c| c.status.is_terminal() && !c.submitted)
        .collect();

    let memory_call_ids: Vec<String> = finished
        .iter()
        .filter(|c| {
            c.name() == MEMORY_TOOL_NAME
                && c.status == ToolCallStatus::Success
                && !processed_memory_ids.contains(c.call_id())
        })
        .map(|c| c.call_id().to_owned())
        .collect();

    let (client, model): (Vec<&TrackedToolCall>, Vec<&TrackedToolCall>) = finished
        .into_iter()
        .partition(|c| c.request.is_client_initiated);

    let mut submitted_call_ids: Vec<String> =
        client.iter().map(|c| c.call_id().to_owned()).collect();

    let action = if model.is_empty() {
        ContinuationAction::None
    } else {
        submitted_call_ids.extend(model.iter().map(|c| c.call_id().to_owned()));
        let parts = merge_part_lists(model.iter().map(|c| c.response_parts.clone()));

        if model.iter().all(|c| c.status == ToolCallStatus::Cancelled) {
            ContinuationAction::AppendCancelled(Content::user(parts))
        } else if model_switched {
            ContinuationAction::SuppressedByQuotaFallback(Content::user(parts))
        } else {
            ContinuationAction::Continue {
                parts,
                prompt_id: model[0].request.prompt_id.clone(),
            }
        }
    };

    ContinuationPlan {
        refresh_memory: !memory_call_ids.is_empty(),
        memory_call_ids,
        submitted_call_ids,
        action,
    }
}

impl ToolScheduler {
    /// Plan the continuation for `batch`, recording memory call ids in the
    /// session's processed set.
    pub fn plan(&self, batch: &[TrackedToolCall], model_switched: bool) -> ContinuationPlan {
        let mut processed = self
            .processed_memory_ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let plan = plan_continuation(batch, &processed, model_switched);
        processed.extend(plan.memory_call_ids.iter().cloned());
        plan
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

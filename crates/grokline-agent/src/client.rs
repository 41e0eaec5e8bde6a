//! Turn entry point: session turn ceiling, history compression and one
//! [`Turn`] per call.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::chat::GrokChat;
use crate::compaction::{CompressionConfig, try_compress};
use crate::error::Result;
use crate::llm::types::Part;
use crate::reporting::ErrorReporter;
use crate::turn::{Turn, TurnEvent, TurnOutcome};

/// A finished turn: how it ended and the tool calls it requested.
pub struct TurnReport {
    pub outcome: TurnOutcome,
    pub turn: Option<Turn>,
}

impl TurnReport {
    /// Whether the turn never started because the turn ceiling was hit.
    pub fn hit_turn_limit(&self) -> bool {
        self.turn.is_none()
    }
}

/// Sends messages to the model on behalf of a session.
pub struct AgentClient {
    chat: Arc<GrokChat>,
    reporter: Arc<dyn ErrorReporter>,
    compression: CompressionConfig,
    turn_limit: Option<u32>,
    session_turns: AtomicU32,
}

impl AgentClient {
    pub fn new(chat: Arc<GrokChat>, reporter: Arc<dyn ErrorReporter>) -> Self {
        Self {
            chat,
            reporter,
            compression: CompressionConfig::default(),
            turn_limit: None,
            session_turns: AtomicU32::new(0),
        }
    }

    pub fn with_compression(mut self, compression: CompressionConfig) -> Self {
        self.compression = compression;
        self
    }

    /// Cap the number of turns in the session.  `None` means unlimited.
    pub fn with_turn_limit(mut self, limit: Option<u32>) -> Self {
        self.turn_limit = limit;
        self
    }

    pub fn chat(&self) -> &Arc<GrokChat> {
        &self.chat
    }

    /// Turns started so far, including the one refused by the ceiling.
    pub fn session_turns(&self) -> u32 {
        self.session_turns.load(Ordering::SeqCst)
    }

    /// Run one turn for `parts`.  Continuations skip compression, so their
    /// request is the prior history plus the tool results.
    ///
    /// # Errors
    ///
    /// Propagates authorization failures from the turn.
    pub async fn send_message_stream<F>(
        &self,
        parts: Vec<Part>,
        cancel: &CancellationToken,
        prompt_id: &str,
        continuation: bool,
        on_event: &mut F,
    ) -> Result<TurnReport>
    where
        F: FnMut(TurnEvent),
    {
        let turns = self.session_turns.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(limit) = self.turn_limit {
            if turns > limit {
                info!(turns, limit, "session turn limit reached");
                on_event(TurnEvent::MaxSessionTurns);
                return Ok(TurnReport {
                    outcome: TurnOutcome::Completed,
                    turn: None,
                });
            }
        }

        if !continuation {
            match try_compress(&self.chat, &self.compression, false).await {
                Ok(Some(info)) => on_event(TurnEvent::ChatCompressed(info)),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "history compression failed, continuing uncompressed"),
            }
        }

        let mut turn = Turn::new(self.chat.clone(), self.reporter.clone(), prompt_id);
        let outcome = turn.run(parts, cancel, on_event).await?;
        Ok(TurnReport {
            outcome,
            turn: Some(turn),
        })
    }

    /// Compress history now, regardless of its size.
    pub async fn compress_now(&self) -> Result<Option<crate::turn::ChatCompressionInfo>> {
        try_compress(&self.chat, &self.compression, true).await
    }
}

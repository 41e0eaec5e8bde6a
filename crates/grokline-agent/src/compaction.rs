//! History compression -- summarize the older part of a conversation when it
//! approaches the model's context window.
//!
//! When the estimated token count of the history exceeds
//! [`CompressionConfig::threshold`] of the model's limit:
//!
//! 1. The history is split so that roughly
//!    [`CompressionConfig::preserve_fraction`] of it (by size) is kept
//!    verbatim.  The split always lands on a user entry that is not a tool
//!    response, so a function call is never separated from its result.  A
//!    trailing model entry with unanswered function calls is always kept.
//! 2. The older part is summarized with one non-streaming request.
//! 3. The history becomes `[summary, acknowledgement, ...kept]`.

use tracing::{debug, info};

use crate::chat::GrokChat;
use crate::config::{SessionConfig, token_limit};
use crate::error::{AgentError, Result};
use crate::llm::types::{Content, GenerationRequest, Part, Role};
use crate::turn::ChatCompressionInfo;

const SUMMARY_SYSTEM_INSTRUCTION: &str = "You compress conversation histories between a user and \
a coding agent. Produce a dense, factual summary that lets the agent continue the work without \
the original messages: the user's overall goal, key decisions, important file paths and code \
facts, results of tool calls, and the current plan with its next step. Omit pleasantries.";

const SUMMARY_REQUEST: &str =
    "Summarize the conversation so far following your instructions. Output only the summary.";

const SUMMARY_ACKNOWLEDGEMENT: &str = "Got it. Thanks for the additional context!";

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// When and how much to compress.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompressionConfig {
    /// Fraction of the model token limit that triggers compression.
    pub threshold: f64,
    /// Fraction of the history, by size, kept verbatim.
    pub preserve_fraction: f64,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            threshold: 0.7,
            preserve_fraction: 0.3,
        }
    }
}

impl From<&SessionConfig> for CompressionConfig {
    fn from(config: &SessionConfig) -> Self {
        Self {
            threshold: config.compression_threshold,
            preserve_fraction: config.compression_preserve_fraction,
        }
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Compress the chat history if it is over the threshold, or always when
/// `force` is set.
///
/// Returns `Ok(None)` when nothing was done.
///
/// # Errors
///
/// Returns an error if token counting or the summarization request fails.
/// The history is left untouched in that case.
pub async fn try_compress(
    chat: &GrokChat,
    config: &CompressionConfig,
    force: bool,
) -> Result<Option<ChatCompressionInfo>> {
    let history = chat.history();
    if history.is_empty() {
        return Ok(None);
    }

    let model = chat.model();
    let original_token_count = chat.generator().count_tokens(&history).await?;
    let limit = f64::from(token_limit(&model));
    if !force && f64::from(original_token_count) <= config.threshold * limit {
        debug!(tokens = original_token_count, model = %model, "history below compression threshold");
        return Ok(None);
    }

    let split = find_split_point(&history, 1.0 - config.preserve_fraction);
    if split == 0 {
        debug!("no compressible prefix in history");
        return Ok(None);
    }
    let (older, kept) = history.split_at(split);

    info!(
        tokens = original_token_count,
        compressed = older.len(),
        kept = kept.len(),
        "compressing chat history"
    );

    let summary = summarize(chat, &model, older).await?;

    let mut compressed = Vec::with_capacity(kept.len() + 2);
    compressed.push(Content::user(vec![Part::text(summary)]));
    compressed.push(Content::model(vec![Part::text(SUMMARY_ACKNOWLEDGEMENT)]));
    compressed.extend_from_slice(kept);

    let new_token_count = chat.generator().count_tokens(&compressed).await?;
    chat.replace_history(compressed);

    info!(
        original = original_token_count,
        new = new_token_count,
        "compression complete"
    );

    Ok(Some(ChatCompressionInfo {
        original_token_count,
        new_token_count,
    }))
}

/// Index at which the kept tail of `history` starts.
///
/// The first `fraction` of the history (by serialized size) is compressed;
/// the split then moves forward past model entries and tool responses.  When
/// that would swallow a trailing model entry holding function calls, the
/// split moves back to the user entry that started the exchange.
pub fn find_split_point(history: &[Content], fraction: f64) -> usize {
    let sizes: Vec<usize> = history
        .iter()
        .map(|c| serde_json::to_string(c).map(|s| s.len()).unwrap_or(0))
        .collect();
    let total: usize = sizes.iter().sum();
    let target = total as f64 * fraction;

    let mut index = history.len();
    let mut cumulative = 0usize;
    for (i, size) in sizes.iter().enumerate() {
        if cumulative as f64 >= target {
            index = i;
            break;
        }
        cumulative += size;
    }

    while index < history.len() && !is_clean_user_entry(&history[index]) {
        index += 1;
    }
    if index == history.len() && history.last().is_some_and(has_function_calls) {
        index = history.iter().rposition(is_clean_user_entry).unwrap_or(0);
    }
    index
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

fn is_clean_user_entry(content: &Content) -> bool {
    content.role == Role::User
        && !matches!(content.parts.first(), Some(Part::FunctionResponse(_)))
}

fn has_function_calls(content: &Content) -> bool {
    content.role == Role::Model
        && content
            .parts
            .iter()
            .any(|p| matches!(p, Part::FunctionCall(_)))
}

async fn summarize(chat: &GrokChat, model: &str, older: &[Content]) -> Result<String> {
    let mut contents = older.to_vec();
    contents.push(Content::user(vec![Part::text(SUMMARY_REQUEST)]));

    let mut request = GenerationRequest::new(model, contents);
    request.system_instruction = Some(SUMMARY_SYSTEM_INSTRUCTION.to_owned());

    debug!(model = %model, "requesting history summary");
    let response = chat.generator().generate(&request).await?;
    let summary = response.text();
    if summary.trim().is_empty() {
        return Err(AgentError::Internal(
            "summarization request returned no text".to_owned(),
        ));
    }
    Ok(summary)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Conversation state for one session.
//!
//! [`GrokChat`] owns the history and everything needed to turn it into a
//! generation request.  History only grows through [`GrokChat::add_history`]
//! and [`GrokChat::record_exchange`]; [`GrokChat::replace_history`] exists
//! for compression alone.

use std::sync::{Arc, PoisonError, RwLock};

use crate::error::Result;
use crate::llm::generator::{ContentGenerator, ResponseStream};
use crate::llm::types::{
    Content, FunctionDeclaration, GenerationConfig, GenerationRequest, Part,
};

/// History owner and request builder.
pub struct GrokChat {
    generator: Arc<dyn ContentGenerator>,
    history: RwLock<Vec<Content>>,
    model: RwLock<String>,
    tools: RwLock<Vec<FunctionDeclaration>>,
    config: GenerationConfig,
    system_instruction: RwLock<Option<String>>,
}

impl std::fmt::Debug for GrokChat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrokChat")
            .field("model", &self.model())
            .field("history_len", &self.history_len())
            .finish_non_exhaustive()
    }
}

impl GrokChat {
    /// Create an empty conversation.
    pub fn new(
        generator: Arc<dyn ContentGenerator>,
        model: impl Into<String>,
        config: GenerationConfig,
    ) -> Self {
        Self {
            generator,
            history: RwLock::new(Vec::new()),
            model: RwLock::new(model.into()),
            tools: RwLock::new(Vec::new()),
            config,
            system_instruction: RwLock::new(None),
        }
    }

    /// Set the system instruction sent ahead of every request.
    pub fn with_system_instruction(self, instruction: Option<String>) -> Self {
        self.set_system_instruction(instruction);
        self
    }

    /// Replace the system instruction, e.g. after long-term memory changed.
    pub fn set_system_instruction(&self, instruction: Option<String>) {
        *self
            .system_instruction
            .write()
            .unwrap_or_else(PoisonError::into_inner) = instruction.filter(|s| !s.is_empty());
    }

    pub fn system_instruction(&self) -> Option<String> {
        self.system_instruction
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Seed the conversation with existing history.
    pub fn with_history(self, history: Vec<Content>) -> Self {
        self.replace_history(history);
        self
    }

    // -- Model ---------------------------------------------------------------

    /// The model id used for the next request.
    pub fn model(&self) -> String {
        self.model
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Switch models for all subsequent requests.
    pub fn set_model(&self, model: impl Into<String>) {
        let model = model.into();
        tracing::info!(model = %model, "switching model");
        *self.model.write().unwrap_or_else(PoisonError::into_inner) = model;
    }

    /// The generator requests are sent through.
    pub fn generator(&self) -> &Arc<dyn ContentGenerator> {
        &self.generator
    }

    /// Replace the tools offered to the model.
    pub fn set_tools(&self, tools: Vec<FunctionDeclaration>) {
        *self.tools.write().unwrap_or_else(PoisonError::into_inner) = tools;
    }

    // -- History -------------------------------------------------------------

    /// A snapshot of the history, oldest first.
    pub fn history(&self) -> Vec<Content> {
        self.history
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of history entries.
    pub fn history_len(&self) -> usize {
        self.history
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Append one entry.
    pub fn add_history(&self, content: Content) {
        self.history
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(content);
    }

    /// Replace the whole history.  Used by compression.
    pub fn replace_history(&self, history: Vec<Content>) {
        *self.history.write().unwrap_or_else(PoisonError::into_inner) = history;
    }

    /// Append a completed exchange: the user message and, when the model
    /// produced anything, one model entry.  Thought parts are dropped and
    /// adjacent text parts are merged into one.
    pub fn record_exchange(&self, user: Content, model_parts: Vec<Part>) {
        let model_parts = consolidate_parts(model_parts);
        let mut history = self.history.write().unwrap_or_else(PoisonError::into_inner);
        history.push(user);
        if !model_parts.is_empty() {
            history.push(Content::model(model_parts));
        }
    }

    // -- Requests ------------------------------------------------------------

    /// Build a request for the current history followed by `message`.
    pub fn build_request(&self, message: &Content) -> GenerationRequest {
        let mut contents = self.history();
        contents.push(message.clone());
        GenerationRequest {
            model: self.model(),
            contents,
            system_instruction: self.system_instruction(),
            tools: self
                .tools
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
            config: self.config.clone(),
        }
    }

    /// Open a streaming generation for `message` on top of the history.
    /// The history is not modified; the caller records the exchange once the
    /// turn completes.
    pub async fn send_message_stream(&self, message: &Content) -> Result<ResponseStream> {
        let request = self.build_request(message);
        tracing::debug!(
            model = %request.model,
            history_len = request.contents.len() - 1,
            "opening stream"
        );
        self.generator.generate_stream(&request).await
    }
}

/// Drop thought parts and merge runs of adjacent text parts.
fn consolidate_parts(parts: Vec<Part>) -> Vec<Part> {
    let mut out: Vec<Part> = Vec::with_capacity(parts.len());
    for part in parts {
        if part.is_thought() {
            continue;
        }
        if let Part::Text { text, .. } = &part {
            if let Some(Part::Text { text: existing, .. }) = out.last_mut() {
                existing.push_str(text);
                continue;
            }
        }
        out.push(part);
    }
    out.retain(|p| !matches!(p, Part::Text { text, .. } if text.is_empty()));
    out
}

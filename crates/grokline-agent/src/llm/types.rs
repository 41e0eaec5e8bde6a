//! Canonical conversation model.
//!
//! These types model the data flowing between the turn engine, the tool
//! scheduler and the provider adapter.  They are backend-agnostic at this
//! layer; the [`super::convert`] module translates them into the wire format
//! of a specific backend.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// Content
// ---------------------------------------------------------------------------

/// The author of a history entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Input from the human user, including tool responses fed back.
    User,
    /// Output from the language model.
    Model,
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    /// Call id assigned by the backend, when it supplied one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Name of the tool to invoke.
    pub name: String,
    /// Arguments keyed by parameter name.
    #[serde(default)]
    pub args: Map<String, Value>,
}

/// The result of a tool invocation, addressed back to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionResponse {
    /// The [`FunctionCall::id`] this response answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Name of the tool that produced the response.
    pub name: String,
    /// Structured response payload.
    pub response: Value,
}

/// Binary payload attached to a message (images).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    /// MIME type, e.g. `image/png`.
    pub mime_type: String,
    /// Raw bytes, base64-encoded when serialized.
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

/// One element of a [`Content`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Part {
    /// Plain text.  `thought` marks reasoning output.
    Text {
        text: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        thought: bool,
    },
    /// Inline binary data.
    InlineData(InlineData),
    /// A tool invocation requested by the model.
    FunctionCall(FunctionCall),
    /// A tool result fed back to the model.
    FunctionResponse(FunctionResponse),
}

impl Part {
    /// Create a plain text part.
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text {
            text: text.into(),
            thought: false,
        }
    }

    /// Create a reasoning (thought) text part.
    pub fn thought(text: impl Into<String>) -> Self {
        Self::Text {
            text: text.into(),
            thought: true,
        }
    }

    /// Create a function response part.
    pub fn function_response(
        id: impl Into<String>,
        name: impl Into<String>,
        response: Value,
    ) -> Self {
        Self::FunctionResponse(FunctionResponse {
            id: Some(id.into()),
            name: name.into(),
            response,
        })
    }

    /// Whether this part carries reasoning output.
    pub fn is_thought(&self) -> bool {
        matches!(self, Self::Text { thought: true, .. })
    }

    /// Returns the text of a text part.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text, .. } => Some(text),
            _ => None,
        }
    }
}

/// One turn of conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Content {
    /// Who produced this entry.
    pub role: Role,
    /// Ordered parts.
    pub parts: Vec<Part>,
}

impl Content {
    /// Create a user-role entry.
    pub fn user(parts: Vec<Part>) -> Self {
        Self {
            role: Role::User,
            parts,
        }
    }

    /// Create a model-role entry.
    pub fn model(parts: Vec<Part>) -> Self {
        Self {
            role: Role::Model,
            parts,
        }
    }
}

// ---------------------------------------------------------------------------
// Part-list merging
// ---------------------------------------------------------------------------

/// A fragment that contributes parts to a message: a bare string, a single
/// part, or an ordered list of parts.
#[derive(Debug, Clone, PartialEq)]
pub enum PartList {
    Text(String),
    Single(Part),
    Many(Vec<Part>),
}

impl From<&str> for PartList {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

impl From<String> for PartList {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Part> for PartList {
    fn from(value: Part) -> Self {
        Self::Single(value)
    }
}

impl From<Vec<Part>> for PartList {
    fn from(value: Vec<Part>) -> Self {
        Self::Many(value)
    }
}

impl PartList {
    /// Flatten into an ordered list of parts.
    pub fn into_parts(self) -> Vec<Part> {
        match self {
            Self::Text(text) => vec![Part::text(text)],
            Self::Single(part) => vec![part],
            Self::Many(parts) => parts,
        }
    }
}

/// Merge several fragment lists into one ordered part list.
///
/// Nested lists are flattened in place; relative order is preserved.
pub fn merge_part_lists<I, P>(lists: I) -> Vec<Part>
where
    I: IntoIterator<Item = P>,
    P: Into<PartList>,
{
    lists
        .into_iter()
        .flat_map(|list| list.into().into_parts())
        .collect()
}

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// A tool declaration exposed to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDeclaration {
    /// Unique tool name.
    pub name: String,
    /// Human-readable description of what the tool does.
    #[serde(default)]
    pub description: String,
    /// JSON-schema-like parameter specification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

/// Sampling and output options for one generation call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_format: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<String>,
}

/// Canonical outbound payload for one generation call.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    /// Target model id.  Empty means "the generator's default model".
    pub model: String,
    /// Full conversation, oldest first.
    pub contents: Vec<Content>,
    /// Optional system instruction sent ahead of the conversation.
    pub system_instruction: Option<String>,
    /// Tools the model may call.
    pub tools: Vec<FunctionDeclaration>,
    /// Sampling options.
    pub config: GenerationConfig,
}

impl GenerationRequest {
    /// Create a request with default options and no tools.
    pub fn new(model: impl Into<String>, contents: Vec<Content>) -> Self {
        Self {
            model: model.into(),
            contents,
            system_instruction: None,
            tools: Vec::new(),
            config: GenerationConfig::default(),
        }
    }
}

/// Payload for an embedding call.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbedRequest {
    pub model: String,
    pub texts: Vec<String>,
}

/// Result of an embedding call.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbedResponse {
    pub embeddings: Vec<Vec<f32>>,
}

// ---------------------------------------------------------------------------
// Response
// ---------------------------------------------------------------------------

/// Why the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FinishReason {
    Stop,
    MaxTokens,
    Safety,
    Other,
}

impl FinishReason {
    /// Map a backend-native finish reason.  Unrecognized values map to
    /// [`FinishReason::Other`].
    pub fn from_backend(reason: &str) -> Self {
        match reason {
            "stop" => Self::Stop,
            "length" => Self::MaxTokens,
            "content_filter" => Self::Safety,
            _ => Self::Other,
        }
    }
}

/// Token accounting for one call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageMetadata {
    pub prompt_token_count: u32,
    pub candidates_token_count: u32,
    pub total_token_count: u32,
}

/// One alternative produced by the model.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    /// Model-role content.
    pub content: Content,
    /// Present once the backend reported why generation stopped.
    pub finish_reason: Option<FinishReason>,
}

/// Canonical inbound result of a generation call (or one streamed chunk).
///
/// Text, function calls and inline data are derived from the first
/// candidate's parts on every access; nothing is cached.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationResponse {
    pub candidates: Vec<Candidate>,
    pub usage_metadata: UsageMetadata,
}

impl GenerationResponse {
    /// Parts of the first candidate, or an empty slice.
    pub fn parts(&self) -> &[Part] {
        self.candidates
            .first()
            .map(|c| c.content.parts.as_slice())
            .unwrap_or(&[])
    }

    /// Concatenated non-thought text of the first candidate.
    pub fn text(&self) -> String {
        self.parts()
            .iter()
            .filter_map(|p| match p {
                Part::Text {
                    text,
                    thought: false,
                } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Concatenated reasoning text of the first candidate.
    pub fn thought_text(&self) -> String {
        self.parts()
            .iter()
            .filter(|p| p.is_thought())
            .filter_map(Part::as_text)
            .collect()
    }

    /// Function calls of the first candidate, in order.
    pub fn function_calls(&self) -> Vec<&FunctionCall> {
        self.parts()
            .iter()
            .filter_map(|p| match p {
                Part::FunctionCall(call) => Some(call),
                _ => None,
            })
            .collect()
    }

    /// Inline data of the first candidate, in order.
    pub fn inline_data(&self) -> Vec<&InlineData> {
        self.parts()
            .iter()
            .filter_map(|p| match p {
                Part::InlineData(data) => Some(data),
                _ => None,
            })
            .collect()
    }

    /// Finish reason of the first candidate.
    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.candidates.first().and_then(|c| c.finish_reason)
    }
}

// ---------------------------------------------------------------------------
// Serde helpers
// ---------------------------------------------------------------------------

mod base64_bytes {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

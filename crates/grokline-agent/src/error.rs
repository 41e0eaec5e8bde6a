//! Agent error types.
//!
//! All agent subsystems surface errors through [`AgentError`].  Each variant
//! carries enough context for callers to decide how to handle the failure:
//! authorization failures must trigger re-authentication, quota failures
//! trigger a model fallback, and everything else is reported and surfaced as
//! an error event.

use serde::{Deserialize, Serialize};

/// HTTP status the backend uses for quota and rate-limit rejections.
pub const QUOTA_EXCEEDED_STATUS: u16 = 429;

/// Unified error type for the agent runtime.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    // -- Configuration errors ------------------------------------------------
    /// Configuration validation or loading failed.
    #[error("config error: {reason}")]
    Config { reason: String },

    /// The API key is missing for a provider that requires one.
    #[error("missing api key for provider: {provider}")]
    MissingApiKey { provider: String },

    // -- Backend errors ------------------------------------------------------
    /// The backend rejected the credential.
    #[error("unauthorized: {message}")]
    Unauthorized { message: String },

    /// The backend answered with a non-success HTTP status.
    #[error("api returned {status}: {message}")]
    Api { status: u16, message: String },

    /// The HTTP request could not be sent or its body could not be read.
    #[error("request failed: {reason}")]
    Request {
        reason: String,
        status: Option<u16>,
    },

    /// The streaming SSE connection was interrupted or produced invalid data.
    #[error("stream error: {reason}")]
    Stream { reason: String },

    /// A tool call carried argument JSON that could not be decoded.
    #[error("decode error: {reason}")]
    Decode { reason: String },

    /// The backend does not offer the requested capability.
    #[error("unsupported operation: {operation}")]
    UnsupportedOperation { operation: String },

    // -- Session errors ------------------------------------------------------
    /// A new query was submitted while another turn is still responding.
    #[error("a turn is already in progress")]
    Busy,

    /// The operation was cancelled by the user.
    #[error("operation cancelled")]
    Cancelled,

    // -- Tool errors ---------------------------------------------------------
    /// A tool call referenced by the model does not exist in the registry.
    #[error("unknown tool: {tool_name}")]
    UnknownTool { tool_name: String },

    /// A tool invocation failed.
    #[error("tool execution failed for `{tool_name}`: {reason}")]
    ToolExecution { tool_name: String, reason: String },

    // -- Upstream errors -----------------------------------------------------
    /// JSON serialization or deserialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A filesystem operation failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Catch-all for unexpected internal errors.  Prefer a typed variant
    /// whenever possible.
    #[error("internal agent error: {0}")]
    Internal(String),
}

/// Convenience alias used throughout the agent crate.
pub type Result<T> = std::result::Result<T, AgentError>;

impl AgentError {
    /// The HTTP status associated with this error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            Self::Request { status, .. } => *status,
            Self::Unauthorized { .. } => Some(401),
            _ => None,
        }
    }

    /// Whether the backend rejected the credential.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Unauthorized { .. })
    }

    /// Whether this is a quota or rate-limit rejection.
    pub fn is_quota_exceeded(&self) -> bool {
        self.status() == Some(QUOTA_EXCEEDED_STATUS)
    }
}

impl From<reqwest::Error> for AgentError {
    fn from(err: reqwest::Error) -> Self {
        Self::Request {
            status: err.status().map(|s| s.as_u16()),
            reason: err.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Caller-facing error shape
// ---------------------------------------------------------------------------

/// The normalized error shape surfaced to callers for backend failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuredError {
    /// Human-readable description.
    pub message: String,
    /// HTTP status, when the failure carried a numeric one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

impl StructuredError {
    /// Whether this error is a quota or rate-limit rejection.
    pub fn is_quota_exceeded(&self) -> bool {
        self.status == Some(QUOTA_EXCEEDED_STATUS)
    }
}

impl From<&AgentError> for StructuredError {
    fn from(err: &AgentError) -> Self {
        let message = match err {
            AgentError::Api { message, .. } => message.clone(),
            other => other.to_string(),
        };
        Self {
            message,
            status: err.status(),
        }
    }
}

impl std::fmt::Display for StructuredError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status {
            Some(status) => write!(f, "[{status}] {}", self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

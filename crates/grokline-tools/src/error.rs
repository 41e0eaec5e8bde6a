//! Tool error types.
//!
//! Built-in tools surface errors through [`ToolError`].  Each variant carries
//! the tool name so the message the model sees says which call failed.

use grokline_agent::AgentError;

/// Unified error type for the built-in tools.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    /// An I/O operation failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The arguments supplied to a tool are invalid.
    #[error("invalid parameters for tool `{tool_name}`: {reason}")]
    InvalidParams { tool_name: String, reason: String },

    /// A tool invocation failed.
    #[error("execution failed for tool `{tool_name}`: {reason}")]
    ExecutionFailed { tool_name: String, reason: String },

    /// JSON serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The call was cancelled before it finished.
    #[error("tool `{tool_name}` was cancelled")]
    Cancelled { tool_name: String },
}

/// Convenience alias used throughout the tools crate.
pub type Result<T> = std::result::Result<T, ToolError>;

impl From<ToolError> for AgentError {
    fn from(error: ToolError) -> Self {
        match error {
            ToolError::Cancelled { .. } => AgentError::Cancelled,
            ToolError::InvalidParams { tool_name, reason }
            | ToolError::ExecutionFailed { tool_name, reason } => {
                AgentError::ToolExecution { tool_name, reason }
            }
            ToolError::Io(e) => AgentError::Io(e),
            ToolError::Serialization(e) => AgentError::Json(e),
        }
    }
}

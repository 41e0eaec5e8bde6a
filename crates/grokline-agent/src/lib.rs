//! Agent runtime for GrokLine.
//!
//! This crate is the conversational core of the GrokLine terminal agent: it
//! streams model output turn by turn, runs the tools the model asks for and
//! feeds their results back until the model is done.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     ┌─────────────┐     ┌───────────────┐
//! │ AgentSession │────>│ AgentClient │────>│     Turn      │
//! │ (query loop) │     │ (ceiling,   │     │ (stream →     │
//! └──────┬───────┘     │  compaction)│     │  events)      │
//!        │             └─────────────┘     └───────┬───────┘
//!        │                                         │
//!  ┌─────┴─────────┐                       ┌───────┴────────┐
//!  │ ToolScheduler │                       │ ContentGenerator│
//!  │ (approve, run,│                       │ (xAI adapter)  │
//!  │  continue)    │                       └────────────────┘
//!  └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`llm`] -- Canonical model, generator trait and the xAI adapter.
//! - [`chat`] -- History owner and request builder.
//! - [`compaction`] -- History compression near the context limit.
//! - [`turn`] -- One streamed exchange and its events.
//! - [`client`] -- Turn entry with the session turn ceiling.
//! - [`tools`] -- Tool trait and registry.
//! - [`scheduler`] -- Tool call lifecycle and continuation planning.
//! - [`checkpoint`] -- Recovery records before file edits.
//! - [`session`] -- The caller-side driver.
//! - [`reporting`] -- Best-effort error reports.
//! - [`config`] -- Models, auth and session configuration.
//! - [`error`] -- Agent error types.

pub mod chat;
pub mod checkpoint;
pub mod client;
pub mod compaction;
pub mod config;
pub mod error;
pub mod llm;
pub mod reporting;
pub mod scheduler;
pub mod session;
pub mod tools;
pub mod turn;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export the most commonly used types at the crate root.
pub use chat::GrokChat;
pub use checkpoint::{Checkpointer, RecoveryRecord, SnapshotService};
pub use client::{AgentClient, TurnReport};
pub use compaction::{CompressionConfig, try_compress};
pub use config::{AuthType, GeneratorConfig, SessionConfig};
pub use error::{AgentError, Result, StructuredError};
pub use llm::{
    Content, ContentGenerator, FinishReason, FunctionCall, FunctionDeclaration, FunctionResponse,
    GenerationConfig, GenerationRequest, GenerationResponse, GrokContentGenerator, Part, Role,
};
pub use reporting::{ErrorReporter, FileErrorReporter, NoopReporter};
pub use scheduler::{
    ConfirmationOutcome, ContinuationAction, ContinuationPlan, SchedulerConfig, StreamingState,
    ToolCallStatus, ToolScheduler, TrackedToolCall, plan_continuation,
};
pub use session::{AgentSession, Query, SessionHost};
pub use tools::{ConfirmationDetails, Tool, ToolRegistry, ToolResult};
pub use turn::{ChatCompressionInfo, ThoughtSummary, ToolCallRequestInfo, Turn, TurnEvent, TurnOutcome};

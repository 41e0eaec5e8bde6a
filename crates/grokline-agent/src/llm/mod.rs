//! Model integration layer.
//!
//! - [`types`] -- Canonical conversation, request and response model.
//! - [`generator`] -- The [`ContentGenerator`] trait every backend implements.
//! - [`client`] -- HTTP generator for the xAI Chat Completions API.
//! - [`convert`] -- Canonical model <-> Chat Completions wire format.
//! - [`streaming`] -- SSE chunk decoder.

pub mod client;
pub mod convert;
pub mod generator;
pub mod streaming;
pub mod types;

pub use client::GrokContentGenerator;
pub use generator::{ContentGenerator, ResponseStream};
pub use types::{
    Candidate, Content, EmbedRequest, EmbedResponse, FinishReason, FunctionCall,
    FunctionDeclaration, FunctionResponse, GenerationConfig, GenerationRequest,
    GenerationResponse, InlineData, Part, PartList, Role, UsageMetadata, merge_part_lists,
};

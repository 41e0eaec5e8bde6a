//! The content-generation seam between the agent and a model backend.

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::Result;
use crate::llm::types::{
    Content, EmbedRequest, EmbedResponse, GenerationRequest, GenerationResponse,
};

/// A finite, non-restartable sequence of streamed response chunks.  A fresh
/// backend call is needed to start over.
pub type ResponseStream = BoxStream<'static, Result<GenerationResponse>>;

/// Abstraction over a model backend.
///
/// The HTTP implementation is [`super::client::GrokContentGenerator`]; tests
/// substitute scripted generators.
#[async_trait]
pub trait ContentGenerator: Send + Sync {
    /// Single-shot generation.
    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResponse>;

    /// Streaming generation.  Errors opening the stream are returned
    /// directly; errors while reading it arrive as stream items.
    async fn generate_stream(&self, request: &GenerationRequest) -> Result<ResponseStream>;

    /// Token count of `contents`.  May be an estimate.
    async fn count_tokens(&self, contents: &[Content]) -> Result<u32>;

    /// Compute embeddings.  Backends without embeddings return
    /// [`crate::AgentError::UnsupportedOperation`].
    async fn embed(&self, request: &EmbedRequest) -> Result<EmbedResponse>;
}

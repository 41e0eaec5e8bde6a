//! HTTP content generator for the xAI Chat Completions API.
//!
//! Supports both non-streaming and streaming (SSE) generation.  Wire-format
//! translation lives in [`super::convert`]; SSE decoding in
//! [`super::streaming`].

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::StatusCode;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue, USER_AGENT};
use serde_json::Value;
use url::Url;

use crate::config::GeneratorConfig;
use crate::error::{AgentError, Result};
use crate::llm::convert::{build_request_body, error_message_from_body, estimate_tokens, parse_response};
use crate::llm::generator::{ContentGenerator, ResponseStream};
use crate::llm::streaming::StreamDecoder;
use crate::llm::types::{
    Content, EmbedRequest, EmbedResponse, GenerationRequest, GenerationResponse,
};

/// Connect timeout.  Requests have no overall timeout; callers bound them
/// with cancellation.
const CONNECT_TIMEOUT_SECS: u64 = 30;

/// The `User-Agent` header value sent with every request.
pub fn user_agent() -> String {
    format!(
        "GrokLine/{} ({}; {})",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        std::env::consts::ARCH
    )
}

/// `<base_url>/chat/completions`, keeping any path prefix of the base.
fn chat_completions_url(base_url: &str) -> Result<Url> {
    let invalid = |e: url::ParseError| AgentError::Config {
        reason: format!("invalid API base URL `{base_url}`: {e}"),
    };
    let base = Url::parse(&format!("{}/", base_url.trim_end_matches('/'))).map_err(invalid)?;
    if !matches!(base.scheme(), "http" | "https") {
        return Err(AgentError::Config {
            reason: format!("API base URL `{base_url}` must use http or https"),
        });
    }
    base.join("chat/completions").map_err(invalid)
}

// ---------------------------------------------------------------------------
// Generator
// ---------------------------------------------------------------------------

/// [`ContentGenerator`] backed by the xAI HTTP API.
#[derive(Debug, Clone)]
pub struct GrokContentGenerator {
    config: Arc<GeneratorConfig>,
    endpoint: Url,
    http: reqwest::Client,
}

impl GrokContentGenerator {
    /// Create a generator.  Fails when the config carries no API key or an
    /// unusable base URL.
    pub fn new(config: GeneratorConfig) -> Result<Self> {
        if config.api_key.is_empty() {
            return Err(AgentError::MissingApiKey {
                provider: "xai".into(),
            });
        }
        let endpoint = chat_completions_url(&config.base_url)?;

        let http = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()
            .map_err(|e| AgentError::Request {
                reason: format!("failed to build HTTP client: {e}"),
                status: None,
            })?;

        Ok(Self {
            config: Arc::new(config),
            endpoint,
            http,
        })
    }

    /// The default model id.
    pub fn model(&self) -> &str {
        &self.config.model
    }

    fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        let auth_value = format!("Bearer {}", self.config.api_key);
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&auth_value).map_err(|e| AgentError::Config {
                reason: format!("invalid authorization header: {e}"),
            })?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&user_agent()).map_err(|e| AgentError::Config {
                reason: format!("invalid user agent header: {e}"),
            })?,
        );
        Ok(headers)
    }

    /// Send a request body and check the response status.
    async fn send(&self, body: &Value) -> Result<reqwest::Response> {
        let url = self.endpoint();
        tracing::debug!(url = %url, model = %body["model"], stream = %body["stream"], "sending generation request");

        let resp = self
            .http
            .post(url.clone())
            .headers(self.headers()?)
            .json(body)
            .send()
            .await?;

        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        let text = resp.text().await.unwrap_or_default();
        tracing::warn!(status = status.as_u16(), "generation request rejected");
        Err(error_for_status(status, &text))
    }
}

/// Map a non-success HTTP status to an error.
fn error_for_status(status: StatusCode, body: &str) -> AgentError {
    let message = error_message_from_body(body);
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => AgentError::Unauthorized { message },
        _ => AgentError::Api {
            status: status.as_u16(),
            message,
        },
    }
}

#[async_trait]
impl ContentGenerator for GrokContentGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResponse> {
        let body = build_request_body(request, &self.config.model, false);
        let resp = self.send(&body).await?;

        let text = resp.text().await.map_err(|e| AgentError::Request {
            reason: format!("failed to read response body: {e}"),
            status: None,
        })?;
        let v: Value = serde_json::from_str(&text).map_err(|e| AgentError::Stream {
            reason: format!("invalid JSON response: {e}"),
        })?;

        let response = parse_response(&v)?;
        tracing::debug!(
            prompt_tokens = response.usage_metadata.prompt_token_count,
            output_tokens = response.usage_metadata.candidates_token_count,
            "generation complete"
        );
        Ok(response)
    }

    async fn generate_stream(&self, request: &GenerationRequest) -> Result<ResponseStream> {
        let body = build_request_body(request, &self.config.model, true);
        let resp = self.send(&body).await?;
        Ok(decode_sse_stream(resp.bytes_stream()))
    }

    async fn count_tokens(&self, contents: &[Content]) -> Result<u32> {
        Ok(estimate_tokens(contents))
    }

    async fn embed(&self, _request: &EmbedRequest) -> Result<EmbedResponse> {
        Err(AgentError::UnsupportedOperation {
            operation: "embed".into(),
        })
    }
}

// ---------------------------------------------------------------------------
// SSE byte stream -> response stream
// ---------------------------------------------------------------------------

struct SseState<S> {
    bytes: Pin<Box<S>>,
    buffer: Vec<u8>,
    decoder: StreamDecoder,
    pending: VecDeque<GenerationResponse>,
    finished: bool,
}

impl<S> SseState<S> {
    fn feed_line(&mut self, raw: Vec<u8>) -> Result<()> {
        let line = String::from_utf8(raw).map_err(|e| AgentError::Stream {
            reason: format!("invalid UTF-8 in stream: {e}"),
        })?;
        self.pending.extend(self.decoder.feed_line(&line)?);
        if self.decoder.is_done() {
            self.finish()?;
        }
        Ok(())
    }

    /// Feed every complete line currently buffered.  Lines are split on raw
    /// bytes so multi-byte characters spanning network chunks stay intact.
    fn drain_lines(&mut self) -> Result<()> {
        while !self.finished {
            let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') else {
                break;
            };
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            self.feed_line(line)?;
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.pending.extend(self.decoder.finish()?);
        self.finished = true;
        Ok(())
    }
}

/// Turn a raw SSE byte stream into canonical response chunks.
pub fn decode_sse_stream<S, B, E>(bytes: S) -> ResponseStream
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let state = SseState {
        bytes: Box::pin(bytes),
        buffer: Vec::new(),
        decoder: StreamDecoder::new(),
        pending: VecDeque::new(),
        finished: false,
    };

    futures::stream::try_unfold(state, |mut state| async move {
        loop {
            if let Some(chunk) = state.pending.pop_front() {
                return Ok(Some((chunk, state)));
            }
            if state.finished {
                return Ok(None);
            }
            match state.bytes.next().await {
                Some(Ok(bytes)) => {
                    state.buffer.extend_from_slice(bytes.as_ref());
                    state.drain_lines()?;
                }
                Some(Err(e)) => {
                    return Err(AgentError::Stream {
                        reason: format!("stream read error: {e}"),
                    });
                }
                None => {
                    if !state.buffer.is_empty() {
                        let rest = std::mem::take(&mut state.buffer);
                        state.feed_line(rest)?;
                    }
                    if !state.finished {
                        state.finish()?;
                    }
                }
            }
        }
    })
    .boxed()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Scripted collaborators shared by the unit tests.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::{AgentError, Result};
use crate::llm::convert::estimate_tokens;
use crate::llm::generator::{ContentGenerator, ResponseStream};
use crate::llm::types::{
    Candidate, Content, EmbedRequest, EmbedResponse, FinishReason, FunctionCall,
    GenerationRequest, GenerationResponse, Part, UsageMetadata,
};
use crate::reporting::ErrorReporter;

enum Script {
    OpenError(AgentError),
    Chunks(Vec<Result<GenerationResponse>>, Option<CancellationToken>),
}

/// A generator that replays queued streams, one per `generate_stream` call,
/// and records every request it receives.
#[derive(Default)]
pub(crate) struct ScriptedGenerator {
    scripts: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl ScriptedGenerator {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push_stream(&self, chunks: Vec<GenerationResponse>) {
        self.push_chunks(chunks.into_iter().map(Ok).collect());
    }

    pub(crate) fn push_chunks(&self, chunks: Vec<Result<GenerationResponse>>) {
        self.scripts.lock().unwrap().push_back(Script::Chunks(chunks, None));
    }

    /// Queue a stream that fires `cancel` as each item is yielded.
    pub(crate) fn push_stream_cancelling(&self, chunks: Vec<GenerationResponse>, cancel: CancellationToken) {
        self.push_chunks_cancelling(chunks.into_iter().map(Ok).collect(), cancel);
    }

    pub(crate) fn push_chunks_cancelling(
        &self,
        chunks: Vec<Result<GenerationResponse>>,
        cancel: CancellationToken,
    ) {
        self.scripts
            .lock()
            .unwrap()
            .push_back(Script::Chunks(chunks, Some(cancel)));
    }

    pub(crate) fn push_open_error(&self, error: AgentError) {
        self.scripts.lock().unwrap().push_back(Script::OpenError(error));
    }

    pub(crate) fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub(crate) fn stream_calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl ContentGenerator for ScriptedGenerator {
    async fn generate(&self, _request: &GenerationRequest) -> Result<GenerationResponse> {
        Ok(text_chunk("summary of earlier conversation"))
    }

    async fn generate_stream(&self, request: &GenerationRequest) -> Result<ResponseStream> {
        self.requests.lock().unwrap().push(request.clone());
        let script = self.scripts.lock().unwrap().pop_front();
        match script {
            None => Err(AgentError::Internal("no scripted stream left".into())),
            Some(Script::OpenError(e)) => Err(e),
            Some(Script::Chunks(chunks, None)) => Ok(futures::stream::iter(chunks).boxed()),
            Some(Script::Chunks(chunks, Some(cancel))) => Ok(futures::stream::iter(chunks)
                .inspect(move |_| cancel.cancel())
                .boxed()),
        }
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

/// Records the operation tag of every report.
#[derive(Default)]
pub(crate) struct RecordingReporter {
    operations: Mutex<Vec<String>>,
}

impl RecordingReporter {
    pub(crate) fn operations(&self) -> Vec<String> {
        self.operations.lock().unwrap().clone()
    }
}

#[async_trait]
impl ErrorReporter for RecordingReporter {
    async fn report(&self, _: &AgentError, _: &str, _: &[Content], operation: &str) {
        self.operations.lock().unwrap().push(operation.to_owned());
    }
}

fn chunk(parts: Vec<Part>, finish_reason: Option<FinishReason>) -> GenerationResponse {
    GenerationResponse {
        candidates: vec![Candidate {
            content: Content::model(parts),
            finish_reason,
        }],
        usage_metadata: UsageMetadata::default(),
    }
}

pub(crate) fn text_chunk(text: &str) -> GenerationResponse {
    chunk(vec![Part::text(text)], None)
}

pub(crate) fn thought_chunk(text: &str) -> GenerationResponse {
    chunk(vec![Part::thought(text)], None)
}

pub(crate) fn call_chunk(id: Option<&str>, name: &str, args: Value) -> GenerationResponse {
    chunk(
        vec![Part::FunctionCall(FunctionCall {
            id: id.map(str::to_owned),
            name: name.to_owned(),
            args: args.as_object().cloned().unwrap_or_default(),
        })],
        Some(FinishReason::Stop),
    )
}

//! SSE chunk decoder for the xAI Chat Completions stream.
//!
//! The stream sends `data:` lines carrying JSON chunks with
//! `choices[0].delta` objects and terminates with `data: [DONE]`.  Unlike a
//! whole-response accumulator, this decoder turns each line into zero or
//! more canonical [`GenerationResponse`] chunks as soon as they are
//! meaningful, so the turn engine can render text while the model is still
//! generating.
//!
//! Tool-call fragments are accumulated per stream index.  A call is emitted
//! once, in the first chunk where its accumulated arguments parse as a JSON
//! object, or with empty arguments when the choice finishes and nothing was
//! received for it.

use serde_json::{Map, Value};

use crate::error::{AgentError, Result};
use crate::llm::convert::{parse_arguments, usage_from_wire};
use crate::llm::types::{
    Candidate, Content, FinishReason, FunctionCall, GenerationResponse, Part, UsageMetadata,
};

/// Upper bound on tool call indices in one response.
const MAX_TOOL_CALLS: usize = 128;

// ---------------------------------------------------------------------------
// Decoder
// ---------------------------------------------------------------------------

/// Incremental decoder for one streaming response.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    /// In-progress tool calls indexed by their position in `tool_calls`.
    tool_calls: Vec<ToolCallBuilder>,
    /// Most recent usage counters; usually sent once on the terminal chunk.
    usage: UsageMetadata,
    /// Whether the `[DONE]` sentinel has been received.
    done: bool,
}

#[derive(Debug, Default)]
struct ToolCallBuilder {
    id: String,
    name: String,
    arguments: String,
    emitted: bool,
}

impl ToolCallBuilder {
    fn to_call(&self, args: Map<String, Value>) -> FunctionCall {
        FunctionCall {
            id: (!self.id.is_empty()).then(|| self.id.clone()),
            name: self.name.clone(),
            args,
        }
    }

    /// The parsed arguments, if the buffer currently holds a complete object.
    fn try_arguments(&self) -> Option<Map<String, Value>> {
        match serde_json::from_str::<Value>(&self.arguments) {
            Ok(Value::Object(map)) => Some(map),
            _ => None,
        }
    }
}

impl StreamDecoder {
    /// Create a new decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` once the `[DONE]` sentinel has been received.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Usage counters seen so far.
    pub fn usage(&self) -> UsageMetadata {
        self.usage
    }

    /// Feed one SSE line.  Returns the canonical chunks it produced, which
    /// may be none.
    pub fn feed_line(&mut self, line: &str) -> Result<Vec<GenerationResponse>> {
        let line = line.trim_end();

        if line.is_empty() || line.starts_with(':') {
            return Ok(Vec::new());
        }

        // `event:`, `id:` and other SSE fields carry nothing we need.
        let Some(data) = line.strip_prefix("data:") else {
            return Ok(Vec::new());
        };
        let data = data.trim();

        if data == "[DONE]" {
            self.done = true;
            return Ok(Vec::new());
        }

        let v: Value = serde_json::from_str(data).map_err(|e| AgentError::Stream {
            reason: format!("invalid JSON in SSE data: {e}"),
        })?;

        self.decode_chunk(&v)
    }

    /// Flush calls that were never emitted.  Call once the byte stream ends.
    pub fn finish(&mut self) -> Result<Vec<GenerationResponse>> {
        let parts = self.flush_pending_calls()?;
        if parts.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![self.response(parts, None)])
    }

    fn decode_chunk(&mut self, v: &Value) -> Result<Vec<GenerationResponse>> {
        if let Some(error) = v.get("error").filter(|e| !e.is_null()) {
            let message = error["message"]
                .as_str()
                .map(str::to_owned)
                .unwrap_or_else(|| error.to_string());
            return Err(AgentError::Stream { reason: message });
        }

        if let Some(usage) = v.get("usage").filter(|u| !u.is_null()) {
            self.usage = usage_from_wire(usage);
        }

        let choice = &v["choices"][0];
        if choice.is_null() {
            return Ok(Vec::new());
        }
        let delta = &choice["delta"];
        let finish_reason = choice["finish_reason"].as_str().map(FinishReason::from_backend);

        let mut out = Vec::new();

        if let Some(reasoning) = delta["reasoning_content"].as_str().filter(|s| !s.is_empty()) {
            out.push(self.response(vec![Part::thought(reasoning)], None));
        }

        let mut parts = Vec::new();
        if let Some(text) = delta["content"].as_str().filter(|s| !s.is_empty()) {
            parts.push(Part::text(text));
        }

        if let Some(tool_calls) = delta["tool_calls"].as_array() {
            for tc in tool_calls {
                self.absorb_tool_delta(tc)?;
            }
        }

        if finish_reason.is_some() {
            parts.extend(self.flush_pending_calls()?);
        } else {
            parts.extend(self.take_complete_calls());
        }

        if !parts.is_empty() {
            out.push(self.response(parts, finish_reason));
        }

        Ok(out)
    }

    fn absorb_tool_delta(&mut self, tc: &Value) -> Result<()> {
        let raw_index = tc["index"].as_u64().unwrap_or(0);
        let index = usize::try_from(raw_index)
            .ok()
            .filter(|&i| i < MAX_TOOL_CALLS)
            .ok_or_else(|| AgentError::Stream {
                reason: format!("tool call index {raw_index} is out of range"),
            })?;
        while self.tool_calls.len() <= index {
            self.tool_calls.push(ToolCallBuilder::default());
        }
        let builder = &mut self.tool_calls[index];

        if let Some(id) = tc["id"].as_str() {
            builder.id = id.to_owned();
        }
        let function = &tc["function"];
        if let Some(name) = function["name"].as_str() {
            builder.name.push_str(name);
        }
        if let Some(args) = function["arguments"].as_str() {
            builder.arguments.push_str(args);
        }
        Ok(())
    }

    /// Emit every named call whose arguments already form a complete object.
    fn take_complete_calls(&mut self) -> Vec<Part> {
        let mut parts = Vec::new();
        for builder in &mut self.tool_calls {
            if builder.emitted || builder.name.is_empty() || builder.arguments.is_empty() {
                continue;
            }
            if let Some(args) = builder.try_arguments() {
                parts.push(Part::FunctionCall(builder.to_call(args)));
                builder.emitted = true;
            }
        }
        parts
    }

    /// Emit every remaining named call; incomplete arguments are an error.
    fn flush_pending_calls(&mut self) -> Result<Vec<Part>> {
        let mut parts = Vec::new();
        for builder in &mut self.tool_calls {
            if builder.emitted || builder.name.is_empty() {
                continue;
            }
            let args = parse_arguments(&builder.name, &builder.arguments)?;
            parts.push(Part::FunctionCall(builder.to_call(args)));
            builder.emitted = true;
        }
        Ok(parts)
    }

    fn response(&self, parts: Vec<Part>, finish_reason: Option<FinishReason>) -> GenerationResponse {
        GenerationResponse {
            candidates: vec![Candidate {
                content: Content::model(parts),
                finish_reason,
            }],
            usage_metadata: self.usage,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_all(decoder: &mut StreamDecoder, lines: &[&str]) -> Vec<GenerationResponse> {
        lines
            .iter()
            .flat_map(|line| decoder.feed_line(line).unwrap())
            .collect()
    }

    #[test]
    fn text_deltas_become_individual_chunks() {
        let mut decoder = StreamDecoder::new();
        let chunks = feed_all(
            &mut decoder,
            &[
                r#"data: {"choices":[{"index":0,"delta":{"role":"assistant","content":"Hello"}}]}"#,
                r#"data: {"choices":[{"index":0,"delta":{"content":" world"}}]}"#,
            ],
        );
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].text(), "Hello");
        assert_eq!(chunks[1].text(), " world");
    }

    #[test]
    fn chunks_without_deltas_produce_nothing() {
        let mut decoder = StreamDecoder::new();
        let chunks = feed_all(
            &mut decoder,
            &[
                r#"data: {"choices":[{"index":0,"delta":{"role":"assistant"}}]}"#,
                r#"data: {"choices":[{"index":0,"delta":{"content":""}}]}"#,
                r#"data: {"choices":[],"usage":{"prompt_tokens":5,"completion_tokens":7,"total_tokens":12}}"#,
            ],
        );
        assert!(chunks.is_empty());
        assert_eq!(decoder.usage().total_token_count, 12);
    }

    #[test]
    fn done_sentinel_sets_flag() {
        let mut decoder = StreamDecoder::new();
        assert!(!decoder.is_done());
        assert!(decoder.feed_line("data: [DONE]").unwrap().is_empty());
        assert!(decoder.is_done());
    }

    #[test]
    fn blank_comment_and_event_lines_ignored() {
        let mut decoder = StreamDecoder::new();
        assert!(decoder.feed_line("").unwrap().is_empty());
        assert!(decoder.feed_line(": keepalive").unwrap().is_empty());
        assert!(decoder.feed_line("event: message").unwrap().is_empty());
    }

    #[test]
    fn data_prefix_without_space_is_accepted() {
        let mut decoder = StreamDecoder::new();
        let chunks = decoder
            .feed_line(r#"data:{"choices":[{"delta":{"content":"x"}}]}"#)
            .unwrap();
        assert_eq!(chunks[0].text(), "x");
    }

    #[test]
    fn invalid_json_returns_error() {
        let mut decoder = StreamDecoder::new();
        let err = decoder.feed_line("data: {invalid json}").unwrap_err();
        assert!(matches!(err, AgentError::Stream { .. }));
    }

    #[test]
    fn in_band_error_object_is_an_error() {
        let mut decoder = StreamDecoder::new();
        let err = decoder
            .feed_line(r#"data: {"error":{"message":"overloaded"}}"#)
            .unwrap_err();
        assert!(err.to_string().contains("overloaded"));
    }

    #[test]
    fn whole_tool_call_in_one_chunk() {
        let mut decoder = StreamDecoder::new();
        let chunks = feed_all(
            &mut decoder,
            &[
                r#"data: {"choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"list_dir","arguments":"{\"path\":\".\"}"}}]},"finish_reason":"stop"}]}"#,
            ],
        );
        assert_eq!(chunks.len(), 1);
        let calls = chunks[0].function_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id.as_deref(), Some("call_1"));
        assert_eq!(calls[0].name, "list_dir");
        assert_eq!(calls[0].args["path"], ".");
        assert_eq!(chunks[0].finish_reason(), Some(FinishReason::Stop));
        assert_eq!(chunks[0].text(), "");
    }

    #[test]
    fn fragmented_arguments_are_accumulated() {
        let mut decoder = StreamDecoder::new();
        let chunks = feed_all(
            &mut decoder,
            &[
                r#"data: {"choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"id":"call_abc","function":{"name":"read_file","arguments":""}}]}}]}"#,
                r#"data: {"choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"file_path\":"}}]}}]}"#,
                r#"data: {"choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"function":{"arguments":"\"test.txt\"}"}}]}}]}"#,
                r#"data: {"choices":[{"index":0,"delta":{},"finish_reason":"tool_calls"}]}"#,
                "data: [DONE]",
            ],
        );
        assert_eq!(chunks.len(), 1, "call emitted exactly once");
        let calls = chunks[0].function_calls();
        assert_eq!(calls[0].id.as_deref(), Some("call_abc"));
        assert_eq!(calls[0].args["file_path"], "test.txt");
        assert!(decoder.finish().unwrap().is_empty());
    }

    #[test]
    fn parallel_calls_keep_their_indices() {
        let mut decoder = StreamDecoder::new();
        let chunks = feed_all(
            &mut decoder,
            &[
                r#"data: {"choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"read_file","arguments":"{\"file_path\":\"a.txt\"}"}}]}}]}"#,
                r#"data: {"choices":[{"index":0,"delta":{"tool_calls":[{"index":1,"id":"call_2","function":{"name":"write_file","arguments":"{\"file_path\":\"b.txt\"}"}}]}}]}"#,
            ],
        );
        let names: Vec<_> = chunks
            .iter()
            .flat_map(|c| c.function_calls())
            .map(|c| c.name.clone())
            .collect();
        assert_eq!(names, ["read_file", "write_file"]);
    }

    #[test]
    fn empty_arguments_flush_as_empty_object_on_finish() {
        let mut decoder = StreamDecoder::new();
        let first = decoder
            .feed_line(r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"get_time"}}]}}]}"#)
            .unwrap();
        assert!(first.is_empty());
        let chunks = decoder
            .feed_line(r#"data: {"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#)
            .unwrap();
        let calls = chunks[0].function_calls();
        assert_eq!(calls[0].name, "get_time");
        assert!(calls[0].args.is_empty());
    }

    #[test]
    fn out_of_range_tool_index_is_a_stream_error() {
        let mut decoder = StreamDecoder::new();
        let err = decoder
            .feed_line(r#"data: {"choices":[{"delta":{"tool_calls":[{"index":4000000000,"id":"call_1","function":{"name":"shell"}}]}}]}"#)
            .unwrap_err();
        assert!(matches!(err, AgentError::Stream { .. }));
    }

    #[test]
    fn truncated_arguments_are_a_decode_error() {
        let mut decoder = StreamDecoder::new();
        decoder
            .feed_line(r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"shell","arguments":"{\"command\":"}}]}}]}"#)
            .unwrap();
        let err = decoder.finish().unwrap_err();
        assert!(matches!(err, AgentError::Decode { .. }));
    }

    #[test]
    fn reasoning_delta_is_its_own_chunk() {
        let mut decoder = StreamDecoder::new();
        let chunks = decoder
            .feed_line(r#"data: {"choices":[{"delta":{"reasoning_content":"**Planning** the answer","content":"Hi"}}]}"#)
            .unwrap();
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].parts()[0].is_thought());
        assert_eq!(chunks[0].text(), "");
        assert_eq!(chunks[1].text(), "Hi");
    }

    #[test]
    fn usage_is_attached_to_later_chunks() {
        let mut decoder = StreamDecoder::new();
        let chunks = decoder
            .feed_line(r#"data: {"choices":[{"delta":{"content":"done"},"finish_reason":"stop"}],"usage":{"prompt_tokens":3,"completion_tokens":1,"total_tokens":4}}"#)
            .unwrap();
        assert_eq!(chunks[0].usage_metadata.prompt_token_count, 3);
        assert_eq!(chunks[0].finish_reason(), Some(FinishReason::Stop));
    }
}

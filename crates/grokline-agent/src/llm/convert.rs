//! Translation between the canonical model and the Chat Completions wire
//! format spoken by the xAI backend.
//!
//! The backend differs structurally from the canonical model: it names the
//! model role `assistant`, carries tool results as standalone `tool`
//! messages, expects lowercase JSON-schema type names and rejects several
//! schema keywords.  Everything here is a pure function over JSON values so
//! it can be tested without a network.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde_json::{Map, Value, json};

use crate::error::{AgentError, Result};
use crate::llm::types::{
    Candidate, Content, FinishReason, FunctionCall, FunctionDeclaration, GenerationRequest,
    GenerationResponse, Part, Role, UsageMetadata,
};

/// Average characters per token used by [`estimate_tokens`].
const CHARS_PER_TOKEN: f64 = 3.5;

/// Flat token charge for each inline image.
const TOKENS_PER_IMAGE: u32 = 750;

// ---------------------------------------------------------------------------
// Roles
// ---------------------------------------------------------------------------

/// Backend role name for a canonical role.
pub fn role_to_wire(role: Role) -> &'static str {
    match role {
        Role::User => "user",
        Role::Model => "assistant",
    }
}

/// Canonical role for a backend role name.  Anything that is not the
/// assistant is treated as user input.
pub fn role_from_wire(role: &str) -> Role {
    match role {
        "assistant" => Role::Model,
        _ => Role::User,
    }
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// Convert a system instruction and canonical history into backend messages.
///
/// Per [`Content`]:
/// - text and inline-data parts are folded into one message; a single text
///   part becomes a plain string, anything else an ordered content array;
/// - function calls become the message's `tool_calls`;
/// - each function response becomes a standalone `tool` message, emitted at
///   the point it occurs, before the rest of the content is folded.
///
/// Thought parts are never sent back to the backend.
pub fn contents_to_messages(system_instruction: Option<&str>, contents: &[Content]) -> Vec<Value> {
    let mut messages = Vec::with_capacity(contents.len() + 1);

    if let Some(system) = system_instruction.filter(|s| !s.is_empty()) {
        messages.push(json!({"role": "system", "content": system}));
    }

    for content in contents {
        let role = role_to_wire(content.role);
        let mut items: Vec<Value> = Vec::new();
        let mut tool_calls: Vec<Value> = Vec::new();

        for part in &content.parts {
            match part {
                Part::Text { thought: true, .. } => {}
                Part::Text { text, .. } => items.push(Value::String(text.clone())),
                Part::InlineData(data) => items.push(json!({
                    "type": "image_url",
                    "image_url": {
                        "url": format!(
                            "data:{};base64,{}",
                            data.mime_type,
                            STANDARD.encode(&data.data)
                        ),
                    },
                })),
                Part::FunctionCall(call) => tool_calls.push(function_call_to_wire(call)),
                Part::FunctionResponse(resp) => {
                    let tool_call_id = resp.id.clone().unwrap_or_else(|| resp.name.clone());
                    messages.push(json!({
                        "role": "tool",
                        "tool_call_id": tool_call_id,
                        "content": resp.response.to_string(),
                    }));
                }
            }
        }

        if items.is_empty() && tool_calls.is_empty() {
            continue;
        }

        let mut message = json!({ "role": role });
        match items.as_slice() {
            [] => message["content"] = Value::Null,
            [Value::String(text)] => message["content"] = json!(text),
            _ => {
                let array: Vec<Value> = items
                    .into_iter()
                    .map(|item| match item {
                        Value::String(text) => json!({"type": "text", "text": text}),
                        other => other,
                    })
                    .collect();
                message["content"] = Value::Array(array);
            }
        }
        if !tool_calls.is_empty() {
            message["tool_calls"] = Value::Array(tool_calls);
        }
        messages.push(message);
    }

    messages
}

fn function_call_to_wire(call: &FunctionCall) -> Value {
    let id = call
        .id
        .clone()
        .unwrap_or_else(|| format!("call_{}", uuid::Uuid::new_v4().simple()));
    json!({
        "id": id,
        "type": "function",
        "function": {
            "name": call.name,
            "arguments": Value::Object(call.args.clone()).to_string(),
        },
    })
}

// ---------------------------------------------------------------------------
// Tools
// ---------------------------------------------------------------------------

/// Convert canonical tool declarations into backend `function` tools.
pub fn tools_to_wire(tools: &[FunctionDeclaration]) -> Vec<Value> {
    tools
        .iter()
        .map(|tool| {
            let parameters = tool
                .parameters
                .as_ref()
                .map(convert_schema)
                .unwrap_or_else(|| json!({"type": "object", "properties": {}}));
            json!({
                "type": "function",
                "function": {
                    "name": tool.name,
                    "description": tool.description,
                    "parameters": parameters,
                },
            })
        })
        .collect()
}

/// Legacy numeric schema type codes, indexed from 1.
const LEGACY_TYPE_CODES: [&str; 6] = ["string", "number", "integer", "boolean", "array", "object"];

/// Normalize a JSON-schema-like value for the backend.
///
/// `type` becomes a lowercase string (legacy numeric codes 1..=6 are
/// mapped, anything unrecognized becomes `"string"`), `properties` and
/// `items` are converted recursively, `required` and `description` pass
/// through, and every other keyword is dropped.  The conversion is lossy and
/// never fails.
pub fn convert_schema(schema: &Value) -> Value {
    let Some(object) = schema.as_object() else {
        return Value::Object(Map::new());
    };

    let mut result = Map::new();
    for (key, value) in object {
        match key.as_str() {
            "type" => {
                result.insert(key.clone(), Value::String(convert_type(value)));
            }
            "properties" => {
                if let Some(props) = value.as_object() {
                    let converted = props
                        .iter()
                        .map(|(name, prop)| (name.clone(), convert_schema(prop)))
                        .collect();
                    result.insert(key.clone(), Value::Object(converted));
                }
            }
            "items" => {
                if value.is_object() {
                    result.insert(key.clone(), convert_schema(value));
                }
            }
            "required" | "description" => {
                result.insert(key.clone(), value.clone());
            }
            _ => {}
        }
    }
    Value::Object(result)
}

fn convert_type(value: &Value) -> String {
    match value {
        Value::String(name) => name.to_lowercase(),
        Value::Number(code) => code
            .as_u64()
            .and_then(|c| c.checked_sub(1))
            .and_then(|i| LEGACY_TYPE_CODES.get(i as usize))
            .copied()
            .unwrap_or("string")
            .to_owned(),
        _ => "string".to_owned(),
    }
}

// ---------------------------------------------------------------------------
// Request body
// ---------------------------------------------------------------------------

/// Build the Chat Completions request body.
pub fn build_request_body(request: &GenerationRequest, default_model: &str, stream: bool) -> Value {
    let model = if request.model.is_empty() {
        default_model
    } else {
        &request.model
    };

    let mut body = json!({
        "model": model,
        "messages": contents_to_messages(request.system_instruction.as_deref(), &request.contents),
        "stream": stream,
    });

    let config = &request.config;
    if let Some(temperature) = config.temperature {
        body["temperature"] = json!(temperature);
    }
    if let Some(max_tokens) = config.max_output_tokens {
        body["max_tokens"] = json!(max_tokens);
    }
    if let Some(top_p) = config.top_p {
        body["top_p"] = json!(top_p);
    }
    if !request.tools.is_empty() {
        body["tools"] = Value::Array(tools_to_wire(&request.tools));
    }
    if let Some(tool_choice) = &config.tool_choice {
        body["tool_choice"] = tool_choice.clone();
    }
    if let Some(response_format) = &config.response_format {
        body["response_format"] = response_format.clone();
    }
    if let Some(effort) = &config.reasoning_effort {
        body["reasoning_effort"] = json!(effort);
    }
    if stream {
        body["stream_options"] = json!({"include_usage": true});
    }

    body
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

/// Parse a tool call's `arguments` string.
///
/// Empty arguments mean "no arguments".  Malformed JSON, or JSON that is not
/// an object, is a [`AgentError::Decode`] error: running a tool with guessed
/// arguments is worse than failing the call.
pub fn parse_arguments(name: &str, raw: &str) -> Result<Map<String, Value>> {
    if raw.trim().is_empty() {
        return Ok(Map::new());
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(AgentError::Decode {
            reason: format!("arguments for tool `{name}` are not an object: {other}"),
        }),
        Err(e) => Err(AgentError::Decode {
            reason: format!("invalid JSON in arguments for tool `{name}`: {e}"),
        }),
    }
}

/// Read backend usage counters, defaulting absent values to zero.
pub fn usage_from_wire(usage: &Value) -> UsageMetadata {
    let count = |key: &str| usage[key].as_u64().unwrap_or(0) as u32;
    UsageMetadata {
        prompt_token_count: count("prompt_tokens"),
        candidates_token_count: count("completion_tokens"),
        total_token_count: count("total_tokens"),
    }
}

/// Convert a non-streaming Chat Completions response.
///
/// Only the first choice is used.
pub fn parse_response(v: &Value) -> Result<GenerationResponse> {
    let choice = v["choices"]
        .as_array()
        .and_then(|choices| choices.first())
        .ok_or_else(|| AgentError::Stream {
            reason: "response contained no choices".into(),
        })?;
    let message = &choice["message"];

    let mut parts = Vec::new();
    if let Some(reasoning) = message["reasoning_content"].as_str().filter(|s| !s.is_empty()) {
        parts.push(Part::thought(reasoning));
    }
    if let Some(text) = message["content"].as_str().filter(|s| !s.is_empty()) {
        parts.push(Part::text(text));
    }
    if let Some(tool_calls) = message["tool_calls"].as_array() {
        for tc in tool_calls {
            let function = &tc["function"];
            if function.is_null() {
                continue;
            }
            let name = function["name"].as_str().unwrap_or_default().to_owned();
            let args = parse_arguments(&name, function["arguments"].as_str().unwrap_or_default())?;
            parts.push(Part::FunctionCall(FunctionCall {
                id: tc["id"].as_str().map(str::to_owned),
                name,
                args,
            }));
        }
    }

    let role = message["role"]
        .as_str()
        .map(role_from_wire)
        .unwrap_or(Role::Model);

    Ok(GenerationResponse {
        candidates: vec![Candidate {
            content: Content { role, parts },
            finish_reason: choice["finish_reason"].as_str().map(FinishReason::from_backend),
        }],
        usage_metadata: usage_from_wire(&v["usage"]),
    })
}

/// Pull a human-readable message out of a backend error body.
pub fn error_message_from_body(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v["error"]["message"]
                .as_str()
                .or_else(|| v["error"].as_str())
                .map(str::to_owned)
        })
        .unwrap_or_else(|| body.to_owned())
}

// ---------------------------------------------------------------------------
// Token estimation
// ---------------------------------------------------------------------------

/// Estimate the token count of a conversation.
///
/// The backend has no counting endpoint, so this is an approximation:
/// `ceil(chars / 3.5)` over all textual payload (text parts plus the JSON of
/// function calls and responses) and a flat 750 tokens per inline image.
/// Treat the result as a budget hint, never as an exact count.
pub fn estimate_tokens(contents: &[Content]) -> u32 {
    let mut chars = 0usize;
    let mut images = 0u32;

    for part in contents.iter().flat_map(|c| &c.parts) {
        match part {
            Part::Text { text, .. } => chars += text.chars().count(),
            Part::InlineData(_) => images += 1,
            Part::FunctionCall(call) => {
                chars += call.name.chars().count();
                chars += Value::Object(call.args.clone()).to_string().chars().count();
            }
            Part::FunctionResponse(resp) => {
                chars += resp.name.chars().count();
                chars += resp.response.to_string().chars().count();
            }
        }
    }

    let text_tokens = (chars as f64 / CHARS_PER_TOKEN).ceil() as u32;
    text_tokens + images * TOKENS_PER_IMAGE
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

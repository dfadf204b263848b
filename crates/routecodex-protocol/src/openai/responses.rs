//! OpenAI Responses wire shapes, including the tool-output continuation
//! endpoint (`submit_tool_outputs`) and the named stream events.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::sse::SseEvent;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponsesRequest {
    pub model: String,
    /// A string or an array of input items (messages, function_call_output, ...).
    pub input: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_response_id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ResponsesRequest {
    pub fn is_stream(&self) -> bool {
        self.stream.unwrap_or(false)
    }

    /// Input items as a slice; a bare string input is a single user message.
    pub fn input_items(&self) -> Vec<Value> {
        match &self.input {
            Value::String(text) => vec![json!({
                "type": "message",
                "role": "user",
                "content": [{"type": "input_text", "text": text}],
            })],
            Value::Array(items) => items.clone(),
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseToolCall {
    pub id: String,
    #[serde(rename = "type", default = "function_type")]
    pub kind: String,
    pub function: ResponseToolCallFunction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseToolCallFunction {
    pub name: String,
    pub arguments: String,
}

fn function_type() -> String {
    "function".to_string()
}

/// `status: requires_action` payload: the calls the client must execute and
/// submit back before the response can complete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequiredAction {
    #[serde(rename = "type", default = "submit_tool_outputs_type")]
    pub kind: String,
    pub submit_tool_outputs: SubmitToolOutputsAction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitToolOutputsAction {
    pub tool_calls: Vec<ResponseToolCall>,
}

fn submit_tool_outputs_type() -> String {
    "submit_tool_outputs".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponsesResponse {
    pub id: String,
    #[serde(default = "response_object")]
    pub object: String,
    #[serde(default)]
    pub created_at: i64,
    /// `completed`, `requires_action`, `in_progress`, `failed`, ...
    pub status: String,
    pub model: String,
    #[serde(default)]
    pub output: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required_action: Option<RequiredAction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn response_object() -> String {
    "response".to_string()
}

impl ResponsesResponse {
    /// Concatenated text of all `output_text` parts across message items.
    pub fn output_text(&self) -> String {
        let mut out = String::new();
        for item in &self.output {
            if item.get("type").and_then(Value::as_str) != Some("message") {
                continue;
            }
            let Some(parts) = item.get("content").and_then(Value::as_array) else {
                continue;
            };
            for part in parts {
                if part.get("type").and_then(Value::as_str) == Some("output_text")
                    && let Some(text) = part.get("text").and_then(Value::as_str)
                {
                    out.push_str(text);
                }
            }
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub tool_call_id: String,
    pub output: String,
}

/// Body of `POST /v1/responses/{id}/submit_tool_outputs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitToolOutputsRequest {
    pub tool_outputs: Vec<ToolOutput>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Stream event names the gateway emits and recognizes.
pub mod events {
    pub const CREATED: &str = "response.created";
    pub const IN_PROGRESS: &str = "response.in_progress";
    pub const OUTPUT_ITEM_ADDED: &str = "response.output_item.added";
    pub const OUTPUT_TEXT_DELTA: &str = "response.output_text.delta";
    pub const OUTPUT_ITEM_DONE: &str = "response.output_item.done";
    pub const FUNCTION_ARGS_DELTA: &str = "response.function_call_arguments.delta";
    pub const REQUIRED_ACTION: &str = "response.required_action";
    pub const COMPLETED: &str = "response.completed";
    pub const FAILED: &str = "response.failed";
}

/// Build a named Responses stream event with a JSON payload.
pub fn stream_event(name: &str, data: &Value) -> SseEvent {
    SseEvent::named(name, data.to_string())
}

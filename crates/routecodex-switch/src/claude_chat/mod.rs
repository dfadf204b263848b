//! Anthropic Messages ↔ OpenAI Chat Completions.

pub mod request;
pub mod response;
pub mod stream;

use serde_json::Value;

/// Anthropic stop reason for an OpenAI finish reason.
pub(crate) fn stop_reason_from_finish(finish: Option<&str>) -> &'static str {
    match finish {
        Some("length") => "max_tokens",
        Some("tool_calls") | Some("function_call") => "tool_use",
        Some("content_filter") => "refusal",
        _ => "end_turn",
    }
}

/// OpenAI finish reason for an Anthropic stop reason.
pub(crate) fn finish_reason_from_stop(stop: Option<&str>) -> &'static str {
    match stop {
        Some("max_tokens") => "length",
        Some("tool_use") => "tool_calls",
        Some("refusal") => "content_filter",
        _ => "stop",
    }
}

/// Parse a tool-call arguments string into the object Anthropic expects as
/// `input`. Non-object parses are preserved under a raw key rather than
/// silently dropped.
pub(crate) fn arguments_to_input(arguments: &str) -> Value {
    match serde_json::from_str::<Value>(arguments) {
        Ok(value @ Value::Object(_)) => value,
        Ok(Value::Null) => Value::Object(serde_json::Map::new()),
        Ok(other) => serde_json::json!({ "value": other }),
        Err(_) => {
            if arguments.trim().is_empty() {
                Value::Object(serde_json::Map::new())
            } else {
                serde_json::json!({ "raw": arguments })
            }
        }
    }
}

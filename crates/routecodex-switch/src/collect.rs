//! Stream → non-stream collection: accumulate upstream deltas into the final
//! JSON response the client asked for.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use routecodex_protocol::openai::chat::{
    ChatChoice, ChatCompletionChunk, ChatCompletionResponse, ChatResponseMessage, ChatRole,
    ToolCall,
};
use routecodex_protocol::openai::responses::ResponsesResponse;
use routecodex_protocol::sse::SseEvent;

#[derive(Debug, Default)]
struct ToolCallState {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

#[derive(Debug, Default)]
struct ChoiceState {
    content: String,
    reasoning: String,
    tool_calls: BTreeMap<i64, ToolCallState>,
    finish_reason: Option<String>,
}

/// Accumulates chat chunks into a `ChatCompletionResponse`.
#[derive(Debug)]
pub struct ChatStreamCollector {
    id: String,
    model: String,
    created: i64,
    usage: Option<Value>,
    choices: BTreeMap<i64, ChoiceState>,
}

impl ChatStreamCollector {
    pub fn new() -> Self {
        Self {
            id: "chatcmpl".to_string(),
            model: "unknown".to_string(),
            created: 0,
            usage: None,
            choices: BTreeMap::new(),
        }
    }

    pub fn push_chunk(&mut self, chunk: ChatCompletionChunk) {
        if !chunk.id.is_empty() {
            self.id = chunk.id;
        }
        if !chunk.model.is_empty() {
            self.model = chunk.model;
        }
        if chunk.created != 0 {
            self.created = chunk.created;
        }
        if chunk.usage.is_some() {
            self.usage = chunk.usage;
        }

        for choice in chunk.choices {
            let state = self.choices.entry(choice.index).or_default();
            if let Some(content) = choice.delta.content {
                state.content.push_str(&content);
            }
            if let Some(reasoning) = choice.delta.reasoning_content {
                state.reasoning.push_str(&reasoning);
            }
            for call in choice.delta.tool_calls.into_iter().flatten() {
                let entry = state.tool_calls.entry(call.index).or_default();
                if call.id.is_some() {
                    entry.id = call.id;
                }
                if let Some(function) = call.function {
                    if function.name.is_some() {
                        entry.name = function.name;
                    }
                    if let Some(arguments) = function.arguments {
                        entry.arguments.push_str(&arguments);
                    }
                }
            }
            if let Some(reason) = choice.finish_reason {
                state.finish_reason = Some(reason);
            }
        }
    }

    /// Build the final response. Choices that never saw a finish reason get
    /// `stop`, so an abrupt upstream end still produces a valid body.
    pub fn finalize(self) -> ChatCompletionResponse {
        let choices = self
            .choices
            .into_iter()
            .map(|(index, state)| {
                let tool_calls: Vec<ToolCall> = state
                    .tool_calls
                    .into_iter()
                    .map(|(slot, call)| {
                        ToolCall::function(
                            call.id.unwrap_or_else(|| format!("call_{index}_{slot}")),
                            call.name.unwrap_or_else(|| "tool".to_string()),
                            call.arguments,
                        )
                    })
                    .collect();
                ChatChoice {
                    index,
                    message: ChatResponseMessage {
                        role: ChatRole::Assistant,
                        content: (!state.content.is_empty()).then_some(state.content),
                        reasoning_content: (!state.reasoning.is_empty())
                            .then_some(state.reasoning),
                        tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
                        extra: Map::new(),
                    },
                    finish_reason: Some(state.finish_reason.unwrap_or_else(|| "stop".to_string())),
                    extra: Map::new(),
                }
            })
            .collect();

        ChatCompletionResponse {
            id: self.id,
            object: "chat.completion".to_string(),
            created: self.created,
            model: self.model,
            choices,
            usage: self.usage,
            extra: Map::new(),
        }
    }
}

impl Default for ChatStreamCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Accumulates Responses stream events into a `ResponsesResponse`. The
/// terminal `response.completed` / `response.required_action` payload wins
/// when present; otherwise the response is assembled from deltas.
#[derive(Debug, Default)]
pub struct ResponsesStreamCollector {
    terminal: Option<ResponsesResponse>,
    response_id: Option<String>,
    model: Option<String>,
    text: String,
}

impl ResponsesStreamCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_sse(&mut self, event: &SseEvent) {
        use routecodex_protocol::openai::responses::events;

        let name = event.event.as_deref().unwrap_or_default();
        let data: Value = match serde_json::from_str(&event.data) {
            Ok(value) => value,
            Err(_) => return,
        };

        match name {
            events::CREATED | events::IN_PROGRESS => {
                if let Some(response) = data.get("response") {
                    self.response_id = response
                        .get("id")
                        .and_then(Value::as_str)
                        .map(|id| id.to_string());
                    self.model = response
                        .get("model")
                        .and_then(Value::as_str)
                        .map(|model| model.to_string());
                }
            }
            events::OUTPUT_TEXT_DELTA => {
                if let Some(delta) = data.get("delta").and_then(Value::as_str) {
                    self.text.push_str(delta);
                }
            }
            events::COMPLETED | events::FAILED => {
                let payload = data.get("response").cloned().unwrap_or(data);
                self.terminal = serde_json::from_value(payload).ok();
            }
            events::REQUIRED_ACTION => {
                self.terminal = serde_json::from_value(data).ok();
            }
            _ => {}
        }
    }

    pub fn finalize(self) -> ResponsesResponse {
        if let Some(terminal) = self.terminal {
            return terminal;
        }
        ResponsesResponse {
            id: self.response_id.unwrap_or_else(|| "resp".to_string()),
            object: "response".to_string(),
            created_at: 0,
            status: "completed".to_string(),
            model: self.model.unwrap_or_else(|| "unknown".to_string()),
            output: if self.text.is_empty() {
                Vec::new()
            } else {
                vec![serde_json::json!({
                    "type": "message",
                    "role": "assistant",
                    "status": "completed",
                    "content": [{"type": "output_text", "text": self.text, "annotations": []}],
                })]
            },
            required_action: None,
            usage: None,
            error: None,
            extra: Map::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn chunk(value: Value) -> ChatCompletionChunk {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn collects_split_content_and_tool_arguments() {
        let mut collector = ChatStreamCollector::new();
        collector.push_chunk(chunk(json!({
            "id": "chatcmpl-1", "created": 4, "model": "glm-4.6",
            "choices": [{"index": 0, "delta": {"role": "assistant", "content": "he"}}],
        })));
        collector.push_chunk(chunk(json!({
            "id": "chatcmpl-1", "created": 4, "model": "glm-4.6",
            "choices": [{"index": 0, "delta": {
                "content": "y",
                "tool_calls": [{"index": 0, "id": "call_1",
                                "function": {"name": "echo", "arguments": "{\"a\""}}],
            }}],
        })));
        collector.push_chunk(chunk(json!({
            "id": "chatcmpl-1", "created": 4, "model": "glm-4.6",
            "choices": [{"index": 0,
                         "delta": {"tool_calls": [{"index": 0, "function": {"arguments": ":1}"}}]},
                         "finish_reason": "tool_calls"}],
            "usage": {"prompt_tokens": 1, "completion_tokens": 2, "total_tokens": 3},
        })));

        let response = collector.finalize();
        let message = &response.choices[0].message;
        assert_eq!(message.content.as_deref(), Some("hey"));
        let calls = message.tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].function.arguments, "{\"a\":1}");
        assert_eq!(
            response.choices[0].finish_reason.as_deref(),
            Some("tool_calls")
        );
        assert_eq!(response.usage.as_ref().unwrap()["total_tokens"], 3);
    }

    #[test]
    fn abrupt_end_still_finalizes_with_stop() {
        let mut collector = ChatStreamCollector::new();
        collector.push_chunk(chunk(json!({
            "id": "chatcmpl-2", "created": 0, "model": "m",
            "choices": [{"index": 0, "delta": {"content": "half"}}],
        })));
        let response = collector.finalize();
        assert_eq!(response.choices[0].finish_reason.as_deref(), Some("stop"));
    }

    #[test]
    fn responses_collector_prefers_terminal_payload() {
        let mut collector = ResponsesStreamCollector::new();
        collector.push_sse(&SseEvent::named(
            "response.output_text.delta",
            json!({"delta": "partial"}).to_string(),
        ));
        collector.push_sse(&SseEvent::named(
            "response.completed",
            json!({"response": {
                "id": "resp_1", "status": "completed", "model": "gpt-5",
                "output": [{"type": "message", "role": "assistant",
                            "content": [{"type": "output_text", "text": "final"}]}],
            }})
            .to_string(),
        ));
        let response = collector.finalize();
        assert_eq!(response.output_text(), "final");
    }
}

use std::collections::BTreeMap;

use serde_json::{Map, Value, json};

use routecodex_protocol::openai::chat::{
    ChatChunkChoice, ChatCompletionChunk, ChatCompletionResponse, ChatDelta, ChatRole,
    ToolCallChunk, ToolCallChunkFunction,
};
use routecodex_protocol::openai::responses::{events, stream_event};
use routecodex_protocol::sse::SseEvent;

use super::response::chat_to_responses;

#[derive(Debug, Default)]
struct PendingCall {
    id: String,
    name: String,
    arguments: String,
}

/// Reassembles OpenAI chat chunks into Responses stream events.
///
/// Used when the entry protocol is Responses and the upstream target streams
/// chat deltas. Tool calls are accumulated so the terminal event can carry
/// the full `required_action` payload.
#[derive(Debug)]
pub struct ChatToResponsesStream {
    response_id: String,
    model: String,
    created: i64,
    started: bool,
    finished: bool,
    text: String,
    reasoning: String,
    calls: BTreeMap<i64, PendingCall>,
    finish_reason: Option<String>,
    usage: Option<Value>,
}

impl ChatToResponsesStream {
    pub fn new(response_id: impl Into<String>, model: impl Into<String>, created: i64) -> Self {
        Self {
            response_id: response_id.into(),
            model: model.into(),
            created,
            started: false,
            finished: false,
            text: String::new(),
            reasoning: String::new(),
            calls: BTreeMap::new(),
            finish_reason: None,
            usage: None,
        }
    }

    pub fn push_chunk(&mut self, chunk: ChatCompletionChunk) -> Vec<SseEvent> {
        let mut out = Vec::new();
        if !chunk.model.is_empty() {
            self.model = chunk.model.clone();
        }
        if !self.started {
            self.started = true;
            out.push(stream_event(
                events::CREATED,
                &json!({"response": self.skeleton("in_progress")}),
            ));
        }
        if chunk.usage.is_some() {
            self.usage = chunk.usage.clone();
        }

        for choice in chunk.choices {
            if let Some(reasoning) = choice.delta.reasoning_content
                && !reasoning.is_empty()
            {
                self.reasoning.push_str(&reasoning);
            }
            if let Some(text) = choice.delta.content
                && !text.is_empty()
            {
                self.text.push_str(&text);
                out.push(stream_event(
                    events::OUTPUT_TEXT_DELTA,
                    &json!({"delta": text}),
                ));
            }
            for call in choice.delta.tool_calls.into_iter().flatten() {
                out.extend(self.push_tool_chunk(call));
            }
            if let Some(reason) = choice.finish_reason {
                self.finish_reason = Some(reason);
            }
        }

        out
    }

    /// Close the stream: either a `required_action` handoff (tool calls seen)
    /// or a `completed` event carrying the assembled response. Idempotent.
    pub fn finish(&mut self) -> Vec<SseEvent> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;
        let response = self.build_response();
        if response.required_action.is_some() {
            vec![stream_event(
                events::REQUIRED_ACTION,
                &serde_json::to_value(&response).unwrap_or_default(),
            )]
        } else {
            vec![stream_event(
                events::COMPLETED,
                &json!({"response": serde_json::to_value(&response).unwrap_or_default()}),
            )]
        }
    }

    /// The response assembled so far; used by the engine to park the tool loop.
    pub fn build_response(&self) -> routecodex_protocol::openai::responses::ResponsesResponse {
        let mut chat = ChatCompletionResponse {
            id: self.response_id.clone(),
            object: "chat.completion".to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: Vec::new(),
            usage: self.usage.clone(),
            extra: Map::new(),
        };
        let tool_calls: Vec<_> = self
            .calls
            .values()
            .map(|call| {
                routecodex_protocol::openai::chat::ToolCall::function(
                    call.id.clone(),
                    call.name.clone(),
                    call.arguments.clone(),
                )
            })
            .collect();
        chat.choices.push(routecodex_protocol::openai::chat::ChatChoice {
            index: 0,
            message: routecodex_protocol::openai::chat::ChatResponseMessage {
                role: ChatRole::Assistant,
                content: (!self.text.is_empty()).then(|| self.text.clone()),
                reasoning_content: (!self.reasoning.is_empty()).then(|| self.reasoning.clone()),
                tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
                extra: Map::new(),
            },
            finish_reason: self.finish_reason.clone(),
            extra: Map::new(),
        });
        chat_to_responses(chat, &self.response_id)
    }

    fn push_tool_chunk(&mut self, call: ToolCallChunk) -> Vec<SseEvent> {
        let mut out = Vec::new();
        if !self.calls.contains_key(&call.index) {
            let function = call.function.as_ref();
            let pending = PendingCall {
                id: call.id.clone().unwrap_or_default(),
                name: function.and_then(|f| f.name.clone()).unwrap_or_default(),
                arguments: String::new(),
            };
            out.push(stream_event(
                events::OUTPUT_ITEM_ADDED,
                &json!({"item": {
                    "type": "function_call",
                    "call_id": pending.id.clone(),
                    "name": pending.name.clone(),
                }}),
            ));
            self.calls.insert(call.index, pending);
        }
        let Some(current) = self.calls.get_mut(&call.index) else {
            return out;
        };
        if let Some(id) = call.id
            && !id.is_empty()
        {
            current.id = id;
        }
        if let Some(function) = call.function {
            if let Some(name) = function.name
                && !name.is_empty()
            {
                current.name = name;
            }
            if let Some(arguments) = function.arguments
                && !arguments.is_empty()
            {
                current.arguments.push_str(&arguments);
                out.push(stream_event(
                    events::FUNCTION_ARGS_DELTA,
                    &json!({"delta": arguments}),
                ));
            }
        }
        out
    }

    fn skeleton(&self, status: &str) -> Value {
        json!({
            "id": self.response_id,
            "object": "response",
            "created_at": self.created,
            "status": status,
            "model": self.model,
            "output": [],
        })
    }
}

/// Reassembles Responses stream events into OpenAI chat chunks.
///
/// Used when the entry protocol is chat-shaped and the upstream target
/// streams the Responses protocol.
#[derive(Debug)]
pub struct ResponsesToChatStream {
    id: String,
    model: String,
    created: i64,
    role_sent: bool,
    finished: bool,
    tool_slots: i64,
}

impl ResponsesToChatStream {
    pub fn new(created: i64) -> Self {
        Self {
            id: "chatcmpl".to_string(),
            model: "unknown".to_string(),
            created,
            role_sent: false,
            finished: false,
            tool_slots: 0,
        }
    }

    pub fn push_sse(&mut self, event: &SseEvent) -> Vec<ChatCompletionChunk> {
        let name = event.event.as_deref().unwrap_or_default();
        let data: Value = serde_json::from_str(&event.data).unwrap_or(Value::Null);

        match name {
            events::CREATED | events::IN_PROGRESS => {
                if let Some(response) = data.get("response") {
                    if let Some(id) = response.get("id").and_then(Value::as_str) {
                        self.id = id.to_string();
                    }
                    if let Some(model) = response.get("model").and_then(Value::as_str) {
                        self.model = model.to_string();
                    }
                }
                if self.role_sent {
                    return Vec::new();
                }
                self.role_sent = true;
                vec![self.chunk(
                    ChatDelta {
                        role: Some(ChatRole::Assistant),
                        ..Default::default()
                    },
                    None,
                )]
            }
            events::OUTPUT_TEXT_DELTA => {
                let text = data
                    .get("delta")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                vec![self.chunk(
                    ChatDelta {
                        content: Some(text),
                        ..Default::default()
                    },
                    None,
                )]
            }
            events::OUTPUT_ITEM_ADDED => {
                let Some(item) = data.get("item") else {
                    return Vec::new();
                };
                if item.get("type").and_then(Value::as_str) != Some("function_call") {
                    return Vec::new();
                }
                let slot = self.tool_slots;
                self.tool_slots += 1;
                vec![self.tool_chunk(
                    slot,
                    item.get("call_id")
                        .and_then(Value::as_str)
                        .map(|id| id.to_string()),
                    item.get("name")
                        .and_then(Value::as_str)
                        .map(|name| name.to_string()),
                    None,
                )]
            }
            events::FUNCTION_ARGS_DELTA => {
                if self.tool_slots == 0 {
                    return Vec::new();
                }
                let delta = data
                    .get("delta")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                vec![self.tool_chunk(self.tool_slots - 1, None, None, Some(delta))]
            }
            events::COMPLETED | events::REQUIRED_ACTION | events::FAILED => {
                self.finished = true;
                let finish = if name == events::REQUIRED_ACTION || self.tool_slots > 0 {
                    "tool_calls"
                } else {
                    "stop"
                };
                let usage = data
                    .get("response")
                    .and_then(|response| response.get("usage"))
                    .or_else(|| data.get("usage"))
                    .map(responses_usage_to_chat);
                let mut chunk = self.chunk(ChatDelta::default(), Some(finish.to_string()));
                chunk.usage = usage;
                vec![chunk]
            }
            _ => Vec::new(),
        }
    }

    pub fn finish(&mut self) -> Vec<ChatCompletionChunk> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;
        vec![self.chunk(ChatDelta::default(), Some("stop".to_string()))]
    }

    fn chunk(&self, delta: ChatDelta, finish_reason: Option<String>) -> ChatCompletionChunk {
        let mut chunk =
            ChatCompletionChunk::empty(self.id.clone(), self.model.clone(), self.created);
        chunk.choices.push(ChatChunkChoice {
            index: 0,
            delta,
            finish_reason,
        });
        chunk
    }

    fn tool_chunk(
        &self,
        slot: i64,
        id: Option<String>,
        name: Option<String>,
        arguments: Option<String>,
    ) -> ChatCompletionChunk {
        self.chunk(
            ChatDelta {
                tool_calls: Some(vec![ToolCallChunk {
                    index: slot,
                    id,
                    kind: Some("function".to_string()),
                    function: Some(ToolCallChunkFunction { name, arguments }),
                }]),
                ..Default::default()
            },
            None,
        )
    }
}

fn responses_usage_to_chat(usage: &Value) -> Value {
    let input = usage
        .get("input_tokens")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let output = usage
        .get("output_tokens")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    json!({
        "prompt_tokens": input,
        "completion_tokens": output,
        "total_tokens": input + output,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat_chunk(delta: Value, finish: Option<&str>) -> ChatCompletionChunk {
        serde_json::from_value(json!({
            "id": "chatcmpl-1",
            "created": 1,
            "model": "gpt-5",
            "choices": [{"index": 0, "delta": delta, "finish_reason": finish}],
        }))
        .unwrap()
    }

    #[test]
    fn text_stream_finishes_with_completed_event() {
        let mut stream = ChatToResponsesStream::new("resp_1", "gpt-5", 0);
        let mut events_out = Vec::new();
        events_out.extend(stream.push_chunk(chat_chunk(json!({"content": "po"}), None)));
        events_out.extend(stream.push_chunk(chat_chunk(json!({"content": "ng"}), Some("stop"))));
        events_out.extend(stream.finish());

        assert_eq!(events_out[0].event.as_deref(), Some(events::CREATED));
        let last = events_out.last().unwrap();
        assert_eq!(last.event.as_deref(), Some(events::COMPLETED));
        let data: Value = serde_json::from_str(&last.data).unwrap();
        assert_eq!(data["response"]["status"], "completed");
    }

    #[test]
    fn tool_call_stream_hands_off_with_required_action() {
        let mut stream = ChatToResponsesStream::new("resp_2", "gpt-5", 0);
        stream.push_chunk(chat_chunk(
            json!({"tool_calls": [{
                "index": 0, "id": "call_1", "type": "function",
                "function": {"name": "echo", "arguments": "{\"text\":"},
            }]}),
            None,
        ));
        stream.push_chunk(chat_chunk(
            json!({"tool_calls": [{"index": 0, "function": {"arguments": "\"ping\"}"}}]}),
            Some("tool_calls"),
        ));
        let end = stream.finish();

        assert_eq!(end[0].event.as_deref(), Some(events::REQUIRED_ACTION));
        let data: Value = serde_json::from_str(&end[0].data).unwrap();
        assert_eq!(data["status"], "requires_action");
        let calls = &data["required_action"]["submit_tool_outputs"]["tool_calls"];
        assert_eq!(calls[0]["function"]["arguments"], "{\"text\":\"ping\"}");
    }

    #[test]
    fn responses_events_map_back_to_chat_chunks() {
        let mut stream = ResponsesToChatStream::new(0);
        let created = stream.push_sse(&stream_event(
            events::CREATED,
            &json!({"response": {"id": "resp_9", "model": "gpt-5"}}),
        ));
        assert_eq!(created[0].choices[0].delta.role, Some(ChatRole::Assistant));
        assert_eq!(created[0].id, "resp_9");

        let delta = stream.push_sse(&stream_event(
            events::OUTPUT_TEXT_DELTA,
            &json!({"delta": "hey"}),
        ));
        assert_eq!(delta[0].choices[0].delta.content.as_deref(), Some("hey"));

        let done = stream.push_sse(&stream_event(
            events::COMPLETED,
            &json!({"response": {"usage": {"input_tokens": 1, "output_tokens": 2}}}),
        ));
        assert_eq!(done[0].choices[0].finish_reason.as_deref(), Some("stop"));
        assert!(stream.finish().is_empty());
    }
}

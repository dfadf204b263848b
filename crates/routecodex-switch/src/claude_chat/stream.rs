use std::collections::HashMap;

use serde_json::{Value, json};

use routecodex_protocol::claude::stream::MessagesStreamEvent;
use routecodex_protocol::openai::chat::{
    ChatChunkChoice, ChatCompletionChunk, ChatDelta, ChatRole, ToolCallChunk,
    ToolCallChunkFunction,
};

use super::{finish_reason_from_stop, stop_reason_from_finish};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenBlock {
    Text,
    Thinking,
    Tool,
}

/// Reassembles OpenAI chat chunks into Anthropic Messages stream events.
///
/// Used when the entry protocol is Anthropic Messages and the upstream target
/// streams chat deltas. `finish` must always be called so the client sees
/// `message_stop` even if upstream ends abruptly.
#[derive(Debug)]
pub struct ChatToClaudeStream {
    message_id: String,
    model: String,
    started: bool,
    stopped: bool,
    next_index: usize,
    open: Option<OpenBlock>,
    current_tool: Option<i64>,
    finish_reason: Option<String>,
    usage: Option<Value>,
}

impl ChatToClaudeStream {
    pub fn new(message_id: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            model: model.into(),
            started: false,
            stopped: false,
            next_index: 0,
            open: None,
            current_tool: None,
            finish_reason: None,
            usage: None,
        }
    }

    pub fn push_chunk(&mut self, chunk: ChatCompletionChunk) -> Vec<MessagesStreamEvent> {
        let mut events = Vec::new();
        if !chunk.model.is_empty() {
            self.model = chunk.model.clone();
        }
        self.ensure_started(&mut events);

        if chunk.usage.is_some() {
            self.usage = chunk.usage.clone();
        }

        for choice in chunk.choices {
            if let Some(reasoning) = choice.delta.reasoning_content
                && !reasoning.is_empty()
            {
                self.ensure_block(OpenBlock::Thinking, None, &mut events);
                events.push(MessagesStreamEvent::ContentBlockDelta {
                    index: self.next_index - 1,
                    delta: json!({"type": "thinking_delta", "thinking": reasoning}),
                });
            }

            if let Some(text) = choice.delta.content
                && !text.is_empty()
            {
                self.ensure_block(OpenBlock::Text, None, &mut events);
                events.push(MessagesStreamEvent::ContentBlockDelta {
                    index: self.next_index - 1,
                    delta: json!({"type": "text_delta", "text": text}),
                });
            }

            for call in choice.delta.tool_calls.into_iter().flatten() {
                self.push_tool_chunk(call, &mut events);
            }

            if let Some(reason) = choice.finish_reason {
                self.finish_reason = Some(reason);
            }
        }

        events
    }

    /// Close the message. Idempotent; emits the terminal events exactly once.
    pub fn finish(&mut self) -> Vec<MessagesStreamEvent> {
        let mut events = Vec::new();
        if self.stopped {
            return events;
        }
        self.ensure_started(&mut events);
        self.close_open_block(&mut events);

        let stop_reason = stop_reason_from_finish(self.finish_reason.as_deref());
        events.push(MessagesStreamEvent::MessageDelta {
            delta: json!({"stop_reason": stop_reason, "stop_sequence": null}),
            usage: self.usage.as_ref().map(usage_to_claude),
        });
        events.push(MessagesStreamEvent::MessageStop);
        self.stopped = true;
        events
    }

    fn ensure_started(&mut self, events: &mut Vec<MessagesStreamEvent>) {
        if self.started {
            return;
        }
        self.started = true;
        events.push(MessagesStreamEvent::MessageStart {
            message: json!({
                "id": self.message_id,
                "type": "message",
                "role": "assistant",
                "model": self.model,
                "content": [],
                "stop_reason": null,
                "stop_sequence": null,
                "usage": {"input_tokens": 0, "output_tokens": 0},
            }),
        });
    }

    fn ensure_block(
        &mut self,
        kind: OpenBlock,
        content_block: Option<Value>,
        events: &mut Vec<MessagesStreamEvent>,
    ) {
        if self.open == Some(kind) && kind != OpenBlock::Tool {
            return;
        }
        self.close_open_block(events);
        let content_block = content_block.unwrap_or_else(|| match kind {
            OpenBlock::Text => json!({"type": "text", "text": ""}),
            OpenBlock::Thinking => json!({"type": "thinking", "thinking": ""}),
            OpenBlock::Tool => json!({"type": "tool_use", "id": "", "name": "", "input": {}}),
        });
        events.push(MessagesStreamEvent::ContentBlockStart {
            index: self.next_index,
            content_block,
        });
        self.next_index += 1;
        self.open = Some(kind);
    }

    fn push_tool_chunk(&mut self, call: ToolCallChunk, events: &mut Vec<MessagesStreamEvent>) {
        if self.current_tool != Some(call.index) || self.open != Some(OpenBlock::Tool) {
            let function = call.function.as_ref();
            let block = json!({
                "type": "tool_use",
                "id": call.id.clone().unwrap_or_default(),
                "name": function.and_then(|f| f.name.clone()).unwrap_or_default(),
                "input": {},
            });
            self.close_open_block(events);
            events.push(MessagesStreamEvent::ContentBlockStart {
                index: self.next_index,
                content_block: block,
            });
            self.next_index += 1;
            self.open = Some(OpenBlock::Tool);
            self.current_tool = Some(call.index);
        }
        if let Some(arguments) = call.function.and_then(|f| f.arguments)
            && !arguments.is_empty()
        {
            events.push(MessagesStreamEvent::ContentBlockDelta {
                index: self.next_index - 1,
                delta: json!({"type": "input_json_delta", "partial_json": arguments}),
            });
        }
    }

    fn close_open_block(&mut self, events: &mut Vec<MessagesStreamEvent>) {
        if self.open.take().is_some() {
            events.push(MessagesStreamEvent::ContentBlockStop {
                index: self.next_index - 1,
            });
        }
        self.current_tool = None;
    }
}

fn usage_to_claude(usage: &Value) -> Value {
    json!({
        "input_tokens": usage.get("prompt_tokens").and_then(Value::as_u64).unwrap_or(0),
        "output_tokens": usage.get("completion_tokens").and_then(Value::as_u64).unwrap_or(0),
    })
}

/// Reassembles Anthropic Messages stream events into OpenAI chat chunks.
///
/// Used when the entry protocol is chat-shaped and the upstream target is an
/// Anthropic provider.
#[derive(Debug)]
pub struct ClaudeToChatStream {
    id: String,
    model: String,
    created: i64,
    role_sent: bool,
    finished: bool,
    next_tool_slot: i64,
    tools_by_block: HashMap<usize, i64>,
    usage: Option<Value>,
}

impl ClaudeToChatStream {
    pub fn new(created: i64) -> Self {
        Self {
            id: "chatcmpl".to_string(),
            model: "unknown".to_string(),
            created,
            role_sent: false,
            finished: false,
            next_tool_slot: 0,
            tools_by_block: HashMap::new(),
            usage: None,
        }
    }

    pub fn push_event(&mut self, event: MessagesStreamEvent) -> Vec<ChatCompletionChunk> {
        match event {
            MessagesStreamEvent::MessageStart { message } => {
                if let Some(id) = message.get("id").and_then(Value::as_str) {
                    self.id = id.to_string();
                }
                if let Some(model) = message.get("model").and_then(Value::as_str) {
                    self.model = model.to_string();
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
            MessagesStreamEvent::ContentBlockStart {
                index,
                content_block,
            } => {
                if content_block.get("type").and_then(Value::as_str) != Some("tool_use") {
                    return Vec::new();
                }
                let slot = self.next_tool_slot;
                self.next_tool_slot += 1;
                self.tools_by_block.insert(index, slot);
                vec![self.tool_chunk(
                    slot,
                    content_block
                        .get("id")
                        .and_then(Value::as_str)
                        .map(|id| id.to_string()),
                    content_block
                        .get("name")
                        .and_then(Value::as_str)
                        .map(|name| name.to_string()),
                    None,
                )]
            }
            MessagesStreamEvent::ContentBlockDelta { index, delta } => {
                match delta.get("type").and_then(Value::as_str) {
                    Some("text_delta") => {
                        let text = delta
                            .get("text")
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
                    Some("thinking_delta") => {
                        let text = delta
                            .get("thinking")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string();
                        vec![self.chunk(
                            ChatDelta {
                                reasoning_content: Some(text),
                                ..Default::default()
                            },
                            None,
                        )]
                    }
                    Some("input_json_delta") => {
                        let Some(slot) = self.tools_by_block.get(&index).copied() else {
                            return Vec::new();
                        };
                        let partial = delta
                            .get("partial_json")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string();
                        vec![self.tool_chunk(slot, None, None, Some(partial))]
                    }
                    _ => Vec::new(),
                }
            }
            MessagesStreamEvent::MessageDelta { delta, usage } => {
                if usage.is_some() {
                    self.usage = usage;
                }
                let Some(stop) = delta.get("stop_reason").and_then(Value::as_str) else {
                    return Vec::new();
                };
                self.finished = true;
                let finish = finish_reason_from_stop(Some(stop)).to_string();
                let mut chunk = self.chunk(ChatDelta::default(), Some(finish));
                chunk.usage = self.usage.as_ref().map(usage_to_chat);
                vec![chunk]
            }
            MessagesStreamEvent::MessageStop
            | MessagesStreamEvent::Ping
            | MessagesStreamEvent::ContentBlockStop { .. }
            | MessagesStreamEvent::Error { .. } => Vec::new(),
        }
    }

    /// Terminal fallback: guarantee a finish chunk when upstream never sent a
    /// `message_delta` with a stop reason.
    pub fn finish(&mut self) -> Vec<ChatCompletionChunk> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;
        vec![self.chunk(ChatDelta::default(), Some("stop".to_string()))]
    }

    fn chunk(&self, delta: ChatDelta, finish_reason: Option<String>) -> ChatCompletionChunk {
        let mut chunk = ChatCompletionChunk::empty(self.id.clone(), self.model.clone(), self.created);
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

fn usage_to_chat(usage: &Value) -> Value {
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

//! Anthropic Messages stream events. The SSE `event:` name always matches the
//! payload's `type` field; both are emitted on the wire.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::sse::SseEvent;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessagesStreamEvent {
    MessageStart {
        message: Value,
    },
    ContentBlockStart {
        index: usize,
        content_block: Value,
    },
    ContentBlockDelta {
        index: usize,
        delta: Value,
    },
    ContentBlockStop {
        index: usize,
    },
    MessageDelta {
        delta: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        usage: Option<Value>,
    },
    MessageStop,
    Ping,
    Error {
        error: Value,
    },
}

impl MessagesStreamEvent {
    pub fn event_name(&self) -> &'static str {
        match self {
            MessagesStreamEvent::MessageStart { .. } => "message_start",
            MessagesStreamEvent::ContentBlockStart { .. } => "content_block_start",
            MessagesStreamEvent::ContentBlockDelta { .. } => "content_block_delta",
            MessagesStreamEvent::ContentBlockStop { .. } => "content_block_stop",
            MessagesStreamEvent::MessageDelta { .. } => "message_delta",
            MessagesStreamEvent::MessageStop => "message_stop",
            MessagesStreamEvent::Ping => "ping",
            MessagesStreamEvent::Error { .. } => "error",
        }
    }

    pub fn to_sse(&self) -> SseEvent {
        let data = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        SseEvent::named(self.event_name(), data)
    }

    pub fn parse(event: &SseEvent) -> Option<Self> {
        serde_json::from_str(&event.data).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn event_name_matches_payload_type() {
        let event = MessagesStreamEvent::ContentBlockDelta {
            index: 0,
            delta: json!({"type": "text_delta", "text": "hi"}),
        };
        let sse = event.to_sse();
        assert_eq!(sse.event.as_deref(), Some("content_block_delta"));
        let payload: Value = serde_json::from_str(&sse.data).unwrap();
        assert_eq!(payload["type"], "content_block_delta");
        assert_eq!(MessagesStreamEvent::parse(&sse), Some(event));
    }

    #[test]
    fn message_stop_is_a_bare_type() {
        let sse = MessagesStreamEvent::MessageStop.to_sse();
        assert_eq!(sse.data, "{\"type\":\"message_stop\"}");
    }
}

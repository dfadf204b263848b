//! Streaming control: adapt upstream frames into canonical chat chunks and
//! encode canonical chunks onto the client's entry protocol.
//!
//! Four modes fall out of (client stream?, upstream stream?): pass-through,
//! collect (upstream SSE → client JSON), synthesize (upstream JSON → client
//! SSE), and direct JSON. The adapters here are the per-frame halves; the
//! engine owns pacing, heartbeats, and cancellation.

use bytes::Bytes;

use routecodex_common::{EntryProtocol, GatewayError, ProviderFamily};
use routecodex_protocol::claude::stream::MessagesStreamEvent;
use routecodex_protocol::openai::chat::ChatCompletionChunk;
use routecodex_protocol::openai::responses::ResponsesResponse;
use routecodex_protocol::sse::{SseEvent, encode_event};
use routecodex_switch::claude_chat::stream::{ChatToClaudeStream, ClaudeToChatStream};
use routecodex_switch::responses_chat::stream::{ChatToResponsesStream, ResponsesToChatStream};

/// Upstream SSE events → canonical chat chunks, per provider family.
pub enum ChunkAdapter {
    Chat { done: bool },
    Claude(Box<ClaudeToChatStream>),
    Responses(Box<ResponsesToChatStream>),
}

impl ChunkAdapter {
    pub fn for_family(family: ProviderFamily, created: i64) -> Self {
        match family {
            ProviderFamily::OpenAiChat => ChunkAdapter::Chat { done: false },
            ProviderFamily::Anthropic => {
                ChunkAdapter::Claude(Box::new(ClaudeToChatStream::new(created)))
            }
            ProviderFamily::OpenAiResponses => {
                ChunkAdapter::Responses(Box::new(ResponsesToChatStream::new(created)))
            }
        }
    }

    pub fn push(&mut self, event: &SseEvent) -> Vec<ChatCompletionChunk> {
        match self {
            ChunkAdapter::Chat { done } => {
                if *done || event.is_done() {
                    *done = true;
                    return Vec::new();
                }
                match serde_json::from_str::<ChatCompletionChunk>(&event.data) {
                    Ok(chunk) => vec![chunk],
                    Err(_) => Vec::new(),
                }
            }
            ChunkAdapter::Claude(stream) => match MessagesStreamEvent::parse(event) {
                Some(parsed) => stream.push_event(parsed),
                None => Vec::new(),
            },
            ChunkAdapter::Responses(stream) => stream.push_sse(event),
        }
    }

    /// Whether the upstream protocol has signalled its terminal frame.
    pub fn saw_terminal(&self, event: &SseEvent) -> bool {
        match self {
            ChunkAdapter::Chat { .. } => event.is_done(),
            ChunkAdapter::Claude(_) => event.event.as_deref() == Some("message_stop"),
            ChunkAdapter::Responses(_) => matches!(
                event.event.as_deref(),
                Some("response.completed") | Some("response.failed")
                    | Some("response.required_action")
            ),
        }
    }

    pub fn finish(&mut self) -> Vec<ChatCompletionChunk> {
        match self {
            ChunkAdapter::Chat { .. } => Vec::new(),
            ChunkAdapter::Claude(stream) => stream.finish(),
            ChunkAdapter::Responses(stream) => stream.finish(),
        }
    }
}

/// Canonical chat chunks → client wire frames, per entry protocol.
pub enum EntryEncoder {
    Chat,
    Claude(Box<ChatToClaudeStream>),
    Responses(Box<ChatToResponsesStream>),
}

impl EntryEncoder {
    pub fn new(entry: EntryProtocol, response_id: &str, model: &str, created: i64) -> Self {
        match entry {
            EntryProtocol::OpenAiChat => EntryEncoder::Chat,
            EntryProtocol::AnthropicMessages => EntryEncoder::Claude(Box::new(
                ChatToClaudeStream::new(response_id.to_string(), model.to_string()),
            )),
            EntryProtocol::OpenAiResponses => EntryEncoder::Responses(Box::new(
                ChatToResponsesStream::new(response_id.to_string(), model.to_string(), created),
            )),
        }
    }

    pub fn on_chunk(&mut self, chunk: ChatCompletionChunk) -> Vec<Bytes> {
        match self {
            EntryEncoder::Chat => {
                let data = serde_json::to_string(&chunk).unwrap_or_else(|_| "{}".to_string());
                vec![encode_event(&SseEvent::data_only(data))]
            }
            EntryEncoder::Claude(stream) => stream
                .push_chunk(chunk)
                .iter()
                .map(|event| encode_event(&event.to_sse()))
                .collect(),
            EntryEncoder::Responses(stream) => stream
                .push_chunk(chunk)
                .iter()
                .map(encode_event)
                .collect(),
        }
    }

    /// Terminal frames. For the Responses entry this also surfaces the
    /// assembled response so the engine can park a tool-loop continuation.
    pub fn finish(&mut self) -> (Vec<Bytes>, Option<ResponsesResponse>) {
        match self {
            EntryEncoder::Chat => (
                vec![encode_event(&SseEvent::data_only("[DONE]"))],
                None,
            ),
            EntryEncoder::Claude(stream) => (
                stream
                    .finish()
                    .iter()
                    .map(|event| encode_event(&event.to_sse()))
                    .collect(),
                None,
            ),
            EntryEncoder::Responses(stream) => {
                let built = stream.build_response();
                let frames = stream.finish().iter().map(encode_event).collect();
                (frames, Some(built))
            }
        }
    }
}

/// Terminal error frame for a stream that already sent its first byte.
pub fn error_frame(entry: EntryProtocol, err: &GatewayError) -> Bytes {
    let body = err.wire_body(entry).to_string();
    encode_event(&SseEvent::named("error", body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn chat_adapter_stops_at_done() {
        let mut adapter = ChunkAdapter::for_family(ProviderFamily::OpenAiChat, 0);
        let chunks = adapter.push(&SseEvent::data_only(
            json!({
                "id": "c", "created": 0, "model": "m",
                "choices": [{"index": 0, "delta": {"content": "x"}}],
            })
            .to_string(),
        ));
        assert_eq!(chunks.len(), 1);
        let done = SseEvent::data_only("[DONE]");
        assert!(adapter.saw_terminal(&done));
        assert!(adapter.push(&done).is_empty());
    }

    #[test]
    fn chat_encoder_emits_done_marker() {
        let mut encoder = EntryEncoder::new(EntryProtocol::OpenAiChat, "resp", "m", 0);
        let (frames, built) = encoder.finish();
        assert!(built.is_none());
        let text = String::from_utf8(frames[0].to_vec()).unwrap();
        assert_eq!(text, "data: [DONE]\n\n");
    }

    #[test]
    fn claude_encoder_closes_with_message_stop() {
        let mut encoder = EntryEncoder::new(EntryProtocol::AnthropicMessages, "msg_1", "m", 0);
        let chunk: ChatCompletionChunk = serde_json::from_value(json!({
            "id": "c", "created": 0, "model": "m",
            "choices": [{"index": 0, "delta": {"content": "hello"}}],
        }))
        .unwrap();
        let mid: Vec<String> = encoder
            .on_chunk(chunk)
            .iter()
            .map(|frame| String::from_utf8(frame.to_vec()).unwrap())
            .collect();
        assert!(mid.iter().any(|frame| frame.contains("message_start")));
        let (frames, _) = encoder.finish();
        let tail = String::from_utf8(frames.last().unwrap().to_vec()).unwrap();
        assert!(tail.contains("message_stop"));
    }

    #[test]
    fn error_frame_is_entry_shaped() {
        let err = GatewayError::Timeout("deadline".to_string());
        let frame = String::from_utf8(
            error_frame(EntryProtocol::AnthropicMessages, &err).to_vec(),
        )
        .unwrap();
        assert!(frame.starts_with("event: error\n"));
        assert!(frame.contains("\"type\":\"error\""));
    }
}

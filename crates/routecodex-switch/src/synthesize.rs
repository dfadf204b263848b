//! Non-stream → stream synthesis: when a client asked for SSE but the
//! upstream target only returned JSON, chunk the finished response into
//! incremental chat deltas. The engine paces emission and converts the chunks
//! onto the entry protocol.

use routecodex_protocol::openai::chat::{
    ChatChunkChoice, ChatCompletionChunk, ChatCompletionResponse, ChatDelta, ChatRole,
    ToolCallChunk, ToolCallChunkFunction,
};

pub const DEFAULT_DELTA_WINDOW: usize = 24;

/// Split text into windows of at most `window` scalar values. Splitting on
/// `char` boundaries keeps every chunk valid UTF-8.
pub fn chunk_text(text: &str, window: usize) -> Vec<String> {
    let window = window.max(1);
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut count = 0usize;
    for ch in text.chars() {
        current.push(ch);
        count += 1;
        if count == window {
            chunks.push(std::mem::take(&mut current));
            count = 0;
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Expand a finished chat response into a chunk sequence: role first, then
/// reasoning and content windows, one chunk per tool call, and a single
/// terminal chunk carrying the finish reason and usage.
pub fn synthesize_chat_chunks(
    response: &ChatCompletionResponse,
    window: usize,
) -> Vec<ChatCompletionChunk> {
    let mut chunks = Vec::new();
    let base = |delta: ChatDelta, finish: Option<String>| {
        let mut chunk = ChatCompletionChunk::empty(
            response.id.clone(),
            response.model.clone(),
            response.created,
        );
        chunk.choices.push(ChatChunkChoice {
            index: 0,
            delta,
            finish_reason: finish,
        });
        chunk
    };

    chunks.push(base(
        ChatDelta {
            role: Some(ChatRole::Assistant),
            ..Default::default()
        },
        None,
    ));

    let Some(choice) = response.choices.first() else {
        chunks.push(base(ChatDelta::default(), Some("stop".to_string())));
        return chunks;
    };

    if let Some(reasoning) = &choice.message.reasoning_content {
        for piece in chunk_text(reasoning, window) {
            chunks.push(base(
                ChatDelta {
                    reasoning_content: Some(piece),
                    ..Default::default()
                },
                None,
            ));
        }
    }

    if let Some(content) = &choice.message.content {
        for piece in chunk_text(content, window) {
            chunks.push(base(
                ChatDelta {
                    content: Some(piece),
                    ..Default::default()
                },
                None,
            ));
        }
    }

    for (slot, call) in choice.message.tool_calls.iter().flatten().enumerate() {
        chunks.push(base(
            ChatDelta {
                tool_calls: Some(vec![ToolCallChunk {
                    index: slot as i64,
                    id: call.id.clone(),
                    kind: Some("function".to_string()),
                    function: Some(ToolCallChunkFunction {
                        name: Some(call.function.name.clone()),
                        arguments: Some(call.function.arguments.clone()),
                    }),
                }]),
                ..Default::default()
            },
            None,
        ));
    }

    let mut last = base(
        ChatDelta::default(),
        Some(
            choice
                .finish_reason
                .clone()
                .unwrap_or_else(|| "stop".to_string()),
        ),
    );
    last.usage = response.usage.clone();
    chunks.push(last);
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn chunking_respects_utf8_boundaries() {
        let text = "héllo wörld 你好世界";
        let pieces = chunk_text(text, 3);
        assert!(pieces.iter().all(|piece| piece.chars().count() <= 3));
        assert_eq!(pieces.concat(), text);
    }

    #[test]
    fn finish_reason_only_on_last_chunk() {
        let response: ChatCompletionResponse = serde_json::from_value(json!({
            "id": "chatcmpl-1",
            "created": 1,
            "model": "glm-4.6",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "a fairly long answer body"},
                "finish_reason": "stop",
            }],
            "usage": {"prompt_tokens": 1, "completion_tokens": 5, "total_tokens": 6},
        }))
        .unwrap();

        let chunks = synthesize_chat_chunks(&response, 4);
        assert!(chunks.len() > 3);
        for chunk in &chunks[..chunks.len() - 1] {
            assert!(chunk.choices[0].finish_reason.is_none());
        }
        let last = chunks.last().unwrap();
        assert_eq!(last.choices[0].finish_reason.as_deref(), Some("stop"));
        assert!(last.usage.is_some());
        // Role arrives first.
        assert_eq!(chunks[0].choices[0].delta.role, Some(ChatRole::Assistant));
    }

    #[test]
    fn tool_calls_emit_one_chunk_each() {
        let response: ChatCompletionResponse = serde_json::from_value(json!({
            "id": "chatcmpl-2",
            "created": 0,
            "model": "m",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": null, "tool_calls": [
                    {"id": "call_1", "type": "function",
                     "function": {"name": "echo", "arguments": "{}"}},
                    {"id": "call_2", "type": "function",
                     "function": {"name": "add", "arguments": "{\"a\":1}"}},
                ]},
                "finish_reason": "tool_calls",
            }],
        }))
        .unwrap();

        let chunks = synthesize_chat_chunks(&response, DEFAULT_DELTA_WINDOW);
        let tool_chunks: Vec<_> = chunks
            .iter()
            .filter(|chunk| chunk.choices[0].delta.tool_calls.is_some())
            .collect();
        assert_eq!(tool_chunks.len(), 2);
        assert_eq!(
            tool_chunks[1].choices[0].delta.tool_calls.as_ref().unwrap()[0].index,
            1
        );
    }
}

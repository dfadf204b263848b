use serde_json::{Map, Value, json};

use routecodex_protocol::claude::messages::{MessagesResponse, Usage};
use routecodex_protocol::openai::chat::{
    ChatChoice, ChatCompletionResponse, ChatResponseMessage, ChatRole, ToolCall,
};

use super::{arguments_to_input, finish_reason_from_stop, stop_reason_from_finish};

/// Convert a chat-canonical response into an Anthropic Messages response.
pub fn chat_to_messages(response: ChatCompletionResponse) -> MessagesResponse {
    let choice = response.choices.into_iter().next();
    let mut content = Vec::new();
    let mut stop_reason = "end_turn";

    if let Some(choice) = &choice {
        if let Some(reasoning) = &choice.message.reasoning_content
            && !reasoning.is_empty()
        {
            content.push(json!({"type": "thinking", "thinking": reasoning}));
        }
        if let Some(text) = &choice.message.content
            && !text.is_empty()
        {
            content.push(json!({"type": "text", "text": text}));
        }
        for call in choice.message.tool_calls.iter().flatten() {
            content.push(json!({
                "type": "tool_use",
                "id": call.id.clone().unwrap_or_default(),
                "name": call.function.name,
                "input": arguments_to_input(&call.function.arguments),
            }));
        }
        stop_reason = stop_reason_from_finish(choice.finish_reason.as_deref());
    }

    MessagesResponse {
        id: response.id,
        kind: "message".to_string(),
        role: "assistant".to_string(),
        model: response.model,
        content,
        stop_reason: Some(stop_reason.to_string()),
        stop_sequence: None,
        usage: usage_to_claude(response.usage.as_ref()),
        extra: Map::new(),
    }
}

/// Convert an Anthropic Messages response into the chat canonical form.
pub fn messages_to_chat(response: MessagesResponse) -> ChatCompletionResponse {
    let mut text = String::new();
    let mut reasoning = String::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();

    for block in &response.content {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => {
                if let Some(part) = block.get("text").and_then(Value::as_str) {
                    text.push_str(part);
                }
            }
            Some("thinking") => {
                if let Some(part) = block.get("thinking").and_then(Value::as_str) {
                    reasoning.push_str(part);
                }
            }
            Some("tool_use") => {
                let input = block.get("input").cloned().unwrap_or(json!({}));
                tool_calls.push(ToolCall::function(
                    block.get("id").and_then(Value::as_str).unwrap_or_default(),
                    block
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or_default(),
                    input.to_string(),
                ));
            }
            _ => {}
        }
    }

    let finish = finish_reason_from_stop(response.stop_reason.as_deref());
    ChatCompletionResponse {
        id: response.id,
        object: "chat.completion".to_string(),
        created: 0,
        model: response.model,
        choices: vec![ChatChoice {
            index: 0,
            message: ChatResponseMessage {
                role: ChatRole::Assistant,
                content: (!text.is_empty()).then_some(text),
                reasoning_content: (!reasoning.is_empty()).then_some(reasoning),
                tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
                extra: Map::new(),
            },
            finish_reason: Some(finish.to_string()),
            extra: Map::new(),
        }],
        usage: usage_to_chat(&response.usage),
        extra: Map::new(),
    }
}

fn usage_to_claude(usage: Option<&Value>) -> Usage {
    let Some(usage) = usage else {
        return Usage::default();
    };
    Usage {
        input_tokens: usage.get("prompt_tokens").and_then(Value::as_u64),
        output_tokens: usage.get("completion_tokens").and_then(Value::as_u64),
        extra: Map::new(),
    }
}

fn usage_to_chat(usage: &Usage) -> Option<Value> {
    let input = usage.input_tokens?;
    let output = usage.output_tokens.unwrap_or(0);
    Some(json!({
        "prompt_tokens": input,
        "completion_tokens": output,
        "total_tokens": input + output,
    }))
}

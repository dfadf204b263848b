use serde_json::{Map, Value, json};

use routecodex_protocol::openai::chat::{
    ChatChoice, ChatCompletionResponse, ChatResponseMessage, ChatRole, ToolCall,
};
use routecodex_protocol::openai::responses::{
    RequiredAction, ResponseToolCall, ResponseToolCallFunction, ResponsesResponse,
    SubmitToolOutputsAction,
};

/// Convert a chat-canonical response into a Responses response.
///
/// When the assistant produced tool calls, the response surfaces them both as
/// `function_call` output items and as a `required_action`, and the status
/// switches to `requires_action` so the engine can hold the tool loop open.
pub fn chat_to_responses(response: ChatCompletionResponse, response_id: &str) -> ResponsesResponse {
    let choice = response.choices.into_iter().next();
    let mut output = Vec::new();
    let mut pending_calls = Vec::new();

    if let Some(choice) = &choice {
        if let Some(reasoning) = &choice.message.reasoning_content
            && !reasoning.is_empty()
        {
            output.push(json!({
                "type": "reasoning",
                "content": [{"type": "reasoning_text", "text": reasoning}],
            }));
        }
        if let Some(text) = &choice.message.content
            && !text.is_empty()
        {
            output.push(json!({
                "type": "message",
                "role": "assistant",
                "status": "completed",
                "content": [{"type": "output_text", "text": text, "annotations": []}],
            }));
        }
        for call in choice.message.tool_calls.iter().flatten() {
            let call_id = call.id.clone().unwrap_or_default();
            output.push(json!({
                "type": "function_call",
                "call_id": call_id,
                "name": call.function.name,
                "arguments": call.function.arguments,
                "status": "completed",
            }));
            pending_calls.push(ResponseToolCall {
                id: call_id,
                kind: "function".to_string(),
                function: ResponseToolCallFunction {
                    name: call.function.name.clone(),
                    arguments: call.function.arguments.clone(),
                },
            });
        }
    }

    let requires_action = !pending_calls.is_empty();
    ResponsesResponse {
        id: response_id.to_string(),
        object: "response".to_string(),
        created_at: response.created,
        status: if requires_action {
            "requires_action".to_string()
        } else {
            "completed".to_string()
        },
        model: response.model,
        output,
        required_action: requires_action.then(|| RequiredAction {
            kind: "submit_tool_outputs".to_string(),
            submit_tool_outputs: SubmitToolOutputsAction {
                tool_calls: pending_calls,
            },
        }),
        usage: response.usage.as_ref().map(usage_to_responses),
        error: None,
        extra: Map::new(),
    }
}

/// Convert a Responses response into the chat canonical form.
pub fn responses_to_chat(response: ResponsesResponse) -> ChatCompletionResponse {
    let mut text = String::new();
    let mut reasoning = String::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();

    for item in &response.output {
        match item.get("type").and_then(Value::as_str) {
            Some("message") => {
                if let Some(parts) = item.get("content").and_then(Value::as_array) {
                    for part in parts {
                        if let Some(part_text) = part.get("text").and_then(Value::as_str) {
                            text.push_str(part_text);
                        }
                    }
                }
            }
            Some("reasoning") => {
                if let Some(parts) = item.get("content").and_then(Value::as_array) {
                    for part in parts {
                        if let Some(part_text) = part.get("text").and_then(Value::as_str) {
                            reasoning.push_str(part_text);
                        }
                    }
                }
            }
            Some("function_call") => {
                tool_calls.push(ToolCall::function(
                    item.get("call_id")
                        .or_else(|| item.get("id"))
                        .and_then(Value::as_str)
                        .unwrap_or_default(),
                    item.get("name").and_then(Value::as_str).unwrap_or_default(),
                    item.get("arguments")
                        .and_then(Value::as_str)
                        .unwrap_or("{}")
                        .to_string(),
                ));
            }
            _ => {}
        }
    }

    let finish = if !tool_calls.is_empty() {
        "tool_calls"
    } else if response.status == "incomplete" {
        "length"
    } else {
        "stop"
    };

    ChatCompletionResponse {
        id: response.id,
        object: "chat.completion".to_string(),
        created: response.created_at,
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
        usage: response.usage.as_ref().map(usage_to_chat),
        extra: Map::new(),
    }
}

fn usage_to_responses(usage: &Value) -> Value {
    let input = usage
        .get("prompt_tokens")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let output = usage
        .get("completion_tokens")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    json!({
        "input_tokens": input,
        "output_tokens": output,
        "total_tokens": input + output,
    })
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

#[cfg(test)]
mod tests {
    use super::*;

    fn chat_response(message: Value, finish: &str) -> ChatCompletionResponse {
        serde_json::from_value(json!({
            "id": "chatcmpl-1",
            "model": "gpt-5",
            "created": 10,
            "choices": [{"index": 0, "message": message, "finish_reason": finish}],
        }))
        .unwrap()
    }

    #[test]
    fn tool_calls_surface_as_required_action() {
        let response = chat_to_responses(
            chat_response(
                json!({
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1", "type": "function",
                        "function": {"name": "echo", "arguments": "{\"text\":\"ping\"}"},
                    }],
                }),
                "tool_calls",
            ),
            "resp_abc",
        );

        assert_eq!(response.status, "requires_action");
        let action = response.required_action.unwrap();
        assert_eq!(action.submit_tool_outputs.tool_calls.len(), 1);
        assert_eq!(action.submit_tool_outputs.tool_calls[0].function.name, "echo");
        assert_eq!(response.output[0]["type"], "function_call");
    }

    #[test]
    fn plain_text_completes_with_output_text() {
        let response = chat_to_responses(
            chat_response(json!({"role": "assistant", "content": "pong"}), "stop"),
            "resp_1",
        );
        assert_eq!(response.status, "completed");
        assert_eq!(response.output_text(), "pong");
        assert!(response.required_action.is_none());
    }

    #[test]
    fn responses_output_maps_back_to_chat() {
        let responses: ResponsesResponse = serde_json::from_value(json!({
            "id": "resp_2",
            "status": "completed",
            "model": "gpt-5",
            "created_at": 3,
            "output": [
                {"type": "function_call", "call_id": "call_7", "name": "echo", "arguments": "{}"},
            ],
            "usage": {"input_tokens": 4, "output_tokens": 6},
        }))
        .unwrap();

        let chat = responses_to_chat(responses);
        let choice = &chat.choices[0];
        assert_eq!(choice.finish_reason.as_deref(), Some("tool_calls"));
        assert_eq!(
            choice.message.tool_calls.as_ref().unwrap()[0]
                .id
                .as_deref(),
            Some("call_7")
        );
        assert_eq!(chat.usage.as_ref().unwrap()["prompt_tokens"], 4);
    }
}

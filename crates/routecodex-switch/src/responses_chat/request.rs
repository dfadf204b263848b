use serde_json::{Map, Value, json};

use routecodex_protocol::openai::chat::{
    ChatCompletionRequest, ChatContent, ChatMessage, ChatRole, FunctionDefinition, ToolCall,
    ToolDefinition, part_text,
};
use routecodex_protocol::openai::responses::ResponsesRequest;

/// Convert a Responses request into the chat canonical form, for targets that
/// only speak Chat Completions.
pub fn responses_to_chat(request: ResponsesRequest) -> ChatCompletionRequest {
    let mut messages = Vec::new();
    if let Some(instructions) = &request.instructions
        && !instructions.is_empty()
    {
        messages.push(ChatMessage::text(ChatRole::System, instructions.clone()));
    }

    for item in request.input_items() {
        map_input_item(&item, &mut messages);
    }

    let tools = request.tools.as_ref().map(|tools| {
        tools
            .iter()
            .filter_map(|tool| map_tool_to_chat(tool))
            .collect::<Vec<_>>()
    });

    ChatCompletionRequest {
        model: request.model,
        messages,
        tools,
        tool_choice: request.tool_choice,
        stream: request.stream,
        max_tokens: request.max_output_tokens,
        temperature: request.temperature,
        top_p: request.top_p,
        stop: None,
        response_format: None,
        extra: Map::new(),
    }
}

/// Convert the chat canonical form into a Responses request, for targets that
/// speak the Responses protocol natively.
pub fn chat_to_responses(request: ChatCompletionRequest) -> ResponsesRequest {
    let mut instructions = Vec::new();
    let mut input = Vec::new();

    for message in &request.messages {
        match message.role {
            ChatRole::System | ChatRole::Developer => {
                if let Some(content) = &message.content {
                    instructions.push(content.joined_text());
                }
            }
            ChatRole::Tool => input.push(json!({
                "type": "function_call_output",
                "call_id": message.tool_call_id.clone().unwrap_or_default(),
                "output": message
                    .content
                    .as_ref()
                    .map(ChatContent::joined_text)
                    .unwrap_or_default(),
            })),
            ChatRole::Assistant => {
                if let Some(content) = &message.content {
                    let text = content.joined_text();
                    if !text.is_empty() {
                        input.push(json!({
                            "type": "message",
                            "role": "assistant",
                            "content": [{"type": "output_text", "text": text}],
                        }));
                    }
                }
                for call in message.tool_calls.iter().flatten() {
                    input.push(json!({
                        "type": "function_call",
                        "call_id": call.id.clone().unwrap_or_default(),
                        "name": call.function.name,
                        "arguments": call.function.arguments,
                    }));
                }
            }
            _ => {
                if let Some(content) = &message.content {
                    input.push(json!({
                        "type": "message",
                        "role": "user",
                        "content": user_content_to_items(content),
                    }));
                }
            }
        }
    }

    let tools = request.tools.map(|tools| {
        tools
            .into_iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "name": tool.function.name,
                    "description": tool.function.description,
                    "parameters": tool.function.parameters,
                })
            })
            .collect::<Vec<_>>()
    });

    ResponsesRequest {
        model: request.model,
        input: Value::Array(input),
        instructions: (!instructions.is_empty()).then(|| instructions.join("\n")),
        tools,
        tool_choice: request.tool_choice,
        stream: request.stream,
        max_output_tokens: request.max_tokens,
        temperature: request.temperature,
        top_p: request.top_p,
        previous_response_id: None,
        extra: Map::new(),
    }
}

fn map_input_item(item: &Value, messages: &mut Vec<ChatMessage>) {
    let kind = item.get("type").and_then(Value::as_str);
    match kind {
        Some("function_call") => {
            let call_id = item
                .get("call_id")
                .or_else(|| item.get("id"))
                .and_then(Value::as_str)
                .unwrap_or_default();
            let call = ToolCall::function(
                call_id,
                item.get("name").and_then(Value::as_str).unwrap_or_default(),
                item.get("arguments")
                    .and_then(Value::as_str)
                    .unwrap_or("{}")
                    .to_string(),
            );
            messages.push(ChatMessage {
                role: ChatRole::Assistant,
                content: None,
                tool_calls: Some(vec![call]),
                tool_call_id: None,
                reasoning_content: None,
                name: None,
                extra: Map::new(),
            });
        }
        Some("function_call_output") => {
            messages.push(ChatMessage::tool_reply(
                item.get("call_id")
                    .and_then(Value::as_str)
                    .unwrap_or_default(),
                item.get("output")
                    .and_then(Value::as_str)
                    .unwrap_or_default(),
            ));
        }
        Some("reasoning") => {}
        // Bare role items and explicit `message` items are both messages.
        _ if item.get("role").is_some() => {
            let role = match item.get("role").and_then(Value::as_str) {
                Some("assistant") => ChatRole::Assistant,
                Some("system") | Some("developer") => ChatRole::System,
                _ => ChatRole::User,
            };
            if let Some(content) = item.get("content") {
                messages.push(ChatMessage {
                    role,
                    content: Some(item_content_to_chat(content)),
                    tool_calls: None,
                    tool_call_id: None,
                    reasoning_content: None,
                    name: None,
                    extra: Map::new(),
                });
            }
        }
        _ => {}
    }
}

fn item_content_to_chat(content: &Value) -> ChatContent {
    match content {
        Value::String(text) => ChatContent::Text(text.clone()),
        Value::Array(parts) => {
            let has_images = parts
                .iter()
                .any(|part| part.get("type").and_then(Value::as_str) == Some("input_image"));
            if has_images {
                ChatContent::Parts(
                    parts
                        .iter()
                        .filter_map(|part| match part.get("type").and_then(Value::as_str) {
                            Some("input_image") => {
                                let url = part.get("image_url").and_then(Value::as_str)?;
                                Some(json!({"type": "image_url", "image_url": {"url": url}}))
                            }
                            _ => part_text(part)
                                .map(|text| json!({"type": "text", "text": text})),
                        })
                        .collect(),
                )
            } else {
                let text: String = parts.iter().filter_map(part_text).collect();
                ChatContent::Text(text)
            }
        }
        _ => ChatContent::Text(String::new()),
    }
}

fn user_content_to_items(content: &ChatContent) -> Vec<Value> {
    match content {
        ChatContent::Text(text) => vec![json!({"type": "input_text", "text": text})],
        ChatContent::Parts(parts) => parts
            .iter()
            .filter_map(|part| match part.get("type").and_then(Value::as_str) {
                Some("image_url") => {
                    let url = part
                        .get("image_url")
                        .and_then(|image| image.get("url"))
                        .and_then(Value::as_str)?;
                    Some(json!({"type": "input_image", "image_url": url}))
                }
                _ => part_text(part).map(|text| json!({"type": "input_text", "text": text})),
            })
            .collect(),
    }
}

fn map_tool_to_chat(tool: &Value) -> Option<ToolDefinition> {
    // Responses tools are flat; chat nests the function object. Accept both.
    if let Some(function) = tool.get("function") {
        return serde_json::from_value(json!({
            "type": "function",
            "function": function,
        }))
        .ok();
    }
    let name = tool.get("name").and_then(Value::as_str)?;
    Some(ToolDefinition {
        kind: "function".to_string(),
        function: FunctionDefinition {
            name: name.to_string(),
            description: tool
                .get("description")
                .and_then(Value::as_str)
                .map(|text| text.to_string()),
            parameters: tool.get("parameters").cloned(),
            strict: tool.get("strict").and_then(Value::as_bool),
        },
        extra: Map::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_tools_and_instructions_map_into_chat() {
        let request: ResponsesRequest = serde_json::from_value(json!({
            "model": "gpt-5",
            "instructions": "be brief",
            "input": "call echo with text=ping",
            "tools": [{"type": "function", "name": "echo",
                       "parameters": {"type": "object", "properties": {"text": {"type": "string"}}}}],
        }))
        .unwrap();

        let chat = responses_to_chat(request);
        assert_eq!(chat.messages[0].role, ChatRole::System);
        assert_eq!(chat.messages[1].role, ChatRole::User);
        assert_eq!(chat.tools.as_ref().unwrap()[0].function.name, "echo");
    }

    #[test]
    fn function_call_items_become_assistant_tool_calls() {
        let request: ResponsesRequest = serde_json::from_value(json!({
            "model": "gpt-5",
            "input": [
                {"type": "message", "role": "user", "content": "run it"},
                {"type": "function_call", "call_id": "call_1", "name": "echo",
                 "arguments": "{\"text\":\"ping\"}"},
                {"type": "function_call_output", "call_id": "call_1", "output": "ping"},
            ],
        }))
        .unwrap();

        let chat = responses_to_chat(request);
        assert_eq!(chat.messages.len(), 3);
        let calls = chat.messages[1].tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].id.as_deref(), Some("call_1"));
        assert_eq!(chat.messages[2].role, ChatRole::Tool);
        assert_eq!(chat.messages[2].tool_call_id.as_deref(), Some("call_1"));
    }

    #[test]
    fn chat_round_trips_through_responses_items() {
        let chat: ChatCompletionRequest = serde_json::from_value(json!({
            "model": "gpt-5",
            "messages": [
                {"role": "system", "content": "be brief"},
                {"role": "user", "content": "hi"},
                {"role": "assistant", "content": null, "tool_calls": [{
                    "id": "call_9", "type": "function",
                    "function": {"name": "echo", "arguments": "{}"},
                }]},
                {"role": "tool", "tool_call_id": "call_9", "content": "done"},
            ],
        }))
        .unwrap();

        let responses = chat_to_responses(chat.clone());
        assert_eq!(responses.instructions.as_deref(), Some("be brief"));
        let back = responses_to_chat(responses);
        assert_eq!(back.messages.len(), chat.messages.len());
        assert_eq!(back.messages[2].tool_calls, chat.messages[2].tool_calls);
        assert_eq!(back.messages[3].tool_call_id.as_deref(), Some("call_9"));
    }
}

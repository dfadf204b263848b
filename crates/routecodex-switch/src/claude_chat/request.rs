use serde_json::{Map, Value, json};

use routecodex_protocol::claude::messages::{
    AnthropicTool, MessageContent, MessageParam, MessageRole, MessagesRequest,
};
use routecodex_protocol::openai::chat::{
    ChatCompletionRequest, ChatContent, ChatMessage, ChatRole, FunctionDefinition, ToolCall,
    ToolDefinition, part_text,
};

/// Convert an Anthropic Messages request into the chat canonical form.
pub fn messages_to_chat(request: MessagesRequest) -> ChatCompletionRequest {
    let mut messages = Vec::new();
    if let Some(system) = request.system_text() {
        messages.push(ChatMessage::text(ChatRole::System, system));
    }
    for message in &request.messages {
        messages.extend(map_message(message));
    }

    let tools = request.tools.map(|tools| {
        tools
            .into_iter()
            .map(|tool| ToolDefinition {
                kind: "function".to_string(),
                function: FunctionDefinition {
                    name: tool.name,
                    description: tool.description,
                    parameters: tool.input_schema,
                    strict: None,
                },
                extra: Map::new(),
            })
            .collect::<Vec<_>>()
    });

    ChatCompletionRequest {
        model: request.model,
        messages,
        tools,
        tool_choice: request.tool_choice.as_ref().map(map_tool_choice_to_chat),
        stream: request.stream,
        max_tokens: Some(request.max_tokens),
        temperature: request.temperature,
        top_p: request.top_p,
        stop: request.stop_sequences.map(|sequences| json!(sequences)),
        response_format: None,
        extra: Map::new(),
    }
}

/// Convert the chat canonical form into an Anthropic Messages request.
pub fn chat_to_messages(request: ChatCompletionRequest) -> MessagesRequest {
    let mut system_texts = Vec::new();
    let mut messages: Vec<MessageParam> = Vec::new();

    for message in &request.messages {
        match message.role {
            ChatRole::System | ChatRole::Developer => {
                if let Some(content) = &message.content {
                    system_texts.push(content.joined_text());
                }
            }
            ChatRole::Tool => {
                let block = json!({
                    "type": "tool_result",
                    "tool_use_id": message.tool_call_id.clone().unwrap_or_default(),
                    "content": message
                        .content
                        .as_ref()
                        .map(ChatContent::joined_text)
                        .unwrap_or_default(),
                });
                push_user_block(&mut messages, block);
            }
            ChatRole::Assistant => {
                messages.push(map_assistant_to_claude(message));
            }
            _ => {
                let blocks = message
                    .content
                    .as_ref()
                    .map(map_user_content_blocks)
                    .unwrap_or_default();
                if !blocks.is_empty() {
                    messages.push(MessageParam {
                        role: MessageRole::User,
                        content: MessageContent::Blocks(blocks),
                    });
                }
            }
        }
    }

    let tools = request.tools.map(|tools| {
        tools
            .into_iter()
            .map(|tool| AnthropicTool {
                name: tool.function.name,
                description: tool.function.description,
                input_schema: tool.function.parameters,
                extra: Map::new(),
            })
            .collect::<Vec<_>>()
    });

    MessagesRequest {
        model: request.model,
        // Anthropic requires max_tokens; fall back to a generous default.
        max_tokens: request.max_tokens.unwrap_or(4096),
        messages,
        system: (!system_texts.is_empty()).then(|| Value::String(system_texts.join("\n"))),
        tools,
        tool_choice: request.tool_choice.as_ref().map(map_tool_choice_to_claude),
        stream: request.stream,
        temperature: request.temperature,
        top_p: request.top_p,
        stop_sequences: request.stop.and_then(stop_to_sequences),
        thinking: None,
        metadata: None,
        extra: Map::new(),
    }
}

fn map_message(message: &MessageParam) -> Vec<ChatMessage> {
    match message.role {
        MessageRole::User => map_user_message(&message.content),
        MessageRole::Assistant => vec![map_assistant_message(&message.content)],
    }
}

fn map_user_message(content: &MessageContent) -> Vec<ChatMessage> {
    let mut output = Vec::new();
    let mut parts: Vec<Value> = Vec::new();

    for block in content.blocks() {
        match block.get("type").and_then(Value::as_str) {
            Some("tool_result") => {
                flush_user_parts(&mut output, &mut parts);
                output.push(ChatMessage::tool_reply(
                    block
                        .get("tool_use_id")
                        .and_then(Value::as_str)
                        .unwrap_or_default(),
                    tool_result_text(&block),
                ));
            }
            Some("text") => {
                if let Some(text) = block.get("text").and_then(Value::as_str)
                    && !text.is_empty()
                {
                    parts.push(json!({"type": "text", "text": text}));
                }
            }
            Some("image") => {
                if let Some(part) = image_block_to_part(&block) {
                    parts.push(part);
                }
            }
            _ => {
                // Unknown block kinds degrade to their JSON text.
                parts.push(json!({"type": "text", "text": block.to_string()}));
            }
        }
    }

    flush_user_parts(&mut output, &mut parts);
    output
}

fn map_assistant_message(content: &MessageContent) -> ChatMessage {
    let mut texts = Vec::new();
    let mut reasoning = Vec::new();
    let mut tool_calls = Vec::new();

    for block in content.blocks() {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => {
                if let Some(text) = block.get("text").and_then(Value::as_str) {
                    texts.push(text.to_string());
                }
            }
            Some("thinking") => {
                if let Some(text) = block.get("thinking").and_then(Value::as_str) {
                    reasoning.push(text.to_string());
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

    ChatMessage {
        role: ChatRole::Assistant,
        content: (!texts.is_empty()).then(|| ChatContent::Text(texts.join(""))),
        tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
        tool_call_id: None,
        reasoning_content: (!reasoning.is_empty()).then(|| reasoning.join("")),
        name: None,
        extra: Map::new(),
    }
}

fn map_assistant_to_claude(message: &ChatMessage) -> MessageParam {
    let mut blocks = Vec::new();
    if let Some(reasoning) = &message.reasoning_content {
        blocks.push(json!({"type": "thinking", "thinking": reasoning}));
    }
    if let Some(content) = &message.content {
        let text = content.joined_text();
        if !text.is_empty() {
            blocks.push(json!({"type": "text", "text": text}));
        }
    }
    for call in message.tool_calls.iter().flatten() {
        blocks.push(json!({
            "type": "tool_use",
            "id": call.id.clone().unwrap_or_default(),
            "name": call.function.name,
            "input": super::arguments_to_input(&call.function.arguments),
        }));
    }
    MessageParam {
        role: MessageRole::Assistant,
        content: MessageContent::Blocks(blocks),
    }
}

fn map_user_content_blocks(content: &ChatContent) -> Vec<Value> {
    match content {
        ChatContent::Text(text) => {
            if text.is_empty() {
                Vec::new()
            } else {
                vec![json!({"type": "text", "text": text})]
            }
        }
        ChatContent::Parts(parts) => parts.iter().filter_map(part_to_claude_block).collect(),
    }
}

fn part_to_claude_block(part: &Value) -> Option<Value> {
    if let Some(text) = part_text(part) {
        return Some(json!({"type": "text", "text": text}));
    }
    if part.get("type").and_then(Value::as_str) == Some("image_url") {
        let url = part
            .get("image_url")
            .and_then(|image| image.get("url"))
            .and_then(Value::as_str)?;
        return data_url_to_image_block(url);
    }
    None
}

fn data_url_to_image_block(url: &str) -> Option<Value> {
    if let Some(rest) = url.strip_prefix("data:") {
        let (media_type, data) = rest.split_once(";base64,")?;
        return Some(json!({
            "type": "image",
            "source": {"type": "base64", "media_type": media_type, "data": data},
        }));
    }
    Some(json!({
        "type": "image",
        "source": {"type": "url", "url": url},
    }))
}

fn image_block_to_part(block: &Value) -> Option<Value> {
    let source = block.get("source")?;
    let url = match source.get("type").and_then(Value::as_str) {
        Some("base64") => format!(
            "data:{};base64,{}",
            source.get("media_type").and_then(Value::as_str)?,
            source.get("data").and_then(Value::as_str)?,
        ),
        Some("url") => source.get("url").and_then(Value::as_str)?.to_string(),
        _ => return None,
    };
    Some(json!({"type": "image_url", "image_url": {"url": url}}))
}

fn tool_result_text(block: &Value) -> String {
    match block.get("content") {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

fn push_user_block(messages: &mut Vec<MessageParam>, block: Value) {
    if let Some(last) = messages.last_mut()
        && last.role == MessageRole::User
    {
        let mut blocks = last.content.blocks();
        blocks.push(block);
        last.content = MessageContent::Blocks(blocks);
        return;
    }
    messages.push(MessageParam {
        role: MessageRole::User,
        content: MessageContent::Blocks(vec![block]),
    });
}

fn flush_user_parts(output: &mut Vec<ChatMessage>, parts: &mut Vec<Value>) {
    if parts.is_empty() {
        return;
    }
    let content = if parts.len() == 1
        && let Some(text) = part_text(&parts[0])
    {
        ChatContent::Text(text)
    } else {
        ChatContent::Parts(parts.clone())
    };
    output.push(ChatMessage {
        role: ChatRole::User,
        content: Some(content),
        tool_calls: None,
        tool_call_id: None,
        reasoning_content: None,
        name: None,
        extra: Map::new(),
    });
    parts.clear();
}

fn map_tool_choice_to_chat(choice: &Value) -> Value {
    match choice.get("type").and_then(Value::as_str) {
        Some("any") => json!("required"),
        Some("none") => json!("none"),
        Some("tool") => json!({
            "type": "function",
            "function": {"name": choice.get("name").and_then(Value::as_str).unwrap_or_default()},
        }),
        _ => json!("auto"),
    }
}

fn map_tool_choice_to_claude(choice: &Value) -> Value {
    match choice {
        Value::String(mode) => match mode.as_str() {
            "required" => json!({"type": "any"}),
            "none" => json!({"type": "none"}),
            _ => json!({"type": "auto"}),
        },
        Value::Object(map) => {
            let name = map
                .get("function")
                .and_then(|function| function.get("name"))
                .and_then(Value::as_str)
                .unwrap_or_default();
            json!({"type": "tool", "name": name})
        }
        _ => json!({"type": "auto"}),
    }
}

fn stop_to_sequences(stop: Value) -> Option<Vec<String>> {
    match stop {
        Value::String(single) => Some(vec![single]),
        Value::Array(items) => {
            let sequences: Vec<String> = items
                .into_iter()
                .filter_map(|item| item.as_str().map(|s| s.to_string()))
                .collect();
            (!sequences.is_empty()).then_some(sequences)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_with(messages: Value) -> MessagesRequest {
        serde_json::from_value(json!({
            "model": "claude-sonnet-4-5",
            "max_tokens": 128,
            "messages": messages,
        }))
        .unwrap()
    }

    #[test]
    fn tool_schema_maps_to_function_parameters() {
        let mut request = request_with(json!([{"role": "user", "content": "add 1 and 2"}]));
        request.tools = Some(vec![AnthropicTool {
            name: "add".to_string(),
            description: None,
            input_schema: Some(json!({
                "type": "object",
                "properties": {"a": {"type": "number"}, "b": {"type": "number"}},
                "required": ["a", "b"],
            })),
            extra: Map::new(),
        }]);

        let chat = messages_to_chat(request);
        let tools = chat.tools.unwrap();
        assert_eq!(tools[0].function.name, "add");
        assert_eq!(
            tools[0].function.parameters.as_ref().unwrap()["required"],
            json!(["a", "b"])
        );
    }

    #[test]
    fn tool_result_becomes_tool_message_before_user_text() {
        let request = request_with(json!([
            {"role": "user", "content": [
                {"type": "tool_result", "tool_use_id": "toolu_1", "content": "3"},
                {"type": "text", "text": "thanks"},
            ]},
        ]));
        let chat = messages_to_chat(request);
        assert_eq!(chat.messages[0].role, ChatRole::Tool);
        assert_eq!(chat.messages[0].tool_call_id.as_deref(), Some("toolu_1"));
        assert_eq!(chat.messages[1].role, ChatRole::User);
    }

    #[test]
    fn assistant_tool_use_round_trips_input_object() {
        let request = request_with(json!([
            {"role": "assistant", "content": [
                {"type": "tool_use", "id": "toolu_1", "name": "add", "input": {"a": 1, "b": 2}},
            ]},
        ]));
        let chat = messages_to_chat(request);
        let calls = chat.messages[0].tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].function.name, "add");
        let parsed: Value = serde_json::from_str(&calls[0].function.arguments).unwrap();
        assert_eq!(parsed, json!({"a": 1, "b": 2}));
    }

    #[test]
    fn chat_to_messages_moves_system_out_of_messages() {
        let chat: ChatCompletionRequest = serde_json::from_value(json!({
            "model": "claude-sonnet-4-5",
            "messages": [
                {"role": "system", "content": "be terse"},
                {"role": "user", "content": "hi"},
            ],
        }))
        .unwrap();
        let messages = chat_to_messages(chat);
        assert_eq!(messages.system, Some(Value::String("be terse".to_string())));
        assert_eq!(messages.messages.len(), 1);
        assert_eq!(messages.messages[0].role, MessageRole::User);
    }

    #[test]
    fn data_url_image_maps_to_base64_source() {
        let chat: ChatCompletionRequest = serde_json::from_value(json!({
            "model": "m",
            "messages": [{"role": "user", "content": [
                {"type": "image_url", "image_url": {"url": "data:image/png;base64,AA=="}},
            ]}],
        }))
        .unwrap();
        let messages = chat_to_messages(chat);
        let blocks = messages.messages[0].content.blocks();
        assert_eq!(blocks[0]["source"]["media_type"], "image/png");
        assert_eq!(blocks[0]["source"]["data"], "AA==");
    }
}

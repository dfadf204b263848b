//! Tool-call governance: schema-directed normalization of model-emitted tool
//! calls into the canonical shape a client executor will accept.
//!
//! Applies to tools with a known strict shape (`apply_patch`, `exec_command`,
//! `shell`). Calls for other tools pass through untouched.

use serde_json::{Map, Value, json};

use routecodex_common::{GatewayError, new_tool_call_id};
use routecodex_protocol::openai::chat::{ChatResponseMessage, ToolCall};

pub const PATCH_BEGIN: &str = "*** Begin Patch\n";
pub const PATCH_END: &str = "*** End Patch";

/// Outcome of normalizing one governed tool call.
#[derive(Debug, Clone, PartialEq)]
pub struct GovernanceNote {
    pub tool: String,
    pub reason: &'static str,
}

/// Normalize every governed tool call on an assistant message in place.
///
/// When the message carries no canonical tool calls, a strictly recognized
/// text markup in `content` may be extracted into one; unrecognized content
/// is left verbatim. Returns notes for calls that were rewritten.
pub fn govern_message(message: &mut ChatResponseMessage) -> Result<Vec<GovernanceNote>, GatewayError> {
    let mut notes = Vec::new();

    if message.tool_calls.is_none()
        && let Some(content) = message.content.clone()
        && let Some(call) = extract_text_tool_call(&content)
    {
        message.tool_calls = Some(vec![call]);
        message.content = None;
        notes.push(GovernanceNote {
            tool: "text_markup".to_string(),
            reason: "extracted",
        });
    }

    for call in message.tool_calls.iter_mut().flatten() {
        if let Some(note) = normalize_tool_call(call)? {
            notes.push(note);
        }
    }
    Ok(notes)
}

/// Normalize a single tool call; `Ok(None)` means the tool is ungoverned or
/// already canonical.
pub fn normalize_tool_call(call: &mut ToolCall) -> Result<Option<GovernanceNote>, GatewayError> {
    match call.function.name.as_str() {
        "apply_patch" => {
            let (arguments, reason) = normalize_apply_patch(&call.function.arguments)?;
            call.function.arguments = arguments;
            Ok(Some(GovernanceNote {
                tool: "apply_patch".to_string(),
                reason,
            }))
        }
        "exec_command" | "shell" => {
            let (arguments, reason) =
                normalize_exec_command(&call.function.name, &call.function.arguments)?;
            call.function.arguments = arguments;
            Ok(Some(GovernanceNote {
                tool: call.function.name.clone(),
                reason,
            }))
        }
        _ => Ok(None),
    }
}

/// Canonical `apply_patch` arguments: `{patch, input}` both set to the same
/// unified-diff text with real newlines, wrapped in the patch sentinels.
fn normalize_apply_patch(arguments: &str) -> Result<(String, &'static str), GatewayError> {
    let (patch, reason) = extract_patch_text(arguments)?;
    let patch = unescape_literal_newlines(patch);
    validate_patch(&patch)?;
    let canonical = json!({"patch": patch, "input": patch}).to_string();
    Ok((canonical, reason))
}

fn extract_patch_text(arguments: &str) -> Result<(String, &'static str), GatewayError> {
    match serde_json::from_str::<Value>(arguments) {
        Ok(Value::Object(map)) => {
            if let Some(patch) = map.get("patch").and_then(Value::as_str) {
                return Ok((patch.to_string(), "object_patch"));
            }
            if let Some(input) = map.get("input").and_then(Value::as_str) {
                return Ok((input.to_string(), "object_input"));
            }
            if map.contains_key("file") || map.contains_key("changes") {
                return structured_to_patch(&map).map(|patch| (patch, "structured_changes"));
            }
            Err(GatewayError::tool_shape("apply_patch", "missing_required:patch"))
        }
        Ok(Value::String(text)) => Ok((text, "string_argument")),
        // Raw patch text emitted without JSON quoting.
        Err(_) if arguments.contains("*** Begin Patch") => {
            Ok((arguments.to_string(), "raw_patch_text"))
        }
        Ok(_) => Err(GatewayError::tool_shape("apply_patch", "invalid_type:arguments")),
        Err(_) => Err(GatewayError::tool_shape("apply_patch", "invalid_json")),
    }
}

/// `{file, changes:[{old,new} | {context, insert}]}` → unified diff text.
fn structured_to_patch(map: &Map<String, Value>) -> Result<String, GatewayError> {
    let file = map
        .get("file")
        .and_then(Value::as_str)
        .ok_or_else(|| GatewayError::tool_shape("apply_patch", "missing_required:file"))?;
    let changes = map
        .get("changes")
        .and_then(Value::as_array)
        .ok_or_else(|| GatewayError::tool_shape("apply_patch", "missing_required:changes"))?;

    let mut body = format!("*** Begin Patch\n*** Update File: {file}\n");
    for change in changes {
        if let Some(old) = change.get("old").and_then(Value::as_str) {
            for line in old.split('\n') {
                body.push('-');
                body.push_str(line);
                body.push('\n');
            }
        }
        if let Some(new) = change.get("new").and_then(Value::as_str) {
            for line in new.split('\n') {
                body.push('+');
                body.push_str(line);
                body.push('\n');
            }
        }
    }
    body.push_str("*** End Patch");
    Ok(body)
}

/// Some providers double-escape the patch body; if the text carries literal
/// `\n` sequences and no real newlines, unescape once.
fn unescape_literal_newlines(text: String) -> String {
    if text.contains('\n') || !text.contains("\\n") {
        return text;
    }
    text.replace("\\r\\n", "\n")
        .replace("\\n", "\n")
        .replace("\\t", "\t")
}

fn validate_patch(patch: &str) -> Result<(), GatewayError> {
    if !patch.starts_with(PATCH_BEGIN) {
        return Err(GatewayError::tool_shape("apply_patch", "bad_sentinel:begin"));
    }
    // The end sentinel must sit on its own line, mirroring the newline the
    // begin sentinel carries.
    if !patch.trim_end().ends_with(&format!("\n{PATCH_END}")) {
        return Err(GatewayError::tool_shape("apply_patch", "bad_sentinel:end"));
    }
    // Stitched JSON keys indicate a patch assembled from a broken arguments
    // stream; refuse rather than hand the executor garbage.
    if patch.contains("\"patch\":") || patch.contains("\"input\":") {
        return Err(GatewayError::tool_shape("apply_patch", "stitched_keys"));
    }
    Ok(())
}

/// Canonical `exec_command` / `shell` arguments: a `command` key holding a
/// non-empty string or non-empty array of strings. Substitute keys (`cmd`,
/// `input`) and map-typed commands are rejected so the model regenerates.
fn normalize_exec_command(
    tool: &str,
    arguments: &str,
) -> Result<(String, &'static str), GatewayError> {
    let parsed: Value = serde_json::from_str(arguments)
        .map_err(|_| GatewayError::tool_shape(tool, "invalid_json"))?;
    let Value::Object(map) = parsed else {
        return Err(GatewayError::tool_shape(tool, "invalid_type:arguments"));
    };

    if map.contains_key("cmd") || map.contains_key("input") {
        return Err(GatewayError::tool_shape(tool, "invalid_key:cmd"));
    }

    let command = map
        .get("command")
        .ok_or_else(|| GatewayError::tool_shape(tool, "missing_required:command"))?;

    match command {
        Value::String(text) if !text.trim().is_empty() => {}
        Value::String(_) => return Err(GatewayError::tool_shape(tool, "empty:command")),
        Value::Array(items) => {
            if items.is_empty() {
                return Err(GatewayError::tool_shape(tool, "empty:command"));
            }
            if !items.iter().all(|item| item.is_string()) {
                return Err(GatewayError::tool_shape(tool, "invalid_type:command"));
            }
        }
        _ => return Err(GatewayError::tool_shape(tool, "invalid_type:command")),
    }

    let mut canonical = Map::new();
    canonical.insert("command".to_string(), command.clone());
    for (key, value) in &map {
        if key != "command" {
            canonical.insert(key.clone(), value.clone());
        }
    }
    Ok((Value::Object(canonical).to_string(), "canonicalized"))
}

/// Extract a tool call from recognized assistant-content markup. Strictly
/// opt-in: only well-scoped shapes match, anything else returns `None` and
/// the content stays as-is.
pub fn extract_text_tool_call(content: &str) -> Option<ToolCall> {
    let trimmed = content.trim();

    // `<invoke name="shell">{...}</invoke>`
    if let Some(rest) = trimmed.strip_prefix("<invoke name=\"") {
        let (name, rest) = rest.split_once('"')?;
        let body_start = rest.find('>')?;
        let body = rest[body_start + 1..].strip_suffix("</invoke>")?.trim();
        return build_extracted_call(name, body);
    }

    // `[tool_call:shell] {...}`
    if let Some(rest) = trimmed.strip_prefix("[tool_call:") {
        let (name, body) = rest.split_once(']')?;
        return build_extracted_call(name.trim(), body.trim());
    }

    // Fenced JSON carrying an explicit name/arguments pair.
    if let Some(body) = trimmed
        .strip_prefix("```json")
        .and_then(|rest| rest.strip_suffix("```"))
    {
        let value: Value = serde_json::from_str(body.trim()).ok()?;
        let name = value.get("name").and_then(Value::as_str)?;
        let arguments = value.get("arguments")?;
        let arguments = match arguments {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        };
        return Some(ToolCall::function(new_tool_call_id(), name, arguments));
    }

    None
}

fn build_extracted_call(name: &str, body: &str) -> Option<ToolCall> {
    if name.is_empty() {
        return None;
    }
    // The body must parse as a JSON object to count as a tool call.
    let value: Value = serde_json::from_str(body).ok()?;
    value.as_object()?;
    Some(ToolCall::function(new_tool_call_id(), name, value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(name: &str, arguments: &str) -> ToolCall {
        ToolCall::function("call_1", name, arguments.to_string())
    }

    #[test]
    fn literal_escaped_newlines_become_real_ones() {
        // A doubly-escaped patch: the argument string carries a literal
        // backslash-n, not a newline.
        let mut call = call(
            "apply_patch",
            "{\"patch\": \"*** Begin Patch\\\\n*** End Patch\"}",
        );
        normalize_tool_call(&mut call).unwrap();
        let parsed: Value = serde_json::from_str(&call.function.arguments).unwrap();
        let patch = parsed["patch"].as_str().unwrap();
        assert_eq!(patch, "*** Begin Patch\n*** End Patch");
        assert!(!patch.contains("\\n"));
        assert_eq!(parsed["patch"], parsed["input"]);
    }

    #[test]
    fn input_key_is_accepted_as_patch_source() {
        let mut call = call(
            "apply_patch",
            "{\"input\": \"*** Begin Patch\\n+hello\\n*** End Patch\"}",
        );
        normalize_tool_call(&mut call).unwrap();
        let parsed: Value = serde_json::from_str(&call.function.arguments).unwrap();
        assert!(parsed["patch"].as_str().unwrap().contains("+hello"));
    }

    #[test]
    fn missing_sentinels_are_rejected() {
        let mut call = call("apply_patch", "{\"patch\": \"+hello\"}");
        let err = normalize_tool_call(&mut call).unwrap_err();
        match err {
            GatewayError::ToolShape { reason, .. } => assert!(reason.starts_with("bad_sentinel")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn end_sentinel_requires_its_own_line() {
        // The end marker glued to the last content line is not a valid patch.
        let mut call = call(
            "apply_patch",
            "{\"patch\": \"*** Begin Patch\\ncontent*** End Patch\"}",
        );
        match normalize_tool_call(&mut call).unwrap_err() {
            GatewayError::ToolShape { reason, .. } => assert_eq!(reason, "bad_sentinel:end"),
            other => panic!("unexpected error: {other}"),
        }

        // The minimal empty patch shares the newline between both sentinels.
        let mut minimal = call_minimal();
        normalize_tool_call(&mut minimal).unwrap();
    }

    fn call_minimal() -> ToolCall {
        call(
            "apply_patch",
            "{\"patch\": \"*** Begin Patch\\n*** End Patch\"}",
        )
    }

    #[test]
    fn structured_changes_render_a_unified_diff() {
        let mut call = call(
            "apply_patch",
            "{\"file\": \"src/main.rs\", \"changes\": [{\"old\": \"a\", \"new\": \"b\"}]}",
        );
        normalize_tool_call(&mut call).unwrap();
        let parsed: Value = serde_json::from_str(&call.function.arguments).unwrap();
        let patch = parsed["patch"].as_str().unwrap();
        assert!(patch.starts_with(PATCH_BEGIN));
        assert!(patch.contains("*** Update File: src/main.rs"));
        assert!(patch.contains("-a\n+b\n"));
        assert!(patch.ends_with(PATCH_END));
    }

    #[test]
    fn exec_command_accepts_string_and_array() {
        let mut string_call = call("exec_command", "{\"command\": \"ls -la\"}");
        normalize_tool_call(&mut string_call).unwrap();

        let mut array_call = call("shell", "{\"command\": [\"ls\", \"-la\"], \"timeout\": 5}");
        normalize_tool_call(&mut array_call).unwrap();
        let parsed: Value = serde_json::from_str(&array_call.function.arguments).unwrap();
        assert_eq!(parsed["command"], json!(["ls", "-la"]));
        assert_eq!(parsed["timeout"], 5);
    }

    #[test]
    fn exec_command_rejects_substitute_keys_and_bad_types() {
        for (arguments, reason) in [
            ("{\"cmd\": \"ls\"}", "invalid_key:cmd"),
            ("{\"input\": \"ls\"}", "invalid_key:cmd"),
            ("{\"command\": \"\"}", "empty:command"),
            ("{\"command\": []}", "empty:command"),
            ("{\"command\": {\"run\": \"ls\"}}", "invalid_type:command"),
            ("{}", "missing_required:command"),
            ("not json", "invalid_json"),
        ] {
            let mut bad = call("exec_command", arguments);
            match normalize_tool_call(&mut bad).unwrap_err() {
                GatewayError::ToolShape { reason: got, .. } => assert_eq!(got, reason),
                other => panic!("unexpected error: {other}"),
            }
        }
    }

    #[test]
    fn invoke_markup_extracts_a_shell_call() {
        let content = "<invoke name=\"shell\">{\"command\": \"echo hi\"}</invoke>";
        let extracted = extract_text_tool_call(content).unwrap();
        assert_eq!(extracted.function.name, "shell");
        let parsed: Value = serde_json::from_str(&extracted.function.arguments).unwrap();
        assert_eq!(parsed["command"], "echo hi");
    }

    #[test]
    fn bracket_markup_extracts_a_call() {
        let content = "[tool_call:exec_command] {\"command\": [\"pwd\"]}";
        let extracted = extract_text_tool_call(content).unwrap();
        assert_eq!(extracted.function.name, "exec_command");
    }

    #[test]
    fn ordinary_prose_is_left_untouched() {
        assert!(extract_text_tool_call("The command `ls` lists files.").is_none());
        assert!(extract_text_tool_call("[tool_call:shell] not json").is_none());
    }

    #[test]
    fn govern_message_extracts_then_normalizes() {
        let mut message: ChatResponseMessage = serde_json::from_value(json!({
            "role": "assistant",
            "content": "[tool_call:shell] {\"command\": \"ls\"}",
        }))
        .unwrap();
        let notes = govern_message(&mut message).unwrap();
        assert!(message.content.is_none());
        assert_eq!(message.tool_calls.as_ref().unwrap()[0].function.name, "shell");
        assert!(notes.iter().any(|note| note.reason == "extracted"));
        assert!(notes.iter().any(|note| note.reason == "canonicalized"));
    }
}

//! Per-provider compatibility profiles.
//!
//! A profile is a declarative list of transforms applied, in order, to the
//! provider-bound request body and to the provider's response. Loading more
//! providers means adding profile documents, not code. Every transform is
//! idempotent: applying a profile twice equals applying it once.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use routecodex_common::GatewayError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldRename {
    pub from: String,
    pub to: String,
}

/// Schema rewrites for tool parameters that some providers require.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaPatchKind {
    /// Rewrite a property to `oneOf [string, array-of-string]` (GLM requires
    /// `command` to accept either).
    StringOrArray,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchemaPatch {
    /// Tool name to patch; `None` patches every tool carrying the property.
    #[serde(default)]
    pub tool: Option<String>,
    pub property: String,
    pub patch: SchemaPatchKind,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RateLimitHints {
    #[serde(default)]
    pub rpm: Option<u32>,
    #[serde(default)]
    pub burst: Option<u32>,
}

/// How a matched response-body marker maps onto the error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorMarkerKind {
    ToolShape,
    PolicyViolation,
    RateLimited,
    UpstreamRejected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorMarker {
    pub contains: String,
    pub kind: ErrorMarkerKind,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompatProfile {
    pub name: String,
    #[serde(default)]
    pub drop_fields: Vec<String>,
    #[serde(default)]
    pub rename_fields: Vec<FieldRename>,
    #[serde(default)]
    pub tool_schema_patches: Vec<ToolSchemaPatch>,
    #[serde(default)]
    pub system_prompt_override: Option<String>,
    #[serde(default)]
    pub system_prompt_prefix: Option<String>,
    #[serde(default)]
    pub thinking_payload: Option<Value>,
    /// Fields this provider's endpoint rejects outright.
    #[serde(default)]
    pub strip_unsupported: Vec<String>,
    /// Providers that reject `tools: []` get the field removed when empty.
    #[serde(default = "default_true")]
    pub drop_empty_tools: bool,
    #[serde(default)]
    pub rate_limit_hints: Option<RateLimitHints>,
    #[serde(default)]
    pub error_markers: Vec<ErrorMarker>,
}

fn default_true() -> bool {
    true
}

impl CompatProfile {
    pub fn passthrough() -> Self {
        Self {
            name: "default".to_string(),
            ..Default::default()
        }
    }

    /// Apply the request-direction transforms, in declaration order, to a
    /// canonical JSON request body.
    pub fn apply_request(&self, body: &mut Value) -> Result<(), GatewayError> {
        let Some(map) = body.as_object_mut() else {
            return Err(GatewayError::PolicyViolation(format!(
                "profile {} expects an object body",
                self.name
            )));
        };

        for field in &self.drop_fields {
            map.remove(field);
        }
        for rename in &self.rename_fields {
            if map.contains_key(&rename.to) {
                continue;
            }
            if let Some(value) = map.remove(&rename.from) {
                map.insert(rename.to.clone(), value);
            }
        }
        for field in &self.strip_unsupported {
            map.remove(field);
        }

        if self.drop_empty_tools
            && map
                .get("tools")
                .and_then(Value::as_array)
                .is_some_and(|tools| tools.is_empty())
        {
            map.remove("tools");
            map.remove("tool_choice");
        }

        for patch in &self.tool_schema_patches {
            apply_tool_schema_patch(map, patch);
        }

        self.apply_system_prompt(map);

        if let Some(payload) = &self.thinking_payload
            && !map.contains_key("thinking")
        {
            map.insert("thinking".to_string(), payload.clone());
        }

        Ok(())
    }

    /// Response-direction rewrites: promote provider-specific reasoning
    /// fields to `reasoning_content` on each choice message.
    pub fn rewrite_response(&self, body: &mut Value) {
        let Some(choices) = body.get_mut("choices").and_then(Value::as_array_mut) else {
            return;
        };
        for choice in choices {
            let Some(message) = choice.get_mut("message").and_then(Value::as_object_mut) else {
                continue;
            };
            if message.contains_key("reasoning_content") {
                continue;
            }
            for key in ["reasoning", "thought", "thinking"] {
                if let Some(Value::String(text)) = message.get(key).cloned() {
                    message.remove(key);
                    message.insert("reasoning_content".to_string(), Value::String(text));
                    break;
                }
            }
        }
    }

    /// Classify a provider error body against this profile's markers.
    pub fn classify_error_body(&self, status: u16, body: &str) -> Option<GatewayError> {
        for marker in &self.error_markers {
            if !body.contains(&marker.contains) {
                continue;
            }
            return Some(match marker.kind {
                ErrorMarkerKind::ToolShape => {
                    GatewayError::tool_shape("upstream", marker.contains.clone())
                }
                ErrorMarkerKind::PolicyViolation => {
                    GatewayError::PolicyViolation(marker.contains.clone())
                }
                ErrorMarkerKind::RateLimited => {
                    GatewayError::rate_limited(marker.contains.clone(), None)
                }
                ErrorMarkerKind::UpstreamRejected => GatewayError::UpstreamRejected {
                    status,
                    message: marker.contains.clone(),
                },
            });
        }
        None
    }

    pub fn rate_limit(&self) -> Option<(u32, u32)> {
        let hints = self.rate_limit_hints?;
        let rpm = hints.rpm?;
        Some((rpm, hints.burst.unwrap_or(rpm.max(1))))
    }

    fn apply_system_prompt(&self, map: &mut Map<String, Value>) {
        if self.system_prompt_override.is_none() && self.system_prompt_prefix.is_none() {
            return;
        }
        let Some(messages) = map.get_mut("messages").and_then(Value::as_array_mut) else {
            return;
        };

        let system_index = messages
            .iter()
            .position(|message| message.get("role").and_then(Value::as_str) == Some("system"));

        if let Some(override_text) = &self.system_prompt_override {
            match system_index {
                Some(index) => {
                    messages[index]["content"] = Value::String(override_text.clone());
                }
                None => messages.insert(
                    0,
                    json!({"role": "system", "content": override_text}),
                ),
            }
            return;
        }

        if let Some(prefix) = &self.system_prompt_prefix {
            match system_index {
                Some(index) => {
                    let existing = messages[index]
                        .get("content")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    if !existing.starts_with(prefix.as_str()) {
                        messages[index]["content"] =
                            Value::String(format!("{prefix}\n{existing}"));
                    }
                }
                None => {
                    messages.insert(0, json!({"role": "system", "content": prefix}));
                }
            }
        }
    }
}

fn apply_tool_schema_patch(map: &mut Map<String, Value>, patch: &ToolSchemaPatch) {
    let Some(tools) = map.get_mut("tools").and_then(Value::as_array_mut) else {
        return;
    };
    for tool in tools {
        let name = tool
            .get("function")
            .and_then(|function| function.get("name"))
            .and_then(Value::as_str);
        if let Some(wanted) = &patch.tool
            && name != Some(wanted.as_str())
        {
            continue;
        }
        let Some(property) = tool
            .get_mut("function")
            .and_then(|function| function.get_mut("parameters"))
            .and_then(|parameters| parameters.get_mut("properties"))
            .and_then(|properties| properties.get_mut(&patch.property))
        else {
            continue;
        };
        match patch.patch {
            SchemaPatchKind::StringOrArray => {
                if property.get("oneOf").is_some() {
                    continue;
                }
                let description = property.get("description").cloned();
                let mut replacement = json!({
                    "oneOf": [
                        {"type": "string"},
                        {"type": "array", "items": {"type": "string"}},
                    ],
                });
                if let Some(description) = description {
                    replacement["description"] = description;
                }
                *property = replacement;
            }
        }
    }
}

/// Registry of profiles: builtins plus any loaded from configuration.
#[derive(Debug, Default)]
pub struct ProfileRegistry {
    profiles: HashMap<String, CompatProfile>,
}

impl ProfileRegistry {
    pub fn with_builtins() -> Self {
        let mut registry = Self::default();
        for profile in builtin_profiles() {
            registry.insert(profile);
        }
        registry
    }

    pub fn insert(&mut self, profile: CompatProfile) {
        self.profiles.insert(profile.name.clone(), profile);
    }

    /// Unknown names resolve to the passthrough profile.
    pub fn get(&self, name: &str) -> CompatProfile {
        self.profiles
            .get(name)
            .cloned()
            .unwrap_or_else(CompatProfile::passthrough)
    }
}

/// Default rate window applied when a profile gives an rpm hint.
pub fn hint_refill_interval(rpm: u32) -> Duration {
    Duration::from_secs_f64(60.0 / rpm.max(1) as f64)
}

pub fn builtin_profiles() -> Vec<CompatProfile> {
    vec![
        CompatProfile::passthrough(),
        CompatProfile {
            name: "glm".to_string(),
            tool_schema_patches: vec![ToolSchemaPatch {
                tool: None,
                property: "command".to_string(),
                patch: SchemaPatchKind::StringOrArray,
            }],
            error_markers: vec![
                ErrorMarker {
                    contains: "MALFORMED_FUNCTION_CALL".to_string(),
                    kind: ErrorMarkerKind::ToolShape,
                },
                ErrorMarker {
                    contains: "1301".to_string(),
                    kind: ErrorMarkerKind::PolicyViolation,
                },
            ],
            ..Default::default()
        },
        CompatProfile {
            name: "qwen".to_string(),
            strip_unsupported: vec!["response_format".to_string()],
            rate_limit_hints: Some(RateLimitHints {
                rpm: Some(3),
                burst: Some(1),
            }),
            ..Default::default()
        },
        CompatProfile {
            name: "iflow".to_string(),
            strip_unsupported: vec!["tool_choice".to_string(), "response_format".to_string()],
            thinking_payload: Some(json!({"type": "disabled"})),
            error_markers: vec![ErrorMarker {
                contains: "instructions-invalid".to_string(),
                kind: ErrorMarkerKind::UpstreamRejected,
            }],
            ..Default::default()
        },
        CompatProfile {
            name: "lmstudio".to_string(),
            drop_fields: vec!["user".to_string(), "store".to_string()],
            ..Default::default()
        },
    ]
}

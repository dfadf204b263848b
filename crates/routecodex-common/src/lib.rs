pub mod config;
pub mod error;
pub mod id;

pub use config::{HttpServerConfig, ServerConfig, ServerConfigPatch, UserAgentMode};
pub use error::{ErrorKind, GatewayError};
pub use id::{new_request_id, new_response_id, new_tool_call_id};

/// Process exit codes of the owning binary.
pub const EXIT_OK: i32 = 0;
pub const EXIT_CONFIG_INVALID: i32 = 2;
pub const EXIT_NOT_READY: i32 = 3;

/// The wire format a client used to call the gateway. Every response must be
/// rendered on the same protocol the request arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryProtocol {
    OpenAiChat,
    OpenAiResponses,
    AnthropicMessages,
}

impl EntryProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryProtocol::OpenAiChat => "openai-chat",
            EntryProtocol::OpenAiResponses => "openai-responses",
            EntryProtocol::AnthropicMessages => "anthropic-messages",
        }
    }
}

impl std::fmt::Display for EntryProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The wire family an upstream provider speaks. The serde names match the
/// `type` values used in provider configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ProviderFamily {
    /// OpenAI Chat Completions compatible (OpenAI, GLM, Qwen, iFlow, LM Studio, ...).
    #[serde(rename = "openai", alias = "openai-chat")]
    OpenAiChat,
    /// OpenAI Responses compatible.
    #[serde(rename = "openai-responses")]
    OpenAiResponses,
    /// Anthropic Messages compatible.
    #[serde(rename = "anthropic")]
    Anthropic,
}

impl ProviderFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderFamily::OpenAiChat => "openai-chat",
            ProviderFamily::OpenAiResponses => "openai-responses",
            ProviderFamily::Anthropic => "anthropic",
        }
    }
}

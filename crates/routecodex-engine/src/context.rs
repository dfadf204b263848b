use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;

use routecodex_common::{EntryProtocol, ProviderFamily};
use routecodex_protocol::claude::messages::MessagesRequest;
use routecodex_protocol::openai::chat::ChatCompletionRequest;
use routecodex_protocol::openai::responses::{ResponsesRequest, SubmitToolOutputsRequest};

/// Upstream streaming capability from provider configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamSupport {
    /// Follow the client's stream flag.
    #[default]
    Auto,
    /// The provider only streams; collect when the client wants JSON.
    Always,
    /// The provider only returns JSON; synthesize when the client streams.
    Never,
}

/// Static, runtime-read-only provider description from configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    #[serde(rename = "type")]
    pub family: ProviderFamily,
    #[serde(rename = "baseURL")]
    pub base_url: String,
    /// Extra static headers (e.g. provider-specific versions).
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default)]
    pub streaming: StreamSupport,
    /// Send the api key as `x-api-key` instead of an Authorization bearer.
    #[serde(default)]
    pub x_api_key: bool,
}

/// How one request is being processed end to end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessMode {
    Chat,
    Tools,
    StreamToChat,
}

/// Mutable record threaded through the pipeline stages for one request.
#[derive(Debug, Clone)]
pub struct PipelineContext {
    pub request_id: String,
    pub entry: EntryProtocol,
    pub stream: bool,
    pub process_mode: ProcessMode,
    pub route: String,
    pub deadline: Instant,
    /// `session_id` / `conversation_id` used for codex UA synthesis; kept so
    /// tool-loop continuations can reuse them.
    pub codex_session: Option<CodexSession>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodexSession {
    pub session_id: String,
    pub conversation_id: String,
}

impl CodexSession {
    pub fn mint() -> Self {
        let seed = uuid::Uuid::new_v4().simple().to_string();
        Self {
            session_id: format!("codex_cli_session_{seed}"),
            conversation_id: format!("codex_cli_conversation_{seed}"),
        }
    }
}

impl PipelineContext {
    pub fn new(
        request_id: String,
        entry: EntryProtocol,
        stream: bool,
        deadline_in: Duration,
    ) -> Self {
        Self {
            request_id,
            entry,
            stream,
            process_mode: ProcessMode::Chat,
            route: String::new(),
            deadline: Instant::now() + deadline_in,
            codex_session: None,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

/// A request on its entry protocol, parsed at ingress.
#[derive(Debug, Clone)]
pub enum EntryRequest {
    Chat(ChatCompletionRequest),
    Responses(ResponsesRequest),
    Messages(MessagesRequest),
    SubmitToolOutputs {
        response_id: String,
        body: SubmitToolOutputsRequest,
    },
}

impl EntryRequest {
    pub fn entry_protocol(&self) -> EntryProtocol {
        match self {
            EntryRequest::Chat(_) => EntryProtocol::OpenAiChat,
            EntryRequest::Responses(_) | EntryRequest::SubmitToolOutputs { .. } => {
                EntryProtocol::OpenAiResponses
            }
            EntryRequest::Messages(_) => EntryProtocol::AnthropicMessages,
        }
    }

    pub fn wants_stream(&self) -> bool {
        match self {
            EntryRequest::Chat(request) => request.is_stream(),
            EntryRequest::Responses(request) => request.is_stream(),
            EntryRequest::Messages(request) => request.is_stream(),
            EntryRequest::SubmitToolOutputs { body, .. } => body.stream.unwrap_or(false),
        }
    }
}

/// What the engine hands back to ingress: a JSON body or an SSE byte stream.
/// Dropping the stream receiver cancels the upstream read.
pub enum EngineResponse {
    Json(Value),
    Stream(mpsc::Receiver<Result<Bytes, std::io::Error>>),
}

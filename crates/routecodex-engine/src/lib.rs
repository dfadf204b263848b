//! Pipeline engine: for each routed target, run the symmetric four-stage
//! transform (LLMSwitch → Compatibility → Workflow → Provider) and present
//! the final response on the client's entry protocol.
//!
//! The engine owns retry and failover policy, per-target single-flight, the
//! pending tool-loop table, and the streaming workflow.

pub mod context;
pub mod pending;
pub mod rate;
pub mod slots;
pub mod transport;
pub mod workflow;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use routecodex_common::{
    EntryProtocol, GatewayError, ProviderFamily, UserAgentMode, new_response_id,
};
use routecodex_compat::{CompatProfile, ProfileRegistry};
use routecodex_protocol::openai::chat::{
    ChatCompletionRequest, ChatCompletionResponse, ChatMessage, ChatResponseMessage, ChatRole,
};
use routecodex_protocol::openai::responses::{ResponsesResponse, SubmitToolOutputsRequest};
use routecodex_router::{RouteSignals, RouteTarget, VirtualRouter};
use routecodex_sink::{Direction, SharedSnapshotSink, Snapshot};
use routecodex_switch::collect::ChatStreamCollector;
use routecodex_switch::synthesize::synthesize_chat_chunks;
use routecodex_switch::toolcall::govern_message;
use routecodex_switch::{claude_chat, responses_chat};
use routecodex_vault::CredentialVault;

pub use context::{
    CodexSession, EngineResponse, EntryRequest, PipelineContext, ProcessMode, ProviderConfig,
    StreamSupport,
};
use pending::PendingTable;
use rate::RateLimiter;
use slots::SlotMap;
use transport::{UpstreamClient, UpstreamReply, build_envelope};
use workflow::{ChunkAdapter, EntryEncoder, error_frame};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub ua_mode: UserAgentMode,
    pub outbound_proxy: Option<String>,
    /// Maximum `Retry-After` the engine will sleep through before failing
    /// over instead.
    pub rate_retry_budget: Duration,
    /// Alternative targets tried after the primary.
    pub failover_limit: usize,
    pub request_deadline: Duration,
    pub slot_timeout: Duration,
    pub rate_wait_max: Duration,
    /// Keepalive comment cadence before the first stream frame; 0 disables.
    pub pre_heartbeat_ms: u64,
    /// Pacing between synthesized stream chunks.
    pub streaming_synthesis_delta_ms: u64,
    pub synthesis_window: usize,
    pub max_pending_tool_loops: usize,
    pub pending_tool_ttl: Duration,
    /// Reuse codex session ids across tool-loop continuations.
    pub codex_session_persist: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ua_mode: UserAgentMode::Normal,
            outbound_proxy: None,
            rate_retry_budget: Duration::from_secs(2),
            failover_limit: 2,
            request_deadline: Duration::from_secs(300),
            slot_timeout: Duration::from_secs(30),
            rate_wait_max: Duration::from_secs(10),
            pre_heartbeat_ms: 0,
            streaming_synthesis_delta_ms: 15,
            synthesis_window: 24,
            max_pending_tool_loops: 64,
            pending_tool_ttl: Duration::from_secs(300),
            codex_session_persist: true,
        }
    }
}

pub struct Engine {
    router: Arc<VirtualRouter>,
    vault: Arc<CredentialVault>,
    profiles: Arc<ProfileRegistry>,
    providers: HashMap<String, ProviderConfig>,
    client: Arc<dyn UpstreamClient>,
    sink: SharedSnapshotSink,
    slots: SlotMap,
    pending: Arc<PendingTable>,
    rate: RateLimiter,
    config: EngineConfig,
}

impl Engine {
    pub fn new(
        router: Arc<VirtualRouter>,
        vault: Arc<CredentialVault>,
        profiles: Arc<ProfileRegistry>,
        providers: HashMap<String, ProviderConfig>,
        client: Arc<dyn UpstreamClient>,
        sink: SharedSnapshotSink,
        config: EngineConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            router,
            vault,
            profiles,
            providers,
            client,
            sink,
            slots: SlotMap::new(),
            pending: Arc::new(PendingTable::new(
                config.max_pending_tool_loops,
                config.pending_tool_ttl,
            )),
            rate: RateLimiter::new(config.rate_wait_max),
            config,
        })
    }

    pub fn pending(&self) -> &PendingTable {
        &self.pending
    }

    /// Process one request end to end on its entry protocol.
    pub async fn handle(
        &self,
        request_id: String,
        route_hint: Option<String>,
        request: EntryRequest,
    ) -> Result<EngineResponse, GatewayError> {
        let entry = request.entry_protocol();
        let stream = request.wants_stream();

        match request {
            EntryRequest::SubmitToolOutputs { response_id, body } => {
                self.handle_submit(request_id, response_id, body).await
            }
            other => {
                let canonical = canonicalize(&other)?;
                let response_id = new_response_id();
                self.run(
                    request_id, entry, stream, route_hint, canonical, None, response_id, None,
                )
                .await
            }
        }
    }

    /// `submit_tool_outputs` claims the parked continuation, appends the tool
    /// results as tool-role turns, and re-enters the pipeline pinned to the
    /// original target.
    async fn handle_submit(
        &self,
        request_id: String,
        response_id: String,
        body: SubmitToolOutputsRequest,
    ) -> Result<EngineResponse, GatewayError> {
        if body.tool_outputs.is_empty() {
            return Err(GatewayError::BadRequest(
                "tool_outputs must not be empty".to_string(),
            ));
        }
        let continuation = self.pending.claim(&response_id)?;
        let mut canonical = continuation.request;
        for output in &body.tool_outputs {
            canonical
                .messages
                .push(ChatMessage::tool_reply(&output.tool_call_id, &output.output));
        }

        let session = self
            .config
            .codex_session_persist
            .then_some(continuation.codex_session)
            .flatten();
        self.run(
            request_id,
            EntryProtocol::OpenAiResponses,
            body.stream.unwrap_or(false),
            None,
            canonical,
            Some(continuation.target),
            response_id,
            session,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn run(
        &self,
        request_id: String,
        entry: EntryProtocol,
        stream: bool,
        route_hint: Option<String>,
        canonical: ChatCompletionRequest,
        fixed_target: Option<RouteTarget>,
        response_id: String,
        session: Option<CodexSession>,
    ) -> Result<EngineResponse, GatewayError> {
        let mut ctx =
            PipelineContext::new(request_id, entry, stream, self.config.request_deadline);
        ctx.process_mode = if canonical.tools.as_ref().is_some_and(|tools| !tools.is_empty()) {
            ProcessMode::Tools
        } else {
            ProcessMode::Chat
        };
        ctx.codex_session = session.or_else(|| {
            (self.config.ua_mode == UserAgentMode::Codex).then(CodexSession::mint)
        });

        let targets = match fixed_target {
            Some(target) => {
                ctx.route = "continuation".to_string();
                vec![target]
            }
            None => {
                let digest = serde_json::to_vec(&canonical).unwrap_or_default();
                let decision = self.router.decide(&RouteSignals {
                    hint: route_hint.as_deref(),
                    model: &canonical.model,
                    has_tools: ctx.process_mode == ProcessMode::Tools,
                    has_vision: has_vision(&canonical),
                    char_estimate: char_estimate(&canonical),
                    body_digest: &digest,
                })?;
                info!(
                    event = "request_routed",
                    request_id = %ctx.request_id,
                    entry = %entry,
                    route = %decision.route,
                    targets = decision.targets.len(),
                    confidence = decision.confidence,
                    is_stream = stream
                );
                ctx.route = decision.route;
                decision.targets
            }
        };
        if targets.is_empty() {
            return Err(GatewayError::Busy("no routable targets".to_string()));
        }

        self.snap(
            &ctx,
            "router",
            "client-request",
            Direction::Req,
            serde_json::to_value(&canonical).unwrap_or_default(),
        );

        let limit = targets.len().min(self.config.failover_limit + 1);
        let mut last_error = None;
        for (attempt, target) in targets.into_iter().take(limit).enumerate() {
            match self
                .try_target(&mut ctx, &canonical, &target, &response_id)
                .await
            {
                Ok(response) => return Ok(response),
                Err(err) if err.allows_failover() && attempt + 1 < limit => {
                    warn!(
                        event = "target_failover",
                        request_id = %ctx.request_id,
                        target = %target.provider_key(),
                        attempt = attempt,
                        error = %err
                    );
                    last_error = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_error
            .unwrap_or_else(|| GatewayError::Busy("no target accepted the request".to_string())))
    }

    async fn try_target(
        &self,
        ctx: &mut PipelineContext,
        canonical: &ChatCompletionRequest,
        target: &RouteTarget,
        response_id: &str,
    ) -> Result<EngineResponse, GatewayError> {
        let provider = self.providers.get(&target.provider).ok_or_else(|| {
            GatewayError::BadRequest(format!("unknown provider {}", target.provider))
        })?;
        let profile = self.profiles.get(&target.profile);

        let (account, mut credential) = self.vault.acquire(&target.provider).await?;
        let slot_key = format!("{}#{}", target.provider_key(), credential.id());
        let slot = self
            .slots
            .acquire(&slot_key, self.config.slot_timeout.min(ctx.remaining()))
            .await?;
        self.rate
            .acquire(credential.id(), profile.rate_limit())
            .await?;

        let upstream_stream = match provider.streaming {
            StreamSupport::Auto => ctx.stream,
            StreamSupport::Always => true,
            StreamSupport::Never => false,
        };
        if !ctx.stream && upstream_stream {
            ctx.process_mode = ProcessMode::StreamToChat;
        }

        let mut body = provider_body(provider.family, canonical, &target.model, upstream_stream)?;
        profile.apply_request(&mut body)?;
        self.snap(
            ctx,
            &target.provider_key(),
            "provider",
            Direction::Req,
            body.clone(),
        );

        let mut envelope = build_envelope(
            self.config.ua_mode,
            provider,
            &credential,
            body.clone(),
            upstream_stream,
            &ctx.request_id,
            ctx.codex_session.as_ref(),
        );

        let health_key = target.key();
        let mut auth_retried = false;
        let mut rate_retried = false;
        let reply = loop {
            let attempt = tokio::time::timeout(
                ctx.remaining(),
                self.client.send(&envelope, &profile, &ctx.request_id),
            )
            .await
            .map_err(|_| GatewayError::Timeout("request deadline exceeded".to_string()))?;

            match attempt {
                Ok(reply) => break reply,
                Err(GatewayError::Auth(message)) if !auth_retried => {
                    // One refresh-and-retry per request on upstream 401.
                    auth_retried = true;
                    credential = self
                        .vault
                        .refresh(&account)
                        .await
                        .map_err(|_| GatewayError::Auth(message))?;
                    envelope = build_envelope(
                        self.config.ua_mode,
                        provider,
                        &credential,
                        body.clone(),
                        upstream_stream,
                        &ctx.request_id,
                        ctx.codex_session.as_ref(),
                    );
                }
                Err(GatewayError::RateLimited {
                    message,
                    retry_after,
                }) => {
                    let budget = self.config.rate_retry_budget;
                    if !rate_retried
                        && let Some(wait) = retry_after
                        && wait <= budget
                    {
                        rate_retried = true;
                        tokio::time::sleep(wait).await;
                        continue;
                    }
                    self.router.health().mark_degraded(&health_key);
                    self.vault.mark_failure(&account, "rate_limit").await;
                    return Err(GatewayError::RateLimited {
                        message,
                        retry_after,
                    });
                }
                Err(err @ GatewayError::UpstreamTransient(_)) => {
                    self.router.health().mark_failure(&health_key);
                    self.vault.mark_failure(&account, "upstream_transient").await;
                    return Err(err);
                }
                Err(err @ GatewayError::Auth(_)) => {
                    self.router.health().mark_failure(&health_key);
                    self.vault.mark_failure(&account, "auth").await;
                    return Err(err);
                }
                Err(err) => return Err(err),
            }
        };

        self.router.health().mark_success(&health_key);
        self.vault.mark_success(&account).await;

        self.respond(ctx, canonical, target, provider, &profile, reply, slot, response_id)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn respond(
        &self,
        ctx: &PipelineContext,
        canonical: &ChatCompletionRequest,
        target: &RouteTarget,
        provider: &ProviderConfig,
        profile: &CompatProfile,
        reply: UpstreamReply,
        slot: slots::SlotPermit,
        response_id: &str,
    ) -> Result<EngineResponse, GatewayError> {
        match (ctx.stream, reply) {
            (false, UpstreamReply::Json(mut value)) => {
                profile.rewrite_response(&mut value);
                self.snap(
                    ctx,
                    &target.provider_key(),
                    "provider",
                    Direction::Resp,
                    value.clone(),
                );
                let mut chat = parse_provider_response(provider.family, value)?;
                self.govern(ctx, target, &mut chat)?;
                let body = self.entry_body(ctx, canonical, target, chat, response_id)?;
                self.snap(
                    ctx,
                    &target.provider_key(),
                    "client-response",
                    Direction::Resp,
                    body.clone(),
                );
                drop(slot);
                Ok(EngineResponse::Json(body))
            }
            (false, UpstreamReply::Stream(mut events)) => {
                // Collect the upstream stream into one canonical response.
                let mut adapter = ChunkAdapter::for_family(provider.family, now_unix());
                let mut collector = ChatStreamCollector::new();
                loop {
                    let next = tokio::time::timeout(ctx.remaining(), events.recv())
                        .await
                        .map_err(|_| {
                            GatewayError::Timeout("upstream stream stalled".to_string())
                        })?;
                    let Some(event) = next else { break };
                    let terminal = adapter.saw_terminal(&event);
                    for chunk in adapter.push(&event) {
                        collector.push_chunk(chunk);
                    }
                    if terminal {
                        break;
                    }
                }
                for chunk in adapter.finish() {
                    collector.push_chunk(chunk);
                }
                let mut chat = collector.finalize();
                self.govern(ctx, target, &mut chat)?;
                let body = self.entry_body(ctx, canonical, target, chat, response_id)?;
                self.snap(
                    ctx,
                    &target.provider_key(),
                    "client-response",
                    Direction::Resp,
                    body.clone(),
                );
                drop(slot);
                Ok(EngineResponse::Json(body))
            }
            (true, reply) => {
                self.respond_stream(ctx, canonical, target, provider, profile, reply, slot, response_id)
            }
        }
    }

    /// Client asked for SSE. Spawn the emitting task; dropping the returned
    /// receiver (client disconnect) ends the task, which drops the upstream
    /// reply and the target slot.
    #[allow(clippy::too_many_arguments)]
    fn respond_stream(
        &self,
        ctx: &PipelineContext,
        canonical: &ChatCompletionRequest,
        target: &RouteTarget,
        provider: &ProviderConfig,
        profile: &CompatProfile,
        reply: UpstreamReply,
        slot: slots::SlotPermit,
        response_id: &str,
    ) -> Result<EngineResponse, GatewayError> {
        let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(64);
        let task = StreamTask {
            ctx: ctx.clone(),
            canonical: canonical.clone(),
            target: target.clone(),
            response_id: response_id.to_string(),
            pending: self.pending.clone(),
            pre_heartbeat_ms: self.config.pre_heartbeat_ms,
            synthesis_delta_ms: self.config.streaming_synthesis_delta_ms,
            synthesis_window: self.config.synthesis_window,
        };

        match reply {
            UpstreamReply::Stream(events) => {
                let family = provider.family;
                tokio::spawn(async move {
                    let _slot = slot;
                    pump_passthrough(task, family, events, tx).await;
                });
            }
            UpstreamReply::Json(mut value) => {
                profile.rewrite_response(&mut value);
                self.snap(
                    ctx,
                    &target.provider_key(),
                    "provider",
                    Direction::Resp,
                    value.clone(),
                );
                let mut chat = parse_provider_response(provider.family, value)?;
                self.govern(ctx, target, &mut chat)?;
                tokio::spawn(async move {
                    let _slot = slot;
                    pump_synthesized(task, chat, tx).await;
                });
            }
        }
        Ok(EngineResponse::Stream(rx))
    }

    /// Convert the canonical response onto the entry protocol; the Responses
    /// entry additionally parks the continuation behind `requires_action`.
    fn entry_body(
        &self,
        ctx: &PipelineContext,
        canonical: &ChatCompletionRequest,
        target: &RouteTarget,
        chat: ChatCompletionResponse,
        response_id: &str,
    ) -> Result<Value, GatewayError> {
        let body = match ctx.entry {
            EntryProtocol::OpenAiChat => serde_json::to_value(&chat),
            EntryProtocol::AnthropicMessages => {
                serde_json::to_value(claude_chat::response::chat_to_messages(chat))
            }
            EntryProtocol::OpenAiResponses => {
                let assistant = chat.choices.first().map(|choice| choice.message.clone());
                let response = responses_chat::response::chat_to_responses(chat, response_id);
                if response.required_action.is_some()
                    && let Some(assistant) = assistant
                {
                    self.pending.park(
                        response_id,
                        continuation_request(canonical, &assistant),
                        target.clone(),
                        ctx.codex_session.clone(),
                    )?;
                }
                serde_json::to_value(&response)
            }
        };
        body.map_err(|err| GatewayError::UpstreamTransient(format!("render response: {err}")))
    }

    /// Tool-call governance over an assembled canonical response. Shape
    /// failures snapshot under `<tool>/<reason>` and surface as
    /// `ToolShapeError`; the engine never retries them.
    fn govern(
        &self,
        ctx: &PipelineContext,
        target: &RouteTarget,
        chat: &mut ChatCompletionResponse,
    ) -> Result<(), GatewayError> {
        for choice in &mut chat.choices {
            match govern_message(&mut choice.message) {
                Ok(notes) => {
                    for note in notes {
                        debug!(
                            event = "tool_call_normalized",
                            request_id = %ctx.request_id,
                            tool = %note.tool,
                            reason = note.reason
                        );
                    }
                }
                Err(err) => {
                    if let GatewayError::ToolShape { tool, reason } = &err {
                        let payload = choice
                            .message
                            .tool_calls
                            .as_ref()
                            .and_then(|calls| serde_json::to_value(calls).ok())
                            .unwrap_or(Value::Null);
                        self.sink.record(
                            Snapshot::new(
                                ctx.request_id.clone(),
                                ctx.entry,
                                target.provider_key(),
                                tool.clone(),
                                Direction::Resp,
                                payload,
                            )
                            .with_reason(reason.clone()),
                        );
                    }
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    fn snap(
        &self,
        ctx: &PipelineContext,
        provider_key: &str,
        stage: &str,
        direction: Direction,
        payload: Value,
    ) {
        self.sink.record(Snapshot::new(
            ctx.request_id.clone(),
            ctx.entry,
            provider_key,
            stage,
            direction,
            payload,
        ));
    }
}

/// Owned state handed to a spawned stream-emitting task.
struct StreamTask {
    ctx: PipelineContext,
    canonical: ChatCompletionRequest,
    target: RouteTarget,
    response_id: String,
    pending: Arc<PendingTable>,
    pre_heartbeat_ms: u64,
    synthesis_delta_ms: u64,
    synthesis_window: usize,
}

/// Pass-through: upstream SSE frames through the converters to the client,
/// with keepalive comments until the first real frame.
async fn pump_passthrough(
    task: StreamTask,
    family: ProviderFamily,
    mut events: mpsc::Receiver<routecodex_protocol::sse::SseEvent>,
    tx: mpsc::Sender<Result<Bytes, std::io::Error>>,
) {
    let mut adapter = ChunkAdapter::for_family(family, now_unix());
    let mut encoder = EntryEncoder::new(
        task.ctx.entry,
        &task.response_id,
        &task.canonical.model,
        now_unix(),
    );
    let heartbeat = Duration::from_millis(task.pre_heartbeat_ms.max(1));
    let mut first_frame = false;

    loop {
        if task.ctx.remaining().is_zero() {
            let _ = tx
                .send(Ok(error_frame(
                    task.ctx.entry,
                    &GatewayError::Timeout("request deadline exceeded".to_string()),
                )))
                .await;
            return;
        }
        let next = if !first_frame && task.pre_heartbeat_ms > 0 {
            match tokio::time::timeout(heartbeat, events.recv()).await {
                Ok(event) => event,
                Err(_) => {
                    // Heartbeats flow until the first real frame shows up.
                    if tx
                        .send(Ok(routecodex_protocol::sse::encode_comment("keepalive")))
                        .await
                        .is_err()
                    {
                        return;
                    }
                    continue;
                }
            }
        } else {
            match tokio::time::timeout(task.ctx.remaining(), events.recv()).await {
                Ok(event) => event,
                Err(_) => None,
            }
        };

        let Some(event) = next else { break };
        first_frame = true;
        let terminal = adapter.saw_terminal(&event);
        for chunk in adapter.push(&event) {
            for frame in encoder.on_chunk(chunk) {
                if tx.send(Ok(frame)).await.is_err() {
                    return;
                }
            }
        }
        if terminal {
            break;
        }
    }

    for chunk in adapter.finish() {
        for frame in encoder.on_chunk(chunk) {
            if tx.send(Ok(frame)).await.is_err() {
                return;
            }
        }
    }
    let (frames, built) = encoder.finish();
    park_if_required(&task, built.as_ref());
    for frame in frames {
        if tx.send(Ok(frame)).await.is_err() {
            return;
        }
    }
    debug!(
        event = "stream_complete",
        request_id = %task.ctx.request_id,
        target = %task.target.provider_key()
    );
}

/// Upstream answered JSON but the client asked for SSE: emit synthesized
/// incremental chunks at the configured cadence.
async fn pump_synthesized(
    task: StreamTask,
    chat: ChatCompletionResponse,
    tx: mpsc::Sender<Result<Bytes, std::io::Error>>,
) {
    let mut encoder = EntryEncoder::new(
        task.ctx.entry,
        &task.response_id,
        &chat.model,
        chat.created,
    );
    let cadence = Duration::from_millis(task.synthesis_delta_ms);

    for chunk in synthesize_chat_chunks(&chat, task.synthesis_window) {
        for frame in encoder.on_chunk(chunk) {
            if tx.send(Ok(frame)).await.is_err() {
                return;
            }
        }
        if !cadence.is_zero() {
            tokio::time::sleep(cadence).await;
        }
    }
    let (frames, built) = encoder.finish();
    park_if_required(&task, built.as_ref());
    for frame in frames {
        if tx.send(Ok(frame)).await.is_err() {
            return;
        }
    }
}

/// Park a tool-loop continuation when a Responses turn stopped at
/// `requires_action`.
fn park_if_required(task: &StreamTask, built: Option<&ResponsesResponse>) {
    let Some(response) = built else { return };
    if response.required_action.is_none() {
        return;
    }
    let assistant = responses_chat::response::responses_to_chat(response.clone())
        .choices
        .into_iter()
        .next()
        .map(|choice| choice.message);
    let Some(assistant) = assistant else { return };
    let follow = continuation_request(&task.canonical, &assistant);
    if let Err(err) = task.pending.park(
        &task.response_id,
        follow,
        task.target.clone(),
        task.ctx.codex_session.clone(),
    ) {
        warn!(
            event = "tool_loop_park_failed",
            request_id = %task.ctx.request_id,
            response_id = %task.response_id,
            error = %err
        );
    }
}

/// Parse the entry request and convert it to the canonical chat form,
/// rejecting empty conversations before any upstream call.
fn canonicalize(request: &EntryRequest) -> Result<ChatCompletionRequest, GatewayError> {
    match request {
        EntryRequest::Chat(chat) => {
            if chat.messages.is_empty() {
                return Err(GatewayError::BadRequest(
                    "messages must not be empty".to_string(),
                ));
            }
            Ok(chat.clone())
        }
        EntryRequest::Messages(messages) => {
            if messages.messages.is_empty() {
                return Err(GatewayError::BadRequest(
                    "messages must not be empty".to_string(),
                ));
            }
            Ok(claude_chat::request::messages_to_chat(messages.clone()))
        }
        EntryRequest::Responses(responses) => {
            let chat = responses_chat::request::responses_to_chat(responses.clone());
            if chat.messages.iter().all(|message| {
                matches!(message.role, ChatRole::System | ChatRole::Developer)
            }) {
                return Err(GatewayError::BadRequest(
                    "input must not be empty".to_string(),
                ));
            }
            Ok(chat)
        }
        EntryRequest::SubmitToolOutputs { .. } => Err(GatewayError::BadRequest(
            "submit_tool_outputs is handled by its own endpoint".to_string(),
        )),
    }
}

fn continuation_request(
    canonical: &ChatCompletionRequest,
    assistant: &ChatResponseMessage,
) -> ChatCompletionRequest {
    let mut request = canonical.clone();
    request.messages.push(ChatMessage {
        role: ChatRole::Assistant,
        content: assistant
            .content
            .clone()
            .map(routecodex_protocol::openai::chat::ChatContent::Text),
        tool_calls: assistant.tool_calls.clone(),
        tool_call_id: None,
        reasoning_content: None,
        name: None,
        extra: serde_json::Map::new(),
    });
    request
}

/// Canonical chat request → provider-family wire body.
fn provider_body(
    family: ProviderFamily,
    canonical: &ChatCompletionRequest,
    model: &str,
    upstream_stream: bool,
) -> Result<Value, GatewayError> {
    let rendered = match family {
        ProviderFamily::OpenAiChat => {
            let mut request = canonical.clone();
            request.model = model.to_string();
            request.stream = Some(upstream_stream);
            serde_json::to_value(&request)
        }
        ProviderFamily::Anthropic => {
            let mut request = claude_chat::request::chat_to_messages(canonical.clone());
            request.model = model.to_string();
            request.stream = Some(upstream_stream);
            serde_json::to_value(&request)
        }
        ProviderFamily::OpenAiResponses => {
            let mut request = responses_chat::request::chat_to_responses(canonical.clone());
            request.model = model.to_string();
            request.stream = Some(upstream_stream);
            serde_json::to_value(&request)
        }
    };
    rendered.map_err(|err| GatewayError::BadRequest(format!("render provider body: {err}")))
}

/// Provider-family response body → canonical chat response.
fn parse_provider_response(
    family: ProviderFamily,
    value: Value,
) -> Result<ChatCompletionResponse, GatewayError> {
    let unexpected =
        |err: serde_json::Error| GatewayError::UpstreamTransient(format!("upstream shape: {err}"));
    match family {
        ProviderFamily::OpenAiChat => serde_json::from_value(value).map_err(unexpected),
        ProviderFamily::Anthropic => {
            let response = serde_json::from_value(value).map_err(unexpected)?;
            Ok(claude_chat::response::messages_to_chat(response))
        }
        ProviderFamily::OpenAiResponses => {
            let response = serde_json::from_value(value).map_err(unexpected)?;
            Ok(responses_chat::response::responses_to_chat(response))
        }
    }
}

fn has_vision(canonical: &ChatCompletionRequest) -> bool {
    canonical.messages.iter().any(|message| {
        message
            .content
            .as_ref()
            .is_some_and(|content| content.has_image_parts())
    })
}

fn char_estimate(canonical: &ChatCompletionRequest) -> usize {
    canonical
        .messages
        .iter()
        .filter_map(|message| message.content.as_ref())
        .map(|content| content.joined_text().chars().count())
        .sum()
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_messages_fail_before_any_upstream_call() {
        let chat: ChatCompletionRequest =
            serde_json::from_value(json!({"model": "m", "messages": []})).unwrap();
        let err = canonicalize(&EntryRequest::Chat(chat)).unwrap_err();
        assert!(matches!(err, GatewayError::BadRequest(_)));
    }

    #[test]
    fn responses_input_with_only_instructions_is_empty() {
        let responses: routecodex_protocol::openai::responses::ResponsesRequest =
            serde_json::from_value(json!({"model": "m", "input": []})).unwrap();
        let err = canonicalize(&EntryRequest::Responses(responses)).unwrap_err();
        assert!(matches!(err, GatewayError::BadRequest(_)));
    }

    #[test]
    fn provider_body_sets_model_and_stream_per_family() {
        let canonical: ChatCompletionRequest = serde_json::from_value(json!({
            "model": "route-model",
            "messages": [{"role": "user", "content": "hi"}],
        }))
        .unwrap();

        let chat = provider_body(ProviderFamily::OpenAiChat, &canonical, "glm-4.6", true).unwrap();
        assert_eq!(chat["model"], "glm-4.6");
        assert_eq!(chat["stream"], true);

        let claude =
            provider_body(ProviderFamily::Anthropic, &canonical, "claude-sonnet-4-5", false)
                .unwrap();
        assert_eq!(claude["model"], "claude-sonnet-4-5");
        assert!(claude["max_tokens"].as_u64().is_some());

        let responses =
            provider_body(ProviderFamily::OpenAiResponses, &canonical, "gpt-5", false).unwrap();
        assert_eq!(responses["model"], "gpt-5");
        assert!(responses["input"].is_array());
    }

    #[test]
    fn vision_and_length_signals_come_from_content() {
        let canonical: ChatCompletionRequest = serde_json::from_value(json!({
            "model": "m",
            "messages": [
                {"role": "user", "content": [
                    {"type": "text", "text": "what is in this image"},
                    {"type": "image_url", "image_url": {"url": "data:image/png;base64,AA=="}},
                ]},
            ],
        }))
        .unwrap();
        assert!(has_vision(&canonical));
        assert_eq!(char_estimate(&canonical), "what is in this image".len());
    }

    #[test]
    fn continuation_appends_the_assistant_tool_turn() {
        let canonical: ChatCompletionRequest = serde_json::from_value(json!({
            "model": "m",
            "messages": [{"role": "user", "content": "run echo"}],
        }))
        .unwrap();
        let assistant: ChatResponseMessage = serde_json::from_value(json!({
            "role": "assistant",
            "content": null,
            "tool_calls": [{
                "id": "call_1", "type": "function",
                "function": {"name": "echo", "arguments": "{\"text\":\"ping\"}"},
            }],
        }))
        .unwrap();
        let follow = continuation_request(&canonical, &assistant);
        assert_eq!(follow.messages.len(), 2);
        assert_eq!(
            follow.messages[1].tool_calls.as_ref().unwrap()[0]
                .id
                .as_deref(),
            Some("call_1")
        );
    }
}

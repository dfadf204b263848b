//! Provider transport: the upstream HTTP call, SSE read loop, auth attach,
//! and status → taxonomy mapping.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use futures_util::StreamExt;
use http::StatusCode;
use http::header::RETRY_AFTER;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{info, warn};

use routecodex_common::{GatewayError, ProviderFamily, UserAgentMode};
use routecodex_compat::CompatProfile;
use routecodex_protocol::sse::{SseEvent, SseParser};
use routecodex_vault::Credential;

use crate::context::{CodexSession, ProviderConfig};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const RESPONSES_BETA: &str = "responses-2024-12-17";
const NORMAL_USER_AGENT: &str = concat!("routecodex/", env!("CARGO_PKG_VERSION"));
const CODEX_USER_AGENT: &str = "codex_cli_rs (routecodex)";

/// Everything needed to execute one upstream HTTP call.
#[derive(Debug, Clone)]
pub struct ProviderEnvelope {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Value,
    pub expect_sse: bool,
    pub provider_id: String,
}

/// The upstream's answer: a JSON body, or an ordered stream of SSE events.
/// Dropping the event receiver aborts the upstream read.
pub enum UpstreamReply {
    Json(Value),
    Stream(mpsc::Receiver<SseEvent>),
}

/// The upstream HTTP seam the engine drives; mocked in tests.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    async fn send(
        &self,
        envelope: &ProviderEnvelope,
        profile: &CompatProfile,
        request_id: &str,
    ) -> Result<UpstreamReply, GatewayError>;
}

/// Real transport over a pooled wreq client.
pub struct HttpUpstreamClient {
    outbound_proxy: Option<String>,
}

static CLIENT_CACHE: OnceLock<Mutex<HashMap<Option<String>, wreq::Client>>> = OnceLock::new();

fn shared_client(proxy: Option<&str>) -> Result<wreq::Client, GatewayError> {
    let key = proxy.map(|value| value.to_string());
    let cache = CLIENT_CACHE.get_or_init(|| Mutex::new(HashMap::new()));
    let mut guard = cache
        .lock()
        .map_err(|_| GatewayError::UpstreamTransient("http client cache poisoned".to_string()))?;
    if let Some(client) = guard.get(&key) {
        return Ok(client.clone());
    }

    let mut builder = wreq::Client::builder().connect_timeout(Duration::from_secs(15));
    if let Some(proxy_url) = proxy {
        builder = builder.proxy(
            wreq::Proxy::all(proxy_url)
                .map_err(|err| GatewayError::UpstreamTransient(err.to_string()))?,
        );
    }
    let client = builder
        .build()
        .map_err(|err| GatewayError::UpstreamTransient(err.to_string()))?;
    guard.insert(key, client.clone());
    Ok(client)
}

/// Assemble the outbound call for a provider family: endpoint path, auth
/// header shape, protocol version headers, request-id propagation, and the
/// UA mode (codex mode synthesizes session/conversation ids).
pub fn build_envelope(
    ua_mode: UserAgentMode,
    provider: &ProviderConfig,
    credential: &Credential,
    body: Value,
    expect_sse: bool,
    request_id: &str,
    codex_session: Option<&CodexSession>,
) -> ProviderEnvelope {
    let base = provider.base_url.trim_end_matches('/');
    let path = match provider.family {
        ProviderFamily::OpenAiChat => "/chat/completions",
        ProviderFamily::OpenAiResponses => "/responses",
        ProviderFamily::Anthropic => "/messages",
    };

    let mut headers = Vec::new();
    match (provider.family, provider.x_api_key) {
        (ProviderFamily::Anthropic, _) | (_, true) => {
            headers.push(("x-api-key".to_string(), credential.bearer().to_string()));
        }
        _ => headers.push((
            "authorization".to_string(),
            format!("Bearer {}", credential.bearer()),
        )),
    }
    match provider.family {
        ProviderFamily::Anthropic => {
            headers.push(("anthropic-version".to_string(), ANTHROPIC_VERSION.to_string()));
        }
        ProviderFamily::OpenAiResponses => {
            headers.push(("openai-beta".to_string(), RESPONSES_BETA.to_string()));
        }
        ProviderFamily::OpenAiChat => {}
    }
    headers.push(("x-request-id".to_string(), request_id.to_string()));
    match ua_mode {
        UserAgentMode::Normal => {
            headers.push(("user-agent".to_string(), NORMAL_USER_AGENT.to_string()));
        }
        UserAgentMode::Codex => {
            headers.push(("user-agent".to_string(), CODEX_USER_AGENT.to_string()));
            if let Some(session) = codex_session {
                headers.push(("session_id".to_string(), session.session_id.clone()));
                headers.push((
                    "conversation_id".to_string(),
                    session.conversation_id.clone(),
                ));
            }
        }
    }
    if expect_sse {
        headers.push(("accept".to_string(), "text/event-stream".to_string()));
    }
    for (name, value) in &provider.headers {
        headers.push((name.clone(), value.clone()));
    }

    ProviderEnvelope {
        url: format!("{base}{path}"),
        headers,
        body,
        expect_sse,
        provider_id: provider.id.clone(),
    }
}

impl HttpUpstreamClient {
    pub fn new(outbound_proxy: Option<String>) -> Self {
        Self { outbound_proxy }
    }
}

#[async_trait]
impl UpstreamClient for HttpUpstreamClient {
    /// Execute the call. Non-2xx statuses map onto the error taxonomy, with
    /// the target's compatibility profile given first say on 4xx bodies.
    async fn send(
        &self,
        envelope: &ProviderEnvelope,
        profile: &CompatProfile,
        request_id: &str,
    ) -> Result<UpstreamReply, GatewayError> {
        let client = shared_client(self.outbound_proxy.as_deref())?;

        info!(
            event = "upstream_request",
            request_id = %request_id,
            provider = %envelope.provider_id,
            url = %envelope.url,
            is_stream = envelope.expect_sse
        );
        let started = Instant::now();

        let mut request = client.post(&envelope.url).json(&envelope.body);
        for (name, value) in &envelope.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request.send().await.map_err(|err| {
            warn!(
                event = "upstream_response",
                request_id = %request_id,
                provider = %envelope.provider_id,
                status = "network_error",
                elapsed_ms = started.elapsed().as_millis() as u64,
                error = %err
            );
            GatewayError::UpstreamTransient(err.to_string())
        })?;

        let status = response.status();
        info!(
            event = "upstream_response",
            request_id = %request_id,
            provider = %envelope.provider_id,
            status = status.as_u16(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            is_stream = envelope.expect_sse
        );

        if !status.is_success() {
            let headers = response.headers().clone();
            let body = response
                .bytes()
                .await
                .map_err(|err| GatewayError::UpstreamTransient(err.to_string()))?;
            let body_text = String::from_utf8_lossy(&body).to_string();
            return Err(classify_failure(status, &headers, &body_text, profile));
        }

        if !envelope.expect_sse {
            let body = response
                .bytes()
                .await
                .map_err(|err| GatewayError::UpstreamTransient(err.to_string()))?;
            let value = serde_json::from_slice(&body).map_err(|err| {
                GatewayError::UpstreamTransient(format!("invalid upstream json: {err}"))
            })?;
            return Ok(UpstreamReply::Json(value));
        }

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(read_sse(response, tx));
        Ok(UpstreamReply::Stream(rx))
    }
}

/// Upstream SSE read loop: parse frames out of the byte stream and forward
/// them in order. A dropped receiver ends the loop, which drops the response
/// and aborts the upstream connection.
async fn read_sse(response: wreq::Response, tx: mpsc::Sender<SseEvent>) {
    let mut parser = SseParser::new();
    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        let Ok(bytes) = chunk else { break };
        for event in parser.push_bytes(&bytes) {
            if tx.send(event).await.is_err() {
                return;
            }
        }
    }
    for event in parser.finish() {
        if tx.send(event).await.is_err() {
            return;
        }
    }
}

fn classify_failure(
    status: StatusCode,
    headers: &http::HeaderMap,
    body: &str,
    profile: &CompatProfile,
) -> GatewayError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            GatewayError::Auth(format!("upstream {}: {}", status.as_u16(), truncate(body)))
        }
        StatusCode::TOO_MANY_REQUESTS => GatewayError::RateLimited {
            message: truncate(body),
            retry_after: retry_after(headers),
        },
        status if status.is_server_error() => {
            GatewayError::UpstreamTransient(format!("upstream {}", status.as_u16()))
        }
        status => {
            if let Some(error) = profile.classify_error_body(status.as_u16(), body) {
                return error;
            }
            // Body-declared tool failures are a taxonomy class of their own.
            if body.contains("MALFORMED_FUNCTION_CALL") {
                return GatewayError::tool_shape("upstream", "malformed_function_call");
            }
            GatewayError::UpstreamRejected {
                status: status.as_u16(),
                message: truncate(body),
            }
        }
    }
}

/// Parse `Retry-After` in both delta-seconds and HTTP-date forms.
pub fn retry_after(headers: &http::HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let when = httpdate::parse_http_date(value).ok()?;
    when.duration_since(SystemTime::now()).ok()
}

fn truncate(body: &str) -> String {
    const MAX: usize = 512;
    if body.len() <= MAX {
        body.to_string()
    } else {
        let mut cut = MAX;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}...", &body[..cut])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_after_parses_seconds_and_http_date() {
        let mut headers = http::HeaderMap::new();
        headers.insert(RETRY_AFTER, "2".parse().unwrap());
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(2)));

        let future = SystemTime::now() + Duration::from_secs(30);
        headers.insert(
            RETRY_AFTER,
            httpdate::fmt_http_date(future).parse().unwrap(),
        );
        let parsed = retry_after(&headers).unwrap();
        assert!(parsed <= Duration::from_secs(30));
        assert!(parsed > Duration::from_secs(25));
    }

    #[test]
    fn status_classes_map_to_taxonomy() {
        let profile = CompatProfile::passthrough();
        let headers = http::HeaderMap::new();
        assert!(matches!(
            classify_failure(StatusCode::UNAUTHORIZED, &headers, "nope", &profile),
            GatewayError::Auth(_)
        ));
        assert!(matches!(
            classify_failure(StatusCode::BAD_GATEWAY, &headers, "", &profile),
            GatewayError::UpstreamTransient(_)
        ));
        assert!(matches!(
            classify_failure(StatusCode::TOO_MANY_REQUESTS, &headers, "slow", &profile),
            GatewayError::RateLimited { .. }
        ));
        assert!(matches!(
            classify_failure(
                StatusCode::BAD_REQUEST,
                &headers,
                "{\"error\":\"MALFORMED_FUNCTION_CALL\"}",
                &profile,
            ),
            GatewayError::ToolShape { .. }
        ));
        assert!(matches!(
            classify_failure(StatusCode::NOT_FOUND, &headers, "missing", &profile),
            GatewayError::UpstreamRejected { status: 404, .. }
        ));
    }

    #[test]
    fn codex_mode_synthesizes_session_headers() {
        let provider = ProviderConfig {
            id: "openai".to_string(),
            family: ProviderFamily::OpenAiResponses,
            base_url: "https://api.openai.com/v1".to_string(),
            headers: Vec::new(),
            streaming: Default::default(),
            x_api_key: false,
        };
        let credential = Credential::ApiKey(routecodex_vault::ApiKeyCredential {
            id: "k".to_string(),
            value: "sk-test".to_string(),
        });
        let session = CodexSession::mint();
        let envelope = build_envelope(
            UserAgentMode::Codex,
            &provider,
            &credential,
            serde_json::json!({}),
            true,
            "req_1",
            Some(&session),
        );

        assert_eq!(envelope.url, "https://api.openai.com/v1/responses");
        let find = |name: &str| {
            envelope
                .headers
                .iter()
                .find(|(header, _)| header == name)
                .map(|(_, value)| value.clone())
        };
        assert!(find("session_id").unwrap().starts_with("codex_cli_session_"));
        assert!(
            find("conversation_id")
                .unwrap()
                .starts_with("codex_cli_conversation_")
        );
        assert_eq!(find("x-request-id").as_deref(), Some("req_1"));
        assert_eq!(find("openai-beta").as_deref(), Some(RESPONSES_BETA));
        assert_eq!(find("accept").as_deref(), Some("text/event-stream"));
    }

    #[test]
    fn anthropic_family_uses_x_api_key_and_version() {
        let provider = ProviderConfig {
            id: "anthropic".to_string(),
            family: ProviderFamily::Anthropic,
            base_url: "https://api.anthropic.com/v1/".to_string(),
            headers: Vec::new(),
            streaming: Default::default(),
            x_api_key: false,
        };
        let credential = Credential::ApiKey(routecodex_vault::ApiKeyCredential {
            id: "k".to_string(),
            value: "sk-ant".to_string(),
        });
        let envelope = build_envelope(
            UserAgentMode::Normal,
            &provider,
            &credential,
            serde_json::json!({}),
            false,
            "req_2",
            None,
        );
        assert_eq!(envelope.url, "https://api.anthropic.com/v1/messages");
        assert!(
            envelope
                .headers
                .iter()
                .any(|(name, value)| name == "x-api-key" && value == "sk-ant")
        );
        assert!(
            envelope
                .headers
                .iter()
                .any(|(name, value)| name == "anthropic-version" && value == ANTHROPIC_VERSION)
        );
    }
}

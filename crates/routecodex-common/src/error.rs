use std::time::Duration;

use http::StatusCode;
use serde_json::{Value, json};

use crate::EntryProtocol;

/// Typed error taxonomy surfaced by the request-processing core.
///
/// Stages return these; the pipeline engine owns retry and failover decisions,
/// and the ingress renders unretryable errors on the entry protocol's native
/// error shape.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("auth error: {0}")]
    Auth(String),

    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("upstream transient failure: {0}")]
    UpstreamTransient(String),

    #[error("upstream rejected ({status}): {message}")]
    UpstreamRejected { status: u16, message: String },

    #[error("tool call shape invalid ({tool}): {reason}")]
    ToolShape { tool: String, reason: String },

    #[error("gateway busy: {0}")]
    Busy(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("policy violation: {0}")]
    PolicyViolation(String),
}

/// Discriminant used in logs, snapshots, and wire error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    BadRequest,
    Auth,
    RateLimited,
    UpstreamTransient,
    UpstreamRejected,
    ToolShape,
    Busy,
    Timeout,
    PolicyViolation,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::BadRequest => "bad_request",
            ErrorKind::Auth => "auth_error",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::UpstreamTransient => "upstream_transient",
            ErrorKind::UpstreamRejected => "upstream_rejected",
            ErrorKind::ToolShape => "tool_shape_error",
            ErrorKind::Busy => "gateway_busy",
            ErrorKind::Timeout => "timeout",
            ErrorKind::PolicyViolation => "policy_violation",
        }
    }
}

impl GatewayError {
    pub fn rate_limited(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self::RateLimited {
            message: message.into(),
            retry_after,
        }
    }

    pub fn tool_shape(tool: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ToolShape {
            tool: tool.into(),
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            GatewayError::BadRequest(_) => ErrorKind::BadRequest,
            GatewayError::Auth(_) => ErrorKind::Auth,
            GatewayError::RateLimited { .. } => ErrorKind::RateLimited,
            GatewayError::UpstreamTransient(_) => ErrorKind::UpstreamTransient,
            GatewayError::UpstreamRejected { .. } => ErrorKind::UpstreamRejected,
            GatewayError::ToolShape { .. } => ErrorKind::ToolShape,
            GatewayError::Busy(_) => ErrorKind::Busy,
            GatewayError::Timeout(_) => ErrorKind::Timeout,
            GatewayError::PolicyViolation(_) => ErrorKind::PolicyViolation,
        }
    }

    /// Whether the engine may move on to an alternative target after this error.
    pub fn allows_failover(&self) -> bool {
        matches!(
            self,
            GatewayError::UpstreamTransient(_) | GatewayError::RateLimited { .. }
        )
    }

    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::Auth(_) => StatusCode::UNAUTHORIZED,
            GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::UpstreamTransient(_) => StatusCode::BAD_GATEWAY,
            GatewayError::UpstreamRejected { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            GatewayError::ToolShape { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            GatewayError::Busy(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::PolicyViolation(_) => StatusCode::UNPROCESSABLE_ENTITY,
        }
    }

    /// Render this error on the entry protocol's native error envelope.
    pub fn wire_body(&self, entry: EntryProtocol) -> Value {
        match entry {
            EntryProtocol::OpenAiChat | EntryProtocol::OpenAiResponses => json!({
                "error": {
                    "message": self.to_string(),
                    "type": self.kind().as_str(),
                    "code": self.kind().as_str(),
                }
            }),
            EntryProtocol::AnthropicMessages => json!({
                "type": "error",
                "error": {
                    "type": anthropic_error_type(self.kind()),
                    "message": self.to_string(),
                }
            }),
        }
    }
}

fn anthropic_error_type(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::BadRequest | ErrorKind::ToolShape | ErrorKind::PolicyViolation => {
            "invalid_request_error"
        }
        ErrorKind::Auth => "authentication_error",
        ErrorKind::RateLimited => "rate_limit_error",
        ErrorKind::Busy => "overloaded_error",
        ErrorKind::UpstreamTransient | ErrorKind::UpstreamRejected | ErrorKind::Timeout => {
            "api_error"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openai_envelope_has_message_type_code() {
        let err = GatewayError::BadRequest("messages must not be empty".to_string());
        let body = err.wire_body(EntryProtocol::OpenAiChat);
        assert_eq!(body["error"]["type"], "bad_request");
        assert_eq!(body["error"]["code"], "bad_request");
        assert!(
            body["error"]["message"]
                .as_str()
                .unwrap()
                .contains("messages must not be empty")
        );
    }

    #[test]
    fn anthropic_envelope_is_typed_error() {
        let err = GatewayError::rate_limited("upstream 429", Some(Duration::from_secs(1)));
        let body = err.wire_body(EntryProtocol::AnthropicMessages);
        assert_eq!(body["type"], "error");
        assert_eq!(body["error"]["type"], "rate_limit_error");
    }

    #[test]
    fn failover_only_for_transient_classes() {
        assert!(GatewayError::UpstreamTransient("502".into()).allows_failover());
        assert!(GatewayError::rate_limited("429", None).allows_failover());
        assert!(!GatewayError::tool_shape("apply_patch", "invalid_json").allows_failover());
        assert!(!GatewayError::PolicyViolation("refused".into()).allows_failover());
    }
}

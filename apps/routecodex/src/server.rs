//! HTTP ingress: the three wire protocols plus the tool-output continuation
//! endpoint on one port, with health/ready probes.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use axum::Router;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header::CONTENT_TYPE};
use axum::response::Response;
use axum::routing::{get, post};
use bytes::Bytes;
use tokio_stream::wrappers::ReceiverStream;
use tracing::info;

use routecodex_common::{EntryProtocol, GatewayError, new_request_id};
use routecodex_engine::{Engine, EngineResponse, EntryRequest};

pub struct AppState {
    pub engine: Arc<Engine>,
    pub auth: crate::auth::ServerAuth,
    pub ready: AtomicBool,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/responses", post(responses))
        .route(
            "/v1/responses/{id}/submit_tool_outputs",
            post(submit_tool_outputs),
        )
        .route("/v1/messages", post(messages))
        .route("/health", get(health))
        .route("/ready", get(ready))
        .with_state(state)
}

async fn chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    serve(state, headers, body, EntryProtocol::OpenAiChat, |bytes| {
        Ok(EntryRequest::Chat(parse_body(bytes)?))
    })
    .await
}

async fn responses(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    serve(state, headers, body, EntryProtocol::OpenAiResponses, |bytes| {
        Ok(EntryRequest::Responses(parse_body(bytes)?))
    })
    .await
}

async fn messages(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    serve(state, headers, body, EntryProtocol::AnthropicMessages, |bytes| {
        Ok(EntryRequest::Messages(parse_body(bytes)?))
    })
    .await
}

async fn submit_tool_outputs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    serve(
        state,
        headers,
        body,
        EntryProtocol::OpenAiResponses,
        move |bytes| {
            Ok(EntryRequest::SubmitToolOutputs {
                response_id: id,
                body: parse_body(bytes)?,
            })
        },
    )
    .await
}

async fn health() -> Response {
    json_response(
        StatusCode::OK,
        serde_json::json!({"status": "healthy"}),
        None,
    )
}

async fn ready(State(state): State<Arc<AppState>>) -> Response {
    if state.ready.load(Ordering::Relaxed) {
        json_response(StatusCode::OK, serde_json::json!({"status": "ready"}), None)
    } else {
        json_response(
            StatusCode::SERVICE_UNAVAILABLE,
            serde_json::json!({"status": "starting"}),
            None,
        )
    }
}

async fn serve<F>(
    state: Arc<AppState>,
    headers: HeaderMap,
    body: Bytes,
    entry: EntryProtocol,
    parse: F,
) -> Response
where
    F: FnOnce(Bytes) -> Result<EntryRequest, GatewayError>,
{
    let request_id = header_value(&headers, "x-request-id").unwrap_or_else(new_request_id);
    let started = Instant::now();

    if let Err(err) = state.auth.authenticate(&headers) {
        return error_response(entry, &request_id, err);
    }

    let request = match parse(body) {
        Ok(request) => request,
        Err(err) => return error_response(entry, &request_id, err),
    };
    let is_stream = request.wants_stream();
    info!(
        event = "client_request",
        request_id = %request_id,
        entry = %entry,
        is_stream = is_stream
    );

    let hint = header_value(&headers, "x-route-hint");
    let result = state
        .engine
        .handle(request_id.clone(), hint, request)
        .await;

    let response = match result {
        Ok(EngineResponse::Json(body)) => json_response(
            StatusCode::OK,
            body,
            Some(&request_id),
        ),
        Ok(EngineResponse::Stream(rx)) => sse_response(rx, &request_id),
        Err(err) => error_response(entry, &request_id, err),
    };
    info!(
        event = "client_response",
        request_id = %request_id,
        entry = %entry,
        status = response.status().as_u16(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        is_stream = is_stream
    );
    response
}

fn parse_body<T: serde::de::DeserializeOwned>(bytes: Bytes) -> Result<T, GatewayError> {
    if bytes.is_empty() {
        return Err(GatewayError::BadRequest("missing request body".to_string()));
    }
    serde_json::from_slice(&bytes)
        .map_err(|err| GatewayError::BadRequest(format!("invalid json body: {err}")))
}

fn json_response(
    status: StatusCode,
    body: serde_json::Value,
    request_id: Option<&str>,
) -> Response {
    let mut response = Response::new(Body::from(body.to_string()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    if let Some(request_id) = request_id
        && let Ok(value) = HeaderValue::from_str(request_id)
    {
        response
            .headers_mut()
            .insert("x-routecodex-request-id", value);
    }
    response
}

fn sse_response(
    rx: tokio::sync::mpsc::Receiver<Result<Bytes, std::io::Error>>,
    request_id: &str,
) -> Response {
    let mut response = Response::new(Body::from_stream(ReceiverStream::new(rx)));
    *response.status_mut() = StatusCode::OK;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    response
        .headers_mut()
        .insert("cache-control", HeaderValue::from_static("no-cache"));
    if let Ok(value) = HeaderValue::from_str(request_id) {
        response
            .headers_mut()
            .insert("x-routecodex-request-id", value);
    }
    response
}

fn error_response(entry: EntryProtocol, request_id: &str, err: GatewayError) -> Response {
    json_response(err.status(), err.wire_body(entry), Some(request_id))
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
}

//! Pending tool-loop continuations for the Responses protocol.
//!
//! When an upstream turn stops at `requires_action`, the canonical request
//! plus its chosen target are parked here keyed by `responseId`; the
//! `submit_tool_outputs` HTTP handler claims the entry, appends the outputs,
//! and re-enters the pipeline. Entries are TTL-evicted and the table is
//! bounded.

use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

use routecodex_common::GatewayError;
use routecodex_protocol::openai::chat::ChatCompletionRequest;
use routecodex_router::RouteTarget;

use crate::context::CodexSession;

#[derive(Debug, Clone)]
pub struct PendingContinuation {
    pub response_id: String,
    /// Canonical chat conversation including the assistant tool-call turn.
    pub request: ChatCompletionRequest,
    pub target: RouteTarget,
    pub codex_session: Option<CodexSession>,
    created_at: Instant,
}

pub struct PendingTable {
    entries: DashMap<String, PendingContinuation>,
    capacity: usize,
    ttl: Duration,
}

impl PendingTable {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            capacity: capacity.max(1),
            ttl,
        }
    }

    pub fn park(
        &self,
        response_id: &str,
        request: ChatCompletionRequest,
        target: RouteTarget,
        codex_session: Option<CodexSession>,
    ) -> Result<(), GatewayError> {
        self.evict_expired();
        if self.entries.len() >= self.capacity {
            return Err(GatewayError::Busy(
                "pending tool-loop table is full".to_string(),
            ));
        }
        self.entries.insert(
            response_id.to_string(),
            PendingContinuation {
                response_id: response_id.to_string(),
                request,
                target,
                codex_session,
                created_at: Instant::now(),
            },
        );
        Ok(())
    }

    /// Claim removes the entry: any worker may re-enter the pipeline with it,
    /// and a second submit for the same id fails cleanly.
    pub fn claim(&self, response_id: &str) -> Result<PendingContinuation, GatewayError> {
        let (_, entry) = self.entries.remove(response_id).ok_or_else(|| {
            GatewayError::BadRequest(format!(
                "no pending tool loop for response {response_id}"
            ))
        })?;
        if entry.created_at.elapsed() > self.ttl {
            return Err(GatewayError::BadRequest(format!(
                "tool loop for response {response_id} expired"
            )));
        }
        Ok(entry)
    }

    /// Drop a parked continuation (client went away mid-loop).
    pub fn discard(&self, response_id: &str) {
        self.entries.remove(response_id);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict_expired(&self) {
        let ttl = self.ttl;
        self.entries
            .retain(|_, entry| entry.created_at.elapsed() <= ttl);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use routecodex_router::{RouteTargetSpec, parse_target_spec};
    use serde_json::json;

    fn request() -> ChatCompletionRequest {
        serde_json::from_value(json!({
            "model": "gpt-5",
            "messages": [{"role": "user", "content": "run echo"}],
        }))
        .unwrap()
    }

    fn target() -> RouteTarget {
        parse_target_spec(&RouteTargetSpec::Plain("openai.gpt-5".to_string())).unwrap()
    }

    #[tokio::test]
    async fn park_then_claim_round_trips() {
        let table = PendingTable::new(4, Duration::from_secs(60));
        table.park("resp_1", request(), target(), None).unwrap();
        let entry = table.claim("resp_1").unwrap();
        assert_eq!(entry.response_id, "resp_1");
        assert_eq!(entry.target.provider, "openai");
        // Claimed means gone.
        assert!(table.claim("resp_1").is_err());
    }

    #[tokio::test]
    async fn capacity_overflow_is_gateway_busy() {
        let table = PendingTable::new(2, Duration::from_secs(60));
        table.park("a", request(), target(), None).unwrap();
        table.park("b", request(), target(), None).unwrap();
        let err = table.park("c", request(), target(), None).unwrap_err();
        assert!(matches!(err, GatewayError::Busy(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let table = PendingTable::new(4, Duration::from_millis(100));
        table.park("resp_ttl", request(), target(), None).unwrap();
        tokio::time::advance(Duration::from_millis(200)).await;
        assert!(table.claim("resp_ttl").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entries_free_capacity() {
        let table = PendingTable::new(1, Duration::from_millis(50));
        table.park("old", request(), target(), None).unwrap();
        tokio::time::advance(Duration::from_millis(100)).await;
        table.park("new", request(), target(), None).unwrap();
        assert_eq!(table.len(), 1);
    }
}

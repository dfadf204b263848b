//! Per-target single-flight: a keyed semaphore map with capacity 1 per
//! `(provider, model, credential)` triple. Waiters queue FIFO; acquisition
//! respects the request deadline; idle entries are garbage collected.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use routecodex_common::GatewayError;

pub struct SlotMap {
    slots: DashMap<String, Arc<Semaphore>>,
}

/// Held for the whole upstream exchange, including the streamed tail.
pub struct SlotPermit {
    _permit: OwnedSemaphorePermit,
}

impl SlotMap {
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
        }
    }

    pub async fn acquire(&self, key: &str, timeout: Duration) -> Result<SlotPermit, GatewayError> {
        let semaphore = self
            .slots
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(1)))
            .clone();

        let permit = tokio::time::timeout(timeout, semaphore.acquire_owned())
            .await
            .map_err(|_| {
                GatewayError::Busy(format!("target {key} is busy; slot wait timed out"))
            })?
            .map_err(|_| GatewayError::Busy(format!("target {key} slot closed")))?;

        Ok(SlotPermit { _permit: permit })
    }

    /// Drop map entries whose semaphore nobody holds or waits on.
    pub fn gc(&self) {
        self.slots
            .retain(|_, semaphore| Arc::strong_count(semaphore) > 1 || semaphore.available_permits() == 0);
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl Default for SlotMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn second_acquire_waits_for_release() {
        let slots = Arc::new(SlotMap::new());
        let inflight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let slots = slots.clone();
            let inflight = inflight.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                let permit = slots
                    .acquire("glm.glm-4.6#key-1", Duration::from_secs(1))
                    .await
                    .unwrap();
                let now = inflight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                inflight.fetch_sub(1, Ordering::SeqCst);
                drop(permit);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn timeout_yields_gateway_busy() {
        let slots = SlotMap::new();
        let held = slots
            .acquire("qwen.qwen3#k", Duration::from_millis(50))
            .await
            .unwrap();
        let result = slots.acquire("qwen.qwen3#k", Duration::from_millis(20)).await;
        assert!(matches!(result, Err(GatewayError::Busy(_))));
        drop(held);
        assert!(
            slots
                .acquire("qwen.qwen3#k", Duration::from_millis(50))
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn distinct_keys_run_concurrently() {
        let slots = SlotMap::new();
        let _a = slots.acquire("a", Duration::from_millis(50)).await.unwrap();
        let _b = slots.acquire("b", Duration::from_millis(50)).await.unwrap();
        assert_eq!(slots.len(), 2);
    }

    #[tokio::test]
    async fn gc_drops_idle_entries() {
        let slots = SlotMap::new();
        {
            let _permit = slots.acquire("idle", Duration::from_millis(50)).await.unwrap();
        }
        slots.gc();
        assert!(slots.is_empty());
    }
}

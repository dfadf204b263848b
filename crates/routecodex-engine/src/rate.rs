//! Per-credential token bucket. Buckets exist only for credentials whose
//! compatibility profile declares an rpm hint; everything else passes free.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::time::Instant;

use routecodex_common::GatewayError;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    burst: f64,
    refill_per_sec: f64,
    last: Instant,
}

impl Bucket {
    fn new(rpm: u32, burst: u32) -> Self {
        let burst = burst.max(1) as f64;
        Self {
            tokens: burst,
            burst,
            refill_per_sec: rpm.max(1) as f64 / 60.0,
            last: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.burst);
        self.last = now;
    }

    /// Seconds until one token is available; zero consumes it now.
    fn reserve(&mut self) -> f64 {
        let now = Instant::now();
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            0.0
        } else {
            (1.0 - self.tokens) / self.refill_per_sec
        }
    }

    fn consume_after_wait(&mut self) {
        let now = Instant::now();
        self.refill(now);
        self.tokens = (self.tokens - 1.0).max(0.0);
    }
}

pub struct RateLimiter {
    buckets: DashMap<String, Arc<Mutex<Bucket>>>,
    max_wait: Duration,
}

impl RateLimiter {
    pub fn new(max_wait: Duration) -> Self {
        Self {
            buckets: DashMap::new(),
            max_wait,
        }
    }

    /// Wait for a send slot on `credential_id` under the hinted `(rpm, burst)`
    /// budget, failing `RateLimited` when the wait would exceed the cap.
    pub async fn acquire(
        &self,
        credential_id: &str,
        hint: Option<(u32, u32)>,
    ) -> Result<(), GatewayError> {
        let Some((rpm, burst)) = hint else {
            return Ok(());
        };

        // Clone the bucket handle out so no map shard guard is held across
        // an await.
        let bucket = self
            .buckets
            .entry(credential_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Bucket::new(rpm, burst))))
            .clone();

        let wait_secs = bucket.lock().await.reserve();
        if wait_secs <= f64::EPSILON {
            return Ok(());
        }
        let wait = Duration::from_secs_f64(wait_secs);
        if wait > self.max_wait {
            return Err(GatewayError::rate_limited(
                format!("credential {credential_id} bucket exhausted"),
                Some(wait),
            ));
        }

        tokio::time::sleep(wait).await;
        bucket.lock().await.consume_after_wait();
        Ok(())
    }
}

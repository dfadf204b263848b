use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::RoutingDecision;

/// Bounded, TTL'd memo of routing decisions keyed by request fingerprint.
/// Keeps load-balancing stable across retries of the same request.
#[derive(Debug)]
pub struct DecisionMemo {
    ttl: Duration,
    capacity: usize,
    entries: HashMap<[u8; 32], (Instant, RoutingDecision)>,
}

impl DecisionMemo {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity: capacity.max(1),
            entries: HashMap::new(),
        }
    }

    pub fn get(&mut self, fingerprint: &[u8; 32]) -> Option<RoutingDecision> {
        let (stored_at, decision) = self.entries.get(fingerprint)?;
        if stored_at.elapsed() > self.ttl {
            self.entries.remove(fingerprint);
            return None;
        }
        Some(decision.clone())
    }

    pub fn insert(&mut self, fingerprint: [u8; 32], decision: RoutingDecision) {
        if self.entries.len() >= self.capacity {
            self.prune();
        }
        self.entries.insert(fingerprint, (Instant::now(), decision));
    }

    fn prune(&mut self) {
        let ttl = self.ttl;
        self.entries
            .retain(|_, (stored_at, _)| stored_at.elapsed() <= ttl);
        // Still over capacity after dropping expired entries: evict oldest.
        while self.entries.len() >= self.capacity {
            let Some(oldest) = self
                .entries
                .iter()
                .min_by_key(|(_, (stored_at, _))| *stored_at)
                .map(|(key, _)| *key)
            else {
                break;
            };
            self.entries.remove(&oldest);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decision(route: &str) -> RoutingDecision {
        RoutingDecision {
            route: route.to_string(),
            targets: Vec::new(),
            confidence: 1.0,
        }
    }

    #[test]
    fn entries_expire_after_ttl() {
        let mut memo = DecisionMemo::new(Duration::from_millis(20), 16);
        memo.insert([1; 32], decision("default"));
        assert!(memo.get(&[1; 32]).is_some());
        std::thread::sleep(Duration::from_millis(30));
        assert!(memo.get(&[1; 32]).is_none());
    }

    #[test]
    fn capacity_is_bounded() {
        let mut memo = DecisionMemo::new(Duration::from_secs(60), 4);
        for seed in 0..10u8 {
            memo.insert([seed; 32], decision("default"));
        }
        assert!(memo.entries.len() <= 4);
    }
}

//! Weighted round-robin target selection with a health filter.

use crate::RouteTarget;
use crate::health::{HealthState, HealthTable};

/// Smooth weighted round-robin state for one route. Each selection advances
/// every candidate's tick by its weight and drains the chosen one by the
/// total, which spreads picks proportionally without bursts.
#[derive(Debug)]
pub struct RouteRotation {
    ticks: Vec<i64>,
}

impl RouteRotation {
    pub fn new(targets: &[RouteTarget]) -> Self {
        Self {
            ticks: vec![0; targets.len()],
        }
    }

    /// Order targets for one request: eligible targets by weighted RR (ties
    /// broken least-recently-used first), quarantined targets last, sorted by
    /// next retry time. The first entry is the primary; the rest are
    /// failover alternatives.
    pub fn select(&mut self, targets: &[RouteTarget], health: &HealthTable) -> Vec<RouteTarget> {
        if self.ticks.len() != targets.len() {
            self.ticks = vec![0; targets.len()];
        }

        let mut eligible: Vec<usize> = Vec::new();
        let mut quarantined: Vec<usize> = Vec::new();
        for (index, target) in targets.iter().enumerate() {
            match health.state(&target.key()) {
                HealthState::Healthy | HealthState::Degraded => eligible.push(index),
                HealthState::Quarantined => quarantined.push(index),
            }
        }

        // Everything quarantined: hand back the full list ordered by how soon
        // each target may be retried.
        if eligible.is_empty() {
            quarantined.sort_by_key(|&index| health.next_retry_at(&targets[index].key()));
            return quarantined.into_iter().map(|i| targets[i].clone()).collect();
        }

        let total: i64 = eligible
            .iter()
            .map(|&index| targets[index].weight as i64)
            .sum();

        let mut ordered = Vec::with_capacity(eligible.len() + quarantined.len());
        let mut remaining = eligible.clone();
        while !remaining.is_empty() {
            for &index in &remaining {
                self.ticks[index] += targets[index].weight as i64;
            }
            let mut best = remaining[0];
            for &index in &remaining[1..] {
                if self.ticks[index] > self.ticks[best] {
                    best = index;
                } else if self.ticks[index] == self.ticks[best] {
                    // Tie: prefer the least recently used target.
                    let best_used = health.last_used(&targets[best].key());
                    let this_used = health.last_used(&targets[index].key());
                    if this_used < best_used {
                        best = index;
                    }
                }
            }
            self.ticks[best] -= total;
            remaining.retain(|&index| index != best);
            ordered.push(best);
        }

        quarantined.sort_by_key(|&index| health.next_retry_at(&targets[index].key()));
        ordered.extend(quarantined);

        if let Some(&primary) = ordered.first() {
            health.touch(&targets[primary].key());
        }
        ordered.into_iter().map(|i| targets[i].clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::HealthConfig;
    use crate::{RouteTargetSpec, parse_target_spec};
    use std::collections::HashMap;

    fn targets() -> Vec<RouteTarget> {
        vec![
            parse_target_spec(&RouteTargetSpec::Detailed {
                target: "glm.glm-4.6".to_string(),
                weight: 2,
                key: None,
                profile: None,
            })
            .unwrap(),
            parse_target_spec(&RouteTargetSpec::Plain("qwen.qwen3-coder".to_string())).unwrap(),
        ]
    }

    #[test]
    fn weights_spread_selections_proportionally() {
        let targets = targets();
        let health = HealthTable::new(HealthConfig::default());
        let mut rotation = RouteRotation::new(&targets);

        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..30 {
            let ordered = rotation.select(&targets, &health);
            *counts.entry(ordered[0].provider.clone()).or_default() += 1;
        }
        assert_eq!(counts["glm"], 20);
        assert_eq!(counts["qwen"], 10);
    }

    #[test]
    fn quarantined_targets_sort_last() {
        let targets = targets();
        let health = HealthTable::new(HealthConfig {
            failure_threshold: 1,
            ..Default::default()
        });
        health.mark_failure(&targets[0].key());

        let mut rotation = RouteRotation::new(&targets);
        let ordered = rotation.select(&targets, &health);
        assert_eq!(ordered[0].provider, "qwen");
        assert_eq!(ordered[1].provider, "glm");
    }

    #[test]
    fn all_quarantined_orders_by_next_retry() {
        let targets = targets();
        let health = HealthTable::new(HealthConfig {
            failure_threshold: 1,
            ..Default::default()
        });
        health.mark_failure(&targets[1].key());
        std::thread::sleep(std::time::Duration::from_millis(5));
        health.mark_failure(&targets[0].key());

        let mut rotation = RouteRotation::new(&targets);
        let ordered = rotation.select(&targets, &health);
        // qwen was quarantined first, so it retries first.
        assert_eq!(ordered[0].provider, "qwen");
        assert_eq!(ordered.len(), 2);
    }
}

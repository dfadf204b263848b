use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::info;

/// Identifies one concrete target for health accounting.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetKey {
    pub provider: String,
    pub model: String,
    pub key_id: Option<String>,
}

impl std::fmt::Display for TargetKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.key_id {
            Some(key) => write!(f, "{}.{}#{}", self.provider, self.model, key),
            None => write!(f, "{}.{}", self.provider, self.model),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Healthy,
    Degraded,
    Quarantined,
}

#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub failure_threshold: u32,
    pub recovery_threshold: u32,
    pub quarantine_window: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            recovery_threshold: 3,
            quarantine_window: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
struct TargetHealth {
    state: HealthState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    quarantined_until: Option<Instant>,
    last_used: Option<Instant>,
}

impl Default for TargetHealth {
    fn default() -> Self {
        Self {
            state: HealthState::Healthy,
            consecutive_failures: 0,
            consecutive_successes: 0,
            quarantined_until: None,
            last_used: None,
        }
    }
}

/// Lock-per-target health counters. Targets move Healthy → Degraded →
/// Quarantined on consecutive failures and claw back Degraded → Healthy on
/// consecutive successes; a quarantined target becomes eligible again once
/// its window lapses.
pub struct HealthTable {
    entries: DashMap<TargetKey, TargetHealth>,
    config: HealthConfig,
}

impl HealthTable {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            entries: DashMap::new(),
            config,
        }
    }

    /// Effective state at `now`: an expired quarantine reads as degraded so
    /// selection will retry the target.
    pub fn state(&self, key: &TargetKey) -> HealthState {
        match self.entries.get(key) {
            Some(entry) => match entry.state {
                HealthState::Quarantined
                    if entry
                        .quarantined_until
                        .is_none_or(|until| until <= Instant::now()) =>
                {
                    HealthState::Degraded
                }
                state => state,
            },
            None => HealthState::Healthy,
        }
    }

    /// When a quarantined target becomes eligible again.
    pub fn next_retry_at(&self, key: &TargetKey) -> Option<Instant> {
        self.entries.get(key).and_then(|entry| {
            (entry.state == HealthState::Quarantined)
                .then_some(entry.quarantined_until)
                .flatten()
        })
    }

    pub fn last_used(&self, key: &TargetKey) -> Option<Instant> {
        self.entries.get(key).and_then(|entry| entry.last_used)
    }

    pub fn touch(&self, key: &TargetKey) {
        self.entries.entry(key.clone()).or_default().last_used = Some(Instant::now());
    }

    pub fn mark_failure(&self, key: &TargetKey) {
        let mut entry = self.entries.entry(key.clone()).or_default();
        entry.consecutive_successes = 0;
        entry.consecutive_failures += 1;
        if entry.consecutive_failures >= self.config.failure_threshold {
            entry.state = HealthState::Quarantined;
            entry.quarantined_until = Some(Instant::now() + self.config.quarantine_window);
            info!(
                event = "target_quarantined",
                target = %key,
                window_secs = self.config.quarantine_window.as_secs()
            );
        } else if entry.state == HealthState::Healthy {
            entry.state = HealthState::Degraded;
        }
    }

    /// Degrade without counting toward quarantine (e.g. a 429 with a long
    /// Retry-After).
    pub fn mark_degraded(&self, key: &TargetKey) {
        let mut entry = self.entries.entry(key.clone()).or_default();
        if entry.state == HealthState::Healthy {
            entry.state = HealthState::Degraded;
        }
    }

    pub fn mark_success(&self, key: &TargetKey) {
        let mut entry = self.entries.entry(key.clone()).or_default();
        entry.consecutive_failures = 0;
        entry.consecutive_successes += 1;
        match entry.state {
            HealthState::Quarantined => {
                // First success after quarantine restores to degraded.
                entry.state = HealthState::Degraded;
                entry.quarantined_until = None;
                entry.consecutive_successes = 1;
            }
            HealthState::Degraded => {
                if entry.consecutive_successes >= self.config.recovery_threshold {
                    entry.state = HealthState::Healthy;
                }
            }
            HealthState::Healthy => {}
        }
    }
}

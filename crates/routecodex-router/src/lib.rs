//! Virtual router: classify an inbound request into a named route, then
//! resolve the route to concrete provider targets with a weighted
//! round-robin over healthy targets.

pub mod classify;
pub mod health;
pub mod memo;
pub mod select;

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use routecodex_common::GatewayError;

pub use classify::{ClassificationConfig, RouteSignals, estimate_tokens};
pub use health::{HealthConfig, HealthState, HealthTable, TargetKey};
pub use memo::DecisionMemo;

/// One entry of `virtualrouter.routing.<route>`: either a plain
/// `"provider.model"` string or an object with weight/key/profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RouteTargetSpec {
    Plain(String),
    Detailed {
        target: String,
        #[serde(default = "default_weight")]
        weight: u32,
        #[serde(default)]
        key: Option<String>,
        #[serde(default)]
        profile: Option<String>,
    },
}

fn default_weight() -> u32 {
    1
}

/// A parsed, runtime-ready route target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteTarget {
    pub provider: String,
    pub model: String,
    pub key_id: Option<String>,
    pub weight: u32,
    pub profile: String,
}

impl RouteTarget {
    pub fn key(&self) -> TargetKey {
        TargetKey {
            provider: self.provider.clone(),
            model: self.model.clone(),
            key_id: self.key_id.clone(),
        }
    }

    pub fn provider_key(&self) -> String {
        format!("{}.{}", self.provider, self.model)
    }
}

pub fn parse_target_spec(spec: &RouteTargetSpec) -> Result<RouteTarget, GatewayError> {
    let (raw, weight, key_id, profile) = match spec {
        RouteTargetSpec::Plain(raw) => (raw.as_str(), 1, None, None),
        RouteTargetSpec::Detailed {
            target,
            weight,
            key,
            profile,
        } => (target.as_str(), *weight, key.clone(), profile.clone()),
    };
    let (provider, model) = raw.split_once('.').ok_or_else(|| {
        GatewayError::BadRequest(format!("route target `{raw}` is not provider.model"))
    })?;
    if provider.is_empty() || model.is_empty() {
        return Err(GatewayError::BadRequest(format!(
            "route target `{raw}` is not provider.model"
        )));
    }
    Ok(RouteTarget {
        provider: provider.to_string(),
        model: model.to_string(),
        key_id,
        weight: weight.max(1),
        // The compatibility profile defaults to the provider's name.
        profile: profile.unwrap_or_else(|| provider.to_string()),
    })
}

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub routes: HashMap<String, Vec<RouteTarget>>,
    pub classification: ClassificationConfig,
    pub health: HealthConfig,
    /// Alternative targets returned beyond the primary, for in-request failover.
    pub max_alternatives: usize,
    pub memo_ttl: Duration,
    pub memo_capacity: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            routes: HashMap::new(),
            classification: ClassificationConfig::default(),
            health: HealthConfig::default(),
            max_alternatives: 2,
            memo_ttl: Duration::from_secs(10),
            memo_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RoutingDecision {
    pub route: String,
    pub targets: Vec<RouteTarget>,
    pub confidence: f64,
}

pub struct VirtualRouter {
    config: RouterConfig,
    health: HealthTable,
    rr: Mutex<HashMap<String, select::RouteRotation>>,
    memo: Mutex<DecisionMemo>,
}

impl VirtualRouter {
    pub fn new(config: RouterConfig) -> Self {
        let health = HealthTable::new(config.health.clone());
        let memo = DecisionMemo::new(config.memo_ttl, config.memo_capacity);
        Self {
            config,
            health,
            rr: Mutex::new(HashMap::new()),
            memo: Mutex::new(memo),
        }
    }

    pub fn health(&self) -> &HealthTable {
        &self.health
    }

    pub fn has_routes(&self) -> bool {
        !self.config.routes.is_empty()
    }

    /// Classify and resolve. The decision is memoized per request fingerprint
    /// for a bounded window so retries of the same request land on the same
    /// targets.
    pub fn decide(&self, signals: &RouteSignals<'_>) -> Result<RoutingDecision, GatewayError> {
        let fingerprint = signals.fingerprint();
        if let Ok(mut memo) = self.memo.lock()
            && let Some(decision) = memo.get(&fingerprint)
        {
            return Ok(decision);
        }

        let (route, confidence) =
            classify::classify(signals, &self.config.classification, &self.config.routes)?;
        let targets = self.resolve(&route)?;
        let decision = RoutingDecision {
            route,
            targets,
            confidence,
        };

        if let Ok(mut memo) = self.memo.lock() {
            memo.insert(fingerprint, decision.clone());
        }
        Ok(decision)
    }

    fn resolve(&self, route: &str) -> Result<Vec<RouteTarget>, GatewayError> {
        let configured = self
            .config
            .routes
            .get(route)
            .or_else(|| self.config.routes.get("default"))
            .ok_or_else(|| {
                GatewayError::BadRequest(format!("no targets configured for route {route}"))
            })?;
        if configured.is_empty() {
            return Err(GatewayError::BadRequest(format!(
                "route {route} has an empty target list"
            )));
        }

        let mut rr = self
            .rr
            .lock()
            .map_err(|_| GatewayError::Busy("router rotation lock poisoned".to_string()))?;
        let rotation = rr
            .entry(route.to_string())
            .or_insert_with(|| select::RouteRotation::new(configured));
        let ordered = rotation.select(configured, &self.health);
        Ok(ordered
            .into_iter()
            .take(self.config.max_alternatives + 1)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_routes() -> RouterConfig {
        let mut routes = HashMap::new();
        routes.insert(
            "default".to_string(),
            vec![
                parse_target_spec(&RouteTargetSpec::Plain("glm.glm-4.6".to_string())).unwrap(),
                parse_target_spec(&RouteTargetSpec::Plain("qwen.qwen3-coder".to_string()))
                    .unwrap(),
            ],
        );
        routes.insert(
            "tool_use".to_string(),
            vec![parse_target_spec(&RouteTargetSpec::Plain("glm.glm-4.6".to_string())).unwrap()],
        );
        RouterConfig {
            routes,
            ..Default::default()
        }
    }

    #[test]
    fn target_spec_parses_provider_and_dotted_model() {
        let target =
            parse_target_spec(&RouteTargetSpec::Plain("glm.glm-4.6".to_string())).unwrap();
        assert_eq!(target.provider, "glm");
        assert_eq!(target.model, "glm-4.6");
        assert_eq!(target.weight, 1);
        assert_eq!(target.profile, "glm");
    }

    #[test]
    fn detailed_spec_carries_weight_and_profile() {
        let spec: RouteTargetSpec = serde_json::from_value(serde_json::json!({
            "target": "qwen.qwen3-coder",
            "weight": 3,
            "profile": "qwen-coder",
        }))
        .unwrap();
        let target = parse_target_spec(&spec).unwrap();
        assert_eq!(target.weight, 3);
        assert_eq!(target.profile, "qwen-coder");
    }

    #[test]
    fn malformed_target_is_rejected() {
        assert!(parse_target_spec(&RouteTargetSpec::Plain("nodot".to_string())).is_err());
        assert!(parse_target_spec(&RouteTargetSpec::Plain(".model".to_string())).is_err());
    }

    #[test]
    fn memoized_decisions_are_stable_for_a_fingerprint() {
        let router = VirtualRouter::new(config_with_routes());
        let signals = RouteSignals {
            hint: None,
            model: "glm-4.6",
            has_tools: false,
            has_vision: false,
            char_estimate: 40,
            body_digest: b"same-request",
        };
        let first = router.decide(&signals).unwrap();
        // Rotation would hand the next request the other target; the memo
        // pins retries of the same request to the same primary.
        let second = router.decide(&signals).unwrap();
        assert_eq!(first.targets[0], second.targets[0]);
    }

    #[test]
    fn unknown_route_falls_back_to_default_targets() {
        let router = VirtualRouter::new(config_with_routes());
        let signals = RouteSignals {
            hint: None,
            model: "claude-sonnet-4-5",
            has_tools: false,
            has_vision: true,
            char_estimate: 10,
            body_digest: b"vision-request",
        };
        let decision = router.decide(&signals).unwrap();
        assert_eq!(decision.route, "vision");
        assert!(!decision.targets.is_empty());
    }
}

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use routecodex_common::GatewayError;

use crate::RouteTarget;

/// `virtualrouter.classificationConfig`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassificationConfig {
    /// Estimated-token threshold above which a request routes long-context.
    #[serde(default = "default_long_context_threshold")]
    pub long_context_threshold: usize,
    /// Explicit model → route map; keys ending in `*` match as prefixes.
    #[serde(default)]
    pub model_routes: HashMap<String, String>,
}

fn default_long_context_threshold() -> usize {
    32_000
}

impl Default for ClassificationConfig {
    fn default() -> Self {
        Self {
            long_context_threshold: default_long_context_threshold(),
            model_routes: HashMap::new(),
        }
    }
}

/// The classifier's view of a request, extracted at ingress.
#[derive(Debug, Clone, Copy)]
pub struct RouteSignals<'a> {
    /// Explicit `X-Route-Hint` header value.
    pub hint: Option<&'a str>,
    pub model: &'a str,
    pub has_tools: bool,
    pub has_vision: bool,
    /// Total characters of message text, for the token estimate.
    pub char_estimate: usize,
    /// Stable digest input for decision memoization.
    pub body_digest: &'a [u8],
}

impl RouteSignals<'_> {
    pub fn fingerprint(&self) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.model.as_bytes());
        hasher.update(&[self.has_tools as u8, self.has_vision as u8]);
        hasher.update(self.body_digest);
        *hasher.finalize().as_bytes()
    }
}

/// Advisory token estimate: four characters per token.
pub fn estimate_tokens(chars: usize) -> usize {
    chars / 4
}

/// Rule chain, first match wins: hint, tools, long-context, vision, model
/// map, default. Returns the route name and a confidence score.
pub fn classify(
    signals: &RouteSignals<'_>,
    config: &ClassificationConfig,
    routes: &HashMap<String, Vec<RouteTarget>>,
) -> Result<(String, f64), GatewayError> {
    if let Some(hint) = signals.hint {
        let hint = hint.trim();
        if !routes.contains_key(hint) {
            return Err(GatewayError::BadRequest(format!(
                "unknown route hint: {hint}"
            )));
        }
        return Ok((hint.to_string(), 1.0));
    }

    if signals.has_tools {
        return Ok(("tool_use".to_string(), 0.9));
    }

    if estimate_tokens(signals.char_estimate) >= config.long_context_threshold {
        return Ok(("long_context".to_string(), 0.8));
    }

    if signals.has_vision {
        return Ok(("vision".to_string(), 0.8));
    }

    if let Some(route) = model_route(&config.model_routes, signals.model) {
        return Ok((route, 0.7));
    }

    Ok(("default".to_string(), 0.5))
}

fn model_route(map: &HashMap<String, String>, model: &str) -> Option<String> {
    if let Some(route) = map.get(model) {
        return Some(route.clone());
    }
    for (pattern, route) in map {
        if let Some(prefix) = pattern.strip_suffix('*')
            && model.starts_with(prefix)
        {
            return Some(route.clone());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{RouteTargetSpec, parse_target_spec};

    fn routes() -> HashMap<String, Vec<RouteTarget>> {
        let target = parse_target_spec(&RouteTargetSpec::Plain("glm.glm-4.6".to_string())).unwrap();
        let mut routes = HashMap::new();
        routes.insert("default".to_string(), vec![target.clone()]);
        routes.insert("coding".to_string(), vec![target]);
        routes
    }

    fn signals<'a>(hint: Option<&'a str>, model: &'a str) -> RouteSignals<'a> {
        RouteSignals {
            hint,
            model,
            has_tools: false,
            has_vision: false,
            char_estimate: 100,
            body_digest: b"x",
        }
    }

    #[test]
    fn hint_wins_over_everything() {
        let config = ClassificationConfig::default();
        let mut with_tools = signals(Some("coding"), "glm-4.6");
        with_tools.has_tools = true;
        let (route, confidence) = classify(&with_tools, &config, &routes()).unwrap();
        assert_eq!(route, "coding");
        assert_eq!(confidence, 1.0);
    }

    #[test]
    fn unknown_hint_is_bad_request() {
        let config = ClassificationConfig::default();
        let result = classify(&signals(Some("nope"), "m"), &config, &routes());
        assert!(matches!(result, Err(GatewayError::BadRequest(_))));
    }

    #[test]
    fn tools_beat_long_context() {
        let config = ClassificationConfig {
            long_context_threshold: 10,
            ..Default::default()
        };
        let mut both = signals(None, "m");
        both.has_tools = true;
        both.char_estimate = 1_000_000;
        let (route, _) = classify(&both, &config, &routes()).unwrap();
        assert_eq!(route, "tool_use");
    }

    #[test]
    fn long_context_threshold_uses_char_estimate() {
        let config = ClassificationConfig {
            long_context_threshold: 100,
            ..Default::default()
        };
        let mut long = signals(None, "m");
        long.char_estimate = 400;
        let (route, _) = classify(&long, &config, &routes()).unwrap();
        assert_eq!(route, "long_context");

        let mut short = signals(None, "m");
        short.char_estimate = 399;
        let (route, _) = classify(&short, &config, &routes()).unwrap();
        assert_eq!(route, "default");
    }

    #[test]
    fn model_map_supports_prefixes() {
        let config = ClassificationConfig {
            model_routes: HashMap::from([
                ("glm-4.6".to_string(), "coding".to_string()),
                ("claude-*".to_string(), "anthropic".to_string()),
            ]),
            ..Default::default()
        };
        let (route, _) = classify(&signals(None, "glm-4.6"), &config, &routes()).unwrap();
        assert_eq!(route, "coding");
        let (route, _) =
            classify(&signals(None, "claude-sonnet-4-5"), &config, &routes()).unwrap();
        assert_eq!(route, "anthropic");
    }
}

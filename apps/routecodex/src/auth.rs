//! Server-side API key check. The key is hot-swappable so a config reload
//! does not need a restart; when no key is configured, auth is disabled.

use arc_swap::ArcSwap;
use http::HeaderMap;

use routecodex_common::GatewayError;

#[derive(Debug)]
pub struct ServerAuth {
    key: ArcSwap<Option<String>>,
}

impl ServerAuth {
    pub fn new(key: Option<String>) -> Self {
        Self {
            key: ArcSwap::from_pointee(key),
        }
    }

    pub fn replace(&self, key: Option<String>) {
        self.key.store(std::sync::Arc::new(key));
    }

    pub fn authenticate(&self, headers: &HeaderMap) -> Result<(), GatewayError> {
        let expected = self.key.load();
        let Some(expected) = expected.as_ref() else {
            return Ok(());
        };

        let presented = extract_api_key(headers)
            .ok_or_else(|| GatewayError::Auth("missing api key".to_string()))?;
        if presented != *expected {
            return Err(GatewayError::Auth("invalid api key".to_string()));
        }
        Ok(())
    }
}

/// Accepts `x-api-key: <key>` or `Authorization: Bearer <key>`.
fn extract_api_key(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers.get("x-api-key").and_then(|value| value.to_str().ok()) {
        return Some(value.trim().to_string());
    }
    let auth = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())?
        .trim();
    auth.strip_prefix("Bearer ")
        .or_else(|| auth.strip_prefix("bearer "))
        .map(|token| token.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn headers(name: &str, value: &str) -> HeaderMap {
        let mut map = HeaderMap::new();
        map.insert(
            http::header::HeaderName::from_bytes(name.as_bytes()).unwrap(),
            HeaderValue::from_str(value).unwrap(),
        );
        map
    }

    #[test]
    fn no_configured_key_disables_auth() {
        let auth = ServerAuth::new(None);
        assert!(auth.authenticate(&HeaderMap::new()).is_ok());
    }

    #[test]
    fn accepts_both_header_forms() {
        let auth = ServerAuth::new(Some("secret".to_string()));
        assert!(auth.authenticate(&headers("x-api-key", "secret")).is_ok());
        assert!(
            auth.authenticate(&headers("authorization", "Bearer secret"))
                .is_ok()
        );
        assert!(
            auth.authenticate(&headers("authorization", "bearer secret"))
                .is_ok()
        );
    }

    #[test]
    fn wrong_or_missing_key_is_auth_error() {
        let auth = ServerAuth::new(Some("secret".to_string()));
        assert!(matches!(
            auth.authenticate(&headers("x-api-key", "nope")),
            Err(GatewayError::Auth(_))
        ));
        assert!(matches!(
            auth.authenticate(&HeaderMap::new()),
            Err(GatewayError::Auth(_))
        ));
    }

    #[test]
    fn key_is_hot_swappable() {
        let auth = ServerAuth::new(Some("old".to_string()));
        auth.replace(Some("new".to_string()));
        assert!(auth.authenticate(&headers("x-api-key", "new")).is_ok());
        assert!(auth.authenticate(&headers("x-api-key", "old")).is_err());
    }
}

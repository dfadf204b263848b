use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use routecodex_common::GatewayError;

pub const DEVICE_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:device_code";

/// Per-provider OAuth endpoints from configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthProviderConfig {
    pub device_code_url: String,
    pub token_url: String,
    pub client_id: String,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub user_info_url: Option<String>,
}

/// A started device authorization, waiting for the user to approve.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DeviceAuthorization {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    #[serde(default)]
    pub verification_uri_complete: Option<String>,
    #[serde(default = "default_interval")]
    pub interval: u64,
    #[serde(default = "default_device_expiry")]
    pub expires_in: u64,
}

fn default_interval() -> u64 {
    5
}

fn default_device_expiry() -> u64 {
    900
}

/// Token-endpoint HTTP seam. Form-encoded POST; OAuth protocol errors come
/// back as the JSON body (with an `error` key), transport failures as
/// `UpstreamTransient`.
#[async_trait]
pub trait OAuthHttp: Send + Sync {
    async fn post_form(&self, url: &str, form: &[(String, String)]) -> Result<Value, GatewayError>;
}

pub struct WreqOAuthHttp {
    client: wreq::Client,
}

impl WreqOAuthHttp {
    pub fn new() -> Result<Self, GatewayError> {
        let client = wreq::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| GatewayError::UpstreamTransient(err.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl OAuthHttp for WreqOAuthHttp {
    async fn post_form(&self, url: &str, form: &[(String, String)]) -> Result<Value, GatewayError> {
        let response = self
            .client
            .post(url)
            .form(form)
            .send()
            .await
            .map_err(|err| GatewayError::UpstreamTransient(err.to_string()))?;
        let bytes = response
            .bytes()
            .await
            .map_err(|err| GatewayError::UpstreamTransient(err.to_string()))?;
        serde_json::from_slice(&bytes)
            .map_err(|err| GatewayError::UpstreamTransient(format!("token endpoint: {err}")))
    }
}

/// PKCE verifier/challenge pair (S256).
pub fn pkce_pair() -> (String, String) {
    use base64::Engine;
    use rand::Rng;
    use sha2::Digest;

    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-._~";
    let mut rng = rand::rng();
    let verifier: String = (0..64)
        .map(|_| ALPHABET[rng.random_range(0..ALPHABET.len())] as char)
        .collect();

    let digest = sha2::Sha256::digest(verifier.as_bytes());
    let challenge = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest);
    (verifier, challenge)
}

/// Open the user's browser at the verification URL; best-effort.
pub fn open_browser(url: &str) {
    #[cfg(target_os = "macos")]
    let launcher = "open";
    #[cfg(target_os = "windows")]
    let launcher = "explorer";
    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    let launcher = "xdg-open";

    let _ = std::process::Command::new(launcher)
        .arg(url)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn();
}

/// The OAuth `error` code in a token response, if any.
pub fn grant_error(grant: &Value) -> Option<&str> {
    grant.get("error").and_then(Value::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pkce_challenge_is_base64url_sha256() {
        use base64::Engine;
        use sha2::Digest;

        let (verifier, challenge) = pkce_pair();
        assert_eq!(verifier.len(), 64);
        let expected = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .encode(sha2::Sha256::digest(verifier.as_bytes()));
        assert_eq!(challenge, expected);
        assert!(!challenge.contains('='));
    }

    #[test]
    fn device_authorization_defaults_poll_interval() {
        let auth: DeviceAuthorization = serde_json::from_str(
            "{\"device_code\": \"dc\", \"user_code\": \"ABCD-EFGH\", \
             \"verification_uri\": \"https://example.com/device\"}",
        )
        .unwrap();
        assert_eq!(auth.interval, 5);
        assert_eq!(auth.expires_in, 900);
    }
}

use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Tokens are considered expired this long before their real expiry.
pub const EXPIRY_SKEW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiKeyCredential {
    pub id: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OAuthCredential {
    pub account_id: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<SystemTime>,
    pub scopes: Vec<String>,
    pub email: Option<String>,
    /// File this credential persists to on refresh.
    pub token_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Credential {
    ApiKey(ApiKeyCredential),
    OAuth(OAuthCredential),
}

impl Credential {
    pub fn id(&self) -> &str {
        match self {
            Credential::ApiKey(key) => &key.id,
            Credential::OAuth(token) => &token.account_id,
        }
    }

    /// The secret attached as the bearer token on upstream calls.
    pub fn bearer(&self) -> &str {
        match self {
            Credential::ApiKey(key) => &key.value,
            Credential::OAuth(token) => &token.access_token,
        }
    }

    /// Expired (with skew already folded into `expires_at`) at `now`?
    pub fn is_expired(&self, now: SystemTime) -> bool {
        match self {
            Credential::ApiKey(_) => false,
            Credential::OAuth(token) => token
                .expires_at
                .is_some_and(|expires_at| expires_at <= now),
        }
    }
}

/// On-disk token file: `<provider>-oauth-<seq>.json` in the auth directory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenFile {
    pub access_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,
    /// Unix seconds the token was issued.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issued_at: Option<i64>,
    /// Unix seconds; recomputed from `issued_at + expires_in` when possible.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TokenFile {
    /// Effective expiry: `issued_at + expires_in - skew`, falling back to the
    /// stored `expires_at` (skewed) when the issue time is absent.
    pub fn effective_expiry(&self) -> Option<SystemTime> {
        let absolute = match (self.issued_at, self.expires_in) {
            (Some(issued_at), Some(expires_in)) => issued_at.checked_add(expires_in as i64)?,
            _ => self.expires_at?,
        };
        if absolute <= 0 {
            return Some(UNIX_EPOCH);
        }
        let at = UNIX_EPOCH + Duration::from_secs(absolute as u64);
        Some(at.checked_sub(EXPIRY_SKEW).unwrap_or(UNIX_EPOCH))
    }

    pub fn into_credential(self, account_id: String, token_path: Option<PathBuf>) -> OAuthCredential {
        let expires_at = self.effective_expiry();
        OAuthCredential {
            account_id,
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at,
            scopes: Vec::new(),
            email: self.email,
            token_path,
        }
    }

    /// Build the file to persist after a refresh, stamping `issued_at` and
    /// the normalized `expires_at`.
    pub fn from_grant(grant: &Value, now: SystemTime) -> Option<TokenFile> {
        let access_token = grant.get("access_token")?.as_str()?.to_string();
        let issued_at = now.duration_since(UNIX_EPOCH).ok()?.as_secs() as i64;
        let expires_in = grant.get("expires_in").and_then(Value::as_u64);
        Some(TokenFile {
            access_token,
            refresh_token: grant
                .get("refresh_token")
                .and_then(Value::as_str)
                .map(|token| token.to_string()),
            token_type: grant
                .get("token_type")
                .and_then(Value::as_str)
                .map(|kind| kind.to_string()),
            expires_in,
            issued_at: Some(issued_at),
            expires_at: expires_in.map(|expires_in| issued_at + expires_in as i64),
            email: grant
                .get("email")
                .and_then(Value::as_str)
                .map(|email| email.to_string())
                .or_else(|| id_token_email(grant)),
            project_id: grant
                .get("project_id")
                .and_then(Value::as_str)
                .map(|id| id.to_string()),
            extra: Map::new(),
        })
    }
}

/// Best-effort email out of an unverified `id_token` payload.
fn id_token_email(grant: &Value) -> Option<String> {
    use base64::Engine;

    let id_token = grant.get("id_token")?.as_str()?;
    let payload = id_token.split('.').nth(1)?;
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload)
        .ok()?;
    let claims: Value = serde_json::from_slice(&bytes).ok()?;
    claims
        .get("email")
        .and_then(Value::as_str)
        .map(|email| email.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn expiry_is_issued_plus_lifetime_minus_skew() {
        let file = TokenFile {
            access_token: "t".to_string(),
            issued_at: Some(1_000_000),
            expires_in: Some(3600),
            ..Default::default()
        };
        let expiry = file.effective_expiry().unwrap();
        let expected = UNIX_EPOCH + Duration::from_secs(1_000_000 + 3600 - 60);
        assert_eq!(expiry, expected);
    }

    #[test]
    fn stored_expires_at_is_the_fallback() {
        let file = TokenFile {
            access_token: "t".to_string(),
            expires_at: Some(2_000_000),
            ..Default::default()
        };
        let expiry = file.effective_expiry().unwrap();
        assert_eq!(expiry, UNIX_EPOCH + Duration::from_secs(2_000_000 - 60));
    }

    #[test]
    fn grant_stamps_issue_time_and_expiry() {
        let now = UNIX_EPOCH + Duration::from_secs(5_000);
        let file = TokenFile::from_grant(
            &json!({"access_token": "at", "refresh_token": "rt", "expires_in": 600}),
            now,
        )
        .unwrap();
        assert_eq!(file.issued_at, Some(5_000));
        assert_eq!(file.expires_at, Some(5_600));
        assert_eq!(file.refresh_token.as_deref(), Some("rt"));
    }

    #[test]
    fn id_token_email_is_decoded_without_verification() {
        use base64::Engine;
        let payload = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .encode(b"{\"email\":\"dev@example.com\"}");
        let grant = json!({
            "access_token": "at",
            "id_token": format!("h.{payload}.s"),
        });
        let file = TokenFile::from_grant(&grant, SystemTime::now()).unwrap();
        assert_eq!(file.email.as_deref(), Some("dev@example.com"));
    }

    #[test]
    fn api_keys_never_expire() {
        let credential = Credential::ApiKey(ApiKeyCredential {
            id: "key1".to_string(),
            value: "sk-test".to_string(),
        });
        assert!(!credential.is_expired(SystemTime::now()));
        assert_eq!(credential.bearer(), "sk-test");
    }
}

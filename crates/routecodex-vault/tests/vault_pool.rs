use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use routecodex_common::GatewayError;
use routecodex_vault::{
    AccountHealth, CredentialVault, OAuthHttp, OAuthProviderConfig, TokenFile, VaultStore,
};

struct CountingTokenEndpoint {
    calls: AtomicUsize,
    delay: Duration,
}

impl CountingTokenEndpoint {
    fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            delay,
        })
    }
}

#[async_trait]
impl OAuthHttp for CountingTokenEndpoint {
    async fn post_form(&self, _url: &str, _form: &[(String, String)]) -> Result<Value, GatewayError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(json!({
            "access_token": "fresh-token",
            "refresh_token": "next-refresh",
            "expires_in": 3600,
            "token_type": "Bearer",
        }))
    }
}

fn expired_token_file() -> TokenFile {
    TokenFile {
        access_token: "stale".to_string(),
        refresh_token: Some("refresh-1".to_string()),
        expires_in: Some(60),
        issued_at: Some(1_000),
        expires_at: Some(1_060),
        ..Default::default()
    }
}

fn vault_with_expired_oauth(
    dir: &std::path::Path,
    endpoint: Arc<CountingTokenEndpoint>,
) -> CredentialVault {
    let store = VaultStore::new(dir);
    let path = store.token_path("qwen", 1);
    store.persist(&path, &expired_token_file()).unwrap();

    CredentialVault::builder(store, endpoint)
        .oauth_config(
            "qwen",
            OAuthProviderConfig {
                device_code_url: "https://auth.example/device".to_string(),
                token_url: "https://auth.example/token".to_string(),
                client_id: "client-1".to_string(),
                ..Default::default()
            },
        )
        .load_provider_accounts("qwen")
        .unwrap()
        .build()
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_refreshes_share_one_token_call() {
    let tmp = tempfile::tempdir().unwrap();
    let endpoint = CountingTokenEndpoint::new(Duration::from_millis(50));
    let vault = Arc::new(vault_with_expired_oauth(tmp.path(), endpoint.clone()));

    let first = {
        let vault = vault.clone();
        tokio::spawn(async move { vault.acquire("qwen").await })
    };
    let second = {
        let vault = vault.clone();
        tokio::spawn(async move { vault.acquire("qwen").await })
    };

    let (_, cred_a) = first.await.unwrap().unwrap();
    let (_, cred_b) = second.await.unwrap().unwrap();
    assert_eq!(cred_a.bearer(), "fresh-token");
    assert_eq!(cred_b.bearer(), "fresh-token");
    assert_eq!(endpoint.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn refresh_before_expiry_returns_cached_token() {
    let tmp = tempfile::tempdir().unwrap();
    let endpoint = CountingTokenEndpoint::new(Duration::ZERO);
    let vault = vault_with_expired_oauth(tmp.path(), endpoint.clone());

    let (account, _) = vault.acquire("qwen").await.unwrap();
    assert_eq!(endpoint.calls.load(Ordering::SeqCst), 1);

    // The refreshed token is valid for an hour; ensure_fresh must not call
    // the token endpoint again.
    let credential = vault.ensure_fresh(&account).await.unwrap();
    assert_eq!(credential.bearer(), "fresh-token");
    assert_eq!(endpoint.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn refreshed_token_is_persisted_to_disk() {
    let tmp = tempfile::tempdir().unwrap();
    let endpoint = CountingTokenEndpoint::new(Duration::ZERO);
    let vault = vault_with_expired_oauth(tmp.path(), endpoint);

    vault.acquire("qwen").await.unwrap();

    let store = VaultStore::new(tmp.path());
    let accounts = store.load_provider("qwen").unwrap();
    assert_eq!(accounts[0].token.access_token, "fresh-token");
    assert_eq!(accounts[0].token.refresh_token.as_deref(), Some("next-refresh"));
    assert!(accounts[0].token.issued_at.is_some());
}

#[tokio::test]
async fn three_failures_quarantine_then_recover() {
    let tmp = tempfile::tempdir().unwrap();
    let endpoint = CountingTokenEndpoint::new(Duration::ZERO);
    let store = VaultStore::new(tmp.path());
    let vault = CredentialVault::builder(store, endpoint)
        .quarantine_ttl(Duration::from_millis(50))
        .api_key("glm", "key-a", "sk-a")
        .api_key("glm", "key-b", "sk-b")
        .build();

    let (account_a, _) = vault.acquire("glm").await.unwrap();
    for _ in 0..3 {
        vault.mark_failure(&account_a, "rate_limit").await;
    }
    assert_eq!(account_a.health().await, AccountHealth::Quarantined);

    // Selection skips the quarantined account for the window.
    for _ in 0..4 {
        let (account, _) = vault.acquire("glm").await.unwrap();
        assert_ne!(account.id, account_a.id);
    }

    tokio::time::sleep(Duration::from_millis(80)).await;
    let mut seen_a = false;
    for _ in 0..4 {
        let (account, _) = vault.acquire("glm").await.unwrap();
        seen_a |= account.id == account_a.id;
    }
    assert!(seen_a, "quarantine window should expire");
}

#[tokio::test]
async fn round_robin_rotates_between_accounts() {
    let tmp = tempfile::tempdir().unwrap();
    let endpoint = CountingTokenEndpoint::new(Duration::ZERO);
    let vault = CredentialVault::builder(VaultStore::new(tmp.path()), endpoint)
        .api_key("glm", "key-a", "sk-a")
        .api_key("glm", "key-b", "sk-b")
        .build();

    let (first, _) = vault.acquire("glm").await.unwrap();
    let (second, _) = vault.acquire("glm").await.unwrap();
    let (third, _) = vault.acquire("glm").await.unwrap();
    assert_ne!(first.id, second.id);
    assert_eq!(first.id, third.id);
}

#[tokio::test]
async fn unknown_provider_is_an_auth_error() {
    let tmp = tempfile::tempdir().unwrap();
    let endpoint = CountingTokenEndpoint::new(Duration::ZERO);
    let vault = CredentialVault::builder(VaultStore::new(tmp.path()), endpoint).build();

    let Err(err) = vault.acquire("nowhere").await else {
        panic!("expected auth error");
    };
    assert!(matches!(err, GatewayError::Auth(_)));
}

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime};

use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{info, warn};

use routecodex_common::GatewayError;

use crate::credential::{ApiKeyCredential, Credential, TokenFile};
use crate::oauth::{
    DEVICE_GRANT_TYPE, DeviceAuthorization, OAuthHttp, OAuthProviderConfig, grant_error,
    open_browser, pkce_pair,
};
use crate::store::{LoadedAccount, VaultStore};

pub const DEFAULT_QUARANTINE_TTL: Duration = Duration::from_secs(30);
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountHealth {
    Active,
    Refreshing,
    Quarantined,
}

#[derive(Debug)]
struct AccountState {
    health: AccountHealth,
    consecutive_failures: u32,
    quarantined_until: Option<Instant>,
}

/// One upstream account: the mutable token slice plus quarantine counters.
pub struct Account {
    pub id: String,
    pub provider: String,
    credential: RwLock<Credential>,
    state: Mutex<AccountState>,
    /// Single-flight gate: concurrent refreshers queue here and re-check
    /// expiry once they hold it.
    refresh_gate: Mutex<()>,
}

impl Account {
    fn new(provider: &str, credential: Credential) -> Arc<Self> {
        Arc::new(Self {
            id: credential.id().to_string(),
            provider: provider.to_string(),
            credential: RwLock::new(credential),
            state: Mutex::new(AccountState {
                health: AccountHealth::Active,
                consecutive_failures: 0,
                quarantined_until: None,
            }),
            refresh_gate: Mutex::new(()),
        })
    }

    pub async fn credential(&self) -> Credential {
        self.credential.read().await.clone()
    }

    pub async fn health(&self) -> AccountHealth {
        self.state.lock().await.health
    }
}

struct ProviderAccounts {
    accounts: Vec<Arc<Account>>,
    cursor: AtomicUsize,
}

pub struct VaultBuilder {
    store: VaultStore,
    http: Arc<dyn OAuthHttp>,
    providers: HashMap<String, Vec<Arc<Account>>>,
    oauth: HashMap<String, OAuthProviderConfig>,
    quarantine_ttl: Duration,
    failure_threshold: u32,
    interactive: bool,
}

impl VaultBuilder {
    pub fn new(store: VaultStore, http: Arc<dyn OAuthHttp>) -> Self {
        Self {
            store,
            http,
            providers: HashMap::new(),
            oauth: HashMap::new(),
            quarantine_ttl: DEFAULT_QUARANTINE_TTL,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            interactive: false,
        }
    }

    pub fn quarantine_ttl(mut self, ttl: Duration) -> Self {
        self.quarantine_ttl = ttl;
        self
    }

    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    /// Allow device-flow fallback when a refresh token goes invalid.
    pub fn interactive(mut self, interactive: bool) -> Self {
        self.interactive = interactive;
        self
    }

    pub fn api_key(mut self, provider: &str, id: &str, value: &str) -> Self {
        let credential = Credential::ApiKey(ApiKeyCredential {
            id: id.to_string(),
            value: value.to_string(),
        });
        self.providers
            .entry(provider.to_string())
            .or_default()
            .push(Account::new(provider, credential));
        self
    }

    pub fn oauth_account(mut self, provider: &str, loaded: LoadedAccount) -> Self {
        let credential = Credential::OAuth(
            loaded
                .token
                .into_credential(loaded.account_id, Some(loaded.path)),
        );
        self.providers
            .entry(provider.to_string())
            .or_default()
            .push(Account::new(provider, credential));
        self
    }

    pub fn oauth_config(mut self, provider: &str, config: OAuthProviderConfig) -> Self {
        self.oauth.insert(provider.to_string(), config);
        self
    }

    /// Scan the auth directory for a provider's token files.
    pub fn load_provider_accounts(self, provider: &str) -> std::io::Result<Self> {
        let loaded = self.store.load_provider(provider)?;
        let mut builder = self;
        for account in loaded {
            builder = builder.oauth_account(provider, account);
        }
        Ok(builder)
    }

    pub fn build(self) -> CredentialVault {
        CredentialVault {
            providers: self
                .providers
                .into_iter()
                .map(|(provider, accounts)| {
                    (
                        provider,
                        ProviderAccounts {
                            accounts,
                            cursor: AtomicUsize::new(0),
                        },
                    )
                })
                .collect(),
            oauth: self.oauth,
            store: self.store,
            http: self.http,
            quarantine_ttl: self.quarantine_ttl,
            failure_threshold: self.failure_threshold,
            interactive: self.interactive,
        }
    }
}

pub struct CredentialVault {
    providers: HashMap<String, ProviderAccounts>,
    oauth: HashMap<String, OAuthProviderConfig>,
    store: VaultStore,
    http: Arc<dyn OAuthHttp>,
    quarantine_ttl: Duration,
    failure_threshold: u32,
    interactive: bool,
}

impl CredentialVault {
    pub fn builder(store: VaultStore, http: Arc<dyn OAuthHttp>) -> VaultBuilder {
        VaultBuilder::new(store, http)
    }

    pub fn has_provider(&self, provider: &str) -> bool {
        self.providers.contains_key(provider)
    }

    /// Select an enabled, non-quarantined account round-robin and hand back a
    /// fresh credential (refreshing first when the token is past its skewed
    /// expiry).
    pub async fn acquire(
        &self,
        provider: &str,
    ) -> Result<(Arc<Account>, Credential), GatewayError> {
        let pool = self.providers.get(provider).ok_or_else(|| {
            GatewayError::Auth(format!("no credentials configured for provider {provider}"))
        })?;

        let len = pool.accounts.len();
        let start = pool.cursor.fetch_add(1, Ordering::Relaxed);
        for offset in 0..len {
            let account = &pool.accounts[(start + offset) % len];
            if !self.selectable(account).await {
                continue;
            }
            let credential = self.ensure_fresh(account).await?;
            return Ok((account.clone(), credential));
        }

        Err(GatewayError::Auth(format!(
            "all credentials for provider {provider} are quarantined"
        )))
    }

    async fn selectable(&self, account: &Arc<Account>) -> bool {
        let mut state = account.state.lock().await;
        match state.health {
            AccountHealth::Active | AccountHealth::Refreshing => true,
            AccountHealth::Quarantined => {
                let expired = state
                    .quarantined_until
                    .is_none_or(|until| until <= Instant::now());
                if expired {
                    state.health = AccountHealth::Active;
                    state.quarantined_until = None;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Refresh-if-expired. Single-flight: concurrent callers queue on the
    /// account's gate, and whoever enters second finds a fresh token and
    /// returns it without another HTTP call.
    pub async fn ensure_fresh(&self, account: &Arc<Account>) -> Result<Credential, GatewayError> {
        let credential = account.credential().await;
        if !credential.is_expired(SystemTime::now()) {
            return Ok(credential);
        }
        self.refresh_locked(account, false).await
    }

    /// Forced refresh, used once per request after an upstream 401.
    pub async fn refresh(&self, account: &Arc<Account>) -> Result<Credential, GatewayError> {
        self.refresh_locked(account, true).await
    }

    async fn refresh_locked(
        &self,
        account: &Arc<Account>,
        force: bool,
    ) -> Result<Credential, GatewayError> {
        let _gate = account.refresh_gate.lock().await;

        // Double-check under the gate: a concurrent refresher may have
        // already replaced the token.
        let current = account.credential().await;
        if !force && !current.is_expired(SystemTime::now()) {
            return Ok(current);
        }

        let Credential::OAuth(oauth) = &current else {
            // API keys have nothing to refresh; a 401 on one is terminal.
            return Err(GatewayError::Auth(format!(
                "api key for {} rejected upstream",
                account.provider
            )));
        };
        let config = self.oauth.get(&account.provider).ok_or_else(|| {
            GatewayError::Auth(format!("no oauth endpoints for {}", account.provider))
        })?;
        let Some(refresh_token) = oauth.refresh_token.clone() else {
            return self.device_flow_fallback(account, config).await;
        };
        let token_path = oauth.token_path.clone();

        {
            let mut state = account.state.lock().await;
            state.health = AccountHealth::Refreshing;
        }

        // Snapshot taken, gate held, vault locks released: do the HTTP call.
        let mut form = vec![
            ("grant_type".to_string(), "refresh_token".to_string()),
            ("refresh_token".to_string(), refresh_token.clone()),
            ("client_id".to_string(), config.client_id.clone()),
        ];
        if let Some(secret) = &config.client_secret {
            form.push(("client_secret".to_string(), secret.clone()));
        }
        let grant = self.http.post_form(&config.token_url, &form).await;

        let grant = match grant {
            Ok(grant) => grant,
            Err(err) => {
                self.finish_refresh(account, AccountHealth::Active).await;
                return Err(err);
            }
        };

        if let Some(code) = grant_error(&grant) {
            warn!(
                event = "oauth_refresh_rejected",
                provider = %account.provider,
                account = %account.id,
                code = %code
            );
            if code == "invalid_grant" {
                return self.device_flow_fallback(account, config).await;
            }
            self.finish_refresh(account, AccountHealth::Active).await;
            return Err(GatewayError::Auth(format!("token refresh rejected: {code}")));
        }

        let mut token = TokenFile::from_grant(&grant, SystemTime::now()).ok_or_else(|| {
            GatewayError::Auth("token endpoint returned no access_token".to_string())
        })?;
        if token.refresh_token.is_none() {
            token.refresh_token = Some(refresh_token);
        }

        self.commit(account, token, token_path).await
    }

    async fn device_flow_fallback(
        &self,
        account: &Arc<Account>,
        config: &OAuthProviderConfig,
    ) -> Result<Credential, GatewayError> {
        if !self.interactive {
            self.finish_refresh(account, AccountHealth::Active).await;
            return Err(GatewayError::Auth(format!(
                "refresh token for {} is invalid and interactive auth is disabled",
                account.id
            )));
        }
        let token_path = match &*account.credential.read().await {
            Credential::OAuth(oauth) => oauth.token_path.clone(),
            Credential::ApiKey(_) => None,
        };
        let token = self.run_device_flow(config).await?;
        self.commit(account, token, token_path).await
    }

    /// RFC 8628 device flow with PKCE: start, open the browser, poll until
    /// approved or the device code expires.
    pub async fn run_device_flow(
        &self,
        config: &OAuthProviderConfig,
    ) -> Result<TokenFile, GatewayError> {
        let (verifier, challenge) = pkce_pair();
        let mut form = vec![
            ("client_id".to_string(), config.client_id.clone()),
            ("code_challenge".to_string(), challenge),
            ("code_challenge_method".to_string(), "S256".to_string()),
        ];
        if !config.scopes.is_empty() {
            form.push(("scope".to_string(), config.scopes.join(" ")));
        }
        let started: DeviceAuthorization = serde_json::from_value(
            self.http.post_form(&config.device_code_url, &form).await?,
        )
        .map_err(|err| GatewayError::Auth(format!("device authorization malformed: {err}")))?;

        let target = started
            .verification_uri_complete
            .clone()
            .unwrap_or_else(|| started.verification_uri.clone());
        info!(
            event = "oauth_device_flow_started",
            user_code = %started.user_code,
            verification_uri = %target
        );
        open_browser(&target);

        let deadline = Instant::now() + Duration::from_secs(started.expires_in);
        let mut interval = started.interval.max(1);
        loop {
            if Instant::now() >= deadline {
                return Err(GatewayError::Timeout("device authorization expired".to_string()));
            }
            tokio::time::sleep(Duration::from_secs(interval)).await;

            let poll = vec![
                ("grant_type".to_string(), DEVICE_GRANT_TYPE.to_string()),
                ("device_code".to_string(), started.device_code.clone()),
                ("client_id".to_string(), config.client_id.clone()),
                ("code_verifier".to_string(), verifier.clone()),
            ];
            let grant = self.http.post_form(&config.token_url, &poll).await?;
            match grant_error(&grant) {
                Some("authorization_pending") => continue,
                Some("slow_down") => {
                    interval += 5;
                    continue;
                }
                Some(code) => {
                    return Err(GatewayError::Auth(format!("device flow failed: {code}")));
                }
                None => {
                    return TokenFile::from_grant(&grant, SystemTime::now()).ok_or_else(|| {
                        GatewayError::Auth("device grant returned no access_token".to_string())
                    });
                }
            }
        }
    }

    async fn commit(
        &self,
        account: &Arc<Account>,
        token: TokenFile,
        token_path: Option<std::path::PathBuf>,
    ) -> Result<Credential, GatewayError> {
        if let Some(path) = &token_path
            && let Err(err) = self.store.persist(path, &token)
        {
            warn!(
                event = "vault_persist_failed",
                account = %account.id,
                path = %path.display(),
                error = %err
            );
        }

        let refreshed =
            Credential::OAuth(token.into_credential(account.id.clone(), token_path));
        {
            let mut guard = account.credential.write().await;
            *guard = refreshed.clone();
        }
        {
            let mut state = account.state.lock().await;
            state.health = AccountHealth::Active;
            state.consecutive_failures = 0;
            state.quarantined_until = None;
        }
        info!(
            event = "oauth_refreshed",
            provider = %account.provider,
            account = %account.id
        );
        Ok(refreshed)
    }

    async fn finish_refresh(&self, account: &Arc<Account>, health: AccountHealth) {
        let mut state = account.state.lock().await;
        state.health = health;
    }

    /// Drive the quarantine state machine on upstream failure.
    pub async fn mark_failure(&self, account: &Arc<Account>, reason: &str) {
        let mut state = account.state.lock().await;
        state.consecutive_failures += 1;
        if state.consecutive_failures >= self.failure_threshold {
            state.health = AccountHealth::Quarantined;
            state.quarantined_until = Some(Instant::now() + self.quarantine_ttl);
            warn!(
                event = "credential_quarantined",
                provider = %account.provider,
                account = %account.id,
                reason = %reason,
                ttl_secs = self.quarantine_ttl.as_secs()
            );
        }
    }

    pub async fn mark_success(&self, account: &Arc<Account>) {
        let mut state = account.state.lock().await;
        state.consecutive_failures = 0;
        if state.health == AccountHealth::Quarantined {
            state.health = AccountHealth::Active;
            state.quarantined_until = None;
        }
    }
}

//! Credential vault: API keys and OAuth accounts for upstream providers.
//!
//! Accounts live on disk (one token file per account, plus an index listing
//! disabled accounts), rotate round-robin, and carry a quarantine state
//! machine driven by the transport's failure/success marks. OAuth refresh is
//! single-flight per account and never holds a vault lock across an HTTP
//! call.

pub mod credential;
pub mod oauth;
pub mod pool;
pub mod store;

pub use credential::{ApiKeyCredential, Credential, OAuthCredential, TokenFile, EXPIRY_SKEW};
pub use oauth::{DeviceAuthorization, OAuthHttp, OAuthProviderConfig, WreqOAuthHttp};
pub use pool::{AccountHealth, CredentialVault, VaultBuilder};
pub use store::VaultStore;

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::credential::TokenFile;

/// On-disk layout: one directory per provider under the auth dir, one token
/// file per account named `<provider>-oauth-<seq>.json`, and a sibling
/// `accounts.json` index listing account status.
#[derive(Debug, Clone)]
pub struct VaultStore {
    auth_dir: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountIndex {
    #[serde(default)]
    pub disabled: Vec<String>,
    #[serde(default)]
    pub quarantined: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct LoadedAccount {
    pub seq: u64,
    pub account_id: String,
    pub path: PathBuf,
    pub token: TokenFile,
}

impl VaultStore {
    pub fn new(auth_dir: impl Into<PathBuf>) -> Self {
        Self {
            auth_dir: auth_dir.into(),
        }
    }

    pub fn provider_dir(&self, provider: &str) -> PathBuf {
        self.auth_dir.join(provider)
    }

    pub fn token_path(&self, provider: &str, seq: u64) -> PathBuf {
        self.provider_dir(provider)
            .join(format!("{provider}-oauth-{seq}.json"))
    }

    /// Load every account for a provider. Duplicate files for the same seq
    /// are pruned; the lexicographically earliest name is kept as canonical.
    pub fn load_provider(&self, provider: &str) -> io::Result<Vec<LoadedAccount>> {
        let dir = self.provider_dir(provider);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let prefix = format!("{provider}-oauth-");
        let mut by_seq: BTreeMap<u64, Vec<PathBuf>> = BTreeMap::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(seq) = parse_seq(name, &prefix) else {
                continue;
            };
            by_seq.entry(seq).or_default().push(entry.path());
        }

        let index = self.load_index(provider);
        let mut accounts = Vec::new();
        for (seq, mut paths) in by_seq {
            paths.sort();
            let canonical = paths.remove(0);
            for duplicate in paths {
                debug!(
                    event = "vault_duplicate_pruned",
                    provider = %provider,
                    path = %duplicate.display()
                );
                let _ = std::fs::remove_file(&duplicate);
            }

            let account_id = format!("{provider}-oauth-{seq}");
            if index.disabled.iter().any(|id| id == &account_id) {
                continue;
            }
            match read_token_file(&canonical) {
                Ok(token) => accounts.push(LoadedAccount {
                    seq,
                    account_id,
                    path: canonical,
                    token,
                }),
                Err(err) => {
                    warn!(
                        event = "vault_token_unreadable",
                        provider = %provider,
                        path = %canonical.display(),
                        error = %err
                    );
                }
            }
        }
        Ok(accounts)
    }

    pub fn persist(&self, path: &Path, token: &TokenFile) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let body = serde_json::to_vec_pretty(token)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        // Write-then-rename so a crash mid-write never truncates a live token.
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, body)?;
        std::fs::rename(&tmp, path)
    }

    pub fn load_index(&self, provider: &str) -> AccountIndex {
        let path = self.provider_dir(provider).join("accounts.json");
        std::fs::read(&path)
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .unwrap_or_default()
    }
}

fn parse_seq(name: &str, prefix: &str) -> Option<u64> {
    let stem = name.strip_prefix(prefix)?.strip_suffix(".json")?;
    let digits: String = stem.chars().take_while(|ch| ch.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}

fn read_token_file(path: &Path) -> io::Result<TokenFile> {
    let bytes = std::fs::read(path)?;
    serde_json::from_slice(&bytes).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_token(dir: &Path, name: &str, access_token: &str) {
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(
            dir.join(name),
            format!("{{\"access_token\": \"{access_token}\"}}"),
        )
        .unwrap();
    }

    #[test]
    fn duplicate_seq_keeps_earliest_name() {
        let tmp = tempfile::tempdir().unwrap();
        let store = VaultStore::new(tmp.path());
        let dir = store.provider_dir("qwen");
        write_token(&dir, "qwen-oauth-1.json", "first");
        write_token(&dir, "qwen-oauth-1copy.json", "second");
        write_token(&dir, "qwen-oauth-2.json", "other");

        let accounts = store.load_provider("qwen").unwrap();
        assert_eq!(accounts.len(), 2);
        assert_eq!(accounts[0].token.access_token, "first");
        assert!(!dir.join("qwen-oauth-1copy.json").exists());
        assert!(dir.join("qwen-oauth-2.json").exists());
    }

    #[test]
    fn disabled_accounts_are_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let store = VaultStore::new(tmp.path());
        let dir = store.provider_dir("iflow");
        write_token(&dir, "iflow-oauth-1.json", "a");
        write_token(&dir, "iflow-oauth-2.json", "b");
        std::fs::write(
            dir.join("accounts.json"),
            "{\"disabled\": [\"iflow-oauth-1\"]}",
        )
        .unwrap();

        let accounts = store.load_provider("iflow").unwrap();
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].account_id, "iflow-oauth-2");
    }

    #[test]
    fn persist_round_trips_through_rename() {
        let tmp = tempfile::tempdir().unwrap();
        let store = VaultStore::new(tmp.path());
        let path = store.token_path("glm", 1);
        let token = TokenFile {
            access_token: "at".to_string(),
            refresh_token: Some("rt".to_string()),
            expires_in: Some(3600),
            issued_at: Some(100),
            expires_at: Some(3700),
            ..Default::default()
        };
        store.persist(&path, &token).unwrap();

        let accounts = store.load_provider("glm").unwrap();
        assert_eq!(accounts[0].token, token);
        assert!(!path.with_extension("json.tmp").exists());
    }
}

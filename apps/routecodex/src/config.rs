//! Configuration file loading and the ENV > file merge.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::Value;

use routecodex_common::{
    GatewayError, HttpServerConfig, ServerConfig, ServerConfigPatch, UserAgentMode,
};
use routecodex_compat::CompatProfile;
use routecodex_engine::{ProviderConfig, StreamSupport};
use routecodex_router::{ClassificationConfig, RouteTargetSpec};
use routecodex_vault::OAuthProviderConfig;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub httpserver: HttpServerConfig,
    #[serde(default)]
    pub virtualrouter: VirtualRouterSection,
    #[serde(default, rename = "keyVault")]
    pub key_vault: HashMap<String, HashMap<String, KeyEntry>>,
    #[serde(default)]
    pub pipeline_assembler: Option<PipelineAssembler>,
    /// Directory holding per-provider OAuth token files.
    #[serde(default, rename = "authDir")]
    pub auth_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct VirtualRouterSection {
    #[serde(default)]
    pub providers: HashMap<String, ProviderEntry>,
    #[serde(default)]
    pub routing: HashMap<String, Vec<RouteTargetSpec>>,
    #[serde(default, rename = "classificationConfig")]
    pub classification: ClassificationConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderEntry {
    #[serde(rename = "type")]
    pub family: routecodex_common::ProviderFamily,
    #[serde(rename = "baseURL")]
    pub base_url: String,
    #[serde(default)]
    pub auth: Option<Value>,
    #[serde(default)]
    pub models: HashMap<String, Value>,
    #[serde(default)]
    pub headers: Option<HashMap<String, String>>,
    #[serde(default)]
    pub oauth: Option<OAuthProviderConfig>,
    #[serde(default)]
    pub streaming: StreamSupport,
    #[serde(default, rename = "xApiKey")]
    pub x_api_key: bool,
}

/// `keyVault.<providerId>.<keyId>`.
#[derive(Debug, Clone, Deserialize)]
pub struct KeyEntry {
    #[serde(rename = "type")]
    pub kind: KeyKind,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default, rename = "tokenFile")]
    pub token_file: Option<PathBuf>,
    #[serde(default, rename = "refreshToken")]
    pub refresh_token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyKind {
    Apikey,
    Oauth,
}

/// Pre-assembled per-target pipeline configuration: today that means extra
/// compatibility profiles shipped as data.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PipelineAssembler {
    #[serde(default)]
    pub config: PipelineAssemblerConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PipelineAssemblerConfig {
    #[serde(default)]
    pub pipelines: Vec<CompatProfile>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self, GatewayError> {
        let bytes = std::fs::read(path).map_err(|err| {
            GatewayError::BadRequest(format!("cannot read config {}: {err}", path.display()))
        })?;
        serde_json::from_slice(&bytes).map_err(|err| {
            GatewayError::BadRequest(format!("invalid config {}: {err}", path.display()))
        })
    }
}

/// Environment layer: `ROUTECODEX_*` and provider key fallbacks.
pub fn env_patch() -> ServerConfigPatch {
    let mut patch = ServerConfigPatch::default();
    if let Ok(port) = std::env::var("ROUTECODEX_PORT")
        && let Ok(port) = port.trim().parse::<u16>()
    {
        patch.port = Some(port);
    }
    if let Ok(mode) = std::env::var("ROUTECODEX_UA_MODE")
        && let Ok(mode) = mode.parse::<UserAgentMode>()
    {
        patch.ua_mode = Some(mode);
    }
    if let Ok(dir) = std::env::var("ROUTECODEX_ERRORSAMPLES_DIR")
        && !dir.trim().is_empty()
    {
        patch.error_samples_dir = Some(PathBuf::from(dir));
    }
    patch
}

pub fn env_config_path() -> Option<PathBuf> {
    std::env::var("ROUTECODEX_CONFIG_PATH")
        .ok()
        .filter(|value| !value.trim().is_empty())
        .map(PathBuf::from)
}

/// CLI > ENV > file > defaults.
pub fn merge_server_config(
    cli: ServerConfigPatch,
    file: &FileConfig,
) -> ServerConfig {
    let mut merged = ServerConfigPatch::from(file.httpserver.clone());
    merged.overlay(env_patch());
    merged.overlay(cli);
    merged.into_config()
}

fn provider_env(provider: &str, suffix: &str) -> Option<String> {
    let name = format!(
        "{}_{suffix}",
        provider.to_ascii_uppercase().replace('-', "_")
    );
    std::env::var(&name)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

/// The api-key fallback for a provider: `<PROVIDER>_API_KEY`, with
/// `OPENAI_API_KEY` as the final fallback.
pub fn provider_key_from_env(provider: &str) -> Option<String> {
    provider_env(provider, "API_KEY")
        .or_else(|| std::env::var("OPENAI_API_KEY").ok())
        .filter(|value| !value.trim().is_empty())
}

/// `<PROVIDER>_TOKEN_FILE`: an OAuth token file to load as an account.
pub fn provider_token_file_from_env(provider: &str) -> Option<PathBuf> {
    provider_env(provider, "TOKEN_FILE").map(PathBuf::from)
}

/// `<PROVIDER>_CLIENT_ID`: overrides the configured OAuth client id.
pub fn provider_client_id_from_env(provider: &str) -> Option<String> {
    provider_env(provider, "CLIENT_ID")
}

pub fn provider_config(id: &str, entry: &ProviderEntry) -> ProviderConfig {
    ProviderConfig {
        id: id.to_string(),
        family: entry.family,
        base_url: entry.base_url.clone(),
        headers: entry
            .headers
            .clone()
            .unwrap_or_default()
            .into_iter()
            .collect(),
        streaming: entry.streaming,
        x_api_key: entry.x_api_key,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn full_config_parses() {
        let raw = json!({
            "httpserver": {"host": "127.0.0.1", "port": 5506, "apikey": "server-key"},
            "virtualrouter": {
                "providers": {
                    "glm": {
                        "type": "openai",
                        "baseURL": "https://open.bigmodel.cn/api/paas/v4",
                        "auth": "apikey",
                        "models": {"glm-4.6": {}},
                    },
                    "qwen": {
                        "type": "openai",
                        "baseURL": "https://dashscope.aliyuncs.com/compatible-mode/v1",
                        "oauth": {
                            "deviceCodeUrl": "https://auth.example/device",
                            "tokenUrl": "https://auth.example/token",
                            "clientId": "qwen-client",
                            "scopes": ["openid"],
                        },
                    },
                },
                "routing": {
                    "default": ["glm.glm-4.6", {"target": "qwen.qwen3-coder", "weight": 2}],
                    "tool_use": ["glm.glm-4.6"],
                },
                "classificationConfig": {"longContextThreshold": 24000},
            },
            "keyVault": {
                "glm": {"key1": {"type": "apikey", "value": "sk-glm"}},
                "qwen": {"acct": {"type": "oauth", "tokenFile": "/tmp/qwen-oauth-1.json"}},
            },
        });
        let config: FileConfig = serde_json::from_value(raw).unwrap();
        assert_eq!(config.httpserver.port, Some(5506));
        assert_eq!(config.virtualrouter.providers.len(), 2);
        assert_eq!(
            config.virtualrouter.classification.long_context_threshold,
            24000
        );
        let glm_keys = &config.key_vault["glm"];
        assert_eq!(glm_keys["key1"].kind, KeyKind::Apikey);
        assert!(
            config.virtualrouter.providers["qwen"]
                .oauth
                .as_ref()
                .unwrap()
                .token_url
                .contains("token")
        );
    }

    #[test]
    fn merge_prefers_cli_over_file() {
        let file: FileConfig = serde_json::from_value(json!({
            "httpserver": {"port": 8000, "apikey": "from-file"},
        }))
        .unwrap();
        let cli = ServerConfigPatch {
            port: Some(9000),
            ..Default::default()
        };
        let merged = merge_server_config(cli, &file);
        assert_eq!(merged.port, 9000);
        assert_eq!(merged.api_key.as_deref(), Some("from-file"));
        assert_eq!(merged.host, "127.0.0.1");
    }
}

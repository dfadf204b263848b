use serde::{Deserialize, Serialize};

/// The `httpserver` section of the configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpServerConfig {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    /// Server api key; auth is disabled when unset.
    #[serde(default)]
    pub apikey: Option<String>,
}

/// Outbound `User-Agent` behavior of the provider transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserAgentMode {
    #[default]
    Normal,
    /// Present as a codex CLI client and synthesize session/conversation ids
    /// when the caller did not provide them.
    Codex,
}

impl std::str::FromStr for UserAgentMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "normal" => Ok(UserAgentMode::Normal),
            "codex" => Ok(UserAgentMode::Codex),
            other => Err(format!("unknown ua mode: {other}")),
        }
    }
}

/// Final, merged server configuration used by the running process.
///
/// Merge order: CLI > ENV > config file > defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub api_key: Option<String>,
    pub ua_mode: UserAgentMode,
    /// Root directory for snapshot/error samples; disabled when unset.
    pub error_samples_dir: Option<std::path::PathBuf>,
}

/// Optional layer used for merging the server configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerConfigPatch {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub api_key: Option<String>,
    pub ua_mode: Option<UserAgentMode>,
    pub error_samples_dir: Option<std::path::PathBuf>,
}

impl ServerConfigPatch {
    pub fn overlay(&mut self, other: ServerConfigPatch) {
        if other.host.is_some() {
            self.host = other.host;
        }
        if other.port.is_some() {
            self.port = other.port;
        }
        if other.api_key.is_some() {
            self.api_key = other.api_key;
        }
        if other.ua_mode.is_some() {
            self.ua_mode = other.ua_mode;
        }
        if other.error_samples_dir.is_some() {
            self.error_samples_dir = other.error_samples_dir;
        }
    }

    pub fn into_config(self) -> ServerConfig {
        ServerConfig {
            host: self.host.unwrap_or_else(|| "127.0.0.1".to_string()),
            port: self.port.unwrap_or(5506),
            api_key: self.api_key,
            ua_mode: self.ua_mode.unwrap_or_default(),
            error_samples_dir: self.error_samples_dir,
        }
    }
}

impl From<HttpServerConfig> for ServerConfigPatch {
    fn from(value: HttpServerConfig) -> Self {
        Self {
            host: value.host,
            port: value.port,
            api_key: value.apikey,
            ua_mode: None,
            error_samples_dir: None,
        }
    }
}

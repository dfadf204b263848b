use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use clap::Parser;
use tracing::{error, info, warn};

use routecodex_common::{EXIT_CONFIG_INVALID, EXIT_NOT_READY, ServerConfigPatch};
use routecodex_compat::ProfileRegistry;
use routecodex_engine::transport::HttpUpstreamClient;
use routecodex_engine::{Engine, EngineConfig};
use routecodex_router::{RouterConfig, VirtualRouter, parse_target_spec};
use routecodex_sink::{FsSnapshotSink, NoopSnapshotSink, SharedSnapshotSink};
use routecodex_vault::store::LoadedAccount;
use routecodex_vault::{CredentialVault, VaultStore, WreqOAuthHttp};

mod auth;
mod config;
mod server;

use config::{FileConfig, KeyKind, env_config_path, merge_server_config, provider_key_from_env};

#[derive(Debug, Parser)]
#[command(name = "routecodex", about = "Local multi-provider LLM gateway")]
struct Args {
    /// Path to the JSON configuration file.
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config_path = args.config.clone().or_else(env_config_path);
    let file = match &config_path {
        Some(path) => match FileConfig::load(path) {
            Ok(file) => file,
            Err(err) => {
                error!(event = "config_invalid", error = %err);
                std::process::exit(EXIT_CONFIG_INVALID);
            }
        },
        None => {
            warn!(event = "config_missing", "no config file; starting with defaults");
            FileConfig::default()
        }
    };

    let server_config = merge_server_config(
        ServerConfigPatch {
            host: args.host,
            port: args.port,
            ..Default::default()
        },
        &file,
    );

    // Route table.
    let mut routes = HashMap::new();
    for (route, specs) in &file.virtualrouter.routing {
        let mut targets = Vec::with_capacity(specs.len());
        for spec in specs {
            match parse_target_spec(spec) {
                Ok(target) => targets.push(target),
                Err(err) => {
                    error!(event = "config_invalid", route = %route, error = %err);
                    std::process::exit(EXIT_CONFIG_INVALID);
                }
            }
        }
        routes.insert(route.clone(), targets);
    }
    let router = Arc::new(VirtualRouter::new(RouterConfig {
        routes,
        classification: file.virtualrouter.classification.clone(),
        ..Default::default()
    }));

    // Credential vault.
    let auth_dir = file.auth_dir.clone().unwrap_or_else(default_auth_dir);
    let store = VaultStore::new(&auth_dir);
    let oauth_http = match WreqOAuthHttp::new() {
        Ok(client) => Arc::new(client),
        Err(err) => {
            error!(event = "bootstrap_failed", error = %err);
            std::process::exit(EXIT_NOT_READY);
        }
    };
    let mut vault = CredentialVault::builder(store.clone(), oauth_http);
    for (provider_id, entry) in &file.virtualrouter.providers {
        if let Some(oauth) = &entry.oauth {
            let mut oauth = oauth.clone();
            if let Some(client_id) = config::provider_client_id_from_env(provider_id) {
                oauth.client_id = client_id;
            }
            vault = vault.oauth_config(provider_id, oauth);
        }

        let mut configured = false;
        for (key_id, key) in file.key_vault.get(provider_id).into_iter().flatten() {
            match key.kind {
                KeyKind::Apikey => {
                    let value = key
                        .value
                        .clone()
                        .or_else(|| provider_key_from_env(provider_id));
                    if let Some(value) = value {
                        vault = vault.api_key(provider_id, key_id, &value);
                        configured = true;
                    } else {
                        warn!(
                            event = "credential_missing",
                            provider = %provider_id,
                            key = %key_id
                        );
                    }
                }
                KeyKind::Oauth => {
                    let Some(path) = &key.token_file else {
                        continue;
                    };
                    match std::fs::read(path)
                        .ok()
                        .and_then(|bytes| serde_json::from_slice(&bytes).ok())
                    {
                        Some(token) => {
                            vault = vault.oauth_account(
                                provider_id,
                                LoadedAccount {
                                    seq: 0,
                                    account_id: key_id.clone(),
                                    path: path.clone(),
                                    token,
                                },
                            );
                            configured = true;
                        }
                        None => warn!(
                            event = "token_file_unreadable",
                            provider = %provider_id,
                            path = %path.display()
                        ),
                    }
                }
            }
        }

        // No explicit vault entries: token-file env override, then the auth
        // dir scan, then api-key env fallbacks.
        if !configured
            && let Some(path) = config::provider_token_file_from_env(provider_id)
        {
            match std::fs::read(&path)
                .ok()
                .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            {
                Some(token) => {
                    vault = vault.oauth_account(
                        provider_id,
                        LoadedAccount {
                            seq: 0,
                            account_id: format!("{provider_id}-env"),
                            path,
                            token,
                        },
                    );
                    configured = true;
                }
                None => warn!(
                    event = "token_file_unreadable",
                    provider = %provider_id,
                    path = %path.display()
                ),
            }
        }
        if !configured {
            for account in store.load_provider(provider_id).unwrap_or_default() {
                vault = vault.oauth_account(provider_id, account);
                configured = true;
            }
        }
        if !configured
            && let Some(value) = provider_key_from_env(provider_id)
        {
            vault = vault.api_key(provider_id, "env", &value);
        }
    }

    // Compatibility profiles: builtins plus pre-assembled pipeline documents.
    let mut profiles = ProfileRegistry::with_builtins();
    if let Some(assembler) = &file.pipeline_assembler {
        for profile in &assembler.config.pipelines {
            profiles.insert(profile.clone());
        }
    }

    let providers: HashMap<_, _> = file
        .virtualrouter
        .providers
        .iter()
        .map(|(id, entry)| (id.clone(), config::provider_config(id, entry)))
        .collect();

    let sink: SharedSnapshotSink = match &server_config.error_samples_dir {
        Some(dir) => Arc::new(FsSnapshotSink::spawn(dir.clone())),
        None => Arc::new(NoopSnapshotSink),
    };

    let engine = Engine::new(
        router.clone(),
        Arc::new(vault.build()),
        Arc::new(profiles),
        providers,
        Arc::new(HttpUpstreamClient::new(None)),
        sink,
        EngineConfig {
            ua_mode: server_config.ua_mode,
            ..Default::default()
        },
    );

    let state = Arc::new(server::AppState {
        engine,
        auth: auth::ServerAuth::new(server_config.api_key.clone()),
        ready: AtomicBool::new(false),
    });
    let app = server::router(state.clone());

    let bind = format!("{}:{}", server_config.host, server_config.port);
    let listener = match tokio::net::TcpListener::bind(&bind).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(event = "bind_failed", addr = %bind, error = %err);
            std::process::exit(EXIT_NOT_READY);
        }
    };
    if !router.has_routes() {
        warn!(event = "no_routes_configured");
    }
    state.ready.store(true, Ordering::Relaxed);
    info!(event = "listening", addr = %bind);
    axum::serve(listener, app).await?;
    Ok(())
}

fn default_auth_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".routecodex")
        .join("auth")
}

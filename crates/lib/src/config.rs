//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.clawchat/config.json`) and
//! environment. The backend selection is read once when the backend value is
//! built; it is not re-evaluated mid-stream.

use crate::chat::GenOptions;
use crate::llm::{Backend, GatewayClient, LocalClient};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Which backend new sessions talk to.
    #[serde(default)]
    pub backend: BackendKind,

    /// Local inference server settings.
    #[serde(default)]
    pub local: LocalConfig,

    /// Cloud gateway settings.
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Defaults applied to newly created chats.
    #[serde(default)]
    pub chat: ChatDefaults,
}

/// The boolean-equivalent backend selector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Local,
    Gateway,
}

/// Local server base URL and default model.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalConfig {
    /// Base URL (default http://127.0.0.1:11434).
    pub base_url: Option<String>,
    /// Default model: use the exact name the server reports (e.g.
    /// "llama3.2:latest").
    pub default_model: Option<String>,
}

/// Gateway base URL, agent, and auth settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Base URL (default http://127.0.0.1:18789).
    pub base_url: Option<String>,

    /// Agent addressed via the `agent:<id>` pseudo-model and the agent-id
    /// header.
    #[serde(default = "default_agent_id")]
    pub agent_id: String,

    /// Bearer token. Overridden by CLAWCHAT_GATEWAY_TOKEN env. The
    /// Authorization header is only sent when a token is set.
    pub token: Option<String>,

    /// Optional session key forwarded in the session-key header.
    pub session_key: Option<String>,
}

fn default_agent_id() -> String {
    "main".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            agent_id: default_agent_id(),
            token: None,
            session_key: None,
        }
    }
}

/// Defaults for newly created chats.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatDefaults {
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub options: GenOptions,
}

/// Resolve the gateway token: env CLAWCHAT_GATEWAY_TOKEN overrides config.
pub fn resolve_gateway_token(config: &Config) -> Option<String> {
    std::env::var("CLAWCHAT_GATEWAY_TOKEN")
        .ok()
        .and_then(|s| {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        })
        .or_else(|| {
            config
                .gateway
                .token
                .as_ref()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        })
}

/// Build the backend client selected by config. Read once per orchestrator;
/// switching backends means building a new orchestrator.
pub fn build_backend(config: &Config) -> Backend {
    match config.backend {
        BackendKind::Local => Backend::Local(LocalClient::new(config.local.base_url.clone())),
        BackendKind::Gateway => Backend::Gateway(GatewayClient::new(
            config.gateway.base_url.clone(),
            config.gateway.agent_id.clone(),
            resolve_gateway_token(config),
            config.gateway.session_key.clone(),
        )),
    }
}

/// Model name for new chats: the configured local model, or the gateway's
/// agent pseudo-model.
pub fn default_model(config: &Config) -> String {
    match config.backend {
        BackendKind::Local => config
            .local
            .default_model
            .clone()
            .unwrap_or_else(|| "llama3.2:latest".to_string()),
        BackendKind::Gateway => format!("agent:{}", config.gateway.agent_id),
    }
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("CLAWCHAT_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .map(|h| h.join(".clawchat").join("config.json"))
                .unwrap_or_else(|| PathBuf::from("config.json"))
        })
}

/// Load config from the default path (or CLAWCHAT_CONFIG_PATH). Missing file
/// => default config. Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}

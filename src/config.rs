use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

const CONFIG_ENV: &str = "MATCHMATE_CHAT_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "~/.matchmate-chat/config.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub backend: BackendConfig,
    pub realtime: RealtimeConfig,
    pub channel: ChannelConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub base_url: String,
    pub api_token: Option<String>,
    pub timeout_seconds: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:5000/api".to_string(),
            api_token: None,
            timeout_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    pub socket_url: String,
    pub auth_token: Option<String>,
    pub reconnect: bool,
    pub reconnect_base_ms: u64,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            socket_url: "ws://localhost:5000/ws".to_string(),
            auth_token: None,
            reconnect: true,
            reconnect_base_ms: 5000,
        }
    }
}

impl RealtimeConfig {
    pub fn reconnect_base(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_ms.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub poll_interval_ms: u64,
    pub echo_timeout_ms: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5000,
            echo_timeout_ms: 15000,
        }
    }
}

impl ChannelConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn echo_timeout(&self) -> Duration {
        Duration::from_millis(self.echo_timeout_ms)
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

pub fn resolve_config_path() -> PathBuf {
    env::var(CONFIG_ENV)
        .ok()
        .map(PathBuf::from)
        .unwrap_or_else(|| expand_tilde(DEFAULT_CONFIG_PATH))
}

pub fn load_config() -> Config {
    let mut cfg = load_config_file(&resolve_config_path()).unwrap_or_default();
    apply_env_overrides(&mut cfg);
    cfg
}

/// Reads a config file. Missing or unparseable files yield `None`.
pub fn load_config_file(path: &std::path::Path) -> Option<Config> {
    if !path.exists() {
        return None;
    }
    let raw = fs::read_to_string(path).ok()?;
    match serde_json::from_str::<Config>(&raw) {
        Ok(cfg) => Some(cfg),
        Err(err) => {
            tracing::warn!("ignoring malformed config {}: {err}", path.display());
            None
        }
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

pub fn apply_env_overrides(cfg: &mut Config) {
    if let Some(url) = non_empty_env("MATCHMATE_CHAT_API_URL") {
        cfg.backend.base_url = url;
    }

    if let Some(url) = non_empty_env("MATCHMATE_CHAT_SOCKET_URL") {
        cfg.realtime.socket_url = url;
    }

    // One token authenticates both the REST calls and the socket handshake.
    if let Some(token) = non_empty_env("MATCHMATE_CHAT_TOKEN") {
        cfg.backend.api_token = Some(token.clone());
        cfg.realtime.auth_token = Some(token);
    }

    if let Some(secs) = non_empty_env("MATCHMATE_CHAT_POLL_SECONDS") {
        if let Ok(secs) = secs.trim().parse::<u64>() {
            cfg.channel.poll_interval_ms = secs.saturating_mul(1000);
        }
    }
}

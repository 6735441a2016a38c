// src/config/mod.rs
// All knobs come from the environment (or a .env file); defaults match the
// behavior of the original editor extension this daemon replaces.

use std::path::PathBuf;
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    // ── Telegram
    pub bot_token: String,
    pub allowed_chat_ids: Vec<i64>,
    pub auth_secret: String,
    pub poll_timeout_sec: u64,

    // ── Terminal sessions
    pub max_sessions: usize,
    pub command_timeout_sec: u64,

    // ── Agent bridge
    pub response_dir_name: String,
    pub response_timeout_sec: u64,
    pub agent_inject_command: String,
    pub agent_wait_for_response: bool,

    // ── Policy
    pub confine_to_workspace: bool,
}

/// Trim whitespace and strip trailing comments before parsing.
fn parse_clean<T: FromStr>(val: &str) -> Option<T> {
    val.split('#').next().unwrap_or("").trim().parse::<T>().ok()
}

fn env_var_or<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    match std::env::var(key) {
        Ok(val) => match parse_clean(&val) {
            Some(parsed) => parsed,
            None => {
                eprintln!("Config: {} = '{}' (parse failed, using default)", key, val);
                default
            }
        },
        Err(_) => default,
    }
}

/// Parse a comma-separated list of chat ids, ignoring malformed entries.
fn parse_chat_ids(raw: &str) -> Vec<i64> {
    raw.split(',')
        .filter_map(|s| s.trim().parse::<i64>().ok())
        .collect()
}

impl BridgeConfig {
    pub fn from_env() -> Self {
        if dotenvy::dotenv().is_err() {
            eprintln!("Warning: .env file not found. Using environment variables and defaults.");
        }

        let ids_raw: String = env_var_or("BRIDGE_ALLOWED_CHAT_IDS", String::new());

        Self {
            bot_token: env_var_or("BRIDGE_BOT_TOKEN", String::new()),
            allowed_chat_ids: parse_chat_ids(&ids_raw),
            auth_secret: env_var_or("BRIDGE_AUTH_SECRET", String::new()),
            poll_timeout_sec: env_var_or("BRIDGE_POLL_TIMEOUT_SEC", 30),
            max_sessions: env_var_or("BRIDGE_MAX_SESSIONS", 5),
            command_timeout_sec: env_var_or("BRIDGE_COMMAND_TIMEOUT_SEC", 600),
            response_dir_name: env_var_or("BRIDGE_RESPONSE_DIR", ".code-bridge".to_string()),
            response_timeout_sec: env_var_or("BRIDGE_RESPONSE_TIMEOUT_SEC", 300),
            agent_inject_command: env_var_or("BRIDGE_AGENT_INJECT_COMMAND", String::new()),
            agent_wait_for_response: env_var_or("BRIDGE_AGENT_WAIT_FOR_RESPONSE", true),
            confine_to_workspace: env_var_or("BRIDGE_CONFINE_TO_WORKSPACE", true),
        }
    }

    /// Absolute directory the watcher observes for response artifacts.
    pub fn response_dir(&self, workspace_root: &std::path::Path) -> PathBuf {
        workspace_root.join(&self.response_dir_name)
    }

    /// Whether the shared-secret gate is active.
    pub fn auth_required(&self) -> bool {
        !self.auth_secret.is_empty()
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            allowed_chat_ids: Vec::new(),
            auth_secret: String::new(),
            poll_timeout_sec: 30,
            max_sessions: 5,
            command_timeout_sec: 600,
            response_dir_name: ".code-bridge".to_string(),
            response_timeout_sec: 300,
            agent_inject_command: String::new(),
            agent_wait_for_response: true,
            confine_to_workspace: true,
        }
    }
}

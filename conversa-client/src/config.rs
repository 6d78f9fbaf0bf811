//! Load client config from file and environment.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

const MIN_HANDOFF_MS: u64 = 2000;
const MAX_HANDOFF_MS: u64 = 5000;

/// Client configuration. File: ~/.config/conversa/client.toml or /etc/conversa/client.toml.
/// Env overrides: CONVERSA_HOST, CONVERSA_PORT, CONVERSA_DOWNLOADS_DIR.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Server host (default 127.0.0.1).
    #[serde(default = "default_host")]
    pub host: String,
    /// Server port (default 4000).
    #[serde(default = "default_port")]
    pub port: u16,
    /// Where received files are written (default ./downloads).
    #[serde(default = "default_downloads_dir")]
    pub downloads_dir: PathBuf,
    /// Bound on taking the connection back from the push watcher.
    #[serde(default = "default_handoff_timeout_ms")]
    pub handoff_timeout_ms: u64,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    conversa_core::DEFAULT_PORT
}
fn default_downloads_dir() -> PathBuf {
    PathBuf::from("downloads")
}
fn default_handoff_timeout_ms() -> u64 {
    3000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            downloads_dir: default_downloads_dir(),
            handoff_timeout_ms: default_handoff_timeout_ms(),
        }
    }
}

impl Config {
    /// Handoff timeout, kept within 2..=5 seconds.
    pub fn handoff_timeout(&self) -> Duration {
        Duration::from_millis(
            self.handoff_timeout_ms
                .clamp(MIN_HANDOFF_MS, MAX_HANDOFF_MS),
        )
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load(explicit: Option<&Path>) -> Config {
    let c = load_file(explicit).unwrap_or_default();
    apply_env(c, |key| std::env::var(key).ok())
}

fn apply_env(mut c: Config, var: impl Fn(&str) -> Option<String>) -> Config {
    if let Some(s) = var("CONVERSA_HOST") {
        c.host = s;
    }
    if let Some(s) = var("CONVERSA_PORT") {
        match s.parse::<u16>() {
            Ok(p) => c.port = p,
            Err(_) => warn!(value = %s, "ignoring invalid CONVERSA_PORT"),
        }
    }
    if let Some(s) = var("CONVERSA_DOWNLOADS_DIR") {
        c.downloads_dir = PathBuf::from(s);
    }
    c
}

fn config_paths(explicit: Option<&Path>) -> Vec<PathBuf> {
    if let Some(p) = explicit {
        return vec![p.to_path_buf()];
    }
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/conversa/client.toml"));
    }
    out.push(PathBuf::from("/etc/conversa/client.toml"));
    out
}

fn load_file(explicit: Option<&Path>) -> Option<Config> {
    let path = config_paths(explicit).into_iter().find(|p| p.exists())?;
    let text = match std::fs::read_to_string(&path) {
        Ok(s) => s,
        Err(e) => {
            warn!(path = %path.display(), "cannot read config: {}", e);
            return None;
        }
    };
    match toml::from_str::<Config>(&text) {
        Ok(c) => Some(c),
        Err(e) => {
            warn!(path = %path.display(), "invalid config, using defaults: {}", e);
            None
        }
    }
}

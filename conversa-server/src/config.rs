//! Load server config from file and environment.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Server configuration. File: ~/.config/conversa/server.toml or /etc/conversa/server.toml.
/// Env overrides: CONVERSA_BIND, CONVERSA_PORT, CONVERSA_FILES_DIR.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Listen address (default 0.0.0.0).
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Listen port (default 4000).
    #[serde(default = "default_port")]
    pub port: u16,
    /// Directory files are served from (default: working directory).
    #[serde(default = "default_files_dir")]
    pub files_dir: PathBuf,
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    conversa_core::DEFAULT_PORT
}
fn default_files_dir() -> PathBuf {
    PathBuf::from(".")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            files_dir: default_files_dir(),
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load(explicit: Option<&Path>) -> Config {
    let c = load_file(explicit).unwrap_or_default();
    apply_env(c, |key| std::env::var(key).ok())
}

fn apply_env(mut c: Config, var: impl Fn(&str) -> Option<String>) -> Config {
    if let Some(s) = var("CONVERSA_BIND") {
        c.bind = s;
    }
    if let Some(s) = var("CONVERSA_PORT") {
        match s.parse::<u16>() {
            Ok(p) => c.port = p,
            Err(_) => warn!(value = %s, "ignoring invalid CONVERSA_PORT"),
        }
    }
    if let Some(s) = var("CONVERSA_FILES_DIR") {
        c.files_dir = PathBuf::from(s);
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
        out.push(h.join(".config/conversa/server.toml"));
    }
    out.push(PathBuf::from("/etc/conversa/server.toml"));
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

//! Load config from file and environment.

use serde::Deserialize;
use std::path::PathBuf;

use colossus_core::repository::pool::DEFAULT_POOL_CAPACITY;
use colossus_core::{BackendKind, UploadPolicy, DEFAULT_MAX_PAYLOAD};

/// Node configuration. File: ~/.config/colossus/config.toml or /etc/colossus/config.toml.
/// Env overrides: COLOSSUS_PEER_PORT, COLOSSUS_HTTP_PORT, COLOSSUS_STORAGE_ROOT,
/// COLOSSUS_POOL_CAPACITY, COLOSSUS_BACKEND.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Peer protocol TCP port (default 3001).
    #[serde(default = "default_peer_port")]
    pub peer_port: u16,
    /// Asset HTTP port (default 3000).
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// One subdirectory per repository id.
    #[serde(default = "default_storage_root")]
    pub storage_root: PathBuf,
    /// Backend for newly created repositories.
    #[serde(default)]
    pub backend: BackendKind,
    #[serde(default = "default_pool_capacity")]
    pub pool_capacity: usize,
    /// Node secret key; defaults to `<storage_root>/node.key`.
    #[serde(default)]
    pub key_file: Option<PathBuf>,
    /// Largest envelope payload accepted from peers.
    #[serde(default = "default_max_payload")]
    pub max_payload: usize,
    #[serde(default)]
    pub upload: UploadPolicy,
}

fn default_peer_port() -> u16 {
    3001
}
fn default_http_port() -> u16 {
    3000
}
fn default_storage_root() -> PathBuf {
    PathBuf::from("/var/lib/colossus/storage")
}
fn default_pool_capacity() -> usize {
    DEFAULT_POOL_CAPACITY
}
fn default_max_payload() -> usize {
    DEFAULT_MAX_PAYLOAD
}

impl Default for Config {
    fn default() -> Self {
        Self {
            peer_port: default_peer_port(),
            http_port: default_http_port(),
            storage_root: default_storage_root(),
            backend: BackendKind::default(),
            pool_capacity: default_pool_capacity(),
            key_file: None,
            max_payload: default_max_payload(),
            upload: UploadPolicy::default(),
        }
    }
}

impl Config {
    pub fn key_path(&self) -> PathBuf {
        self.key_file
            .clone()
            .unwrap_or_else(|| self.storage_root.join("node.key"))
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    apply_overrides(&mut c, |name| std::env::var(name).ok());
    c
}

/// Apply `COLOSSUS_*` overrides. Unparseable values are ignored with a warning.
fn apply_overrides(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("COLOSSUS_PEER_PORT") {
        match s.parse::<u16>() {
            Ok(p) => c.peer_port = p,
            Err(_) => tracing::warn!(value = %s, "ignoring COLOSSUS_PEER_PORT"),
        }
    }
    if let Some(s) = var("COLOSSUS_HTTP_PORT") {
        match s.parse::<u16>() {
            Ok(p) => c.http_port = p,
            Err(_) => tracing::warn!(value = %s, "ignoring COLOSSUS_HTTP_PORT"),
        }
    }
    if let Some(s) = var("COLOSSUS_STORAGE_ROOT") {
        if !s.is_empty() {
            c.storage_root = PathBuf::from(s);
        }
    }
    if let Some(s) = var("COLOSSUS_POOL_CAPACITY") {
        match s.parse::<usize>() {
            Ok(n) if n > 0 => c.pool_capacity = n,
            _ => tracing::warn!(value = %s, "ignoring COLOSSUS_POOL_CAPACITY"),
        }
    }
    if let Some(s) = var("COLOSSUS_BACKEND") {
        match s.parse::<BackendKind>() {
            Ok(kind) => c.backend = kind,
            Err(e) => tracing::warn!(error = %e, "ignoring COLOSSUS_BACKEND"),
        }
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/colossus/config.toml"));
    }
    out.push(PathBuf::from("/etc/colossus/config.toml"));
    out
}

/// First existing config file wins; a broken one is reported and ignored.
fn load_file() -> Option<Config> {
    let path = config_paths().into_iter().find(|p| p.exists())?;
    let text = match std::fs::read_to_string(&path) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "cannot read config");
            return None;
        }
    };
    match parse(&text) {
        Ok(c) => {
            tracing::info!(path = %path.display(), "loaded config");
            Some(c)
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "invalid config; using defaults");
            None
        }
    }
}

fn parse(text: &str) -> Result<Config, toml::de::Error> {
    toml::from_str::<Config>(text)
}

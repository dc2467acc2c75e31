use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use core_types::MarketRegistry;
use serde::{Deserialize, Serialize};

fn engine_config_path() -> PathBuf {
    std::env::var("PREDIWIN_CONFIG_PATH")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("configs/prediwin.toml"))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub(super) struct ServerConfig {
    pub(super) bind: String,
    pub(super) event_bus_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
            event_bus_capacity: 1024,
        }
    }
}

/// `path = None` keeps the ledger in memory.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub(super) struct StorageConfig {
    pub(super) path: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub(super) enum OracleKind {
    #[default]
    Static,
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub(super) struct OracleConfig {
    pub(super) kind: OracleKind,
    pub(super) base_url: String,
    pub(super) timeout_ms: u64,
    /// market id -> participant wallets, used by the static oracle.
    pub(super) participants: BTreeMap<String, Vec<String>>,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            kind: OracleKind::Static,
            base_url: "http://127.0.0.1:9000".to_string(),
            timeout_ms: 1_500,
            participants: BTreeMap::new(),
        }
    }
}

impl OracleConfig {
    pub(super) fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.clamp(50, 30_000))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub(super) struct MarketConfig {
    pub(super) id: String,
    pub(super) display: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub(super) struct EngineConfig {
    pub(super) server: ServerConfig,
    pub(super) storage: StorageConfig,
    pub(super) oracle: OracleConfig,
    pub(super) markets: Vec<MarketConfig>,
}

impl EngineConfig {
    /// Configured markets, or the built-in set when none are listed.
    pub(super) fn registry(&self) -> MarketRegistry {
        if self.markets.is_empty() {
            return MarketRegistry::default();
        }
        MarketRegistry::new(
            self.markets
                .iter()
                .map(|m| (m.id.as_str(), m.display.clone())),
        )
    }

    fn apply_env_overrides(&mut self) {
        if let Some(bind) = env_override("PREDIWIN_BIND") {
            self.server.bind = bind;
        }
        if let Some(path) = env_override("PREDIWIN_DB_PATH") {
            self.storage.path = Some(path);
        }
        if let Some(url) = env_override("PREDIWIN_ORACLE_URL") {
            self.oracle.kind = OracleKind::Http;
            self.oracle.base_url = url;
        }
    }
}

fn env_override(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub(super) fn parse_engine_config(raw: &str) -> Result<EngineConfig> {
    toml::from_str(raw).context("parse engine config")
}

/// A missing file falls back to defaults; a malformed one is an error.
pub(super) fn load_engine_config() -> Result<EngineConfig> {
    let path = engine_config_path();
    let mut cfg = match fs::read_to_string(&path) {
        Ok(raw) => parse_engine_config(&raw)
            .with_context(|| format!("load config {}", path.display()))?,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(path = %path.display(), "config file not found; using defaults");
            EngineConfig::default()
        }
        Err(err) => {
            return Err(err).with_context(|| format!("read config {}", path.display()));
        }
    };
    cfg.apply_env_overrides();
    Ok(cfg)
}

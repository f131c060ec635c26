// src/config.rs
//! Runtime configuration, loaded from TOML with env overrides.

use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{AtlasError, Result};

pub const ENV_CONFIG_PATH: &str = "ATLAS_CONFIG_PATH";
pub const ENV_DB_PATH: &str = "ATLAS_DB_PATH";
pub const ENV_DASHBOARD_PORT: &str = "ATLAS_DASHBOARD_PORT";
pub const DEFAULT_CONFIG_PATH: &str = "config/atlas.toml";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AtlasConfig {
    pub store: StoreConfig,
    pub dashboard: DashboardConfig,
    pub ingest: IngestConfig,
    pub score: ScoreConfig,
    pub scheduler: SchedulerConfig,
    pub paths: PathsConfig,
    pub launchd: LaunchdConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub path: PathBuf,
    pub busy_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/atlas.db"),
            busy_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DashboardConfig {
    pub bind: String,
    pub port: u16,
    pub cache_ttl_secs: u64,
    pub row_limit: usize,
    /// Seconds to wait for the port to accept connections after launch.
    pub ready_timeout_secs: u64,
    /// Seconds between SIGTERM and SIGKILL when stopping.
    pub stop_grace_secs: u64,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 8504,
            cache_ttl_secs: 60,
            row_limit: 5_000,
            ready_timeout_secs: 10,
            stop_grace_secs: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub sources_path: PathBuf,
    pub per_feed_limit: usize,
    pub timeout_secs: u64,
    pub attempts: u32,
    pub user_agent: String,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            sources_path: PathBuf::from("data/rss_sources.txt"),
            per_feed_limit: 50,
            timeout_secs: 25,
            attempts: 4,
            user_agent: "atlas/1.0 (+rss)".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScoreConfig {
    pub batch_limit: usize,
    /// Host → prior weight; merged over the built-in table.
    pub domains: HashMap<String, f32>,
}

impl Default for ScoreConfig {
    fn default() -> Self {
        Self {
            batch_limit: 200,
            domains: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { interval_secs: 900 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub logs_dir: PathBuf,
    pub run_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            logs_dir: PathBuf::from("logs"),
            run_dir: PathBuf::from("."),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LaunchdConfig {
    pub label_prefix: String,
    /// Defaults to `~/Library/LaunchAgents` when unset.
    pub agents_dir: Option<PathBuf>,
}

impl Default for LaunchdConfig {
    fn default() -> Self {
        Self {
            label_prefix: "com.atlas".to_string(),
            agents_dir: None,
        }
    }
}

impl AtlasConfig {
    /// Load from an explicit TOML file, then apply env overrides.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            AtlasError::Config(format!("reading config from {}: {e}", path.display()))
        })?;
        let mut cfg: AtlasConfig = toml::from_str(&content)
            .map_err(|e| AtlasError::Config(format!("parsing {}: {e}", path.display())))?;
        cfg.apply_env()?;
        Ok(cfg)
    }

    /// Load using env var + fallbacks:
    /// 1) $ATLAS_CONFIG_PATH
    /// 2) config/atlas.toml
    /// 3) built-in defaults
    pub fn load_default() -> Result<Self> {
        if let Ok(p) = std::env::var(ENV_CONFIG_PATH) {
            let pb = PathBuf::from(p);
            if pb.exists() {
                return Self::load_from(&pb);
            }
            return Err(AtlasError::Config(format!(
                "{ENV_CONFIG_PATH} points to non-existent path {}",
                pb.display()
            )));
        }
        let fallback = PathBuf::from(DEFAULT_CONFIG_PATH);
        if fallback.exists() {
            return Self::load_from(&fallback);
        }
        let mut cfg = Self::default();
        cfg.apply_env()?;
        Ok(cfg)
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(p) = std::env::var(ENV_DB_PATH) {
            if !p.trim().is_empty() {
                self.store.path = PathBuf::from(p.trim());
            }
        }
        if let Ok(p) = std::env::var(ENV_DASHBOARD_PORT) {
            self.dashboard.port = p.trim().parse().map_err(|_| {
                AtlasError::Config(format!("{ENV_DASHBOARD_PORT}={p:?} is not a port number"))
            })?;
        }
        Ok(())
    }

    pub fn pid_file(&self, port: u16) -> PathBuf {
        self.paths.run_dir.join(format!(".dashboard_{port}.pid"))
    }

    pub fn dashboard_log(&self, port: u16) -> PathBuf {
        self.paths.logs_dir.join(format!("dashboard_{port}.log"))
    }
}

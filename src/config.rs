//! Application configuration loaded from TOML.
//!
//! Lookup order: an explicit path, then `FIELDSYNC_CONFIG`, then
//! `config.toml` in the platform config directory, then built-in defaults.
//! `FIELDSYNC_BACKEND_URL` and `FIELDSYNC_API_KEY` override the backend
//! section after loading.

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const CONFIG_ENV: &str = "FIELDSYNC_CONFIG";
pub const BACKEND_URL_ENV: &str = "FIELDSYNC_BACKEND_URL";
pub const API_KEY_ENV: &str = "FIELDSYNC_API_KEY";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub storage: StorageConfig,
    pub cache: CacheConfig,
    pub sync: SyncConfig,
    pub backend: BackendConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// DuckDB file holding the action queue and attachment cache.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of cached attachments before eviction kicks in.
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { max_entries: 200 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Periodic drain interval while online with queued work (seconds)
    pub interval_secs: u64,
    /// Connectivity heartbeat interval (seconds)
    pub heartbeat_secs: u64,
    /// A heartbeat slower than this counts as offline (seconds)
    pub heartbeat_timeout_secs: u64,
    pub retry: RetryConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            heartbeat_secs: 30,
            heartbeat_timeout_secs: 5,
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryStrategy {
    /// Every drain retries every queued action.
    #[default]
    Flat,
    /// Failed actions wait `base * 2^(retries - 1)` seconds, capped at `max`.
    Exponential,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub strategy: RetryStrategy,
    pub base_delay_secs: u64,
    pub max_delay_secs: u64,
    /// Stop retrying after this many failed attempts. Parked actions stay
    /// queued and visible.
    pub max_attempts: Option<u32>,
    /// Spread exponential delays by up to this fraction either way (0.2 means
    /// ±20%) so devices reconnecting together do not retry in lockstep.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            strategy: RetryStrategy::Flat,
            base_delay_secs: 5,
            max_delay_secs: 300,
            max_attempts: None,
            jitter: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub url: Option<String>,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
    pub records_table: String,
    pub tasks_table: String,
    pub evidence_table: String,
    pub progress_table: String,
    pub alerts_table: String,
    pub photos_table: String,
    pub attachments_bucket: String,
    pub photos_bucket: String,
    /// Column that receives the uploaded URL when a record action carries
    /// an attachment.
    pub record_photo_field: String,
    /// Action type to server function, e.g. `"cancel-work-order" =
    /// "cancel_work_order"`. The function receives the action data as its
    /// arguments.
    pub functions: BTreeMap<String, String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: None,
            api_key: None,
            timeout_secs: 30,
            records_table: "trees".to_string(),
            tasks_table: "tasks".to_string(),
            evidence_table: "task_evidence".to_string(),
            progress_table: "task_progress_log".to_string(),
            alerts_table: "task_alerts".to_string(),
            photos_table: "tree_photos".to_string(),
            attachments_bucket: "field-photos".to_string(),
            photos_bucket: "tree-photos".to_string(),
            record_photo_field: "photo_url".to_string(),
            functions: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl AppConfig {
    /// Load configuration using the standard lookup order.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let explicit = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from));

        let mut config = match explicit {
            Some(path) => Self::from_file(&path)?,
            None => match default_config_path().filter(|p| p.exists()) {
                Some(path) => Self::from_file(&path)?,
                None => {
                    debug!("No config file found, using defaults");
                    Self::default()
                }
            },
        };

        config.apply_env_overrides();
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config = Self::from_toml(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var(BACKEND_URL_ENV) {
            self.backend.url = Some(url);
        }
        if let Ok(key) = std::env::var(API_KEY_ENV) {
            self.backend.api_key = Some(key);
        }
    }

    /// Resolved database location: the configured path, or `fieldsync.duckdb`
    /// in the platform data directory.
    pub fn database_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.storage.path {
            return Ok(path.clone());
        }
        let dirs = project_dirs().context("Could not determine a data directory")?;
        Ok(dirs.data_dir().join("fieldsync.duckdb"))
    }
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("org", "fieldsync", "fieldsync")
}

fn default_config_path() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.config_dir().join("config.toml"))
}

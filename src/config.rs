//! Configuration loader and validator for the location photo pipeline.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub places: Places,
    pub storage: Storage,
    pub migration: Migration,
    pub admin: Admin,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub bind_addr: String,
    /// Period of scheduled whole-catalog runs; 0 disables the schedule.
    #[serde(default)]
    pub schedule_interval_minutes: u64,
}

/// Place-metadata provider settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Places {
    pub api_key: String,
    pub base_url: String,
    pub photo_max_width: u32,
    pub max_photos: usize,
    pub timeout_seconds: u64,
}

/// Blob store settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Storage {
    pub root: String,
    pub public_base_url: String,
    pub cache_control: String,
}

/// Batch orchestration knobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Migration {
    pub batch_size: usize,
    pub batch_delay_ms: u64,
    pub photo_delay_ms: u64,
    pub upload_delay_ms: u64,
    /// Wall-clock budget for whole-catalog runs; 0 disables it.
    #[serde(default)]
    pub time_budget_seconds: u64,
}

/// Trigger authentication.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Admin {
    pub token: String,
}

impl Config {
    /// Ensure required directories exist (`app.data_dir` and `storage.root`).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        for dir in [&self.app.data_dir, &self.storage.root] {
            if !dir.trim().is_empty() {
                fs::create_dir_all(dir)?;
            }
        }
        Ok(())
    }

    /// SQLite URL used when `DATABASE_URL` is not set.
    pub fn default_database_url(&self) -> String {
        format!("sqlite://{}/locations.db", self.app.data_dir.trim_end_matches('/'))
    }

    pub fn schedule_interval(&self) -> Option<Duration> {
        match self.app.schedule_interval_minutes {
            0 => None,
            m => Some(Duration::from_secs(m * 60)),
        }
    }
}

impl Migration {
    pub fn time_budget(&self) -> Option<Duration> {
        match self.time_budget_seconds {
            0 => None,
            s => Some(Duration::from_secs(s)),
        }
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.bind_addr.trim().is_empty() {
        return Err(ConfigError::Invalid("app.bind_addr must be non-empty"));
    }

    if cfg.places.api_key.trim().is_empty() {
        return Err(ConfigError::Invalid("places.api_key must be non-empty"));
    }
    if reqwest::Url::parse(&cfg.places.base_url).is_err() {
        return Err(ConfigError::Invalid("places.base_url must be an absolute URL"));
    }
    if cfg.places.photo_max_width == 0 {
        return Err(ConfigError::Invalid("places.photo_max_width must be > 0"));
    }
    if !(1..=10).contains(&cfg.places.max_photos) {
        return Err(ConfigError::Invalid("places.max_photos must be between 1 and 10"));
    }
    if cfg.places.timeout_seconds == 0 {
        return Err(ConfigError::Invalid("places.timeout_seconds must be > 0"));
    }

    if cfg.storage.root.trim().is_empty() {
        return Err(ConfigError::Invalid("storage.root must be non-empty"));
    }
    if cfg.storage.public_base_url.trim().is_empty() {
        return Err(ConfigError::Invalid("storage.public_base_url must be non-empty"));
    }
    if cfg.storage.cache_control.trim().is_empty() {
        return Err(ConfigError::Invalid("storage.cache_control must be non-empty"));
    }

    if cfg.migration.batch_size == 0 {
        return Err(ConfigError::Invalid("migration.batch_size must be > 0"));
    }

    if cfg.admin.token.trim().is_empty() {
        return Err(ConfigError::Invalid("admin.token must be non-empty"));
    }

    Ok(())
}

/// Returns an example YAML document that passes validation.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  bind_addr: "127.0.0.1:8080"
  schedule_interval_minutes: 1440

places:
  api_key: "YOUR_PLACES_API_KEY"
  base_url: "https://maps.googleapis.com/"
  photo_max_width: 800
  max_photos: 10
  timeout_seconds: 20

storage:
  root: "./data/blobs"
  public_base_url: "https://cdn.example.com/blobs"
  cache_control: "public, max-age=31536000"

migration:
  batch_size: 5
  batch_delay_ms: 2000
  photo_delay_ms: 300
  upload_delay_ms: 100
  time_budget_seconds: 480

admin:
  token: "CHANGE_ME"
"#
}

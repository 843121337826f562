//! Daemon settings file (`~/.config/feedwatch/config.toml`).
//!
//! The file is optional and a missing file yields `Config::default()`.
//! Unknown keys are accepted but logged, since they are usually typos.
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::feed::FetchSettings;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config file too large: {0}")]
    TooLarge(String),
}

/// User agent sent when neither the feed nor the settings name one.
pub const DEFAULT_USER_AGENT: &str = concat!("feedwatch/", env!("CARGO_PKG_VERSION"));

/// Daemon settings. Every key is optional.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// SQLite file holding feeds and subscriptions. Defaults to
    /// `feedwatch.db` next to the settings file.
    pub database_path: Option<PathBuf>,

    pub default_user_agent: String,

    /// Fetch jobs allowed to run at once
    pub run_queue_concurrency: usize,

    pub request_timeout_secs: u64,

    pub max_feed_size_bytes: usize,

    /// Retries after the first attempt for transient fetch failures
    pub max_retries: u32,

    pub retry_base_delay_ms: u64,

    /// `EnvFilter` directives used when `RUST_LOG` is unset
    pub log_filter: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: None,
            default_user_agent: DEFAULT_USER_AGENT.to_string(),
            run_queue_concurrency: 1,
            request_timeout_secs: 30,
            max_feed_size_bytes: 10 * 1024 * 1024,
            max_retries: 3,
            retry_base_delay_ms: 1000,
            log_filter: "info".to_string(),
        }
    }
}

impl Config {
    /// Maximum settings file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    const KNOWN_KEYS: [&'static str; 8] = [
        "database_path",
        "default_user_agent",
        "run_queue_concurrency",
        "request_timeout_secs",
        "max_feed_size_bytes",
        "max_retries",
        "retry_base_delay_ms",
        "log_filter",
    ];

    /// Load settings from a TOML file.
    ///
    /// - Missing or empty file → `Ok(Config::default())`
    /// - Invalid TOML or wrong value types → `Err(ConfigError::Parse)`
    /// - Unknown keys → accepted, logged as warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        Self::parse(&content)
    }

    /// Parse settings from TOML text.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            for key in raw.keys() {
                if !Self::KNOWN_KEYS.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(content)?;
        tracing::info!(
            concurrency = config.run_queue_concurrency,
            database = ?config.database_path,
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Database location, resolved against `config_dir` when unset.
    pub fn database_path_in(&self, config_dir: &Path) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| config_dir.join("feedwatch.db"))
    }

    pub fn fetch_settings(&self) -> FetchSettings {
        FetchSettings {
            timeout: Duration::from_secs(self.request_timeout_secs),
            max_feed_size: self.max_feed_size_bytes,
            max_retries: self.max_retries,
            retry_base_delay: Duration::from_millis(self.retry_base_delay_ms),
        }
    }
}

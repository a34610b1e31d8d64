//! TOML-based configuration for Prism.
//!
//! Supports a config file (prism.toml) with environment variable expansion.
//!
//! Example configuration:
//! ```toml
//! [engine]
//! workers = 8
//! request_timeout = "30s"
//!
//! [query]
//! default_limit = 10000
//! max_limit = 50000
//!
//! [scheduler]
//! tick = "30s"
//! retry_backoff = "10s"
//! retry_jitter = "2s"
//! build_concurrency = 2
//! default_refresh = "1 hour"
//!
//! [storage]
//! rollup_schema = "prism_rollups"
//! catalog_path = "${HOME}/.prism/catalog.db"
//!
//! [logging]
//! level = "info"
//! ```

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;

/// Error type for settings.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Config file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid duration format: {0}")]
    InvalidDuration(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    pub engine: EngineSettings,
    pub query: QuerySettings,
    pub scheduler: SchedulerSettings,
    pub storage: StorageSettings,
    pub logging: LoggingSettings,
}

/// Request serving.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Worker pool size (concurrent requests).
    pub workers: usize,

    /// Per-request deadline (e.g., "30s", "2m").
    pub request_timeout: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            workers: 8,
            request_timeout: "30s".to_string(),
        }
    }
}

impl EngineSettings {
    pub fn request_timeout(&self) -> Result<Duration, SettingsError> {
        parse_duration(&self.request_timeout)
    }
}

/// Request defaults and caps.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct QuerySettings {
    /// Row limit applied when a request omits one.
    pub default_limit: u64,

    /// Upper bound on any requested limit.
    pub max_limit: u64,
}

impl Default for QuerySettings {
    fn default() -> Self {
        Self {
            default_limit: 10_000,
            max_limit: 50_000,
        }
    }
}

/// Rollup refresh scheduling.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SchedulerSettings {
    /// How often the refresh loop evaluates rollups.
    pub tick: String,

    /// Delay before the single retry of a failed build.
    pub retry_backoff: String,

    /// Upper bound of random jitter added to the retry delay.
    pub retry_jitter: String,

    /// Maximum rollup builds running at once.
    pub build_concurrency: usize,

    /// Refresh interval for rollups without `refresh_key.every`.
    pub default_refresh: String,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            tick: "30s".to_string(),
            retry_backoff: "10s".to_string(),
            retry_jitter: "2s".to_string(),
            build_concurrency: 2,
            default_refresh: "1 hour".to_string(),
        }
    }
}

impl SchedulerSettings {
    pub fn tick(&self) -> Result<Duration, SettingsError> {
        parse_duration(&self.tick)
    }

    pub fn retry_backoff(&self) -> Result<Duration, SettingsError> {
        parse_duration(&self.retry_backoff)
    }

    pub fn retry_jitter(&self) -> Result<Duration, SettingsError> {
        parse_duration(&self.retry_jitter)
    }

    pub fn default_refresh(&self) -> Result<Duration, SettingsError> {
        parse_duration(&self.default_refresh)
    }
}

/// Where rollup tables and the snapshot catalog live.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Schema for rollup tables (supports ${ENV_VAR} expansion).
    pub rollup_schema: Option<String>,

    /// SQLite catalog file; in-memory when unset.
    pub catalog_path: Option<String>,
}

impl StorageSettings {
    pub fn rollup_schema(&self) -> Result<Option<String>, SettingsError> {
        self.rollup_schema.as_deref().map(expand_env_vars).transpose()
    }

    pub fn catalog_path(&self) -> Result<Option<PathBuf>, SettingsError> {
        Ok(self
            .catalog_path
            .as_deref()
            .map(expand_env_vars)
            .transpose()?
            .map(PathBuf::from))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default tracing filter when `RUST_LOG` is unset.
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Settings {
    /// Load settings from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(SettingsError::FileNotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)?;
        let settings: Settings = toml::from_str(&content)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from the default config file locations.
    ///
    /// Searches in order:
    /// 1. Environment variable `PRISM_CONFIG`
    /// 2. `./prism.toml`
    /// 3. `~/.config/prism/config.toml`
    pub fn load() -> Result<Self, SettingsError> {
        if let Ok(path) = env::var("PRISM_CONFIG") {
            return Self::from_file(&path);
        }

        let local_config = PathBuf::from("prism.toml");
        if local_config.exists() {
            return Self::from_file(&local_config);
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("prism").join("config.toml");
            if user_config.exists() {
                return Self::from_file(&user_config);
            }
        }

        Ok(Settings::default())
    }

    /// Check cross-field constraints and that every duration parses.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.engine.workers == 0 {
            return Err(SettingsError::InvalidConfig(
                "engine.workers must be at least 1".to_string(),
            ));
        }
        if self.scheduler.build_concurrency == 0 {
            return Err(SettingsError::InvalidConfig(
                "scheduler.build_concurrency must be at least 1".to_string(),
            ));
        }
        if self.query.default_limit > self.query.max_limit {
            return Err(SettingsError::InvalidConfig(format!(
                "query.default_limit ({}) exceeds query.max_limit ({})",
                self.query.default_limit, self.query.max_limit
            )));
        }
        self.engine.request_timeout()?;
        self.scheduler.tick()?;
        self.scheduler.retry_backoff()?;
        self.scheduler.retry_jitter()?;
        self.scheduler.default_refresh()?;
        Ok(())
    }
}

static DURATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(\d+)\s*([A-Za-z]+)\s*$").unwrap());

/// Parse a human duration: `"30s"`, `"5m"`, `"1 hour"`, `"2 days"`.
pub fn parse_duration(s: &str) -> Result<Duration, SettingsError> {
    let invalid = || SettingsError::InvalidDuration(s.to_string());
    let caps = DURATION.captures(s).ok_or_else(invalid)?;
    let amount: u64 = caps[1].parse().map_err(|_| invalid())?;
    let unit_secs = match caps[2].to_lowercase().as_str() {
        "s" | "sec" | "secs" | "second" | "seconds" => 1,
        "m" | "min" | "mins" | "minute" | "minutes" => 60,
        "h" | "hr" | "hrs" | "hour" | "hours" => 3_600,
        "d" | "day" | "days" => 86_400,
        "w" | "week" | "weeks" => 604_800,
        _ => return Err(invalid()),
    };
    amount
        .checked_mul(unit_secs)
        .map(Duration::from_secs)
        .ok_or_else(invalid)
}

/// Expand environment variables in a string.
///
/// Supports `${VAR}` and `$VAR` syntax.
pub fn expand_env_vars(s: &str) -> Result<String, SettingsError> {
    let mut result = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '$' {
            result.push(c);
            continue;
        }

        let mut var_name = String::new();
        if chars.peek() == Some(&'{') {
            chars.next();
            for ch in chars.by_ref() {
                if ch == '}' {
                    break;
                }
                var_name.push(ch);
            }
        } else {
            while let Some(&ch) = chars.peek() {
                if !(ch.is_alphanumeric() || ch == '_') {
                    break;
                }
                var_name.push(ch);
                chars.next();
            }
            if var_name.is_empty() {
                // Just a lone $, keep it
                result.push('$');
                continue;
            }
        }

        let value =
            env::var(&var_name).map_err(|_| SettingsError::MissingEnvVar(var_name.clone()))?;
        result.push_str(&value);
    }

    Ok(result)
}

//! Configuration loading for the route optimization worker.
//!
//! Loads layered `.env` files and environment variables prefixed with
//! `ROUTE_JOBS_`, producing a typed [`AppConfig`].

use std::{collections::BTreeMap, env, path::PathBuf, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Prefix shared by every recognised environment variable.
pub const ENV_PREFIX: &str = "ROUTE_JOBS_";

/// Application configuration derived from `ROUTE_JOBS_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct AppConfig {
    #[serde(default = "default_profile")]
    pub profile: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,
    #[serde(default = "default_db_acquire_timeout_ms")]
    pub db_acquire_timeout_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optimizer_base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optimizer_api_key: Option<String>,
    #[serde(default)]
    pub worker: WorkerConfig,
}

/// Worker-specific configuration parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct WorkerConfig {
    #[serde(default = "default_worker_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_worker_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,
    #[serde(default = "default_worker_time_budget_seconds")]
    pub time_budget_seconds: u64,
    #[serde(default = "default_worker_straggler_grace_seconds")]
    pub straggler_grace_seconds: u64,
    #[serde(default = "default_worker_shutdown_drain_seconds")]
    pub shutdown_drain_seconds: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            profile: default_profile(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            database_url: default_database_url(),
            db_max_connections: default_db_max_connections(),
            db_acquire_timeout_ms: default_db_acquire_timeout_ms(),
            optimizer_base_url: None,
            optimizer_api_key: None,
            worker: WorkerConfig::default(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_worker_poll_interval_ms(),
            max_concurrent_jobs: default_worker_max_concurrent_jobs(),
            time_budget_seconds: default_worker_time_budget_seconds(),
            straggler_grace_seconds: default_worker_straggler_grace_seconds(),
            shutdown_drain_seconds: default_worker_shutdown_drain_seconds(),
        }
    }
}

impl AppConfig {
    /// Returns a redacted JSON representation (secrets are redacted).
    pub fn redacted_json(&self) -> serde_json::Result<String> {
        let mut config = self.clone();
        if config.optimizer_api_key.is_some() {
            config.optimizer_api_key = Some("[REDACTED]".to_string());
        }
        serde_json::to_string_pretty(&config)
    }

    /// Base URL of the optimizer, required by the `run` command.
    pub fn require_optimizer_base_url(&self) -> Result<&str, ConfigError> {
        self.optimizer_base_url
            .as_deref()
            .ok_or(ConfigError::MissingOptimizerBaseUrl)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !matches!(self.log_format.as_str(), "json" | "pretty") {
            return Err(ConfigError::InvalidLogFormat {
                value: self.log_format.clone(),
            });
        }

        if self.db_max_connections == 0 {
            return Err(ConfigError::InvalidDbMaxConnections {
                value: self.db_max_connections,
            });
        }

        if let Some(ref base_url) = self.optimizer_base_url {
            Url::parse(base_url).map_err(|source| ConfigError::InvalidOptimizerBaseUrl {
                value: base_url.clone(),
                source,
            })?;
        }

        self.worker.validate()
    }
}

impl WorkerConfig {
    /// Validate worker configuration bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(100..=60_000).contains(&self.poll_interval_ms) {
            return Err(ConfigError::InvalidWorkerPollInterval {
                value: self.poll_interval_ms,
            });
        }

        if !(1..=64).contains(&self.max_concurrent_jobs) {
            return Err(ConfigError::InvalidWorkerConcurrency {
                value: self.max_concurrent_jobs,
            });
        }

        if !(1..=86_400).contains(&self.time_budget_seconds) {
            return Err(ConfigError::InvalidWorkerTimeBudget {
                value: self.time_budget_seconds,
            });
        }

        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn time_budget(&self) -> Duration {
        Duration::from_secs(self.time_budget_seconds)
    }

    pub fn straggler_grace(&self) -> Duration {
        Duration::from_secs(self.straggler_grace_seconds)
    }

    pub fn shutdown_drain(&self) -> Duration {
        Duration::from_secs(self.shutdown_drain_seconds)
    }
}

fn default_profile() -> String {
    "local".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_database_url() -> String {
    "sqlite://route_jobs.db?mode=rwc".to_string()
}

fn default_db_max_connections() -> u32 {
    10
}

fn default_db_acquire_timeout_ms() -> u64 {
    5000
}

fn default_worker_poll_interval_ms() -> u64 {
    2000
}

fn default_worker_max_concurrent_jobs() -> usize {
    2
}

fn default_worker_time_budget_seconds() -> u64 {
    600
}

fn default_worker_straggler_grace_seconds() -> u64 {
    5
}

fn default_worker_shutdown_drain_seconds() -> u64 {
    30
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load environment file {path}: {source}")]
    EnvFile {
        path: PathBuf,
        source: dotenvy::Error,
    },
    #[error("ROUTE_JOBS_{key} must be a number, got '{value}'")]
    InvalidNumber { key: &'static str, value: String },
    #[error("log format must be 'json' or 'pretty', got '{value}'")]
    InvalidLogFormat { value: String },
    #[error("database max connections must be positive, got {value}")]
    InvalidDbMaxConnections { value: u32 },
    #[error("invalid optimizer base url '{value}': {source}")]
    InvalidOptimizerBaseUrl {
        value: String,
        source: url::ParseError,
    },
    #[error("optimizer base url is missing; set ROUTE_JOBS_OPTIMIZER_BASE_URL")]
    MissingOptimizerBaseUrl,
    #[error("worker poll interval must be between 100 and 60000 milliseconds, got {value}")]
    InvalidWorkerPollInterval { value: u64 },
    #[error("worker max concurrent jobs must be between 1 and 64, got {value}")]
    InvalidWorkerConcurrency { value: usize },
    #[error("worker time budget must be between 1 and 86400 seconds, got {value}")]
    InvalidWorkerTimeBudget { value: u64 },
}

/// Loads configuration using layered `.env` files and `ROUTE_JOBS_*` env vars.
pub struct ConfigLoader {
    base_dir: PathBuf,
}

impl ConfigLoader {
    /// Creates a new loader rooted at the current working directory.
    pub fn new() -> Self {
        Self {
            base_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    /// Creates a loader rooted at the provided directory (useful for tests).
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Loads and validates configuration.
    ///
    /// Precedence, lowest first: `.env`, `.env.local`, `.env.{profile}`,
    /// `.env.{profile}.local`, process environment.
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let (mut layered, profile_hint) = self.collect_layered_env()?;

        // Overlay process environment last so it wins.
        for (key, value) in env::vars() {
            if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                layered.insert(stripped.to_string(), value);
            }
        }

        let profile = layered
            .remove("PROFILE")
            .filter(|v| !v.is_empty())
            .unwrap_or(profile_hint);
        let log_level = layered
            .remove("LOG_LEVEL")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_log_level);
        let log_format = layered
            .remove("LOG_FORMAT")
            .filter(|v| !v.is_empty())
            .map(|v| v.to_ascii_lowercase())
            .unwrap_or_else(default_log_format);
        let database_url = layered
            .remove("DATABASE_URL")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_database_url);
        let db_max_connections = parse_number(&mut layered, "DB_MAX_CONNECTIONS")?
            .unwrap_or_else(default_db_max_connections);
        let db_acquire_timeout_ms = parse_number(&mut layered, "DB_ACQUIRE_TIMEOUT_MS")?
            .unwrap_or_else(default_db_acquire_timeout_ms);
        let optimizer_base_url = non_blank(layered.remove("OPTIMIZER_BASE_URL"));
        let optimizer_api_key = non_blank(layered.remove("OPTIMIZER_API_KEY"));

        let worker = WorkerConfig {
            poll_interval_ms: parse_number(&mut layered, "WORKER_POLL_INTERVAL_MS")?
                .unwrap_or_else(default_worker_poll_interval_ms),
            max_concurrent_jobs: parse_number(&mut layered, "WORKER_MAX_CONCURRENT_JOBS")?
                .unwrap_or_else(default_worker_max_concurrent_jobs),
            time_budget_seconds: parse_number(&mut layered, "WORKER_TIME_BUDGET_SECONDS")?
                .unwrap_or_else(default_worker_time_budget_seconds),
            straggler_grace_seconds: parse_number(&mut layered, "WORKER_STRAGGLER_GRACE_SECONDS")?
                .unwrap_or_else(default_worker_straggler_grace_seconds),
            shutdown_drain_seconds: parse_number(&mut layered, "WORKER_SHUTDOWN_DRAIN_SECONDS")?
                .unwrap_or_else(default_worker_shutdown_drain_seconds),
        };

        let config = AppConfig {
            profile,
            log_level,
            log_format,
            database_url,
            db_max_connections,
            db_acquire_timeout_ms,
            optimizer_base_url,
            optimizer_api_key,
            worker,
        };

        config.validate()?;
        Ok(config)
    }

    fn collect_layered_env(&self) -> Result<(BTreeMap<String, String>, String), ConfigError> {
        let mut values = BTreeMap::new();

        self.merge_dotenv(self.base_dir.join(".env"), &mut values)?;
        self.merge_dotenv(self.base_dir.join(".env.local"), &mut values)?;

        let profile = env::var(format!("{ENV_PREFIX}PROFILE"))
            .ok()
            .filter(|v| !v.is_empty())
            .or_else(|| values.get("PROFILE").cloned())
            .unwrap_or_else(default_profile);

        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}", &profile)),
            &mut values,
        )?;
        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}.local", &profile)),
            &mut values,
        )?;

        Ok((values, profile))
    }

    fn merge_dotenv(
        &self,
        path: PathBuf,
        values: &mut BTreeMap<String, String>,
    ) -> Result<(), ConfigError> {
        match dotenvy::from_path_iter(&path) {
            Ok(iter) => {
                for item in iter {
                    let (key, value) = item.map_err(|source| ConfigError::EnvFile {
                        path: path.clone(),
                        source,
                    })?;
                    if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                        values.insert(stripped.to_string(), value);
                    }
                }
                Ok(())
            }
            Err(dotenvy::Error::Io(ref io_err))
                if io_err.kind() == std::io::ErrorKind::NotFound =>
            {
                Ok(())
            }
            Err(err) => Err(ConfigError::EnvFile { path, source: err }),
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_number<T: FromStr>(
    layered: &mut BTreeMap<String, String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    match layered.remove(key).filter(|v| !v.trim().is_empty()) {
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidNumber { key, value }),
        None => Ok(None),
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

//! Configuration management for crawl-scheduler
//!
//! Configuration comes from a TOML file or from `CRAWLSCHED_*` environment
//! variables, falling back to built-in defaults for anything unset.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::queue::frontier::RefreshSettings;
use crate::queue::prioritizer::ScoreWeights;
use crate::scheduler::SchedulerSettings;

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub tracker: TrackerConfig,
    pub queue: QueueConfig,
    pub policy: PolicyConfig,
    pub scheduler: SchedulerConfig,
    pub logging: LoggingConfig,
}

/// Database configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite database path
    pub path: PathBuf,

    /// How long a writer waits for a competing lock, in milliseconds
    pub busy_timeout_ms: u64,
}

/// URL tracker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Refresh interval for URLs without a site override
    pub default_refresh_days: u32,

    /// Per-site refresh intervals used by the crawl-due check
    pub site_overrides: HashMap<String, u32>,

    /// Records not crawled for this many days are purged by cleanup
    pub retention_days: u32,
}

/// Discovery queue configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Default number of entries handed out by `queue next`
    pub batch_size: usize,

    /// Finished entries older than this many days are purged by cleanup
    pub cleanup_days: u32,

    /// Entries rescored per prioritizer batch
    pub score_batch_size: usize,

    /// Scoring weight overrides
    pub weights: Option<ScoreWeights>,
}

/// Refresh policy configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// JSON policy tables; built-in tables are used when unset
    pub file: Option<PathBuf>,
}

/// Job scheduler configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub poll_interval_secs: u64,

    /// Maximum concurrently running jobs
    pub max_workers: usize,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/crawl.db"),
            busy_timeout_ms: 5000,
        }
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            default_refresh_days: crate::policy::DEFAULT_REFRESH_DAYS,
            site_overrides: HashMap::new(),
            retention_days: 365,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            cleanup_days: 90,
            score_batch_size: 1000,
            weights: None,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
            max_workers: 10,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: String::from("info"),
            format: String::from("text"),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse::<T>().ok())
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("CRAWLSCHED_DB_PATH") {
            config.database.path = path.into();
        }
        if let Some(ms) = env_parse("CRAWLSCHED_BUSY_TIMEOUT_MS") {
            config.database.busy_timeout_ms = ms;
        }
        if let Some(days) = env_parse("CRAWLSCHED_DEFAULT_REFRESH_DAYS") {
            config.tracker.default_refresh_days = days;
        }
        if let Some(days) = env_parse("CRAWLSCHED_TRACKER_RETENTION_DAYS") {
            config.tracker.retention_days = days;
        }
        if let Some(size) = env_parse("CRAWLSCHED_BATCH_SIZE") {
            config.queue.batch_size = size;
        }
        if let Some(days) = env_parse("CRAWLSCHED_QUEUE_CLEANUP_DAYS") {
            config.queue.cleanup_days = days;
        }
        if let Some(size) = env_parse("CRAWLSCHED_SCORE_BATCH_SIZE") {
            config.queue.score_batch_size = size;
        }
        if let Ok(path) = std::env::var("CRAWLSCHED_POLICY_FILE") {
            config.policy.file = Some(path.into());
        }
        if let Some(secs) = env_parse("CRAWLSCHED_POLL_INTERVAL_SECS") {
            config.scheduler.poll_interval_secs = secs;
        }
        if let Some(workers) = env_parse("CRAWLSCHED_MAX_WORKERS") {
            config.scheduler.max_workers = workers;
        }
        if let Ok(level) = std::env::var("CRAWLSCHED_LOG_LEVEL") {
            config.logging.level = level;
        }
        if let Ok(format) = std::env::var("CRAWLSCHED_LOG_FORMAT") {
            config.logging.format = format;
        }

        Ok(config)
    }

    /// Load configuration from a file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML config file: {}", path.display()))?;

        Ok(config)
    }

    /// Load from `path` when given, otherwise from the environment, then validate
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::from_env()?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.database.path.as_os_str().is_empty() {
            anyhow::bail!("database.path must not be empty");
        }

        if self.tracker.default_refresh_days == 0 {
            anyhow::bail!("tracker.default_refresh_days must be greater than 0");
        }

        if let Some((site, _)) = self.tracker.site_overrides.iter().find(|(_, d)| **d == 0) {
            anyhow::bail!("tracker.site_overrides.{site} must be greater than 0");
        }

        if self.queue.batch_size == 0 {
            anyhow::bail!("queue.batch_size must be greater than 0");
        }

        if self.queue.score_batch_size == 0 {
            anyhow::bail!("queue.score_batch_size must be greater than 0");
        }

        if let Some(weights) = &self.queue.weights {
            if !(weights.max_score.is_finite() && weights.max_score > 0.0) {
                anyhow::bail!("queue.weights.max_score must be a positive number");
            }
        }

        if self.scheduler.max_workers == 0 {
            anyhow::bail!("scheduler.max_workers must be greater than 0");
        }

        if self.scheduler.poll_interval_secs == 0 {
            anyhow::bail!("scheduler.poll_interval_secs must be greater than 0");
        }

        if !matches!(self.logging.format.as_str(), "text" | "json") {
            anyhow::bail!("logging.format must be 'text' or 'json'");
        }

        Ok(())
    }

    #[must_use]
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.database.busy_timeout_ms)
    }

    #[must_use]
    pub fn refresh_settings(&self) -> RefreshSettings {
        RefreshSettings {
            default_refresh_days: self.tracker.default_refresh_days,
            site_overrides: self.tracker.site_overrides.clone(),
        }
    }

    #[must_use]
    pub fn score_weights(&self) -> ScoreWeights {
        self.queue.weights.clone().unwrap_or_default()
    }

    #[must_use]
    pub fn scheduler_settings(&self, metrics_file: Option<PathBuf>) -> SchedulerSettings {
        SchedulerSettings {
            poll_interval: Duration::from_secs(self.scheduler.poll_interval_secs),
            max_workers: self.scheduler.max_workers,
            metrics_file,
        }
    }
}

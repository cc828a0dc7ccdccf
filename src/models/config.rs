//! Application configuration structures.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

/// Root application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Upstream API settings
    #[serde(default)]
    pub api: ApiConfig,

    /// Traversal and artifact settings
    #[serde(default)]
    pub export: ExportConfig,

    /// Retry and backoff policy
    #[serde(default)]
    pub retry: RetryConfig,

    /// Stream processing settings
    #[serde(default)]
    pub process: ProcessConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Validate configuration values for basic sanity.
    pub fn validate(&self) -> Result<()> {
        if url::Url::parse(&self.api.base_url).is_err() {
            return Err(AppError::validation(format!(
                "api.base_url is not a valid URL: {}",
                self.api.base_url
            )));
        }
        if self.api.user_agent.trim().is_empty() {
            return Err(AppError::validation("api.user_agent is empty"));
        }
        if self.api.timeout_secs == 0 {
            return Err(AppError::validation("api.timeout_secs must be > 0"));
        }
        for (name, template, placeholder) in [
            ("api.paths.events", &self.api.paths.events, "{org_id}"),
            ("api.paths.event", &self.api.paths.event, "{event_id}"),
            ("api.paths.laps", &self.api.paths.laps, "{session_id}"),
            ("api.paths.announcements", &self.api.paths.announcements, "{session_id}"),
        ] {
            if !template.contains(placeholder) {
                return Err(AppError::validation(format!(
                    "{name} must contain {placeholder}"
                )));
            }
        }
        if self.export.max_concurrent == 0 {
            return Err(AppError::validation("export.max_concurrent must be > 0"));
        }
        if self.export.page_size.events == 0 || self.export.page_size.laps == 0 {
            return Err(AppError::validation("export.page_size values must be > 0"));
        }
        if self.retry.max_attempts == 0 {
            return Err(AppError::validation("retry.max_attempts must be > 0"));
        }
        for (name, value) in [
            ("retry.backoff_multiplier", self.retry.backoff_multiplier),
            ("retry.rate_limit_multiplier", self.retry.rate_limit_multiplier),
        ] {
            if !(value.is_finite() && value >= 1.0) {
                return Err(AppError::validation(format!(
                    "{name} must be a finite number >= 1.0"
                )));
            }
        }
        if self.retry.max_delay_ms < self.retry.initial_delay_ms {
            return Err(AppError::validation(
                "retry.max_delay_ms must be >= retry.initial_delay_ms",
            ));
        }
        if self.process.batch_size == 0 {
            return Err(AppError::validation("process.batch_size must be > 0"));
        }
        if self.process.channel_capacity == 0 {
            return Err(AppError::validation("process.channel_capacity must be > 0"));
        }
        Ok(())
    }
}

/// HTTP settings for the event results API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Base URL all path templates are joined onto
    #[serde(default = "defaults::base_url")]
    pub base_url: String,

    /// User-Agent header for HTTP requests
    #[serde(default = "defaults::user_agent")]
    pub user_agent: String,

    /// Request timeout in seconds
    #[serde(default = "defaults::timeout")]
    pub timeout_secs: u64,

    /// Optional bearer token
    #[serde(default)]
    pub token: Option<String>,

    /// `sportCategory` filter for event listings
    #[serde(default = "defaults::sport_category")]
    pub sport_category: String,

    #[serde(default)]
    pub paths: ApiPaths,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: defaults::base_url(),
            user_agent: defaults::user_agent(),
            timeout_secs: defaults::timeout(),
            token: None,
            sport_category: defaults::sport_category(),
            paths: ApiPaths::default(),
        }
    }
}

impl ApiConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Path templates relative to `base_url`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiPaths {
    #[serde(default = "defaults::events_path")]
    pub events: String,
    #[serde(default = "defaults::event_path")]
    pub event: String,
    #[serde(default = "defaults::laps_path")]
    pub laps: String,
    #[serde(default = "defaults::announcements_path")]
    pub announcements: String,
}

impl Default for ApiPaths {
    fn default() -> Self {
        Self {
            events: defaults::events_path(),
            event: defaults::event_path(),
            laps: defaults::laps_path(),
            announcements: defaults::announcements_path(),
        }
    }
}

/// Traversal and artifact settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportConfig {
    /// Root directory; each organization gets `<output_dir>/<org_id>/`
    #[serde(default = "defaults::output_dir")]
    pub output_dir: PathBuf,

    /// Maximum concurrent fetches
    #[serde(default = "defaults::max_concurrent")]
    pub max_concurrent: usize,

    /// Gzip the NDJSON artifacts
    #[serde(default = "defaults::compress")]
    pub compress: bool,

    #[serde(default)]
    pub page_size: PageSizes,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            output_dir: defaults::output_dir(),
            max_concurrent: defaults::max_concurrent(),
            compress: defaults::compress(),
            page_size: PageSizes::default(),
        }
    }
}

/// Page sizes of the paginated listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageSizes {
    #[serde(default = "defaults::events_page_size")]
    pub events: usize,
    #[serde(default = "defaults::laps_page_size")]
    pub laps: usize,
}

impl Default for PageSizes {
    fn default() -> Self {
        Self {
            events: defaults::events_page_size(),
            laps: defaults::laps_page_size(),
        }
    }
}

/// Retry and backoff policy for fetches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempts per work unit, including the first
    #[serde(default = "defaults::max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "defaults::initial_delay_ms")]
    pub initial_delay_ms: u64,

    #[serde(default = "defaults::max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "defaults::backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add up to 100% random jitter to each delay
    #[serde(default = "defaults::jitter")]
    pub jitter: bool,

    /// Extra delay factor applied after HTTP 429
    #[serde(default = "defaults::rate_limit_multiplier")]
    pub rate_limit_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: defaults::max_attempts(),
            initial_delay_ms: defaults::initial_delay_ms(),
            max_delay_ms: defaults::max_delay_ms(),
            backoff_multiplier: defaults::backoff_multiplier(),
            jitter: defaults::jitter(),
            rate_limit_multiplier: defaults::rate_limit_multiplier(),
        }
    }
}

/// How strictly track-record announcements are recognized.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordValidation {
    /// Accept a record announcement even when the class is missing.
    #[default]
    AllowMissingClass,
    /// Require class, lap time and driver.
    Strict,
}

/// Stream processing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessConfig {
    /// Rows per SQLite transaction
    #[serde(default = "defaults::batch_size")]
    pub batch_size: usize,

    /// Rows buffered between reader threads and the sink
    #[serde(default = "defaults::channel_capacity")]
    pub channel_capacity: usize,

    #[serde(default)]
    pub record_validation: RecordValidation,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            batch_size: defaults::batch_size(),
            channel_capacity: defaults::channel_capacity(),
            record_validation: RecordValidation::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    #[serde(default = "defaults::log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: defaults::log_level(),
        }
    }
}

mod defaults {
    use std::path::PathBuf;

    // API defaults
    pub fn base_url() -> String {
        "https://eventresults-api.speedhive.com/api/v0.2.3/eventresults".into()
    }
    pub fn user_agent() -> String {
        concat!("speedhive-dump/", env!("CARGO_PKG_VERSION")).into()
    }
    pub fn timeout() -> u64 {
        30
    }
    pub fn sport_category() -> String {
        "Motorized".into()
    }
    pub fn events_path() -> String {
        "organizations/{org_id}/events".into()
    }
    pub fn event_path() -> String {
        "events/{event_id}".into()
    }
    pub fn laps_path() -> String {
        "sessions/{session_id}/laps".into()
    }
    pub fn announcements_path() -> String {
        "sessions/{session_id}/announcements".into()
    }

    // Export defaults
    pub fn output_dir() -> PathBuf {
        PathBuf::from("output/full_dump")
    }
    pub fn max_concurrent() -> usize {
        20
    }
    pub fn compress() -> bool {
        true
    }
    pub fn events_page_size() -> usize {
        100
    }
    pub fn laps_page_size() -> usize {
        500
    }

    // Retry defaults
    pub fn max_attempts() -> u32 {
        5
    }
    pub fn initial_delay_ms() -> u64 {
        500
    }
    pub fn max_delay_ms() -> u64 {
        30_000
    }
    pub fn backoff_multiplier() -> f64 {
        2.0
    }
    pub fn jitter() -> bool {
        true
    }
    pub fn rate_limit_multiplier() -> f64 {
        4.0
    }

    // Process defaults
    pub fn batch_size() -> usize {
        500
    }
    pub fn channel_capacity() -> usize {
        1024
    }

    pub fn log_level() -> String {
        "info".into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_default_config_ok() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn validate_rejects_zero_concurrency() {
        let mut config = Config::default();
        config.export.max_concurrent = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_path_without_placeholder() {
        let mut config = Config::default();
        config.api.paths.laps = "sessions/laps".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("{session_id}"));
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            [export]
            max_concurrent = 4

            [export.page_size]
            laps = 50

            [process]
            record_validation = "strict"
            "#,
        )
        .unwrap();

        assert_eq!(config.export.max_concurrent, 4);
        assert_eq!(config.export.page_size.laps, 50);
        assert_eq!(config.export.page_size.events, 100);
        assert!(config.export.compress);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.process.record_validation, RecordValidation::Strict);
        assert_eq!(config.api.sport_category, "Motorized");
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            Config::load(dir.path().join("absent.toml")),
            Err(AppError::Io(_))
        ));
    }

    #[test]
    fn validate_rejects_non_finite_multipliers() {
        for bad in [f64::NAN, f64::INFINITY, 0.5] {
            let mut config = Config::default();
            config.retry.backoff_multiplier = bad;
            assert!(config.validate().is_err(), "backoff_multiplier {bad} accepted");

            let mut config = Config::default();
            config.retry.rate_limit_multiplier = bad;
            assert!(config.validate().is_err(), "rate_limit_multiplier {bad} accepted");
        }
    }
}

use crate::deduplication::DeduplicationConfig;
use crate::error::ConfigError;
use crate::poller::PollingConfig;
use figment::providers::{Env, Format, Yaml};
use figment::Figment;
use log::LevelFilter;
use serde::{Deserialize, Serialize};
use serde_inline_default::serde_inline_default;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Settings as read from the YAML file and `FEED_*` environment variables.
///
/// Nested keys use a double underscore in the environment, e.g.
/// `FEED_POLLING__ACTIVE_INTERVAL_MS=15000`.
#[serde_inline_default]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde_inline_default("http://localhost:3000/api".to_string())]
    pub api_base_url: String,
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde_inline_default("info".to_string())]
    pub log_level: String,
    #[serde(default)]
    pub deduplication: DeduplicationSettings,
    #[serde(default)]
    pub polling: PollingSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeduplicationSettings {
    pub timeout_ms: u64,
    pub retries: u32,
    pub coalesce_window_ms: u64,
    pub retry_base_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_retry_delay_ms: u64,
    pub sweep_interval_ms: u64,
    pub enabled: bool,
}

impl Default for DeduplicationSettings {
    fn default() -> Self {
        let config = DeduplicationConfig::default();
        Self {
            timeout_ms: millis(config.request_timeout),
            retries: config.retries,
            coalesce_window_ms: millis(config.coalesce_window),
            retry_base_delay_ms: millis(config.retry_base_delay),
            backoff_multiplier: config.backoff_multiplier,
            max_retry_delay_ms: millis(config.max_retry_delay),
            sweep_interval_ms: millis(config.sweep_interval),
            enabled: config.enabled,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingSettings {
    pub active_interval_ms: u64,
    pub idle_interval_ms: u64,
    pub hidden_interval_ms: u64,
    pub idle_threshold_ms: u64,
    pub max_retries: u32,
    pub backoff_multiplier: f64,
    pub min_fetch_gap_ms: u64,
}

impl Default for PollingSettings {
    fn default() -> Self {
        let config = PollingConfig::default();
        Self {
            active_interval_ms: millis(config.active_interval),
            idle_interval_ms: millis(config.idle_interval),
            hidden_interval_ms: millis(config.hidden_interval),
            idle_threshold_ms: millis(config.idle_threshold),
            max_retries: config.max_retries,
            backoff_multiplier: config.backoff_multiplier,
            min_fetch_gap_ms: millis(config.min_fetch_gap),
        }
    }
}

fn millis(duration: Duration) -> u64 {
    duration.as_millis() as u64
}

fn positive(field: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid {
            field,
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(())
}

fn multiplier(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if !(value >= 1.0 && value.is_finite()) {
        return Err(ConfigError::Invalid {
            field,
            reason: format!("must be a finite number >= 1.0, got {}", value),
        });
    }
    Ok(())
}

impl Settings {
    /// Load from an optional YAML file, overridden by `FEED_*` variables
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::new();
        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }
        Self::from_figment(figment.merge(Env::prefixed("FEED_").split("__")))
    }

    pub fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let settings: Settings = figment.extract()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let dedup = &self.deduplication;
        positive("deduplication.timeout_ms", dedup.timeout_ms)?;
        positive("deduplication.sweep_interval_ms", dedup.sweep_interval_ms)?;
        multiplier("deduplication.backoff_multiplier", dedup.backoff_multiplier)?;

        let polling = &self.polling;
        positive("polling.active_interval_ms", polling.active_interval_ms)?;
        positive("polling.idle_interval_ms", polling.idle_interval_ms)?;
        positive("polling.hidden_interval_ms", polling.hidden_interval_ms)?;
        positive("polling.idle_threshold_ms", polling.idle_threshold_ms)?;
        multiplier("polling.backoff_multiplier", polling.backoff_multiplier)?;

        if !(polling.hidden_interval_ms >= polling.idle_interval_ms
            && polling.idle_interval_ms >= polling.active_interval_ms)
        {
            log::warn!("Polling intervals are not ordered active <= idle <= hidden");
        }

        LevelFilter::from_str(&self.log_level).map_err(|_| ConfigError::Invalid {
            field: "log_level",
            reason: format!("unknown level `{}`", self.log_level),
        })?;
        Ok(())
    }

    pub fn log_level(&self) -> LevelFilter {
        LevelFilter::from_str(&self.log_level).unwrap_or(LevelFilter::Info)
    }

    pub fn deduplication_config(&self) -> DeduplicationConfig {
        let dedup = &self.deduplication;
        DeduplicationConfig {
            request_timeout: Duration::from_millis(dedup.timeout_ms),
            retries: dedup.retries,
            coalesce_window: Duration::from_millis(dedup.coalesce_window_ms),
            retry_base_delay: Duration::from_millis(dedup.retry_base_delay_ms),
            backoff_multiplier: dedup.backoff_multiplier,
            max_retry_delay: Duration::from_millis(dedup.max_retry_delay_ms),
            sweep_interval: Duration::from_millis(dedup.sweep_interval_ms),
            enabled: dedup.enabled,
        }
    }

    pub fn polling_config(&self) -> PollingConfig {
        let polling = &self.polling;
        PollingConfig {
            active_interval: Duration::from_millis(polling.active_interval_ms),
            idle_interval: Duration::from_millis(polling.idle_interval_ms),
            hidden_interval: Duration::from_millis(polling.hidden_interval_ms),
            idle_threshold: Duration::from_millis(polling.idle_threshold_ms),
            max_retries: polling.max_retries,
            backoff_multiplier: polling.backoff_multiplier,
            min_fetch_gap: Duration::from_millis(polling.min_fetch_gap_ms),
        }
    }
}

// Configuration management with layered configuration (file, env)

use crate::errors::ScheduleError;
use chrono_tz::Tz;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

/// Main settings structure containing all configuration options
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub scheduler: SchedulerSettings,
    pub observability: ObservabilityConfig,
}

/// What the dispatcher does when every worker slot is busy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SaturationPolicy {
    /// Wait for a free slot before dispatching
    #[default]
    Block,
    /// Skip the firing, log it, and schedule the next occurrence
    Reject,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub pool_size: usize,
    pub saturation_policy: SaturationPolicy,
    pub drain_timeout_seconds: u64,
    pub thread_name_prefix: String,
    /// IANA timezone used for cron tasks
    pub timezone: String,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            pool_size: 10,
            saturation_policy: SaturationPolicy::Block,
            drain_timeout_seconds: 30,
            thread_name_prefix: "schedbot-pool-".to_string(),
            timezone: "UTC".to_string(),
        }
    }
}

impl SchedulerSettings {
    /// Parsed cron timezone
    pub fn timezone(&self) -> Result<Tz, ScheduleError> {
        Tz::from_str(&self.timezone)
            .map_err(|_| ScheduleError::InvalidTimezone(self.timezone.clone()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub metrics_port: Option<u16>,
    pub tracing_endpoint: Option<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_port: None,
            tracing_endpoint: None,
        }
    }
}

impl Settings {
    /// Load configuration with layered precedence: defaults → file → env
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from_path<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Local overrides, not committed
            .add_source(File::from(config_dir.join("local.toml")).required(false))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Validate configuration settings
    pub fn validate(&self) -> Result<(), String> {
        if self.scheduler.pool_size == 0 {
            return Err("Scheduler pool_size must be greater than 0".to_string());
        }

        if self.scheduler.thread_name_prefix.is_empty() {
            return Err("Scheduler thread_name_prefix cannot be empty".to_string());
        }

        if let Err(e) = self.scheduler.timezone() {
            return Err(e.to_string());
        }

        if self.observability.metrics_port == Some(0) {
            return Err("Metrics port must be greater than 0".to_string());
        }

        Ok(())
    }
}

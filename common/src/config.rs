// Layered configuration: defaults -> local.toml -> APP__-prefixed env vars.

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main settings structure containing all configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub database: DatabaseConfig,
    pub limits: LimitsConfig,
    pub scheduling: SchedulingConfig,
    pub expense_service: ExpenseServiceConfig,
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_seconds: u64,
}

/// Quota and payload-size knobs from the core's configuration table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    pub max_templates: usize,
    pub max_name_len: usize,
    pub max_tags: usize,
    pub max_tag_len: usize,
    pub max_history: usize,
    pub min_interval_ms: i64,
    pub max_interval_ms: i64,
    pub retention_days: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulingConfig {
    pub dedup_window_seconds: i64,
    pub dedup_eviction_seconds: i64,
    pub timezone: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpenseServiceConfig {
    pub http_timeout_ms: u64,
    pub http_max_retries: u32,
    pub http_initial_delay_ms: u64,
    pub http_max_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub metrics_port: u16,
    pub tracing_endpoint: Option<String>,
}

impl Settings {
    /// Load configuration with layered precedence: defaults -> file -> env.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path("config")
    }

    pub fn load_from_path<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            .add_source(File::from(config_dir.join("local.toml")).required(false))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = builder.build()?;
        config.try_deserialize()
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.database.url.is_empty() {
            return Err("Database URL cannot be empty".to_string());
        }
        if self.database.max_connections == 0 {
            return Err("Database max_connections must be greater than 0".to_string());
        }
        if self.limits.max_templates == 0 {
            return Err("limits.max_templates must be greater than 0".to_string());
        }
        if self.limits.min_interval_ms <= 0 || self.limits.max_interval_ms < self.limits.min_interval_ms {
            return Err("limits.min_interval_ms/max_interval_ms are inconsistent".to_string());
        }
        if self.scheduling.timezone.parse::<chrono_tz::Tz>().is_err() {
            return Err(format!("scheduling.timezone '{}' is not a recognized IANA zone", self.scheduling.timezone));
        }
        if self.expense_service.http_max_retries == 0 {
            return Err("expense_service.http_max_retries must be greater than 0".to_string());
        }
        if self.expense_service.http_initial_delay_ms > self.expense_service.http_max_delay_ms {
            return Err("expense_service.http_initial_delay_ms cannot exceed http_max_delay_ms".to_string());
        }
        Ok(())
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "postgresql://localhost/expensabl_scheduler".to_string(),
                max_connections: 10,
                min_connections: 2,
                connect_timeout_seconds: 30,
            },
            limits: LimitsConfig {
                max_templates: 5,
                max_name_len: 100,
                max_tags: 10,
                max_tag_len: 30,
                max_history: 100,
                min_interval_ms: 5 * 60 * 1000,
                max_interval_ms: 365 * 24 * 60 * 60 * 1000,
                retention_days: 90,
            },
            scheduling: SchedulingConfig {
                dedup_window_seconds: 30,
                dedup_eviction_seconds: 300,
                timezone: "UTC".to_string(),
            },
            expense_service: ExpenseServiceConfig {
                http_timeout_ms: 30_000,
                http_max_retries: 3,
                http_initial_delay_ms: 1_000,
                http_max_delay_ms: 10_000,
            },
            observability: ObservabilityConfig {
                log_level: "info".to_string(),
                metrics_port: 9090,
                tracing_endpoint: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn validation_catches_empty_database_url() {
        let mut settings = Settings::default();
        settings.database.url = String::new();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn validation_catches_unknown_timezone() {
        let mut settings = Settings::default();
        settings.scheduling.timezone = "Not/AZone".to_string();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn validation_catches_inverted_retry_delays() {
        let mut settings = Settings::default();
        settings.expense_service.http_initial_delay_ms = 20_000;
        assert!(settings.validate().is_err());
    }
}

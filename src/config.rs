use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::agents::{AnalystConfig, RetryPolicy, StrategyConfig};
use crate::cio::CioConfig;
use crate::coordinator::CoordinatorConfig;
use crate::portfolio::SizingConfig;
use crate::risk::RiskConfig;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub coordinator: CoordinatorConfig,
    /// Retry policy shared by every producer
    pub producer: RetryPolicy,
    pub analyst: AnalystConfig,
    pub strategies: StrategyConfig,
    pub sizing: SizingConfig,
    pub cio: CioConfig,
    pub risk: RiskConfig,
    pub persistence: PersistenceConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Circuit breaker state (JSON)
    pub breaker_path: PathBuf,
    /// Cycle reports (JSON lines)
    pub report_path: PathBuf,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            breaker_path: PathBuf::from("data/breaker.json"),
            report_path: PathBuf::from("data/reports.jsonl"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Enable JSON formatted logs
    pub json: bool,
    /// Directory for daily rotated log files
    pub dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            dir: None,
        }
    }
}

impl AppConfig {
    /// Load `default.toml`, then the `TRADEDESK_ENV` file, then
    /// `TRADEDESK_<SECTION>__<KEY>` environment variables from a directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            // Load default config file
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Load environment-specific config (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("TRADEDESK_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (TRADEDESK_RISK__MAX_LEVERAGE, etc.)
            .add_source(
                Environment::with_prefix("TRADEDESK")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if let Err(e) = self.coordinator.validate() {
            errors.push(e.to_string());
        }
        if let Err(e) = self.risk.validate() {
            errors.push(e.to_string());
        }
        if self.strategies.enabled.is_empty() {
            errors.push("at least one strategy must be enabled".to_string());
        }
        if self.cio.max_daily_orders == 0 {
            errors.push("cio.max_daily_orders must be at least 1".to_string());
        }
        if self.producer.attempt_timeout_ms == 0 {
            errors.push("producer.attempt_timeout_ms must be positive".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

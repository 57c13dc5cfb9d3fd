//! Application configuration module
//! Handles environment variable loading, configuration validation, and application settings

use crate::services::risk::RiskConfig;
use crate::workers::settlement_monitor::SettlementMonitorConfig;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    /// `None` when running with `SKIP_EXTERNALS=true`
    pub database: Option<DatabaseConfig>,
    pub logging: LoggingConfig,
    pub gateway: GatewayConfig,
    pub risk: RiskConfig,
    pub settlement_monitor: SettlementMonitorConfig,
    pub skip_externals: bool,
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connection_timeout: u64,   // seconds
    pub idle_timeout: Option<u64>, // seconds
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

/// Log format options
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Plain,
}

/// Payment engine settings shared by the orchestrator and the workflows
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub merchant_reference_prefix: String,
    pub default_currency: String,
    pub settlement_currency: String,
    /// Percentage of the amount kept by the platform
    pub platform_fee_percent: Decimal,
    pub provider_timeout: Duration,
    pub bulk_verify_concurrency: usize,
    /// Units of settlement currency per unit of the keyed currency
    pub fx_rates: HashMap<String, Decimal>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            merchant_reference_prefix: "PAY".to_string(),
            default_currency: "NGN".to_string(),
            settlement_currency: "NGN".to_string(),
            platform_fee_percent: Decimal::new(5, 1),
            provider_timeout: Duration::from_secs(30),
            bulk_verify_concurrency: 4,
            fx_rates: HashMap::new(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if it exists
        let _ = dotenv::dotenv().ok();

        let skip_externals = env::var("SKIP_EXTERNALS")
            .unwrap_or_else(|_| "false".to_string())
            .to_lowercase()
            == "true";

        let database = if skip_externals {
            None
        } else {
            Some(DatabaseConfig::from_env()?)
        };

        Ok(AppConfig {
            server: ServerConfig::from_env()?,
            database,
            logging: LoggingConfig::from_env()?,
            gateway: GatewayConfig::from_env()?,
            risk: RiskConfig::from_env()?,
            settlement_monitor: SettlementMonitorConfig::from_env()?,
            skip_externals,
        })
    }

    /// Validate the entire configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.validate()?;
        if let Some(database) = &self.database {
            database.validate()?;
        }
        self.logging.validate()?;
        self.gateway.validate()?;
        self.risk.validate()?;
        self.settlement_monitor.validate()?;

        Ok(())
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(ServerConfig {
            host: env::var("SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: env::var("SERVER_PORT")
                .unwrap_or_else(|_| "8000".to_string())
                .parse()
                .map_err(|_| ConfigError::InvalidValue("SERVER_PORT".to_string()))?,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::InvalidValue(
                "SERVER_PORT cannot be 0".to_string(),
            ));
        }

        if self.host.is_empty() {
            return Err(ConfigError::InvalidValue(
                "SERVER_HOST cannot be empty".to_string(),
            ));
        }

        Ok(())
    }
}

impl DatabaseConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(DatabaseConfig {
            url: env::var("DATABASE_URL")
                .map_err(|_| ConfigError::MissingVariable("DATABASE_URL".to_string()))?,
            max_connections: env::var("DB_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "20".to_string())
                .parse()
                .map_err(|_| ConfigError::InvalidValue("DB_MAX_CONNECTIONS".to_string()))?,
            min_connections: env::var("DB_MIN_CONNECTIONS")
                .unwrap_or_else(|_| "5".to_string())
                .parse()
                .map_err(|_| ConfigError::InvalidValue("DB_MIN_CONNECTIONS".to_string()))?,
            connection_timeout: env::var("DB_CONNECTION_TIMEOUT")
                .unwrap_or_else(|_| "30".to_string())
                .parse()
                .map_err(|_| ConfigError::InvalidValue("DB_CONNECTION_TIMEOUT".to_string()))?,
            idle_timeout: env::var("DB_IDLE_TIMEOUT")
                .ok()
                .and_then(|val| val.parse().ok()),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.is_empty() {
            return Err(ConfigError::InvalidValue("DATABASE_URL".to_string()));
        }

        if self.max_connections == 0 {
            return Err(ConfigError::InvalidValue("DB_MAX_CONNECTIONS".to_string()));
        }

        if self.min_connections > self.max_connections {
            return Err(ConfigError::InvalidValue(
                "DB_MIN_CONNECTIONS must be <= DB_MAX_CONNECTIONS".to_string(),
            ));
        }

        Ok(())
    }
}

impl LoggingConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(LoggingConfig {
            level: env::var("LOG_LEVEL").unwrap_or_else(|_| "INFO".to_string()),
            format: match env::var("LOG_FORMAT")
                .unwrap_or_else(|_| "plain".to_string())
                .as_str()
            {
                "json" => LogFormat::Json,
                _ => LogFormat::Plain,
            },
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["TRACE", "DEBUG", "INFO", "WARN", "ERROR"];
        if !valid_levels.contains(&self.level.to_uppercase().as_str()) {
            return Err(ConfigError::InvalidValue("LOG_LEVEL".to_string()));
        }

        Ok(())
    }
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = GatewayConfig::default();

        Ok(GatewayConfig {
            merchant_reference_prefix: env::var("MERCHANT_REFERENCE_PREFIX")
                .unwrap_or(defaults.merchant_reference_prefix),
            default_currency: env::var("DEFAULT_CURRENCY")
                .map(|c| c.to_uppercase())
                .unwrap_or(defaults.default_currency),
            settlement_currency: env::var("SETTLEMENT_CURRENCY")
                .map(|c| c.to_uppercase())
                .unwrap_or(defaults.settlement_currency),
            platform_fee_percent: match env::var("PLATFORM_FEE_PERCENT") {
                Ok(raw) => Decimal::from_str(raw.trim()).map_err(|_| {
                    ConfigError::InvalidValue("PLATFORM_FEE_PERCENT".to_string())
                })?,
                Err(_) => defaults.platform_fee_percent,
            },
            provider_timeout: Duration::from_secs(
                env::var("PROVIDER_TIMEOUT_SECS")
                    .unwrap_or_else(|_| "30".to_string())
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue("PROVIDER_TIMEOUT_SECS".to_string()))?,
            ),
            bulk_verify_concurrency: env::var("BULK_VERIFY_CONCURRENCY")
                .unwrap_or_else(|_| "4".to_string())
                .parse()
                .map_err(|_| ConfigError::InvalidValue("BULK_VERIFY_CONCURRENCY".to_string()))?,
            fx_rates: match env::var("FX_RATES") {
                Ok(raw) => parse_fx_rates(&raw)?,
                Err(_) => defaults.fx_rates,
            },
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.merchant_reference_prefix.trim().is_empty() {
            return Err(ConfigError::InvalidValue(
                "MERCHANT_REFERENCE_PREFIX".to_string(),
            ));
        }
        if self.platform_fee_percent < Decimal::ZERO || self.platform_fee_percent >= Decimal::ONE_HUNDRED
        {
            return Err(ConfigError::ValidationFailed(
                "PLATFORM_FEE_PERCENT must be within [0, 100)".to_string(),
            ));
        }
        if self.provider_timeout.is_zero() {
            return Err(ConfigError::InvalidValue("PROVIDER_TIMEOUT_SECS".to_string()));
        }
        if self.bulk_verify_concurrency == 0 {
            return Err(ConfigError::InvalidValue(
                "BULK_VERIFY_CONCURRENCY".to_string(),
            ));
        }
        Ok(())
    }

    /// Rate that converts `currency` into the settlement currency.
    pub fn fx_rate_for(&self, currency: &str) -> Option<Decimal> {
        if currency.eq_ignore_ascii_case(&self.settlement_currency) {
            return Some(Decimal::ONE);
        }
        self.fx_rates.get(&currency.to_uppercase()).copied()
    }
}

/// Parses `USD:1550.25,GHS:118` into a rate table
pub fn parse_fx_rates(raw: &str) -> Result<HashMap<String, Decimal>, ConfigError> {
    let mut rates = HashMap::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (currency, rate) = pair
            .split_once(':')
            .ok_or_else(|| ConfigError::InvalidValue(format!("FX_RATES entry '{}'", pair)))?;
        let rate = Decimal::from_str(rate.trim())
            .map_err(|_| ConfigError::InvalidValue(format!("FX_RATES entry '{}'", pair)))?;
        if rate <= Decimal::ZERO {
            return Err(ConfigError::ValidationFailed(format!(
                "FX rate for {} must be positive",
                currency
            )));
        }
        rates.insert(currency.trim().to_uppercase(), rate);
    }
    Ok(rates)
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVariable(String),

    #[error("Invalid value for configuration: {0}")]
    InvalidValue(String),

    #[error("Validation failed: {0}")]
    ValidationFailed(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_server_config_validation() {
        let config = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 8000,
        };

        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_port_validation() {
        let config = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
        };

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_database_pool_bounds() {
        let config = DatabaseConfig {
            url: "postgres://localhost/clinipay".to_string(),
            max_connections: 2,
            min_connections: 5,
            connection_timeout: 30,
            idle_timeout: None,
        };

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_fx_rates() {
        let rates = parse_fx_rates("usd:1550.25, GHS:118").unwrap();
        assert_eq!(rates.get("USD"), Some(&dec!(1550.25)));
        assert_eq!(rates.get("GHS"), Some(&dec!(118)));

        assert!(parse_fx_rates("USD=1550").is_err());
        assert!(parse_fx_rates("USD:-1").is_err());
    }

    #[test]
    fn test_fx_rate_for_settlement_currency_is_one() {
        let mut config = GatewayConfig::default();
        config.fx_rates.insert("USD".to_string(), dec!(1550));

        assert_eq!(config.fx_rate_for("ngn"), Some(Decimal::ONE));
        assert_eq!(config.fx_rate_for("USD"), Some(dec!(1550)));
        assert_eq!(config.fx_rate_for("EUR"), None);
    }

    #[test]
    fn test_platform_fee_must_be_below_hundred() {
        let config = GatewayConfig {
            platform_fee_percent: dec!(100),
            ..GatewayConfig::default()
        };
        assert!(config.validate().is_err());
    }
}

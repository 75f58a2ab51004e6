//! Ledger Service Configuration
//!
//! Supports loading from environment variables with the BOND_LEDGER_ prefix.
//! Unset or malformed variables fall back to the defaults.

use std::env;
use std::time::Duration;

use bond_core::{FeeSchedule, ProductRules};
use bond_store::{PgStoreOptions, TxRetry};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::telemetry::{LogConfig, LogFormat, LogLevel};

const PREFIX: &str = "BOND_LEDGER_";

/// Configuration errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid product rules: {0}")]
    ProductRules(String),

    #[error("invalid fee schedule: {0}")]
    FeeSchedule(String),

    #[error("invalid scheduler settings: {0}")]
    Scheduler(String),

    #[error("invalid database settings: {0}")]
    Database(String),
}

/// Deployment environment
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Local,
    Development,
    Production,
}

impl Environment {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "local" => Some(Self::Local),
            "development" | "dev" => Some(Self::Development),
            "production" | "prod" => Some(Self::Production),
            _ => None,
        }
    }
}

/// Database connection settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
    /// Attempts per transaction on serialization failure or deadlock
    pub tx_retry_attempts: usize,
    pub tx_retry_base_delay_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost:5432/bond_ledger".to_string(),
            max_connections: 10,
            acquire_timeout_secs: 10,
            tx_retry_attempts: 8,
            tx_retry_base_delay_ms: 100,
        }
    }
}

impl DatabaseConfig {
    pub fn store_options(&self) -> PgStoreOptions {
        let base_delay = Duration::from_millis(self.tx_retry_base_delay_ms);
        PgStoreOptions {
            url: self.url.clone(),
            max_connections: self.max_connections,
            acquire_timeout: Duration::from_secs(self.acquire_timeout_secs),
            retry: TxRetry {
                attempts: self.tx_retry_attempts,
                base_delay,
                max_delay: TxRetry::default().max_delay.max(base_delay),
            },
        }
    }
}

/// Background settlement and report timers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub settlement_interval_secs: u64,
    pub report_interval_secs: u64,
    /// Fire both timers immediately at start-up
    pub run_on_start: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            settlement_interval_secs: 12 * 60 * 60,
            report_interval_secs: 12 * 60 * 60,
            run_on_start: true,
        }
    }
}

impl SchedulerConfig {
    pub fn settlement_interval(&self) -> Duration {
        Duration::from_secs(self.settlement_interval_secs)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.report_interval_secs)
    }
}

/// Complete service configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerConfig {
    pub environment: Environment,
    pub database: DatabaseConfig,
    pub product: ProductRules,
    pub fees: FeeSchedule,
    pub scheduler: SchedulerConfig,
    pub log: LogConfig,
}

impl LedgerConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables (all prefixed with BOND_LEDGER_):
    /// - ENV: local/development/production
    /// - DATABASE_URL, DB_MAX_CONNECTIONS, DB_ACQUIRE_TIMEOUT_SECS,
    ///   DB_RETRY_ATTEMPTS, DB_RETRY_BASE_DELAY_MS
    /// - UNIT_AMOUNT, MIN_AMOUNT, MAX_AMOUNT, TENORS (comma separated days)
    /// - TAX_RATE, HOLDING_FEE_RATE, EARLY_EXIT_FEE_RATE, DAY_COUNT_BASIS
    /// - SETTLEMENT_INTERVAL_SECS, REPORT_INTERVAL_SECS, RUN_ON_START
    /// - LOG_LEVEL, LOG_FORMAT, LOG_FILTER
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load from an arbitrary key lookup (keys include the prefix)
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(&format!("{}{}", PREFIX, name));
        fn parsed<T: std::str::FromStr>(raw: Option<String>, default: T) -> T {
            raw.and_then(|s| s.trim().parse().ok()).unwrap_or(default)
        }

        let environment = get("ENV")
            .and_then(|s| Environment::parse(&s))
            .unwrap_or_default();
        let mut base = match environment {
            Environment::Production => Self::production(),
            Environment::Development => Self::development(),
            Environment::Local => Self::default(),
        };

        let db = &mut base.database;
        if let Some(url) = get("DATABASE_URL") {
            db.url = url;
        }
        db.max_connections = parsed(get("DB_MAX_CONNECTIONS"), db.max_connections);
        db.acquire_timeout_secs = parsed(get("DB_ACQUIRE_TIMEOUT_SECS"), db.acquire_timeout_secs);
        db.tx_retry_attempts = parsed(get("DB_RETRY_ATTEMPTS"), db.tx_retry_attempts);
        db.tx_retry_base_delay_ms = parsed(get("DB_RETRY_BASE_DELAY_MS"), db.tx_retry_base_delay_ms);

        let product = &mut base.product;
        product.unit_amount = parsed(get("UNIT_AMOUNT"), product.unit_amount);
        product.min_amount = parsed(get("MIN_AMOUNT"), product.min_amount);
        product.max_amount = parsed(get("MAX_AMOUNT"), product.max_amount);
        if let Some(tenors) = get("TENORS").and_then(|s| parse_tenors(&s)) {
            product.allowed_tenors = tenors;
        }

        let fees = &mut base.fees;
        fees.tax_rate = parsed::<Decimal>(get("TAX_RATE"), fees.tax_rate);
        fees.holding_fee_rate = parsed::<Decimal>(get("HOLDING_FEE_RATE"), fees.holding_fee_rate);
        fees.early_exit_fee_rate = parsed::<Decimal>(get("EARLY_EXIT_FEE_RATE"), fees.early_exit_fee_rate);
        fees.day_count_basis = parsed(get("DAY_COUNT_BASIS"), fees.day_count_basis);

        let scheduler = &mut base.scheduler;
        scheduler.settlement_interval_secs =
            parsed(get("SETTLEMENT_INTERVAL_SECS"), scheduler.settlement_interval_secs);
        scheduler.report_interval_secs = parsed(get("REPORT_INTERVAL_SECS"), scheduler.report_interval_secs);
        scheduler.run_on_start = get("RUN_ON_START")
            .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
            .unwrap_or(scheduler.run_on_start);

        let log = &mut base.log;
        log.level = get("LOG_LEVEL")
            .and_then(|s| LogLevel::parse(&s))
            .unwrap_or(log.level);
        log.format = get("LOG_FORMAT")
            .and_then(|s| LogFormat::parse(&s))
            .unwrap_or(log.format);
        log.filter = get("LOG_FILTER").or(log.filter.take());

        base.environment = environment;
        base
    }

    /// Production preset: JSON logs, larger pool
    pub fn production() -> Self {
        Self {
            environment: Environment::Production,
            database: DatabaseConfig {
                max_connections: 32,
                ..DatabaseConfig::default()
            },
            log: LogConfig::production(),
            ..Self::default()
        }
    }

    /// Development preset: debug logs
    pub fn development() -> Self {
        Self {
            environment: Environment::Development,
            log: LogConfig::development(),
            ..Self::default()
        }
    }

    /// Test preset: short timers, no start-up run
    pub fn test() -> Self {
        Self {
            environment: Environment::Local,
            database: DatabaseConfig {
                url: "postgres://localhost:5432/bond_ledger_test".to_string(),
                max_connections: 2,
                tx_retry_attempts: 3,
                tx_retry_base_delay_ms: 5,
                ..DatabaseConfig::default()
            },
            scheduler: SchedulerConfig {
                settlement_interval_secs: 1,
                report_interval_secs: 1,
                run_on_start: false,
            },
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let p = &self.product;
        if p.unit_amount <= 0 || p.min_amount <= 0 || p.min_amount > p.max_amount {
            return Err(ConfigError::ProductRules(format!(
                "unit {} and bounds [{}, {}] are inconsistent",
                p.unit_amount, p.min_amount, p.max_amount
            )));
        }
        if p.allowed_tenors.is_empty() || p.allowed_tenors.contains(&0) {
            return Err(ConfigError::ProductRules("tenors must be non-empty and positive".to_string()));
        }
        self.fees
            .validate()
            .map_err(|e| ConfigError::FeeSchedule(e.to_string()))?;
        if self.scheduler.settlement_interval_secs == 0 || self.scheduler.report_interval_secs == 0 {
            return Err(ConfigError::Scheduler("intervals must be positive".to_string()));
        }
        if self.database.max_connections == 0 || self.database.tx_retry_attempts == 0 {
            return Err(ConfigError::Database(
                "pool size and retry attempts must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_tenors(raw: &str) -> Option<Vec<u32>> {
    let tenors: Result<Vec<u32>, _> = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::parse)
        .collect();
    tenors.ok().filter(|t| !t.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (format!("{}{}", PREFIX, k), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = LedgerConfig::from_lookup(|_| None);
        assert_eq!(config, LedgerConfig::default());
        assert_eq!(config.product.allowed_tenors, vec![90, 180, 270]);
        assert_eq!(config.scheduler.settlement_interval_secs, 43_200);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_overrides() {
        let config = LedgerConfig::from_lookup(lookup(&[
            ("ENV", "production"),
            ("DATABASE_URL", "postgres://db/ledger"),
            ("TENORS", "30, 60"),
            ("TAX_RATE", "0.10"),
            ("SETTLEMENT_INTERVAL_SECS", "60"),
            ("RUN_ON_START", "false"),
            ("LOG_LEVEL", "warn"),
        ]));
        assert_eq!(config.environment, Environment::Production);
        assert_eq!(config.database.url, "postgres://db/ledger");
        assert_eq!(config.database.max_connections, 32);
        assert_eq!(config.product.allowed_tenors, vec![30, 60]);
        assert_eq!(config.fees.tax_rate, dec!(0.10));
        assert_eq!(config.scheduler.settlement_interval_secs, 60);
        assert!(!config.scheduler.run_on_start);
        assert_eq!(config.log.level, LogLevel::Warn);
        assert_eq!(config.log.format, LogFormat::Json);
    }

    #[test]
    fn test_malformed_values_fall_back() {
        let config = LedgerConfig::from_lookup(lookup(&[
            ("MIN_AMOUNT", "lots"),
            ("TENORS", "ninety"),
            ("LOG_FORMAT", "xml"),
        ]));
        assert_eq!(config.product.min_amount, 1_000);
        assert_eq!(config.product.allowed_tenors, vec![90, 180, 270]);
        assert_eq!(config.log.format, LogFormat::Pretty);
    }

    #[test]
    fn test_validate_rejects_inverted_bounds() {
        let mut config = LedgerConfig::test();
        assert!(config.validate().is_ok());
        config.product.min_amount = 60_000;
        assert!(matches!(config.validate(), Err(ConfigError::ProductRules(_))));
    }

    #[test]
    fn test_store_options() {
        let options = LedgerConfig::test().database.store_options();
        assert_eq!(options.retry.attempts, 3);
        assert_eq!(options.retry.base_delay, Duration::from_millis(5));
        assert_eq!(options.max_connections, 2);
    }
}

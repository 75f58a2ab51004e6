//! Structured Logging
//!
//! JSON output for production, pretty output for development. Unless an
//! explicit filter is configured, only the ledger crates log, at `level`.

use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Layer, Registry};

/// Crates whose events the default filter keeps
const LEDGER_TARGETS: [&str; 4] = ["bond_core", "bond_store", "bond_service", "bond_ledger"];

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "trace" => Some(Self::Trace),
            "debug" => Some(Self::Debug),
            "info" => Some(Self::Info),
            "warn" | "warning" => Some(Self::Warn),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
    Compact,
}

impl LogFormat {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pretty" => Some(Self::Pretty),
            "json" => Some(Self::Json),
            "compact" => Some(Self::Compact),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogConfig {
    pub level: LogLevel,
    pub format: LogFormat,
    /// Source file and line on every event
    pub include_source: bool,
    pub include_thread_id: bool,
    /// Full directive, e.g. "bond_store=debug,sqlx=warn"; overrides `level`
    pub filter: Option<String>,
    pub service_name: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Pretty,
            include_source: true,
            include_thread_id: false,
            filter: None,
            service_name: "bond-ledger".to_string(),
        }
    }
}

impl LogConfig {
    pub fn production() -> Self {
        Self {
            format: LogFormat::Json,
            include_source: false,
            include_thread_id: true,
            ..Self::default()
        }
    }

    pub fn development() -> Self {
        Self {
            level: LogLevel::Debug,
            ..Self::default()
        }
    }

    pub fn with_service_name(mut self, name: &str) -> Self {
        self.service_name = name.to_string();
        self
    }

    /// Filter directive actually installed
    pub fn directive(&self) -> String {
        match &self.filter {
            Some(f) => f.clone(),
            None => LEDGER_TARGETS
                .iter()
                .map(|t| format!("{}={}", t, self.level))
                .collect::<Vec<_>>()
                .join(","),
        }
    }
}

/// Install the global subscriber
pub fn init_logging(config: &LogConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_new(config.directive())?;
    let base = fmt::layer()
        .with_thread_ids(config.include_thread_id)
        .with_file(config.include_source)
        .with_line_number(config.include_source);
    let output: Box<dyn Layer<Registry> + Send + Sync> = match config.format {
        LogFormat::Json => base.json().boxed(),
        LogFormat::Pretty => base.pretty().boxed(),
        LogFormat::Compact => base.compact().boxed(),
    };

    tracing_subscriber::registry().with(output).with(filter).try_init()?;

    tracing::info!(service = %config.service_name, level = %config.level, "logging initialised");
    Ok(())
}

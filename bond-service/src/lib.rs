//! Bond Ledger Service
//!
//! Caller-facing facade over a [`bond_store::LedgerStore`], the background
//! settlement scheduler, operator reports, and the ambient configuration and
//! logging for the `bond-ledger` binary.

pub mod auth;
pub mod clock;
pub mod config;
pub mod notify;
pub mod reports;
pub mod scheduler;
pub mod service;
pub mod telemetry;

pub use auth::{Caller, IdentityResolver, Role, StaticIdentityResolver};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, DatabaseConfig, Environment, LedgerConfig, SchedulerConfig};
pub use notify::{Notification, NotificationSink, Notifier, RecipientGroup, RecordingSink, SinkError, TracingSink};
pub use reports::{summarize_holdings, HoldingsReport, PurchasesReport, WithdrawalsReport};
pub use scheduler::{SchedulerHandle, SettlementScheduler};
pub use service::LedgerService;
pub use telemetry::{init_logging, LogConfig, LogFormat, LogLevel};

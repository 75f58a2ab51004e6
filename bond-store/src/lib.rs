//! Bond Ledger Store
//!
//! Transactional persistence for the ledger. The [`LedgerStore`] trait has
//! one method per economic event; each backend runs a method as a single
//! atomic unit.
//!
//! Backends:
//! - [`MemoryLedgerStore`]: copy-on-write snapshot, used by tests and local runs
//! - `PgLedgerStore` (feature `postgres`): PostgreSQL with row locks,
//!   guarded updates and retried transactions

pub mod error;
pub mod memory;
pub mod repo;

#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "postgres")]
pub mod schema;

pub use error::{StoreError, StoreResult};
pub use memory::{LedgerState, MemoryLedgerStore};
pub use repo::{LedgerStore, PurchaseOrder};

#[cfg(feature = "postgres")]
pub use postgres::{PgLedgerStore, PgStoreOptions, TxRetry};

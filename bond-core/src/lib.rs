//! Bond Ledger Core - Allocation, Accrual and Settlement Planning
//!
//! The pure half of the bond micro-investment ledger. Nothing in this crate
//! performs I/O; stores call into it while holding their own transactions.
//!
//! - **Allocation**: waterfall split of a purchase over bond capacity
//! - **Accrual**: early-redemption and maturity payouts under the fee schedule
//! - **Lifecycle**: token/bond state transitions and inventory counters
//! - **Settlement**: payout plans and digested run reports
//!
//! # Invariants
//!
//! | Invariant | Requirement |
//! |-----------|-------------|
//! | **Inventory** | `0 <= available <= original`; active principal per bond equals `original - available` |
//! | **Solvency** | account balances never go negative |
//! | **Single withdrawal** | at most one outstanding withdrawal request per user |
//! | **Terminal states** | closed tokens and retired bonds never reopen |
//!
//! # Example
//!
//! ```
//! use bond_core::*;
//! use chrono::Utc;
//! use rust_decimal_macros::dec;
//!
//! let now = Utc::now();
//! let bond = NewBond {
//!     tenor_days: 90,
//!     issue_date: now,
//!     interest_rate: dec!(20),
//!     amount: 10_000,
//!     maturity_date: None,
//! }
//! .into_bond()
//! .unwrap();
//!
//! let plan = AllocationEngine::new().allocate([&bond], now, 90, 3_000).unwrap();
//! assert_eq!(plan.total(), 3_000);
//!
//! let payout = AccrualCalculator::default().maturity_return(10_000, dec!(13), 90).unwrap();
//! assert_eq!(payout, 10_251);
//! ```

pub mod accrual;
pub mod allocation;
pub mod error;
pub mod lifecycle;
pub mod rules;
pub mod settlement;
pub mod types;

pub use accrual::{elapsed_days, AccrualCalculator, AccrualInput, AccrualMode};
pub use allocation::{AllocationEngine, AllocationFragment, AllocationPlan, PurchaseTerms};
pub use error::{ErrorKind, LedgerError, LedgerResult};
pub use rules::{FeeSchedule, ProductRules};
pub use settlement::{HoldingPayout, PayoutPlan, SettlementOutcome, SettlementPlanner, SettlementReport};
pub use types::*;

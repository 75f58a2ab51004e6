//! Ledger Basic Types
//!
//! Naming conventions:
//! - `_id` suffix: Primary key identifiers
//! - `_date` suffix: UTC instants
//! - `_amount` suffix: Whole currency units

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Whole units of the ledger currency. Sub-units are never represented.
pub type Amount = i64;

/// Day-count helper: instant `days` after `from`
pub fn add_days(from: DateTime<Utc>, days: u32) -> DateTime<Utc> {
    from + Duration::days(i64::from(days))
}

// ============================================================
// Identifier newtypes (non-interchangeable)
// ============================================================

macro_rules! ledger_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Generate a fresh random identifier
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Wrap an existing UUID
            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Parse from the canonical hyphenated form
            pub fn parse(s: &str) -> Option<Self> {
                Uuid::parse_str(s).ok().map(Self)
            }

            /// Underlying UUID
            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }

            /// Short form used in log lines
            pub fn short(&self) -> String {
                format!("{}:{}", $prefix, &self.0.simple().to_string()[..8])
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }
    };
}

ledger_id!(
    /// User account identifier (the resolved auth subject)
    UserId,
    "user"
);
ledger_id!(
    /// Bond identifier
    BondId,
    "bond"
);
ledger_id!(
    /// Investment token (fragment) identifier
    TokenId,
    "tok"
);
ledger_id!(
    /// Purchase group identifier shared by all fragments of one purchase
    HoldingId,
    "hold"
);
ledger_id!(
    /// Interest rate record identifier
    RateId,
    "rate"
);
ledger_id!(
    /// Withdrawal request identifier
    WithdrawalId,
    "wdr"
);
ledger_id!(
    /// Settlement run identifier
    RunId,
    "run"
);

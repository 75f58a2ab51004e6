//! Bond Types

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::common::{add_days, Amount, BondId};
use crate::error::{LedgerError, LedgerResult};

/// Bond lifecycle state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BondState {
    /// Open for allocation
    Active,
    /// Retired by settlement; terminal
    Matured,
}

impl std::fmt::Display for BondState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Matured => write!(f, "matured"),
        }
    }
}

/// Issued bond capacity
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bond {
    pub id: BondId,
    pub tenor_days: u32,
    pub issue_date: DateTime<Utc>,
    /// Coupon published with the bond (informational; tokens snapshot the
    /// platform rate instead)
    pub interest_rate: Decimal,
    pub original_amount: Amount,
    pub available_amount: Amount,
    pub maturity_date: DateTime<Utc>,
    pub valid: bool,
}

impl Bond {
    pub fn state(&self) -> BondState {
        if self.valid {
            BondState::Active
        } else {
            BondState::Matured
        }
    }

    /// Capacity currently committed to active tokens
    pub fn committed_amount(&self) -> Amount {
        self.original_amount - self.available_amount
    }

    /// Whether the bond outlives a token bought at `now` for `tenor_days`
    pub fn covers_tenor(&self, now: DateTime<Utc>, tenor_days: u32) -> bool {
        self.valid && self.maturity_date >= add_days(now, tenor_days)
    }
}

/// Operator request to issue a bond
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewBond {
    pub tenor_days: u32,
    pub issue_date: DateTime<Utc>,
    pub interest_rate: Decimal,
    pub amount: Amount,
    /// Defaults to `issue_date + tenor_days`
    #[serde(default)]
    pub maturity_date: Option<DateTime<Utc>>,
}

impl NewBond {
    /// Validate and materialise into a fresh bond with full availability
    pub fn into_bond(self) -> LedgerResult<Bond> {
        if self.tenor_days == 0 {
            return Err(LedgerError::InvalidBond {
                reason: "tenor must be at least one day".to_string(),
            });
        }
        if self.amount <= 0 {
            return Err(LedgerError::InvalidBond {
                reason: format!("amount {} must be positive", self.amount),
            });
        }
        if self.interest_rate.is_sign_negative() {
            return Err(LedgerError::InvalidBond {
                reason: format!("interest rate {} must not be negative", self.interest_rate),
            });
        }
        let maturity_date = self
            .maturity_date
            .unwrap_or_else(|| add_days(self.issue_date, self.tenor_days));
        if maturity_date <= self.issue_date {
            return Err(LedgerError::InvalidBond {
                reason: "maturity date must be after issue date".to_string(),
            });
        }

        Ok(Bond {
            id: BondId::new(),
            tenor_days: self.tenor_days,
            issue_date: self.issue_date,
            interest_rate: self.interest_rate,
            original_amount: self.amount,
            available_amount: self.amount,
            maturity_date,
            valid: true,
        })
    }
}

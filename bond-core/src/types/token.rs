//! Investment Token Types

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::common::{Amount, BondId, HoldingId, RateId, TokenId, UserId};

/// Token lifecycle state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenState {
    Active,
    RedeemedEarly,
    Matured,
}

impl TokenState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::RedeemedEarly => "redeemed_early",
            Self::Matured => "matured",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "redeemed_early" => Some(Self::RedeemedEarly),
            "matured" => Some(Self::Matured),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Active)
    }
}

impl std::fmt::Display for TokenState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A user's claim on one fragment of one bond
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvestmentToken {
    pub id: TokenId,
    /// Shared by every fragment created by the same purchase
    pub holding_id: HoldingId,
    pub user_id: UserId,
    pub bond_id: BondId,
    pub rate_id: RateId,
    /// Rate snapshot (percent per annum) taken at purchase
    pub interest_rate: Decimal,
    pub amount_invested: Amount,
    pub tenor_days: u32,
    pub investment_date: DateTime<Utc>,
    pub maturity_date: DateTime<Utc>,
    pub state: TokenState,
}

impl InvestmentToken {
    /// Spec-level `valid` flag
    pub fn is_valid(&self) -> bool {
        self.state == TokenState::Active
    }

    pub fn is_matured_at(&self, now: DateTime<Utc>) -> bool {
        self.maturity_date <= now
    }
}

/// Fragment receipt returned to the purchaser
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenFragment {
    pub token_id: TokenId,
    pub bond_id: BondId,
    pub amount_used: Amount,
}

/// Result of a committed purchase
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PurchaseReceipt {
    pub holding_id: HoldingId,
    pub user_id: UserId,
    pub amount: Amount,
    pub tenor_days: u32,
    pub interest_rate: Decimal,
    pub investment_date: DateTime<Utc>,
    pub maturity_date: DateTime<Utc>,
    pub fragments: Vec<TokenFragment>,
    pub balance_after: Amount,
}

/// Result of a committed early redemption
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RedemptionReceipt {
    pub holding_id: HoldingId,
    pub user_id: UserId,
    pub principal: Amount,
    pub payout: Amount,
    pub tokens_redeemed: Vec<TokenId>,
    pub redeemed_at: DateTime<Utc>,
    pub balance_after: Amount,
}

/// User-facing view of one holding
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HoldingView {
    pub holding_id: HoldingId,
    pub principal: Amount,
    pub interest_rate: Decimal,
    pub tenor_days: u32,
    pub investment_date: DateTime<Utc>,
    pub maturity_date: DateTime<Utc>,
    /// Gross indicative value before tax and fees
    pub current_value: Amount,
    pub fragments: usize,
}

//! Account and Withdrawal Types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::common::{Amount, UserId, WithdrawalId};

/// User account (digital wallet)
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAccount {
    pub id: UserId,
    pub balance: Amount,
    /// Set iff exactly one withdrawal request is outstanding
    pub pending_withdrawal_request_id: Option<WithdrawalId>,
    pub created_at: DateTime<Utc>,
}

impl UserAccount {
    pub fn new(id: UserId, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            balance: 0,
            pending_withdrawal_request_id: None,
            created_at,
        }
    }

    pub fn has_pending_withdrawal(&self) -> bool {
        self.pending_withdrawal_request_id.is_some()
    }
}

/// Money-out request; funds leave the ledger when it is created
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawalRequest {
    pub id: WithdrawalId,
    pub user_id: UserId,
    pub amount: Amount,
    pub request_date: DateTime<Utc>,
    /// False once an operator resolved the external payout
    pub valid: bool,
    pub resolved_at: Option<DateTime<Utc>>,
}

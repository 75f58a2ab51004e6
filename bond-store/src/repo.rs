//! Ledger Store Contract
//!
//! One method per economic event. Every mutating method is a single atomic
//! unit: it either commits all of its effects or none of them.

use async_trait::async_trait;
use bond_core::*;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A validated purchase ready to be allocated
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseOrder {
    pub user_id: UserId,
    pub amount: Amount,
    pub tenor_days: u32,
    pub now: DateTime<Utc>,
}

/// Transactional ledger storage
#[async_trait]
pub trait LedgerStore: Send + Sync {
    // ==================== Accounts ====================

    /// Create an empty account; `AccountExists` if the id is taken
    async fn open_account(&self, user_id: UserId, now: DateTime<Utc>) -> LedgerResult<UserAccount>;

    async fn get_account(&self, user_id: &UserId) -> LedgerResult<Option<UserAccount>>;

    /// Add funds to an account (operator deposit)
    async fn credit_balance(&self, user_id: &UserId, amount: Amount) -> LedgerResult<UserAccount>;

    // ==================== Rates ====================

    async fn append_interest_rate(&self, record: InterestRateRecord) -> LedgerResult<InterestRateRecord>;

    /// Most recent record by effective date
    async fn current_interest_rate(&self) -> LedgerResult<Option<InterestRateRecord>>;

    // ==================== Bonds ====================

    /// Insert freshly issued bonds (all or none)
    async fn issue_bonds(&self, bonds: Vec<Bond>) -> LedgerResult<Vec<Bond>>;

    async fn get_bond(&self, bond_id: &BondId) -> LedgerResult<Option<Bond>>;

    /// Valid bonds in waterfall order
    async fn list_active_bonds(&self) -> LedgerResult<Vec<Bond>>;

    // ==================== Economic events ====================

    /// Allocate, create tokens, decrement inventory and debit the buyer
    async fn purchase(&self, order: PurchaseOrder) -> LedgerResult<PurchaseReceipt>;

    /// Close a holding early, replenish its bonds and credit the payout
    async fn redeem_early(
        &self,
        user_id: &UserId,
        holding_id: &HoldingId,
        now: DateTime<Utc>,
    ) -> LedgerResult<RedemptionReceipt>;

    /// Settle every active token matured at `now` and retire matured bonds.
    /// Returns `Skipped` when another run holds the settlement lock.
    async fn settle_matured(&self, now: DateTime<Utc>) -> LedgerResult<SettlementOutcome>;

    // ==================== Withdrawals ====================

    /// Debit the account and record the request, if none is pending
    async fn request_withdrawal(
        &self,
        user_id: &UserId,
        amount: Amount,
        now: DateTime<Utc>,
    ) -> LedgerResult<WithdrawalRequest>;

    /// Close a pending request and clear the account pointer
    async fn resolve_withdrawal(
        &self,
        request_id: &WithdrawalId,
        now: DateTime<Utc>,
    ) -> LedgerResult<WithdrawalRequest>;

    async fn get_withdrawal(&self, request_id: &WithdrawalId) -> LedgerResult<Option<WithdrawalRequest>>;

    async fn get_pending_withdrawal(&self, user_id: &UserId) -> LedgerResult<Option<WithdrawalRequest>>;

    async fn list_pending_withdrawals(&self) -> LedgerResult<Vec<WithdrawalRequest>>;

    // ==================== Tokens ====================

    async fn list_user_tokens(&self, user_id: &UserId, active_only: bool) -> LedgerResult<Vec<InvestmentToken>>;

    async fn list_active_tokens(&self) -> LedgerResult<Vec<InvestmentToken>>;

    async fn list_tokens_invested_since(&self, since: DateTime<Utc>) -> LedgerResult<Vec<InvestmentToken>>;
}

/// Receipt fragments in creation order
pub(crate) fn fragments_of(tokens: &[InvestmentToken]) -> Vec<TokenFragment> {
    tokens
        .iter()
        .map(|t| TokenFragment {
            token_id: t.id,
            bond_id: t.bond_id,
            amount_used: t.amount_invested,
        })
        .collect()
}

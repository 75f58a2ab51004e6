//! In-memory Ledger Store
//!
//! Every mutation runs against a clone of the whole state and is swapped in
//! only after the closure succeeds and the ledger invariants hold, so a
//! failing step leaves nothing behind. Used by tests and development.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use bond_core::lifecycle;
use bond_core::*;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::repo::{fragments_of, LedgerStore, PurchaseOrder};

/// Full ledger snapshot
#[derive(Clone, Debug, Default)]
pub struct LedgerState {
    pub accounts: BTreeMap<UserId, UserAccount>,
    pub bonds: BTreeMap<BondId, Bond>,
    pub tokens: BTreeMap<TokenId, InvestmentToken>,
    pub rates: Vec<InterestRateRecord>,
    pub withdrawals: BTreeMap<WithdrawalId, WithdrawalRequest>,
}

impl LedgerState {
    /// Check every cross-entity invariant
    pub fn verify(&self) -> LedgerResult<()> {
        lifecycle::verify_inventory(self.bonds.values(), self.tokens.values())?;
        lifecycle::verify_accounts(self.accounts.values(), self.withdrawals.values())
    }

    fn account_mut(&mut self, user_id: &UserId) -> LedgerResult<&mut UserAccount> {
        self.accounts
            .get_mut(user_id)
            .ok_or_else(|| LedgerError::AccountNotFound {
                user_id: user_id.to_string(),
            })
    }

    fn bond_mut(&mut self, bond_id: &BondId) -> LedgerResult<&mut Bond> {
        self.bonds
            .get_mut(bond_id)
            .ok_or_else(|| LedgerError::invariant("bond_reference", format!("bond {} missing", bond_id)))
    }

    fn apply_payout(&mut self, plan: &PayoutPlan, closing: TokenState) -> LedgerResult<()> {
        for token_id in &plan.token_ids {
            let token = self
                .tokens
                .get_mut(token_id)
                .ok_or_else(|| LedgerError::invariant("token_reference", format!("token {} missing", token_id)))?;
            lifecycle::close_token(token, closing)?;
        }
        for (bond_id, amount) in &plan.replenishments {
            lifecycle::replenish(self.bond_mut(bond_id)?, *amount)?;
        }
        for (user_id, amount) in &plan.credits {
            lifecycle::credit(self.account_mut(user_id)?, *amount)?;
        }
        Ok(())
    }
}

/// Memory-backed ledger store
#[derive(Debug, Default)]
pub struct MemoryLedgerStore {
    state: Mutex<LedgerState>,
    engine: AllocationEngine,
    planner: SettlementPlanner,
    settling: AtomicBool,
    fail_next_commits: AtomicU32,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fees(fees: FeeSchedule) -> Self {
        Self {
            planner: SettlementPlanner::new(AccrualCalculator::new(fees)),
            ..Self::default()
        }
    }

    /// Make the next `n` commits fail after all steps have run, forcing a
    /// rollback
    pub fn fail_next_commits(&self, n: u32) {
        self.fail_next_commits.store(n, Ordering::SeqCst);
    }

    /// Clone of the committed state
    pub async fn snapshot(&self) -> LedgerState {
        self.state.lock().await.clone()
    }

    pub async fn clear(&self) {
        *self.state.lock().await = LedgerState::default();
    }

    fn take_injected_failure(&self) -> bool {
        self.fail_next_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Run `f` as one transaction
    async fn transact<T, F>(&self, op: &'static str, f: F) -> LedgerResult<T>
    where
        F: FnOnce(&mut LedgerState) -> LedgerResult<T>,
    {
        let mut committed = self.state.lock().await;
        let mut draft = committed.clone();
        let out = f(&mut draft)?;
        draft.verify()?;
        if self.take_injected_failure() {
            debug!(op, "injected commit failure");
            return Err(LedgerError::storage(format!("{}: injected commit failure", op), false));
        }
        *committed = draft;
        Ok(out)
    }

    async fn read<T, F>(&self, f: F) -> T
    where
        F: FnOnce(&LedgerState) -> T,
    {
        let state = self.state.lock().await;
        f(&state)
    }
}

struct SettlingGuard<'a>(&'a AtomicBool);

impl Drop for SettlingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn open_account(&self, user_id: UserId, now: DateTime<Utc>) -> LedgerResult<UserAccount> {
        self.transact("open_account", |state| {
            if state.accounts.contains_key(&user_id) {
                return Err(LedgerError::AccountExists {
                    user_id: user_id.to_string(),
                });
            }
            let account = UserAccount::new(user_id, now);
            state.accounts.insert(user_id, account.clone());
            Ok(account)
        })
        .await
    }

    async fn get_account(&self, user_id: &UserId) -> LedgerResult<Option<UserAccount>> {
        Ok(self.read(|s| s.accounts.get(user_id).cloned()).await)
    }

    async fn credit_balance(&self, user_id: &UserId, amount: Amount) -> LedgerResult<UserAccount> {
        if amount <= 0 {
            return Err(LedgerError::InvalidTransferAmount { amount });
        }
        self.transact("credit_balance", |state| {
            let account = state.account_mut(user_id)?;
            lifecycle::credit(account, amount)?;
            Ok(account.clone())
        })
        .await
    }

    async fn append_interest_rate(&self, record: InterestRateRecord) -> LedgerResult<InterestRateRecord> {
        self.transact("append_interest_rate", |state| {
            state.rates.push(record.clone());
            Ok(record)
        })
        .await
    }

    async fn current_interest_rate(&self) -> LedgerResult<Option<InterestRateRecord>> {
        Ok(self.read(|s| current_rate(&s.rates).cloned()).await)
    }

    async fn issue_bonds(&self, bonds: Vec<Bond>) -> LedgerResult<Vec<Bond>> {
        self.transact("issue_bonds", |state| {
            for bond in &bonds {
                if state.bonds.contains_key(&bond.id) {
                    return Err(LedgerError::InvalidBond {
                        reason: format!("bond {} already issued", bond.id),
                    });
                }
                state.bonds.insert(bond.id, bond.clone());
            }
            Ok(bonds)
        })
        .await
    }

    async fn get_bond(&self, bond_id: &BondId) -> LedgerResult<Option<Bond>> {
        Ok(self.read(|s| s.bonds.get(bond_id).cloned()).await)
    }

    async fn list_active_bonds(&self) -> LedgerResult<Vec<Bond>> {
        Ok(self
            .read(|s| {
                let mut bonds: Vec<Bond> = s.bonds.values().filter(|b| b.valid).cloned().collect();
                bonds.sort_by_key(AllocationEngine::candidate_key);
                bonds
            })
            .await)
    }

    async fn purchase(&self, order: PurchaseOrder) -> LedgerResult<PurchaseReceipt> {
        let engine = self.engine;
        let receipt = self
            .transact("purchase", |state| {
                let rate = current_rate(&state.rates)
                    .cloned()
                    .ok_or(LedgerError::NoInterestRate)?;
                let balance = state.account_mut(&order.user_id)?.balance;
                if balance < order.amount {
                    return Err(LedgerError::InsufficientFunds {
                        required: order.amount,
                        available: balance,
                    });
                }

                let plan = engine.allocate(state.bonds.values(), order.now, order.tenor_days, order.amount)?;
                for fragment in &plan.fragments {
                    lifecycle::consume(state.bond_mut(&fragment.bond_id)?, fragment.amount)?;
                }

                let terms = PurchaseTerms {
                    user_id: order.user_id,
                    holding_id: HoldingId::new(),
                    rate,
                    tenor_days: order.tenor_days,
                    investment_date: order.now,
                };
                let tokens = engine.build_tokens(&plan, &terms);
                for token in &tokens {
                    state.tokens.insert(token.id, token.clone());
                }

                let account = state.account_mut(&order.user_id)?;
                lifecycle::debit(account, order.amount)?;

                Ok(PurchaseReceipt {
                    holding_id: terms.holding_id,
                    user_id: order.user_id,
                    amount: order.amount,
                    tenor_days: order.tenor_days,
                    interest_rate: terms.rate.rate,
                    investment_date: order.now,
                    maturity_date: terms.maturity_date(),
                    fragments: fragments_of(&tokens),
                    balance_after: account.balance,
                })
            })
            .await?;

        info!(
            user = %receipt.user_id.short(),
            holding = %receipt.holding_id.short(),
            amount = receipt.amount,
            fragments = receipt.fragments.len(),
            "purchase committed"
        );
        Ok(receipt)
    }

    async fn redeem_early(
        &self,
        user_id: &UserId,
        holding_id: &HoldingId,
        now: DateTime<Utc>,
    ) -> LedgerResult<RedemptionReceipt> {
        let planner = &self.planner;
        self.transact("redeem_early", |state| {
            let tokens: Vec<InvestmentToken> = state
                .tokens
                .values()
                .filter(|t| &t.holding_id == holding_id && &t.user_id == user_id)
                .cloned()
                .collect();
            if tokens.is_empty() {
                return Err(LedgerError::HoldingNotFound {
                    holding_id: holding_id.to_string(),
                });
            }

            let plan = planner.plan_early_redemption(*holding_id, &tokens, now)?;
            state.apply_payout(&plan, TokenState::RedeemedEarly)?;

            let balance_after = state.account_mut(user_id)?.balance;
            Ok(RedemptionReceipt {
                holding_id: *holding_id,
                user_id: *user_id,
                principal: plan.total_principal(),
                payout: plan.total_payout(),
                tokens_redeemed: plan.token_ids,
                redeemed_at: now,
                balance_after,
            })
        })
        .await
    }

    async fn settle_matured(&self, now: DateTime<Utc>) -> LedgerResult<SettlementOutcome> {
        if self
            .settling
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(SettlementOutcome::Skipped);
        }
        let _guard = SettlingGuard(&self.settling);

        let planner = &self.planner;
        let report = self
            .transact("settle_matured", |state| {
                let matured: Vec<InvestmentToken> = state
                    .tokens
                    .values()
                    .filter(|t| t.is_valid() && t.is_matured_at(now))
                    .cloned()
                    .collect();
                let plan = planner.plan_maturity(&matured, now)?;
                state.apply_payout(&plan, TokenState::Matured)?;

                let retired: Vec<BondId> = state
                    .bonds
                    .values_mut()
                    .filter_map(|b| lifecycle::retire_if_matured(b, now).then_some(b.id))
                    .collect();

                Ok(SettlementReport::new(now, &plan, retired))
            })
            .await?;

        Ok(SettlementOutcome::Completed(report))
    }

    async fn request_withdrawal(
        &self,
        user_id: &UserId,
        amount: Amount,
        now: DateTime<Utc>,
    ) -> LedgerResult<WithdrawalRequest> {
        if amount <= 0 {
            return Err(LedgerError::InvalidTransferAmount { amount });
        }
        self.transact("request_withdrawal", |state| {
            let account = state.account_mut(user_id)?;
            if account.has_pending_withdrawal() {
                return Err(LedgerError::RequestAlreadyPending {
                    user_id: user_id.to_string(),
                });
            }
            lifecycle::debit(account, amount)?;

            let request = WithdrawalRequest {
                id: WithdrawalId::new(),
                user_id: *user_id,
                amount,
                request_date: now,
                valid: true,
                resolved_at: None,
            };
            account.pending_withdrawal_request_id = Some(request.id);
            state.withdrawals.insert(request.id, request.clone());
            Ok(request)
        })
        .await
    }

    async fn resolve_withdrawal(
        &self,
        request_id: &WithdrawalId,
        now: DateTime<Utc>,
    ) -> LedgerResult<WithdrawalRequest> {
        self.transact("resolve_withdrawal", |state| {
            let request = state
                .withdrawals
                .get_mut(request_id)
                .ok_or_else(|| LedgerError::WithdrawalNotFound {
                    request_id: request_id.to_string(),
                })?;
            if !request.valid {
                return Err(LedgerError::WithdrawalAlreadyResolved {
                    request_id: request_id.to_string(),
                });
            }
            request.valid = false;
            request.resolved_at = Some(now);
            let resolved = request.clone();

            let account = state.account_mut(&resolved.user_id)?;
            if account.pending_withdrawal_request_id != Some(*request_id) {
                return Err(LedgerError::invariant(
                    "withdrawal_pointer",
                    format!("account {} does not point at request {}", account.id, request_id),
                ));
            }
            account.pending_withdrawal_request_id = None;
            Ok(resolved)
        })
        .await
    }

    async fn get_withdrawal(&self, request_id: &WithdrawalId) -> LedgerResult<Option<WithdrawalRequest>> {
        Ok(self.read(|s| s.withdrawals.get(request_id).cloned()).await)
    }

    async fn get_pending_withdrawal(&self, user_id: &UserId) -> LedgerResult<Option<WithdrawalRequest>> {
        Ok(self
            .read(|s| {
                s.accounts
                    .get(user_id)
                    .and_then(|a| a.pending_withdrawal_request_id)
                    .and_then(|id| s.withdrawals.get(&id).cloned())
            })
            .await)
    }

    async fn list_pending_withdrawals(&self) -> LedgerResult<Vec<WithdrawalRequest>> {
        Ok(self
            .read(|s| {
                let mut pending: Vec<WithdrawalRequest> =
                    s.withdrawals.values().filter(|r| r.valid).cloned().collect();
                pending.sort_by_key(|r| (r.request_date, r.id));
                pending
            })
            .await)
    }

    async fn list_user_tokens(&self, user_id: &UserId, active_only: bool) -> LedgerResult<Vec<InvestmentToken>> {
        Ok(self
            .read(|s| {
                let mut tokens: Vec<InvestmentToken> = s
                    .tokens
                    .values()
                    .filter(|t| &t.user_id == user_id && (!active_only || t.is_valid()))
                    .cloned()
                    .collect();
                tokens.sort_by_key(|t| (t.investment_date, t.holding_id, t.id));
                tokens
            })
            .await)
    }

    async fn list_active_tokens(&self) -> LedgerResult<Vec<InvestmentToken>> {
        Ok(self
            .read(|s| {
                let mut tokens: Vec<InvestmentToken> =
                    s.tokens.values().filter(|t| t.is_valid()).cloned().collect();
                tokens.sort_by_key(|t| (t.investment_date, t.holding_id, t.id));
                tokens
            })
            .await)
    }

    async fn list_tokens_invested_since(&self, since: DateTime<Utc>) -> LedgerResult<Vec<InvestmentToken>> {
        Ok(self
            .read(|s| {
                let mut tokens: Vec<InvestmentToken> = s
                    .tokens
                    .values()
                    .filter(|t| t.investment_date >= since)
                    .cloned()
                    .collect();
                tokens.sort_by_key(|t| (t.investment_date, t.holding_id, t.id));
                tokens
            })
            .await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[tokio::test]
    async fn test_transact_rolls_back_on_error() {
        let store = MemoryLedgerStore::new();
        let user = UserId::new();
        store.open_account(user, t0()).await.unwrap();

        let err = store
            .transact("test", |state| {
                lifecycle::credit(state.account_mut(&user)?, 1_000)?;
                Err::<(), _>(LedgerError::invariant("test", "abort"))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvariantViolation { .. }));
        assert_eq!(store.get_account(&user).await.unwrap().unwrap().balance, 0);
    }

    #[tokio::test]
    async fn test_transact_rejects_broken_invariants() {
        let store = MemoryLedgerStore::new();
        let bond = NewBond {
            tenor_days: 90,
            issue_date: t0(),
            interest_rate: dec!(20),
            amount: 1_000,
            maturity_date: None,
        }
        .into_bond()
        .unwrap();
        let id = bond.id;
        store.issue_bonds(vec![bond]).await.unwrap();

        let err = store
            .transact("test", |state| {
                state.bond_mut(&id)?.available_amount = 500;
                Ok(())
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert_eq!(store.get_bond(&id).await.unwrap().unwrap().available_amount, 1_000);
    }

    #[tokio::test]
    async fn test_injected_failure_is_consumed() {
        let store = MemoryLedgerStore::new();
        store.fail_next_commits(1);
        assert!(store.open_account(UserId::new(), t0()).await.is_err());
        assert!(store.open_account(UserId::new(), t0()).await.is_ok());
        assert_eq!(store.snapshot().await.accounts.len(), 1);
    }

    #[tokio::test]
    async fn test_current_rate_is_latest() {
        let store = MemoryLedgerStore::new();
        assert!(store.current_interest_rate().await.unwrap().is_none());
        store
            .append_interest_rate(InterestRateRecord::new(t0(), dec!(12)).unwrap())
            .await
            .unwrap();
        store
            .append_interest_rate(InterestRateRecord::new(t0() + Duration::days(1), dec!(13)).unwrap())
            .await
            .unwrap();
        assert_eq!(store.current_interest_rate().await.unwrap().unwrap().rate, dec!(13));
    }
}

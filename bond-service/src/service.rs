//! Ledger Service
//!
//! Entry point for every ledger operation. Each call resolves the caller,
//! checks the role, validates the request against the product rules before
//! any transaction opens, and then hands exactly one economic event to the
//! store. Selected failures are reported to the `Logging` group.

use std::future::Future;
use std::sync::Arc;

use bond_core::*;
use bond_store::{LedgerStore, PurchaseOrder};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::json;
use tracing::{error, info, warn};

use crate::auth::{Caller, IdentityResolver, Role};
use crate::clock::Clock;
use crate::notify::{Notifier, RecipientGroup};
use crate::reports::{
    start_of_day, summarize_holdings, HoldingsReport, PurchasesReport, WithdrawalsReport, HOLDINGS_SUBJECT,
    PURCHASES_SUBJECT, SETTLEMENT_SUBJECT, WITHDRAWALS_SUBJECT,
};

/// Ledger operations facade
pub struct LedgerService<S: LedgerStore + 'static> {
    store: Arc<S>,
    identity: Arc<dyn IdentityResolver>,
    clock: Arc<dyn Clock>,
    notifier: Notifier,
    rules: ProductRules,
    calculator: AccrualCalculator,
}

impl<S: LedgerStore + 'static> Clone for LedgerService<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            identity: self.identity.clone(),
            clock: self.clock.clone(),
            notifier: self.notifier.clone(),
            rules: self.rules.clone(),
            calculator: self.calculator.clone(),
        }
    }
}

impl<S: LedgerStore + 'static> LedgerService<S> {
    pub fn new(
        store: Arc<S>,
        identity: Arc<dyn IdentityResolver>,
        clock: Arc<dyn Clock>,
        notifier: Notifier,
        rules: ProductRules,
        fees: FeeSchedule,
    ) -> Self {
        Self {
            store,
            identity,
            clock,
            notifier,
            rules,
            calculator: AccrualCalculator::new(fees),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    pub fn rules(&self) -> &ProductRules {
        &self.rules
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    async fn authorize(&self, credential: &str, required: Role, operation: &str) -> LedgerResult<Caller> {
        let caller = match self.identity.resolve(credential).await {
            Ok(caller) => caller,
            Err(e) => {
                warn!(operation, "Rejected unauthenticated caller");
                return Err(e);
            }
        };
        if let Err(e) = caller.require(required, operation) {
            warn!(operation, subject = %caller.subject_id.short(), role = %caller.role, "Rejected caller role");
            return Err(e);
        }
        Ok(caller)
    }

    async fn authenticate(&self, credential: &str, operation: &str) -> LedgerResult<Caller> {
        self.identity.resolve(credential).await.map_err(|e| {
            warn!(operation, "Rejected unauthenticated caller");
            e
        })
    }

    /// Log the outcome and push operator-relevant failures to `Logging`
    async fn observe<T, Fut>(&self, operation: &'static str, fut: Fut) -> LedgerResult<T>
    where
        Fut: Future<Output = LedgerResult<T>>,
    {
        let result = fut.await;
        if let Err(e) = &result {
            match e.kind() {
                ErrorKind::StorageFailure | ErrorKind::Internal => {
                    error!(operation, code = e.code(), error = %e, "Ledger operation failed");
                }
                _ => warn!(operation, code = e.code(), error = %e, "Ledger operation rejected"),
            }
            if matches!(
                e.kind(),
                ErrorKind::StorageFailure | ErrorKind::Internal | ErrorKind::InsufficientInventory
            ) {
                self.notifier.publish_json(
                    RecipientGroup::Logging,
                    format!("{} failed", operation),
                    &json!({
                        "operation": operation,
                        "code": e.code(),
                        "kind": e.kind().to_string(),
                        "message": e.to_string(),
                        "retryable": e.is_retryable(),
                    }),
                );
            }
        }
        result
    }

    // ==================== User operations ====================

    /// Buy `amount` for `tenor_days` at the current platform rate
    pub async fn purchase(&self, credential: &str, amount: Amount, tenor_days: u32) -> LedgerResult<PurchaseReceipt> {
        let caller = self.authorize(credential, Role::User, "purchase").await?;
        self.observe("purchase", async {
            self.rules.validate_purchase(amount, tenor_days)?;
            self.store
                .purchase(PurchaseOrder {
                    user_id: caller.subject_id,
                    amount,
                    tenor_days,
                    now: self.clock.now(),
                })
                .await
        })
        .await
    }

    /// Redeem one of the caller's holdings before maturity
    pub async fn redeem(&self, credential: &str, holding_id: &HoldingId) -> LedgerResult<RedemptionReceipt> {
        let caller = self.authorize(credential, Role::User, "redeem").await?;
        self.observe("redeem", async {
            self.store
                .redeem_early(&caller.subject_id, holding_id, self.clock.now())
                .await
        })
        .await
    }

    pub async fn request_withdrawal(&self, credential: &str, amount: Amount) -> LedgerResult<WithdrawalRequest> {
        let caller = self.authorize(credential, Role::User, "request_withdrawal").await?;
        self.observe("request_withdrawal", async {
            self.rules.validate_transfer(amount)?;
            self.store
                .request_withdrawal(&caller.subject_id, amount, self.clock.now())
                .await
        })
        .await
    }

    pub async fn balance(&self, credential: &str) -> LedgerResult<Amount> {
        let caller = self.authorize(credential, Role::User, "balance").await?;
        self.observe("balance", async {
            self.store
                .get_account(&caller.subject_id)
                .await?
                .map(|account| account.balance)
                .ok_or_else(|| LedgerError::AccountNotFound {
                    user_id: caller.subject_id.to_string(),
                })
        })
        .await
    }

    /// Open to any authenticated caller
    pub async fn current_rate(&self, credential: &str) -> LedgerResult<InterestRateRecord> {
        self.authenticate(credential, "current_rate").await?;
        self.observe("current_rate", async {
            self.store
                .current_interest_rate()
                .await?
                .ok_or(LedgerError::NoInterestRate)
        })
        .await
    }

    /// Caller's active holdings with their indicative value
    pub async fn holdings(&self, credential: &str) -> LedgerResult<Vec<HoldingView>> {
        let caller = self.authorize(credential, Role::User, "holdings").await?;
        self.observe("holdings", async {
            let tokens = self.store.list_user_tokens(&caller.subject_id, true).await?;
            summarize_holdings(&tokens, &self.calculator, self.clock.now())
        })
        .await
    }

    pub async fn pending_withdrawal(&self, credential: &str) -> LedgerResult<Option<WithdrawalRequest>> {
        let caller = self.authorize(credential, Role::User, "pending_withdrawal").await?;
        self.observe("pending_withdrawal", async {
            self.store.get_pending_withdrawal(&caller.subject_id).await
        })
        .await
    }

    // ==================== Operator operations ====================

    pub async fn open_account(&self, credential: &str, user_id: UserId) -> LedgerResult<UserAccount> {
        self.authorize(credential, Role::Admin, "open_account").await?;
        self.observe("open_account", async {
            self.store.open_account(user_id, self.clock.now()).await
        })
        .await
    }

    pub async fn deposit(&self, credential: &str, user_id: &UserId, amount: Amount) -> LedgerResult<UserAccount> {
        self.authorize(credential, Role::Admin, "deposit").await?;
        self.observe("deposit", async {
            self.rules.validate_transfer(amount)?;
            let account = self.store.credit_balance(user_id, amount).await?;
            info!(user = %user_id.short(), amount, balance = account.balance, "Deposit credited");
            Ok(account)
        })
        .await
    }

    /// Append a rate record; `effective_date` defaults to now
    pub async fn publish_rate(
        &self,
        credential: &str,
        rate: Decimal,
        effective_date: Option<DateTime<Utc>>,
    ) -> LedgerResult<InterestRateRecord> {
        self.authorize(credential, Role::Admin, "publish_rate").await?;
        self.observe("publish_rate", async {
            let record = InterestRateRecord::new(effective_date.unwrap_or_else(|| self.clock.now()), rate)?;
            self.store.append_interest_rate(record).await
        })
        .await
    }

    /// Validate every bond first, then insert them as one unit
    pub async fn issue_bonds(&self, credential: &str, requests: Vec<NewBond>) -> LedgerResult<Vec<Bond>> {
        self.authorize(credential, Role::Admin, "issue_bonds").await?;
        self.observe("issue_bonds", async {
            if requests.is_empty() {
                return Err(LedgerError::InvalidBond {
                    reason: "no bonds in request".to_string(),
                });
            }
            let bonds = requests
                .into_iter()
                .map(NewBond::into_bond)
                .collect::<LedgerResult<Vec<_>>>()?;
            self.store.issue_bonds(bonds).await
        })
        .await
    }

    pub async fn active_bonds(&self, credential: &str) -> LedgerResult<Vec<Bond>> {
        self.authorize(credential, Role::Admin, "active_bonds").await?;
        self.observe("active_bonds", self.store.list_active_bonds()).await
    }

    pub async fn pending_withdrawals(&self, credential: &str) -> LedgerResult<Vec<WithdrawalRequest>> {
        self.authorize(credential, Role::Admin, "pending_withdrawals").await?;
        self.observe("pending_withdrawals", self.store.list_pending_withdrawals())
            .await
    }

    pub async fn resolve_withdrawal(
        &self,
        credential: &str,
        request_id: &WithdrawalId,
    ) -> LedgerResult<WithdrawalRequest> {
        self.authorize(credential, Role::Admin, "resolve_withdrawal").await?;
        self.observe("resolve_withdrawal", async {
            self.store.resolve_withdrawal(request_id, self.clock.now()).await
        })
        .await
    }

    // ==================== System operations ====================

    /// Run one settlement pass and report it when it did anything
    pub async fn settle(&self) -> LedgerResult<SettlementOutcome> {
        let now = self.clock.now();
        let outcome = self
            .observe("settlement", self.store.settle_matured(now))
            .await?;
        if let SettlementOutcome::Completed(report) = &outcome {
            if !report.is_empty() {
                self.notifier
                    .publish_json(RecipientGroup::Reporting, SETTLEMENT_SUBJECT, report);
            }
        }
        Ok(outcome)
    }

    /// Build and push the periodic operator reports
    pub async fn publish_reports(&self) -> LedgerResult<()> {
        let now = self.clock.now();
        self.observe("reports", async {
            let active = self.store.list_active_tokens().await?;
            let holdings = HoldingsReport::build(&active, &self.calculator, now)?;

            let since = start_of_day(now);
            let bought = self.store.list_tokens_invested_since(since).await?;
            let purchases = PurchasesReport::build(&bought, since, now);

            let pending = self.store.list_pending_withdrawals().await?;
            let withdrawals = WithdrawalsReport::build(pending, now);

            info!(
                holdings = holdings.holdings.len(),
                purchases = purchases.purchases.len(),
                withdrawals = withdrawals.requests.len(),
                "Publishing operator reports"
            );
            self.notifier
                .publish_json(RecipientGroup::Reporting, HOLDINGS_SUBJECT, &holdings);
            self.notifier
                .publish_json(RecipientGroup::Reporting, PURCHASES_SUBJECT, &purchases);
            self.notifier
                .publish_json(RecipientGroup::Reporting, WITHDRAWALS_SUBJECT, &withdrawals);
            Ok(())
        })
        .await
    }
}

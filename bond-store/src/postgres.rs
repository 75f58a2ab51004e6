//! PostgreSQL Ledger Store
//!
//! Each economic event runs in one explicit transaction. Counters are only
//! changed by WHERE-guarded updates in the same statement that reads them,
//! rows are locked in a fixed order (tokens, then bonds by id, then accounts
//! by id), and whole transactions are retried on serialization failures and
//! deadlocks. A failed COMMIT is only retried when the server reported why.

use std::time::Duration;

use async_trait::async_trait;
use bond_core::*;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{FromRow, Postgres, Transaction};
use tokio::time::sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{StoreError, StoreResult, SQLSTATE_UNIQUE_VIOLATION};
use crate::repo::{fragments_of, LedgerStore, PurchaseOrder};
use crate::schema;

/// Advisory lock key held by a settlement run for the length of its transaction
pub const SETTLEMENT_LOCK_KEY: i64 = 0x626f_6e64_5f73_6574;

/// Retry policy for whole transactions
#[derive(Clone, Copy, Debug)]
pub struct TxRetry {
    pub attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for TxRetry {
    fn default() -> Self {
        Self {
            attempts: 8,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(5_000),
        }
    }
}

/// Connection settings
#[derive(Clone, Debug)]
pub struct PgStoreOptions {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    pub retry: TxRetry,
}

impl PgStoreOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: 10,
            acquire_timeout: Duration::from_secs(10),
            retry: TxRetry::default(),
        }
    }
}

/// PostgreSQL-backed ledger store
#[derive(Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
    retry: TxRetry,
    engine: AllocationEngine,
    planner: SettlementPlanner,
}

// ============================================================
// Row mapping
// ============================================================

#[derive(FromRow)]
struct AccountRow {
    id: Uuid,
    balance: i64,
    pending_withdrawal_request_id: Option<Uuid>,
    created_at: DateTime<Utc>,
}

impl From<AccountRow> for UserAccount {
    fn from(row: AccountRow) -> Self {
        Self {
            id: UserId(row.id),
            balance: row.balance,
            pending_withdrawal_request_id: row.pending_withdrawal_request_id.map(WithdrawalId),
            created_at: row.created_at,
        }
    }
}

#[derive(FromRow)]
struct RateRow {
    id: Uuid,
    effective_date: DateTime<Utc>,
    rate: Decimal,
}

impl From<RateRow> for InterestRateRecord {
    fn from(row: RateRow) -> Self {
        Self {
            id: RateId(row.id),
            effective_date: row.effective_date,
            rate: row.rate,
        }
    }
}

#[derive(FromRow)]
struct BondRow {
    id: Uuid,
    tenor_days: i32,
    issue_date: DateTime<Utc>,
    interest_rate: Decimal,
    original_amount: i64,
    available_amount: i64,
    maturity_date: DateTime<Utc>,
    valid: bool,
}

impl TryFrom<BondRow> for Bond {
    type Error = StoreError;

    fn try_from(row: BondRow) -> StoreResult<Self> {
        Ok(Self {
            id: BondId(row.id),
            tenor_days: tenor_from_db(row.tenor_days)?,
            issue_date: row.issue_date,
            interest_rate: row.interest_rate,
            original_amount: row.original_amount,
            available_amount: row.available_amount,
            maturity_date: row.maturity_date,
            valid: row.valid,
        })
    }
}

#[derive(FromRow)]
struct TokenRow {
    id: Uuid,
    holding_id: Uuid,
    user_id: Uuid,
    bond_id: Uuid,
    rate_id: Uuid,
    interest_rate: Decimal,
    amount_invested: i64,
    tenor_days: i32,
    investment_date: DateTime<Utc>,
    maturity_date: DateTime<Utc>,
    state: String,
}

impl TryFrom<TokenRow> for InvestmentToken {
    type Error = StoreError;

    fn try_from(row: TokenRow) -> StoreResult<Self> {
        let state = TokenState::parse(&row.state)
            .ok_or_else(|| StoreError::serialization(format!("unknown token state '{}'", row.state)))?;
        Ok(Self {
            id: TokenId(row.id),
            holding_id: HoldingId(row.holding_id),
            user_id: UserId(row.user_id),
            bond_id: BondId(row.bond_id),
            rate_id: RateId(row.rate_id),
            interest_rate: row.interest_rate,
            amount_invested: row.amount_invested,
            tenor_days: tenor_from_db(row.tenor_days)?,
            investment_date: row.investment_date,
            maturity_date: row.maturity_date,
            state,
        })
    }
}

#[derive(FromRow)]
struct WithdrawalRow {
    id: Uuid,
    user_id: Uuid,
    amount: i64,
    request_date: DateTime<Utc>,
    valid: bool,
    resolved_at: Option<DateTime<Utc>>,
}

impl From<WithdrawalRow> for WithdrawalRequest {
    fn from(row: WithdrawalRow) -> Self {
        Self {
            id: WithdrawalId(row.id),
            user_id: UserId(row.user_id),
            amount: row.amount,
            request_date: row.request_date,
            valid: row.valid,
            resolved_at: row.resolved_at,
        }
    }
}

fn tenor_from_db(value: i32) -> StoreResult<u32> {
    u32::try_from(value).map_err(|_| StoreError::serialization(format!("negative tenor {}", value)))
}

fn tenor_to_db(value: u32) -> LedgerResult<i32> {
    i32::try_from(value).map_err(|_| LedgerError::UnsupportedTenor { tenor_days: value })
}

fn db(err: sqlx::Error) -> LedgerError {
    StoreError::from(err).into()
}

/// COMMIT errors never feed the retry loop unless the server rejected them
fn commit_failed(err: sqlx::Error) -> LedgerError {
    let err = StoreError::from_commit(err);
    if !err.is_retryable() {
        warn!(error = %err, "commit failed; transaction outcome must be reconciled");
    }
    err.into()
}

fn tokens_from_rows(rows: Vec<TokenRow>) -> LedgerResult<Vec<InvestmentToken>> {
    rows.into_iter()
        .map(|r| InvestmentToken::try_from(r).map_err(LedgerError::from))
        .collect()
}

const ACCOUNT_COLUMNS_RETURNING: &str = "RETURNING id, balance, pending_withdrawal_request_id, created_at";

const SELECT_TOKENS: &str = "SELECT id, holding_id, user_id, bond_id, rate_id, interest_rate, amount_invested, \
     tenor_days, investment_date, maturity_date, state FROM investment_tokens";

const SELECT_BONDS: &str = "SELECT id, tenor_days, issue_date, interest_rate, original_amount, available_amount, \
     maturity_date, valid FROM bonds";

const LOCK_CANDIDATE_BONDS: &str =
    "WHERE valid AND maturity_date >= $1 AND available_amount > 0 ORDER BY id FOR UPDATE";

const SELECT_WITHDRAWALS: &str =
    "SELECT id, user_id, amount, request_date, valid, resolved_at FROM withdrawal_requests";

// ============================================================
// Store
// ============================================================

impl PgLedgerStore {
    /// Connect a pool and build the store
    pub async fn connect(options: &PgStoreOptions, fees: FeeSchedule) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(options.max_connections)
            .acquire_timeout(options.acquire_timeout)
            .connect(&options.url)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        info!(max_connections = options.max_connections, "connected to ledger database");
        Ok(Self::from_pool(pool, options.retry, fees))
    }

    pub fn from_pool(pool: PgPool, retry: TxRetry, fees: FeeSchedule) -> Self {
        Self {
            pool,
            retry,
            engine: AllocationEngine::new(),
            planner: SettlementPlanner::new(AccrualCalculator::new(fees)),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn init_schema(&self) -> StoreResult<()> {
        schema::apply_schema(&self.pool).await
    }

    /// Re-run `attempt` while it fails with a retryable storage error
    async fn retrying<'a, T, F>(&'a self, op: &'static str, mut attempt: F) -> LedgerResult<T>
    where
        F: FnMut() -> BoxFuture<'a, LedgerResult<T>> + Send + 'a,
        T: Send + 'a,
    {
        let mut tries = 0usize;
        let mut delay = self.retry.base_delay;
        loop {
            match attempt().await {
                Err(err) if err.is_retryable() && tries + 1 < self.retry.attempts => {
                    tries += 1;
                    warn!(op, attempt = tries, error = %err, "retrying ledger transaction");
                    sleep(delay.min(self.retry.max_delay)).await;
                    delay = delay.saturating_mul(2);
                }
                other => return other,
            }
        }
    }

    /// Close tokens, return principal to bonds and credit users, in lock order
    async fn apply_payout(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        plan: &PayoutPlan,
        closing: TokenState,
    ) -> LedgerResult<()> {
        let ids: Vec<Uuid> = plan.token_ids.iter().map(|t| t.0).collect();
        let closed = sqlx::query(
            "UPDATE investment_tokens SET state = $2 WHERE id = ANY($1) AND state = 'active'",
        )
        .bind(&ids)
        .bind(closing.as_str())
        .execute(&mut **tx)
        .await
        .map_err(db)?;
        if closed.rows_affected() != ids.len() as u64 {
            return Err(LedgerError::invariant(
                "token_transition",
                format!("closed {} of {} locked tokens", closed.rows_affected(), ids.len()),
            ));
        }

        for (bond_id, amount) in &plan.replenishments {
            let updated = sqlx::query(
                "UPDATE bonds SET available_amount = available_amount + $2 \
                 WHERE id = $1 AND valid AND available_amount + $2 <= original_amount",
            )
            .bind(bond_id.0)
            .bind(*amount)
            .execute(&mut **tx)
            .await
            .map_err(db)?;
            if updated.rows_affected() != 1 {
                return Err(LedgerError::invariant(
                    "bond_inventory",
                    format!("replenishing bond {} by {} exceeds its original amount", bond_id, amount),
                ));
            }
        }

        for (user_id, amount) in &plan.credits {
            let updated = sqlx::query("UPDATE user_accounts SET balance = balance + $2 WHERE id = $1")
                .bind(user_id.0)
                .bind(*amount)
                .execute(&mut **tx)
                .await
                .map_err(db)?;
            if updated.rows_affected() != 1 {
                return Err(LedgerError::invariant(
                    "account_reference",
                    format!("token owner {} has no account", user_id),
                ));
            }
        }
        Ok(())
    }

    async fn purchase_once(&self, order: PurchaseOrder) -> LedgerResult<PurchaseReceipt> {
        let mut tx = self.pool.begin().await.map_err(db)?;

        let rate: InterestRateRecord = sqlx::query_as::<_, RateRow>(
            "SELECT id, effective_date, rate FROM interest_rates \
             ORDER BY effective_date DESC, id DESC LIMIT 1",
        )
        .fetch_optional(&mut *tx)
        .await
        .map_err(db)?
        .ok_or(LedgerError::NoInterestRate)?
        .into();

        let balance: i64 = sqlx::query_scalar("SELECT balance FROM user_accounts WHERE id = $1")
            .bind(order.user_id.0)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db)?
            .ok_or_else(|| LedgerError::AccountNotFound {
                user_id: order.user_id.to_string(),
            })?;
        if balance < order.amount {
            return Err(LedgerError::InsufficientFunds {
                required: order.amount,
                available: balance,
            });
        }

        let horizon = add_days(order.now, order.tenor_days);
        // Locked in id order like every other bond write; the engine
        // re-sorts into waterfall order
        let rows: Vec<BondRow> = sqlx::query_as(&format!("{} {}", SELECT_BONDS, LOCK_CANDIDATE_BONDS))
            .bind(horizon)
            .fetch_all(&mut *tx)
            .await
            .map_err(db)?;
        let bonds = rows
            .into_iter()
            .map(Bond::try_from)
            .collect::<StoreResult<Vec<_>>>()?;

        let candidates = self.engine.candidates(&bonds, order.now, order.tenor_days);
        let plan = self.engine.plan(&candidates, order.amount)?;

        for fragment in &plan.fragments {
            let updated = sqlx::query(
                "UPDATE bonds SET available_amount = available_amount - $2 \
                 WHERE id = $1 AND valid AND available_amount >= $2",
            )
            .bind(fragment.bond_id.0)
            .bind(fragment.amount)
            .execute(&mut *tx)
            .await
            .map_err(db)?;
            if updated.rows_affected() != 1 {
                return Err(LedgerError::invariant(
                    "bond_inventory",
                    format!("bond {} changed under its row lock", fragment.bond_id),
                ));
            }
        }

        let terms = PurchaseTerms {
            user_id: order.user_id,
            holding_id: HoldingId::new(),
            rate,
            tenor_days: order.tenor_days,
            investment_date: order.now,
        };
        let tokens = self.engine.build_tokens(&plan, &terms);
        let tenor = tenor_to_db(order.tenor_days)?;
        for token in &tokens {
            sqlx::query(
                "INSERT INTO investment_tokens \
                 (id, holding_id, user_id, bond_id, rate_id, interest_rate, amount_invested, \
                  tenor_days, investment_date, maturity_date, state) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
            )
            .bind(token.id.0)
            .bind(token.holding_id.0)
            .bind(token.user_id.0)
            .bind(token.bond_id.0)
            .bind(token.rate_id.0)
            .bind(token.interest_rate)
            .bind(token.amount_invested)
            .bind(tenor)
            .bind(token.investment_date)
            .bind(token.maturity_date)
            .bind(token.state.as_str())
            .execute(&mut *tx)
            .await
            .map_err(db)?;
        }

        let balance_after: i64 = sqlx::query_scalar(
            "UPDATE user_accounts SET balance = balance - $2 \
             WHERE id = $1 AND balance >= $2 RETURNING balance",
        )
        .bind(order.user_id.0)
        .bind(order.amount)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db)?
        .ok_or(LedgerError::InsufficientFunds {
            required: order.amount,
            available: balance,
        })?;

        tx.commit().await.map_err(commit_failed)?;

        Ok(PurchaseReceipt {
            holding_id: terms.holding_id,
            user_id: order.user_id,
            amount: order.amount,
            tenor_days: order.tenor_days,
            interest_rate: terms.rate.rate,
            investment_date: order.now,
            maturity_date: terms.maturity_date(),
            fragments: fragments_of(&tokens),
            balance_after,
        })
    }

    async fn redeem_once(
        &self,
        user_id: UserId,
        holding_id: HoldingId,
        now: DateTime<Utc>,
    ) -> LedgerResult<RedemptionReceipt> {
        let mut tx = self.pool.begin().await.map_err(db)?;

        let rows: Vec<TokenRow> = sqlx::query_as(&format!(
            "{} WHERE holding_id = $1 AND user_id = $2 ORDER BY id FOR UPDATE",
            SELECT_TOKENS
        ))
        .bind(holding_id.0)
        .bind(user_id.0)
        .fetch_all(&mut *tx)
        .await
        .map_err(db)?;
        if rows.is_empty() {
            return Err(LedgerError::HoldingNotFound {
                holding_id: holding_id.to_string(),
            });
        }
        let tokens = tokens_from_rows(rows)?;

        let plan = self.planner.plan_early_redemption(holding_id, &tokens, now)?;
        self.apply_payout(&mut tx, &plan, TokenState::RedeemedEarly).await?;

        let balance_after: i64 = sqlx::query_scalar("SELECT balance FROM user_accounts WHERE id = $1")
            .bind(user_id.0)
            .fetch_one(&mut *tx)
            .await
            .map_err(db)?;

        tx.commit().await.map_err(commit_failed)?;

        Ok(RedemptionReceipt {
            holding_id,
            user_id,
            principal: plan.total_principal(),
            payout: plan.total_payout(),
            tokens_redeemed: plan.token_ids,
            redeemed_at: now,
            balance_after,
        })
    }

    async fn settle_once(&self, now: DateTime<Utc>) -> LedgerResult<SettlementOutcome> {
        let mut tx = self.pool.begin().await.map_err(db)?;

        let locked: bool = sqlx::query_scalar("SELECT pg_try_advisory_xact_lock($1)")
            .bind(SETTLEMENT_LOCK_KEY)
            .fetch_one(&mut *tx)
            .await
            .map_err(db)?;
        if !locked {
            debug!("settlement lock held elsewhere");
            return Ok(SettlementOutcome::Skipped);
        }

        let rows: Vec<TokenRow> = sqlx::query_as(&format!(
            "{} WHERE state = 'active' AND maturity_date <= $1 ORDER BY id FOR UPDATE",
            SELECT_TOKENS
        ))
        .bind(now)
        .fetch_all(&mut *tx)
        .await
        .map_err(db)?;
        let tokens = tokens_from_rows(rows)?;

        let plan = self.planner.plan_maturity(&tokens, now)?;
        if !plan.is_empty() {
            self.apply_payout(&mut tx, &plan, TokenState::Matured).await?;
        }

        let retired: Vec<Uuid> = sqlx::query_scalar(
            "UPDATE bonds SET valid = FALSE WHERE valid AND maturity_date <= $1 RETURNING id",
        )
        .bind(now)
        .fetch_all(&mut *tx)
        .await
        .map_err(db)?;

        tx.commit().await.map_err(commit_failed)?;

        let report = SettlementReport::new(now, &plan, retired.into_iter().map(BondId).collect());
        Ok(SettlementOutcome::Completed(report))
    }

    async fn request_withdrawal_once(
        &self,
        user_id: UserId,
        amount: Amount,
        now: DateTime<Utc>,
    ) -> LedgerResult<WithdrawalRequest> {
        let mut tx = self.pool.begin().await.map_err(db)?;
        let request_id = WithdrawalId::new();

        let created = sqlx::query_as::<_, WithdrawalRow>(
            r#"
            WITH debited AS (
                UPDATE user_accounts
                   SET balance = balance - $2,
                       pending_withdrawal_request_id = $3
                 WHERE id = $1
                   AND balance >= $2
                   AND pending_withdrawal_request_id IS NULL
                RETURNING id
            )
            INSERT INTO withdrawal_requests (id, user_id, amount, request_date, valid)
            SELECT $3, id, $2, $4, TRUE FROM debited
            RETURNING id, user_id, amount, request_date, valid, resolved_at
            "#,
        )
        .bind(user_id.0)
        .bind(amount)
        .bind(request_id.0)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await;

        let created = match created {
            Ok(row) => row,
            Err(err) => {
                let err = StoreError::from(err);
                if err.sqlstate() == Some(SQLSTATE_UNIQUE_VIOLATION) {
                    return Err(LedgerError::RequestAlreadyPending {
                        user_id: user_id.to_string(),
                    });
                }
                return Err(err.into());
            }
        };

        let request = match created {
            Some(row) => WithdrawalRequest::from(row),
            None => {
                let current: Option<(i64, Option<Uuid>)> = sqlx::query_as(
                    "SELECT balance, pending_withdrawal_request_id FROM user_accounts WHERE id = $1",
                )
                .bind(user_id.0)
                .fetch_optional(&mut *tx)
                .await
                .map_err(db)?;
                return Err(match current {
                    None => LedgerError::AccountNotFound {
                        user_id: user_id.to_string(),
                    },
                    Some((_, Some(_))) => LedgerError::RequestAlreadyPending {
                        user_id: user_id.to_string(),
                    },
                    Some((balance, None)) => LedgerError::InsufficientFunds {
                        required: amount,
                        available: balance,
                    },
                });
            }
        };

        tx.commit().await.map_err(commit_failed)?;
        Ok(request)
    }

    async fn resolve_withdrawal_once(
        &self,
        request_id: WithdrawalId,
        now: DateTime<Utc>,
    ) -> LedgerResult<WithdrawalRequest> {
        let mut tx = self.pool.begin().await.map_err(db)?;

        let resolved: Option<WithdrawalRow> = sqlx::query_as(
            "UPDATE withdrawal_requests SET valid = FALSE, resolved_at = $2 \
             WHERE id = $1 AND valid \
             RETURNING id, user_id, amount, request_date, valid, resolved_at",
        )
        .bind(request_id.0)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db)?;

        let request = match resolved {
            Some(row) => WithdrawalRequest::from(row),
            None => {
                let exists: Option<bool> =
                    sqlx::query_scalar("SELECT valid FROM withdrawal_requests WHERE id = $1")
                        .bind(request_id.0)
                        .fetch_optional(&mut *tx)
                        .await
                        .map_err(db)?;
                return Err(match exists {
                    None => LedgerError::WithdrawalNotFound {
                        request_id: request_id.to_string(),
                    },
                    Some(_) => LedgerError::WithdrawalAlreadyResolved {
                        request_id: request_id.to_string(),
                    },
                });
            }
        };

        let cleared = sqlx::query(
            "UPDATE user_accounts SET pending_withdrawal_request_id = NULL \
             WHERE id = $1 AND pending_withdrawal_request_id = $2",
        )
        .bind(request.user_id.0)
        .bind(request_id.0)
        .execute(&mut *tx)
        .await
        .map_err(db)?;
        if cleared.rows_affected() != 1 {
            return Err(LedgerError::invariant(
                "withdrawal_pointer",
                format!("account {} does not point at request {}", request.user_id, request_id),
            ));
        }

        tx.commit().await.map_err(commit_failed)?;
        Ok(request)
    }

    async fn fetch_tokens(&self, sql: &str, bind: Option<Uuid>, since: Option<DateTime<Utc>>) -> LedgerResult<Vec<InvestmentToken>> {
        let mut query = sqlx::query_as::<_, TokenRow>(sql);
        if let Some(id) = bind {
            query = query.bind(id);
        }
        if let Some(since) = since {
            query = query.bind(since);
        }
        let rows = query.fetch_all(&self.pool).await.map_err(db)?;
        tokens_from_rows(rows)
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn open_account(&self, user_id: UserId, now: DateTime<Utc>) -> LedgerResult<UserAccount> {
        let row: Option<AccountRow> = sqlx::query_as(&format!(
            "INSERT INTO user_accounts (id, balance, created_at) VALUES ($1, 0, $2) \
             ON CONFLICT (id) DO NOTHING {}",
            ACCOUNT_COLUMNS_RETURNING
        ))
        .bind(user_id.0)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(db)?;
        row.map(UserAccount::from).ok_or_else(|| LedgerError::AccountExists {
            user_id: user_id.to_string(),
        })
    }

    async fn get_account(&self, user_id: &UserId) -> LedgerResult<Option<UserAccount>> {
        let row: Option<AccountRow> = sqlx::query_as(
            "SELECT id, balance, pending_withdrawal_request_id, created_at FROM user_accounts WHERE id = $1",
        )
        .bind(user_id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(db)?;
        Ok(row.map(UserAccount::from))
    }

    async fn credit_balance(&self, user_id: &UserId, amount: Amount) -> LedgerResult<UserAccount> {
        if amount <= 0 {
            return Err(LedgerError::InvalidTransferAmount { amount });
        }
        let row: Option<AccountRow> = sqlx::query_as(&format!(
            "UPDATE user_accounts SET balance = balance + $2 WHERE id = $1 {}",
            ACCOUNT_COLUMNS_RETURNING
        ))
        .bind(user_id.0)
        .bind(amount)
        .fetch_optional(&self.pool)
        .await
        .map_err(db)?;
        row.map(UserAccount::from).ok_or_else(|| LedgerError::AccountNotFound {
            user_id: user_id.to_string(),
        })
    }

    async fn append_interest_rate(&self, record: InterestRateRecord) -> LedgerResult<InterestRateRecord> {
        sqlx::query("INSERT INTO interest_rates (id, effective_date, rate) VALUES ($1, $2, $3)")
            .bind(record.id.0)
            .bind(record.effective_date)
            .bind(record.rate)
            .execute(&self.pool)
            .await
            .map_err(db)?;
        Ok(record)
    }

    async fn current_interest_rate(&self) -> LedgerResult<Option<InterestRateRecord>> {
        let row: Option<RateRow> = sqlx::query_as(
            "SELECT id, effective_date, rate FROM interest_rates \
             ORDER BY effective_date DESC, id DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(db)?;
        Ok(row.map(InterestRateRecord::from))
    }

    async fn issue_bonds(&self, bonds: Vec<Bond>) -> LedgerResult<Vec<Bond>> {
        let mut tx = self.pool.begin().await.map_err(db)?;
        for bond in &bonds {
            sqlx::query(
                "INSERT INTO bonds \
                 (id, tenor_days, issue_date, interest_rate, original_amount, available_amount, maturity_date, valid) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            )
            .bind(bond.id.0)
            .bind(tenor_to_db(bond.tenor_days)?)
            .bind(bond.issue_date)
            .bind(bond.interest_rate)
            .bind(bond.original_amount)
            .bind(bond.available_amount)
            .bind(bond.maturity_date)
            .bind(bond.valid)
            .execute(&mut *tx)
            .await
            .map_err(db)?;
        }
        tx.commit().await.map_err(commit_failed)?;
        info!(count = bonds.len(), "bonds issued");
        Ok(bonds)
    }

    async fn get_bond(&self, bond_id: &BondId) -> LedgerResult<Option<Bond>> {
        let row: Option<BondRow> = sqlx::query_as(&format!("{} WHERE id = $1", SELECT_BONDS))
            .bind(bond_id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(db)?;
        Ok(row.map(Bond::try_from).transpose()?)
    }

    async fn list_active_bonds(&self) -> LedgerResult<Vec<Bond>> {
        let rows: Vec<BondRow> = sqlx::query_as(&format!(
            "{} WHERE valid ORDER BY tenor_days, issue_date, id",
            SELECT_BONDS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;
        Ok(rows
            .into_iter()
            .map(Bond::try_from)
            .collect::<StoreResult<Vec<_>>>()?)
    }

    async fn purchase(&self, order: PurchaseOrder) -> LedgerResult<PurchaseReceipt> {
        let receipt = self
            .retrying("purchase", move || self.purchase_once(order).boxed())
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
        let (user_id, holding_id) = (*user_id, *holding_id);
        self.retrying("redeem_early", move || self.redeem_once(user_id, holding_id, now).boxed())
            .await
    }

    async fn settle_matured(&self, now: DateTime<Utc>) -> LedgerResult<SettlementOutcome> {
        self.retrying("settle_matured", move || self.settle_once(now).boxed())
            .await
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
        let user_id = *user_id;
        self.retrying("request_withdrawal", move || {
            self.request_withdrawal_once(user_id, amount, now).boxed()
        })
        .await
    }

    async fn resolve_withdrawal(
        &self,
        request_id: &WithdrawalId,
        now: DateTime<Utc>,
    ) -> LedgerResult<WithdrawalRequest> {
        let request_id = *request_id;
        self.retrying("resolve_withdrawal", move || {
            self.resolve_withdrawal_once(request_id, now).boxed()
        })
        .await
    }

    async fn get_withdrawal(&self, request_id: &WithdrawalId) -> LedgerResult<Option<WithdrawalRequest>> {
        let row: Option<WithdrawalRow> = sqlx::query_as(&format!("{} WHERE id = $1", SELECT_WITHDRAWALS))
            .bind(request_id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(db)?;
        Ok(row.map(WithdrawalRequest::from))
    }

    async fn get_pending_withdrawal(&self, user_id: &UserId) -> LedgerResult<Option<WithdrawalRequest>> {
        let row: Option<WithdrawalRow> = sqlx::query_as(&format!(
            "{} WHERE user_id = $1 AND valid",
            SELECT_WITHDRAWALS
        ))
        .bind(user_id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(db)?;
        Ok(row.map(WithdrawalRequest::from))
    }

    async fn list_pending_withdrawals(&self) -> LedgerResult<Vec<WithdrawalRequest>> {
        let rows: Vec<WithdrawalRow> = sqlx::query_as(&format!(
            "{} WHERE valid ORDER BY request_date, id",
            SELECT_WITHDRAWALS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;
        Ok(rows.into_iter().map(WithdrawalRequest::from).collect())
    }

    async fn list_user_tokens(&self, user_id: &UserId, active_only: bool) -> LedgerResult<Vec<InvestmentToken>> {
        let filter = if active_only { " AND state = 'active'" } else { "" };
        let sql = format!(
            "{} WHERE user_id = $1{} ORDER BY investment_date, holding_id, id",
            SELECT_TOKENS, filter
        );
        self.fetch_tokens(&sql, Some(user_id.0), None).await
    }

    async fn list_active_tokens(&self) -> LedgerResult<Vec<InvestmentToken>> {
        let sql = format!(
            "{} WHERE state = 'active' ORDER BY investment_date, holding_id, id",
            SELECT_TOKENS
        );
        self.fetch_tokens(&sql, None, None).await
    }

    async fn list_tokens_invested_since(&self, since: DateTime<Utc>) -> LedgerResult<Vec<InvestmentToken>> {
        let sql = format!(
            "{} WHERE investment_date >= $1 ORDER BY investment_date, holding_id, id",
            SELECT_TOKENS
        );
        self.fetch_tokens(&sql, None, Some(since)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_defaults() {
        let retry = TxRetry::default();
        assert_eq!(retry.attempts, 8);
        assert!(retry.base_delay < retry.max_delay);
    }

    #[test]
    fn test_token_row_rejects_unknown_state() {
        let row = TokenRow {
            id: Uuid::new_v4(),
            holding_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            bond_id: Uuid::new_v4(),
            rate_id: Uuid::new_v4(),
            interest_rate: Decimal::new(13, 0),
            amount_invested: 1_000,
            tenor_days: 90,
            investment_date: Utc::now(),
            maturity_date: Utc::now(),
            state: "frozen".to_string(),
        };
        assert!(matches!(
            InvestmentToken::try_from(row),
            Err(StoreError::Serialization(_))
        ));
    }

    #[test]
    fn test_negative_tenor_rejected() {
        assert!(tenor_from_db(-1).is_err());
        assert_eq!(tenor_from_db(90).unwrap(), 90);
    }

    #[test]
    fn test_candidate_bonds_locked_by_id() {
        assert!(LOCK_CANDIDATE_BONDS.ends_with("ORDER BY id FOR UPDATE"));
    }

    #[test]
    fn test_commit_io_error_surfaces_without_retry() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "socket closed");
        let err = commit_failed(sqlx::Error::Io(io));
        assert_eq!(err.kind(), ErrorKind::StorageFailure);
        assert!(!err.is_retryable());
        assert!(db(sqlx::Error::PoolTimedOut).is_retryable());
    }
}

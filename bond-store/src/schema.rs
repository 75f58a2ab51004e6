//! PostgreSQL schema
//!
//! Bounds on counters are enforced twice: by CHECK constraints here and by
//! the WHERE guards on every conditional update in the store.

use sqlx::PgPool;
use tracing::info;

use crate::error::StoreResult;

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS user_accounts (
    id                            UUID PRIMARY KEY,
    balance                       BIGINT      NOT NULL DEFAULT 0 CHECK (balance >= 0),
    pending_withdrawal_request_id UUID,
    created_at                    TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS interest_rates (
    id             UUID PRIMARY KEY,
    effective_date TIMESTAMPTZ   NOT NULL,
    rate           NUMERIC(9, 4) NOT NULL CHECK (rate >= 0)
);
CREATE INDEX IF NOT EXISTS interest_rates_current_idx
    ON interest_rates (effective_date DESC, id DESC);

CREATE TABLE IF NOT EXISTS bonds (
    id               UUID PRIMARY KEY,
    tenor_days       INTEGER       NOT NULL CHECK (tenor_days > 0),
    issue_date       TIMESTAMPTZ   NOT NULL,
    interest_rate    NUMERIC(9, 4) NOT NULL CHECK (interest_rate >= 0),
    original_amount  BIGINT        NOT NULL CHECK (original_amount > 0),
    available_amount BIGINT        NOT NULL,
    maturity_date    TIMESTAMPTZ   NOT NULL,
    valid            BOOLEAN       NOT NULL DEFAULT TRUE,
    CHECK (available_amount >= 0 AND available_amount <= original_amount)
);
CREATE INDEX IF NOT EXISTS bonds_waterfall_idx
    ON bonds (tenor_days, issue_date, id) WHERE valid;

CREATE TABLE IF NOT EXISTS investment_tokens (
    id              UUID PRIMARY KEY,
    holding_id      UUID          NOT NULL,
    user_id         UUID          NOT NULL REFERENCES user_accounts (id),
    bond_id         UUID          NOT NULL REFERENCES bonds (id),
    rate_id         UUID          NOT NULL REFERENCES interest_rates (id),
    interest_rate   NUMERIC(9, 4) NOT NULL,
    amount_invested BIGINT        NOT NULL CHECK (amount_invested > 0),
    tenor_days      INTEGER       NOT NULL CHECK (tenor_days > 0),
    investment_date TIMESTAMPTZ   NOT NULL,
    maturity_date   TIMESTAMPTZ   NOT NULL,
    state           TEXT          NOT NULL DEFAULT 'active'
                    CHECK (state IN ('active', 'redeemed_early', 'matured'))
);
CREATE INDEX IF NOT EXISTS investment_tokens_holding_idx ON investment_tokens (holding_id);
CREATE INDEX IF NOT EXISTS investment_tokens_user_idx ON investment_tokens (user_id, investment_date);
CREATE INDEX IF NOT EXISTS investment_tokens_maturity_idx
    ON investment_tokens (maturity_date) WHERE state = 'active';
CREATE INDEX IF NOT EXISTS investment_tokens_invested_idx ON investment_tokens (investment_date);

CREATE TABLE IF NOT EXISTS withdrawal_requests (
    id           UUID PRIMARY KEY,
    user_id      UUID        NOT NULL REFERENCES user_accounts (id),
    amount       BIGINT      NOT NULL CHECK (amount > 0),
    request_date TIMESTAMPTZ NOT NULL,
    valid        BOOLEAN     NOT NULL DEFAULT TRUE,
    resolved_at  TIMESTAMPTZ
);
CREATE UNIQUE INDEX IF NOT EXISTS withdrawal_requests_one_pending_idx
    ON withdrawal_requests (user_id) WHERE valid;
"#;

/// Create tables and indexes if missing
pub async fn apply_schema(pool: &PgPool) -> StoreResult<()> {
    sqlx::raw_sql(SCHEMA).execute(pool).await?;
    info!("ledger schema applied");
    Ok(())
}

//! Operator Reports
//!
//! Snapshot reports built from store reads and pushed to the `Reporting`
//! group as JSON.

use std::collections::BTreeMap;

use bond_core::{
    AccrualCalculator, Amount, HoldingId, HoldingView, InvestmentToken, LedgerResult, WithdrawalRequest,
};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

pub const HOLDINGS_SUBJECT: &str = "active_holdings";
pub const PURCHASES_SUBJECT: &str = "purchases_today";
pub const WITHDRAWALS_SUBJECT: &str = "pending_withdrawals";
pub const SETTLEMENT_SUBJECT: &str = "settlement_run";

/// Group tokens by holding and price each holding at `now`.
///
/// Holdings are returned in investment order.
pub fn summarize_holdings(
    tokens: &[InvestmentToken],
    calculator: &AccrualCalculator,
    now: DateTime<Utc>,
) -> LedgerResult<Vec<HoldingView>> {
    let mut groups: BTreeMap<HoldingId, Vec<&InvestmentToken>> = BTreeMap::new();
    for token in tokens {
        groups.entry(token.holding_id).or_default().push(token);
    }

    let mut views = Vec::with_capacity(groups.len());
    for (holding_id, fragments) in groups {
        let principal = fragments.iter().try_fold(0 as Amount, |acc, t| {
            acc.checked_add(t.amount_invested)
                .ok_or_else(|| bond_core::LedgerError::overflow("holding principal"))
        })?;
        let first = fragments[0];
        views.push(HoldingView {
            holding_id,
            principal,
            interest_rate: first.interest_rate,
            tenor_days: first.tenor_days,
            investment_date: first.investment_date,
            maturity_date: first.maturity_date,
            current_value: calculator.indicative_value(principal, first.interest_rate, first.investment_date, now),
            fragments: fragments.len(),
        });
    }
    views.sort_by(|a, b| {
        a.investment_date
            .cmp(&b.investment_date)
            .then(a.holding_id.cmp(&b.holding_id))
    });
    Ok(views)
}

/// Midnight UTC of the day containing `now`
pub fn start_of_day(now: DateTime<Utc>) -> DateTime<Utc> {
    match now.date_naive().and_hms_opt(0, 0, 0) {
        Some(midnight) => Utc.from_utc_datetime(&midnight),
        None => now,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HoldingsReport {
    pub generated_at: DateTime<Utc>,
    pub holdings: Vec<HoldingView>,
    pub total_principal: Amount,
    pub total_current_value: Amount,
}

impl HoldingsReport {
    pub fn build(
        tokens: &[InvestmentToken],
        calculator: &AccrualCalculator,
        now: DateTime<Utc>,
    ) -> LedgerResult<Self> {
        let holdings = summarize_holdings(tokens, calculator, now)?;
        Ok(Self {
            generated_at: now,
            total_principal: holdings.iter().map(|h| h.principal).sum(),
            total_current_value: holdings.iter().map(|h| h.current_value).sum(),
            holdings,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurchaseLine {
    pub holding_id: HoldingId,
    pub user_id: bond_core::UserId,
    pub amount: Amount,
    pub tenor_days: u32,
    pub investment_date: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurchasesReport {
    pub since: DateTime<Utc>,
    pub generated_at: DateTime<Utc>,
    pub purchases: Vec<PurchaseLine>,
    pub total_amount: Amount,
}

impl PurchasesReport {
    /// One line per holding bought since `since`
    pub fn build(tokens: &[InvestmentToken], since: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        let mut lines: BTreeMap<HoldingId, PurchaseLine> = BTreeMap::new();
        for token in tokens.iter().filter(|t| t.investment_date >= since) {
            lines
                .entry(token.holding_id)
                .and_modify(|line| line.amount = line.amount.saturating_add(token.amount_invested))
                .or_insert_with(|| PurchaseLine {
                    holding_id: token.holding_id,
                    user_id: token.user_id,
                    amount: token.amount_invested,
                    tenor_days: token.tenor_days,
                    investment_date: token.investment_date,
                });
        }
        let mut purchases: Vec<_> = lines.into_values().collect();
        purchases.sort_by_key(|p| p.investment_date);
        Self {
            since,
            generated_at: now,
            total_amount: purchases.iter().map(|p| p.amount).sum(),
            purchases,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WithdrawalsReport {
    pub generated_at: DateTime<Utc>,
    pub requests: Vec<WithdrawalRequest>,
    pub total_amount: Amount,
}

impl WithdrawalsReport {
    pub fn build(mut requests: Vec<WithdrawalRequest>, now: DateTime<Utc>) -> Self {
        requests.sort_by_key(|r| r.request_date);
        Self {
            generated_at: now,
            total_amount: requests.iter().map(|r| r.amount).sum(),
            requests,
        }
    }
}

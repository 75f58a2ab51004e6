//! Accrual Calculator
//!
//! Redemption value of a principal under the fee schedule. Early redemption
//! pro-rates over elapsed whole days and charges the exit fee; maturity
//! settlement pro-rates over the contracted tenor. Both floor the net
//! interest to whole currency units.
//!
//! Fragments of one holding are summed by principal before the formula is
//! applied, so a split purchase pays exactly what an unsplit one would.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::error::{LedgerError, LedgerResult};
use crate::rules::FeeSchedule;
use crate::types::{Amount, InvestmentToken};

/// Which formula applies
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum AccrualMode {
    /// User exit before maturity, priced at `now`
    Early { now: DateTime<Utc> },
    /// Held to the end of the tenor
    Maturity,
}

/// Terms of one priced position
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AccrualInput {
    pub principal: Amount,
    /// Percent per annum
    pub rate: Decimal,
    pub investment_date: DateTime<Utc>,
    pub tenor_days: u32,
}

impl AccrualInput {
    /// Aggregate the fragments of one holding.
    ///
    /// All fragments must share rate, tenor and investment date.
    pub fn from_holding<'a, I>(tokens: I) -> LedgerResult<Self>
    where
        I: IntoIterator<Item = &'a InvestmentToken>,
    {
        let mut iter = tokens.into_iter();
        let first = iter
            .next()
            .ok_or_else(|| LedgerError::invariant("holding_terms", "holding has no fragments"))?;
        let mut input = Self {
            principal: first.amount_invested,
            rate: first.interest_rate,
            investment_date: first.investment_date,
            tenor_days: first.tenor_days,
        };
        for token in iter {
            if token.holding_id != first.holding_id
                || token.interest_rate != input.rate
                || token.tenor_days != input.tenor_days
                || token.investment_date != input.investment_date
            {
                return Err(LedgerError::invariant(
                    "holding_terms",
                    format!("token {} does not share the terms of holding {}", token.id, first.holding_id),
                ));
            }
            input.principal = input
                .principal
                .checked_add(token.amount_invested)
                .ok_or_else(|| LedgerError::overflow("holding principal"))?;
        }
        Ok(input)
    }
}

/// Whole days between two instants, never negative
pub fn elapsed_days(from: DateTime<Utc>, to: DateTime<Utc>) -> i64 {
    (to - from).num_days().max(0)
}

/// Pure redemption calculator
#[derive(Clone, Debug, Default)]
pub struct AccrualCalculator {
    fees: FeeSchedule,
}

impl AccrualCalculator {
    pub fn new(fees: FeeSchedule) -> Self {
        Self { fees }
    }

    pub fn fees(&self) -> &FeeSchedule {
        &self.fees
    }

    fn day_fraction(&self, days: i64) -> Decimal {
        Decimal::from(days) / Decimal::from(self.fees.day_count_basis)
    }

    /// Net interest after tax and fees, before flooring
    fn net_interest(&self, principal: Decimal, rate: Decimal, day_fraction: Decimal, exit_fee: Decimal) -> Decimal {
        let gross = principal * day_fraction * rate / dec!(100);
        let fees = principal * (day_fraction * self.fees.holding_fee_rate + exit_fee);
        self.fees.net_of_tax() * gross - fees
    }

    fn settle(&self, principal: Amount, interest: Decimal, context: &str) -> LedgerResult<Amount> {
        let interest = interest
            .floor()
            .to_i64()
            .ok_or_else(|| LedgerError::overflow(context.to_string()))?;
        let payout = principal
            .checked_add(interest)
            .ok_or_else(|| LedgerError::overflow(context.to_string()))?;
        if payout < 0 {
            return Err(LedgerError::invariant(
                "accrual",
                format!("{} produced negative payout {}", context, payout),
            ));
        }
        Ok(payout)
    }

    /// Early redemption value at `now`
    pub fn early_return(
        &self,
        principal: Amount,
        rate: Decimal,
        investment_date: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> LedgerResult<Amount> {
        let df = self.day_fraction(elapsed_days(investment_date, now));
        let interest = self.net_interest(Decimal::from(principal), rate, df, self.fees.early_exit_fee_rate);
        self.settle(principal, interest, "early redemption")
    }

    /// Maturity value over the full contracted tenor
    pub fn maturity_return(&self, principal: Amount, rate: Decimal, tenor_days: u32) -> LedgerResult<Amount> {
        let df = self.day_fraction(i64::from(tenor_days));
        let interest = self.net_interest(Decimal::from(principal), rate, df, Decimal::ZERO);
        self.settle(principal, interest, "maturity settlement")
    }

    pub fn compute(&self, input: &AccrualInput, mode: AccrualMode) -> LedgerResult<Amount> {
        match mode {
            AccrualMode::Early { now } => {
                self.early_return(input.principal, input.rate, input.investment_date, now)
            }
            AccrualMode::Maturity => self.maturity_return(input.principal, input.rate, input.tenor_days),
        }
    }

    /// Price a whole holding (fragments summed first)
    pub fn holding_return<'a, I>(&self, tokens: I, mode: AccrualMode) -> LedgerResult<Amount>
    where
        I: IntoIterator<Item = &'a InvestmentToken>,
    {
        let input = AccrualInput::from_holding(tokens)?;
        self.compute(&input, mode)
    }

    /// Gross indicative value shown to users; no tax or fees
    pub fn indicative_value(
        &self,
        principal: Amount,
        rate: Decimal,
        investment_date: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Amount {
        let df = self.day_fraction(elapsed_days(investment_date, now));
        let interest = (Decimal::from(principal) * rate / dec!(100) * df)
            .floor()
            .to_i64()
            .unwrap_or(0);
        principal.saturating_add(interest)
    }
}

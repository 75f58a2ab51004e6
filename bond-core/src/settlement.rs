//! Settlement Planning
//!
//! Turns a set of closing tokens into a payout plan: principal to return per
//! bond, cash to credit per user, and the token ids to close. Stores apply
//! the plan inside one transaction; the plan itself is pure.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::accrual::{AccrualCalculator, AccrualMode};
use crate::error::{LedgerError, LedgerResult};
use crate::types::*;

/// Payout for one holding
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HoldingPayout {
    pub holding_id: HoldingId,
    pub user_id: UserId,
    pub principal: Amount,
    pub payout: Amount,
    pub fragments: usize,
}

/// Mutations required to close a set of tokens
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutPlan {
    /// Principal returned to each bond, keyed in lock order
    pub replenishments: BTreeMap<BondId, Amount>,
    /// Cash credited to each user
    pub credits: BTreeMap<UserId, Amount>,
    pub token_ids: Vec<TokenId>,
    pub holdings: Vec<HoldingPayout>,
}

impl PayoutPlan {
    pub fn is_empty(&self) -> bool {
        self.token_ids.is_empty()
    }

    pub fn total_principal(&self) -> Amount {
        self.holdings.iter().map(|h| h.principal).sum()
    }

    pub fn total_payout(&self) -> Amount {
        self.credits.values().sum()
    }
}

/// Builds payout plans for early redemption and maturity settlement
#[derive(Clone, Debug, Default)]
pub struct SettlementPlanner {
    calculator: AccrualCalculator,
}

impl SettlementPlanner {
    pub fn new(calculator: AccrualCalculator) -> Self {
        Self { calculator }
    }

    pub fn calculator(&self) -> &AccrualCalculator {
        &self.calculator
    }

    /// Plan the early redemption of one holding's active fragments
    pub fn plan_early_redemption(
        &self,
        holding_id: HoldingId,
        tokens: &[InvestmentToken],
        now: DateTime<Utc>,
    ) -> LedgerResult<PayoutPlan> {
        if tokens.is_empty() {
            return Err(LedgerError::HoldingNotActive {
                holding_id: holding_id.to_string(),
            });
        }
        for token in tokens {
            if token.holding_id != holding_id {
                return Err(LedgerError::invariant(
                    "holding_terms",
                    format!("token {} is not part of holding {}", token.id, holding_id),
                ));
            }
            if !token.is_valid() {
                return Err(LedgerError::HoldingNotActive {
                    holding_id: holding_id.to_string(),
                });
            }
            if token.is_matured_at(now) {
                return Err(LedgerError::HoldingMatured {
                    holding_id: holding_id.to_string(),
                });
            }
        }

        let mut plan = PayoutPlan::default();
        self.add_holding(&mut plan, tokens.iter().collect(), AccrualMode::Early { now })?;
        Ok(plan)
    }

    /// Plan maturity settlement of every token given, grouped by holding
    pub fn plan_maturity(&self, tokens: &[InvestmentToken], now: DateTime<Utc>) -> LedgerResult<PayoutPlan> {
        let mut by_holding: BTreeMap<HoldingId, Vec<&InvestmentToken>> = BTreeMap::new();
        for token in tokens {
            if !token.is_valid() || !token.is_matured_at(now) {
                return Err(LedgerError::invariant(
                    "settlement_selection",
                    format!("token {} is not an active matured token", token.id),
                ));
            }
            by_holding.entry(token.holding_id).or_default().push(token);
        }

        let mut plan = PayoutPlan::default();
        for (_, group) in by_holding {
            self.add_holding(&mut plan, group, AccrualMode::Maturity)?;
        }
        Ok(plan)
    }

    fn add_holding(
        &self,
        plan: &mut PayoutPlan,
        group: Vec<&InvestmentToken>,
        mode: AccrualMode,
    ) -> LedgerResult<()> {
        let first = match group.first() {
            Some(t) => *t,
            None => return Ok(()),
        };
        if group.iter().any(|t| t.user_id != first.user_id) {
            return Err(LedgerError::invariant(
                "holding_owner",
                format!("holding {} spans several users", first.holding_id),
            ));
        }

        let payout = self.calculator.holding_return(group.iter().copied(), mode)?;
        let mut principal: Amount = 0;
        for token in &group {
            principal += token.amount_invested;
            *plan.replenishments.entry(token.bond_id).or_default() += token.amount_invested;
            plan.token_ids.push(token.id);
        }
        let credit = plan.credits.entry(first.user_id).or_default();
        *credit = credit
            .checked_add(payout)
            .ok_or_else(|| LedgerError::overflow("settlement credit"))?;

        plan.holdings.push(HoldingPayout {
            holding_id: first.holding_id,
            user_id: first.user_id,
            principal,
            payout,
            fragments: group.len(),
        });
        Ok(())
    }
}

/// Summary of one committed settlement run
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementReport {
    pub run_id: RunId,
    pub as_of: DateTime<Utc>,
    pub tokens_matured: usize,
    pub holdings_settled: usize,
    pub users_credited: usize,
    pub total_principal: Amount,
    pub total_payout: Amount,
    pub bonds_replenished: Vec<(BondId, Amount)>,
    pub bonds_retired: Vec<BondId>,
    /// Hex SHA-256 over the canonical content
    pub digest: String,
}

impl SettlementReport {
    pub fn new(as_of: DateTime<Utc>, plan: &PayoutPlan, mut bonds_retired: Vec<BondId>) -> Self {
        bonds_retired.sort();
        let mut report = Self {
            run_id: RunId::new(),
            as_of,
            tokens_matured: plan.token_ids.len(),
            holdings_settled: plan.holdings.len(),
            users_credited: plan.credits.len(),
            total_principal: plan.total_principal(),
            total_payout: plan.total_payout(),
            bonds_replenished: plan.replenishments.iter().map(|(k, v)| (*k, *v)).collect(),
            bonds_retired,
            digest: String::new(),
        };
        report.digest = report.compute_digest();
        report
    }

    /// Digest over everything but the run id, so two runs with the same
    /// effect reconcile to the same value
    pub fn compute_digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.as_of.to_rfc3339().as_bytes());
        hasher.update(self.tokens_matured.to_le_bytes());
        hasher.update(self.holdings_settled.to_le_bytes());
        hasher.update(self.users_credited.to_le_bytes());
        hasher.update(self.total_principal.to_le_bytes());
        hasher.update(self.total_payout.to_le_bytes());
        for (bond_id, amount) in &self.bonds_replenished {
            hasher.update(bond_id.as_uuid().as_bytes());
            hasher.update(amount.to_le_bytes());
        }
        for bond_id in &self.bonds_retired {
            hasher.update(bond_id.as_uuid().as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    pub fn verify_digest(&self) -> bool {
        self.digest == self.compute_digest()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens_matured == 0 && self.bonds_retired.is_empty()
    }
}

/// Result of asking for a settlement run
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SettlementOutcome {
    Completed(SettlementReport),
    /// Another run held the settlement lock
    Skipped,
}

impl SettlementOutcome {
    pub fn report(&self) -> Option<&SettlementReport> {
        match self {
            Self::Completed(report) => Some(report),
            Self::Skipped => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn token(user: UserId, holding: HoldingId, bond: BondId, amount: Amount, rate: Decimal) -> InvestmentToken {
        InvestmentToken {
            id: TokenId::new(),
            holding_id: holding,
            user_id: user,
            bond_id: bond,
            rate_id: RateId::new(),
            interest_rate: rate,
            amount_invested: amount,
            tenor_days: 90,
            investment_date: t0(),
            maturity_date: t0() + Duration::days(90),
            state: TokenState::Active,
        }
    }

    #[test]
    fn test_maturity_plan_groups_by_holding_and_user() {
        let alice = UserId::new();
        let bob = UserId::new();
        let (b1, b2) = (BondId::new(), BondId::new());
        let h1 = HoldingId::new();
        let h2 = HoldingId::new();
        let h3 = HoldingId::new();
        let tokens = vec![
            token(alice, h1, b1, 2_000, dec!(13)),
            token(alice, h1, b2, 2_000, dec!(13)),
            token(alice, h2, b2, 10_000, dec!(13)),
            token(bob, h3, b1, 1_000, dec!(13)),
        ];

        let planner = SettlementPlanner::default();
        let plan = planner.plan_maturity(&tokens, t0() + Duration::days(90)).unwrap();

        assert_eq!(plan.token_ids.len(), 4);
        assert_eq!(plan.holdings.len(), 3);
        assert_eq!(plan.replenishments[&b1], 3_000);
        assert_eq!(plan.replenishments[&b2], 12_000);

        let calc = planner.calculator();
        let alice_expected = calc.maturity_return(4_000, dec!(13), 90).unwrap()
            + calc.maturity_return(10_000, dec!(13), 90).unwrap();
        assert_eq!(plan.credits[&alice], alice_expected);
        assert_eq!(plan.credits[&bob], calc.maturity_return(1_000, dec!(13), 90).unwrap());
        assert_eq!(plan.total_principal(), 15_000);
    }

    #[test]
    fn test_maturity_plan_rejects_unmatured() {
        let tokens = vec![token(UserId::new(), HoldingId::new(), BondId::new(), 1_000, dec!(13))];
        let err = SettlementPlanner::default()
            .plan_maturity(&tokens, t0() + Duration::days(10))
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvariantViolation { .. }));
    }

    #[test]
    fn test_early_plan() {
        let user = UserId::new();
        let holding = HoldingId::new();
        let (b1, b2) = (BondId::new(), BondId::new());
        let tokens = vec![
            token(user, holding, b1, 6_000, dec!(13)),
            token(user, holding, b2, 4_000, dec!(13)),
        ];
        let now = t0() + Duration::days(45);
        let plan = SettlementPlanner::default()
            .plan_early_redemption(holding, &tokens, now)
            .unwrap();
        let expected = AccrualCalculator::default()
            .early_return(10_000, dec!(13), t0(), now)
            .unwrap();
        assert_eq!(plan.credits[&user], expected);
        assert_eq!(plan.replenishments[&b1], 6_000);
        assert_eq!(plan.replenishments[&b2], 4_000);
    }

    #[test]
    fn test_early_plan_conflicts() {
        let user = UserId::new();
        let holding = HoldingId::new();
        let mut tokens = vec![token(user, holding, BondId::new(), 1_000, dec!(13))];
        let planner = SettlementPlanner::default();

        assert!(matches!(
            planner.plan_early_redemption(holding, &tokens, t0() + Duration::days(90)),
            Err(LedgerError::HoldingMatured { .. })
        ));

        tokens[0].state = TokenState::Matured;
        assert!(matches!(
            planner.plan_early_redemption(holding, &tokens, t0() + Duration::days(1)),
            Err(LedgerError::HoldingNotActive { .. })
        ));
        assert!(matches!(
            planner.plan_early_redemption(holding, &[], t0()),
            Err(LedgerError::HoldingNotActive { .. })
        ));
    }

    #[test]
    fn test_report_digest() {
        let tokens = vec![token(UserId::new(), HoldingId::new(), BondId::new(), 1_000, dec!(13))];
        let as_of = t0() + Duration::days(90);
        let plan = SettlementPlanner::default().plan_maturity(&tokens, as_of).unwrap();
        let report = SettlementReport::new(as_of, &plan, vec![]);
        assert!(report.verify_digest());
        assert_eq!(report.digest.len(), 64);

        let again = SettlementReport::new(as_of, &plan, vec![]);
        assert_ne!(report.run_id, again.run_id);
        assert_eq!(report.digest, again.digest);

        let mut tampered = report.clone();
        tampered.total_payout += 1;
        assert!(!tampered.verify_digest());
    }

    #[test]
    fn test_empty_run() {
        let plan = SettlementPlanner::default().plan_maturity(&[], t0()).unwrap();
        assert!(plan.is_empty());
        let report = SettlementReport::new(t0(), &plan, vec![]);
        assert!(report.is_empty());
        assert_eq!(SettlementOutcome::Completed(report.clone()).report(), Some(&report));
        assert!(SettlementOutcome::Skipped.report().is_none());
    }
}

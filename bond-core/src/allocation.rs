//! Allocation Engine
//!
//! Waterfall allocation of a purchase across bond capacity. The planner is
//! a single ordered scan with a running total; it never touches storage, so
//! the store calls it on rows it has already locked.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{LedgerError, LedgerResult};
use crate::types::*;

/// One slice of one bond taken by a purchase
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationFragment {
    pub bond_id: BondId,
    pub amount: Amount,
}

/// Planned split of a purchase
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationPlan {
    pub requested: Amount,
    pub fragments: Vec<AllocationFragment>,
}

impl AllocationPlan {
    pub fn total(&self) -> Amount {
        self.fragments.iter().map(|f| f.amount).sum()
    }

    pub fn amount_for(&self, bond_id: &BondId) -> Amount {
        self.fragments
            .iter()
            .filter(|f| &f.bond_id == bond_id)
            .map(|f| f.amount)
            .sum()
    }
}

/// Token field values shared by every fragment of one purchase
#[derive(Clone, Debug)]
pub struct PurchaseTerms {
    pub user_id: UserId,
    pub holding_id: HoldingId,
    pub rate: InterestRateRecord,
    pub tenor_days: u32,
    pub investment_date: DateTime<Utc>,
}

impl PurchaseTerms {
    pub fn maturity_date(&self) -> DateTime<Utc> {
        add_days(self.investment_date, self.tenor_days)
    }
}

/// Waterfall allocator
#[derive(Clone, Copy, Debug, Default)]
pub struct AllocationEngine;

impl AllocationEngine {
    pub fn new() -> Self {
        Self
    }

    /// Ordering key for candidate bonds: tenor, then issue date, then id
    pub fn candidate_key(bond: &Bond) -> (u32, DateTime<Utc>, BondId) {
        (bond.tenor_days, bond.issue_date, bond.id)
    }

    /// Valid bonds that outlive a `tenor_days` token bought at `now`, in
    /// waterfall order
    pub fn candidates<'a, I>(&self, bonds: I, now: DateTime<Utc>, tenor_days: u32) -> Vec<&'a Bond>
    where
        I: IntoIterator<Item = &'a Bond>,
    {
        let mut out: Vec<&Bond> = bonds
            .into_iter()
            .filter(|b| b.covers_tenor(now, tenor_days))
            .collect();
        out.sort_by_key(|b| Self::candidate_key(b));
        out
    }

    /// Split `amount` over `candidates` in the order given.
    ///
    /// A bond is used only while the running total before it is below
    /// `amount`; bonds with nothing available contribute no fragment. Fails
    /// with `InsufficientInventory` if the candidates cannot cover `amount`.
    pub fn plan(&self, candidates: &[&Bond], amount: Amount) -> LedgerResult<AllocationPlan> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount {
                amount,
                reason: "amount must be positive".to_string(),
            });
        }

        let mut fragments = Vec::new();
        let mut running: Amount = 0;

        for bond in candidates {
            if running >= amount {
                break;
            }
            if bond.available_amount < 0 || bond.available_amount > bond.original_amount {
                return Err(LedgerError::invariant(
                    "bond_inventory",
                    format!(
                        "bond {} has available {} of original {}",
                        bond.id, bond.available_amount, bond.original_amount
                    ),
                ));
            }
            let take = bond.available_amount.min(amount - running);
            if take == 0 {
                continue;
            }
            fragments.push(AllocationFragment {
                bond_id: bond.id,
                amount: take,
            });
            running += take;
        }

        if running < amount {
            return Err(LedgerError::InsufficientInventory {
                requested: amount,
                available: running,
            });
        }

        debug!(
            requested = amount,
            fragments = fragments.len(),
            "waterfall allocation planned"
        );

        Ok(AllocationPlan {
            requested: amount,
            fragments,
        })
    }

    /// Select candidates and plan in one step
    pub fn allocate<'a, I>(
        &self,
        bonds: I,
        now: DateTime<Utc>,
        tenor_days: u32,
        amount: Amount,
    ) -> LedgerResult<AllocationPlan>
    where
        I: IntoIterator<Item = &'a Bond>,
    {
        let candidates = self.candidates(bonds, now, tenor_days);
        self.plan(&candidates, amount)
    }

    /// One active token per planned fragment
    pub fn build_tokens(&self, plan: &AllocationPlan, terms: &PurchaseTerms) -> Vec<InvestmentToken> {
        let maturity_date = terms.maturity_date();
        plan.fragments
            .iter()
            .map(|f| InvestmentToken {
                id: TokenId::new(),
                holding_id: terms.holding_id,
                user_id: terms.user_id,
                bond_id: f.bond_id,
                rate_id: terms.rate.id,
                interest_rate: terms.rate.rate,
                amount_invested: f.amount,
                tenor_days: terms.tenor_days,
                investment_date: terms.investment_date,
                maturity_date,
                state: TokenState::Active,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn bond(tenor: u32, issued_days_ago: i64, original: Amount, available: Amount) -> Bond {
        let issue_date = now() - Duration::days(issued_days_ago);
        Bond {
            id: BondId::new(),
            tenor_days: tenor,
            issue_date,
            interest_rate: dec!(20),
            original_amount: original,
            available_amount: available,
            maturity_date: now() + Duration::days(i64::from(tenor)),
            valid: true,
        }
    }

    #[test]
    fn test_single_bond_partial_take() {
        let b = bond(90, 0, 10_000, 10_000);
        let plan = AllocationEngine::new().allocate([&b], now(), 90, 3_000).unwrap();
        assert_eq!(plan.fragments, vec![AllocationFragment { bond_id: b.id, amount: 3_000 }]);
        assert_eq!(plan.total(), 3_000);
    }

    #[test]
    fn test_split_across_two_bonds() {
        let b1 = bond(90, 2, 2_000, 2_000);
        let b2 = bond(90, 1, 5_000, 5_000);
        let plan = AllocationEngine::new()
            .allocate([&b2, &b1], now(), 90, 4_000)
            .unwrap();
        assert_eq!(
            plan.fragments,
            vec![
                AllocationFragment { bond_id: b1.id, amount: 2_000 },
                AllocationFragment { bond_id: b2.id, amount: 2_000 },
            ]
        );
        assert_eq!(b2.available_amount - plan.amount_for(&b2.id), 3_000);
    }

    #[test]
    fn test_shorter_tenor_consumed_first() {
        let long = bond(270, 10, 5_000, 5_000);
        let short = bond(180, 0, 5_000, 5_000);
        let plan = AllocationEngine::new()
            .allocate([&long, &short], now(), 90, 1_000)
            .unwrap();
        assert_eq!(plan.fragments[0].bond_id, short.id);
    }

    #[test]
    fn test_empty_bonds_skipped() {
        let empty = bond(90, 3, 5_000, 0);
        let full = bond(90, 1, 5_000, 5_000);
        let plan = AllocationEngine::new()
            .allocate([&empty, &full], now(), 90, 1_500)
            .unwrap();
        assert_eq!(plan.fragments.len(), 1);
        assert_eq!(plan.fragments[0].bond_id, full.id);
    }

    #[test]
    fn test_stops_once_covered() {
        let b1 = bond(90, 3, 1_000, 1_000);
        let b2 = bond(90, 2, 1_000, 1_000);
        let b3 = bond(90, 1, 1_000, 1_000);
        let plan = AllocationEngine::new()
            .allocate([&b1, &b2, &b3], now(), 90, 2_000)
            .unwrap();
        assert_eq!(plan.fragments.len(), 2);
        assert_eq!(plan.amount_for(&b3.id), 0);
    }

    #[test]
    fn test_insufficient_inventory() {
        let b1 = bond(90, 1, 2_000, 1_500);
        let b2 = bond(90, 0, 2_000, 2_000);
        let err = AllocationEngine::new()
            .allocate([&b1, &b2], now(), 90, 4_000)
            .unwrap_err();
        assert_eq!(
            err,
            LedgerError::InsufficientInventory { requested: 4_000, available: 3_500 }
        );
    }

    #[test]
    fn test_bond_maturing_too_soon_excluded() {
        let short = bond(90, 0, 10_000, 10_000);
        let err = AllocationEngine::new()
            .allocate([&short], now(), 180, 1_000)
            .unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientInventory { available: 0, .. }));
    }

    #[test]
    fn test_retired_bond_excluded() {
        let mut retired = bond(90, 0, 10_000, 10_000);
        retired.valid = false;
        let candidates = AllocationEngine::new().candidates([&retired], now(), 90);
        assert!(candidates.is_empty());
    }

    #[test]
    fn test_corrupt_inventory_is_internal() {
        let broken = bond(90, 0, 1_000, 2_000);
        let err = AllocationEngine::new()
            .allocate([&broken], now(), 90, 1_000)
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Internal);
    }

    #[test]
    fn test_build_tokens_share_terms() {
        let b1 = bond(90, 2, 2_000, 2_000);
        let b2 = bond(90, 1, 5_000, 5_000);
        let engine = AllocationEngine::new();
        let plan = engine.allocate([&b1, &b2], now(), 90, 4_000).unwrap();
        let terms = PurchaseTerms {
            user_id: UserId::new(),
            holding_id: HoldingId::new(),
            rate: InterestRateRecord::new(now(), dec!(13)).unwrap(),
            tenor_days: 90,
            investment_date: now(),
        };
        let tokens = engine.build_tokens(&plan, &terms);

        assert_eq!(tokens.len(), 2);
        assert!(tokens.iter().all(|t| t.holding_id == terms.holding_id));
        assert!(tokens.iter().all(|t| t.interest_rate == dec!(13)));
        assert!(tokens.iter().all(|t| t.maturity_date == now() + Duration::days(90)));
        assert!(tokens.iter().all(InvestmentToken::is_valid));
        assert_eq!(tokens.iter().map(|t| t.amount_invested).sum::<Amount>(), 4_000);
    }
}

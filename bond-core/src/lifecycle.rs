//! Token / Bond Lifecycle
//!
//! State transitions and the inventory counter updates tied to them.
//! Tokens move Active -> RedeemedEarly | Matured; bonds move Active ->
//! Matured. Both are terminal. `available_amount` only grows when a token
//! leaves Active and only shrinks through allocation.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::error::{LedgerError, LedgerResult};
use crate::types::*;

/// Close an active token
pub fn close_token(token: &mut InvestmentToken, target: TokenState) -> LedgerResult<()> {
    if !target.is_terminal() {
        return Err(LedgerError::invariant(
            "token_transition",
            format!("token {} cannot transition to {}", token.id, target),
        ));
    }
    if token.state != TokenState::Active {
        return Err(LedgerError::HoldingNotActive {
            holding_id: token.holding_id.to_string(),
        });
    }
    token.state = target;
    Ok(())
}

/// Return principal to a bond
pub fn replenish(bond: &mut Bond, amount: Amount) -> LedgerResult<()> {
    if !bond.valid {
        return Err(LedgerError::invariant(
            "bond_immutable",
            format!("bond {} is retired and cannot be replenished", bond.id),
        ));
    }
    let next = bond
        .available_amount
        .checked_add(amount)
        .ok_or_else(|| LedgerError::overflow("bond replenishment"))?;
    if amount < 0 || next > bond.original_amount {
        return Err(LedgerError::invariant(
            "bond_inventory",
            format!(
                "replenishing bond {} by {} would leave {} of original {}",
                bond.id, amount, next, bond.original_amount
            ),
        ));
    }
    bond.available_amount = next;
    Ok(())
}

/// Take allocated capacity out of a bond
pub fn consume(bond: &mut Bond, amount: Amount) -> LedgerResult<()> {
    if !bond.valid {
        return Err(LedgerError::invariant(
            "bond_immutable",
            format!("bond {} is retired and cannot be allocated", bond.id),
        ));
    }
    if amount <= 0 || amount > bond.available_amount {
        return Err(LedgerError::invariant(
            "bond_inventory",
            format!(
                "allocating {} from bond {} with {} available",
                amount, bond.id, bond.available_amount
            ),
        ));
    }
    bond.available_amount -= amount;
    Ok(())
}

/// Retire a bond whose maturity date has passed. Returns whether it changed.
pub fn retire_if_matured(bond: &mut Bond, now: DateTime<Utc>) -> bool {
    if bond.valid && bond.maturity_date <= now {
        bond.valid = false;
        true
    } else {
        false
    }
}

/// Debit an account, refusing to go negative
pub fn debit(account: &mut UserAccount, amount: Amount) -> LedgerResult<()> {
    if account.balance < amount {
        return Err(LedgerError::InsufficientFunds {
            required: amount,
            available: account.balance,
        });
    }
    account.balance -= amount;
    Ok(())
}

pub fn credit(account: &mut UserAccount, amount: Amount) -> LedgerResult<()> {
    if amount < 0 {
        return Err(LedgerError::invariant(
            "account_credit",
            format!("negative credit {} to {}", amount, account.id),
        ));
    }
    account.balance = account
        .balance
        .checked_add(amount)
        .ok_or_else(|| LedgerError::overflow("account credit"))?;
    Ok(())
}

/// Check the bond inventory invariant over a full snapshot:
/// `0 <= available <= original` and active principal per bond equals
/// `original - available`.
pub fn verify_inventory<'a, B, T>(bonds: B, tokens: T) -> LedgerResult<()>
where
    B: IntoIterator<Item = &'a Bond>,
    T: IntoIterator<Item = &'a InvestmentToken>,
{
    let mut committed: HashMap<BondId, Amount> = HashMap::new();
    for token in tokens.into_iter().filter(|t| t.is_valid()) {
        if token.amount_invested <= 0 {
            return Err(LedgerError::invariant(
                "token_amount",
                format!("token {} has amount {}", token.id, token.amount_invested),
            ));
        }
        *committed.entry(token.bond_id).or_default() += token.amount_invested;
    }

    for bond in bonds {
        if bond.available_amount < 0 || bond.available_amount > bond.original_amount {
            return Err(LedgerError::invariant(
                "bond_inventory",
                format!(
                    "bond {} has available {} of original {}",
                    bond.id, bond.available_amount, bond.original_amount
                ),
            ));
        }
        let active = committed.remove(&bond.id).unwrap_or(0);
        if active != bond.committed_amount() {
            return Err(LedgerError::invariant(
                "bond_inventory",
                format!(
                    "bond {} has {} committed but {} in active tokens",
                    bond.id,
                    bond.committed_amount(),
                    active
                ),
            ));
        }
    }

    if let Some((bond_id, _)) = committed.into_iter().next() {
        return Err(LedgerError::invariant(
            "bond_inventory",
            format!("active tokens reference unknown bond {}", bond_id),
        ));
    }
    Ok(())
}

/// Check balances and withdrawal pointers over a full snapshot
pub fn verify_accounts<'a, A, W>(accounts: A, requests: W) -> LedgerResult<()>
where
    A: IntoIterator<Item = &'a UserAccount>,
    W: IntoIterator<Item = &'a WithdrawalRequest>,
{
    let mut pending: HashMap<UserId, Vec<WithdrawalId>> = HashMap::new();
    for request in requests.into_iter().filter(|r| r.valid) {
        pending.entry(request.user_id).or_default().push(request.id);
    }

    for account in accounts {
        if account.balance < 0 {
            return Err(LedgerError::invariant(
                "account_balance",
                format!("account {} has balance {}", account.id, account.balance),
            ));
        }
        let outstanding = pending.remove(&account.id).unwrap_or_default();
        let consistent = match account.pending_withdrawal_request_id {
            Some(id) => outstanding == [id],
            None => outstanding.is_empty(),
        };
        if !consistent {
            return Err(LedgerError::invariant(
                "withdrawal_pointer",
                format!(
                    "account {} points at {:?} with {} outstanding requests",
                    account.id,
                    account.pending_withdrawal_request_id,
                    outstanding.len()
                ),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::{AllocationEngine, PurchaseTerms};
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn bond(original: Amount) -> Bond {
        NewBond {
            tenor_days: 90,
            issue_date: t0(),
            interest_rate: dec!(20),
            amount: original,
            maturity_date: None,
        }
        .into_bond()
        .unwrap()
    }

    #[test]
    fn test_token_transitions_are_terminal() {
        let b = bond(1_000);
        let engine = AllocationEngine::new();
        let plan = engine.allocate([&b], t0(), 90, 1_000).unwrap();
        let terms = PurchaseTerms {
            user_id: UserId::new(),
            holding_id: HoldingId::new(),
            rate: InterestRateRecord::new(t0(), dec!(13)).unwrap(),
            tenor_days: 90,
            investment_date: t0(),
        };
        let mut token = engine.build_tokens(&plan, &terms).remove(0);

        assert!(close_token(&mut token, TokenState::Active).is_err());
        close_token(&mut token, TokenState::RedeemedEarly).unwrap();
        assert!(!token.is_valid());
        assert!(matches!(
            close_token(&mut token, TokenState::Matured),
            Err(LedgerError::HoldingNotActive { .. })
        ));
    }

    #[test]
    fn test_replenish_round_trip() {
        let mut b = bond(10_000);
        consume(&mut b, 3_000).unwrap();
        consume(&mut b, 2_000).unwrap();
        assert_eq!(b.available_amount, 5_000);
        replenish(&mut b, 3_000).unwrap();
        replenish(&mut b, 2_000).unwrap();
        assert_eq!(b.available_amount, 10_000);
    }

    #[test]
    fn test_replenish_overflow_is_internal() {
        let mut b = bond(10_000);
        consume(&mut b, 1_000).unwrap();
        let err = replenish(&mut b, 1_500).unwrap_err();
        assert!(matches!(err, LedgerError::InvariantViolation { .. }));
        assert_eq!(b.available_amount, 9_000);
    }

    #[test]
    fn test_consume_beyond_available_is_internal() {
        let mut b = bond(1_000);
        assert!(consume(&mut b, 1_500).is_err());
        assert!(consume(&mut b, 0).is_err());
        assert_eq!(b.available_amount, 1_000);
    }

    #[test]
    fn test_retire_once() {
        let mut b = bond(1_000);
        assert!(!retire_if_matured(&mut b, t0() + Duration::days(89)));
        assert!(retire_if_matured(&mut b, t0() + Duration::days(90)));
        assert!(!retire_if_matured(&mut b, t0() + Duration::days(91)));
        assert!(replenish(&mut b, 0).is_err());
    }

    #[test]
    fn test_debit_refuses_overdraft() {
        let mut account = UserAccount::new(UserId::new(), t0());
        credit(&mut account, 500).unwrap();
        assert_eq!(
            debit(&mut account, 600),
            Err(LedgerError::InsufficientFunds { required: 600, available: 500 })
        );
        debit(&mut account, 500).unwrap();
        assert_eq!(account.balance, 0);
    }

    #[test]
    fn test_verify_inventory_detects_drift() {
        let mut b = bond(10_000);
        let engine = AllocationEngine::new();
        let plan = engine.allocate([&b], t0(), 90, 3_000).unwrap();
        let terms = PurchaseTerms {
            user_id: UserId::new(),
            holding_id: HoldingId::new(),
            rate: InterestRateRecord::new(t0(), dec!(13)).unwrap(),
            tenor_days: 90,
            investment_date: t0(),
        };
        let tokens = engine.build_tokens(&plan, &terms);

        assert!(verify_inventory([&b], &tokens).is_err());
        consume(&mut b, 3_000).unwrap();
        assert!(verify_inventory([&b], &tokens).is_ok());
    }

    #[test]
    fn test_verify_accounts_pointer() {
        let mut account = UserAccount::new(UserId::new(), t0());
        let request = WithdrawalRequest {
            id: WithdrawalId::new(),
            user_id: account.id,
            amount: 100,
            request_date: t0(),
            valid: true,
            resolved_at: None,
        };
        assert!(verify_accounts([&account], [&request]).is_err());
        account.pending_withdrawal_request_id = Some(request.id);
        assert!(verify_accounts([&account], [&request]).is_ok());
    }
}

//! Product Rules
//!
//! Amount/tenor constraints for purchases and the tax/fee schedule used by
//! the accrual calculator. Both are plain data so they can be loaded from
//! configuration.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::error::{LedgerError, LedgerResult};
use crate::types::Amount;

/// Purchase constraints
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductRules {
    /// Purchases must be a multiple of this unit
    pub unit_amount: Amount,
    pub min_amount: Amount,
    pub max_amount: Amount,
    /// Offered tenors in days
    pub allowed_tenors: Vec<u32>,
}

impl Default for ProductRules {
    fn default() -> Self {
        Self {
            unit_amount: 500,
            min_amount: 1_000,
            max_amount: 50_000,
            allowed_tenors: vec![90, 180, 270],
        }
    }
}

impl ProductRules {
    /// Check a purchase request against the rules.
    ///
    /// Runs before any transaction opens.
    pub fn validate_purchase(&self, amount: Amount, tenor_days: u32) -> LedgerResult<()> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount {
                amount,
                reason: "amount must be positive".to_string(),
            });
        }
        if amount < self.min_amount || amount > self.max_amount {
            return Err(LedgerError::InvalidAmount {
                amount,
                reason: format!("amount must be within [{}, {}]", self.min_amount, self.max_amount),
            });
        }
        if self.unit_amount > 0 && amount % self.unit_amount != 0 {
            return Err(LedgerError::InvalidAmount {
                amount,
                reason: format!("amount must be a multiple of {}", self.unit_amount),
            });
        }
        if !self.allowed_tenors.contains(&tenor_days) {
            return Err(LedgerError::UnsupportedTenor { tenor_days });
        }
        Ok(())
    }

    /// Check a deposit or withdrawal amount
    pub fn validate_transfer(&self, amount: Amount) -> LedgerResult<()> {
        if amount <= 0 {
            return Err(LedgerError::InvalidTransferAmount { amount });
        }
        Ok(())
    }
}

/// Tax and fee schedule
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeSchedule {
    /// Withholding tax applied to gross interest
    pub tax_rate: Decimal,
    /// Annualised holding fee on principal
    pub holding_fee_rate: Decimal,
    /// Flat fee per early redemption
    pub early_exit_fee_rate: Decimal,
    /// Day-count denominator
    pub day_count_basis: u32,
}

impl Default for FeeSchedule {
    fn default() -> Self {
        Self {
            tax_rate: dec!(0.15),
            holding_fee_rate: dec!(0.01),
            early_exit_fee_rate: dec!(0.0025),
            day_count_basis: 360,
        }
    }
}

impl FeeSchedule {
    /// Share of gross interest kept by the investor
    pub fn net_of_tax(&self) -> Decimal {
        Decimal::ONE - self.tax_rate
    }

    pub fn validate(&self) -> LedgerResult<()> {
        let in_unit = |d: Decimal| !d.is_sign_negative() && d <= Decimal::ONE;
        if !in_unit(self.tax_rate) || !in_unit(self.holding_fee_rate) || !in_unit(self.early_exit_fee_rate) {
            return Err(LedgerError::InvalidRate {
                reason: "fee and tax rates must lie within [0, 1]".to_string(),
            });
        }
        if self.day_count_basis == 0 {
            return Err(LedgerError::InvalidRate {
                reason: "day count basis must be positive".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_purchase_bounds() {
        let rules = ProductRules::default();
        assert!(rules.validate_purchase(1_000, 90).is_ok());
        assert!(rules.validate_purchase(50_000, 270).is_ok());
        assert!(rules.validate_purchase(3_500, 180).is_ok());

        assert!(matches!(
            rules.validate_purchase(500, 90),
            Err(LedgerError::InvalidAmount { .. })
        ));
        assert!(matches!(
            rules.validate_purchase(50_500, 90),
            Err(LedgerError::InvalidAmount { .. })
        ));
        assert!(matches!(
            rules.validate_purchase(1_250, 90),
            Err(LedgerError::InvalidAmount { .. })
        ));
        assert!(matches!(
            rules.validate_purchase(-1_000, 90),
            Err(LedgerError::InvalidAmount { .. })
        ));
    }

    #[test]
    fn test_unsupported_tenor() {
        let rules = ProductRules::default();
        assert_eq!(
            rules.validate_purchase(1_000, 30),
            Err(LedgerError::UnsupportedTenor { tenor_days: 30 })
        );
    }

    #[test]
    fn test_transfer_amount() {
        let rules = ProductRules::default();
        assert!(rules.validate_transfer(1).is_ok());
        assert!(rules.validate_transfer(0).is_err());
    }

    #[test]
    fn test_fee_schedule_defaults() {
        let fees = FeeSchedule::default();
        assert!(fees.validate().is_ok());
        assert_eq!(fees.net_of_tax(), dec!(0.85));

        let bad = FeeSchedule {
            day_count_basis: 0,
            ..FeeSchedule::default()
        };
        assert!(bad.validate().is_err());
    }
}

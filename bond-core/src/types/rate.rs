//! Interest Rate Types

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use super::common::RateId;
use crate::error::{LedgerError, LedgerResult};

/// Upper bound accepted for a published rate (percent per annum)
pub const MAX_RATE_PERCENT: Decimal = dec!(100);

/// Append-only platform rate record
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterestRateRecord {
    pub id: RateId,
    pub effective_date: DateTime<Utc>,
    /// Percent per annum, e.g. `13` for 13%
    pub rate: Decimal,
}

impl InterestRateRecord {
    pub fn new(effective_date: DateTime<Utc>, rate: Decimal) -> LedgerResult<Self> {
        if rate.is_sign_negative() || rate > MAX_RATE_PERCENT {
            return Err(LedgerError::InvalidRate {
                reason: format!("rate {} outside [0, {}]", rate, MAX_RATE_PERCENT),
            });
        }
        Ok(Self {
            id: RateId::new(),
            effective_date,
            rate,
        })
    }

    /// Whether this record supersedes `other` as the current rate
    pub fn is_newer_than(&self, other: &InterestRateRecord) -> bool {
        (self.effective_date, self.id) > (other.effective_date, other.id)
    }
}

/// Most recent record by effective date (ties broken by id)
pub fn current_rate<'a, I>(records: I) -> Option<&'a InterestRateRecord>
where
    I: IntoIterator<Item = &'a InterestRateRecord>,
{
    records
        .into_iter()
        .max_by_key(|r| (r.effective_date, r.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_rate_bounds() {
        let now = Utc::now();
        assert!(InterestRateRecord::new(now, dec!(13)).is_ok());
        assert!(InterestRateRecord::new(now, dec!(-1)).is_err());
        assert!(InterestRateRecord::new(now, dec!(100.5)).is_err());
    }

    #[test]
    fn test_current_rate_picks_latest_effective_date() {
        let now = Utc::now();
        let older = InterestRateRecord::new(now - Duration::days(10), dec!(12)).unwrap();
        let newer = InterestRateRecord::new(now, dec!(14)).unwrap();
        let records = vec![newer.clone(), older];
        assert_eq!(current_rate(&records).map(|r| r.rate), Some(dec!(14)));
        assert!(current_rate(std::iter::empty()).is_none());
    }
}

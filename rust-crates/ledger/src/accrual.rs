//! Pure time-based balance computation.
//!
//! Nothing in here touches storage or the clock; every function is a plain
//! function of its inputs and can be called from any thread as often as
//! needed.

use chrono::{
    DateTime,
    Utc,
};
use rust_decimal::{
    Decimal,
    RoundingStrategy,
};
use serde::{
    Deserialize,
    Serialize,
};
use std::{
    fmt,
    iter::Sum,
    ops::Add,
};

pub const MILLIS_PER_DAY: i64 = 86_400_000;
const SECONDS_PER_DAY: i64 = 86_400;
const HOURS_PER_DAY: i64 = 24;
/// Decimal places kept on accrued amounts. Truncated so that the balance,
/// `cumulative_earned` and their sums stay exact.
pub const ACCRUAL_SCALE: u32 = 8;

/// Accrual rate.
///
/// Stored as an amount per day so that per-second, per-hour and per-day game
/// rates all convert without rounding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Rate(Decimal);

impl Rate {
    pub const ZERO: Rate = Rate(Decimal::ZERO);

    // Conversions and combinations saturate at `Decimal::MAX`; a saturated
    // rate still fails the overflow checks on the amounts it produces.
    pub fn per_second(amount: Decimal) -> Self {
        Self(amount.saturating_mul(Decimal::from(SECONDS_PER_DAY)))
    }

    pub fn per_hour(amount: Decimal) -> Self {
        Self(amount.saturating_mul(Decimal::from(HOURS_PER_DAY)))
    }

    pub fn per_day(amount: Decimal) -> Self {
        Self(amount)
    }

    pub fn as_per_second(self) -> Decimal {
        self.0 / Decimal::from(SECONDS_PER_DAY)
    }

    pub fn as_per_hour(self) -> Decimal {
        self.0 / Decimal::from(HOURS_PER_DAY)
    }

    pub fn as_per_day(self) -> Decimal {
        self.0
    }

    pub fn scaled(self, factor: Decimal) -> Self {
        Self(self.0.saturating_mul(factor))
    }

    pub fn is_zero(self) -> bool {
        self.0 <= Decimal::ZERO
    }
}

impl Add for Rate {
    type Output = Rate;

    fn add(self, rhs: Rate) -> Rate {
        Rate(self.0.saturating_add(rhs.0))
    }
}

impl Sum for Rate {
    fn sum<I: Iterator<Item = Rate>>(iter: I) -> Rate {
        iter.fold(Rate::ZERO, Add::add)
    }
}

impl fmt::Display for Rate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/h", self.as_per_hour().normalize())
    }
}

/// Time-boxed buff applied on top of the composite rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateMultiplier {
    factor: Decimal,
    expires_at: Option<DateTime<Utc>>,
}

impl RateMultiplier {
    /// `None` for a negative factor.
    pub fn new(factor: Decimal, expires_at: Option<DateTime<Utc>>) -> Option<Self> {
        (factor >= Decimal::ZERO).then_some(Self { factor, expires_at })
    }

    pub fn factor(&self) -> Decimal {
        self.factor
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    pub fn is_expired_at(&self, at: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expiry| expiry <= at)
    }
}

/// `now` was earlier than the last checkpoint. Absorbed by treating the
/// elapsed time as zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockAnomaly {
    pub last_checkpoint: DateTime<Utc>,
    pub now: DateTime<Utc>,
}

impl ClockAnomaly {
    pub fn skew_millis(&self) -> i64 {
        (self.last_checkpoint - self.now).num_milliseconds()
    }
}

impl fmt::Display for ClockAnomaly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "clock is {}ms behind the last checkpoint ({})",
            self.skew_millis(),
            self.last_checkpoint
        )
    }
}

/// Inputs of the balance function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccrualTerms {
    pub baseline: Decimal,
    pub rate: Rate,
    pub multiplier: Option<RateMultiplier>,
    pub last_checkpoint: DateTime<Utc>,
    pub is_active: bool,
    pub cap: Option<Decimal>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Accrual {
    pub balance: Decimal,
    /// Amount added on top of the baseline; what a rebase folds into
    /// `cumulative_earned`.
    pub accrued: Decimal,
    pub clock_anomaly: Option<ClockAnomaly>,
}

/// `baseline + rate * multiplier * max(0, now - last_checkpoint)`.
///
/// A multiplier with an expiry only boosts the part of the window before the
/// expiry. Accrual is truncated to [`ACCRUAL_SCALE`] decimal places. With a
/// cap, accrual stops at the cap and never lowers a baseline already above it.
pub fn current_balance(terms: &AccrualTerms, now: DateTime<Utc>) -> Accrual {
    if !terms.is_active {
        return Accrual {
            balance: terms.baseline,
            accrued: Decimal::ZERO,
            clock_anomaly: None,
        };
    }

    let mut elapsed = (now - terms.last_checkpoint).num_milliseconds();
    let clock_anomaly = if elapsed < 0 {
        elapsed = 0;
        Some(ClockAnomaly {
            last_checkpoint: terms.last_checkpoint,
            now,
        })
    } else {
        None
    };

    let (boosted, factor) = match terms.multiplier {
        Some(multiplier) => {
            let boosted = match multiplier.expires_at {
                Some(expiry) => (expiry - terms.last_checkpoint)
                    .num_milliseconds()
                    .clamp(0, elapsed),
                None => elapsed,
            };
            (boosted, multiplier.factor)
        }
        None => (0, Decimal::ONE),
    };
    let plain = elapsed - boosted;

    let weighted_millis = Decimal::from(boosted)
        .checked_mul(factor)
        .and_then(|boosted| boosted.checked_add(Decimal::from(plain)))
        .unwrap_or(Decimal::MAX);
    let raw = terms
        .rate
        .as_per_day()
        .checked_mul(weighted_millis)
        .map(|product| {
            (product / Decimal::from(MILLIS_PER_DAY))
                .round_dp_with_strategy(ACCRUAL_SCALE, RoundingStrategy::ToZero)
        })
        .unwrap_or(Decimal::MAX);

    let accrued = match terms.cap {
        Some(cap) if terms.baseline >= cap => Decimal::ZERO,
        Some(cap) => raw.min(cap - terms.baseline),
        None => raw,
    };

    Accrual {
        balance: terms.baseline.saturating_add(accrued),
        accrued,
        clock_anomaly,
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;
    use chrono::{
        Duration,
        TimeZone,
    };
    use rust_decimal_macros::dec;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap()
    }

    fn terms(baseline: Decimal, rate: Rate) -> AccrualTerms {
        AccrualTerms {
            baseline,
            rate,
            multiplier: None,
            last_checkpoint: t0(),
            is_active: true,
            cap: None,
        }
    }

    #[test]
    fn current_balance__hourly_rate__accrues_exactly() {
        // given
        let terms = terms(dec!(100), Rate::per_hour(dec!(10)));

        // when
        let accrual = current_balance(&terms, t0() + Duration::hours(2));

        // then
        assert_eq!(accrual.balance, dec!(120));
        assert_eq!(accrual.accrued, dec!(20));
        assert!(accrual.clock_anomaly.is_none());
    }

    #[test]
    fn current_balance__per_second_rate__accrues_per_second() {
        let terms = terms(Decimal::ZERO, Rate::per_second(Decimal::ONE));

        let accrual = current_balance(&terms, t0() + Duration::seconds(90));

        assert_eq!(accrual.balance, dec!(90));
    }

    #[test]
    fn current_balance__inactive__returns_baseline() {
        // given
        let mut terms = terms(dec!(42), Rate::per_hour(dec!(1000)));
        terms.is_active = false;

        // when
        let accrual = current_balance(&terms, t0() + Duration::days(3));

        // then
        assert_eq!(accrual.balance, dec!(42));
        assert_eq!(accrual.accrued, Decimal::ZERO);
    }

    #[test]
    fn current_balance__clock_rollback__reports_anomaly_without_accrual() {
        // given
        let terms = terms(dec!(100), Rate::per_hour(dec!(10)));
        let now = t0() - Duration::minutes(5);

        // when
        let accrual = current_balance(&terms, now);

        // then
        assert_eq!(accrual.balance, dec!(100));
        let anomaly = accrual.clock_anomaly.expect("rollback is reported");
        assert_eq!(anomaly.skew_millis(), 5 * 60 * 1000);
    }

    #[test]
    fn current_balance__multiplier_expires_mid_window__boosts_only_until_expiry() {
        // given
        let mut terms = terms(Decimal::ZERO, Rate::per_hour(dec!(10)));
        terms.multiplier =
            RateMultiplier::new(dec!(2), Some(t0() + Duration::hours(1)));

        // when
        let accrual = current_balance(&terms, t0() + Duration::hours(3));

        // then
        // 1h at 20/h plus 2h at 10/h
        assert_eq!(accrual.balance, dec!(40));
    }

    #[test]
    fn current_balance__open_ended_multiplier__boosts_whole_window() {
        let mut terms = terms(Decimal::ZERO, Rate::per_hour(dec!(10)));
        terms.multiplier = RateMultiplier::new(dec!(1.5), None);

        let accrual = current_balance(&terms, t0() + Duration::hours(2));

        assert_eq!(accrual.balance, dec!(30));
    }

    #[test]
    fn current_balance__cap__stops_accrual_at_cap() {
        // given
        let mut terms = terms(dec!(49990), Rate::per_hour(dec!(100)));
        terms.cap = Some(dec!(50000));

        // when
        let accrual = current_balance(&terms, t0() + Duration::hours(5));

        // then
        assert_eq!(accrual.balance, dec!(50000));
        assert_eq!(accrual.accrued, dec!(10));
    }

    #[test]
    fn current_balance__baseline_above_cap__is_left_untouched() {
        let mut terms = terms(dec!(60000), Rate::per_hour(dec!(100)));
        terms.cap = Some(dec!(50000));

        let accrual = current_balance(&terms, t0() + Duration::hours(5));

        assert_eq!(accrual.balance, dec!(60000));
        assert_eq!(accrual.accrued, Decimal::ZERO);
    }

    #[test]
    fn multiplier__negative_factor__is_rejected() {
        assert!(RateMultiplier::new(dec!(-1), None).is_none());
    }

    #[test]
    fn rate__huge_amounts__saturate_instead_of_panicking() {
        // when
        let hourly = Rate::per_hour(Decimal::MAX);
        let per_second = Rate::per_second(Decimal::MAX / dec!(2));
        let boosted = Rate::per_day(Decimal::MAX).scaled(dec!(3));
        let sum = Rate::per_day(Decimal::MAX) + Rate::per_day(Decimal::ONE);

        // then
        assert_eq!(hourly, Rate::per_day(Decimal::MAX));
        assert_eq!(per_second, Rate::per_day(Decimal::MAX));
        assert_eq!(boosted, Rate::per_day(Decimal::MAX));
        assert_eq!(sum, Rate::per_day(Decimal::MAX));
    }
}

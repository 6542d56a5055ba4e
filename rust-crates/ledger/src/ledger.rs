use crate::{
    LedgerError,
    Result,
    accrual::{
        Accrual,
        AccrualTerms,
        Rate,
        RateMultiplier,
        current_balance,
    },
    rate::RateSource,
    resource::{
        AssetId,
        LedgerKey,
    },
};
use chrono::{
    DateTime,
    Utc,
};
use rust_decimal::Decimal;
use serde::{
    Deserialize,
    Serialize,
};

/// Persisted accrual state of one `(wallet, resource)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ledger {
    pub(crate) key: LedgerKey,
    pub(crate) baseline: Decimal,
    pub(crate) rate: Rate,
    pub(crate) rate_multiplier: Option<RateMultiplier>,
    pub(crate) last_checkpoint_time: DateTime<Utc>,
    pub(crate) cumulative_earned: Decimal,
    pub(crate) cumulative_spent: Decimal,
    pub(crate) is_active: bool,
    /// Accrual stopped by reconciliation after repeated ownership lookups
    /// failed. Independent of whether the wallet holds rate-producing assets.
    pub(crate) suspended: bool,
    pub(crate) rate_source: RateSource,
    pub(crate) rate_fingerprint: String,
    pub(crate) degraded: bool,
    /// Asset swaps performed so far; drives the escalating swap cost.
    #[serde(default)]
    pub(crate) swaps: u32,
    pub(crate) version: u64,
    pub(crate) created_at: DateTime<Utc>,
}

impl Ledger {
    pub fn new(key: LedgerKey, at: DateTime<Utc>) -> Self {
        let rate_source = RateSource::new();
        let rate_fingerprint = rate_source.fingerprint();
        Self {
            key,
            baseline: Decimal::ZERO,
            rate: Rate::ZERO,
            rate_multiplier: None,
            last_checkpoint_time: at,
            cumulative_earned: Decimal::ZERO,
            cumulative_spent: Decimal::ZERO,
            is_active: false,
            suspended: false,
            rate_source,
            rate_fingerprint,
            degraded: false,
            swaps: 0,
            version: 0,
            created_at: at,
        }
    }

    pub fn key(&self) -> &LedgerKey {
        &self.key
    }

    pub fn baseline(&self) -> Decimal {
        self.baseline
    }

    pub fn rate(&self) -> Rate {
        self.rate
    }

    pub fn rate_per_second(&self) -> Decimal {
        self.rate.as_per_second()
    }

    pub fn rate_multiplier(&self) -> Option<RateMultiplier> {
        self.rate_multiplier
    }

    pub fn last_checkpoint_time(&self) -> DateTime<Utc> {
        self.last_checkpoint_time
    }

    pub fn cumulative_earned(&self) -> Decimal {
        self.cumulative_earned
    }

    pub fn cumulative_spent(&self) -> Decimal {
        self.cumulative_spent
    }

    pub fn is_active(&self) -> bool {
        self.is_active
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    pub fn rate_source(&self) -> &RateSource {
        &self.rate_source
    }

    pub fn rate_fingerprint(&self) -> &str {
        &self.rate_fingerprint
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub fn swaps(&self) -> u32 {
        self.swaps
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn accrual_terms(&self, cap: Option<Decimal>) -> AccrualTerms {
        AccrualTerms {
            baseline: self.baseline,
            rate: self.rate,
            multiplier: self.rate_multiplier,
            last_checkpoint: self.last_checkpoint_time,
            is_active: self.is_active,
            cap,
        }
    }

    pub fn balance_at(&self, now: DateTime<Utc>, cap: Option<Decimal>) -> Accrual {
        current_balance(&self.accrual_terms(cap), now)
    }

    /// Total earned including what has accrued since the last checkpoint.
    pub fn earned_at(&self, now: DateTime<Utc>, cap: Option<Decimal>) -> Decimal {
        self.cumulative_earned
            .saturating_add(self.balance_at(now, cap).accrued)
    }

    /// How far `cumulative_earned` falls short of `baseline + spent`.
    ///
    /// Pending accrual raises both sides of the invariant by the same amount,
    /// so the shortfall does not depend on the time it is evaluated at.
    pub fn shortfall(&self) -> Decimal {
        self.baseline
            .saturating_add(self.cumulative_spent)
            .saturating_sub(self.cumulative_earned)
            .max(Decimal::ZERO)
    }

    /// Fold accrual up to `at` into the baseline.
    ///
    /// The checkpoint time never moves backwards: a rebase at an instant
    /// before the last checkpoint accrues nothing and keeps the checkpoint
    /// where it is, so the same window is never credited twice. Fails
    /// without touching the ledger when `cumulative_earned` would overflow.
    pub(crate) fn rebase(&mut self, at: DateTime<Utc>, cap: Option<Decimal>) -> Result<Accrual> {
        let accrual = self.balance_at(at, cap);
        let earned = self.checked(self.cumulative_earned.checked_add(accrual.accrued))?;
        self.baseline = accrual.balance;
        self.cumulative_earned = earned;
        if at > self.last_checkpoint_time {
            self.last_checkpoint_time = at;
        }
        if self
            .rate_multiplier
            .is_some_and(|multiplier| multiplier.is_expired_at(self.last_checkpoint_time))
        {
            self.rate_multiplier = None;
        }
        Ok(accrual)
    }

    pub(crate) fn checked(&self, amount: Option<Decimal>) -> Result<Decimal> {
        amount.ok_or_else(|| LedgerError::Overflow {
            key: self.key.clone(),
        })
    }

    pub(crate) fn refresh_activity(&mut self, at: DateTime<Utc>) {
        let running = !self.suspended && !self.rate.is_zero();
        if running && !self.is_active && at > self.last_checkpoint_time {
            self.last_checkpoint_time = at;
        }
        self.is_active = running;
    }
}

/// Append-only record of one committed ledger change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub key: LedgerKey,
    pub at: DateTime<Utc>,
    pub kind: AuditKind,
    pub amount: Decimal,
    pub baseline: Decimal,
    pub cumulative_earned: Decimal,
    pub cumulative_spent: Decimal,
    pub rate: Rate,
    /// Ledger version this record was committed with. Unique per ledger.
    pub version: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditKind {
    Credit { reason: String },
    Spend,
    Checkpoint,
    RateChange { fingerprint: String },
    Multiplier { factor: Option<Decimal> },
    Activation { active: bool },
    Correction { operator: String },
    /// Marked degraded after a rejected transition; `amount` is the
    /// shortfall of the last committed state.
    Degraded { detail: String },
    Swap { removed: AssetId, added: AssetId },
    LevelUp { asset: AssetId, level: u8 },
    Restore { operator: String },
}

impl AuditRecord {
    /// Describe `ledger` as it will be committed. `version` must already be
    /// the version being written.
    pub(crate) fn of(
        ledger: &Ledger,
        at: DateTime<Utc>,
        kind: AuditKind,
        amount: Decimal,
    ) -> Self {
        Self {
            key: ledger.key.clone(),
            at,
            kind,
            amount,
            baseline: ledger.baseline,
            cumulative_earned: ledger.cumulative_earned,
            cumulative_spent: ledger.cumulative_spent,
            rate: ledger.rate,
            version: ledger.version,
        }
    }

    /// `wallet|resource|<millis be>|<version be>`: per-ledger, time ordered.
    pub fn storage_key(&self) -> Vec<u8> {
        let mut key = self.key.record_prefix();
        key.extend_from_slice(&timestamp_bytes(self.at));
        key.extend_from_slice(&self.version.to_be_bytes());
        key
    }
}

pub(crate) fn timestamp_bytes(at: DateTime<Utc>) -> [u8; 8] {
    u64::try_from(at.timestamp_millis())
        .unwrap_or_default()
        .to_be_bytes()
}

/// Timestamp stored in the 8 bytes preceding the trailing 8-byte sequence of
/// an audit or snapshot key.
pub(crate) fn record_key_millis(key: &[u8]) -> Option<u64> {
    let len = key.len();
    let bytes: [u8; 8] = key.get(len.checked_sub(16)?..len - 8)?.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

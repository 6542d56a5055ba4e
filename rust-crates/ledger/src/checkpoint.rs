//! Persisted ledger operations.
//!
//! Every mutation reads the stored ledger, applies its change to a copy,
//! runs the invariant guard on the transition and commits against the
//! version it read. A lost race is retried from a fresh read.

use crate::{
    LedgerError,
    Result,
    accrual::{
        Rate,
        RateMultiplier,
    },
    config::LedgerConfig,
    guard::InvariantGuard,
    ledger::{
        AuditKind,
        AuditRecord,
        Ledger,
    },
    rate::{
        AssetContribution,
        RateApplication,
        RateDeterminant,
        RateSource,
    },
    resource::{
        AssetId,
        LedgerKey,
    },
    storage::{
        CommitOutcome,
        LedgerStorage,
    },
};
use chrono::{
    DateTime,
    Duration,
    Utc,
};
use rust_decimal::Decimal;
use serde::{
    Deserialize,
    Serialize,
};
use std::collections::{
    BTreeMap,
    BTreeSet,
};

pub(crate) const CHECKPOINT_SWEEP_JOB: &str = "checkpoint_sweep";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointOutcome {
    Applied { balance: Decimal },
    /// Requested within the debounce window of the previous checkpoint.
    Debounced { last_checkpoint: DateTime<Utc> },
    /// Nothing to fold: the ledger is frozen or `now` is not after the last
    /// checkpoint.
    Skipped,
}

/// Rate currently in effect on a ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateView {
    pub key: LedgerKey,
    pub base_rate: Rate,
    /// Base rate times the multiplier, if one is running at the read instant.
    pub effective_rate: Rate,
    pub multiplier: Option<RateMultiplier>,
    pub is_active: bool,
    pub suspended: bool,
    pub asset_ids: BTreeSet<AssetId>,
    pub fingerprint: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryWindow {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl HistoryWindow {
    /// Clamped to the earliest representable instant for windows reaching
    /// past it.
    pub fn last_hours(now: DateTime<Utc>, hours: u32) -> Self {
        let from = Duration::try_hours(i64::from(hours))
            .and_then(|span| now.checked_sub_signed(span))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        Self { from, to: now }
    }
}

/// Progress of one page of a batch job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub visited: usize,
    pub changed: usize,
    pub failed: usize,
    /// The job reached the end of the key space and its cursor was cleared.
    pub complete: bool,
}

impl SweepReport {
    pub(crate) fn absorb(&mut self, page: &SweepReport) {
        self.visited += page.visited;
        self.changed += page.changed;
        self.failed += page.failed;
        self.complete = page.complete;
    }
}

pub(crate) enum Step<T> {
    Commit {
        value: T,
        kind: AuditKind,
        amount: Decimal,
    },
    Skip(T),
}

pub(crate) struct Mutation<T> {
    pub ledger: Ledger,
    pub value: T,
}

#[derive(Clone)]
pub struct CheckpointStore<S> {
    storage: S,
    config: LedgerConfig,
}

impl<S: LedgerStorage> CheckpointStore<S> {
    pub fn new(storage: S, config: LedgerConfig) -> Self {
        Self { storage, config }
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub(crate) fn cap(&self, key: &LedgerKey) -> Option<Decimal> {
        self.config.cap(key.resource)
    }

    pub fn get_ledger(&self, key: &LedgerKey) -> Result<Ledger> {
        self.storage
            .ledger(key)?
            .ok_or_else(|| LedgerError::LedgerNotFound { key: key.clone() })
    }

    pub fn get_current_balance(&self, key: &LedgerKey, now: DateTime<Utc>) -> Result<Decimal> {
        let ledger = self.get_ledger(key)?;
        let accrual = ledger.balance_at(now, self.cap(key));
        if let Some(anomaly) = accrual.clock_anomaly {
            tracing::warn!("balance read on {key}: {anomaly}");
        }
        Ok(accrual.balance)
    }

    pub fn get_rate(&self, key: &LedgerKey, now: DateTime<Utc>) -> Result<RateView> {
        let ledger = self.get_ledger(key)?;
        let multiplier = ledger
            .rate_multiplier()
            .filter(|multiplier| !multiplier.is_expired_at(now));
        let effective_rate = match (ledger.is_active(), multiplier) {
            (false, _) => Rate::ZERO,
            (true, Some(multiplier)) => ledger.rate().scaled(multiplier.factor()),
            (true, None) => ledger.rate(),
        };
        Ok(RateView {
            key: key.clone(),
            base_rate: ledger.rate(),
            effective_rate,
            multiplier,
            is_active: ledger.is_active(),
            suspended: ledger.is_suspended(),
            asset_ids: ledger.rate_source().asset_ids(),
            fingerprint: ledger.rate_fingerprint().to_string(),
        })
    }

    pub fn get_ledger_history(
        &self,
        key: &LedgerKey,
        window: HistoryWindow,
    ) -> Result<Vec<AuditRecord>> {
        self.get_ledger(key)?;
        Ok(self.storage.audit_history(key, window.from, window.to)?)
    }

    /// Create a frozen, empty ledger for `key` unless one exists already.
    pub fn open_ledger(&self, key: &LedgerKey, now: DateTime<Utc>) -> Result<Ledger> {
        let mutation = self.mutate(key, now, true, |ledger| {
            if ledger.version() > 0 {
                return Ok(Step::Skip(()));
            }
            Ok(Step::Commit {
                value: (),
                kind: AuditKind::Activation { active: false },
                amount: Decimal::ZERO,
            })
        })?;
        Ok(mutation.ledger)
    }

    /// Fold accrual up to `now` into the baseline.
    pub fn apply_checkpoint(
        &self,
        key: &LedgerKey,
        now: DateTime<Utc>,
    ) -> Result<CheckpointOutcome> {
        let cap = self.cap(key);
        let debounce = i64::try_from(self.config.checkpoint_debounce_secs)
            .ok()
            .and_then(Duration::try_seconds)
            .unwrap_or(Duration::MAX);
        let mutation = self.mutate(key, now, false, |ledger| {
            let last_checkpoint = ledger.last_checkpoint_time();
            if !ledger.is_active() || now <= last_checkpoint {
                return Ok(Step::Skip(CheckpointOutcome::Skipped));
            }
            if now - last_checkpoint < debounce {
                return Ok(Step::Skip(CheckpointOutcome::Debounced { last_checkpoint }));
            }
            let accrual = ledger.rebase(now, cap)?;
            Ok(Step::Commit {
                value: CheckpointOutcome::Applied {
                    balance: accrual.balance,
                },
                kind: AuditKind::Checkpoint,
                amount: accrual.accrued,
            })
        })?;
        Ok(mutation.value)
    }

    pub fn spend(&self, key: &LedgerKey, amount: Decimal, now: DateTime<Utc>) -> Result<Ledger> {
        ensure_positive(amount)?;
        let cap = self.cap(key);
        let mutation = self.mutate(key, now, false, |ledger| {
            if ledger.is_degraded() {
                return Err(LedgerError::LedgerDegraded {
                    key: ledger.key().clone(),
                });
            }
            ledger.rebase(now, cap)?;
            if ledger.baseline < amount {
                return Err(LedgerError::InsufficientBalance {
                    key: ledger.key().clone(),
                    requested: amount,
                    available: ledger.baseline,
                });
            }
            let spent = ledger.checked(ledger.cumulative_spent.checked_add(amount))?;
            ledger.baseline -= amount;
            ledger.cumulative_spent = spent;
            Ok(Step::Commit {
                value: (),
                kind: AuditKind::Spend,
                amount,
            })
        })?;
        tracing::debug!("spent {amount} on {key}");
        Ok(mutation.ledger)
    }

    pub fn credit(
        &self,
        key: &LedgerKey,
        amount: Decimal,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Ledger> {
        ensure_positive(amount)?;
        let cap = self.cap(key);
        let mutation = self.mutate(key, now, false, |ledger| {
            if ledger.is_degraded() {
                return Err(LedgerError::LedgerDegraded {
                    key: ledger.key().clone(),
                });
            }
            ledger.rebase(now, cap)?;
            let baseline = ledger.checked(ledger.baseline.checked_add(amount))?;
            let earned = ledger.checked(ledger.cumulative_earned.checked_add(amount))?;
            ledger.baseline = baseline;
            ledger.cumulative_earned = earned;
            Ok(Step::Commit {
                value: (),
                kind: AuditKind::Credit {
                    reason: reason.to_string(),
                },
                amount,
            })
        })?;
        tracing::debug!("credited {amount} on {key} ({reason})");
        Ok(mutation.ledger)
    }

    /// Rebase under the current rate, then switch to `source`. Creates the
    /// ledger on first application.
    pub fn apply_rate_source(
        &self,
        key: &LedgerKey,
        source: &RateSource,
        now: DateTime<Utc>,
    ) -> Result<RateApplication> {
        let cap = self.cap(key);
        let mutation = self.mutate(key, now, true, |ledger| {
            let application = RateDeterminant::apply(ledger, source, now, cap)?;
            if !application.is_applied() {
                return Ok(Step::Skip(application));
            }
            Ok(Step::Commit {
                value: application,
                kind: AuditKind::RateChange {
                    fingerprint: ledger.rate_fingerprint().to_string(),
                },
                amount: Decimal::ZERO,
            })
        })?;
        log_application(key, &mutation.value);
        Ok(mutation.value)
    }

    /// Drop `lost` from the stored rate source and add the `gained` assets it
    /// does not hold yet, all against the ledger as it is at commit time.
    ///
    /// Assets already in the source keep their level. The ledger is created
    /// only when there is something to add. Returns `None` when there is no
    /// ledger and nothing to add.
    pub fn reconcile_assets(
        &self,
        key: &LedgerKey,
        lost: &BTreeSet<AssetId>,
        gained: &BTreeMap<AssetId, AssetContribution>,
        now: DateTime<Utc>,
    ) -> Result<Option<Ledger>> {
        let cap = self.cap(key);
        let result = self.mutate(key, now, !gained.is_empty(), |ledger| {
            let mut source = ledger.rate_source().without(lost);
            for (asset, contribution) in gained {
                if !source.contains(asset) {
                    source.insert(asset.clone(), *contribution);
                }
            }
            let application = RateDeterminant::apply(ledger, &source, now, cap)?;
            if !application.is_applied() {
                return Ok(Step::Skip(application));
            }
            Ok(Step::Commit {
                value: application,
                kind: AuditKind::RateChange {
                    fingerprint: ledger.rate_fingerprint().to_string(),
                },
                amount: Decimal::ZERO,
            })
        });
        match result {
            Ok(mutation) => {
                log_application(key, &mutation.value);
                Ok(Some(mutation.ledger))
            }
            Err(LedgerError::LedgerNotFound { .. }) => Ok(None),
            Err(error) => Err(error),
        }
    }

    pub fn set_rate_multiplier(
        &self,
        key: &LedgerKey,
        factor: Decimal,
        expires_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<Ledger> {
        let multiplier =
            RateMultiplier::new(factor, expires_at).ok_or(LedgerError::InvalidMultiplier { factor })?;
        self.replace_multiplier(key, Some(multiplier), now)
    }

    pub fn clear_rate_multiplier(&self, key: &LedgerKey, now: DateTime<Utc>) -> Result<Ledger> {
        self.replace_multiplier(key, None, now)
    }

    fn replace_multiplier(
        &self,
        key: &LedgerKey,
        multiplier: Option<RateMultiplier>,
        now: DateTime<Utc>,
    ) -> Result<Ledger> {
        let cap = self.cap(key);
        let mutation = self.mutate(key, now, false, |ledger| {
            ledger.rebase(now, cap)?;
            if ledger.rate_multiplier == multiplier {
                return Ok(Step::Skip(()));
            }
            ledger.rate_multiplier = multiplier;
            Ok(Step::Commit {
                value: (),
                kind: AuditKind::Multiplier {
                    factor: multiplier.map(|multiplier| multiplier.factor()),
                },
                amount: Decimal::ZERO,
            })
        })?;
        Ok(mutation.ledger)
    }

    /// Pause or resume accrual independently of the rate source. Returns the
    /// new activity when it changed.
    pub fn set_suspended(
        &self,
        key: &LedgerKey,
        suspended: bool,
        now: DateTime<Utc>,
    ) -> Result<Option<bool>> {
        let cap = self.cap(key);
        let mutation = self.mutate(key, now, false, |ledger| {
            if ledger.suspended == suspended {
                return Ok(Step::Skip(None));
            }
            ledger.rebase(now, cap)?;
            let was_active = ledger.is_active;
            ledger.suspended = suspended;
            ledger.refresh_activity(now);
            let active = ledger.is_active;
            Ok(Step::Commit {
                value: (was_active != active).then_some(active),
                kind: AuditKind::Activation { active },
                amount: Decimal::ZERO,
            })
        })?;
        Ok(mutation.value)
    }

    /// Checkpoint one page of ledgers, resuming after the persisted cursor.
    pub fn sweep_checkpoints_page(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let cursor = match self.storage.job_cursor(CHECKPOINT_SWEEP_JOB)? {
            Some(bytes) => Some(LedgerKey::from_storage_key(&bytes)?),
            None => None,
        };
        let page_size = self.config.jobs.page_size.max(1);
        let page = self.storage.ledgers_after(cursor.as_ref(), page_size)?;

        let mut report = SweepReport {
            visited: page.len(),
            ..SweepReport::default()
        };
        for ledger in &page {
            match self.apply_checkpoint(ledger.key(), now) {
                Ok(CheckpointOutcome::Applied { .. }) => report.changed += 1,
                Ok(_) => {}
                Err(error) => {
                    report.failed += 1;
                    tracing::error!("checkpoint of {} failed: {error}", ledger.key());
                }
            }
        }

        report.complete = page.len() < page_size;
        let next = if report.complete {
            None
        } else {
            page.last().map(|ledger| ledger.key().storage_key())
        };
        self.storage
            .set_job_cursor(CHECKPOINT_SWEEP_JOB, next.as_deref())?;
        Ok(report)
    }

    /// Checkpoint every ledger, page by page.
    pub fn sweep_checkpoints(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let mut total = SweepReport::default();
        loop {
            let page = self.sweep_checkpoints_page(now)?;
            total.absorb(&page);
            if page.complete {
                break;
            }
        }
        tracing::info!(
            "checkpoint sweep finished: {} ledgers, {} checkpointed, {} failed",
            total.visited,
            total.changed,
            total.failed
        );
        Ok(total)
    }

    pub(crate) fn mutate<T, F>(
        &self,
        key: &LedgerKey,
        now: DateTime<Utc>,
        create_if_missing: bool,
        change: F,
    ) -> Result<Mutation<T>>
    where
        F: Fn(&mut Ledger) -> Result<Step<T>>,
    {
        let attempts = self.config.max_commit_attempts.max(1);
        for attempt in 1..=attempts {
            let (before, expected_version) = match self.storage.ledger(key)? {
                Some(ledger) => {
                    let version = ledger.version();
                    (ledger, Some(version))
                }
                None if create_if_missing => (Ledger::new(key.clone(), now), None),
                None => return Err(LedgerError::LedgerNotFound { key: key.clone() }),
            };
            if now < before.last_checkpoint_time() {
                let skew = before.last_checkpoint_time() - now;
                tracing::warn!(
                    "clock anomaly on {key}: now is {}ms before the last checkpoint",
                    skew.num_milliseconds()
                );
            }

            let mut ledger = before.clone();
            let (value, kind, amount) = match change(&mut ledger)? {
                Step::Skip(value) => {
                    return Ok(Mutation {
                        ledger: before,
                        value,
                    });
                }
                Step::Commit {
                    value,
                    kind,
                    amount,
                } => (value, kind, amount),
            };

            if let Err(violation) = InvariantGuard::check_transition(&before, &ledger) {
                tracing::error!("rejected change on {key}: {violation}");
                if expected_version.is_some() {
                    self.mark_degraded(before, &violation.to_string(), now)?;
                }
                return Err(LedgerError::InvariantViolation {
                    key: key.clone(),
                    detail: violation.to_string(),
                });
            }

            ledger.version = expected_version.map_or(1, |version| version + 1);
            let audit = AuditRecord::of(&ledger, now, kind, amount);
            match self.storage.commit(expected_version, &ledger, Some(&audit))? {
                CommitOutcome::Committed => return Ok(Mutation { ledger, value }),
                CommitOutcome::Conflict => {
                    tracing::debug!("version conflict on {key}, attempt {attempt}/{attempts}");
                }
            }
        }
        Err(LedgerError::ConcurrencyConflict {
            key: key.clone(),
            attempts,
        })
    }

    fn mark_degraded(&self, mut ledger: Ledger, detail: &str, now: DateTime<Utc>) -> Result<()> {
        if ledger.degraded {
            return Ok(());
        }
        let expected = ledger.version;
        ledger.degraded = true;
        ledger.version += 1;
        let audit = AuditRecord::of(
            &ledger,
            now,
            AuditKind::Degraded {
                detail: detail.to_string(),
            },
            ledger.shortfall(),
        );
        match self.storage.commit(Some(expected), &ledger, Some(&audit))? {
            CommitOutcome::Committed => {
                tracing::error!("ledger {} marked degraded", ledger.key());
            }
            CommitOutcome::Conflict => {
                tracing::warn!(
                    "ledger {} changed while being marked degraded; the next mutation re-checks it",
                    ledger.key()
                );
            }
        }
        Ok(())
    }
}

pub(crate) fn log_application(key: &LedgerKey, application: &RateApplication) {
    if let RateApplication::Applied {
        old_rate,
        new_rate,
        activation,
        ..
    } = application
    {
        tracing::info!("rate of {key} changed from {old_rate} to {new_rate}");
        if let Some(active) = activation {
            tracing::info!("ledger {key} active: {active}");
        }
    }
}

pub(crate) fn ensure_positive(amount: Decimal) -> Result<()> {
    if amount <= Decimal::ZERO {
        return Err(LedgerError::InvalidAmount { amount });
    }
    Ok(())
}

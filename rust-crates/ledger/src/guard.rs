//! Ledger invariant enforcement, diagnostics and operator corrections.
//!
//! The invariant is `cumulative_earned >= balance + cumulative_spent`.
//! Pending accrual adds to both sides, so it reduces to
//! `cumulative_earned >= baseline + cumulative_spent` and can be checked on
//! the stored fields alone.

use crate::{
    LedgerError,
    Result,
    RunMode,
    checkpoint::{
        CheckpointStore,
        Step,
    },
    config::LedgerConfig,
    ledger::{
        AuditKind,
        Ledger,
    },
    resource::LedgerKey,
    storage::LedgerStorage,
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
use sha2::{
    Digest,
    Sha256,
};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub key: LedgerKey,
    pub shortfall: Decimal,
    pub detail: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (shortfall {})", self.detail, self.shortfall)
    }
}

pub struct InvariantGuard;

impl InvariantGuard {
    pub fn check(ledger: &Ledger) -> std::result::Result<(), Violation> {
        let violation = |detail: String| Violation {
            key: ledger.key().clone(),
            shortfall: ledger.shortfall(),
            detail,
        };
        if ledger.baseline() < Decimal::ZERO {
            return Err(violation(format!("negative baseline {}", ledger.baseline())));
        }
        if ledger.shortfall() > Decimal::ZERO {
            return Err(violation(format!(
                "earned {} is below baseline {} plus spent {}",
                ledger.cumulative_earned(),
                ledger.baseline(),
                ledger.cumulative_spent()
            )));
        }
        Ok(())
    }

    /// Validate a mutation from `before` to `after`.
    ///
    /// A ledger that is already degraded may still change as long as its
    /// shortfall does not grow, so rate shrinks and checkpoints keep working
    /// until an operator corrects it.
    pub fn check_transition(before: &Ledger, after: &Ledger) -> std::result::Result<(), Violation> {
        let violation = |detail: String| Violation {
            key: after.key().clone(),
            shortfall: after.shortfall(),
            detail,
        };
        if after.cumulative_earned() < before.cumulative_earned() {
            return Err(violation(format!(
                "cumulative earned would decrease from {} to {}",
                before.cumulative_earned(),
                after.cumulative_earned()
            )));
        }
        if after.cumulative_spent() < before.cumulative_spent() {
            return Err(violation(format!(
                "cumulative spent would decrease from {} to {}",
                before.cumulative_spent(),
                after.cumulative_spent()
            )));
        }
        if before.is_degraded() && after.baseline() >= Decimal::ZERO {
            if after.shortfall() > before.shortfall() {
                return Err(violation(format!(
                    "shortfall of degraded ledger would grow from {}",
                    before.shortfall()
                )));
            }
            return Ok(());
        }
        Self::check(after)
    }
}

/// One ledger reported by the diagnostic scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShortfallEntry {
    pub key: LedgerKey,
    pub shortfall: Decimal,
    pub degraded: bool,
}

/// Proof that an operator token was validated. Only [`OperatorCapability::issue`]
/// creates one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorCapability {
    operator: String,
}

impl OperatorCapability {
    /// Check `token` against the configured SHA-256 digest.
    pub fn issue(config: &LedgerConfig, operator: &str, token: &str) -> Result<Self> {
        let unauthorized = || LedgerError::Unauthorized {
            operator: operator.to_string(),
        };
        let expected = config
            .operator_token_sha256
            .as_deref()
            .ok_or_else(unauthorized)?;
        let digest = hex::encode(Sha256::digest(token.as_bytes()));
        if !constant_time_eq(digest.as_bytes(), expected.trim().to_ascii_lowercase().as_bytes()) {
            tracing::warn!("rejected operator token for '{operator}'");
            return Err(unauthorized());
        }
        Ok(Self {
            operator: operator.to_string(),
        })
    }

    pub fn operator(&self) -> &str {
        &self.operator
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Correction {
    pub key: LedgerKey,
    pub earned_before: Decimal,
    pub earned_after: Decimal,
    pub baseline: Decimal,
    pub spent: Decimal,
    pub was_degraded: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrectionReport {
    pub mode: RunMode,
    pub operator: String,
    pub corrections: Vec<Correction>,
}

fn planned_correction(ledger: &Ledger) -> Option<Correction> {
    if ledger.shortfall() == Decimal::ZERO && !ledger.is_degraded() {
        return None;
    }
    Some(Correction {
        key: ledger.key().clone(),
        earned_before: ledger.cumulative_earned(),
        earned_after: ledger.cumulative_earned().saturating_add(ledger.shortfall()),
        baseline: ledger.baseline(),
        spent: ledger.cumulative_spent(),
        was_degraded: ledger.is_degraded(),
    })
}

impl<S: LedgerStorage> CheckpointStore<S> {
    pub(crate) fn for_each_ledger(&self, mut visit: impl FnMut(Ledger)) -> Result<()> {
        let page_size = self.config().jobs.page_size.max(1);
        let mut cursor: Option<LedgerKey> = None;
        loop {
            let page = self.storage().ledgers_after(cursor.as_ref(), page_size)?;
            let complete = page.len() < page_size;
            cursor = page.last().map(|ledger| ledger.key().clone());
            page.into_iter().for_each(&mut visit);
            if complete || cursor.is_none() {
                return Ok(());
            }
        }
    }

    /// Read-only scan of ledgers violating the invariant or flagged degraded,
    /// worst first.
    pub fn invariant_report(&self) -> Result<Vec<ShortfallEntry>> {
        let mut entries = Vec::new();
        self.for_each_ledger(|ledger| {
            if ledger.shortfall() > Decimal::ZERO || ledger.is_degraded() {
                entries.push(ShortfallEntry {
                    key: ledger.key().clone(),
                    shortfall: ledger.shortfall(),
                    degraded: ledger.is_degraded(),
                });
            }
        })?;
        entries.sort_by(|a, b| b.shortfall.cmp(&a.shortfall).then_with(|| a.key.cmp(&b.key)));
        Ok(entries)
    }

    /// Raise `cumulative_earned` to `baseline + cumulative_spent` on every
    /// violating ledger and clear its degraded flag. Balance and spent are
    /// never touched.
    pub fn correct_invariants(
        &self,
        capability: &OperatorCapability,
        mode: RunMode,
        now: DateTime<Utc>,
    ) -> Result<CorrectionReport> {
        let mut planned = Vec::new();
        self.for_each_ledger(|ledger| planned.extend(planned_correction(&ledger)))?;

        let mut corrections = Vec::with_capacity(planned.len());
        for plan in planned {
            if mode.is_dry_run() {
                tracing::info!(
                    "dry run: would raise earned on {} from {} to {}",
                    plan.key,
                    plan.earned_before,
                    plan.earned_after
                );
                corrections.push(plan);
                continue;
            }

            let operator = capability.operator().to_string();
            let mutation = self.mutate(&plan.key, now, false, |ledger| {
                let Some(correction) = planned_correction(ledger) else {
                    return Ok(Step::Skip(None));
                };
                ledger.cumulative_earned = correction.earned_after;
                ledger.degraded = false;
                Ok(Step::Commit {
                    amount: correction.earned_after - correction.earned_before,
                    value: Some(correction),
                    kind: AuditKind::Correction {
                        operator: operator.clone(),
                    },
                })
            })?;
            if let Some(correction) = mutation.value {
                tracing::info!(
                    "operator '{}' corrected {}: earned {} -> {}, baseline {}, spent {}",
                    operator,
                    correction.key,
                    correction.earned_before,
                    correction.earned_after,
                    correction.baseline,
                    correction.spent
                );
                corrections.push(correction);
            }
        }

        Ok(CorrectionReport {
            mode,
            operator: capability.operator().to_string(),
            corrections,
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;
    use crate::{
        resource::{
            ResourceKind,
            WalletAddress,
        },
        storage::InMemoryLedgerStorage,
    };
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    const TOKEN: &str = "let-me-in";

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap()
    }

    fn config() -> LedgerConfig {
        LedgerConfig {
            operator_token_sha256: Some(hex::encode(Sha256::digest(TOKEN.as_bytes()))),
            ..LedgerConfig::default()
        }
    }

    fn key(wallet: &str) -> LedgerKey {
        LedgerKey::new(WalletAddress::parse(wallet).unwrap(), ResourceKind::Gold)
    }

    /// Funded ledger whose earned total was later lowered behind the store's
    /// back.
    fn corrupt(store: &CheckpointStore<InMemoryLedgerStorage>, key: &LedgerKey, earned: Decimal) {
        store.open_ledger(key, t0()).unwrap();
        store.credit(key, dec!(100), "seed", t0()).unwrap();
        let mut ledger = store.get_ledger(key).unwrap();
        let expected = ledger.version;
        ledger.cumulative_earned = earned;
        ledger.version += 1;
        store.storage().commit(Some(expected), &ledger, None).unwrap();
    }

    #[test]
    fn check_transition__decreasing_spent__is_a_violation() {
        // given
        let before = {
            let mut ledger = Ledger::new(key("stake1uxa"), t0());
            ledger.cumulative_earned = dec!(10);
            ledger.cumulative_spent = dec!(10);
            ledger
        };
        let mut after = before.clone();
        after.cumulative_spent = dec!(5);
        after.baseline = dec!(5);

        // when
        let result = InvariantGuard::check_transition(&before, &after);

        // then
        assert!(result.is_err());
    }

    #[test]
    fn check_transition__degraded_ledger__accepts_changes_that_keep_shortfall() {
        // given
        let mut before = Ledger::new(key("stake1uxa"), t0());
        before.baseline = dec!(50);
        before.cumulative_earned = dec!(40);
        before.degraded = true;
        let mut after = before.clone();
        after.baseline = dec!(60);
        after.cumulative_earned = dec!(50);
        let mut worse = before.clone();
        worse.baseline = dec!(70);

        // then
        assert!(InvariantGuard::check_transition(&before, &after).is_ok());
        assert!(InvariantGuard::check_transition(&before, &worse).is_err());
    }

    #[test]
    fn issue__wrong_or_unconfigured_token__is_unauthorized() {
        assert!(OperatorCapability::issue(&config(), "ops", TOKEN).is_ok());
        assert!(matches!(
            OperatorCapability::issue(&config(), "ops", "guess"),
            Err(LedgerError::Unauthorized { .. })
        ));
        assert!(matches!(
            OperatorCapability::issue(&LedgerConfig::default(), "ops", TOKEN),
            Err(LedgerError::Unauthorized { .. })
        ));
    }

    #[test]
    fn invariant_report__sorts_by_shortfall_descending() {
        // given
        let store = CheckpointStore::new(InMemoryLedgerStorage::new(), config());
        corrupt(&store, &key("stake1uxa"), dec!(95));
        corrupt(&store, &key("stake1uxb"), dec!(60));
        store.open_ledger(&key("stake1uxc"), t0()).unwrap();

        // when
        let report = store.invariant_report().unwrap();

        // then
        let shortfalls: Vec<Decimal> = report.iter().map(|entry| entry.shortfall).collect();
        assert_eq!(shortfalls, vec![dec!(40), dec!(5)]);
        assert_eq!(report[0].key, key("stake1uxb"));
    }

    #[test]
    fn correct_invariants__dry_run__reports_without_writing() {
        // given
        let store = CheckpointStore::new(InMemoryLedgerStorage::new(), config());
        corrupt(&store, &key("stake1uxa"), dec!(70));
        let capability = OperatorCapability::issue(store.config(), "ops", TOKEN).unwrap();
        let before = store.get_ledger(&key("stake1uxa")).unwrap();

        // when
        let report = store
            .correct_invariants(&capability, RunMode::default(), t0())
            .unwrap();

        // then
        assert_eq!(report.mode, RunMode::DryRun);
        assert_eq!(report.corrections.len(), 1);
        assert_eq!(report.corrections[0].earned_after, dec!(100));
        assert_eq!(store.get_ledger(&key("stake1uxa")).unwrap(), before);
    }

    #[test]
    fn correct_invariants__apply__raises_earned_and_clears_degraded() {
        // given
        let store = CheckpointStore::new(InMemoryLedgerStorage::new(), config());
        let key = key("stake1uxa");
        corrupt(&store, &key, dec!(70));
        let _ = store.spend(&key, dec!(10), t0());
        assert!(store.get_ledger(&key).unwrap().is_degraded());
        let capability = OperatorCapability::issue(store.config(), "ops", TOKEN).unwrap();

        // when
        let report = store
            .correct_invariants(&capability, RunMode::Apply, t0())
            .unwrap();

        // then
        assert_eq!(report.corrections.len(), 1);
        let ledger = store.get_ledger(&key).unwrap();
        assert_eq!(ledger.cumulative_earned(), dec!(100));
        assert_eq!(ledger.baseline(), dec!(100));
        assert_eq!(ledger.cumulative_spent(), Decimal::ZERO);
        assert!(!ledger.is_degraded());
        assert!(store.invariant_report().unwrap().is_empty());
        store.spend(&key, dec!(10), t0()).unwrap();
    }
}

//! Whole-store ledger export and gap-filling restore.
//!
//! A restore never overwrites: only ledgers missing from storage are
//! recreated, so a stale backup can not roll a live balance back.

use crate::{
    Result,
    RunMode,
    checkpoint::CheckpointStore,
    guard::{
        InvariantGuard,
        OperatorCapability,
    },
    ledger::{
        AuditKind,
        AuditRecord,
        Ledger,
    },
    resource::LedgerKey,
    storage::{
        CommitOutcome,
        LedgerStorage,
    },
};
use chrono::{
    DateTime,
    Utc,
};
use serde::{
    Deserialize,
    Serialize,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerBackup {
    pub taken_at: DateTime<Utc>,
    pub ledgers: Vec<Ledger>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedLedger {
    pub key: LedgerKey,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreReport {
    pub mode: RunMode,
    pub operator: String,
    /// Recreated, or in a dry run the ones that would be.
    pub restored: Vec<LedgerKey>,
    pub already_present: Vec<LedgerKey>,
    pub rejected: Vec<RejectedLedger>,
}

impl<S: LedgerStorage> CheckpointStore<S> {
    pub fn export_backup(&self, now: DateTime<Utc>) -> Result<LedgerBackup> {
        let mut ledgers = Vec::new();
        self.for_each_ledger(|ledger| ledgers.push(ledger))?;
        tracing::info!("exported {} ledger(s)", ledgers.len());
        Ok(LedgerBackup {
            taken_at: now,
            ledgers,
        })
    }

    /// Recreate the backed-up ledgers that no longer exist.
    ///
    /// Restored ledgers restart accrual at `now`; time between the backup and
    /// the restore is not credited. Ledgers failing the invariant are
    /// rejected.
    pub fn restore_backup(
        &self,
        capability: &OperatorCapability,
        backup: &LedgerBackup,
        mode: RunMode,
        now: DateTime<Utc>,
    ) -> Result<RestoreReport> {
        let mut report = RestoreReport {
            mode,
            operator: capability.operator().to_string(),
            restored: Vec::new(),
            already_present: Vec::new(),
            rejected: Vec::new(),
        };
        for saved in &backup.ledgers {
            let key = saved.key().clone();
            if self.storage().ledger(&key)?.is_some() {
                report.already_present.push(key);
                continue;
            }
            if let Err(violation) = InvariantGuard::check(saved) {
                tracing::warn!("not restoring {key}: {violation}");
                report.rejected.push(RejectedLedger {
                    key,
                    reason: violation.to_string(),
                });
                continue;
            }
            if mode.is_dry_run() {
                report.restored.push(key);
                continue;
            }

            let mut ledger = saved.clone();
            ledger.last_checkpoint_time = ledger.last_checkpoint_time.max(now);
            ledger.version = 1;
            let audit = AuditRecord::of(
                &ledger,
                now,
                AuditKind::Restore {
                    operator: capability.operator().to_string(),
                },
                ledger.baseline(),
            );
            match self.storage().commit(None, &ledger, Some(&audit))? {
                CommitOutcome::Committed => {
                    tracing::info!(
                        "operator '{}' restored {key} with baseline {}",
                        capability.operator(),
                        ledger.baseline()
                    );
                    report.restored.push(key);
                }
                CommitOutcome::Conflict => report.already_present.push(key),
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;
    use crate::{
        accrual::Rate,
        config::LedgerConfig,
        rate::{
            AssetContribution,
            RateSource,
        },
        resource::{
            AssetId,
            ResourceKind,
            WalletAddress,
        },
        storage::InMemoryLedgerStorage,
    };
    use chrono::{
        Duration,
        TimeZone,
    };
    use rust_decimal_macros::dec;
    use sha2::{
        Digest,
        Sha256,
    };

    const TOKEN: &str = "restore-me";

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap()
    }

    fn store() -> CheckpointStore<InMemoryLedgerStorage> {
        let config = LedgerConfig {
            operator_token_sha256: Some(hex::encode(Sha256::digest(TOKEN.as_bytes()))),
            ..LedgerConfig::default()
        };
        CheckpointStore::new(InMemoryLedgerStorage::new(), config)
    }

    fn gold(wallet: &str) -> LedgerKey {
        LedgerKey::new(WalletAddress::parse(wallet).unwrap(), ResourceKind::Gold)
    }

    fn seeded(store: &CheckpointStore<InMemoryLedgerStorage>, wallet: &str) {
        let source = RateSource::new().with_asset(
            AssetId::new("policy.hero").unwrap(),
            AssetContribution::new(Rate::per_hour(dec!(10))),
        );
        store.apply_rate_source(&gold(wallet), &source, t0()).unwrap();
        store.credit(&gold(wallet), dec!(50), "seed", t0()).unwrap();
    }

    #[test]
    fn restore_backup__recreates_only_missing_ledgers() {
        // given
        let source = store();
        seeded(&source, "stake1uxlost");
        seeded(&source, "stake1uxkept");
        let backup = source.export_backup(t0()).unwrap();
        let target = store();
        seeded(&target, "stake1uxkept");
        target.spend(&gold("stake1uxkept"), dec!(20), t0()).unwrap();
        let capability = OperatorCapability::issue(target.config(), "ops", TOKEN).unwrap();
        let later = t0() + Duration::hours(3);

        // when
        let report = target
            .restore_backup(&capability, &backup, RunMode::Apply, later)
            .unwrap();

        // then
        assert_eq!(report.restored, vec![gold("stake1uxlost")]);
        assert_eq!(report.already_present, vec![gold("stake1uxkept")]);
        assert_eq!(target.get_current_balance(&gold("stake1uxlost"), later).unwrap(), dec!(50));
        assert_eq!(
            target
                .get_current_balance(&gold("stake1uxlost"), later + Duration::hours(1))
                .unwrap(),
            dec!(60)
        );
        assert_eq!(target.get_ledger(&gold("stake1uxkept")).unwrap().baseline(), dec!(30));
    }

    #[test]
    fn restore_backup__dry_run__writes_nothing() {
        // given
        let source = store();
        seeded(&source, "stake1uxlost");
        let backup = source.export_backup(t0()).unwrap();
        let target = store();
        let capability = OperatorCapability::issue(target.config(), "ops", TOKEN).unwrap();

        // when
        let report = target
            .restore_backup(&capability, &backup, RunMode::DryRun, t0())
            .unwrap();

        // then
        assert_eq!(report.restored, vec![gold("stake1uxlost")]);
        assert!(target.storage().ledger(&gold("stake1uxlost")).unwrap().is_none());
    }

    #[test]
    fn restore_backup__ledger_with_shortfall__is_rejected() {
        // given
        let source = store();
        seeded(&source, "stake1uxbad");
        let mut backup = source.export_backup(t0()).unwrap();
        backup.ledgers[0].cumulative_earned = dec!(10);
        let target = store();
        let capability = OperatorCapability::issue(target.config(), "ops", TOKEN).unwrap();

        // when
        let report = target
            .restore_backup(&capability, &backup, RunMode::Apply, t0())
            .unwrap();

        // then
        assert!(report.restored.is_empty());
        assert_eq!(report.rejected.len(), 1);
        assert!(target.storage().ledger(&gold("stake1uxbad")).unwrap().is_none());
    }
}

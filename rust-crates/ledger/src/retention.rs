//! Bounded-batch pruning of ownership snapshots and audit records.
//!
//! Only the append-only families are touched; ledgers themselves are never
//! read or written here.

use crate::{
    Result,
    RunMode,
    config::RetentionConfig,
    storage::{
        LedgerStorage,
        RecordFamily,
    },
};
use chrono::{
    DateTime,
    Duration,
    Utc,
};
use serde::{
    Deserialize,
    Serialize,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FamilyRetention {
    pub family: RecordFamily,
    pub cutoff: DateTime<Utc>,
    pub scanned: usize,
    /// Deleted, or in a dry run the number that would be deleted.
    pub expired: usize,
    pub batches: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionReport {
    pub mode: RunMode,
    pub families: Vec<FamilyRetention>,
}

impl RetentionReport {
    pub fn expired(&self) -> usize {
        self.families.iter().map(|family| family.expired).sum()
    }
}

#[derive(Debug, Clone)]
pub struct SnapshotRetention {
    snapshot_window: Duration,
    audit_window: Duration,
    batch_size: usize,
}

impl SnapshotRetention {
    pub fn new(config: &RetentionConfig) -> Self {
        Self {
            snapshot_window: Duration::days(i64::from(config.snapshot_days)),
            audit_window: Duration::days(i64::from(config.audit_days)),
            batch_size: config.batch_size.max(1),
        }
    }

    fn window(&self, family: RecordFamily) -> Duration {
        match family {
            RecordFamily::OwnershipSnapshots => self.snapshot_window,
            RecordFamily::AuditLog => self.audit_window,
        }
    }

    fn cursor_job(family: RecordFamily) -> String {
        format!("retention_{}", family.as_str())
    }

    /// Prune every family to its window. An applied run persists its cursor
    /// after each batch so an interrupted run resumes where it stopped; a dry
    /// run always scans from the start and writes nothing.
    pub fn run<S: LedgerStorage>(
        &self,
        storage: &S,
        now: DateTime<Utc>,
        mode: RunMode,
    ) -> Result<RetentionReport> {
        let mut families = Vec::with_capacity(RecordFamily::ALL.len());
        for family in RecordFamily::ALL {
            families.push(self.run_family(storage, family, now, mode)?);
        }
        let report = RetentionReport { mode, families };
        tracing::info!(
            "retention {:?}: {} expired record(s)",
            report.mode,
            report.expired()
        );
        Ok(report)
    }

    fn run_family<S: LedgerStorage>(
        &self,
        storage: &S,
        family: RecordFamily,
        now: DateTime<Utc>,
        mode: RunMode,
    ) -> Result<FamilyRetention> {
        let job = Self::cursor_job(family);
        let cutoff = now
            .checked_sub_signed(self.window(family))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let mut cursor = if mode.is_dry_run() {
            None
        } else {
            storage.job_cursor(&job)?
        };
        let mut summary = FamilyRetention {
            family,
            cutoff,
            scanned: 0,
            expired: 0,
            batches: 0,
        };

        loop {
            let batch = storage.prune_before(
                family,
                cutoff,
                cursor.as_deref(),
                self.batch_size,
                mode.is_dry_run(),
            )?;
            summary.batches += 1;
            summary.scanned += batch.scanned;
            summary.expired += batch.expired;
            if !mode.is_dry_run() {
                storage.set_job_cursor(&job, batch.next_cursor.as_deref())?;
            }
            tracing::debug!(
                "retention batch on {}: scanned {}, expired {}",
                family.as_str(),
                batch.scanned,
                batch.expired
            );
            match batch.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;
    use crate::{
        accrual::Rate,
        checkpoint::CheckpointStore,
        config::LedgerConfig,
        rate::{
            AssetContribution,
            RateSource,
        },
        resource::{
            AssetId,
            LedgerKey,
            ResourceKind,
            WalletAddress,
        },
        snapshot::{
            OwnershipSnapshot,
            VerificationStatus,
        },
        storage::InMemoryLedgerStorage,
    };
    use chrono::TimeZone;
    use rust_decimal_macros::dec;
    use std::collections::{
        BTreeMap,
        BTreeSet,
    };

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
    }

    fn wallet() -> WalletAddress {
        WalletAddress::parse("stake1uxkeep").unwrap()
    }

    fn snapshot(taken_at: DateTime<Utc>) -> OwnershipSnapshot {
        OwnershipSnapshot {
            wallet: wallet(),
            taken_at,
            asset_ids: BTreeSet::new(),
            derived_rates: BTreeMap::new(),
            status: VerificationStatus::Verified,
        }
    }

    fn retention(batch_size: usize) -> SnapshotRetention {
        SnapshotRetention::new(&RetentionConfig {
            batch_size,
            ..RetentionConfig::default()
        })
    }

    #[test]
    fn run__dry_run__counts_without_deleting() {
        // given
        let storage = InMemoryLedgerStorage::new();
        for day in 0..5 {
            storage.append_snapshot(&snapshot(t0() + Duration::days(day))).unwrap();
        }
        let now = t0() + Duration::days(33);

        // when
        let report = retention(2).run(&storage, now, RunMode::DryRun).unwrap();

        // then
        assert_eq!(report.families[0].expired, 3);
        assert_eq!(report.families[0].batches, 3);
        assert_eq!(storage.snapshots_for_wallet(&wallet()).unwrap().len(), 5);
        assert_eq!(storage.job_cursor("retention_ownership_snapshots").unwrap(), None);
    }

    #[test]
    fn run__apply__deletes_only_records_outside_the_window() {
        // given
        let storage = InMemoryLedgerStorage::new();
        for day in 0..5 {
            storage.append_snapshot(&snapshot(t0() + Duration::days(day))).unwrap();
        }
        let now = t0() + Duration::days(33);

        // when
        let report = retention(2).run(&storage, now, RunMode::Apply).unwrap();

        // then
        assert_eq!(report.expired(), 3);
        let kept: Vec<DateTime<Utc>> = storage
            .snapshots_for_wallet(&wallet())
            .unwrap()
            .into_iter()
            .map(|snapshot| snapshot.taken_at)
            .collect();
        assert_eq!(kept, vec![t0() + Duration::days(3), t0() + Duration::days(4)]);
        assert_eq!(storage.job_cursor("retention_ownership_snapshots").unwrap(), None);
    }

    #[test]
    fn run__apply__never_changes_ledger_balances() {
        // given
        let store = CheckpointStore::new(InMemoryLedgerStorage::new(), LedgerConfig::default());
        let key = LedgerKey::new(wallet(), ResourceKind::Gold);
        let source = RateSource::new().with_asset(
            AssetId::new("policy.keeper").unwrap(),
            AssetContribution::new(Rate::per_hour(dec!(10))),
        );
        store.apply_rate_source(&key, &source, t0()).unwrap();
        store.credit(&key, dec!(25), "welcome", t0()).unwrap();
        store.storage().append_snapshot(&snapshot(t0())).unwrap();
        let before = store.get_ledger(&key).unwrap();
        let now = t0() + Duration::days(200);

        // when
        let report = retention(10)
            .run(store.storage(), now, RunMode::Apply)
            .unwrap();

        // then
        assert!(report.expired() >= 3);
        let after = store.get_ledger(&key).unwrap();
        assert_eq!(after, before);
        assert_eq!(after.baseline(), dec!(25));
        assert_eq!(after.cumulative_earned(), dec!(25));
        assert!(store.storage().all_audit_records().unwrap().is_empty());
    }

    #[test]
    fn run__window_reaching_before_earliest_instant__expires_nothing() {
        // given
        let storage = InMemoryLedgerStorage::new();
        storage.append_snapshot(&snapshot(t0())).unwrap();
        let retention = SnapshotRetention::new(&RetentionConfig {
            snapshot_days: u32::MAX,
            audit_days: u32::MAX,
            batch_size: 10,
        });

        // when
        let report = retention.run(&storage, t0(), RunMode::Apply).unwrap();

        // then
        assert_eq!(report.expired(), 0);
        assert_eq!(report.families[0].cutoff, DateTime::<Utc>::MIN_UTC);
        assert_eq!(storage.snapshots_for_wallet(&wallet()).unwrap().len(), 1);
    }
}

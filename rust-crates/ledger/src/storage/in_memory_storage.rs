use crate::{
    ledger::{
        AuditRecord,
        Ledger,
        record_key_millis,
    },
    resource::{
        LedgerKey,
        WalletAddress,
        wallet_key_bounds,
    },
    snapshot::{
        OwnershipSnapshot,
        ReconciliationState,
    },
    storage::{
        CommitOutcome,
        LedgerStorage,
        PruneBatch,
        RecordFamily,
        audit_range,
        distinct_wallets,
    },
};
use anyhow::anyhow;
use chrono::{
    DateTime,
    Utc,
};
use std::{
    collections::{
        BTreeMap,
        HashMap,
    },
    ops::Bound,
    sync::{
        Arc,
        Mutex,
        MutexGuard,
    },
};

#[derive(Default)]
struct Tables {
    ledgers: BTreeMap<Vec<u8>, Ledger>,
    audit: BTreeMap<Vec<u8>, AuditRecord>,
    snapshots: BTreeMap<Vec<u8>, OwnershipSnapshot>,
    reconciliation: HashMap<WalletAddress, ReconciliationState>,
    job_cursors: HashMap<String, Vec<u8>>,
    next_snapshot_seq: u64,
}

/// Storage held entirely in process memory. One mutex guards every table, so
/// the version compare and the write in `commit` are a single critical
/// section.
#[derive(Clone, Default)]
pub struct InMemoryLedgerStorage {
    tables: Arc<Mutex<Tables>>,
}

impl InMemoryLedgerStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> anyhow::Result<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| anyhow!("in-memory ledger storage lock poisoned"))
    }

    /// Every audit record currently stored, in key order.
    pub fn all_audit_records(&self) -> anyhow::Result<Vec<AuditRecord>> {
        Ok(self.tables()?.audit.values().cloned().collect())
    }
}

fn after(cursor: Option<&[u8]>) -> Bound<Vec<u8>> {
    match cursor {
        Some(cursor) => Bound::Excluded(cursor.to_vec()),
        None => Bound::Unbounded,
    }
}

/// Shared scan for both prunable families.
fn prune_map<V>(
    map: &mut BTreeMap<Vec<u8>, V>,
    cutoff: DateTime<Utc>,
    cursor: Option<&[u8]>,
    limit: usize,
    dry_run: bool,
) -> PruneBatch {
    let cutoff_millis = u64::try_from(cutoff.timestamp_millis()).unwrap_or_default();
    let scanned: Vec<Vec<u8>> = map
        .range((after(cursor), Bound::Unbounded))
        .take(limit)
        .map(|(key, _)| key.clone())
        .collect();
    let expired: Vec<&Vec<u8>> = scanned
        .iter()
        .filter(|key| record_key_millis(key).is_some_and(|millis| millis < cutoff_millis))
        .collect();
    let expired_count = expired.len();
    if !dry_run {
        for key in expired {
            map.remove(key);
        }
    }
    let next_cursor = (scanned.len() == limit).then(|| scanned.last().cloned()).flatten();
    PruneBatch {
        scanned: scanned.len(),
        expired: expired_count,
        next_cursor,
    }
}

impl LedgerStorage for InMemoryLedgerStorage {
    fn ledger(&self, key: &LedgerKey) -> anyhow::Result<Option<Ledger>> {
        Ok(self.tables()?.ledgers.get(&key.storage_key()).cloned())
    }

    fn commit(
        &self,
        expected_version: Option<u64>,
        ledger: &Ledger,
        audit: Option<&AuditRecord>,
    ) -> anyhow::Result<CommitOutcome> {
        let mut tables = self.tables()?;
        let key = ledger.key().storage_key();
        let stored_version = tables.ledgers.get(&key).map(Ledger::version);
        if stored_version != expected_version {
            return Ok(CommitOutcome::Conflict);
        }
        tables.ledgers.insert(key, ledger.clone());
        if let Some(record) = audit {
            tables.audit.insert(record.storage_key(), record.clone());
        }
        Ok(CommitOutcome::Committed)
    }

    fn ledgers_after(
        &self,
        cursor: Option<&LedgerKey>,
        limit: usize,
    ) -> anyhow::Result<Vec<Ledger>> {
        let cursor = cursor.map(LedgerKey::storage_key);
        let tables = self.tables()?;
        Ok(tables
            .ledgers
            .range((after(cursor.as_deref()), Bound::Unbounded))
            .take(limit)
            .map(|(_, ledger)| ledger.clone())
            .collect())
    }

    fn ledgers_for_wallet(&self, wallet: &WalletAddress) -> anyhow::Result<Vec<Ledger>> {
        let (start, end) = wallet_key_bounds(wallet);
        let tables = self.tables()?;
        Ok(tables
            .ledgers
            .range(start..end)
            .map(|(_, ledger)| ledger.clone())
            .collect())
    }

    fn wallets_after(
        &self,
        cursor: Option<&WalletAddress>,
        limit: usize,
    ) -> anyhow::Result<Vec<WalletAddress>> {
        let start = match cursor {
            Some(wallet) => Bound::Included(wallet_key_bounds(wallet).1),
            None => Bound::Unbounded,
        };
        let tables = self.tables()?;
        distinct_wallets(
            tables
                .ledgers
                .range((start, Bound::Unbounded))
                .map(|(key, _)| Ok(key.clone())),
            limit,
        )
    }

    fn audit_history(
        &self,
        key: &LedgerKey,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> anyhow::Result<Vec<AuditRecord>> {
        if to < from {
            return Ok(Vec::new());
        }
        let (start, end) = audit_range(key, from, to);
        let tables = self.tables()?;
        Ok(tables
            .audit
            .range(start..end)
            .map(|(_, record)| record.clone())
            .collect())
    }

    fn append_snapshot(&self, snapshot: &OwnershipSnapshot) -> anyhow::Result<()> {
        let mut tables = self.tables()?;
        let seq = tables.next_snapshot_seq;
        tables.next_snapshot_seq += 1;
        tables
            .snapshots
            .insert(snapshot.storage_key(seq), snapshot.clone());
        Ok(())
    }

    fn snapshots_for_wallet(
        &self,
        wallet: &WalletAddress,
    ) -> anyhow::Result<Vec<OwnershipSnapshot>> {
        let (start, end) = wallet_key_bounds(wallet);
        let tables = self.tables()?;
        Ok(tables
            .snapshots
            .range(start..end)
            .map(|(_, snapshot)| snapshot.clone())
            .collect())
    }

    fn reconciliation_state(
        &self,
        wallet: &WalletAddress,
    ) -> anyhow::Result<ReconciliationState> {
        Ok(self
            .tables()?
            .reconciliation
            .get(wallet)
            .cloned()
            .unwrap_or_default())
    }

    fn put_reconciliation_state(
        &self,
        wallet: &WalletAddress,
        state: &ReconciliationState,
    ) -> anyhow::Result<()> {
        self.tables()?
            .reconciliation
            .insert(wallet.clone(), state.clone());
        Ok(())
    }

    fn job_cursor(&self, job: &str) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self.tables()?.job_cursors.get(job).cloned())
    }

    fn set_job_cursor(&self, job: &str, cursor: Option<&[u8]>) -> anyhow::Result<()> {
        let mut tables = self.tables()?;
        match cursor {
            Some(cursor) => {
                tables.job_cursors.insert(job.to_string(), cursor.to_vec());
            }
            None => {
                tables.job_cursors.remove(job);
            }
        }
        Ok(())
    }

    fn prune_before(
        &self,
        family: RecordFamily,
        cutoff: DateTime<Utc>,
        cursor: Option<&[u8]>,
        limit: usize,
        dry_run: bool,
    ) -> anyhow::Result<PruneBatch> {
        let mut tables = self.tables()?;
        let batch = match family {
            RecordFamily::OwnershipSnapshots => {
                prune_map(&mut tables.snapshots, cutoff, cursor, limit, dry_run)
            }
            RecordFamily::AuditLog => {
                prune_map(&mut tables.audit, cutoff, cursor, limit, dry_run)
            }
        };
        Ok(batch)
    }
}

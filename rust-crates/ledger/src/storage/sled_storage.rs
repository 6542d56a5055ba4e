// Sled-backed ledger persistence.
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
        deserialize,
        distinct_wallets,
        serialize_record,
    },
};
use anyhow::{
    Context,
    anyhow,
};
use chrono::{
    DateTime,
    Utc,
};
use serde::Deserialize;
use sled::{
    Batch,
    Config,
    Db,
    Transactional,
    Tree,
    transaction::{
        ConflictableTransactionError,
        TransactionError,
    },
};
use std::{
    ops::Bound,
    path::Path,
};

/// Only the version is needed to validate a commit.
#[derive(Deserialize)]
struct StoredVersion {
    version: u64,
}

#[derive(Clone)]
pub struct SledLedgerStorage {
    db: Db,
    ledgers: Tree,
    audit: Tree,
    snapshots: Tree,
    reconciliation: Tree,
    job_cursors: Tree,
}

impl SledLedgerStorage {
    pub fn new(db: &Db) -> anyhow::Result<Self> {
        let ledgers = db.open_tree("ledgers").context("open ledgers tree")?;
        let audit = db.open_tree("audit").context("open audit tree")?;
        let snapshots = db
            .open_tree("ownership_snapshots")
            .context("open ownership_snapshots tree")?;
        let reconciliation = db
            .open_tree("reconciliation")
            .context("open reconciliation tree")?;
        let job_cursors = db.open_tree("job_cursors").context("open job_cursors tree")?;

        Ok(Self {
            db: db.clone(),
            ledgers,
            audit,
            snapshots,
            reconciliation,
            job_cursors,
        })
    }

    pub fn open<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let config = Config::default().path(path);
        let db = config.open().context("open sled database")?;
        Self::new(&db)
    }

    fn family_tree(&self, family: RecordFamily) -> &Tree {
        match family {
            RecordFamily::OwnershipSnapshots => &self.snapshots,
            RecordFamily::AuditLog => &self.audit,
        }
    }

    fn wallet_key(wallet: &WalletAddress) -> &[u8] {
        wallet.as_str().as_bytes()
    }
}

fn after(cursor: Option<&[u8]>) -> Bound<Vec<u8>> {
    match cursor {
        Some(cursor) => Bound::Excluded(cursor.to_vec()),
        None => Bound::Unbounded,
    }
}

impl LedgerStorage for SledLedgerStorage {
    fn ledger(&self, key: &LedgerKey) -> anyhow::Result<Option<Ledger>> {
        let value = match self.ledgers.get(key.storage_key()).context("read ledger")? {
            Some(value) => value,
            None => return Ok(None),
        };
        Ok(Some(deserialize::<Ledger>(value.as_ref())?))
    }

    fn commit(
        &self,
        expected_version: Option<u64>,
        ledger: &Ledger,
        audit: Option<&AuditRecord>,
    ) -> anyhow::Result<CommitOutcome> {
        let key = ledger.key().storage_key();
        let value = serialize_record(ledger, "ledger")?;
        let audit_entry = audit
            .map(|record| {
                serialize_record(record, "audit record").map(|bytes| (record.storage_key(), bytes))
            })
            .transpose()?;

        let outcome = (&self.ledgers, &self.audit).transaction(|(ledgers, audit_tree)| {
            let stored_version = match ledgers.get(&key)? {
                Some(bytes) => Some(
                    deserialize::<StoredVersion>(bytes.as_ref())
                        .map_err(ConflictableTransactionError::Abort)?
                        .version,
                ),
                None => None,
            };
            if stored_version != expected_version {
                return Ok(CommitOutcome::Conflict);
            }
            ledgers.insert(key.as_slice(), value.as_slice())?;
            if let Some((audit_key, audit_value)) = &audit_entry {
                audit_tree.insert(audit_key.as_slice(), audit_value.as_slice())?;
            }
            Ok(CommitOutcome::Committed)
        });

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(TransactionError::Abort(error)) => return Err(error),
            Err(TransactionError::Storage(error)) => {
                return Err(anyhow!(error).context("commit ledger transaction"));
            }
        };
        if outcome == CommitOutcome::Committed {
            self.db.flush().context("flush ledger commit")?;
        }
        Ok(outcome)
    }

    fn ledgers_after(
        &self,
        cursor: Option<&LedgerKey>,
        limit: usize,
    ) -> anyhow::Result<Vec<Ledger>> {
        let cursor = cursor.map(LedgerKey::storage_key);
        let mut ledgers = Vec::new();
        for entry in self
            .ledgers
            .range((after(cursor.as_deref()), Bound::Unbounded))
            .take(limit)
        {
            let (_, value) = entry.context("iterate ledgers")?;
            ledgers.push(deserialize::<Ledger>(value.as_ref())?);
        }
        Ok(ledgers)
    }

    fn ledgers_for_wallet(&self, wallet: &WalletAddress) -> anyhow::Result<Vec<Ledger>> {
        let (start, end) = wallet_key_bounds(wallet);
        let mut ledgers = Vec::new();
        for entry in self.ledgers.range(start..end) {
            let (_, value) = entry.context("iterate wallet ledgers")?;
            ledgers.push(deserialize::<Ledger>(value.as_ref())?);
        }
        Ok(ledgers)
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
        distinct_wallets(
            self.ledgers
                .range((start, Bound::Unbounded))
                .map(|entry| {
                    entry
                        .map(|(key, _)| key.to_vec())
                        .context("iterate ledger keys")
                }),
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
        let mut records = Vec::new();
        for entry in self.audit.range(start..end) {
            let (_, value) = entry.context("iterate audit records")?;
            records.push(deserialize::<AuditRecord>(value.as_ref())?);
        }
        Ok(records)
    }

    fn append_snapshot(&self, snapshot: &OwnershipSnapshot) -> anyhow::Result<()> {
        let seq = self.db.generate_id().context("generate snapshot id")?;
        let bytes = serialize_record(snapshot, "ownership snapshot")?;
        self.snapshots
            .insert(snapshot.storage_key(seq), bytes)
            .context("persist ownership snapshot")?;
        self.snapshots
            .flush()
            .context("flush ownership snapshots")?;
        Ok(())
    }

    fn snapshots_for_wallet(
        &self,
        wallet: &WalletAddress,
    ) -> anyhow::Result<Vec<OwnershipSnapshot>> {
        let (start, end) = wallet_key_bounds(wallet);
        let mut snapshots = Vec::new();
        for entry in self.snapshots.range(start..end) {
            let (_, value) = entry.context("iterate ownership snapshots")?;
            snapshots.push(deserialize::<OwnershipSnapshot>(value.as_ref())?);
        }
        Ok(snapshots)
    }

    fn reconciliation_state(
        &self,
        wallet: &WalletAddress,
    ) -> anyhow::Result<ReconciliationState> {
        match self
            .reconciliation
            .get(Self::wallet_key(wallet))
            .context("read reconciliation state")?
        {
            Some(value) => deserialize(value.as_ref()),
            None => Ok(ReconciliationState::default()),
        }
    }

    fn put_reconciliation_state(
        &self,
        wallet: &WalletAddress,
        state: &ReconciliationState,
    ) -> anyhow::Result<()> {
        let bytes = serialize_record(state, "reconciliation state")?;
        self.reconciliation
            .insert(Self::wallet_key(wallet), bytes)
            .context("persist reconciliation state")?;
        self.reconciliation
            .flush()
            .context("flush reconciliation state")?;
        Ok(())
    }

    fn job_cursor(&self, job: &str) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self
            .job_cursors
            .get(job.as_bytes())
            .context("read job cursor")?
            .map(|cursor| cursor.to_vec()))
    }

    fn set_job_cursor(&self, job: &str, cursor: Option<&[u8]>) -> anyhow::Result<()> {
        match cursor {
            Some(cursor) => {
                self.job_cursors
                    .insert(job.as_bytes(), cursor)
                    .context("persist job cursor")?;
            }
            None => {
                self.job_cursors
                    .remove(job.as_bytes())
                    .context("clear job cursor")?;
            }
        }
        self.job_cursors.flush().context("flush job cursors")?;
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
        let tree = self.family_tree(family);
        let cutoff_millis = u64::try_from(cutoff.timestamp_millis()).unwrap_or_default();
        let mut batch = Batch::default();
        let mut scanned = 0;
        let mut expired = 0;
        let mut last_key = None;

        for entry in tree.range((after(cursor), Bound::Unbounded)).take(limit) {
            let (key, _) = entry.with_context(|| format!("iterate {}", family.as_str()))?;
            scanned += 1;
            if record_key_millis(key.as_ref()).is_some_and(|millis| millis < cutoff_millis) {
                expired += 1;
                batch.remove(key.as_ref());
            }
            last_key = Some(key.to_vec());
        }

        if !dry_run && expired > 0 {
            tree.apply_batch(batch)
                .with_context(|| format!("prune {}", family.as_str()))?;
            tree.flush()
                .with_context(|| format!("flush {}", family.as_str()))?;
        }

        Ok(PruneBatch {
            scanned,
            expired,
            next_cursor: if scanned == limit { last_key } else { None },
        })
    }
}

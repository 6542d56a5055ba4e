//! Persistence seam of the ledger.
//!
//! Implementations must make `commit` atomic: the version check, the ledger
//! write and the audit append either all happen or none do.

use crate::{
    ledger::{
        AuditRecord,
        Ledger,
        timestamp_bytes,
    },
    resource::{
        LedgerKey,
        WalletAddress,
    },
    snapshot::{
        OwnershipSnapshot,
        ReconciliationState,
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

pub mod in_memory_storage;
pub mod sled_storage;

pub use in_memory_storage::InMemoryLedgerStorage;
pub use sled_storage::SledLedgerStorage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    /// The stored version differs from the one the caller read.
    Conflict,
}

/// Append-only record kinds subject to retention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordFamily {
    OwnershipSnapshots,
    AuditLog,
}

impl RecordFamily {
    pub const ALL: [RecordFamily; 2] = [RecordFamily::OwnershipSnapshots, RecordFamily::AuditLog];

    pub fn as_str(self) -> &'static str {
        match self {
            RecordFamily::OwnershipSnapshots => "ownership_snapshots",
            RecordFamily::AuditLog => "audit",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneBatch {
    pub scanned: usize,
    /// Records older than the cutoff; deleted unless the batch was a dry run.
    pub expired: usize,
    /// Last scanned key, or `None` once the family has been fully scanned.
    pub next_cursor: Option<Vec<u8>>,
}

pub trait LedgerStorage: Send + Sync {
    fn ledger(&self, key: &LedgerKey) -> anyhow::Result<Option<Ledger>>;

    /// Store `ledger` if the stored version still equals `expected_version`
    /// (`None`: no ledger stored yet), appending `audit` in the same write.
    fn commit(
        &self,
        expected_version: Option<u64>,
        ledger: &Ledger,
        audit: Option<&AuditRecord>,
    ) -> anyhow::Result<CommitOutcome>;

    /// Ledgers in key order, strictly after `cursor`.
    fn ledgers_after(
        &self,
        cursor: Option<&LedgerKey>,
        limit: usize,
    ) -> anyhow::Result<Vec<Ledger>>;

    fn ledgers_for_wallet(&self, wallet: &WalletAddress) -> anyhow::Result<Vec<Ledger>>;

    /// Distinct wallets owning at least one ledger, strictly after `cursor`.
    fn wallets_after(
        &self,
        cursor: Option<&WalletAddress>,
        limit: usize,
    ) -> anyhow::Result<Vec<WalletAddress>>;

    /// Audit records of `key` with `from <= at <= to`, oldest first.
    fn audit_history(
        &self,
        key: &LedgerKey,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> anyhow::Result<Vec<AuditRecord>>;

    fn append_snapshot(&self, snapshot: &OwnershipSnapshot) -> anyhow::Result<()>;

    /// Snapshots of `wallet`, oldest first.
    fn snapshots_for_wallet(
        &self,
        wallet: &WalletAddress,
    ) -> anyhow::Result<Vec<OwnershipSnapshot>>;

    /// Default state when the wallet has never been reconciled.
    fn reconciliation_state(
        &self,
        wallet: &WalletAddress,
    ) -> anyhow::Result<ReconciliationState>;

    fn put_reconciliation_state(
        &self,
        wallet: &WalletAddress,
        state: &ReconciliationState,
    ) -> anyhow::Result<()>;

    fn job_cursor(&self, job: &str) -> anyhow::Result<Option<Vec<u8>>>;

    /// `None` clears the cursor so the next run starts from the beginning.
    fn set_job_cursor(&self, job: &str, cursor: Option<&[u8]>) -> anyhow::Result<()>;

    /// Scan up to `limit` records of `family` after `cursor` and remove those
    /// timestamped before `cutoff`. Removes nothing when `dry_run` is set.
    fn prune_before(
        &self,
        family: RecordFamily,
        cutoff: DateTime<Utc>,
        cursor: Option<&[u8]>,
        limit: usize,
        dry_run: bool,
    ) -> anyhow::Result<PruneBatch>;
}

/// Inclusive start and exclusive end of the audit keys of `key` between two
/// instants.
pub(crate) fn audit_range(
    key: &LedgerKey,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> (Vec<u8>, Vec<u8>) {
    let prefix = key.record_prefix();
    let mut start = prefix.clone();
    start.extend_from_slice(&timestamp_bytes(from));
    let mut end = prefix;
    let to_millis = u64::from_be_bytes(timestamp_bytes(to)).saturating_add(1);
    end.extend_from_slice(&to_millis.to_be_bytes());
    (start, end)
}

/// Collect up to `limit` distinct wallets from ledger keys in key order.
pub(crate) fn distinct_wallets<I>(keys: I, limit: usize) -> anyhow::Result<Vec<WalletAddress>>
where
    I: Iterator<Item = anyhow::Result<Vec<u8>>>,
{
    let mut wallets: Vec<WalletAddress> = Vec::new();
    for key in keys {
        if wallets.len() >= limit {
            break;
        }
        let key = LedgerKey::from_storage_key(&key?)?;
        if wallets.last() != Some(&key.wallet) {
            wallets.push(key.wallet);
        }
    }
    Ok(wallets)
}

pub(crate) fn serialize_record<T: Serialize>(value: &T, label: &str) -> anyhow::Result<Vec<u8>> {
    use anyhow::Context;
    serde_json::to_vec(value).with_context(|| format!("serialize {label}"))
}

pub(crate) fn deserialize<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> anyhow::Result<T> {
    use anyhow::Context;
    serde_json::from_slice(bytes).context("deserialize record")
}

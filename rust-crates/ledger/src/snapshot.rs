use crate::{
    accrual::Rate,
    ledger::timestamp_bytes,
    resource::{
        AssetId,
        KEY_SEPARATOR,
        ResourceKind,
        WalletAddress,
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
use std::collections::{
    BTreeMap,
    BTreeSet,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    Verified,
    MismatchGained,
    MismatchLost,
    /// Assets were both gained and lost since the last check.
    MismatchMixed,
    /// Ownership source unavailable long enough that accrual was paused.
    Paused,
}

/// Immutable record of what a wallet owned at one reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnershipSnapshot {
    pub wallet: WalletAddress,
    pub taken_at: DateTime<Utc>,
    pub asset_ids: BTreeSet<AssetId>,
    pub derived_rates: BTreeMap<ResourceKind, Rate>,
    pub status: VerificationStatus,
}

impl OwnershipSnapshot {
    /// `wallet|<millis be>|<seq be>`. `seq` separates snapshots taken in the
    /// same millisecond.
    pub fn storage_key(&self, seq: u64) -> Vec<u8> {
        let mut key = self.wallet.as_str().as_bytes().to_vec();
        key.push(KEY_SEPARATOR);
        key.extend_from_slice(&timestamp_bytes(self.taken_at));
        key.extend_from_slice(&seq.to_be_bytes());
        key
    }
}

/// Evidence carried between two reconciliation cycles of a wallet.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationState {
    /// Assets seen on chain but not yet recorded, waiting for a second
    /// independent sighting.
    pub pending_gain: BTreeSet<AssetId>,
    pub consecutive_failures: u32,
    pub paused: bool,
    pub last_verified_at: Option<DateTime<Utc>>,
}

//! Continuous resource accrual ledger.
//!
//! One ledger per `(wallet, resource)` pair. Balances are never ticked: the
//! stored baseline plus `rate * elapsed` is recomputed on every read, and any
//! change to the rate or the baseline first folds the elapsed accrual into the
//! baseline (a rebase).

use serde::{
    Deserialize,
    Serialize,
};

pub mod accrual;
pub mod backup;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod guard;
pub mod leaderboard;
pub mod ledger;
pub mod progression;
pub mod rate;
pub mod reconcile;
pub mod resource;
pub mod retention;
pub mod snapshot;
pub mod storage;

pub use error::LedgerError;

pub type Result<T, E = LedgerError> = std::result::Result<T, E>;

/// Whether a corrective or destructive operation only reports or actually
/// writes. Defaults to reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    #[default]
    DryRun,
    Apply,
}

impl RunMode {
    pub fn from_dry_run(dry_run: bool) -> Self {
        if dry_run { RunMode::DryRun } else { RunMode::Apply }
    }

    pub fn is_dry_run(self) -> bool {
        matches!(self, RunMode::DryRun)
    }
}

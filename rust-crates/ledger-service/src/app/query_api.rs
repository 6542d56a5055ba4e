use accrual_ledger::{
    LedgerError,
    RunMode,
    accrual::Rate,
    backup::{
        LedgerBackup,
        RestoreReport,
    },
    checkpoint::RateView,
    guard::{
        CorrectionReport,
        ShortfallEntry,
    },
    leaderboard::LeaderboardEntry,
    ledger::{
        AuditRecord,
        Ledger,
    },
    progression::{
        LevelUp,
        Swap,
    },
    rate::{
        AssetContribution,
        MAX_LEVEL,
    },
    resource::{
        AssetId,
        LedgerKey,
        ResourceKind,
        WalletAddress,
    },
    retention::RetentionReport,
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
use std::collections::BTreeSet;
use tokio::sync::oneshot;

pub trait QueryAPI {
    fn query(&mut self) -> impl Future<Output = crate::Result<Query>>;
}

pub type Responder<T> = oneshot::Sender<accrual_ledger::Result<T>>;

#[derive(Debug)]
pub enum Query {
    Balance(LedgerQuery<BalanceView>),
    Rate(LedgerQuery<RateView>),
    History(HistoryQuery),
    Diagnostics(Responder<Diagnostics>),
    Leaderboard(LeaderboardQuery),
    Mutate(MutationQuery),
    Correct(AdminQuery<CorrectionReport>),
    Retention(AdminQuery<RetentionReport>),
    Backup(BackupQuery),
    Restore(RestoreQuery),
}

#[derive(Debug)]
pub struct LedgerQuery<T> {
    pub key: LedgerKey,
    pub sender: Responder<T>,
}

#[derive(Debug)]
pub struct HistoryQuery {
    pub key: LedgerKey,
    pub hours: u32,
    pub sender: Responder<Vec<AuditRecord>>,
}

#[derive(Debug)]
pub struct LeaderboardQuery {
    pub resource: ResourceKind,
    pub limit: usize,
    pub sender: Responder<Vec<LeaderboardEntry>>,
}

/// A write to one ledger. Every write needs the operator token.
#[derive(Debug)]
pub struct MutationQuery {
    pub operator: String,
    pub token: String,
    pub key: LedgerKey,
    pub change: LedgerChange,
    pub sender: Responder<MutationOutcome>,
}

/// Destructive or corrective request. The token is checked by the app before
/// anything runs.
#[derive(Debug)]
pub struct AdminQuery<T> {
    pub operator: String,
    pub token: String,
    pub mode: RunMode,
    pub sender: Responder<T>,
}

#[derive(Debug)]
pub struct BackupQuery {
    pub operator: String,
    pub token: String,
    pub sender: Responder<LedgerBackup>,
}

#[derive(Debug)]
pub struct RestoreQuery {
    pub operator: String,
    pub token: String,
    pub mode: RunMode,
    pub backup: LedgerBackup,
    pub sender: Responder<RestoreReport>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum LedgerChange {
    Open,
    Spend {
        amount: Decimal,
    },
    Credit {
        amount: Decimal,
        reason: String,
    },
    /// Replace the whole rate source.
    RateSource {
        assets: Vec<AssetSlot>,
        #[serde(default)]
        global_multiplier: Option<Decimal>,
    },
    /// Temporary boost such as a tenure buff. `None` never expires.
    Multiplier {
        factor: Decimal,
        #[serde(default)]
        expires_at: Option<DateTime<Utc>>,
    },
    ClearMultiplier,
    Suspend {
        suspended: bool,
    },
    Slot(AssetSlot),
    Unslot {
        asset: AssetId,
    },
    Swap {
        removed: AssetId,
        #[serde(flatten)]
        added: AssetSlot,
    },
    SetLevel {
        asset: AssetId,
        level: u8,
    },
    /// Raise one level, paying tenure.
    LevelUp {
        asset: AssetId,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetSlot {
    pub asset: AssetId,
    pub rate_per_hour: Decimal,
    #[serde(default = "first_level")]
    pub level: u8,
}

fn first_level() -> u8 {
    1
}

impl AssetSlot {
    pub fn contribution(&self) -> accrual_ledger::Result<AssetContribution> {
        if self.rate_per_hour.is_sign_negative() {
            return Err(LedgerError::InvalidAmount {
                amount: self.rate_per_hour,
            });
        }
        if !(1..=MAX_LEVEL).contains(&self.level) {
            return Err(LedgerError::InvalidLevel { level: self.level });
        }
        Ok(AssetContribution::new(Rate::per_hour(self.rate_per_hour)).with_level(self.level))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum MutationOutcome {
    Ledger(Ledger),
    LevelUp(LevelUp),
    Swap(Swap),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceView {
    pub key: LedgerKey,
    pub balance: Decimal,
    pub as_of: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetOverlap {
    pub asset: AssetId,
    pub wallets: BTreeSet<WalletAddress>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostics {
    pub shortfalls: Vec<ShortfallEntry>,
    pub overlaps: Vec<AssetOverlap>,
}

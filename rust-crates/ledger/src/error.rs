use crate::resource::{
    AssetId,
    LedgerKey,
};
use rust_decimal::Decimal;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("insufficient balance on {key}: requested {requested}, available {available}")]
    InsufficientBalance {
        key: LedgerKey,
        requested: Decimal,
        available: Decimal,
    },

    #[error("invariant violated on {key}: {detail}")]
    InvariantViolation { key: LedgerKey, detail: String },

    #[error("ledger {key} is degraded; spends and credits are blocked until corrected")]
    LedgerDegraded { key: LedgerKey },

    #[error("no ledger for {key}")]
    LedgerNotFound { key: LedgerKey },

    #[error("amount must be positive, got {amount}")]
    InvalidAmount { amount: Decimal },

    #[error("amount on {key} exceeds the representable range")]
    Overflow { key: LedgerKey },

    #[error("invalid rate multiplier {factor}")]
    InvalidMultiplier { factor: Decimal },

    #[error("invalid wallet address '{raw}': {reason}")]
    InvalidWallet { raw: String, reason: &'static str },

    #[error("unknown resource '{0}'")]
    UnknownResource(String),

    #[error("invalid asset id '{0}'")]
    InvalidAsset(String),

    #[error("asset {asset} is not part of the rate source of {key}")]
    AssetNotInSource { key: LedgerKey, asset: AssetId },

    #[error("asset {asset} already contributes to {key}")]
    AssetAlreadyInSource { key: LedgerKey, asset: AssetId },

    #[error("no tenure threshold configured for level {level}")]
    LevelNotConfigured { level: u8 },

    #[error("level {level} is outside 1..=10")]
    InvalidLevel { level: u8 },

    #[error("level of {asset} on {key} changed while it was being raised")]
    StaleLevel { key: LedgerKey, asset: AssetId },

    #[error("concurrent modification of {key} persisted after {attempts} attempts")]
    ConcurrencyConflict { key: LedgerKey, attempts: u32 },

    #[error("operator '{operator}' is not authorized")]
    Unauthorized { operator: String },

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

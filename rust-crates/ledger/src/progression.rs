//! Game-driven rate source changes: asset levels, slotting and swaps.
//!
//! Each change rewrites the stored rate source under the version check, so
//! the ledger is rebased under the old rate first. Operations paid for from
//! another ledger spend first and refund the payment if the rate change does
//! not commit.

use crate::{
    LedgerError,
    Result,
    checkpoint::{
        CheckpointStore,
        Step,
        log_application,
    },
    ledger::{
        AuditKind,
        Ledger,
    },
    rate::{
        AssetContribution,
        MAX_LEVEL,
        RateDeterminant,
        RateSource,
    },
    resource::{
        AssetId,
        LedgerKey,
        ResourceKind,
    },
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

const LEVEL_UP_REFUND: &str = "level-up refund";
const SWAP_REFUND: &str = "swap refund";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelUp {
    pub key: LedgerKey,
    pub asset: AssetId,
    pub level: u8,
    pub tenure_spent: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Swap {
    pub key: LedgerKey,
    pub removed: AssetId,
    pub added: AssetId,
    pub gold_spent: Decimal,
}

impl<S: LedgerStorage> CheckpointStore<S> {
    /// Set an asset's level directly, without charging tenure.
    pub fn set_asset_level(
        &self,
        key: &LedgerKey,
        asset: &AssetId,
        level: u8,
        now: DateTime<Utc>,
    ) -> Result<Ledger> {
        if !(1..=MAX_LEVEL).contains(&level) {
            return Err(LedgerError::InvalidLevel { level });
        }
        let kind = AuditKind::LevelUp {
            asset: asset.clone(),
            level,
        };
        self.rewrite_source(key, now, false, Some(kind), |source| {
            if source.set_level(asset, level) {
                Ok(())
            } else {
                Err(not_in_source(key, asset))
            }
        })
    }

    /// Raise `asset` on `key` by one level, paying the configured threshold
    /// from the wallet's tenure ledger. Tenure above the threshold carries
    /// over.
    pub fn level_up_asset(
        &self,
        key: &LedgerKey,
        asset: &AssetId,
        now: DateTime<Utc>,
    ) -> Result<LevelUp> {
        let current = self
            .get_ledger(key)?
            .rate_source()
            .level(asset)
            .ok_or_else(|| not_in_source(key, asset))?;
        if current >= MAX_LEVEL {
            return Err(LedgerError::InvalidLevel {
                level: current.saturating_add(1),
            });
        }
        let level = current + 1;
        let cost = self
            .config()
            .progression
            .tenure_for_level(level)
            .ok_or(LedgerError::LevelNotConfigured { level })?;

        let tenure = LedgerKey::new(key.wallet.clone(), ResourceKind::Tenure);
        self.spend(&tenure, cost, now)?;
        let kind = AuditKind::LevelUp {
            asset: asset.clone(),
            level,
        };
        let raised = self.rewrite_source(key, now, false, Some(kind), |source| {
            match source.level(asset) {
                Some(found) if found == current => {
                    source.set_level(asset, level);
                    Ok(())
                }
                Some(_) => Err(LedgerError::StaleLevel {
                    key: key.clone(),
                    asset: asset.clone(),
                }),
                None => Err(not_in_source(key, asset)),
            }
        });
        if let Err(error) = raised {
            tracing::warn!("level-up of {asset} on {key} failed after paying {cost} tenure: {error}");
            self.credit(&tenure, cost, LEVEL_UP_REFUND, now)?;
            return Err(error);
        }
        tracing::info!("{asset} on {key} reached level {level} for {cost} tenure");
        Ok(LevelUp {
            key: key.clone(),
            asset: asset.clone(),
            level,
            tenure_spent: cost,
        })
    }

    /// Add an asset to the rate source. Creates the ledger on first use.
    pub fn slot_asset(
        &self,
        key: &LedgerKey,
        asset: &AssetId,
        contribution: AssetContribution,
        now: DateTime<Utc>,
    ) -> Result<Ledger> {
        check_level(contribution.level)?;
        self.rewrite_source(key, now, true, None, |source| {
            if source.contains(asset) {
                return Err(already_in_source(key, asset));
            }
            source.insert(asset.clone(), contribution);
            Ok(())
        })
    }

    /// Remove an asset from the rate source. The ledger stops accruing once
    /// nothing is left.
    pub fn unslot_asset(
        &self,
        key: &LedgerKey,
        asset: &AssetId,
        now: DateTime<Utc>,
    ) -> Result<Ledger> {
        self.rewrite_source(key, now, false, None, |source| {
            source
                .remove(asset)
                .map(|_| ())
                .ok_or_else(|| not_in_source(key, asset))
        })
    }

    /// Replace `removed` with `added` in one commit, paying the escalating
    /// swap cost from the wallet's gold ledger.
    pub fn swap_asset(
        &self,
        key: &LedgerKey,
        removed: &AssetId,
        added: &AssetId,
        contribution: AssetContribution,
        now: DateTime<Utc>,
    ) -> Result<Swap> {
        check_level(contribution.level)?;
        let ledger = self.get_ledger(key)?;
        if !ledger.rate_source().contains(removed) {
            return Err(not_in_source(key, removed));
        }
        if ledger.rate_source().contains(added) || added == removed {
            return Err(already_in_source(key, added));
        }
        let cost = self.config().progression.swap_cost(ledger.swaps());

        let gold = LedgerKey::new(key.wallet.clone(), ResourceKind::Gold);
        self.spend(&gold, cost, now)?;
        let cap = self.cap(key);
        let swapped = self.mutate(key, now, false, |ledger| {
            let mut source = ledger.rate_source().clone();
            source
                .remove(removed)
                .ok_or_else(|| not_in_source(key, removed))?;
            if source.contains(added) {
                return Err(already_in_source(key, added));
            }
            source.insert(added.clone(), contribution);
            let application = RateDeterminant::apply(ledger, &source, now, cap)?;
            ledger.swaps = ledger.swaps.saturating_add(1);
            Ok(Step::Commit {
                value: application,
                kind: AuditKind::Swap {
                    removed: removed.clone(),
                    added: added.clone(),
                },
                amount: cost,
            })
        });
        match swapped {
            Ok(mutation) => {
                log_application(key, &mutation.value);
                tracing::info!("swapped {removed} for {added} on {key} for {cost} gold");
                Ok(Swap {
                    key: key.clone(),
                    removed: removed.clone(),
                    added: added.clone(),
                    gold_spent: cost,
                })
            }
            Err(error) => {
                tracing::warn!("swap on {key} failed after paying {cost} gold: {error}");
                self.credit(&gold, cost, SWAP_REFUND, now)?;
                Err(error)
            }
        }
    }

    /// Apply `edit` to the stored source and switch the ledger to the result.
    /// `kind` defaults to a rate change audit carrying the new fingerprint.
    fn rewrite_source<F>(
        &self,
        key: &LedgerKey,
        now: DateTime<Utc>,
        create_if_missing: bool,
        kind: Option<AuditKind>,
        edit: F,
    ) -> Result<Ledger>
    where
        F: Fn(&mut RateSource) -> Result<()>,
    {
        let cap = self.cap(key);
        let mutation = self.mutate(key, now, create_if_missing, |ledger| {
            let mut source = ledger.rate_source().clone();
            edit(&mut source)?;
            let application = RateDeterminant::apply(ledger, &source, now, cap)?;
            if !application.is_applied() {
                return Ok(Step::Skip(application));
            }
            let kind = kind.clone().unwrap_or_else(|| AuditKind::RateChange {
                fingerprint: ledger.rate_fingerprint().to_string(),
            });
            Ok(Step::Commit {
                value: application,
                kind,
                amount: Decimal::ZERO,
            })
        })?;
        log_application(key, &mutation.value);
        Ok(mutation.ledger)
    }
}

fn check_level(level: u8) -> Result<()> {
    if (1..=MAX_LEVEL).contains(&level) {
        Ok(())
    } else {
        Err(LedgerError::InvalidLevel { level })
    }
}

fn not_in_source(key: &LedgerKey, asset: &AssetId) -> LedgerError {
    LedgerError::AssetNotInSource {
        key: key.clone(),
        asset: asset.clone(),
    }
}

fn already_in_source(key: &LedgerKey, asset: &AssetId) -> LedgerError {
    LedgerError::AssetAlreadyInSource {
        key: key.clone(),
        asset: asset.clone(),
    }
}

//! Rate derivation from the set of owned assets.

use crate::{
    Result,
    accrual::{
        ClockAnomaly,
        Rate,
    },
    ledger::Ledger,
    resource::AssetId,
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
use sha2::{
    Digest,
    Sha256,
};
use std::collections::{
    BTreeMap,
    BTreeSet,
};

/// Extra rate, in percent of the base rate, granted per asset level (1..=10).
pub const LEVEL_BOOST_PERCENT: [u32; 10] = [0, 25, 60, 110, 180, 270, 400, 600, 900, 1400];
pub const MAX_LEVEL: u8 = 10;

const BEST_RANK: u32 = 1;
const WORST_RANK: u32 = 4000;
const BEST_RANK_GOLD_PER_HOUR: u32 = 100;
const WORST_RANK_GOLD_PER_HOUR: u32 = 10;

/// Gold per hour for an asset of the given rarity rank, linear between the
/// best and worst rank and rounded to cents.
pub fn rank_base_rate(rank: u32) -> Rate {
    let rank = rank.clamp(BEST_RANK, WORST_RANK);
    let span = Decimal::from(BEST_RANK_GOLD_PER_HOUR - WORST_RANK_GOLD_PER_HOUR);
    let steps = Decimal::from(WORST_RANK - BEST_RANK);
    let per_hour = Decimal::from(BEST_RANK_GOLD_PER_HOUR)
        - span * Decimal::from(rank - BEST_RANK) / steps;
    Rate::per_hour(per_hour.round_dp(2))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetContribution {
    pub base_rate: Rate,
    pub level: u8,
}

impl AssetContribution {
    pub fn new(base_rate: Rate) -> Self {
        Self {
            base_rate,
            level: 1,
        }
    }

    pub fn with_level(mut self, level: u8) -> Self {
        self.level = level;
        self
    }

    pub fn level_boost(&self) -> Rate {
        let index = usize::from(self.level.clamp(1, MAX_LEVEL)) - 1;
        let percent = Decimal::from(LEVEL_BOOST_PERCENT[index]);
        self.base_rate.scaled(percent / Decimal::ONE_HUNDRED)
    }

    /// `baseRate + levelBoost`.
    pub fn effective_rate(&self) -> Rate {
        self.base_rate + self.level_boost()
    }
}

/// Rate-determining assets of one ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateSource {
    assets: BTreeMap<AssetId, AssetContribution>,
    global_multiplier: Decimal,
}

impl Default for RateSource {
    fn default() -> Self {
        Self {
            assets: BTreeMap::new(),
            global_multiplier: Decimal::ONE,
        }
    }
}

impl RateSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_asset(mut self, asset: AssetId, contribution: AssetContribution) -> Self {
        self.insert(asset, contribution);
        self
    }

    pub fn insert(&mut self, asset: AssetId, contribution: AssetContribution) {
        self.assets.insert(asset, contribution);
    }

    pub fn remove(&mut self, asset: &AssetId) -> Option<AssetContribution> {
        self.assets.remove(asset)
    }

    /// Returns false when the asset is not part of the source.
    pub fn set_level(&mut self, asset: &AssetId, level: u8) -> bool {
        match self.assets.get_mut(asset) {
            Some(contribution) => {
                contribution.level = level;
                true
            }
            None => false,
        }
    }

    pub fn level(&self, asset: &AssetId) -> Option<u8> {
        self.assets.get(asset).map(|contribution| contribution.level)
    }

    pub fn set_global_multiplier(&mut self, multiplier: Decimal) {
        self.global_multiplier = multiplier.max(Decimal::ZERO);
    }

    pub fn global_multiplier(&self) -> Decimal {
        self.global_multiplier
    }

    pub fn contains(&self, asset: &AssetId) -> bool {
        self.assets.contains_key(asset)
    }

    pub fn asset_ids(&self) -> BTreeSet<AssetId> {
        self.assets.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }

    /// `sum(contributions) * globalMultiplier`.
    pub fn composite_rate(&self) -> Rate {
        self.assets
            .values()
            .map(AssetContribution::effective_rate)
            .sum::<Rate>()
            .scaled(self.global_multiplier)
    }

    /// Same source minus the given assets.
    pub fn without(&self, lost: &BTreeSet<AssetId>) -> Self {
        let mut shrunk = self.clone();
        shrunk.assets.retain(|asset, _| !lost.contains(asset));
        shrunk
    }

    /// SHA-256 over the sorted asset set, levels, base rates and the global
    /// multiplier. Equal sources always hash equal.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for (asset, contribution) in &self.assets {
            hasher.update(asset.as_str().as_bytes());
            hasher.update(b":");
            hasher.update(
                contribution
                    .base_rate
                    .as_per_day()
                    .normalize()
                    .to_string()
                    .as_bytes(),
            );
            hasher.update(b":");
            hasher.update([contribution.level]);
            hasher.update(b";");
        }
        hasher.update(b"x");
        hasher.update(self.global_multiplier.normalize().to_string().as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Outcome of offering a rate source to a ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateApplication {
    /// The source was already the one in effect.
    Unchanged,
    Applied {
        old_rate: Rate,
        new_rate: Rate,
        /// Balance folded into the baseline at the change instant.
        rebased_balance: Decimal,
        activation: Option<bool>,
        clock_anomaly: Option<ClockAnomaly>,
    },
}

impl RateApplication {
    pub fn is_applied(&self) -> bool {
        matches!(self, RateApplication::Applied { .. })
    }
}

/// Applies rate sources to ledgers, rebasing under the old rate first.
pub struct RateDeterminant;

impl RateDeterminant {
    pub fn apply(
        ledger: &mut Ledger,
        source: &RateSource,
        at: DateTime<Utc>,
        cap: Option<Decimal>,
    ) -> Result<RateApplication> {
        let fingerprint = source.fingerprint();
        if fingerprint == ledger.rate_fingerprint {
            return Ok(RateApplication::Unchanged);
        }

        let was_active = ledger.is_active;
        let old_rate = ledger.rate;
        let accrual = ledger.rebase(at, cap)?;

        ledger.rate = source.composite_rate();
        ledger.rate_source = source.clone();
        ledger.rate_fingerprint = fingerprint;
        ledger.refresh_activity(at);

        Ok(RateApplication::Applied {
            old_rate,
            new_rate: ledger.rate,
            rebased_balance: accrual.balance,
            activation: (was_active != ledger.is_active).then_some(ledger.is_active),
            clock_anomaly: accrual.clock_anomaly,
        })
    }
}

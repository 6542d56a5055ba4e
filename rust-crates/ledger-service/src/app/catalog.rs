use accrual_ledger::{
    rate::{
        AssetContribution,
        rank_base_rate,
    },
    reconcile::AssetCatalog,
    resource::{
        AssetId,
        ResourceKind,
    },
};

/// Gold contributions of one collection, derived from the rarity rank encoded
/// as the trailing digits of each asset name (`Hero1234` has rank 1234).
///
/// Essence and tenure come from in-game slotting, never from plain ownership.
pub struct RankedAssetCatalog {
    policy_id: String,
}

impl RankedAssetCatalog {
    pub fn new(policy_id: &str) -> Self {
        Self {
            policy_id: policy_id.trim().to_ascii_lowercase(),
        }
    }

    fn rank(&self, asset: &AssetId) -> Option<u32> {
        let name_hex = asset.as_str().strip_prefix(&self.policy_id)?;
        let name = String::from_utf8(hex::decode(name_hex).ok()?).ok()?;
        let digits_at = name
            .char_indices()
            .rev()
            .take_while(|(_, c)| c.is_ascii_digit())
            .last()
            .map(|(index, _)| index)?;
        name[digits_at..].parse().ok()
    }
}

impl AssetCatalog for RankedAssetCatalog {
    fn contribution(&self, resource: ResourceKind, asset: &AssetId) -> Option<AssetContribution> {
        match resource {
            ResourceKind::Gold => self
                .rank(asset)
                .map(|rank| AssetContribution::new(rank_base_rate(rank))),
            ResourceKind::Essence | ResourceKind::Tenure => None,
        }
    }
}

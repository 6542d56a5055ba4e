use crate::{
    Result,
    accrual::Rate,
    checkpoint::CheckpointStore,
    resource::{
        ResourceKind,
        WalletAddress,
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

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    /// 1-based.
    pub rank: usize,
    pub wallet: WalletAddress,
    /// Lifetime earnings including accrual pending at the read instant.
    pub earned: Decimal,
    pub balance: Decimal,
    pub rate: Rate,
}

impl<S: LedgerStorage> CheckpointStore<S> {
    /// Wallets ranked by lifetime earnings of `resource`, ties broken by
    /// wallet. Suspended and degraded ledgers are left out until they are
    /// verified or corrected.
    pub fn top_earners(
        &self,
        resource: ResourceKind,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<LeaderboardEntry>> {
        let cap = self.config().cap(resource);
        let mut entries = Vec::new();
        self.for_each_ledger(|ledger| {
            if ledger.key().resource != resource || ledger.is_suspended() || ledger.is_degraded() {
                return;
            }
            entries.push(LeaderboardEntry {
                rank: 0,
                wallet: ledger.key().wallet.clone(),
                earned: ledger.earned_at(now, cap),
                balance: ledger.balance_at(now, cap).balance,
                rate: ledger.rate(),
            });
        })?;
        entries.sort_by(|a, b| b.earned.cmp(&a.earned).then_with(|| a.wallet.cmp(&b.wallet)));
        entries.truncate(limit);
        for (index, entry) in entries.iter_mut().enumerate() {
            entry.rank = index + 1;
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;
    use crate::{
        config::LedgerConfig,
        rate::{
            AssetContribution,
            RateSource,
        },
        resource::{
            AssetId,
            LedgerKey,
        },
        storage::InMemoryLedgerStorage,
    };
    use chrono::{
        Duration,
        TimeZone,
    };
    use rust_decimal_macros::dec;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap()
    }

    fn gold(wallet: &str) -> LedgerKey {
        LedgerKey::new(WalletAddress::parse(wallet).unwrap(), ResourceKind::Gold)
    }

    fn source(per_hour: Decimal) -> RateSource {
        RateSource::new().with_asset(
            AssetId::new("policy.hero").unwrap(),
            AssetContribution::new(Rate::per_hour(per_hour)),
        )
    }

    #[test]
    fn top_earners__ranks_by_lifetime_earnings_not_balance() {
        // given
        let store = CheckpointStore::new(InMemoryLedgerStorage::new(), LedgerConfig::default());
        store.apply_rate_source(&gold("stake1uxslow"), &source(dec!(10)), t0()).unwrap();
        store.apply_rate_source(&gold("stake1uxfast"), &source(dec!(30)), t0()).unwrap();
        store.apply_rate_source(&gold("stake1uxspender"), &source(dec!(20)), t0()).unwrap();
        store.spend(&gold("stake1uxspender"), dec!(35), t0() + Duration::hours(2)).unwrap();
        store
            .set_suspended(&gold("stake1uxslow"), true, t0() + Duration::hours(1))
            .unwrap();
        let now = t0() + Duration::hours(2);

        // when
        let board = store.top_earners(ResourceKind::Gold, 5, now).unwrap();

        // then
        let wallets: Vec<&str> = board.iter().map(|entry| entry.wallet.as_str()).collect();
        assert_eq!(wallets, vec!["stake1uxfast", "stake1uxspender"]);
        assert_eq!(board[0].rank, 1);
        assert_eq!(board[0].earned, dec!(60));
        assert_eq!(board[1].earned, dec!(40));
        assert_eq!(board[1].balance, dec!(5));
    }

    #[test]
    fn top_earners__limit__truncates() {
        let store = CheckpointStore::new(InMemoryLedgerStorage::new(), LedgerConfig::default());
        for wallet in ["stake1uxa", "stake1uxb", "stake1uxc"] {
            store.apply_rate_source(&gold(wallet), &source(dec!(10)), t0()).unwrap();
        }

        let board = store.top_earners(ResourceKind::Gold, 2, t0() + Duration::hours(1)).unwrap();

        assert_eq!(board.len(), 2);
        assert_eq!(board[1].rank, 2);
    }
}

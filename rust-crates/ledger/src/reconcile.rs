//! Ownership reconciliation.
//!
//! Lost assets shrink the rate immediately. Gained assets only raise it once
//! a second, independent check still sees them. An unreachable ownership
//! source skips the cycle; enough consecutive failures pause the wallet.

use crate::{
    Result,
    accrual::Rate,
    checkpoint::{
        CheckpointStore,
        SweepReport,
    },
    rate::AssetContribution,
    resource::{
        AssetId,
        LedgerKey,
        ResourceKind,
        WalletAddress,
    },
    snapshot::{
        OwnershipSnapshot,
        ReconciliationState,
        VerificationStatus,
    },
    storage::LedgerStorage,
};
use chrono::{
    DateTime,
    Utc,
};
use std::{
    collections::{
        BTreeMap,
        BTreeSet,
    },
    future::Future,
};

pub(crate) const RECONCILIATION_SWEEP_JOB: &str = "reconciliation_sweep";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("ownership source unavailable: {reason}")]
pub struct ExternalSourceUnavailable {
    pub reason: String,
}

impl ExternalSourceUnavailable {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Authoritative view of which assets a wallet holds. May be stale, rate
/// limited or down.
pub trait OwnershipSource: Send + Sync {
    fn owned_assets(
        &self,
        wallet: &WalletAddress,
    ) -> impl Future<Output = std::result::Result<BTreeSet<AssetId>, ExternalSourceUnavailable>> + Send;
}

/// What an asset contributes to a resource's rate. `None` when the asset does
/// not produce that resource.
pub trait AssetCatalog: Send + Sync {
    fn contribution(&self, resource: ResourceKind, asset: &AssetId) -> Option<AssetContribution>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Checked {
        status: VerificationStatus,
        lost: BTreeSet<AssetId>,
        /// Gains seen twice in a row and added to the rate.
        applied_gains: BTreeSet<AssetId>,
        /// Gains waiting for a second sighting.
        pending_gains: BTreeSet<AssetId>,
        resumed: bool,
    },
    SourceUnavailable {
        consecutive_failures: u32,
        paused: bool,
    },
}

pub struct OwnershipReconciler<O, C> {
    source: O,
    catalog: C,
}

impl<O: OwnershipSource, C: AssetCatalog> OwnershipReconciler<O, C> {
    pub fn new(source: O, catalog: C) -> Self {
        Self { source, catalog }
    }

    /// Diff the wallet's ledgers against the ownership source.
    ///
    /// Ledgers are read after the lookup returns and every rate change is
    /// computed against the ledger at commit time, so changes committed while
    /// the lookup was in flight are kept.
    pub async fn reconcile_wallet<S: LedgerStorage>(
        &self,
        store: &CheckpointStore<S>,
        wallet: &WalletAddress,
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome> {
        let storage = store.storage();
        let state = storage.reconciliation_state(wallet)?;

        let owned = match self.source.owned_assets(wallet).await {
            Ok(owned) => owned,
            Err(unavailable) => {
                return self.record_failure(store, wallet, state, now, unavailable);
            }
        };
        let ledgers = storage.ledgers_for_wallet(wallet)?;

        let resumed = state.paused;
        let mut lost = BTreeSet::new();
        let mut gained = BTreeSet::new();
        let mut applied_gains = BTreeSet::new();
        let mut derived_rates = BTreeMap::new();
        for resource in ResourceKind::ALL {
            let key = LedgerKey::new(wallet.clone(), resource);
            let existing = ledgers.iter().find(|ledger| ledger.key().resource == resource);
            let recorded = existing
                .map(|ledger| ledger.rate_source().asset_ids())
                .unwrap_or_default();
            let lost_here: BTreeSet<AssetId> = recorded.difference(&owned).cloned().collect();

            // Only resources earned by plain ownership can gain; slotted
            // resources change through explicit slot operations.
            let mut confirmed = BTreeMap::new();
            if store.config().policy(resource).tracks_full_ownership {
                for asset in owned.difference(&recorded) {
                    let Some(contribution) = self.catalog.contribution(resource, asset) else {
                        continue;
                    };
                    gained.insert(asset.clone());
                    if state.pending_gain.contains(asset) {
                        confirmed.insert(asset.clone(), contribution);
                    }
                }
            }
            lost.extend(lost_here.iter().cloned());

            let ledger = if lost_here.is_empty() && confirmed.is_empty() {
                existing.cloned()
            } else {
                store.reconcile_assets(&key, &lost_here, &confirmed, now)?
            };
            let Some(ledger) = ledger else {
                continue;
            };
            applied_gains.extend(
                confirmed
                    .keys()
                    .filter(|asset| ledger.rate_source().contains(asset))
                    .cloned(),
            );
            if resumed {
                store.set_suspended(&key, false, now)?;
            }
            derived_rates.insert(resource, ledger.rate());
        }

        let pending_gains: BTreeSet<AssetId> =
            gained.difference(&applied_gains).cloned().collect();
        let status = match (gained.is_empty(), lost.is_empty()) {
            (true, true) => VerificationStatus::Verified,
            (false, true) => VerificationStatus::MismatchGained,
            (true, false) => VerificationStatus::MismatchLost,
            (false, false) => VerificationStatus::MismatchMixed,
        };
        if !lost.is_empty() {
            tracing::warn!(
                "wallet {wallet} no longer holds {} recorded asset(s); rate reduced",
                lost.len()
            );
        }
        if !gained.is_empty() {
            tracing::warn!(
                "wallet {wallet} holds {} unrecorded asset(s): {} applied, {} awaiting reverification",
                gained.len(),
                applied_gains.len(),
                pending_gains.len()
            );
        }
        if resumed {
            tracing::info!("ownership source reachable again for {wallet}; accrual resumed");
        }

        storage.append_snapshot(&OwnershipSnapshot {
            wallet: wallet.clone(),
            taken_at: now,
            asset_ids: owned,
            derived_rates,
            status,
        })?;
        let state = ReconciliationState {
            pending_gain: pending_gains.clone(),
            consecutive_failures: 0,
            paused: false,
            last_verified_at: Some(now),
        };
        storage.put_reconciliation_state(wallet, &state)?;

        Ok(ReconcileOutcome::Checked {
            status,
            lost,
            applied_gains,
            pending_gains,
            resumed,
        })
    }

    fn record_failure<S: LedgerStorage>(
        &self,
        store: &CheckpointStore<S>,
        wallet: &WalletAddress,
        mut state: ReconciliationState,
        now: DateTime<Utc>,
        unavailable: ExternalSourceUnavailable,
    ) -> Result<ReconcileOutcome> {
        let storage = store.storage();
        state.consecutive_failures += 1;
        tracing::warn!(
            "skipping reconciliation of {wallet} ({} consecutive failures): {unavailable}",
            state.consecutive_failures
        );

        let threshold = store.config().reconciliation.pause_after_failures.max(1);
        if state.consecutive_failures >= threshold && !state.paused {
            let mut derived_rates = BTreeMap::new();
            for ledger in storage.ledgers_for_wallet(wallet)? {
                store.set_suspended(ledger.key(), true, now)?;
                derived_rates.insert(ledger.key().resource, Rate::ZERO);
            }
            state.paused = true;
            tracing::warn!("accrual paused for {wallet} until ownership can be verified");
            storage.append_snapshot(&OwnershipSnapshot {
                wallet: wallet.clone(),
                taken_at: now,
                asset_ids: BTreeSet::new(),
                derived_rates,
                status: VerificationStatus::Paused,
            })?;
        }
        storage.put_reconciliation_state(wallet, &state)?;

        Ok(ReconcileOutcome::SourceUnavailable {
            consecutive_failures: state.consecutive_failures,
            paused: state.paused,
        })
    }

    /// Reconcile one page of wallets, resuming after the persisted cursor.
    pub async fn reconcile_page<S: LedgerStorage>(
        &self,
        store: &CheckpointStore<S>,
        now: DateTime<Utc>,
    ) -> Result<SweepReport> {
        let storage = store.storage();
        let cursor = match storage.job_cursor(RECONCILIATION_SWEEP_JOB)? {
            Some(bytes) => Some(WalletAddress::parse(&String::from_utf8_lossy(&bytes))?),
            None => None,
        };
        let page_size = store.config().jobs.page_size.max(1);
        let wallets = storage.wallets_after(cursor.as_ref(), page_size)?;

        let mut report = SweepReport {
            visited: wallets.len(),
            ..SweepReport::default()
        };
        for wallet in &wallets {
            match self.reconcile_wallet(store, wallet, now).await {
                Ok(ReconcileOutcome::Checked {
                    status: VerificationStatus::Verified,
                    resumed: false,
                    ..
                }) => {}
                Ok(ReconcileOutcome::Checked { .. }) => report.changed += 1,
                Ok(ReconcileOutcome::SourceUnavailable { .. }) => report.failed += 1,
                Err(error) => {
                    report.failed += 1;
                    tracing::error!("reconciliation of {wallet} failed: {error}");
                }
            }
        }

        report.complete = wallets.len() < page_size;
        let next = if report.complete {
            None
        } else {
            wallets.last().map(|wallet| wallet.as_str().as_bytes().to_vec())
        };
        storage.set_job_cursor(RECONCILIATION_SWEEP_JOB, next.as_deref())?;
        Ok(report)
    }

    pub async fn reconcile_all<S: LedgerStorage>(
        &self,
        store: &CheckpointStore<S>,
        now: DateTime<Utc>,
    ) -> Result<SweepReport> {
        let mut total = SweepReport::default();
        loop {
            let page = self.reconcile_page(store, now).await?;
            total.absorb(&page);
            if page.complete {
                break;
            }
        }
        tracing::info!(
            "reconciliation finished: {} wallets, {} corrected, {} skipped or failed",
            total.visited,
            total.changed,
            total.failed
        );
        Ok(total)
    }
}

/// Asset ids recorded in the rate source of more than one wallet.
pub fn asset_overlaps<S: LedgerStorage>(
    store: &CheckpointStore<S>,
) -> Result<BTreeMap<AssetId, BTreeSet<WalletAddress>>> {
    let mut holders: BTreeMap<AssetId, BTreeSet<WalletAddress>> = BTreeMap::new();
    let page_size = store.config().jobs.page_size.max(1);
    let mut cursor: Option<LedgerKey> = None;
    loop {
        let page = store.storage().ledgers_after(cursor.as_ref(), page_size)?;
        for ledger in &page {
            for asset in ledger.rate_source().asset_ids() {
                holders
                    .entry(asset)
                    .or_default()
                    .insert(ledger.key().wallet.clone());
            }
        }
        if page.len() < page_size {
            break;
        }
        cursor = page.last().map(|ledger| ledger.key().clone());
    }
    holders.retain(|_, wallets| wallets.len() > 1);
    Ok(holders)
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;
    use crate::{
        config::LedgerConfig,
        rate::RateSource,
        storage::InMemoryLedgerStorage,
    };
    use chrono::{
        Duration,
        TimeZone,
    };
    use rust_decimal_macros::dec;
    use std::{
        collections::VecDeque,
        sync::Mutex,
    };

    type Response = std::result::Result<BTreeSet<AssetId>, ExternalSourceUnavailable>;

    /// Replays queued responses; an exhausted queue means the source is down.
    #[derive(Default)]
    struct ScriptedSource {
        responses: Mutex<VecDeque<Response>>,
    }

    impl ScriptedSource {
        fn push(&self, response: Response) {
            self.responses.lock().unwrap().push_back(response);
        }
    }

    impl OwnershipSource for ScriptedSource {
        async fn owned_assets(&self, _wallet: &WalletAddress) -> Response {
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(ExternalSourceUnavailable::new("no scripted response")))
        }
    }

    /// Every asset yields 10/h of gold.
    struct FlatCatalog;

    impl AssetCatalog for FlatCatalog {
        fn contribution(&self, resource: ResourceKind, _asset: &AssetId) -> Option<AssetContribution> {
            (resource == ResourceKind::Gold)
                .then(|| AssetContribution::new(Rate::per_hour(dec!(10))))
        }
    }

    /// Essence only; gold is never produced.
    struct EssenceCatalog;

    impl AssetCatalog for EssenceCatalog {
        fn contribution(&self, resource: ResourceKind, _asset: &AssetId) -> Option<AssetContribution> {
            (resource == ResourceKind::Essence)
                .then(|| AssetContribution::new(Rate::per_hour(dec!(1))))
        }
    }

    /// Levels up asset `a` through the store while the lookup is in flight.
    struct LevelingSource {
        store: CheckpointStore<InMemoryLedgerStorage>,
        owned: BTreeSet<AssetId>,
    }

    impl OwnershipSource for LevelingSource {
        async fn owned_assets(&self, _wallet: &WalletAddress) -> Response {
            self.store
                .set_asset_level(&gold(), &AssetId::new("a").unwrap(), 10, t0() + Duration::hours(1))
                .map_err(|error| ExternalSourceUnavailable::new(error.to_string()))?;
            Ok(self.owned.clone())
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap()
    }

    fn wallet() -> WalletAddress {
        WalletAddress::parse("stake1uxowner").unwrap()
    }

    fn gold() -> LedgerKey {
        LedgerKey::new(wallet(), ResourceKind::Gold)
    }

    fn assets(names: &[&str]) -> BTreeSet<AssetId> {
        names.iter().map(|name| AssetId::new(*name).unwrap()).collect()
    }

    fn recorded_source(names: &[&str]) -> RateSource {
        assets(names).into_iter().fold(RateSource::new(), |source, asset| {
            source.with_asset(asset, AssetContribution::new(Rate::per_hour(dec!(10))))
        })
    }

    fn setup(names: &[&str]) -> (CheckpointStore<InMemoryLedgerStorage>, OwnershipReconciler<ScriptedSource, FlatCatalog>) {
        let store = CheckpointStore::new(InMemoryLedgerStorage::new(), LedgerConfig::default());
        store
            .apply_rate_source(&gold(), &recorded_source(names), t0())
            .unwrap();
        (store, OwnershipReconciler::new(ScriptedSource::default(), FlatCatalog))
    }

    #[tokio::test]
    async fn reconcile_wallet__lost_asset__shrinks_rate_without_touching_accrued_balance() {
        // given
        let (store, reconciler) = setup(&["a", "b", "c"]);
        reconciler.source.push(Ok(assets(&["a", "b"])));
        let now = t0() + Duration::hours(2);

        // when
        let outcome = reconciler.reconcile_wallet(&store, &wallet(), now).await.unwrap();

        // then
        assert!(matches!(
            outcome,
            ReconcileOutcome::Checked {
                status: VerificationStatus::MismatchLost,
                ..
            }
        ));
        let rate = store.get_rate(&gold(), now).unwrap();
        assert_eq!(rate.base_rate.as_per_hour(), dec!(20));
        assert_eq!(rate.asset_ids, assets(&["a", "b"]));
        assert_eq!(store.get_current_balance(&gold(), now).unwrap(), dec!(60));
        assert_eq!(
            store
                .get_current_balance(&gold(), now + Duration::hours(1))
                .unwrap(),
            dec!(80)
        );
    }

    #[tokio::test]
    async fn reconcile_wallet__gain__applies_only_after_second_sighting() {
        // given
        let (store, reconciler) = setup(&["a"]);
        reconciler.source.push(Ok(assets(&["a", "b"])));
        reconciler.source.push(Ok(assets(&["a", "b"])));

        // when
        let first = reconciler
            .reconcile_wallet(&store, &wallet(), t0() + Duration::hours(1))
            .await
            .unwrap();
        let rate_after_first = store.get_rate(&gold(), t0()).unwrap().base_rate;
        let second = reconciler
            .reconcile_wallet(&store, &wallet(), t0() + Duration::hours(2))
            .await
            .unwrap();

        // then
        assert!(matches!(
            first,
            ReconcileOutcome::Checked {
                status: VerificationStatus::MismatchGained,
                ref pending_gains,
                ..
            } if *pending_gains == assets(&["b"])
        ));
        assert_eq!(rate_after_first.as_per_hour(), dec!(10));
        assert!(matches!(
            second,
            ReconcileOutcome::Checked {
                ref applied_gains,
                ..
            } if *applied_gains == assets(&["b"])
        ));
        assert_eq!(
            store.get_rate(&gold(), t0()).unwrap().base_rate.as_per_hour(),
            dec!(20)
        );
    }

    #[tokio::test]
    async fn reconcile_wallet__level_change_during_lookup__is_kept() {
        // given
        let (store, _) = setup(&["a", "b", "c"]);
        let reconciler = OwnershipReconciler::new(
            LevelingSource {
                store: store.clone(),
                owned: assets(&["a", "b"]),
            },
            FlatCatalog,
        );
        let now = t0() + Duration::hours(2);

        // when
        reconciler.reconcile_wallet(&store, &wallet(), now).await.unwrap();

        // then
        let ledger = store.get_ledger(&gold()).unwrap();
        assert_eq!(ledger.rate_source().asset_ids(), assets(&["a", "b"]));
        assert_eq!(ledger.rate_source().level(&AssetId::new("a").unwrap()), Some(10));
        // a at level 10 earns 150/h, b 10/h
        assert_eq!(ledger.rate().as_per_hour(), dec!(160));
    }

    #[tokio::test]
    async fn reconcile_wallet__asset_recorded_under_other_resource__still_joins_gold() {
        // given
        let (store, reconciler) = setup(&["a"]);
        let essence = LedgerKey::new(wallet(), ResourceKind::Essence);
        store
            .apply_rate_source(&essence, &recorded_source(&["x"]), t0())
            .unwrap();
        for _ in 0..3 {
            reconciler.source.push(Ok(assets(&["a", "x"])));
        }

        // when
        let mut outcomes = Vec::new();
        for hour in 1..=3 {
            outcomes.push(
                reconciler
                    .reconcile_wallet(&store, &wallet(), t0() + Duration::hours(hour))
                    .await
                    .unwrap(),
            );
        }

        // then
        assert!(matches!(
            &outcomes[1],
            ReconcileOutcome::Checked { applied_gains, .. } if *applied_gains == assets(&["x"])
        ));
        assert!(matches!(
            &outcomes[2],
            ReconcileOutcome::Checked {
                status: VerificationStatus::Verified,
                ..
            }
        ));
        assert_eq!(
            store.get_ledger(&gold()).unwrap().rate_source().asset_ids(),
            assets(&["a", "x"])
        );
        assert_eq!(
            store.get_ledger(&essence).unwrap().rate_source().asset_ids(),
            assets(&["x"])
        );
    }

    #[tokio::test]
    async fn reconcile_wallet__unslotted_holdings__verify_cleanly() {
        // given
        let store = CheckpointStore::new(InMemoryLedgerStorage::new(), LedgerConfig::default());
        let essence = LedgerKey::new(wallet(), ResourceKind::Essence);
        store
            .apply_rate_source(&essence, &recorded_source(&["x"]), t0())
            .unwrap();
        let reconciler = OwnershipReconciler::new(ScriptedSource::default(), EssenceCatalog);
        reconciler.source.push(Ok(assets(&["x", "y", "z"])));
        let before = store.get_ledger(&essence).unwrap();

        // when
        let outcome = reconciler
            .reconcile_wallet(&store, &wallet(), t0() + Duration::hours(1))
            .await
            .unwrap();

        // then
        assert!(matches!(
            outcome,
            ReconcileOutcome::Checked {
                status: VerificationStatus::Verified,
                ref pending_gains,
                ..
            } if pending_gains.is_empty()
        ));
        assert_eq!(store.get_ledger(&essence).unwrap(), before);
        assert!(
            store
                .storage()
                .reconciliation_state(&wallet())
                .unwrap()
                .pending_gain
                .is_empty()
        );
    }

    #[tokio::test]
    async fn reconcile_wallet__gain_not_seen_again__is_never_applied() {
        // given
        let (store, reconciler) = setup(&["a"]);
        reconciler.source.push(Ok(assets(&["a", "b"])));
        reconciler.source.push(Ok(assets(&["a"])));

        // when
        reconciler
            .reconcile_wallet(&store, &wallet(), t0() + Duration::hours(1))
            .await
            .unwrap();
        let second = reconciler
            .reconcile_wallet(&store, &wallet(), t0() + Duration::hours(2))
            .await
            .unwrap();

        // then
        assert!(matches!(
            second,
            ReconcileOutcome::Checked {
                status: VerificationStatus::Verified,
                ..
            }
        ));
        assert_eq!(
            store.storage().reconciliation_state(&wallet()).unwrap().pending_gain,
            BTreeSet::new()
        );
    }

    #[tokio::test]
    async fn reconcile_wallet__repeated_source_failures__pause_then_resume() {
        // given
        let (store, reconciler) = setup(&["a"]);

        // when
        for hour in 1..=3 {
            reconciler
                .reconcile_wallet(&store, &wallet(), t0() + Duration::hours(hour))
                .await
                .unwrap();
        }
        let paused = store.get_ledger(&gold()).unwrap();
        reconciler.source.push(Ok(assets(&["a"])));
        let outcome = reconciler
            .reconcile_wallet(&store, &wallet(), t0() + Duration::hours(5))
            .await
            .unwrap();

        // then
        assert!(!paused.is_active());
        assert_eq!(paused.baseline(), dec!(30));
        assert!(matches!(outcome, ReconcileOutcome::Checked { resumed: true, .. }));
        assert!(store.get_ledger(&gold()).unwrap().is_active());
        assert_eq!(
            store
                .get_current_balance(&gold(), t0() + Duration::hours(6))
                .unwrap(),
            dec!(40)
        );
        let statuses: Vec<VerificationStatus> = store
            .storage()
            .snapshots_for_wallet(&wallet())
            .unwrap()
            .into_iter()
            .map(|snapshot| snapshot.status)
            .collect();
        assert_eq!(
            statuses,
            vec![VerificationStatus::Paused, VerificationStatus::Verified]
        );
    }

    #[tokio::test]
    async fn reconcile_wallet__source_failure_below_threshold__keeps_accruing() {
        let (store, reconciler) = setup(&["a"]);

        let outcome = reconciler
            .reconcile_wallet(&store, &wallet(), t0() + Duration::hours(1))
            .await
            .unwrap();

        assert_eq!(
            outcome,
            ReconcileOutcome::SourceUnavailable {
                consecutive_failures: 1,
                paused: false
            }
        );
        assert!(store.get_ledger(&gold()).unwrap().is_active());
    }

    #[tokio::test]
    async fn reconcile_wallet__empty_onchain_set__drops_every_recorded_asset() {
        // given
        let (store, reconciler) = setup(&["a", "b"]);
        reconciler.source.push(Ok(BTreeSet::new()));

        // when
        reconciler
            .reconcile_wallet(&store, &wallet(), t0() + Duration::hours(1))
            .await
            .unwrap();

        // then
        let ledger = store.get_ledger(&gold()).unwrap();
        assert!(!ledger.is_active());
        assert_eq!(ledger.baseline(), dec!(20));
        assert_eq!(ledger.rate(), Rate::ZERO);
    }

    #[tokio::test]
    async fn reconcile_all__pages_through_every_wallet() {
        // given
        let mut config = LedgerConfig::default();
        config.jobs.page_size = 1;
        let store = CheckpointStore::new(InMemoryLedgerStorage::new(), config);
        let reconciler = OwnershipReconciler::new(ScriptedSource::default(), FlatCatalog);
        for name in ["stake1uxa", "stake1uxb"] {
            let key = LedgerKey::new(WalletAddress::parse(name).unwrap(), ResourceKind::Gold);
            store
                .apply_rate_source(&key, &recorded_source(&["x"]), t0())
                .unwrap();
            reconciler.source.push(Ok(assets(&["x"])));
        }

        // when
        let report = reconciler.reconcile_all(&store, t0()).await.unwrap();

        // then
        assert_eq!(report.visited, 2);
        assert_eq!(report.failed, 0);
        assert!(report.complete);
    }

    #[test]
    fn asset_overlaps__reports_assets_recorded_under_two_wallets() {
        // given
        let store = CheckpointStore::new(InMemoryLedgerStorage::new(), LedgerConfig::default());
        for (name, held) in [("stake1uxa", ["shared", "a"]), ("stake1uxb", ["shared", "b"])] {
            let key = LedgerKey::new(WalletAddress::parse(name).unwrap(), ResourceKind::Gold);
            store
                .apply_rate_source(&key, &recorded_source(&held), t0())
                .unwrap();
        }

        // when
        let overlaps = asset_overlaps(&store).unwrap();

        // then
        assert_eq!(overlaps.len(), 1);
        let holders = &overlaps[&AssetId::new("shared").unwrap()];
        assert_eq!(holders.len(), 2);
    }
}

use crate::{
    Result,
    app::query_api::{
        AdminQuery,
        AssetOverlap,
        BackupQuery,
        BalanceView,
        Diagnostics,
        HistoryQuery,
        LeaderboardQuery,
        LedgerChange,
        LedgerQuery,
        MutationOutcome,
        MutationQuery,
        Query,
        QueryAPI,
        Responder,
        RestoreQuery,
    },
};
use accrual_ledger::{
    RunMode,
    checkpoint::{
        CheckpointStore,
        HistoryWindow,
    },
    config::JobsConfig,
    guard::OperatorCapability,
    rate::RateSource,
    resource::LedgerKey,
    reconcile::{
        AssetCatalog,
        OwnershipReconciler,
        OwnershipSource,
        asset_overlaps,
    },
    retention::SnapshotRetention,
    storage::LedgerStorage,
};
use chrono::{
    DateTime,
    Utc,
};
use std::{
    path::Path,
    time::Duration,
};
use tokio::time::{
    Instant,
    Interval,
    MissedTickBehavior,
};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

pub mod actix_query_api;
pub mod blockfrost_source;
pub mod catalog;
pub mod query_api;


const LOG_FILE_PREFIX: &str = "ledger-service.log";

/// Install the fmt subscriber. With a log directory, output goes to a daily
/// rolling file and the returned guard must be held until exit.
pub fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let installed = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .try_init();
            warn_if_not_installed(installed);
            Some(guard)
        }
        None => {
            warn_if_not_installed(tracing_subscriber::fmt().with_env_filter(filter).try_init());
            None
        }
    }
}

fn warn_if_not_installed<E: std::fmt::Display>(installed: std::result::Result<(), E>) {
    if let Err(e) = installed {
        // whatever subscriber is already installed keeps receiving events
        tracing::warn!("tracing subscriber was not installed: {e}");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Continue,
    Exit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Job {
    Checkpoint,
    Reconciliation,
    Retention,
}

struct Schedule {
    checkpoint: Interval,
    reconciliation: Interval,
    retention: Interval,
}

impl Schedule {
    fn new(jobs: &JobsConfig) -> Self {
        Self {
            checkpoint: every(jobs.checkpoint_interval_secs),
            reconciliation: every(jobs.reconciliation_interval_secs),
            retention: every(jobs.retention_interval_secs),
        }
    }
}

// first tick one full period after startup
fn every(secs: u64) -> Interval {
    let period = Duration::from_secs(secs.max(1));
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

pub struct App<API, Source, Catalog, Storage> {
    api: API,
    store: CheckpointStore<Storage>,
    reconciler: OwnershipReconciler<Source, Catalog>,
    retention: SnapshotRetention,
    schedule: Schedule,
    /// Jobs whose last page left work behind, resumed between queries.
    unfinished: Vec<Job>,
    clock: fn() -> DateTime<Utc>,
}

impl<API, Source, Catalog, Storage> App<API, Source, Catalog, Storage>
where
    Source: OwnershipSource,
    Catalog: AssetCatalog,
    Storage: LedgerStorage,
{
    pub fn new(
        api: API,
        source: Source,
        catalog: Catalog,
        store: CheckpointStore<Storage>,
    ) -> Self {
        let retention = SnapshotRetention::new(&store.config().retention);
        let schedule = Schedule::new(&store.config().jobs);
        Self {
            api,
            store,
            reconciler: OwnershipReconciler::new(source, catalog),
            retention,
            schedule,
            unfinished: Vec::new(),
            clock: Utc::now,
        }
    }

    pub fn with_clock(mut self, clock: fn() -> DateTime<Utc>) -> Self {
        self.clock = clock;
        self
    }
}

impl<API, Source, Catalog, Storage> App<API, Source, Catalog, Storage>
where
    API: QueryAPI,
    Source: OwnershipSource,
    Catalog: AssetCatalog,
    Storage: LedgerStorage,
{
    /// Wait for the next event and handle it. Batch jobs advance one page per
    /// call so queries keep being answered while a sweep is in progress.
    pub async fn run(&mut self, interrupt: impl Future<Output = ()>) -> Result<RunState> {
        let resume = self.unfinished.first().copied();
        tokio::select! {
            _ = interrupt => {
                tracing::info!("Interrupt received, stopping ledger service");
                Ok(RunState::Exit)
            }
            query = self.api.query() => {
                self.handle_query(query?);
                Ok(RunState::Continue)
            }
            Some(job) = std::future::ready(resume), if resume.is_some() => {
                self.run_scheduled(job).await;
                Ok(RunState::Continue)
            }
            _ = self.schedule.checkpoint.tick() => {
                self.run_scheduled(Job::Checkpoint).await;
                Ok(RunState::Continue)
            }
            _ = self.schedule.reconciliation.tick() => {
                self.run_scheduled(Job::Reconciliation).await;
                Ok(RunState::Continue)
            }
            _ = self.schedule.retention.tick() => {
                self.run_scheduled(Job::Retention).await;
                Ok(RunState::Continue)
            }
        }
    }

    async fn run_scheduled(&mut self, job: Job) {
        tracing::debug!("running next page of {job:?} job");
        let complete = match self.run_job_page(job).await {
            Ok(complete) => complete,
            Err(e) => {
                tracing::error!("scheduled {job:?} job failed: {e}");
                true
            }
        };
        if complete {
            self.unfinished.retain(|pending| *pending != job);
        } else if !self.unfinished.contains(&job) {
            self.unfinished.push(job);
        }
    }

    /// Run one page of a batch job. Returns whether the job reached the end of
    /// the key space.
    pub async fn run_job_page(&self, job: Job) -> accrual_ledger::Result<bool> {
        let now = (self.clock)();
        let complete = match job {
            Job::Checkpoint => self.store.sweep_checkpoints_page(now)?.complete,
            Job::Reconciliation => {
                self.reconciler
                    .reconcile_page(&self.store, now)
                    .await?
                    .complete
            }
            // local batched deletes only
            Job::Retention => {
                self.retention
                    .run(self.store.storage(), now, RunMode::Apply)?;
                true
            }
        };
        Ok(complete)
    }

    /// Run one batch job over the whole key space. Every job is idempotent and
    /// resumes from its persisted cursor if a previous run was cut short.
    pub async fn run_job(&self, job: Job) -> accrual_ledger::Result<()> {
        let now = (self.clock)();
        match job {
            Job::Checkpoint => {
                self.store.sweep_checkpoints(now)?;
            }
            Job::Reconciliation => {
                self.reconciler.reconcile_all(&self.store, now).await?;
            }
            Job::Retention => {
                self.retention
                    .run(self.store.storage(), now, RunMode::Apply)?;
            }
        }
        Ok(())
    }

    fn handle_query(&self, query: Query) {
        let now = (self.clock)();
        match query {
            Query::Balance(LedgerQuery { key, sender }) => {
                let view = self
                    .store
                    .get_current_balance(&key, now)
                    .map(|balance| BalanceView {
                        key,
                        balance,
                        as_of: now,
                    });
                respond(sender, view);
            }
            Query::Rate(LedgerQuery { key, sender }) => {
                respond(sender, self.store.get_rate(&key, now));
            }
            Query::History(HistoryQuery { key, hours, sender }) => {
                let window = HistoryWindow::last_hours(now, hours);
                respond(sender, self.store.get_ledger_history(&key, window));
            }
            Query::Diagnostics(sender) => {
                respond(sender, self.diagnostics());
            }
            Query::Leaderboard(LeaderboardQuery {
                resource,
                limit,
                sender,
            }) => {
                respond(sender, self.store.top_earners(resource, limit, now));
            }
            Query::Mutate(MutationQuery {
                operator,
                token,
                key,
                change,
                sender,
            }) => {
                let outcome = OperatorCapability::issue(self.store.config(), &operator, &token)
                    .and_then(|_| {
                        tracing::info!("operator '{operator}' requested {change:?} on {key}");
                        self.apply_change(&key, change, now)
                    });
                respond(sender, outcome);
            }
            Query::Correct(AdminQuery {
                operator,
                token,
                mode,
                sender,
            }) => {
                let report = OperatorCapability::issue(self.store.config(), &operator, &token)
                    .and_then(|capability| {
                        tracing::info!("operator '{operator}' requested corrections ({mode:?})");
                        self.store.correct_invariants(&capability, mode, now)
                    });
                respond(sender, report);
            }
            Query::Retention(AdminQuery {
                operator,
                token,
                mode,
                sender,
            }) => {
                let report = OperatorCapability::issue(self.store.config(), &operator, &token)
                    .and_then(|_| {
                        tracing::info!("operator '{operator}' requested retention ({mode:?})");
                        self.retention.run(self.store.storage(), now, mode)
                    });
                respond(sender, report);
            }
            Query::Backup(BackupQuery {
                operator,
                token,
                sender,
            }) => {
                let backup = OperatorCapability::issue(self.store.config(), &operator, &token)
                    .and_then(|_| {
                        tracing::info!("operator '{operator}' requested a backup");
                        self.store.export_backup(now)
                    });
                respond(sender, backup);
            }
            Query::Restore(RestoreQuery {
                operator,
                token,
                mode,
                backup,
                sender,
            }) => {
                let report = OperatorCapability::issue(self.store.config(), &operator, &token)
                    .and_then(|capability| {
                        tracing::info!(
                            "operator '{operator}' requested a restore of {} ledger(s) ({mode:?})",
                            backup.ledgers.len()
                        );
                        self.store.restore_backup(&capability, &backup, mode, now)
                    });
                respond(sender, report);
            }
        }
    }

    fn apply_change(
        &self,
        key: &LedgerKey,
        change: LedgerChange,
        now: DateTime<Utc>,
    ) -> accrual_ledger::Result<MutationOutcome> {
        let store = &self.store;
        let ledger = match change {
            LedgerChange::Open => store.open_ledger(key, now)?,
            LedgerChange::Spend { amount } => store.spend(key, amount, now)?,
            LedgerChange::Credit { amount, reason } => store.credit(key, amount, &reason, now)?,
            LedgerChange::RateSource {
                assets,
                global_multiplier,
            } => {
                let mut source = RateSource::new();
                for slot in &assets {
                    source.insert(slot.asset.clone(), slot.contribution()?);
                }
                if let Some(multiplier) = global_multiplier {
                    source.set_global_multiplier(multiplier);
                }
                store.apply_rate_source(key, &source, now)?;
                store.get_ledger(key)?
            }
            LedgerChange::Multiplier { factor, expires_at } => {
                store.set_rate_multiplier(key, factor, expires_at, now)?
            }
            LedgerChange::ClearMultiplier => store.clear_rate_multiplier(key, now)?,
            LedgerChange::Suspend { suspended } => {
                store.set_suspended(key, suspended, now)?;
                store.get_ledger(key)?
            }
            LedgerChange::Slot(slot) => {
                store.slot_asset(key, &slot.asset, slot.contribution()?, now)?
            }
            LedgerChange::Unslot { asset } => store.unslot_asset(key, &asset, now)?,
            LedgerChange::Swap { removed, added } => {
                let swap =
                    store.swap_asset(key, &removed, &added.asset, added.contribution()?, now)?;
                return Ok(MutationOutcome::Swap(swap));
            }
            LedgerChange::SetLevel { asset, level } => {
                store.set_asset_level(key, &asset, level, now)?
            }
            LedgerChange::LevelUp { asset } => {
                return Ok(MutationOutcome::LevelUp(store.level_up_asset(key, &asset, now)?));
            }
        };
        Ok(MutationOutcome::Ledger(ledger))
    }

    fn diagnostics(&self) -> accrual_ledger::Result<Diagnostics> {
        let shortfalls = self.store.invariant_report()?;
        let overlaps = asset_overlaps(&self.store)?
            .into_iter()
            .map(|(asset, wallets)| AssetOverlap { asset, wallets })
            .collect();
        Ok(Diagnostics {
            shortfalls,
            overlaps,
        })
    }
}

fn respond<T>(sender: Responder<T>, result: accrual_ledger::Result<T>) {
    if sender.send(result).is_err() {
        tracing::warn!("query requester went away before the response was ready");
    }
}

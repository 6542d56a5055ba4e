use accrual_ledger::{
    checkpoint::CheckpointStore,
    config::LedgerConfig,
    storage::SledLedgerStorage,
};
use anyhow::Context;
use clap::Parser;
use ledger_service::app::{
    App,
    RunState,
    actix_query_api::ActixQueryApi,
    blockfrost_source::BlockfrostSource,
    catalog::RankedAssetCatalog,
    init_tracing,
};
use std::{
    fs,
    path::PathBuf,
};
use url::Url;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Directory holding the sled store. `~` is expanded.
    #[arg(long, default_value = "~/.accrual-ledger")]
    data_dir: String,

    /// JSON configuration file. Defaults apply to every missing field.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(short, long)]
    port: Option<u16>,

    /// Base URL of the Blockfrost-compatible chain indexer.
    #[arg(short, long)]
    indexer_url: Url,

    #[arg(long)]
    indexer_project_id: String,

    /// Policy id of the collection whose assets earn resources.
    #[arg(long)]
    policy_id: String,

    #[arg(short, long, default_value = "false")]
    tracing: bool,

    /// Write logs to a daily rolling file in this directory instead of stdout.
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

async fn handle_interupt() {
    let res = tokio::signal::ctrl_c().await;
    match res {
        Ok(_) => {
            tracing::info!("Received interrupt, exiting");
        }
        Err(_) => {
            tracing::warn!("Received interrupt error, exiting anyway");
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _log_guard = if args.tracing {
        init_tracing(args.log_dir.as_deref())
    } else {
        None
    };

    let config = match &args.config {
        Some(path) => LedgerConfig::load(path)?,
        None => LedgerConfig::default(),
    };
    if config.operator_token_sha256.is_none() {
        tracing::warn!("No operator token configured; ledger writes and admin operations are disabled");
    }

    let data_dir = PathBuf::from(shellexpand::tilde(&args.data_dir).into_owned());
    fs::create_dir_all(&data_dir)
        .with_context(|| format!("create data directory {}", data_dir.display()))?;
    let storage_path = data_dir.join("ledger");
    tracing::info!("Using sled storage directory: {}", storage_path.display());
    let storage = SledLedgerStorage::open(&storage_path)?;
    let store = CheckpointStore::new(storage, config);

    let source =
        BlockfrostSource::new(&args.indexer_url, &args.indexer_project_id, &args.policy_id)?;
    let catalog = RankedAssetCatalog::new(&args.policy_id);
    let api = ActixQueryApi::new(args.port).await?;
    let mut app = App::new(api, source, catalog, store);

    tracing::info!("Starting ledger service");
    loop {
        let interrupt = handle_interupt();
        match app.run(interrupt).await? {
            RunState::Continue => continue,
            RunState::Exit => {
                tracing::info!("Exiting ledger service");
                return Ok(());
            }
        }
    }
}

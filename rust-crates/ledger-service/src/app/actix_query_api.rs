use crate::{
    Result,
    app::query_api::{
        AdminQuery,
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
        RestoreQuery,
    },
};
use accrual_ledger::{
    LedgerError,
    RunMode,
    backup::{
        LedgerBackup,
        RestoreReport,
    },
    checkpoint::RateView,
    guard::CorrectionReport,
    leaderboard::LeaderboardEntry,
    ledger::AuditRecord,
    resource::{
        LedgerKey,
        ResourceKind,
        WalletAddress,
    },
    retention::RetentionReport,
};
use actix_web::{
    App,
    HttpServer,
    dev::ServerHandle,
    error::{
        ErrorBadRequest,
        ErrorConflict,
        ErrorInternalServerError,
        ErrorNotFound,
        ErrorUnauthorized,
    },
    web,
};
use anyhow::{
    Context,
    anyhow,
};
use serde::{
    Deserialize,
    Serialize,
};
use std::{
    net::TcpListener,
    thread::JoinHandle,
};
use tokio::sync::{
    mpsc,
    oneshot,
};

const DEFAULT_HISTORY_HOURS: u32 = 24;
const DEFAULT_LEADERBOARD_LIMIT: usize = 10;
const MAX_LEADERBOARD_LIMIT: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct HistoryParams {
    hours: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct AdminRequest {
    #[serde(default = "default_operator")]
    operator: String,
    operator_token: String,
    #[serde(default = "default_dry_run")]
    dry_run: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct LeaderboardParams {
    limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct OperatorRequest {
    #[serde(default = "default_operator")]
    operator: String,
    operator_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct MutationRequest {
    #[serde(default = "default_operator")]
    operator: String,
    operator_token: String,
    #[serde(flatten)]
    change: LedgerChange,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct RestoreRequest {
    #[serde(default = "default_operator")]
    operator: String,
    operator_token: String,
    #[serde(default = "default_dry_run")]
    dry_run: bool,
    backup: LedgerBackup,
}

fn default_operator() -> String {
    "operator".to_string()
}

fn default_dry_run() -> bool {
    true
}

pub struct ActixQueryApi {
    receiver: mpsc::Receiver<Query>,
    base_url: String,
    server_handle: ServerHandle,
    server_thread: Option<JoinHandle<()>>,
}

impl ActixQueryApi {
    pub async fn new(port: Option<u16>) -> Result<Self> {
        let (sender, receiver) = mpsc::channel(16);

        let listener = TcpListener::bind(("127.0.0.1", port.unwrap_or(0)))
            .context("failed to bind HTTP listener for ledger API")?;
        let address = listener
            .local_addr()
            .context("failed to read listener address")?;
        let base_url = format!("http://{}", address);

        tracing::info!("ledger API listening on {}", base_url);

        let server = HttpServer::new(move || {
            App::new()
                .app_data(web::Data::new(sender.clone()))
                .route(
                    "/ledger/{wallet}/{resource}/balance",
                    web::get().to(handle_balance),
                )
                .route(
                    "/ledger/{wallet}/{resource}/rate",
                    web::get().to(handle_rate),
                )
                .route(
                    "/ledger/{wallet}/{resource}/history",
                    web::get().to(handle_history),
                )
                .route(
                    "/ledger/{wallet}/{resource}",
                    web::post().to(handle_mutation),
                )
                .route("/leaderboard/{resource}", web::get().to(handle_leaderboard))
                .route("/admin/diagnostics", web::get().to(handle_diagnostics))
                .route("/admin/corrections", web::post().to(handle_corrections))
                .route("/admin/retention", web::post().to(handle_retention))
                .route("/admin/backup", web::post().to(handle_backup))
                .route("/admin/restore", web::post().to(handle_restore))
        })
        .listen(listener)
        .context("failed to start Actix server")?
        .run();

        let server_handle = server.handle();
        let server_thread = std::thread::spawn(move || {
            let sys = actix_web::rt::System::new();
            let _ = sys.block_on(server);
        });

        Ok(Self {
            receiver,
            base_url,
            server_handle,
            server_thread: Some(server_thread),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

impl QueryAPI for ActixQueryApi {
    async fn query(&mut self) -> Result<Query> {
        self.receiver
            .recv()
            .await
            .ok_or_else(|| anyhow!("query server closed"))
    }
}

impl Drop for ActixQueryApi {
    fn drop(&mut self) {
        let _ = self.server_handle.stop(true);
        if let Some(thread) = self.server_thread.take() {
            let _ = thread.join();
        }
    }
}

fn ledger_error(error: LedgerError) -> actix_web::Error {
    match error {
        LedgerError::LedgerNotFound { .. } => ErrorNotFound(error.to_string()),
        LedgerError::Unauthorized { .. } => ErrorUnauthorized(error.to_string()),
        LedgerError::InvalidWallet { .. }
        | LedgerError::UnknownResource(_)
        | LedgerError::InvalidAsset(_)
        | LedgerError::InvalidAmount { .. }
        | LedgerError::Overflow { .. }
        | LedgerError::InvalidMultiplier { .. }
        | LedgerError::InvalidLevel { .. }
        | LedgerError::LevelNotConfigured { .. }
        | LedgerError::AssetNotInSource { .. }
        | LedgerError::AssetAlreadyInSource { .. } => ErrorBadRequest(error.to_string()),
        LedgerError::ConcurrencyConflict { .. }
        | LedgerError::InsufficientBalance { .. }
        | LedgerError::LedgerDegraded { .. }
        | LedgerError::StaleLevel { .. } => ErrorConflict(error.to_string()),
        other => {
            tracing::error!("ledger query failed: {other}");
            ErrorInternalServerError("ledger query failed")
        }
    }
}

fn ledger_key(path: &(String, String)) -> actix_web::Result<LedgerKey> {
    let (wallet, resource) = path;
    let wallet = WalletAddress::parse(wallet).map_err(ledger_error)?;
    let resource = resource.parse::<ResourceKind>().map_err(ledger_error)?;
    Ok(LedgerKey::new(wallet, resource))
}

async fn forward<T>(
    sender: &web::Data<mpsc::Sender<Query>>,
    query: Query,
    response: oneshot::Receiver<accrual_ledger::Result<T>>,
) -> actix_web::Result<T> {
    sender
        .get_ref()
        .send(query)
        .await
        .map_err(|_| ErrorInternalServerError("unable to forward ledger query"))?;
    response
        .await
        .map_err(|_| ErrorInternalServerError("ledger query responder dropped"))?
        .map_err(ledger_error)
}

async fn handle_balance(
    sender: web::Data<mpsc::Sender<Query>>,
    path: web::Path<(String, String)>,
) -> actix_web::Result<web::Json<BalanceView>> {
    let key = ledger_key(&path)?;
    tracing::debug!("received balance request for {key}");
    let (response_sender, response_receiver) = oneshot::channel();
    let query = Query::Balance(LedgerQuery {
        key,
        sender: response_sender,
    });
    forward(&sender, query, response_receiver).await.map(web::Json)
}

async fn handle_rate(
    sender: web::Data<mpsc::Sender<Query>>,
    path: web::Path<(String, String)>,
) -> actix_web::Result<web::Json<RateView>> {
    let key = ledger_key(&path)?;
    tracing::debug!("received rate request for {key}");
    let (response_sender, response_receiver) = oneshot::channel();
    let query = Query::Rate(LedgerQuery {
        key,
        sender: response_sender,
    });
    forward(&sender, query, response_receiver).await.map(web::Json)
}

async fn handle_history(
    sender: web::Data<mpsc::Sender<Query>>,
    path: web::Path<(String, String)>,
    params: web::Query<HistoryParams>,
) -> actix_web::Result<web::Json<Vec<AuditRecord>>> {
    let key = ledger_key(&path)?;
    let hours = params.hours.unwrap_or(DEFAULT_HISTORY_HOURS);
    tracing::debug!("received history request for {key} over {hours}h");
    let (response_sender, response_receiver) = oneshot::channel();
    let query = Query::History(HistoryQuery {
        key,
        hours,
        sender: response_sender,
    });
    forward(&sender, query, response_receiver).await.map(web::Json)
}

async fn handle_mutation(
    sender: web::Data<mpsc::Sender<Query>>,
    path: web::Path<(String, String)>,
    body: web::Json<MutationRequest>,
) -> actix_web::Result<web::Json<MutationOutcome>> {
    let key = ledger_key(&path)?;
    let MutationRequest {
        operator,
        operator_token,
        change,
    } = body.into_inner();
    tracing::debug!("received {change:?} for {key} from '{operator}'");
    let (response_sender, response_receiver) = oneshot::channel();
    let query = Query::Mutate(MutationQuery {
        operator,
        token: operator_token,
        key,
        change,
        sender: response_sender,
    });
    forward(&sender, query, response_receiver).await.map(web::Json)
}

async fn handle_leaderboard(
    sender: web::Data<mpsc::Sender<Query>>,
    path: web::Path<String>,
    params: web::Query<LeaderboardParams>,
) -> actix_web::Result<web::Json<Vec<LeaderboardEntry>>> {
    let resource = path.parse::<ResourceKind>().map_err(ledger_error)?;
    let limit = params
        .limit
        .unwrap_or(DEFAULT_LEADERBOARD_LIMIT)
        .min(MAX_LEADERBOARD_LIMIT);
    tracing::debug!("received leaderboard request for {resource} (top {limit})");
    let (response_sender, response_receiver) = oneshot::channel();
    let query = Query::Leaderboard(LeaderboardQuery {
        resource,
        limit,
        sender: response_sender,
    });
    forward(&sender, query, response_receiver).await.map(web::Json)
}

async fn handle_diagnostics(
    sender: web::Data<mpsc::Sender<Query>>,
) -> actix_web::Result<web::Json<Diagnostics>> {
    tracing::info!("received diagnostics request");
    let (response_sender, response_receiver) = oneshot::channel();
    forward(&sender, Query::Diagnostics(response_sender), response_receiver)
        .await
        .map(web::Json)
}

async fn handle_corrections(
    sender: web::Data<mpsc::Sender<Query>>,
    body: web::Json<AdminRequest>,
) -> actix_web::Result<web::Json<CorrectionReport>> {
    let AdminRequest {
        operator,
        operator_token,
        dry_run,
    } = body.into_inner();
    tracing::info!("received correction request from '{operator}' (dry run: {dry_run})");
    let (response_sender, response_receiver) = oneshot::channel();
    let query = Query::Correct(AdminQuery {
        operator,
        token: operator_token,
        mode: RunMode::from_dry_run(dry_run),
        sender: response_sender,
    });
    forward(&sender, query, response_receiver).await.map(web::Json)
}

async fn handle_retention(
    sender: web::Data<mpsc::Sender<Query>>,
    body: web::Json<AdminRequest>,
) -> actix_web::Result<web::Json<RetentionReport>> {
    let AdminRequest {
        operator,
        operator_token,
        dry_run,
    } = body.into_inner();
    tracing::info!("received retention request from '{operator}' (dry run: {dry_run})");
    let (response_sender, response_receiver) = oneshot::channel();
    let query = Query::Retention(AdminQuery {
        operator,
        token: operator_token,
        mode: RunMode::from_dry_run(dry_run),
        sender: response_sender,
    });
    forward(&sender, query, response_receiver).await.map(web::Json)
}

async fn handle_backup(
    sender: web::Data<mpsc::Sender<Query>>,
    body: web::Json<OperatorRequest>,
) -> actix_web::Result<web::Json<LedgerBackup>> {
    let OperatorRequest {
        operator,
        operator_token,
    } = body.into_inner();
    tracing::info!("received backup request from '{operator}'");
    let (response_sender, response_receiver) = oneshot::channel();
    let query = Query::Backup(BackupQuery {
        operator,
        token: operator_token,
        sender: response_sender,
    });
    forward(&sender, query, response_receiver).await.map(web::Json)
}

async fn handle_restore(
    sender: web::Data<mpsc::Sender<Query>>,
    body: web::Json<RestoreRequest>,
) -> actix_web::Result<web::Json<RestoreReport>> {
    let RestoreRequest {
        operator,
        operator_token,
        dry_run,
        backup,
    } = body.into_inner();
    tracing::info!(
        "received restore request from '{operator}' for {} ledger(s) (dry run: {dry_run})",
        backup.ledgers.len()
    );
    let (response_sender, response_receiver) = oneshot::channel();
    let query = Query::Restore(RestoreQuery {
        operator,
        token: operator_token,
        mode: RunMode::from_dry_run(dry_run),
        backup,
        sender: response_sender,
    });
    forward(&sender, query, response_receiver).await.map(web::Json)
}

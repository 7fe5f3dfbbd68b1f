use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use directory_api::{DirectoryApi, ErrorCode, QueryRequest, QueryResponse, API_CONTRACT_VERSION};
use serde::Serialize;
use tracing::Instrument;
use tracing_subscriber::EnvFilter;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const CORRELATION_HEADER: &str = "x-correlation-id";
const DEFAULT_LOG_FILTER: &str =
    "directory_service=info,directory_api=info,directory_core=info,directory_store_sqlite=info";

#[derive(Debug, Clone)]
struct ServiceState {
    api: DirectoryApi,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    schema_version: Option<i64>,
}

#[derive(Debug, Parser)]
#[command(name = "directory-service")]
#[command(about = "Local HTTP query endpoint for the record directory")]
struct Args {
    #[arg(long, default_value = "./directory.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    /// JSON array of records loaded before the listener starts.
    #[arg(long)]
    seed: Option<PathBuf>,
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/query", post(query))
        .with_state(state)
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_target(true).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let api = DirectoryApi::new(args.db.clone());

    if let Some(seed_path) = &args.seed {
        let seeds = directory_store_sqlite::read_seed_file(seed_path)?;
        let ids = api.seed(&seeds)?;
        tracing::info!(records = ids.len(), seed = %seed_path.display(), "seeded directory");
    }

    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(
        bind = %listener.local_addr()?,
        db = %args.db.display(),
        "directory service listening"
    );
    axum::serve(listener, app(ServiceState { api })).await?;
    Ok(())
}

async fn health(State(state): State<ServiceState>) -> Json<ServiceEnvelope<HealthResponse>> {
    let api = state.api.clone();
    let schema_version = match tokio::task::spawn_blocking(move || api.schema_status()).await {
        Ok(Ok(status)) => Some(status.current_version),
        Ok(Err(err)) => {
            tracing::warn!(error = %err, "schema status unavailable");
            None
        }
        Err(err) => {
            tracing::error!(error = %err, "health worker failed");
            None
        }
    };
    Json(envelope(HealthResponse { status: "ok", schema_version }))
}

async fn query(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Json(request): Json<QueryRequest>,
) -> Json<QueryResponse> {
    let correlation_id = headers
        .get(CORRELATION_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("-")
        .to_string();
    let span = tracing::info_span!("query", correlation_id = %correlation_id);

    async move {
        let api = state.api.clone();
        let response = match tokio::task::spawn_blocking(move || api.execute(&request)).await {
            Ok(response) => response,
            Err(err) => {
                tracing::error!(error = %err, "query worker failed");
                QueryResponse::failure(ErrorCode::Internal, "query worker failed")
            }
        };
        tracing::info!(errors = response.errors.len(), "query handled");
        Json(response)
    }
    .instrument(span)
    .await
}

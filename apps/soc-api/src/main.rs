#![forbid(unsafe_code)]

//! **soc-api** – HTTP service for the SOC Copilot ingestion and triage
//! pipeline.
//!
//! Wires together the pipeline stage crates behind an axum router: a batch
//! ingest endpoint backed by `soc-aggregator`, and a family of read-only
//! query/analyst endpoints backed by `soc-query`. All state lives in
//! SQLite via `soc-store`.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequest, Path, Query, Request, State};
use axum::http::{HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use clap::Parser;
use serde::{Deserialize, Serialize};
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use soc_config::Config;
use soc_store::Store;
use soc_types::{ApproveRequest, IngestRequest};

//─────────────────────────────
//  CLI structure
//─────────────────────────────

#[derive(Parser)]
#[command(name = "soc-api")]
#[command(about = "SOC Copilot ingestion and triage HTTP service")]
#[command(version)]
struct Cli {
    /// HTTP listen port.
    #[arg(long, env = "PORT", default_value = "8080")]
    port: u16,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

//─────────────────────────────
//  Service state
//─────────────────────────────

#[derive(Clone)]
struct AppState {
    store: Arc<Store>,
    config: Arc<Config>,
}

//─────────────────────────────
//  Main application
//─────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    info!("starting soc-api v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env();
    let store = Store::open(&config.database_url)
        .await
        .with_context(|| format!("failed to open database at {}", config.database_url))?;

    let state = AppState {
        store: Arc::new(store),
        config: Arc::new(config),
    };

    let app = create_app(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], cli.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to port {}", cli.port))?;

    info!("listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("soc-api stopped");
    Ok(())
}

fn create_app(state: AppState) -> Router {
    let cors = build_cors_layer(&state.config.cors_allow_origins);

    Router::new()
        .route("/health", get(health))
        .route("/ingest/logs", post(ingest_logs))
        .route("/incidents", get(list_incidents))
        .route("/incidents/:id", get(incident_detail))
        .route("/incidents/:id/evidence", get(incident_evidence))
        .route("/evidence/incident/:id", get(incident_evidence))
        .route("/incidents/by-event/:event_id", get(by_event))
        .route("/incidents/by-cluster/:cluster_key", get(by_cluster))
        .route("/incidents/:id/suggest_actions", post(suggest_actions))
        .route("/incidents/:id/approve_action", post(approve_action))
        .route("/events/recent", get(recent_events))
        .route("/evidence/:event_id", get(event_evidence))
        .route("/events/:id/evidence", get(event_evidence))
        .route("/metrics", get(metrics))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
}

fn build_cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods([Method::GET, Method::POST]);

    if origins.is_empty() {
        return layer.allow_origin(AllowOrigin::list(Vec::<HeaderValue>::new()));
    }
    if origins.iter().any(|o| o == "*") {
        return layer.allow_origin(tower_http::cors::Any);
    }

    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();
    layer.allow_origin(AllowOrigin::list(parsed))
}

//─────────────────────────────
//  Error handling
//─────────────────────────────

#[derive(Debug, Serialize)]
struct ErrorBody {
    detail: String,
}

enum AppError {
    Validation(String),
    NotFound(String),
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, detail) = match self {
            AppError::Validation(detail) => (StatusCode::UNPROCESSABLE_ENTITY, detail),
            AppError::NotFound(detail) => (StatusCode::NOT_FOUND, detail),
            AppError::Internal(detail) => (StatusCode::INTERNAL_SERVER_ERROR, detail),
        };
        (status, Json(ErrorBody { detail })).into_response()
    }
}

impl From<soc_query::QueryError> for AppError {
    fn from(e: soc_query::QueryError) -> Self {
        match e {
            soc_query::QueryError::NotFound(detail) => AppError::NotFound(detail),
            soc_query::QueryError::Store(e) => {
                error!(error = %e, "storage error");
                AppError::Internal(e.to_string())
            }
        }
    }
}

impl From<soc_store::StoreError> for AppError {
    fn from(e: soc_store::StoreError) -> Self {
        error!(error = %e, "storage error");
        AppError::Internal(e.to_string())
    }
}

/// A `Json<T>` extractor that maps body-validation failures to 422 with a
/// `{detail: string}` body instead of axum's default 400 (§7).
struct ValidatedJson<T>(T);

#[axum::async_trait]
impl<S, T> FromRequest<S> for ValidatedJson<T>
where
    T: serde::de::DeserializeOwned,
    S: Send + Sync,
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(ValidatedJson(value)),
            Err(rejection) => Err(AppError::Validation(rejection.body_text())),
        }
    }
}

//─────────────────────────────
//  Handlers
//─────────────────────────────

#[derive(Debug, Serialize)]
struct HealthResponse {
    ok: bool,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { ok: true })
}

async fn ingest_logs(
    State(state): State<AppState>,
    ValidatedJson(req): ValidatedJson<IngestRequest>,
) -> Result<Json<soc_aggregator::IngestResponse>, AppError> {
    let resp = soc_aggregator::ingest_batch(&state.store, &state.config, &req.events).await?;
    Ok(Json(resp))
}

async fn list_incidents(
    State(state): State<AppState>,
) -> Result<Json<Vec<soc_query::IncidentSummary>>, AppError> {
    let incidents = soc_query::list_incidents(&state.store).await?;
    Ok(Json(incidents))
}

async fn incident_detail(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<soc_query::IncidentDetail>, AppError> {
    let detail = soc_query::incident_detail(&state.store, id).await?;
    Ok(Json(detail))
}

async fn incident_evidence(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<soc_query::EvidenceResponse>, AppError> {
    let evidence =
        soc_query::incident_evidence(&state.store, id, state.config.cluster_bucket_seconds).await?;
    Ok(Json(evidence))
}

async fn by_event(
    State(state): State<AppState>,
    Path(event_id): Path<i64>,
) -> Result<Json<soc_query::ByEventResponse>, AppError> {
    let resp = soc_query::by_event(&state.store, event_id).await?;
    Ok(Json(resp))
}

async fn by_cluster(
    State(state): State<AppState>,
    Path(cluster_key): Path<String>,
) -> Result<Json<soc_query::ByClusterResponse>, AppError> {
    let resp = soc_query::by_cluster(&state.store, &cluster_key).await?;
    Ok(Json(resp))
}

async fn suggest_actions(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<soc_query::SuggestResponse>, AppError> {
    let resp = soc_query::suggest_actions(&state.store, id).await?;
    Ok(Json(resp))
}

async fn approve_action(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    ValidatedJson(req): ValidatedJson<ApproveRequest>,
) -> Result<Json<soc_query::ApproveResponse>, AppError> {
    let resp = soc_query::record_approval(&state.store, id, &req.action_name, &req.notes).await?;
    Ok(Json(resp))
}

#[derive(Debug, Deserialize)]
struct RecentEventsParams {
    limit: Option<i64>,
}

async fn recent_events(
    State(state): State<AppState>,
    Query(params): Query<RecentEventsParams>,
) -> Result<Json<Vec<soc_query::RecentEventSummary>>, AppError> {
    let events = soc_query::recent_events(&state.store, params.limit).await?;
    Ok(Json(events))
}

async fn event_evidence(
    State(state): State<AppState>,
    Path(event_id): Path<i64>,
) -> Result<Json<soc_query::EventEvidenceResponse>, AppError> {
    let resp = soc_query::event_evidence(&state.store, event_id).await?;
    Ok(Json(resp))
}

async fn metrics(State(state): State<AppState>) -> Result<Json<soc_query::MetricsResponse>, AppError> {
    let resp = soc_query::metrics(&state.store).await?;
    Ok(Json(resp))
}

//─────────────────────────────
//  Utility functions
//─────────────────────────────

fn init_logging(log_level: &str) -> Result<()> {
    let filter = format!(
        "soc_api={log_level},soc_aggregator={log_level},soc_query={log_level},soc_store={log_level}"
    );
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(filter))
        .with(tracing_subscriber::fmt::layer())
        .init();
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

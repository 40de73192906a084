//! Axum admin endpoints for triggering cleanup runs and reading their reports.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use sqlx::PgPool;
use tidy_core::Operation;
use tidy_engine::{run_exclusive, AssumeYes, CancelFlag, CleanupConfig, RunOptions, SchemaCatalog};
use tidy_storage::{PgMetadataStore, ReportSink, StoredReport};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "tidy-web";

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub catalog: Arc<SchemaCatalog>,
    pub sink: Arc<dyn ReportSink>,
    /// Held for the duration of a run started by this process.
    pub running: Arc<Mutex<()>>,
    pub cancel: CancelFlag,
    pub lock_key: i64,
}

impl AppState {
    pub fn new(
        pool: PgPool,
        catalog: SchemaCatalog,
        sink: Arc<dyn ReportSink>,
        lock_key: i64,
    ) -> Self {
        Self {
            pool,
            catalog: Arc::new(catalog),
            sink,
            running: Arc::new(Mutex::new(())),
            cancel: CancelFlag::new(),
            lock_key,
        }
    }
}

#[derive(Debug, Serialize)]
struct StatusBody {
    running: bool,
    cleanup: Option<StoredReport>,
    dry_run: Option<StoredReport>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/cleanup", post(cleanup_handler))
        .route("/cleanup/dry-run", get(dry_run_handler))
        .route("/cleanup/status", get(status_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(config: &CleanupConfig) -> anyhow::Result<()> {
    let pool = config.connect().await?;
    let catalog = config
        .load_catalog()
        .context("loading schema catalog")?;
    let sink = PgMetadataStore::new(pool.clone());
    sink.ensure_table().await?;

    let state = AppState::new(pool, catalog, Arc::new(sink), config.advisory_lock_key);
    let cancel = state.cancel.clone();
    let listener = TcpListener::bind(("0.0.0.0", config.web_port))
        .await
        .with_context(|| format!("binding admin port {}", config.web_port))?;
    info!(port = config.web_port, "cleanup admin api listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown requested; cancelling in-flight runs");
                cancel.cancel();
            }
        })
        .await
        .context("serving admin api")?;
    Ok(())
}

async fn cleanup_handler(State(state): State<Arc<AppState>>) -> Response {
    run_and_record(&state, false).await
}

async fn dry_run_handler(State(state): State<Arc<AppState>>) -> Response {
    run_and_record(&state, true).await
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Response {
    let latest = async {
        let cleanup = state.sink.latest(Operation::Cleanup).await?;
        let dry_run = state.sink.latest(Operation::DryRun).await?;
        anyhow::Ok((cleanup, dry_run))
    };
    match latest.await {
        Ok((cleanup, dry_run)) => Json(StatusBody {
            running: state.running.try_lock().is_err(),
            cleanup,
            dry_run,
        })
        .into_response(),
        Err(err) => server_error(err),
    }
}

async fn run_and_record(state: &AppState, dry_run: bool) -> Response {
    let Ok(_guard) = state.running.try_lock() else {
        return conflict();
    };
    let options = RunOptions {
        dry_run,
        interactive: false,
    };
    let result = run_exclusive(
        &state.pool,
        &state.catalog,
        options,
        &AssumeYes,
        &state.cancel,
        state.lock_key,
    )
    .await;

    match result {
        Ok(Some(report)) => {
            if let Err(err) = state
                .sink
                .persist(Operation::for_dry_run(dry_run), &report)
                .await
            {
                warn!(run_id = %report.run_id, error = ?err, "report not persisted");
            }
            (StatusCode::OK, Json(report)).into_response()
        }
        Ok(None) => conflict(),
        Err(err) => {
            error!(error = %err, dry_run, "cleanup run failed");
            server_error(err.into())
        }
    }
}

fn conflict() -> Response {
    (
        StatusCode::CONFLICT,
        Json(serde_json::json!({ "error": "a cleanup run is already in progress" })),
    )
        .into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": format!("{err:#}") })),
    )
        .into_response()
}

//! JSON API over the sync engine: progress polling and on-demand triggers.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use recon_storage::Store;
use recon_sync::{Engine, MergeResolver, SyncError, SyncRunner};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "recon-web";

const DEFAULT_IMPORT_LIMIT: usize = 20;
const MAX_IMPORT_LIMIT: usize = 500;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub runner: SyncRunner,
    pub resolver: Arc<MergeResolver>,
}

impl AppState {
    pub fn new(store: Arc<dyn Store>, runner: SyncRunner, resolver: Arc<MergeResolver>) -> Self {
        Self { store, runner, resolver }
    }

    pub fn from_engine(engine: &Engine) -> Self {
        Self::new(
            Arc::clone(&engine.store),
            engine.runner.clone(),
            Arc::clone(&engine.resolver),
        )
    }
}

#[derive(Debug, Deserialize)]
struct ImportsQuery {
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct MergeQuery {
    #[serde(default)]
    dry_run: bool,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/adapters", get(adapters_handler))
        .route("/imports", get(imports_handler))
        .route("/imports/{id}", get(import_detail_handler))
        .route("/sync/{adapter}", post(sync_handler))
        .route("/merge", post(merge_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "recon api listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health_handler() -> Response {
    Json(json!({ "status": "ok" })).into_response()
}

async fn adapters_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(json!({ "adapters": state.runner.registry().names() })).into_response()
}

async fn imports_handler(State(state): State<Arc<AppState>>, Query(query): Query<ImportsQuery>) -> Response {
    let limit = query.limit.unwrap_or(DEFAULT_IMPORT_LIMIT).clamp(1, MAX_IMPORT_LIMIT);
    match state.store.list_imports(limit).await {
        Ok(imports) => Json(imports).into_response(),
        Err(err) => server_error(err),
    }
}

async fn import_detail_handler(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Response {
    match state.store.get_import(id).await {
        Ok(Some(import)) => Json(import).into_response(),
        Ok(None) => error_json(StatusCode::NOT_FOUND, format!("import {id} not found")),
        Err(err) => server_error(err),
    }
}

async fn sync_handler(State(state): State<Arc<AppState>>, Path(adapter): Path<String>) -> Response {
    match state.runner.spawn(&adapter).await {
        Ok(import_id) => (StatusCode::ACCEPTED, Json(json!({ "importId": import_id }))).into_response(),
        Err(err) => sync_error(err),
    }
}

async fn merge_handler(State(state): State<Arc<AppState>>, Query(query): Query<MergeQuery>) -> Response {
    match state.resolver.run(query.dry_run).await {
        Ok(report) => Json(report).into_response(),
        Err(err) => sync_error(err),
    }
}

fn sync_error(err: SyncError) -> Response {
    match err {
        SyncError::UnknownAdapter(_) => error_json(StatusCode::NOT_FOUND, err.to_string()),
        SyncError::AlreadyRunning { import_id, .. } => (
            StatusCode::CONFLICT,
            Json(json!({ "error": err.to_string(), "importId": import_id })),
        )
            .into_response(),
        SyncError::Store(err) => server_error(err),
    }
}

fn server_error(err: impl std::fmt::Display) -> Response {
    error!(error = %err, "request failed");
    error_json(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
}

fn error_json(status: StatusCode, message: String) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

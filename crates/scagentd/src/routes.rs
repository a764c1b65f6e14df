//! Admin API routes.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use sc_shared::problem::Problem;
use sc_shared::status::{
    IssueRequest, IssueResponse, ItemListResponse, ItemStatus, RebootManagerStatus,
};
use sc_shared::{ScError, VERSION};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

use crate::materialize::{CycleOutcome, EngineHandle};
use crate::server::AppState;

type AppStateArc = Arc<AppState>;
type Reply<T> = Result<Json<T>, (StatusCode, Json<Problem>)>;

fn problem(p: Problem) -> (StatusCode, Json<Problem>) {
    let status = StatusCode::from_u16(p.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(p))
}

fn from_error(e: ScError) -> (StatusCode, Json<Problem>) {
    match e {
        ScError::NotFound(what) => problem(Problem::not_found(what)),
        ScError::Disabled(component) => problem(Problem::not_implemented(&component)),
        other => problem(Problem::internal(other.to_string())),
    }
}

// ============================================================================
// Replication routes
// ============================================================================

pub fn replication_routes() -> Router<AppStateArc> {
    Router::new()
        .route("/v1/replication/:class/items", get(list_items))
        .route("/v1/replication/:class/items/:id", get(get_item))
}

/// Known-but-unconfigured classes surface as `Disabled` (501); names
/// outside the known set are plain 404s.
fn engine<'a>(state: &'a AppState, class: &str) -> Result<&'a EngineHandle, ScError> {
    match state.engines.iter().find(|e| e.class() == class) {
        Some(engine) => Ok(engine),
        None if AppState::KNOWN_CLASSES.contains(&class) => {
            Err(ScError::Disabled(class.to_string()))
        }
        None => Err(ScError::NotFound(format!(
            "unknown replication class '{class}'"
        ))),
    }
}

async fn list_items(
    State(state): State<AppStateArc>,
    Path(class): Path<String>,
) -> Reply<ItemListResponse> {
    let engine = engine(&state, &class).map_err(from_error)?;
    Ok(Json(ItemListResponse {
        items: engine.list().await,
    }))
}

async fn get_item(
    State(state): State<AppStateArc>,
    Path((class, id)): Path<(String, String)>,
) -> Reply<ItemStatus> {
    let engine = engine(&state, &class).map_err(from_error)?;
    match engine.get(&id).await {
        Some(item) => Ok(Json(item)),
        None => Err(problem(Problem::not_found(format!(
            "no item '{id}' in class '{class}'"
        )))),
    }
}

// ============================================================================
// PKI routes
// ============================================================================

pub fn pki_routes() -> Router<AppStateArc> {
    Router::new().route("/v1/pki/x509/:id/issue", post(issue_cert))
}

async fn issue_cert(
    State(state): State<AppStateArc>,
    Path(id): Path<String>,
    body: Option<Json<IssueRequest>>,
) -> Reply<IssueResponse> {
    let engine = engine(&state, "x509").map_err(from_error)?;
    let force = body.map(|Json(req)| req.force).unwrap_or(false);
    info!(item = %id, force, "issuance requested via API");
    let (outcome, digest) = engine.materialize(&id, force).await.map_err(from_error)?;
    Ok(Json(IssueResponse {
        id,
        written: outcome == CycleOutcome::Written,
        digest,
    }))
}

// ============================================================================
// Reboot manager routes
// ============================================================================

pub fn reboot_routes() -> Router<AppStateArc> {
    Router::new()
        .route("/v1/reboot/status", get(reboot_status))
        .route("/v1/reboot/pause", post(reboot_pause))
        .route("/v1/reboot/unpause", post(reboot_unpause))
}

#[derive(Debug, Serialize)]
struct PauseResponse {
    paused: bool,
}

fn manager(state: &AppState) -> Result<&crate::reboot::manager::ManagerHandle, ScError> {
    state
        .reboot
        .as_ref()
        .ok_or_else(|| ScError::Disabled("reboot_manager".into()))
}

async fn reboot_status(State(state): State<AppStateArc>) -> Reply<RebootManagerStatus> {
    Ok(Json(manager(&state).map_err(from_error)?.status().await))
}

async fn reboot_pause(State(state): State<AppStateArc>) -> Reply<PauseResponse> {
    let manager = manager(&state).map_err(from_error)?;
    manager.pause();
    Ok(Json(PauseResponse { paused: true }))
}

async fn reboot_unpause(State(state): State<AppStateArc>) -> Reply<PauseResponse> {
    let manager = manager(&state).map_err(from_error)?;
    manager.unpause();
    Ok(Json(PauseResponse { paused: false }))
}

// ============================================================================
// Health route
// ============================================================================

pub fn health_routes() -> Router<AppStateArc> {
    Router::new().route("/v1/health", get(health_check))
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    uptime_secs: u64,
}

async fn health_check(State(state): State<AppStateArc>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: VERSION,
        uptime_secs: state.start_time.elapsed().as_secs(),
    })
}

//! Admin API and metrics HTTP servers.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use axum::{http::StatusCode, routing::get, Router};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::materialize::EngineHandle;
use crate::metrics::Metrics;
use crate::reboot::manager::ManagerHandle;
use crate::routes;

/// Application state shared across handlers.
pub struct AppState {
    /// One handle per enabled materialization engine.
    pub engines: Vec<EngineHandle>,
    /// Present iff the reboot manager is configured.
    pub reboot: Option<ManagerHandle>,
    pub metrics: Arc<Metrics>,
    pub start_time: Instant,
}

impl AppState {
    /// Replication classes the API can address. Configured ones get an
    /// engine handle; the rest answer 501.
    pub const KNOWN_CLASSES: [&'static str; 5] = ["http", "secrets", "x509", "ssh", "acme"];

    pub fn new(
        engines: Vec<EngineHandle>,
        reboot: Option<ManagerHandle>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            engines,
            reboot,
            metrics,
            start_time: Instant::now(),
        }
    }
}

pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(routes::replication_routes())
        .merge(routes::pki_routes())
        .merge(routes::reboot_routes())
        .merge(routes::health_routes())
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Serve the admin API until the token cancels.
pub async fn run(state: Arc<AppState>, addr: SocketAddr, cancel: CancellationToken) -> Result<()> {
    let app = app(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("admin API listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await?;
    Ok(())
}

/// Serve the metrics exposition endpoint until the token cancels.
pub async fn run_metrics(
    metrics: Arc<Metrics>,
    addr: SocketAddr,
    cancel: CancellationToken,
) -> Result<()> {
    let app = Router::new()
        .route(
            "/metrics",
            get(move || {
                let metrics = Arc::clone(&metrics);
                async move {
                    metrics
                        .render()
                        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
                }
            }),
        )
        .layer(TraceLayer::new_for_http());
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("metrics listening on http://{addr}/metrics");
    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await?;
    Ok(())
}

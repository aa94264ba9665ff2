use axum::{Router, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::actions;
use crate::config::Config;
use crate::cycle::CycleManager;
use crate::ensemble::EnsembleOrchestrator;
use crate::prediction_cache::PredictionCache;
use crate::progress::ProgressStore;
use crate::simulator_cache::SimulatorCache;

/// Shared state behind every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub predictions: PredictionCache,
    pub sim_cache: Arc<SimulatorCache>,
    pub cycles: Arc<CycleManager>,
    pub orchestrator: Arc<EnsembleOrchestrator>,
    pub progress: Arc<ProgressStore>,
    pub metrics: PrometheusHandle,
}

/// Install the Prometheus recorder. Called once at startup, before any
/// metric is touched.
pub fn init_metrics() -> PrometheusHandle {
    PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/predict", get(actions::predict))
        .route("/ensemble", get(actions::ensemble))
        .route("/progress/{request_id}", get(actions::progress))
        .route("/status", get(actions::status))
        .route("/metrics", get(actions::metrics))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve until the shutdown token fires, then drain in-flight requests.
pub async fn serve(state: AppState, port: u16, shutdown: CancellationToken) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("listening on {}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

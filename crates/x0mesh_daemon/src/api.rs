//! Pull-only observability endpoint.
//!
//! `/metrics` renders the core's counter/gauge map as text, `/status`
//! serves the shared node view as JSON, `/health` is a liveness probe.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use tokio::sync::watch;
use tracing::{error, info};
use x0mesh_core::MeshMetrics;

use crate::config::DaemonConfig;
use crate::node::{SharedView, SharedViewHandle};

#[derive(Clone)]
struct ApiState {
    metrics: Arc<MeshMetrics>,
    view: SharedViewHandle,
}

pub fn spawn_api(
    config: &DaemonConfig,
    metrics: Arc<MeshMetrics>,
    view: SharedViewHandle,
    mut shutdown: watch::Receiver<bool>,
) {
    let addr = if config.node.api_public {
        format!("0.0.0.0:{}", config.node.api_port)
    } else {
        format!("127.0.0.1:{}", config.node.api_port)
    };

    tokio::spawn(async move {
        let app = Router::new()
            .route("/metrics", get(get_metrics))
            .route("/status", get(get_status))
            .route("/health", get(get_health))
            .with_state(ApiState { metrics, view });

        info!(address = addr, "observability endpoint listening");
        let listener = match tokio::net::TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!(address = %addr, error = %e, "failed to bind API listener");
                return;
            }
        };
        let served = axum::serve(listener, app).with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        });
        if let Err(e) = served.await {
            error!(error = %e, "API server exited with error");
        }
    });
}

async fn get_metrics(State(state): State<ApiState>) -> String {
    state.metrics.render_text()
}

async fn get_status(State(state): State<ApiState>) -> Json<SharedView> {
    let view = state.view.read().unwrap_or_else(|e| e.into_inner()).clone();
    Json(view)
}

async fn get_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

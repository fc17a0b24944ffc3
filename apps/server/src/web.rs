use anyhow::Result;
use axum::{
    extract::{Json, State},
    routing::{get, post},
    Router,
};
use eas::{EasModel, EasStatus};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::DaemonConfig;

#[derive(Clone)]
pub struct WebState {
    pub model: Arc<EasModel>,
    /// Re-read each time monitoring is enabled.
    pub config_path: PathBuf,
}

#[derive(Deserialize)]
pub struct MonitoringRequest {
    enable: bool,
}

pub fn router(state: WebState) -> Router {
    Router::new()
        .route("/api/status", get(get_status))
        .route("/api/monitoring", post(set_monitoring))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(listener: TcpListener, state: WebState) -> Result<()> {
    info!(addr = %listener.local_addr()?, "web server listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn get_status(State(state): State<WebState>) -> Json<EasStatus> {
    Json(state.model.status().await)
}

async fn set_monitoring(
    State(state): State<WebState>,
    Json(request): Json<MonitoringRequest>,
) -> Json<serde_json::Value> {
    let result = if request.enable {
        start(&state).await
    } else {
        state.model.stop_monitoring().await;
        Ok(())
    };
    match result {
        Ok(()) => Json(serde_json::json!({
            "success": true,
            "state": state.model.state(),
        })),
        Err(e) => Json(serde_json::json!({
            "success": false,
            "error": format!("{e:#}"),
        })),
    }
}

async fn start(state: &WebState) -> Result<()> {
    let config = DaemonConfig::load(&state.config_path)?;
    state.model.set_config(config.eas)?;
    state.model.start_monitoring().await?;
    Ok(())
}

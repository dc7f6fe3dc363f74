use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::info;

use crate::server::now_ms;
use crate::state::RelayState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusBody {
    status: &'static str,
    online_drivers: usize,
    active_rides: usize,
    timestamp: i64,
}

/// Read-only operational counters, served off the relay's own state.
pub async fn serve(addr: String, state: Arc<RwLock<RelayState>>) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/status", get(status))
        .with_state(state);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("status endpoint listening on {addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn status(State(state): State<Arc<RwLock<RelayState>>>) -> Json<StatusBody> {
    let state = state.read().await;
    Json(StatusBody {
        status: "online",
        online_drivers: state.registry.online_driver_count(),
        active_rides: state.rides.active_count(),
        timestamp: now_ms(),
    })
}

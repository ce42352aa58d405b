use axum::{extract::State, Json};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::warn;

use crate::app::AppState;

/// GET /health: liveness check with fleet and trigger counts.
///
/// Reports `degraded` instead of failing when a count query errors.
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let devices = state.devices.count();
    let pending = state.scheduler.pending_count();
    let status = if devices.is_ok() && pending.is_ok() {
        "ok"
    } else {
        "degraded"
    };
    if let Err(ref e) = devices {
        warn!("health: device count failed: {e}");
    }
    if let Err(ref e) = pending {
        warn!("health: trigger count failed: {e}");
    }

    Json(json!({
        "status": status,
        "version": env!("CARGO_PKG_VERSION"),
        "devices": devices.ok(),
        "pendingTriggers": pending.ok(),
        "eventSubscribers": state.broadcaster.subscriber_count(),
    }))
}

use std::sync::Arc;

use axum::{routing::get, Router};
use clockfleet_devices::DeviceStore;
use clockfleet_scheduler::SchedulerHandle;

use crate::events::EventBroadcaster;

/// Central shared state, passed as `Arc<AppState>` to all Axum handlers.
pub struct AppState {
    pub devices: Arc<DeviceStore>,
    pub scheduler: SchedulerHandle,
    pub broadcaster: Arc<EventBroadcaster>,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(crate::http::health::health_handler))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

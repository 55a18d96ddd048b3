//! Service wiring for the recovery pipeline: state bootstrap, HTTP
//! surface (health + webhook ingress), background schedulers and the
//! clean-users export.

#![deny(unsafe_code)]

pub mod exports;
mod scheduler;
mod state;

pub use exports::CleanUsersExportJob;
pub use scheduler::spawn_schedulers;
pub use state::{ServiceState, StorageMode};

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use std::sync::Arc;

/// REST router: health plus the notification ingress.
pub fn build_router(state: ServiceState) -> Router {
    let webhook = redress_webhook::webhook_router(state.webhooks.clone());
    Router::new()
        .route("/v1/health", get(health))
        .with_state(Arc::new(state))
        .merge(webhook)
}

async fn health(State(_state): State<Arc<ServiceState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

//! API routes

pub mod billing;
pub mod health;
pub mod scans;
pub mod users;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::state::AppState;

/// Create all API routes
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route("/auth/register", post(users::register))
        .route("/billing/webhook", post(billing::webhook))
        .route("/billing/quota", get(billing::quota_status))
        .route("/v1/scans", post(scans::submit_scan))
        .route("/v1/ai/questions", post(scans::ask_question))
        .route("/v1/exports", post(scans::create_export))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

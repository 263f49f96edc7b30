//! API Routes
//!
//! - `/api/chat` - job submission, status and event streams
//! - `/api/history` - stored conversations
//! - `/api/health` - health checks

pub mod chat;
pub mod health;
pub mod history;

use axum::Router;
use tower_http::trace::TraceLayer;
use crate::middleware::cors_layer;
use crate::models::AppState;
use tracing::info;

/// Create the main application router
pub fn create_router(state: AppState) -> Router {
    info!("Creating application router");

    let cors = cors_layer(&state.config.server.cors_allowed_origins);

    Router::new()
        .merge(chat::router(state.clone()))
        .merge(history::router(state.clone()))
        .merge(health::router(state))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

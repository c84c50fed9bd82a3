//! HTTP REST API routes

mod relay_routes;
mod system_routes;

use axum::{
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;

use crate::infrastructure::state::AppState;

pub use relay_routes::*;
pub use system_routes::*;

/// Create all API routes
pub fn create_routes() -> Router<Arc<AppState>> {
    Router::new()
        // Turn submission and delivery
        .route("/api/turn", post(relay_routes::submit_turn))
        .route(
            "/api/hint/{namespace}/{session_id}",
            get(relay_routes::poll_hint),
        )
        // Session lifecycle
        .route(
            "/api/session/{namespace}/{session_id}",
            delete(relay_routes::clear_session),
        )
        // Operations
        .route("/api/transport/reset", post(system_routes::reset_transport))
        .route("/health", get(system_routes::health))
}

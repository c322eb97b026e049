//! Axum router construction for the control surface.
//!
//! Assembles all routes into a single [`Router`] with CORS middleware
//! enabled so browser tooling can drive the simulator directly.

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::state::AppState;

/// Build the complete Axum router.
///
/// The router includes:
/// - `POST /run` -- start units in an environment
/// - `POST /stop` -- stop one environment or all of them
/// - `GET /status` -- running/stopped per environment
/// - `GET /health` -- liveness probe
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/run", post(handlers::run))
        .route("/stop", post(handlers::stop))
        .route("/status", get(handlers::status))
        .route("/health", get(handlers::health))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

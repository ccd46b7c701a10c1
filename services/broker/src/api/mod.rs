//! HTTP API handlers and routing.

pub mod error;
mod health;
mod ws;

use axum::Router;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub use ws::USER_ID_HEADER;

/// Create the router with all routes and middleware.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(health::routes())
        .merge(ws::routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

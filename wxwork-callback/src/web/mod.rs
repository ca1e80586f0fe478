//! Web server module for the WeCom callback endpoint.
//!
//! Routes:
//! - `GET /`: callback URL verification
//! - `POST /`: encrypted message delivery
//! - `GET /health`: liveness
//!
//! Body size and total request time are bounded so slow or oversized
//! clients cannot pin resources.

pub mod handlers;
pub mod response;

use axum::{
    extract::DefaultBodyLimit,
    routing::get,
    Router,
};
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

pub use handlers::{health, receive_message, verify_callback_url, AppState, HealthResponse};
pub use response::ErrorResponse;

/// Build the application router.
pub fn router(state: AppState) -> Router {
    let max_body_bytes = state.config.max_body_bytes;
    let request_timeout = state.config.request_timeout();

    Router::new()
        .route("/", get(verify_callback_url).post(receive_message))
        .route("/health", get(health))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(TimeoutLayer::new(request_timeout))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

//! Callback endpoint handlers.
//!
//! These handlers are thin: extract the query and body, hand them to the
//! [`CallbackHandler`], and let [`Outcome`](crate::callback::Outcome)
//! pick the response.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    response::IntoResponse,
    Json,
};
use serde::Serialize;

use crate::callback::{CallbackHandler, MessageRequest, VerificationRequest};
use crate::crypto::MsgCrypt;
use crate::Config;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub handler: Arc<CallbackHandler>,
}

impl AppState {
    pub fn new(config: Config, crypt: Arc<dyn MsgCrypt>) -> Self {
        let handler = CallbackHandler::new(crypt, config.crypto_timeout());
        Self {
            config: Arc::new(config),
            handler: Arc::new(handler),
        }
    }
}

// =============================================================================
// Health Check
// =============================================================================

/// Health check response.
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub message: &'static str,
    pub credentials_configured: bool,
}

/// Health check endpoint.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        message: "service running",
        credentials_configured: state.config.credentials.is_configured(),
    })
}

// =============================================================================
// Callback
// =============================================================================

/// URL verification endpoint (`GET /`).
///
/// Responds with the decrypted `echostr` as bare text: no quotes, no BOM,
/// no trailing newline.
pub async fn verify_callback_url(
    State(state): State<AppState>,
    Query(request): Query<VerificationRequest>,
) -> impl IntoResponse {
    state.handler.verify_url(request).await
}

/// Message delivery endpoint (`POST /`).
///
/// Responds with the encrypted reply XML, or an empty 200 when there is
/// nothing to reply.
pub async fn receive_message(
    State(state): State<AppState>,
    Query(request): Query<MessageRequest>,
    body: String,
) -> impl IntoResponse {
    state.handler.handle_message(request, body).await
}

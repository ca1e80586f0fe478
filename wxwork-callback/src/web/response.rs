//! Mapping from callback outcomes to HTTP responses.

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::callback::Outcome;

/// Error body for rejected or failed requests.
#[derive(Serialize)]
pub struct ErrorResponse {
    pub status: &'static str,
    pub detail: String,
}

impl IntoResponse for Outcome {
    fn into_response(self) -> Response {
        match self {
            Outcome::Verified(echo) => (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
                echo,
            )
                .into_response(),
            Outcome::Decrypted(Some(reply)) => (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "application/xml")],
                reply,
            )
                .into_response(),
            Outcome::Decrypted(None) => StatusCode::OK.into_response(),
            Outcome::Rejected(detail) => (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse {
                    status: "rejected",
                    detail,
                }),
            )
                .into_response(),
            Outcome::InternalError(detail) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    status: "error",
                    detail,
                }),
            )
                .into_response(),
        }
    }
}

//! API error taxonomy.
//!
//! Every handler failure funnels into [`ApiError`]; the response is always a
//! JSON `{"error": ...}` body with the matching status. Internal errors are
//! logged and never leak details to the caller.

use crate::auth::AuthError;
use crate::reason::ReasonError;
use crate::rounds::SubmitError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;

#[derive(Debug)]
pub enum ApiError {
    Validation(String),
    Auth(AuthError),
    NotFound(String),
    Conflict(String),
    Precondition(String),
    Upstream(String),
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Validation(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Auth(err) => {
                let status = match err {
                    AuthError::InactiveAgent => StatusCode::FORBIDDEN,
                    _ => StatusCode::UNAUTHORIZED,
                };
                (status, err.to_string())
            }
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Precondition(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Upstream(msg) => (StatusCode::BAD_GATEWAY, msg),
            ApiError::Internal(err) => {
                tracing::error!("internal error: {:#}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_string(),
                )
            }
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(err)
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        ApiError::Auth(err)
    }
}

impl From<ReasonError> for ApiError {
    fn from(err: ReasonError) -> Self {
        match err {
            ReasonError::Validation(_) => ApiError::Validation(err.to_string()),
            ReasonError::InsufficientHistory(_) | ReasonError::Misalignment(_) => {
                ApiError::Precondition(err.to_string())
            }
            ReasonError::Upstream(_) => ApiError::Upstream(err.to_string()),
        }
    }
}

impl From<SubmitError> for ApiError {
    fn from(err: SubmitError) -> Self {
        match err {
            SubmitError::Validation(msg) => ApiError::Validation(msg),
            SubmitError::NotFound(msg) => ApiError::NotFound(msg),
            SubmitError::Precondition(msg) => ApiError::Precondition(msg),
            SubmitError::Reason(e) => e.into(),
            SubmitError::Internal(e) => ApiError::Internal(e),
        }
    }
}

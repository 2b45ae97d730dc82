use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

use crate::core::pipeline::StageError;

/// Error surface for the REST handlers.
///
/// A [`StageFailure`](AppError::StageFailure) keeps the interaction contract:
/// the body carries the user-safe apology in `response` next to the
/// structured cause, so a client can still speak something sensible.
#[derive(Debug)]
pub enum AppError {
    InternalServerError(String),
    BadRequest(String),
    StageFailure(StageError),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::InternalServerError(msg) => {
                tracing::error!("Internal server error: {}", msg);
                let body = Json(json!({
                    "error": "Internal server error",
                    "status": StatusCode::INTERNAL_SERVER_ERROR.as_u16()
                }));
                (StatusCode::INTERNAL_SERVER_ERROR, body).into_response()
            }
            AppError::BadRequest(msg) => {
                tracing::warn!("Bad request: {}", msg);
                let body = Json(json!({
                    "error": "Bad request",
                    "status": StatusCode::BAD_REQUEST.as_u16()
                }));
                (StatusCode::BAD_REQUEST, body).into_response()
            }
            AppError::StageFailure(err) => {
                tracing::warn!(stage = %err.stage, "interaction failed: {err}");
                let body = Json(json!({
                    "response": err.user_message(),
                    "error": {
                        "stage": err.stage.as_str(),
                        "detail": err.to_string(),
                    }
                }));
                (StatusCode::INTERNAL_SERVER_ERROR, body).into_response()
            }
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::InternalServerError(msg) => write!(f, "Internal server error: {msg}"),
            AppError::BadRequest(msg) => write!(f, "Bad request: {msg}"),
            AppError::StageFailure(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<StageError> for AppError {
    fn from(err: StageError) -> Self {
        AppError::StageFailure(err)
    }
}

pub type AppResult<T> = Result<T, AppError>;

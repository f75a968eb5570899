use axum::{
    Json,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;
use tracing::error;

use crate::models;

pub type ApiResult<T> = Result<Json<T>, ApiError>;

pub const BASIC_REALM: &str = "Basic realm=\"TinyList Admin\"";

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("not found")]
    NotFound,
    #[error("{0}")]
    Conflict(String),
    #[error("authentication required")]
    Unauthorized,
    #[error("invalid input: {0}")]
    Validation(#[from] garde::Report),
    #[error("{0}")]
    Internal(String),
    #[error(transparent)]
    Store(models::Error),
}

impl From<models::Error> for ApiError {
    fn from(err: models::Error) -> Self {
        match err {
            models::Error::NotFound(_) => ApiError::NotFound,
            models::Error::Conflict => ApiError::Conflict("conflict".to_string()),
            other => ApiError::Store(other),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            ApiError::BadRequest(message) => {
                (StatusCode::BAD_REQUEST, "bad_request", message.clone())
            }
            ApiError::Validation(report) => {
                (StatusCode::BAD_REQUEST, "bad_request", report.to_string())
            }
            ApiError::NotFound => (StatusCode::NOT_FOUND, "not_found", "not found".to_string()),
            ApiError::Conflict(message) => (StatusCode::CONFLICT, "conflict", message.clone()),
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                "authentication required".to_string(),
            ),
            ApiError::Internal(cause) => {
                error!("API server error: {cause}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal",
                    "internal server error".to_string(),
                )
            }
            ApiError::Store(err) => {
                error!("API server error: {err}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal",
                    "internal server error".to_string(),
                )
            }
        };

        let body = Json(json!({ "error": code, "message": message }));

        if matches!(self, ApiError::Unauthorized) {
            (status, [(header::WWW_AUTHENTICATE, BASIC_REALM)], body).into_response()
        } else {
            (status, body).into_response()
        }
    }
}

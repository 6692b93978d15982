use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use log::error;
use serde_json::json;
use thiserror::Error;

use crate::queue::EnqueueError;

/// Caller-visible API failures, mapped to status codes.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("unknown queue {0}")]
    UnknownQueue(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<EnqueueError> for ApiError {
    fn from(err: EnqueueError) -> Self {
        match err {
            EnqueueError::InvalidPayload(msg) => ApiError::InvalidPayload(msg),
            EnqueueError::UnknownQueue(name) => ApiError::UnknownQueue(name),
            EnqueueError::Db(e) => ApiError::Internal(e),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::InvalidPayload(_) => StatusCode::BAD_REQUEST,
            ApiError::UnknownQueue(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(e) => {
                error!("Internal error serving request: {:#}", e);
                StatusCode::INTERNAL_SERVER_ERROR
            },
        };

        let body = Json(json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

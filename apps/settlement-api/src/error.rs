//! HTTP error mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, warn};

use fleetpay_engine::{EngineError, ErrorCategory, SignatureError};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Missing {0} header")]
    MissingHeader(&'static str),

    #[error(transparent)]
    Signature(#[from] SignatureError),

    #[error("Unauthorized")]
    Unauthorized,

    #[error(transparent)]
    Engine(#[from] EngineError),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::MissingHeader(_) | ApiError::Signature(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Engine(EngineError::NotFound { .. }) => StatusCode::NOT_FOUND,
            ApiError::Engine(e) => match e.category() {
                ErrorCategory::Validation => StatusCode::BAD_REQUEST,
                ErrorCategory::Conflict => StatusCode::CONFLICT,
                ErrorCategory::Permanent => StatusCode::UNPROCESSABLE_ENTITY,
                ErrorCategory::Transient => StatusCode::SERVICE_UNAVAILABLE,
                ErrorCategory::Unknown => StatusCode::BAD_GATEWAY,
                ErrorCategory::Internal => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    fn code(&self) -> &'static str {
        match self {
            ApiError::MissingHeader(_) | ApiError::Signature(_) => "invalid_signature",
            ApiError::Unauthorized => "unauthorized",
            ApiError::Engine(e) => e.category().as_str(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(status = status.as_u16(), error = %self, "Request failed");
        } else {
            warn!(status = status.as_u16(), error = %self, "Request rejected");
        }

        let body = ErrorBody {
            error: self.code(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use modelforge_core::ForgeError;
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Forge(#[from] ForgeError),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Payload too large: {0}")]
    PayloadTooLarge(String),

    #[error("Rate limit exceeded")]
    RateLimited { retry_after_secs: u64 },
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::Forge(ForgeError::Serialization(err))
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Forge(err) => match err {
                ForgeError::Validation(_) | ForgeError::Configuration(_) => {
                    StatusCode::BAD_REQUEST
                }
                ForgeError::NotFound(_) => StatusCode::NOT_FOUND,
                ForgeError::ConflictOrBusy(_) => StatusCode::CONFLICT,
                ForgeError::ResourceLimit(_) => StatusCode::TOO_MANY_REQUESTS,
                ForgeError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
                ForgeError::Security(_) => StatusCode::BAD_REQUEST,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(json!({
            "status": "error",
            "message": self.to_string(),
        }));
        match self {
            ApiError::RateLimited { retry_after_secs } => (
                status,
                [(header::RETRY_AFTER, retry_after_secs.to_string())],
                body,
            )
                .into_response(),
            _ => (status, body).into_response(),
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

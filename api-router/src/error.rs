use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use common::error::AppError;
use serde::Serialize;
use thiserror::Error;

/// API-facing error. Internal adapter and store failures are mapped to
/// taxonomy codes with stable strings; raw messages never leak.
#[derive(Error, Debug, Serialize, Clone)]
pub enum ApiError {
    #[error("Internal server error")]
    InternalError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Payload too large: {0}")]
    PayloadTooLarge(String),
}

impl ApiError {
    fn code(&self) -> &'static str {
        match self {
            Self::InternalError(_) => "internal_error",
            Self::ValidationError(_) => "validation_error",
            Self::NotFound(_) => "not_found",
            Self::Unauthorized(_) => "auth_error",
            Self::QuotaExceeded(_) => "quota_error",
            Self::PayloadTooLarge(_) => "payload_too_large",
        }
    }
}

impl From<AppError> for ApiError {
    fn from(err: AppError) -> Self {
        match err {
            AppError::NotFound(msg) => Self::NotFound(msg),
            AppError::Validation(msg) => Self::ValidationError(msg),
            AppError::Auth(msg) => Self::Unauthorized(msg),
            AppError::Quota(msg) => Self::QuotaExceeded(msg),
            other => {
                tracing::error!(code = other.taxonomy_code(), error = %other, "internal error");
                Self::InternalError("Internal server error".to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self {
            Self::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::ValidationError(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::QuotaExceeded(_) => StatusCode::PAYMENT_REQUIRED,
            Self::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
        };

        let body = ErrorResponse {
            code: self.code().to_string(),
            error: self.to_string(),
            status: "error".to_string(),
        };

        (status, Json(body)).into_response()
    }
}

#[derive(Serialize, Debug)]
struct ErrorResponse {
    code: String,
    error: String,
    status: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt::Debug;

    fn assert_status_code<T: IntoResponse + Debug>(response: T, expected_status: StatusCode) {
        let response = response.into_response();
        assert_eq!(response.status(), expected_status);
    }

    #[test]
    fn app_error_maps_to_taxonomy() {
        let api_error = ApiError::from(AppError::NotFound("resource not found".to_string()));
        assert!(matches!(api_error, ApiError::NotFound(msg) if msg == "resource not found"));

        let api_error = ApiError::from(AppError::Validation("invalid input".to_string()));
        assert!(matches!(api_error, ApiError::ValidationError(msg) if msg == "invalid input"));

        let api_error = ApiError::from(AppError::Auth("unauthorized".to_string()));
        assert!(matches!(api_error, ApiError::Unauthorized(msg) if msg == "unauthorized"));

        let api_error = ApiError::from(AppError::Quota("too expensive".to_string()));
        assert!(matches!(api_error, ApiError::QuotaExceeded(_)));

        // Adapter errors never surface their raw message.
        let api_error = ApiError::from(AppError::AdapterFatal("provider secret detail".into()));
        assert!(matches!(api_error, ApiError::InternalError(_)));
        assert_eq!(api_error.to_string(), "Internal server error");
    }

    #[test]
    fn status_codes() {
        assert_status_code(
            ApiError::InternalError("x".into()),
            StatusCode::INTERNAL_SERVER_ERROR,
        );
        assert_status_code(ApiError::ValidationError("x".into()), StatusCode::BAD_REQUEST);
        assert_status_code(ApiError::NotFound("x".into()), StatusCode::NOT_FOUND);
        assert_status_code(ApiError::Unauthorized("x".into()), StatusCode::UNAUTHORIZED);
        assert_status_code(
            ApiError::QuotaExceeded("x".into()),
            StatusCode::PAYMENT_REQUIRED,
        );
        assert_status_code(
            ApiError::PayloadTooLarge("x".into()),
            StatusCode::PAYLOAD_TOO_LARGE,
        );
    }

    #[test]
    fn codes_are_stable() {
        assert_eq!(ApiError::ValidationError("x".into()).code(), "validation_error");
        assert_eq!(ApiError::QuotaExceeded("x".into()).code(), "quota_error");
        assert_eq!(ApiError::Unauthorized("x".into()).code(), "auth_error");
    }
}

//! JSON error bodies
//!
//! Every error leaves the service as
//!
//! ```json
//! { "error": "Service Unavailable", "message": "...", "code": "CIRCUIT_BREAKER_OPEN" }
//! ```

use axum::{
    Json,
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

/// Standard error response structure.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    /// Short, human-readable status text
    pub error: String,
    pub message: String,
    /// Machine-readable identifier for programmatic handling
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            code: None,
            details: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn into_response_with(self, status: StatusCode) -> Response {
        (status, Json(self)).into_response()
    }
}

/// Application error type that can be converted to HTTP responses.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AppError {
    #[error("JSON extraction error: {0}")]
    JsonExtractorRejection(#[from] JsonRejection),

    #[error("Bad Request: {0}")]
    BadRequest(String),

    #[error("Not Found: {0}")]
    NotFound(String),

    #[error("Service Unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Gateway Timeout: {0}")]
    GatewayTimeout(String),

    #[error("Internal Server Error: {0}")]
    InternalServerError(String),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::JsonExtractorRejection(rejection) => rejection.status(),
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::GatewayTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            AppError::InternalServerError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            AppError::JsonExtractorRejection(_) => "INVALID_JSON",
            AppError::BadRequest(_) => "BAD_REQUEST",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
            AppError::GatewayTimeout(_) => "GATEWAY_TIMEOUT",
            AppError::InternalServerError(_) => "INTERNAL_ERROR",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            AppError::JsonExtractorRejection(rejection) => rejection.body_text(),
            // Internal details stay in the logs
            AppError::InternalServerError(_) => "An internal server error occurred".to_string(),
            AppError::BadRequest(m)
            | AppError::NotFound(m)
            | AppError::ServiceUnavailable(m)
            | AppError::GatewayTimeout(m) => m.clone(),
        };

        if status.is_server_error() {
            tracing::error!(code = self.code(), error = %self, "Request failed");
        } else {
            tracing::warn!(code = self.code(), error = %self, "Request rejected");
        }

        ErrorResponse::new(status.canonical_reason().unwrap_or("Error"), message)
            .with_code(self.code())
            .into_response_with(status)
    }
}

/// Fallback handler for unmatched routes.
pub async fn not_found() -> Response {
    ErrorResponse::new("Not Found", "The requested resource does not exist")
        .with_code("NOT_FOUND")
        .into_response_with(StatusCode::NOT_FOUND)
}

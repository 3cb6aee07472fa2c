//! Error types for gemrelay.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Result type alias for gemrelay operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for gemrelay.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("No upstream API keys are configured")]
    NoCredentials,

    #[error("{0}")]
    Unauthorized(String),

    #[error("Unsupported message role '{0}'")]
    UnsupportedRole(String),

    #[error("Rate limit exceeded: {0}")]
    RateLimited(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Model '{0}' not found upstream")]
    ModelNotFound(String),

    #[error("All API keys failed. Last error: {0}")]
    UpstreamExhausted(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// HTTP status this error is surfaced with.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Config(_) | Error::NoCredentials => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Error::UnsupportedRole(_) | Error::BadRequest(_) => StatusCode::BAD_REQUEST,
            Error::ModelNotFound(_) => StatusCode::NOT_FOUND,
            Error::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            Error::UpstreamExhausted(_) | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // OpenAI-compatible error format
        let body = serde_json::json!({
            "error": {
                "message": self.to_string(),
                "type": "gemrelay_error",
                "code": status.as_u16()
            }
        });

        (status, axum::Json(body)).into_response()
    }
}

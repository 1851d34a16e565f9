use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use var_core::engine::EngineError;

#[derive(Debug)]
pub enum ApiError {
    InvalidRequest(String),
    /// Models still loading, queue full, or engine stopped.
    Unavailable(String),
    GenerationFailed(String),
}

#[derive(Serialize)]
struct ErrorResponse {
    success: bool,
    error: String,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::GenerationFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            ApiError::InvalidRequest(msg)
            | ApiError::Unavailable(msg)
            | ApiError::GenerationFailed(msg) => msg,
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::NotReady => ApiError::Unavailable("Model not loaded".to_string()),
            EngineError::QueueFull | EngineError::Shutdown => {
                ApiError::Unavailable(err.to_string())
            }
            EngineError::Generation(e) if e.is_invalid_input() => {
                ApiError::InvalidRequest(e.to_string())
            }
            other => ApiError::GenerationFailed(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(%status, error = self.message(), "request failed");
        }
        let body = ErrorResponse {
            success: false,
            error: self.message().to_string(),
        };
        (status, axum::Json(body)).into_response()
    }
}

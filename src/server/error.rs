//! Per-request errors and their HTTP rendering.

use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AdapterError {
    #[error("{0}")]
    InvalidPayload(String),

    #[error("Inference engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error("Inference engine did not respond within {0:?}")]
    UpstreamTimeout(Duration),
}

impl AdapterError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        AdapterError::InvalidPayload(msg.into())
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        AdapterError::EngineUnavailable(msg.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AdapterError::InvalidPayload(_) => StatusCode::BAD_REQUEST,
            AdapterError::EngineUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AdapterError::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    /// Short machine-readable code, also used as the metrics outcome label.
    pub fn code(&self) -> &'static str {
        match self {
            AdapterError::InvalidPayload(_) => "invalid_payload",
            AdapterError::EngineUnavailable(_) => "engine_unavailable",
            AdapterError::UpstreamTimeout(_) => "upstream_timeout",
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            AdapterError::InvalidPayload(_) => "invalid_request_error",
            AdapterError::EngineUnavailable(_) => "service_unavailable",
            AdapterError::UpstreamTimeout(_) => "timeout_error",
        }
    }
}

impl IntoResponse for AdapterError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": {
                "message": self.to_string(),
                "type": self.error_type(),
                "code": self.code(),
            }
        }));
        (self.status(), body).into_response()
    }
}

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{SecondsFormat, Utc};
use serde_json::json;

use crate::services::queue::QueueError;

/// Failures surfaced to HTTP clients as `{success: false, error: {...}}`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    InvalidParameters(String),

    #[error("Invalid event: {event}. Valid events: {valid}")]
    InvalidEvent { event: String, valid: String },

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Webhook not found: {0}")]
    WebhookNotFound(String),

    #[error("Document not found: {0}")]
    DocumentNotFound(String),

    #[error("Failed to store document: {0}")]
    Storage(#[from] std::io::Error),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidParameters(_) | ApiError::InvalidEvent { .. } => {
                StatusCode::BAD_REQUEST
            }
            ApiError::JobNotFound(_)
            | ApiError::WebhookNotFound(_)
            | ApiError::DocumentNotFound(_)
            | ApiError::Queue(QueueError::JobNotFound(_)) => StatusCode::NOT_FOUND,
            ApiError::Queue(QueueError::Timeout { .. }) => StatusCode::REQUEST_TIMEOUT,
            ApiError::Queue(QueueError::Redis(_) | QueueError::Closed) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ApiError::Storage(_) | ApiError::Queue(QueueError::Serialize(_)) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn code(&self) -> &'static str {
        match self {
            ApiError::InvalidParameters(_) => "INVALID_PARAMETERS",
            ApiError::InvalidEvent { .. } => "INVALID_EVENT",
            ApiError::JobNotFound(_) | ApiError::Queue(QueueError::JobNotFound(_)) => {
                "JOB_NOT_FOUND"
            }
            ApiError::WebhookNotFound(_) => "WEBHOOK_NOT_FOUND",
            ApiError::DocumentNotFound(_) => "DOCUMENT_NOT_FOUND",
            ApiError::Storage(_) => "STORAGE_ERROR",
            ApiError::Queue(QueueError::Timeout { .. }) => "TIMEOUT",
            ApiError::Queue(_) => "QUEUE_UNAVAILABLE",
        }
    }
}

/// Bodies and query strings that fail to parse are reported like any other
/// validation failure, inside the error envelope.
impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::InvalidParameters(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::InvalidParameters(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }
        let body = json!({
            "success": false,
            "error": {
                "code": self.code(),
                "message": self.to_string(),
                "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            }
        });
        (status, Json(body)).into_response()
    }
}

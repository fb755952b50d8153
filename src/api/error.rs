//! Maps `ClusterError` to HTTP responses. The only place in the crate that
//! turns a component-boundary `Result` into a status code.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::error::ClusterError;

impl IntoResponse for ClusterError {
    fn into_response(self) -> Response {
        let status = match &self {
            ClusterError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ClusterError::Forbidden(_) => StatusCode::FORBIDDEN,
            ClusterError::Validation(_)
            | ClusterError::InvalidArgument(_)
            | ClusterError::ChecksumMismatch { .. }
            | ClusterError::DecompressionBomb(_) => StatusCode::BAD_REQUEST,
            ClusterError::NotFound(_) => StatusCode::NOT_FOUND,
            ClusterError::AlreadyExists(_) | ClusterError::Conflict(_) => StatusCode::CONFLICT,
            ClusterError::LockBusy(_) => StatusCode::CONFLICT,
            ClusterError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ClusterError::NotHealthy(_) | ClusterError::NoQuorum(_) | ClusterError::SplitBrain(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ClusterError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ClusterError::Transport(_) => StatusCode::BAD_GATEWAY,
            ClusterError::Io(_)
            | ClusterError::Serialization(_)
            | ClusterError::Configuration(_)
            | ClusterError::Encryption(_)
            | ClusterError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(json!({"error": self.to_string()}));
        (status, body).into_response()
    }
}

//! HTTP error type.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use prlens_core::ControlError;
use serde::Serialize;
use tracing::{debug, warn};

/// Errors returned by handlers, rendered as `{ "error", "code" }`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Malformed request.
    #[error("{0}")]
    BadRequest(String),
    /// The runtime refused the request.
    #[error("{0}")]
    Rejected(String),
    /// The runtime failed or could not be reached.
    #[error("{0}")]
    BadGateway(String),
    /// The server is shutting down or a component is missing.
    #[error("{0}")]
    Unavailable(String),
}

impl ApiError {
    /// HTTP status for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Rejected(_) => StatusCode::CONFLICT,
            Self::BadGateway(_) => StatusCode::BAD_GATEWAY,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "bad_request",
            Self::Rejected(_) => "rejected",
            Self::BadGateway(_) => "bad_gateway",
            Self::Unavailable(_) => "unavailable",
        }
    }
}

impl From<ControlError> for ApiError {
    fn from(err: ControlError) -> Self {
        match err {
            ControlError::InvalidRequest(msg) => Self::BadRequest(msg),
            other @ (ControlError::Unreachable(_) | ControlError::Server { .. }) => {
                Self::BadGateway(other.to_string())
            }
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    code: &'static str,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.code();
        let error = self.to_string();
        if status.is_server_error() {
            warn!(code, %error, "request failed");
        } else {
            debug!(code, %error, "request refused");
        }
        (status, Json(ErrorBody { error, code })).into_response()
    }
}

//! Closed error type for the hub and its `{code, message, data?}` HTTP
//! envelope mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("insufficient credits")]
    InsufficientCredits,
    #[error("client offline")]
    ClientOffline,
    #[error("send failed: {0}")]
    SendFailed(String),
    #[error("request timed out")]
    RequestTimeout,
    #[error("upstream failure: {0}")]
    UpstreamFailure(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl HubError {
    /// Stable negative error code carried in the JSON envelope; `0` is
    /// reserved for success and is never returned by this type.
    fn code(&self) -> i32 {
        match self {
            HubError::InvalidRequest(_) => -1,
            HubError::Unauthorized => -2,
            HubError::Forbidden(_) => -3,
            HubError::NotFound(_) => -4,
            HubError::Conflict(_) => -5,
            HubError::InsufficientCredits => -6,
            HubError::ClientOffline => -7,
            HubError::SendFailed(_) => -8,
            HubError::RequestTimeout => -9,
            HubError::UpstreamFailure(_) => -10,
            HubError::Internal(_) => -11,
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            HubError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            HubError::Unauthorized => StatusCode::UNAUTHORIZED,
            HubError::Forbidden(_) => StatusCode::FORBIDDEN,
            HubError::NotFound(_) => StatusCode::NOT_FOUND,
            HubError::Conflict(_) => StatusCode::CONFLICT,
            HubError::InsufficientCredits => StatusCode::CONFLICT,
            HubError::ClientOffline => StatusCode::NOT_FOUND,
            HubError::SendFailed(_) => StatusCode::BAD_GATEWAY,
            HubError::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            HubError::UpstreamFailure(_) => StatusCode::BAD_GATEWAY,
            HubError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
struct Envelope {
    code: i32,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

impl IntoResponse for HubError {
    fn into_response(self) -> Response {
        let status = self.status();
        if matches!(self, HubError::Internal(_)) {
            tracing::error!(error = %self, "internal error");
        } else {
            tracing::warn!(error = %self, "request failed");
        }
        let body = Envelope {
            code: self.code(),
            message: self.to_string(),
            data: None,
        };
        (status, Json(body)).into_response()
    }
}

pub type HubResult<T> = Result<T, HubError>;

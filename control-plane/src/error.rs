//! A single error enum shared by every component boundary. `IntoResponse`
//! renders the `/debug/*` shape (`{error, status}`); `a2a::rpc_error`
//! renders the JSON-RPC `-32000` envelope for the agent-protocol binding —
//! one small status-to-body helper per error kind.
use axum::{Json, http::StatusCode, response::IntoResponse, response::Response};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("authentication failed: {0}")]
    Unauthenticated(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("deadline exceeded")]
    DeadlineExceeded,
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
    #[error("cancelled")]
    Cancelled,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            ApiError::PermissionDenied(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Cancelled => StatusCode::from_u16(499).unwrap(),
        }
    }

    /// JSON-RPC 2.0 error code. Authentication failures
    /// map to the application-defined `-32000`; everything else that
    /// reaches the agent binding is an internal error from the caller's
    /// point of view.
    pub fn rpc_code(&self) -> i64 {
        match self {
            ApiError::InvalidArgument(_) => -32602,
            ApiError::Unauthenticated(_) | ApiError::PermissionDenied(_) => -32000,
            ApiError::NotFound(_) => -32001,
            _ => -32603,
        }
    }
}

impl From<kubently_common::store::StoreError> for ApiError {
    fn from(e: kubently_common::store::StoreError) -> Self {
        ApiError::Unavailable(e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        tracing::warn!(error = %self, %status, "request failed");
        (
            status,
            Json(serde_json::json!({"error": self.to_string(), "status": status.as_u16()})),
        )
            .into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

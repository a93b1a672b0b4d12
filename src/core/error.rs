//! Errors surfaced to HTTP callers.
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::{
    core::{directive::DirectiveError, request_info::RequestInfoError},
    ports::{http_client::HttpClientError, route_store::RouteStoreError},
};

pub type GatewayResult<T> = std::result::Result<T, GatewayError>;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Routing objects could not be listed; serving stale routes is worse than failing.
    #[error("routing store unavailable: {0}")]
    RouteStore(#[from] RouteStoreError),

    #[error("route {0} exists but its upstream is not available")]
    RouteUnavailable(String),

    #[error("cluster {0} not found")]
    ClusterNotFound(String),

    #[error("cluster {0} is not ready")]
    ClusterNotReady(String),

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("directive error: {0}")]
    Directive(#[from] DirectiveError),

    #[error("malformed request: {0}")]
    MalformedRequest(#[from] RequestInfoError),

    #[error("authentication failed: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::RouteStore(_)
            | GatewayError::RouteUnavailable(_)
            | GatewayError::ClusterNotReady(_)
            | GatewayError::Directive(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::ClusterNotFound(_) => StatusCode::BAD_REQUEST,
            GatewayError::Upstream(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            GatewayError::Forbidden(_) => StatusCode::FORBIDDEN,
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::MalformedRequest(_) | GatewayError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Machine-readable reason, in the vocabulary of Kubernetes `Status` objects.
    pub fn reason(&self) -> &'static str {
        match self.status_code() {
            StatusCode::SERVICE_UNAVAILABLE => "ServiceUnavailable",
            StatusCode::BAD_REQUEST => "BadRequest",
            StatusCode::BAD_GATEWAY => "BadGateway",
            StatusCode::UNAUTHORIZED => "Unauthorized",
            StatusCode::FORBIDDEN => "Forbidden",
            StatusCode::NOT_FOUND => "NotFound",
            _ => "InternalError",
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = serde_json::json!({
            "kind": "Status",
            "apiVersion": "v1",
            "metadata": {},
            "status": "Failure",
            "message": self.to_string(),
            "reason": self.reason(),
            "code": status.as_u16()
        });

        (status, Json(body)).into_response()
    }
}

impl From<HttpClientError> for GatewayError {
    fn from(e: HttpClientError) -> Self {
        GatewayError::Upstream(e.to_string())
    }
}

use async_trait::async_trait;
use axum::body::Body;
use hyper::{Request, Response};
use thiserror::Error;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HttpClientError {
    /// The upstream could not be reached or dropped the exchange.
    #[error("upstream connection failed: {0}")]
    ConnectionError(String),

    #[error("invalid upstream request: {0}")]
    InvalidRequest(String),

    /// CA material for the upstream could not be loaded.
    #[error("upstream TLS configuration: {0}")]
    Tls(String),
}

pub type HttpClientResult<T> = Result<T, HttpClientError>;

/// Outbound transport used by every dispatcher.
#[async_trait]
pub trait HttpClient: Send + Sync + 'static {
    /// Send a request carrying an absolute URI. Any status the upstream answers with,
    /// including `101`, is a response; only transport failures are errors.
    async fn send_request(&self, req: Request<Body>) -> HttpClientResult<Response<Body>>;
}

//! Hook points for the identity and policy layers. Junction only consumes their outputs.
use async_trait::async_trait;
use http::request::Parts;
use thiserror::Error;

use crate::core::{context::UserInfo, request_info::RequestInfo};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),
    #[error("authentication backend unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait Authenticator: Send + Sync + 'static {
    /// Resolve the caller. `Ok(None)` means the request carries no credentials and
    /// continues anonymously.
    async fn authenticate(&self, parts: &Parts) -> Result<Option<UserInfo>, AuthError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny(String),
}

#[async_trait]
pub trait Authorizer: Send + Sync + 'static {
    async fn authorize(&self, user: Option<&UserInfo>, info: &RequestInfo) -> Decision;
}

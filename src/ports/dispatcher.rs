use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use hyper::{Request, Response};

use crate::core::{context::RequestContext, request_info::RequestInfo};

/// Outcome of offering a request to a [`Dispatcher`].
#[derive(Debug)]
pub enum Dispatch {
    /// The dispatcher served the request; nothing after it runs.
    Handled(Response<Body>),
    /// Not for this dispatcher; the request is handed back untouched.
    Declined(Request<Body>),
    /// The request was rewritten and must be classified again from the top of the
    /// dispatcher list. Honored at most once per request.
    Reroute(Request<Body>, Arc<RequestInfo>),
}

/// A routing strategy that either fully services a request or declines it.
#[async_trait]
pub trait Dispatcher: Send + Sync + 'static {
    /// Stable name used in logs and metrics labels.
    fn name(&self) -> &'static str;

    async fn dispatch(&self, req: Request<Body>, ctx: &RequestContext) -> Dispatch;
}

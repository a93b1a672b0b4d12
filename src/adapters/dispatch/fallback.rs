use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use hyper::Request;

use super::handled;
use crate::{
    adapters::{proxy, transport_cache::TransportCache},
    core::{context::RequestContext, error::GatewayError, routing::TlsOptions},
    ports::dispatcher::{Dispatch, Dispatcher},
};

/// Sends whatever nothing else claimed to a fixed upstream, typically the console.
pub struct FallbackDispatcher {
    upstream: Option<String>,
    transports: Arc<TransportCache>,
}

impl FallbackDispatcher {
    pub fn new(upstream: Option<String>, transports: Arc<TransportCache>) -> Self {
        Self {
            upstream,
            transports,
        }
    }
}

#[async_trait]
impl Dispatcher for FallbackDispatcher {
    fn name(&self) -> &'static str {
        "fallback"
    }

    async fn dispatch(&self, req: Request<Body>, ctx: &RequestContext) -> Dispatch {
        let Some(upstream) = &self.upstream else {
            return Dispatch::Declined(req);
        };

        let result = async {
            let path_and_query = req
                .uri()
                .path_and_query()
                .map_or("/", |pq| pq.as_str())
                .to_string();
            let target = proxy::upstream_uri(upstream, &path_and_query)?;
            let client = self
                .transports
                .client_for(TransportCache::FALLBACK_KEY.to_string(), &TlsOptions::default())
                .await
                .map_err(GatewayError::from)?;
            proxy::forward(client.as_ref(), req, target, ctx.client_addr, self.name()).await
        }
        .await;

        handled(self.name(), result)
    }
}

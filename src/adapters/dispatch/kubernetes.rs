use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use eyre::Result;
use hyper::{Request, header};

use super::handled;
use crate::{
    adapters::{proxy, transport_cache::TransportCache},
    config::models::KubernetesConfig,
    core::{context::RequestContext, error::GatewayError, routing::TlsOptions},
    ports::dispatcher::{Dispatch, Dispatcher},
};

/// Forwards local native API requests to the orchestration API server.
///
/// The caller's credential never reaches the API server; the gateway presents its own
/// bearer token instead, and identity travels through impersonation upstream of us.
pub struct KubernetesDispatcher {
    endpoint: Option<String>,
    bearer_token: Option<String>,
    tls: TlsOptions,
    transports: Arc<TransportCache>,
}

impl KubernetesDispatcher {
    pub fn new(config: &KubernetesConfig, transports: Arc<TransportCache>) -> Result<Self> {
        Ok(Self {
            endpoint: config.endpoint.clone(),
            bearer_token: config.resolve_bearer_token()?,
            tls: config.tls_options()?,
            transports,
        })
    }
}

#[async_trait]
impl Dispatcher for KubernetesDispatcher {
    fn name(&self) -> &'static str {
        "kubernetes"
    }

    async fn dispatch(&self, mut req: Request<Body>, ctx: &RequestContext) -> Dispatch {
        if !ctx.info.is_kubernetes_request || !ctx.info.is_local() {
            return Dispatch::Declined(req);
        }
        let Some(endpoint) = &self.endpoint else {
            return Dispatch::Declined(req);
        };

        let result = async {
            let headers = req.headers_mut();
            headers.remove(header::AUTHORIZATION);
            if let Some(token) = &self.bearer_token {
                proxy::set_bearer_token(headers, token)?;
            }

            let path_and_query = req
                .uri()
                .path_and_query()
                .map_or("/", |pq| pq.as_str())
                .to_string();
            let target = proxy::upstream_uri(endpoint, &path_and_query)?;
            let client = self
                .transports
                .client_for(TransportCache::KUBERNETES_KEY.to_string(), &self.tls)
                .await
                .map_err(GatewayError::from)?;
            proxy::forward(client.as_ref(), req, target, ctx.client_addr, self.name()).await
        }
        .await;

        handled(self.name(), result)
    }
}

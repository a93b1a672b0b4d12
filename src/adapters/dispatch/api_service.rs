use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use hyper::Request;

use super::{Selection, handled, is_extension_request, select};
use crate::{
    adapters::{proxy, transport_cache::TransportCache},
    core::{context::RequestContext, error::GatewayError, routing::ApiServiceRoute},
    ports::{
        dispatcher::{Dispatch, Dispatcher},
        route_store::RouteStore,
    },
};

/// Serves whole `(group, version)` API groups from extension backends.
pub struct ApiServiceDispatcher {
    store: Arc<dyn RouteStore>,
    transports: Arc<TransportCache>,
}

impl ApiServiceDispatcher {
    pub fn new(store: Arc<dyn RouteStore>, transports: Arc<TransportCache>) -> Self {
        Self { store, transports }
    }

    async fn forward(
        &self,
        route: ApiServiceRoute,
        req: Request<Body>,
        ctx: &RequestContext,
    ) -> Result<hyper::Response<Body>, GatewayError> {
        let base = route
            .endpoint
            .raw_url()
            .ok_or_else(|| GatewayError::RouteUnavailable(route.name.clone()))?;
        let path_and_query = req
            .uri()
            .path_and_query()
            .map_or("/", |pq| pq.as_str())
            .to_string();
        let target = proxy::upstream_uri(&base, &path_and_query)?;
        let client = self
            .transports
            .client_for(
                TransportCache::api_service_key(&route.name),
                &route.endpoint.tls_options(),
            )
            .await?;
        tracing::debug!(route = %route.name, upstream = %target, "Dispatching to API service");
        proxy::forward(client.as_ref(), req, target, ctx.client_addr, self.name()).await
    }
}

#[async_trait]
impl Dispatcher for ApiServiceDispatcher {
    fn name(&self) -> &'static str {
        "api_service"
    }

    async fn dispatch(&self, req: Request<Body>, ctx: &RequestContext) -> Dispatch {
        let info = &ctx.info;
        if !is_extension_request(info) || !info.is_resource_request {
            return Dispatch::Declined(req);
        }

        let routes = match self.store.list_api_services() {
            Ok(routes) => routes,
            Err(e) => return handled(self.name(), Err(e.into())),
        };
        let mut candidates: Vec<ApiServiceRoute> = routes
            .into_iter()
            .filter(|r| r.group == info.api_group && r.version == info.api_version)
            .collect();
        candidates.sort_by(|a, b| a.name.cmp(&b.name));

        match select(candidates, |r| r.state, |r| r.name.as_str()) {
            Selection::Found(route) => handled(self.name(), self.forward(route, req, ctx).await),
            Selection::Unavailable(name) => {
                handled(self.name(), Err(GatewayError::RouteUnavailable(name)))
            }
            Selection::NoMatch => Dispatch::Declined(req),
        }
    }
}

//! Dispatchers and the chain that evaluates them in order.
pub mod api_service;
pub mod fallback;
pub mod js_bundle;
pub mod kubernetes;
pub mod multicluster;
pub mod reverse_proxy;

use std::sync::Arc;

use async_trait::async_trait;
use axum::{body::Body, response::IntoResponse};
use eyre::WrapErr;
use hyper::{Request, Response};

pub use api_service::ApiServiceDispatcher;
pub use fallback::FallbackDispatcher;
pub use js_bundle::JsBundleDispatcher;
pub use kubernetes::KubernetesDispatcher;
pub use multicluster::MultiClusterDispatcher;
pub use reverse_proxy::ReverseProxyDispatcher;

use crate::{
    adapters::{
        filter_chain::{Filter, Next},
        snapshot_store::SnapshotStore,
        transport_cache::TransportCache,
    },
    config::models::GatewayConfig,
    core::{
        context::RequestContext,
        error::{GatewayError, GatewayResult},
        request_info::{RequestInfo, RequestInfoResolver},
        routing::Availability,
    },
    metrics,
    ports::dispatcher::{Dispatch, Dispatcher},
};

/// Extension routes only see local, non-native requests.
pub(crate) fn is_extension_request(info: &RequestInfo) -> bool {
    !info.is_kubernetes_request && info.is_local()
}

/// Turn a dispatcher outcome into `Handled`, rendering errors as `Status` responses.
pub(crate) fn handled(dispatcher: &'static str, result: GatewayResult<Response<Body>>) -> Dispatch {
    match result {
        Ok(response) => Dispatch::Handled(response),
        Err(e) => {
            tracing::warn!(dispatcher, error = %e, status = e.status_code().as_u16(), "Dispatch failed");
            Dispatch::Handled(e.into_response())
        }
    }
}

/// Result of picking a route among the ones whose matcher accepted the request.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Selection<T> {
    Found(T),
    /// Only routes that are not available matched; carries the first one's name.
    Unavailable(String),
    NoMatch,
}

/// Pick the first available route of an already ordered candidate list.
pub(crate) fn select<T>(
    candidates: Vec<T>,
    state: impl Fn(&T) -> Availability,
    name: impl Fn(&T) -> &str,
) -> Selection<T> {
    let mut unavailable = None;
    for candidate in candidates {
        if state(&candidate).is_available() {
            return Selection::Found(candidate);
        }
        if unavailable.is_none() {
            unavailable = Some(name(&candidate).to_string());
        }
    }
    match unavailable {
        Some(name) => Selection::Unavailable(name),
        None => Selection::NoMatch,
    }
}

/// Offers the request to each dispatcher in order. A dispatcher may reroute once, which
/// restarts the walk with fresh routing coordinates. When all decline, the request moves
/// on to the business endpoint.
pub struct DispatchChain {
    dispatchers: Vec<Arc<dyn Dispatcher>>,
}

impl DispatchChain {
    pub fn new(dispatchers: Vec<Arc<dyn Dispatcher>>) -> Self {
        Self { dispatchers }
    }

    /// The gateway's dispatchers in their fixed order: kubernetes, api service, reverse
    /// proxy, js bundle, multicluster, fallback.
    pub fn from_config(
        config: &GatewayConfig,
        snapshots: Arc<SnapshotStore>,
        resolver: &RequestInfoResolver,
        transports: Arc<TransportCache>,
    ) -> eyre::Result<Self> {
        let dispatchers: Vec<Arc<dyn Dispatcher>> = vec![
            Arc::new(
                KubernetesDispatcher::new(&config.kubernetes, transports.clone())
                    .wrap_err("Failed to configure the Kubernetes dispatcher")?,
            ),
            Arc::new(ApiServiceDispatcher::new(snapshots.clone(), transports.clone())),
            Arc::new(ReverseProxyDispatcher::new(snapshots.clone(), transports.clone())),
            Arc::new(JsBundleDispatcher::new(snapshots.clone(), transports.clone())),
            Arc::new(MultiClusterDispatcher::new(
                &config.multicluster,
                snapshots,
                Arc::new(resolver.clone()),
                transports.clone(),
            )),
            Arc::new(FallbackDispatcher::new(config.fallback.upstream.clone(), transports)),
        ];
        Ok(Self::new(dispatchers))
    }

    pub fn dispatcher_names(&self) -> Vec<&'static str> {
        self.dispatchers.iter().map(|d| d.name()).collect()
    }

    pub async fn dispatch(&self, mut req: Request<Body>, mut ctx: RequestContext) -> (Dispatch, RequestContext) {
        let mut rerouted = false;
        'walk: loop {
            for dispatcher in &self.dispatchers {
                match dispatcher.dispatch(req, &ctx).await {
                    Dispatch::Handled(response) => {
                        metrics::increment_dispatch(dispatcher.name(), "handled");
                        return (Dispatch::Handled(response), ctx);
                    }
                    Dispatch::Declined(returned) => {
                        req = returned;
                    }
                    Dispatch::Reroute(returned, info) => {
                        metrics::increment_dispatch(dispatcher.name(), "reroute");
                        if rerouted {
                            tracing::error!(dispatcher = dispatcher.name(), "Request rerouted twice");
                            let error = GatewayError::Internal("request rerouted more than once".into());
                            return (Dispatch::Handled(error.into_response()), ctx);
                        }
                        tracing::debug!(dispatcher = dispatcher.name(), path = %info.path, "Rerouting request");
                        rerouted = true;
                        req = returned;
                        ctx = ctx.rerouted(info);
                        continue 'walk;
                    }
                }
            }
            return (Dispatch::Declined(req), ctx);
        }
    }
}

#[async_trait]
impl Filter for DispatchChain {
    fn name(&self) -> &'static str {
        "dispatch"
    }

    async fn filter(&self, req: Request<Body>, ctx: RequestContext, next: Next<'_>) -> Response<Body> {
        match self.dispatch(req, ctx).await {
            (Dispatch::Handled(response), _) => response,
            (Dispatch::Declined(req), ctx) | (Dispatch::Reroute(req, _), ctx) => next.run(req, ctx).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use hyper::{Method, StatusCode};

    use super::*;
    use crate::core::request_info::RequestInfoResolver;

    /// Reroutes every request for `/from` to `/to`.
    struct Rerouter;

    #[async_trait]
    impl Dispatcher for Rerouter {
        fn name(&self) -> &'static str {
            "rerouter"
        }

        async fn dispatch(&self, mut req: Request<Body>, _ctx: &RequestContext) -> Dispatch {
            if req.uri().path() != "/from" {
                return Dispatch::Declined(req);
            }
            *req.uri_mut() = "/to".parse().unwrap();
            let info = RequestInfoResolver::default()
                .resolve(req.method(), req.uri())
                .unwrap();
            Dispatch::Reroute(req, Arc::new(info))
        }
    }

    /// Handles `/to`, echoing the path it saw in its context.
    struct Terminal;

    #[async_trait]
    impl Dispatcher for Terminal {
        fn name(&self) -> &'static str {
            "terminal"
        }

        async fn dispatch(&self, req: Request<Body>, ctx: &RequestContext) -> Dispatch {
            if ctx.info.path == "/to" {
                Dispatch::Handled(Response::new(Body::from(ctx.info.path.clone())))
            } else {
                Dispatch::Declined(req)
            }
        }
    }

    /// Always reroutes, to prove the chain gives up after one reroute.
    struct Looper;

    #[async_trait]
    impl Dispatcher for Looper {
        fn name(&self) -> &'static str {
            "looper"
        }

        async fn dispatch(&self, req: Request<Body>, ctx: &RequestContext) -> Dispatch {
            Dispatch::Reroute(req, ctx.info.clone())
        }
    }

    fn ctx_for(path: &str) -> RequestContext {
        let info = RequestInfoResolver::default()
            .resolve(&Method::GET, &path.parse().unwrap())
            .unwrap();
        RequestContext::new(info, None)
    }

    fn get(path: &str) -> Request<Body> {
        Request::builder().uri(path).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_reroute_restarts_with_new_info() {
        let chain = DispatchChain::new(vec![Arc::new(Terminal), Arc::new(Rerouter)]);
        let (outcome, ctx) = chain.dispatch(get("/from"), ctx_for("/from")).await;
        assert!(matches!(outcome, Dispatch::Handled(_)));
        assert_eq!(ctx.info.path, "/to");
    }

    #[tokio::test]
    async fn test_second_reroute_is_refused() {
        let chain = DispatchChain::new(vec![Arc::new(Looper)]);
        match chain.dispatch(get("/x"), ctx_for("/x")).await {
            (Dispatch::Handled(response), _) => {
                assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR)
            }
            _ => panic!("expected an error response"),
        }
    }

    #[tokio::test]
    async fn test_all_declined_hands_request_back() {
        let chain = DispatchChain::new(vec![Arc::new(Terminal)]);
        let (outcome, _) = chain.dispatch(get("/elsewhere"), ctx_for("/elsewhere")).await;
        assert!(matches!(outcome, Dispatch::Declined(req) if req.uri().path() == "/elsewhere"));
    }

    #[test]
    fn test_select_prefers_first_available() {
        let routes = vec![
            ("a", Availability::Unavailable),
            ("b", Availability::Available),
            ("c", Availability::Available),
        ];
        assert_eq!(select(routes, |r| r.1, |r| r.0), Selection::Found(("b", Availability::Available)));

        let routes = vec![("a", Availability::Unavailable)];
        assert_eq!(select(routes, |r| r.1, |r| r.0), Selection::Unavailable("a".to_string()));

        let routes: Vec<(&str, Availability)> = Vec::new();
        assert_eq!(select(routes, |r| r.1, |r| r.0), Selection::NoMatch);
    }
}

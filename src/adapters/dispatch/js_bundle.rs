use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use hyper::{Request, Response, StatusCode, header, header::HeaderValue};

use super::{Selection, handled, is_extension_request, select};
use crate::{
    adapters::transport_cache::TransportCache,
    core::{
        context::RequestContext,
        error::{GatewayError, GatewayResult},
        routing::JsBundleRoute,
    },
    ports::{
        dispatcher::{Dispatch, Dispatcher},
        http_client::HttpClient,
        route_store::RouteStore,
    },
};

fn javascript_content_type() -> HeaderValue {
    HeaderValue::from_static("application/javascript; charset=utf-8")
}

/// Publishes extension UI bundles under fixed paths.
pub struct JsBundleDispatcher {
    store: Arc<dyn RouteStore>,
    transports: Arc<TransportCache>,
}

impl JsBundleDispatcher {
    pub fn new(store: Arc<dyn RouteStore>, transports: Arc<TransportCache>) -> Self {
        Self { store, transports }
    }

    async fn serve(&self, route: JsBundleRoute) -> GatewayResult<Response<Body>> {
        let source = &route.source;
        if source.populated_count() > 1 {
            tracing::warn!(
                bundle = %route.name,
                "Bundle has more than one source; using raw, then config, then secret, then remote"
            );
        }

        if let Some(raw) = &source.raw {
            return Ok(javascript(raw.clone()));
        }
        if let Some(reference) = &source.config_ref {
            return match self.store.config_value(reference)? {
                Some(value) => Ok(javascript(value)),
                None => Err(GatewayError::NotFound(format!("bundle config {reference}"))),
            };
        }
        if let Some(reference) = &source.secret_ref {
            return match self.store.secret_value(reference)? {
                Some(value) => Ok(javascript(value)),
                None => Err(GatewayError::NotFound(format!("bundle secret {reference}"))),
            };
        }
        if let Some(remote) = &source.remote {
            let url = remote
                .raw_url()
                .ok_or_else(|| GatewayError::RouteUnavailable(route.name.clone()))?;
            let client = self
                .transports
                .client_for(TransportCache::js_bundle_key(&route.name), &remote.tls_options())
                .await?;
            let fetch = Request::builder()
                .method("GET")
                .uri(&url)
                .body(Body::empty())
                .map_err(|e| GatewayError::Internal(format!("invalid bundle url {url}: {e}")))?;
            // Only the bundle bytes are fetched; no caller headers travel upstream.
            let mut response = client.send_request(fetch).await?;
            if response.status() != StatusCode::OK {
                return Err(GatewayError::Upstream(format!(
                    "remote bundle {url} answered {}",
                    response.status()
                )));
            }
            response
                .headers_mut()
                .insert(header::CONTENT_TYPE, javascript_content_type());
            return Ok(response);
        }

        Err(GatewayError::NotFound(format!("bundle {} has no source", route.name)))
    }
}

fn javascript(body: String) -> Response<Body> {
    let mut response = Response::new(Body::from(body));
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, javascript_content_type());
    response
}

#[async_trait]
impl Dispatcher for JsBundleDispatcher {
    fn name(&self) -> &'static str {
        "js_bundle"
    }

    async fn dispatch(&self, req: Request<Body>, ctx: &RequestContext) -> Dispatch {
        if !is_extension_request(&ctx.info) {
            return Dispatch::Declined(req);
        }

        let routes = match self.store.list_js_bundles() {
            Ok(routes) => routes,
            Err(e) => return handled(self.name(), Err(e.into())),
        };
        let mut candidates: Vec<JsBundleRoute> = routes
            .into_iter()
            .filter(|r| r.link == req.uri().path())
            .collect();
        candidates.sort_by(|a, b| a.name.cmp(&b.name));

        match select(candidates, |r| r.state, |r| r.name.as_str()) {
            Selection::Found(route) => {
                tracing::debug!(bundle = %route.name, link = %route.link, "Serving JS bundle");
                handled(self.name(), self.serve(route).await)
            }
            Selection::Unavailable(name) => {
                handled(self.name(), Err(GatewayError::RouteUnavailable(name)))
            }
            Selection::NoMatch => Dispatch::Declined(req),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use http_body_util::BodyExt;
    use hyper::Method;

    use super::*;
    use crate::{
        adapters::snapshot_store::SnapshotStore,
        core::{
            request_info::RequestInfoResolver,
            routing::{Availability, BundleSource, ValueReference},
        },
        ports::route_store::RoutingSnapshot,
    };

    fn reference() -> ValueReference {
        ValueReference {
            namespace: "extension-devops".to_string(),
            name: "devops-bundle".to_string(),
            key: "index.js".to_string(),
        }
    }

    fn dispatcher(bundles: Vec<JsBundleRoute>) -> JsBundleDispatcher {
        let config_values = BTreeMap::from([(
            "extension-devops/devops-bundle".to_string(),
            BTreeMap::from([("index.js".to_string(), "from-config".to_string())]),
        )]);
        let store = SnapshotStore::with_snapshot(RoutingSnapshot {
            js_bundles: bundles,
            config_values,
            ..RoutingSnapshot::default()
        });
        JsBundleDispatcher::new(Arc::new(store), Arc::new(TransportCache::new()))
    }

    async fn fetch(dispatcher: &JsBundleDispatcher, path: &str) -> Option<(StatusCode, String)> {
        let uri = path.parse().unwrap();
        let info = RequestInfoResolver::default().resolve(&Method::GET, &uri).unwrap();
        let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
        match dispatcher.dispatch(req, &RequestContext::new(info, None)).await {
            Dispatch::Handled(response) => {
                let status = response.status();
                let body = response.into_body().collect().await.unwrap().to_bytes();
                Some((status, String::from_utf8(body.to_vec()).unwrap()))
            }
            _ => None,
        }
    }

    fn bundle(source: BundleSource, state: Availability) -> JsBundleRoute {
        JsBundleRoute {
            name: "devops".to_string(),
            link: "/dist/devops/index.js".to_string(),
            source,
            state,
        }
    }

    #[tokio::test]
    async fn test_raw_wins_over_config() {
        let source = BundleSource {
            raw: Some("from-raw".to_string()),
            config_ref: Some(reference()),
            ..BundleSource::default()
        };
        let dispatcher = dispatcher(vec![bundle(source, Availability::Available)]);
        assert_eq!(
            fetch(&dispatcher, "/dist/devops/index.js").await,
            Some((StatusCode::OK, "from-raw".to_string()))
        );
    }

    #[tokio::test]
    async fn test_config_reference_and_missing_secret() {
        let source = BundleSource {
            config_ref: Some(reference()),
            ..BundleSource::default()
        };
        let dispatcher = dispatcher(vec![bundle(source, Availability::Available)]);
        assert_eq!(
            fetch(&dispatcher, "/dist/devops/index.js").await,
            Some((StatusCode::OK, "from-config".to_string()))
        );

        let source = BundleSource {
            secret_ref: Some(reference()),
            ..BundleSource::default()
        };
        let dispatcher = self::dispatcher(vec![bundle(source, Availability::Available)]);
        let (status, _) = fetch(&dispatcher, "/dist/devops/index.js").await.unwrap();
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_link_is_exact_and_state_gated() {
        let source = BundleSource {
            raw: Some("x".to_string()),
            ..BundleSource::default()
        };
        let dispatcher = dispatcher(vec![bundle(source, Availability::Unavailable)]);
        assert_eq!(fetch(&dispatcher, "/dist/devops/index.js.map").await, None);
        let (status, _) = fetch(&dispatcher, "/dist/devops/index.js").await.unwrap();
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }
}

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use hyper::{HeaderMap, Request, Response, header, header::HeaderValue};

use super::{Selection, handled, is_extension_request, select};
use crate::{
    adapters::{proxy, transport_cache::TransportCache},
    core::{
        context::{RequestContext, UserInfo},
        directive::{Replacer, RewriteTarget, RouteMatcher},
        error::{GatewayError, GatewayResult},
        routing::ReverseProxyRoute,
    },
    ports::{
        dispatcher::{Dispatch, Dispatcher},
        route_store::RouteStore,
    },
};

const REMOTE_USER: &str = "x-remote-user";
const REMOTE_GROUP: &str = "x-remote-group";
const REMOTE_EXTRA_PREFIX: &str = "x-remote-extra-";

/// Proxies requests matching a `(method, path)` pattern to extension backends, applying
/// the route's directives on the way up and down.
pub struct ReverseProxyDispatcher {
    store: Arc<dyn RouteStore>,
    transports: Arc<TransportCache>,
}

impl ReverseProxyDispatcher {
    pub fn new(store: Arc<dyn RouteStore>, transports: Arc<TransportCache>) -> Self {
        Self { store, transports }
    }

    async fn forward(
        &self,
        route: ReverseProxyRoute,
        mut req: Request<Body>,
        ctx: &RequestContext,
    ) -> GatewayResult<Response<Body>> {
        let directives = route.directives.compile()?;
        let replacer = Replacer::for_request(req.method(), req.uri(), req.headers())
            .strict(directives.strict_placeholders);

        let mut target = RewriteTarget::new(req.method().clone(), req.uri());
        if directives.rewrite.apply(&mut target, &replacer)? {
            tracing::debug!(
                route = %route.name,
                method = %target.method,
                path_and_query = %target.path_and_query(),
                "Request rewritten"
            );
        }
        *req.method_mut() = target.method.clone();

        directives.header_up.apply(req.headers_mut(), &replacer)?;
        if directives.auth_proxy {
            assert_identity(req.headers_mut(), ctx.user.as_deref());
        }

        let base = route
            .upstream
            .raw_url()
            .ok_or_else(|| GatewayError::RouteUnavailable(route.name.clone()))?;
        let upstream = proxy::upstream_uri(&base, &target.path_and_query())?;
        let client = self
            .transports
            .client_for(
                TransportCache::reverse_proxy_key(&route.name),
                &route.upstream.tls_options(),
            )
            .await?;
        tracing::debug!(route = %route.name, %upstream, "Dispatching to reverse proxy");

        let mut response =
            proxy::forward(client.as_ref(), req, upstream, ctx.client_addr, self.name()).await?;
        directives
            .header_down
            .apply(response.headers_mut(), &replacer)?;
        Ok(response)
    }
}

/// Authenticating-proxy headers. Whatever the caller sent in these slots is discarded.
fn assert_identity(headers: &mut HeaderMap, user: Option<&UserInfo>) {
    headers.remove(header::AUTHORIZATION);
    let spoofed: Vec<_> = headers
        .keys()
        .filter(|name| {
            let name = name.as_str();
            name == REMOTE_USER || name == REMOTE_GROUP || name.starts_with(REMOTE_EXTRA_PREFIX)
        })
        .cloned()
        .collect();
    for name in spoofed {
        headers.remove(name);
    }

    let Some(user) = user else {
        return;
    };
    if let Ok(value) = HeaderValue::from_str(&user.username) {
        headers.insert(REMOTE_USER, value);
    }
    for group in &user.groups {
        if let Ok(value) = HeaderValue::from_str(group) {
            headers.append(REMOTE_GROUP, value);
        }
    }
    for (key, values) in &user.extra {
        let name = format!(
            "{REMOTE_EXTRA_PREFIX}{}",
            urlencoding::encode(&key.to_ascii_lowercase())
        );
        let Ok(name) = header::HeaderName::from_bytes(name.as_bytes()) else {
            continue;
        };
        for value in values {
            if let Ok(value) = HeaderValue::from_str(value) {
                headers.append(name.clone(), value);
            }
        }
    }
}

#[async_trait]
impl Dispatcher for ReverseProxyDispatcher {
    fn name(&self) -> &'static str {
        "reverse_proxy"
    }

    async fn dispatch(&self, req: Request<Body>, ctx: &RequestContext) -> Dispatch {
        if !is_extension_request(&ctx.info) {
            return Dispatch::Declined(req);
        }

        let routes = match self.store.list_reverse_proxies() {
            Ok(routes) => routes,
            Err(e) => return handled(self.name(), Err(e.into())),
        };

        let path = req.uri().path();
        let mut candidates: Vec<((usize, bool), ReverseProxyRoute)> = routes
            .into_iter()
            .filter_map(|route| {
                match RouteMatcher::new(&route.matcher.method, &route.matcher.path) {
                    Ok(matcher) if matcher.matches(req.method(), path) => {
                        Some((matcher.specificity(), route))
                    }
                    Ok(_) => None,
                    Err(e) => {
                        tracing::warn!(route = %route.name, error = %e, "Skipping route with invalid matcher");
                        None
                    }
                }
            })
            .collect();
        // most specific first, then by name
        candidates.sort_by(|(a_spec, a), (b_spec, b)| {
            b_spec.cmp(a_spec).then_with(|| a.name.cmp(&b.name))
        });
        let candidates = candidates.into_iter().map(|(_, route)| route).collect();

        match select(candidates, |r: &ReverseProxyRoute| r.state, |r| r.name.as_str()) {
            Selection::Found(route) => handled(self.name(), self.forward(route, req, ctx).await),
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

    use super::*;

    #[test]
    fn test_assert_identity_replaces_spoofed_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer t"));
        headers.insert(REMOTE_USER, HeaderValue::from_static("root"));
        headers.insert("x-remote-extra-scope", HeaderValue::from_static("all"));

        let user = UserInfo {
            username: "alice".to_string(),
            uid: "1".to_string(),
            groups: vec!["dev".to_string(), "ops".to_string()],
            extra: BTreeMap::from([("Acme.io/Team".to_string(), vec!["blue".to_string()])]),
        };
        assert_identity(&mut headers, Some(&user));

        assert!(!headers.contains_key(header::AUTHORIZATION));
        assert_eq!(headers[REMOTE_USER], "alice");
        let groups: Vec<_> = headers.get_all(REMOTE_GROUP).iter().collect();
        assert_eq!(groups, ["dev", "ops"]);
        assert!(!headers.contains_key("x-remote-extra-scope"));
        assert_eq!(headers["x-remote-extra-acme.io%2fteam"], "blue");
    }

    #[test]
    fn test_assert_identity_for_anonymous_only_strips() {
        let mut headers = HeaderMap::new();
        headers.insert(REMOTE_GROUP, HeaderValue::from_static("system:masters"));
        assert_identity(&mut headers, None);
        assert!(headers.is_empty());
    }
}

//! The fixed request pipeline.
//!
//! ```text
//! request-info → logging/metrics → authentication → authorization → audit → dispatch → endpoint
//! ```
//!
//! Every stage is always present. A stage without a configured backend (no authenticator,
//! auditing disabled) simply passes the request on.
use std::{net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use axum::{body::Body, response::IntoResponse};
use hyper::{HeaderMap, Request, Response, header};
use tracing::Instrument;

use crate::{
    adapters::{audit::AuditFilter, dispatch::DispatchChain, proxy::SIDE_AUTHORIZATION},
    core::{
        context::RequestContext,
        error::GatewayError,
        request_info::RequestInfoResolver,
    },
    metrics::{self, RequestTimer},
    ports::auth::{Authenticator, Authorizer, Decision},
};

/// One stage of the pipeline.
#[async_trait]
pub trait Filter: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn filter(&self, req: Request<Body>, ctx: RequestContext, next: Next<'_>)
    -> Response<Body>;
}

/// What runs when every dispatcher declined.
#[async_trait]
pub trait BusinessHandler: Send + Sync + 'static {
    async fn call(&self, req: Request<Body>, ctx: &RequestContext) -> Response<Body>;
}

/// Answers `404` in the `Status` format.
pub struct NotFoundHandler;

#[async_trait]
impl BusinessHandler for NotFoundHandler {
    async fn call(&self, req: Request<Body>, _ctx: &RequestContext) -> Response<Body> {
        GatewayError::NotFound(format!("no route for {}", req.uri().path())).into_response()
    }
}

/// The remainder of the pipeline after the current filter.
pub struct Next<'a> {
    rest: &'a [Arc<dyn Filter>],
    endpoint: &'a dyn BusinessHandler,
}

impl Next<'_> {
    pub async fn run(self, req: Request<Body>, ctx: RequestContext) -> Response<Body> {
        match self.rest.split_first() {
            Some((filter, rest)) => {
                let next = Next {
                    rest,
                    endpoint: self.endpoint,
                };
                filter.filter(req, ctx, next).await
            }
            None => self.endpoint.call(req, &ctx).await,
        }
    }
}

pub struct FilterChain {
    resolver: RequestInfoResolver,
    filters: Vec<Arc<dyn Filter>>,
    endpoint: Arc<dyn BusinessHandler>,
}

impl FilterChain {
    pub fn builder(resolver: RequestInfoResolver, dispatch: DispatchChain) -> FilterChainBuilder {
        FilterChainBuilder {
            resolver,
            dispatch,
            authenticator: None,
            authorizer: None,
            audit: None,
            endpoint: None,
        }
    }

    pub fn filter_names(&self) -> Vec<&'static str> {
        self.filters.iter().map(|f| f.name()).collect()
    }

    /// Classify the request and run it through every stage.
    pub async fn serve(&self, req: Request<Body>, client_addr: Option<SocketAddr>) -> Response<Body> {
        let info = match self.resolver.resolve(req.method(), req.uri()) {
            Ok(info) => info,
            Err(e) => {
                tracing::warn!(path = %req.uri().path(), error = %e, "Failed to resolve request info");
                return GatewayError::from(e).into_response();
            }
        };
        let ctx = RequestContext::new(info, client_addr);
        Next {
            rest: &self.filters,
            endpoint: self.endpoint.as_ref(),
        }
        .run(req, ctx)
        .await
    }
}

pub struct FilterChainBuilder {
    resolver: RequestInfoResolver,
    dispatch: DispatchChain,
    authenticator: Option<Arc<dyn Authenticator>>,
    authorizer: Option<Arc<dyn Authorizer>>,
    audit: Option<AuditFilter>,
    endpoint: Option<Arc<dyn BusinessHandler>>,
}

impl FilterChainBuilder {
    pub fn authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    pub fn authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = Some(authorizer);
        self
    }

    pub fn audit(mut self, audit: AuditFilter) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn endpoint(mut self, endpoint: Arc<dyn BusinessHandler>) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    pub fn build(self) -> FilterChain {
        let filters: Vec<Arc<dyn Filter>> = vec![
            Arc::new(LoggingFilter),
            Arc::new(AuthenticationFilter {
                authenticator: self.authenticator,
            }),
            Arc::new(AuthorizationFilter {
                authorizer: self.authorizer,
            }),
            Arc::new(self.audit.unwrap_or_else(AuditFilter::disabled)),
            Arc::new(self.dispatch),
        ];
        FilterChain {
            resolver: self.resolver,
            filters,
            endpoint: self.endpoint.unwrap_or_else(|| Arc::new(NotFoundHandler)),
        }
    }
}

/// Request span, access log line and request metrics.
struct LoggingFilter;

#[async_trait]
impl Filter for LoggingFilter {
    fn name(&self) -> &'static str {
        "logging"
    }

    async fn filter(&self, req: Request<Body>, ctx: RequestContext, next: Next<'_>) -> Response<Body> {
        let method = req.method().clone();
        let mut timer = RequestTimer::new(method.as_str());
        timer.set_verb(&ctx.info.verb);

        let span = tracing::info_span!(
            "request",
            http.method = %method,
            http.path = %ctx.info.path,
            verb = %ctx.info.verb,
            cluster = %ctx.info.cluster,
            http.status_code = tracing::field::Empty,
        );
        let verb = ctx.info.verb.clone();
        let start = std::time::Instant::now();

        let response = next.run(req, ctx).instrument(span.clone()).await;

        let status = response.status().as_u16();
        span.record("http.status_code", status);
        metrics::increment_request_total(method.as_str(), &verb, status);
        span.in_scope(|| {
            tracing::info!(status, latency = ?start.elapsed(), "Request completed");
        });
        response
    }
}

/// Restores a forwarded credential, then resolves the caller.
struct AuthenticationFilter {
    authenticator: Option<Arc<dyn Authenticator>>,
}

/// Member-side half of the multi-cluster token hand-off: the control plane moved the
/// caller's `Authorization` into the side header because its own slot carries the
/// gateway's credential on the hop.
pub fn restore_side_authorization(headers: &mut HeaderMap) {
    let Some(side) = headers.remove(SIDE_AUTHORIZATION) else {
        return;
    };
    if !headers.contains_key(header::AUTHORIZATION) {
        headers.insert(header::AUTHORIZATION, side);
    }
}

#[async_trait]
impl Filter for AuthenticationFilter {
    fn name(&self) -> &'static str {
        "authentication"
    }

    async fn filter(&self, mut req: Request<Body>, ctx: RequestContext, next: Next<'_>) -> Response<Body> {
        restore_side_authorization(req.headers_mut());

        let Some(authenticator) = &self.authenticator else {
            return next.run(req, ctx).await;
        };

        let (parts, body) = req.into_parts();
        match authenticator.authenticate(&parts).await {
            Ok(Some(user)) => {
                tracing::debug!(user = %user.username, "Authenticated");
                next.run(Request::from_parts(parts, body), ctx.with_user(user))
                    .await
            }
            Ok(None) => next.run(Request::from_parts(parts, body), ctx).await,
            Err(e) => {
                tracing::info!(error = %e, "Authentication failed");
                GatewayError::Unauthorized(e.to_string()).into_response()
            }
        }
    }
}

struct AuthorizationFilter {
    authorizer: Option<Arc<dyn Authorizer>>,
}

#[async_trait]
impl Filter for AuthorizationFilter {
    fn name(&self) -> &'static str {
        "authorization"
    }

    async fn filter(&self, req: Request<Body>, ctx: RequestContext, next: Next<'_>) -> Response<Body> {
        if let Some(authorizer) = &self.authorizer {
            if let Decision::Deny(reason) = authorizer.authorize(ctx.user.as_deref(), &ctx.info).await {
                tracing::info!(user = ?ctx.username(), verb = %ctx.info.verb, %reason, "Request denied");
                return GatewayError::Forbidden(reason).into_response();
            }
        }
        next.run(req, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use http_body_util::BodyExt;
    use http::request::Parts;
    use hyper::{Method, StatusCode};

    use super::*;
    use crate::{
        core::{context::UserInfo, request_info::RequestInfo},
        ports::auth::AuthError,
    };

    struct EchoUser;

    #[async_trait]
    impl BusinessHandler for EchoUser {
        async fn call(&self, req: Request<Body>, ctx: &RequestContext) -> Response<Body> {
            let auth = req
                .headers()
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("-")
                .to_string();
            let user = ctx.username().unwrap_or("anonymous");
            Response::new(Body::from(format!("{user} {auth} {}", ctx.info.verb)))
        }
    }

    struct HeaderAuthenticator;

    #[async_trait]
    impl Authenticator for HeaderAuthenticator {
        async fn authenticate(&self, parts: &Parts) -> Result<Option<UserInfo>, AuthError> {
            match parts.headers.get(header::AUTHORIZATION).map(|v| v.as_bytes()) {
                Some(b"Bearer admin") => Ok(Some(UserInfo::named("admin"))),
                Some(_) => Err(AuthError::InvalidCredentials("unknown token".into())),
                None => Ok(None),
            }
        }
    }

    struct DenyDeletes;

    #[async_trait]
    impl Authorizer for DenyDeletes {
        async fn authorize(&self, _user: Option<&UserInfo>, info: &RequestInfo) -> Decision {
            if info.verb == "delete" {
                Decision::Deny("deletes are not allowed".into())
            } else {
                Decision::Allow
            }
        }
    }

    fn chain() -> FilterChain {
        FilterChain::builder(RequestInfoResolver::default(), DispatchChain::new(Vec::new()))
            .authenticator(Arc::new(HeaderAuthenticator))
            .authorizer(Arc::new(DenyDeletes))
            .endpoint(Arc::new(EchoUser))
            .build()
    }

    async fn body_string(response: Response<Body>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn request(method: Method, uri: &str) -> http::request::Builder {
        Request::builder().method(method).uri(uri)
    }

    #[test]
    fn test_stage_order_is_fixed() {
        assert_eq!(
            chain().filter_names(),
            ["logging", "authentication", "authorization", "audit", "dispatch"]
        );
    }

    #[tokio::test]
    async fn test_authenticated_request_reaches_endpoint() {
        let req = request(Method::GET, "/kapis/iam.kubesphere.io/v1beta1/users")
            .header(header::AUTHORIZATION, "Bearer admin")
            .body(Body::empty())
            .unwrap();
        let response = chain().serve(req, None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "admin Bearer admin list");
    }

    #[tokio::test]
    async fn test_side_header_restores_authorization() {
        let req = request(Method::GET, "/api/v1/namespaces")
            .header(SIDE_AUTHORIZATION, "Bearer admin")
            .body(Body::empty())
            .unwrap();
        let response = chain().serve(req, None).await;
        assert_eq!(body_string(response).await, "admin Bearer admin list");
    }

    #[test]
    fn test_side_header_never_overrides_authorization() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer gateway".parse().unwrap());
        headers.insert(SIDE_AUTHORIZATION, "Bearer user".parse().unwrap());
        restore_side_authorization(&mut headers);
        assert_eq!(headers[header::AUTHORIZATION], "Bearer gateway");
        assert!(!headers.contains_key(SIDE_AUTHORIZATION));
    }

    #[tokio::test]
    async fn test_bad_credentials_are_unauthorized() {
        let req = request(Method::GET, "/api/v1/pods")
            .header(header::AUTHORIZATION, "Bearer nobody")
            .body(Body::empty())
            .unwrap();
        let response = chain().serve(req, None).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_denied_request_is_forbidden() {
        let req = request(Method::DELETE, "/api/v1/namespaces/default/pods/web")
            .body(Body::empty())
            .unwrap();
        let response = chain().serve(req, None).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert!(body_string(response).await.contains("deletes are not allowed"));
    }

    #[tokio::test]
    async fn test_malformed_request_is_internal_error() {
        let req = request(Method::GET, "/api/v1/watch").body(Body::empty()).unwrap();
        let response = chain().serve(req, None).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_default_endpoint_is_not_found() {
        let chain = FilterChain::builder(RequestInfoResolver::default(), DispatchChain::new(Vec::new()))
            .build();
        let req = request(Method::GET, "/unknown").body(Body::empty()).unwrap();
        let response = chain.serve(req, None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}

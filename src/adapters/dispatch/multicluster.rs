use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use hyper::{Request, Response, StatusCode, Uri, header};

use super::handled;
use crate::{
    adapters::{
        proxy::{self, SIDE_AUTHORIZATION},
        transport_cache::TransportCache,
    },
    config::models::MultiClusterConfig,
    core::{
        context::RequestContext,
        error::{GatewayError, GatewayResult},
        request_info::RequestInfoResolver,
        routing::{ClusterDescriptor, ConnectionType},
    },
    ports::{
        dispatcher::{Dispatch, Dispatcher},
        route_store::ClusterStore,
    },
};

const HOST_CLUSTER: &str = "host";

/// Routes `/clusters/{name}/...` requests to the named member cluster.
pub struct MultiClusterDispatcher {
    enabled: bool,
    host_cluster_name: Option<String>,
    member_proxy_path: String,
    clusters: Arc<dyn ClusterStore>,
    resolver: Arc<RequestInfoResolver>,
    transports: Arc<TransportCache>,
}

impl MultiClusterDispatcher {
    pub fn new(
        config: &MultiClusterConfig,
        clusters: Arc<dyn ClusterStore>,
        resolver: Arc<RequestInfoResolver>,
        transports: Arc<TransportCache>,
    ) -> Self {
        Self {
            enabled: config.enabled,
            host_cluster_name: config.host_cluster_name.clone(),
            member_proxy_path: config.member_proxy_path.trim_end_matches('/').to_string(),
            clusters,
            resolver,
            transports,
        }
    }

    fn lookup(&self, name: &str) -> GatewayResult<ClusterDescriptor> {
        if let Some(cluster) = self.clusters.get_cluster(name)? {
            return Ok(cluster);
        }
        if name == HOST_CLUSTER {
            if let Some(alias) = &self.host_cluster_name {
                if let Some(cluster) = self.clusters.get_cluster(alias)? {
                    return Ok(cluster);
                }
            }
        }
        Err(GatewayError::ClusterNotFound(name.to_string()))
    }

    async fn forward_to_member(
        &self,
        cluster: ClusterDescriptor,
        mut req: Request<Body>,
        ctx: &RequestContext,
    ) -> GatewayResult<Response<Body>> {
        let connection = &cluster.connection;
        let stripped = strip_cluster_segment(req.uri().path(), &ctx.info.cluster);
        let target = match (&connection.connection_type, &connection.gateway_endpoint) {
            (ConnectionType::Direct, None) => {
                let api_server = connection
                    .kubernetes_api_endpoint
                    .as_deref()
                    .ok_or_else(|| GatewayError::ClusterNotReady(cluster.name.clone()))?;
                let mut path_and_query = format!("{}{stripped}", self.member_proxy_path);
                if let Some(query) = req.uri().query() {
                    path_and_query.push('?');
                    path_and_query.push_str(&rename_dry_run(query));
                }

                let headers = req.headers_mut();
                if let Some(authorization) = headers.remove(header::AUTHORIZATION) {
                    headers.insert(SIDE_AUTHORIZATION, authorization);
                }
                if let Some(token) = &connection.bearer_token {
                    proxy::set_bearer_token(headers, token)?;
                }
                proxy::upstream_uri(api_server, &path_and_query)?
            }
            // the member gateway authenticates the caller itself
            (_, Some(gateway)) => {
                let path_and_query = match req.uri().query() {
                    Some(query) => format!("{stripped}?{query}"),
                    None => stripped,
                };
                proxy::upstream_uri(gateway, &path_and_query)?
            }
            (ConnectionType::Proxy, None) => {
                return Err(GatewayError::ClusterNotReady(cluster.name.clone()));
            }
        };

        let client = self
            .transports
            .client_for(
                TransportCache::cluster_key(&cluster.name),
                &connection.tls_options(),
            )
            .await?;
        tracing::debug!(cluster = %cluster.name, upstream = %target, "Dispatching to member cluster");

        let mut response =
            proxy::forward(client.as_ref(), req, target, ctx.client_addr, self.name()).await?;
        // A 401 here means the gateway's own credential for the member was rejected,
        // which the caller cannot fix by re-authenticating.
        if response.status() == StatusCode::UNAUTHORIZED {
            *response.status_mut() = StatusCode::NETWORK_AUTHENTICATION_REQUIRED;
        }
        Ok(response)
    }

    fn reroute_to_host(&self, mut req: Request<Body>, cluster: &str) -> GatewayResult<Dispatch> {
        let stripped = strip_cluster_segment(req.uri().path(), cluster);
        let path_and_query = match req.uri().query() {
            Some(query) => format!("{stripped}?{query}"),
            None => stripped,
        };
        let uri: Uri = path_and_query
            .parse()
            .map_err(|e| GatewayError::Internal(format!("invalid rerouted uri: {e}")))?;
        *req.uri_mut() = uri;
        let info = self.resolver.resolve(req.method(), req.uri())?;
        Ok(Dispatch::Reroute(req, Arc::new(info)))
    }
}

/// Remove the first `/clusters/{name}` path segment pair.
fn strip_cluster_segment(path: &str, cluster: &str) -> String {
    let needle = format!("/clusters/{cluster}");
    let mut search_from = 0;
    while let Some(found) = path[search_from..].find(&needle) {
        let start = search_from + found;
        let end = start + needle.len();
        if end == path.len() || path.as_bytes()[end] == b'/' {
            let stripped = format!("{}{}", &path[..start], &path[end..]);
            return if stripped.is_empty() { "/".to_string() } else { stripped };
        }
        search_from = end;
    }
    path.to_string()
}

/// Member API servers reached through the proxy subresource expect `dryrun`.
fn rename_dry_run(query: &str) -> String {
    let pairs: Vec<(String, String)> = url::form_urlencoded::parse(query.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if !pairs.iter().any(|(k, _)| k == "dryRun") {
        return query.to_string();
    }
    url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(pairs.iter().map(|(k, v)| {
            let key = if k == "dryRun" { "dryrun" } else { k.as_str() };
            (key, v.as_str())
        }))
        .finish()
}

#[async_trait]
impl Dispatcher for MultiClusterDispatcher {
    fn name(&self) -> &'static str {
        "multicluster"
    }

    async fn dispatch(&self, req: Request<Body>, ctx: &RequestContext) -> Dispatch {
        if ctx.info.cluster.is_empty() || !self.enabled {
            return Dispatch::Declined(req);
        }

        let cluster = match self.lookup(&ctx.info.cluster) {
            Ok(cluster) => cluster,
            Err(e) => return handled(self.name(), Err(e)),
        };
        if !cluster.ready {
            return handled(self.name(), Err(GatewayError::ClusterNotReady(cluster.name)));
        }

        if cluster.is_host {
            return match self.reroute_to_host(req, &ctx.info.cluster) {
                Ok(dispatch) => dispatch,
                Err(e) => handled(self.name(), Err(e)),
            };
        }

        handled(self.name(), self.forward_to_member(cluster, req, ctx).await)
    }
}

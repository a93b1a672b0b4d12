//! Routing objects and cluster descriptors.
//!
//! These records are owned by an external reconciler; the gateway only reads them
//! from a cached snapshot (see [`crate::ports::route_store`]). They are serde-friendly
//! so that a snapshot can be expressed directly in the `routing:` section of the
//! configuration file.
use serde::{Deserialize, Serialize};

use crate::core::directive::Directives;

/// Availability reported by the external reconciler. Only `Available` routes
/// take part in matching.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    Available,
    #[default]
    Unavailable,
}

impl Availability {
    pub fn is_available(self) -> bool {
        matches!(self, Availability::Available)
    }
}

impl std::fmt::Display for Availability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Availability::Available => write!(f, "available"),
            Availability::Unavailable => write!(f, "unavailable"),
        }
    }
}

/// In-cluster service reference used instead of a literal URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceReference {
    pub namespace: String,
    pub name: String,
    #[serde(default = "default_service_port")]
    pub port: u16,
}

fn default_service_port() -> u16 {
    443
}

/// Upstream location plus the TLS settings used to reach it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Endpoint {
    pub url: Option<String>,
    pub service: Option<ServiceReference>,
    /// PEM encoded CA bundle trusted for this upstream.
    pub ca_bundle: Option<String>,
    pub insecure_skip_verify: bool,
}

impl Endpoint {
    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::default()
        }
    }

    /// Resolve the base URL of the upstream. An explicit `url` wins over a
    /// service reference.
    pub fn raw_url(&self) -> Option<String> {
        if let Some(url) = self.url.as_deref().filter(|u| !u.is_empty()) {
            return Some(url.trim_end_matches('/').to_string());
        }
        self.service
            .as_ref()
            .map(|svc| format!("https://{}.{}.svc:{}", svc.name, svc.namespace, svc.port))
    }

    pub fn tls_options(&self) -> TlsOptions {
        TlsOptions {
            ca_bundle: self.ca_bundle.clone(),
            insecure_skip_verify: self.insecure_skip_verify,
        }
    }
}

/// TLS settings for an outbound transport. Part of the transport cache key so
/// a changed CA bundle produces a fresh connection pool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct TlsOptions {
    pub ca_bundle: Option<String>,
    pub insecure_skip_verify: bool,
}

/// Routes a whole `(group, version)` of resource requests to an extension backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiServiceRoute {
    pub name: String,
    pub group: String,
    pub version: String,
    pub endpoint: Endpoint,
    #[serde(default)]
    pub state: Availability,
}

/// Method + path pattern selecting requests for a reverse-proxy route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteMatch {
    #[serde(default = "default_match_method")]
    pub method: String,
    pub path: String,
}

fn default_match_method() -> String {
    "*".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReverseProxyRoute {
    pub name: String,
    pub matcher: RouteMatch,
    pub upstream: Endpoint,
    #[serde(default)]
    pub directives: Directives,
    /// Free-form label identifying the extension that owns the route.
    #[serde(default)]
    pub target_label: Option<String>,
    #[serde(default)]
    pub state: Availability,
}

/// Reference to a single key of a config or secret object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueReference {
    #[serde(default)]
    pub namespace: String,
    pub name: String,
    pub key: String,
}

impl std::fmt::Display for ValueReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}[{}]", self.namespace, self.name, self.key)
    }
}

/// Where the bytes of a JS bundle come from. Exactly one source is expected.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BundleSource {
    pub raw: Option<String>,
    pub config_ref: Option<ValueReference>,
    pub secret_ref: Option<ValueReference>,
    pub remote: Option<Endpoint>,
}

impl BundleSource {
    pub fn populated_count(&self) -> usize {
        [
            self.raw.is_some(),
            self.config_ref.is_some(),
            self.secret_ref.is_some(),
            self.remote.is_some(),
        ]
        .into_iter()
        .filter(|set| *set)
        .count()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsBundleRoute {
    pub name: String,
    /// Exact path the bundle is published under.
    pub link: String,
    #[serde(default)]
    pub source: BundleSource,
    #[serde(default)]
    pub state: Availability,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    /// The gateway reaches the member's API server directly.
    #[default]
    Direct,
    /// The member is reached through a control-plane side tunnel endpoint.
    Proxy,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConnection {
    #[serde(rename = "type")]
    pub connection_type: ConnectionType,
    /// The member's orchestration API server.
    pub kubernetes_api_endpoint: Option<String>,
    /// Gateway instance serving this member, when one is reachable.
    pub gateway_endpoint: Option<String>,
    /// Credential the gateway presents to the member's API server.
    pub bearer_token: Option<String>,
    pub ca_bundle: Option<String>,
    pub insecure_skip_verify: bool,
}

impl ClusterConnection {
    pub fn tls_options(&self) -> TlsOptions {
        TlsOptions {
            ca_bundle: self.ca_bundle.clone(),
            insecure_skip_verify: self.insecure_skip_verify,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterDescriptor {
    pub name: String,
    #[serde(default)]
    pub connection: ClusterConnection,
    /// Marks the cluster this gateway itself runs in.
    #[serde(default)]
    pub is_host: bool,
    #[serde(default = "default_ready")]
    pub ready: bool,
}

fn default_ready() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_prefers_url_over_service() {
        let endpoint = Endpoint {
            url: Some("http://backend:8080/".to_string()),
            service: Some(ServiceReference {
                namespace: "ext".to_string(),
                name: "svc".to_string(),
                port: 443,
            }),
            ..Endpoint::default()
        };
        assert_eq!(endpoint.raw_url().as_deref(), Some("http://backend:8080"));
    }

    #[test]
    fn endpoint_resolves_service_reference() {
        let endpoint = Endpoint {
            service: Some(ServiceReference {
                namespace: "extension-gitops".to_string(),
                name: "gitops-apiserver".to_string(),
                port: 8443,
            }),
            ..Endpoint::default()
        };
        assert_eq!(
            endpoint.raw_url().as_deref(),
            Some("https://gitops-apiserver.extension-gitops.svc:8443")
        );
        assert_eq!(Endpoint::default().raw_url(), None);
    }

    #[test]
    fn bundle_source_counts_populated_fields() {
        let source = BundleSource {
            raw: Some("console.log(1)".to_string()),
            remote: Some(Endpoint::from_url("http://cdn")),
            ..BundleSource::default()
        };
        assert_eq!(source.populated_count(), 2);
        assert_eq!(BundleSource::default().populated_count(), 0);
    }

    #[test]
    fn availability_defaults_to_unavailable() {
        let route: ApiServiceRoute = serde_json::from_value(serde_json::json!({
            "name": "gitops",
            "group": "gitops.example.io",
            "version": "v1alpha1",
            "endpoint": { "url": "http://gitops:8080" }
        }))
        .unwrap();
        assert!(!route.state.is_available());
    }
}

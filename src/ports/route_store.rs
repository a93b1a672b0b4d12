use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::core::routing::{
    ApiServiceRoute, ClusterDescriptor, JsBundleRoute, ReverseProxyRoute, ValueReference,
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RouteStoreError {
    #[error("routing objects have not been synced yet")]
    NotSynced,

    #[error("failed to list {kind}: {reason}")]
    List { kind: &'static str, reason: String },
}

/// Point-in-time view of every routing object and cluster the gateway knows about.
///
/// Replaced wholesale whenever the watched source changes; never mutated in place.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingSnapshot {
    pub api_services: Vec<ApiServiceRoute>,
    pub reverse_proxies: Vec<ReverseProxyRoute>,
    pub js_bundles: Vec<JsBundleRoute>,
    pub clusters: Vec<ClusterDescriptor>,
    /// Config objects keyed by `namespace/name`, each a map of key to value.
    pub config_values: BTreeMap<String, BTreeMap<String, String>>,
    /// Secret objects keyed by `namespace/name`, each a map of key to value.
    pub secret_values: BTreeMap<String, BTreeMap<String, String>>,
}

impl RoutingSnapshot {
    pub fn config_value(&self, reference: &ValueReference) -> Option<&str> {
        lookup_value(&self.config_values, reference)
    }

    pub fn secret_value(&self, reference: &ValueReference) -> Option<&str> {
        lookup_value(&self.secret_values, reference)
    }
}

fn lookup_value<'a>(
    objects: &'a BTreeMap<String, BTreeMap<String, String>>,
    reference: &ValueReference,
) -> Option<&'a str> {
    let object = format!("{}/{}", reference.namespace, reference.name);
    objects
        .get(&object)
        .and_then(|data| data.get(&reference.key))
        .map(String::as_str)
}

/// Read-only access to routing objects maintained by an external reconciler.
pub trait RouteStore: Send + Sync + 'static {
    fn list_api_services(&self) -> Result<Vec<ApiServiceRoute>, RouteStoreError>;

    fn list_reverse_proxies(&self) -> Result<Vec<ReverseProxyRoute>, RouteStoreError>;

    fn list_js_bundles(&self) -> Result<Vec<JsBundleRoute>, RouteStoreError>;

    /// `Ok(None)` when the object or key does not exist.
    fn config_value(&self, reference: &ValueReference) -> Result<Option<String>, RouteStoreError>;

    fn secret_value(&self, reference: &ValueReference) -> Result<Option<String>, RouteStoreError>;
}

/// Read-only access to the cluster registry.
pub trait ClusterStore: Send + Sync + 'static {
    /// `Ok(None)` when no cluster with that name is registered.
    fn get_cluster(&self, name: &str) -> Result<Option<ClusterDescriptor>, RouteStoreError>;
}

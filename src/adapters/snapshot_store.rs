//! In-memory routing store fed by the configuration watcher.
use std::{collections::HashSet, sync::Arc};

use arc_swap::ArcSwapOption;

use crate::{
    adapters::transport_cache::TransportCache,
    core::routing::{
        ApiServiceRoute, ClusterDescriptor, JsBundleRoute, ReverseProxyRoute, ValueReference,
    },
    ports::route_store::{ClusterStore, RouteStore, RouteStoreError, RoutingSnapshot},
};

/// Lock-free holder of the current [`RoutingSnapshot`].
///
/// Readers get a consistent view for the duration of one call; writers replace the
/// whole snapshot. Until the first snapshot arrives every read fails with
/// [`RouteStoreError::NotSynced`].
#[derive(Default)]
pub struct SnapshotStore {
    current: ArcSwapOption<RoutingSnapshot>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot(snapshot: RoutingSnapshot) -> Self {
        let store = Self::new();
        store.replace(snapshot);
        store
    }

    pub fn replace(&self, snapshot: RoutingSnapshot) {
        tracing::info!(
            api_services = snapshot.api_services.len(),
            reverse_proxies = snapshot.reverse_proxies.len(),
            js_bundles = snapshot.js_bundles.len(),
            clusters = snapshot.clusters.len(),
            "Routing snapshot replaced"
        );
        self.current.store(Some(Arc::new(snapshot)));
    }

    pub fn snapshot(&self) -> Result<Arc<RoutingSnapshot>, RouteStoreError> {
        self.current.load_full().ok_or(RouteStoreError::NotSynced)
    }

    /// Transport cache keys of every upstream in the current snapshot, plus the fixed
    /// upstreams that live outside it.
    pub fn transport_keys(&self) -> HashSet<String> {
        let mut keys = HashSet::from([
            TransportCache::KUBERNETES_KEY.to_string(),
            TransportCache::FALLBACK_KEY.to_string(),
        ]);
        let Ok(snapshot) = self.snapshot() else {
            return keys;
        };
        let api = snapshot
            .api_services
            .iter()
            .map(|r| TransportCache::api_service_key(&r.name));
        let proxies = snapshot
            .reverse_proxies
            .iter()
            .map(|r| TransportCache::reverse_proxy_key(&r.name));
        let bundles = snapshot
            .js_bundles
            .iter()
            .map(|r| TransportCache::js_bundle_key(&r.name));
        let clusters = snapshot
            .clusters
            .iter()
            .map(|c| TransportCache::cluster_key(&c.name));
        keys.extend(api.chain(proxies).chain(bundles).chain(clusters));
        keys
    }
}

impl RouteStore for SnapshotStore {
    fn list_api_services(&self) -> Result<Vec<ApiServiceRoute>, RouteStoreError> {
        Ok(self.snapshot()?.api_services.clone())
    }

    fn list_reverse_proxies(&self) -> Result<Vec<ReverseProxyRoute>, RouteStoreError> {
        Ok(self.snapshot()?.reverse_proxies.clone())
    }

    fn list_js_bundles(&self) -> Result<Vec<JsBundleRoute>, RouteStoreError> {
        Ok(self.snapshot()?.js_bundles.clone())
    }

    fn config_value(&self, reference: &ValueReference) -> Result<Option<String>, RouteStoreError> {
        Ok(self.snapshot()?.config_value(reference).map(str::to_string))
    }

    fn secret_value(&self, reference: &ValueReference) -> Result<Option<String>, RouteStoreError> {
        Ok(self.snapshot()?.secret_value(reference).map(str::to_string))
    }
}

impl ClusterStore for SnapshotStore {
    fn get_cluster(&self, name: &str) -> Result<Option<ClusterDescriptor>, RouteStoreError> {
        Ok(self
            .snapshot()?
            .clusters
            .iter()
            .find(|c| c.name == name)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    #[test]
    fn test_unsynced_store_fails_closed() {
        let store = SnapshotStore::new();
        assert_eq!(store.list_api_services(), Err(RouteStoreError::NotSynced));
        assert_eq!(store.get_cluster("host"), Err(RouteStoreError::NotSynced));
        assert_eq!(store.transport_keys().len(), 2);
    }

    #[test]
    fn test_replace_swaps_whole_snapshot() {
        let store = SnapshotStore::with_snapshot(RoutingSnapshot {
            clusters: vec![ClusterDescriptor {
                name: "rohan".to_string(),
                connection: Default::default(),
                is_host: false,
                ready: true,
            }],
            ..RoutingSnapshot::default()
        });
        assert!(store.get_cluster("rohan").unwrap().is_some());
        assert_eq!(
            store.transport_keys(),
            HashSet::from([
                TransportCache::KUBERNETES_KEY.to_string(),
                TransportCache::FALLBACK_KEY.to_string(),
                "cluster/rohan".to_string()
            ])
        );

        store.replace(RoutingSnapshot::default());
        assert!(store.get_cluster("rohan").unwrap().is_none());
    }

    #[test]
    fn test_value_lookups() {
        let mut secrets = BTreeMap::new();
        secrets.insert(
            "extension/bundle".to_string(),
            BTreeMap::from([("index.js".to_string(), "alert(1)".to_string())]),
        );
        let store = SnapshotStore::with_snapshot(RoutingSnapshot {
            secret_values: secrets,
            ..RoutingSnapshot::default()
        });
        let reference = ValueReference {
            namespace: "extension".to_string(),
            name: "bundle".to_string(),
            key: "index.js".to_string(),
        };
        assert_eq!(
            store.secret_value(&reference).unwrap().as_deref(),
            Some("alert(1)")
        );
        assert_eq!(store.config_value(&reference).unwrap(), None);
    }
}

//! Per-upstream connection pools.
//!
//! Each upstream (an API service, a reverse-proxy route, a member cluster) gets its own
//! [`HttpClientAdapter`] because TLS trust is configured per upstream. Entries are keyed by
//! `kind/name` and rebuilt when the TLS settings they were built with change.
use std::{collections::HashSet, sync::Arc};

use scc::{HashMap, hash_map::Entry};

use crate::{
    adapters::http_client::HttpClientAdapter, core::routing::TlsOptions,
    ports::http_client::HttpClientResult,
};

struct CachedTransport {
    tls: TlsOptions,
    client: Arc<HttpClientAdapter>,
}

#[derive(Default)]
pub struct TransportCache {
    transports: HashMap<String, CachedTransport>,
}

impl TransportCache {
    /// The local orchestration API server.
    pub const KUBERNETES_KEY: &'static str = "kubernetes/local";
    pub const FALLBACK_KEY: &'static str = "fallback/default";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn api_service_key(name: &str) -> String {
        format!("apiservice/{name}")
    }

    pub fn reverse_proxy_key(name: &str) -> String {
        format!("reverseproxy/{name}")
    }

    pub fn js_bundle_key(name: &str) -> String {
        format!("jsbundle/{name}")
    }

    pub fn cluster_key(name: &str) -> String {
        format!("cluster/{name}")
    }

    /// Return the pool for `key`, building it on first use or when `tls` differs from
    /// the settings the cached pool was built with.
    pub async fn client_for(
        &self,
        key: String,
        tls: &TlsOptions,
    ) -> HttpClientResult<Arc<HttpClientAdapter>> {
        match self.transports.entry_async(key).await {
            Entry::Occupied(mut entry) => {
                if entry.get().tls == *tls {
                    return Ok(entry.get().client.clone());
                }
                tracing::info!(transport = %entry.key(), "TLS settings changed, rebuilding transport");
                let client = Arc::new(HttpClientAdapter::with_tls(tls)?);
                *entry.get_mut() = CachedTransport {
                    tls: tls.clone(),
                    client: client.clone(),
                };
                Ok(client)
            }
            Entry::Vacant(entry) => {
                let client = Arc::new(HttpClientAdapter::with_tls(tls)?);
                tracing::debug!(transport = %entry.key(), "Created transport");
                entry.insert_entry(CachedTransport {
                    tls: tls.clone(),
                    client: client.clone(),
                });
                Ok(client)
            }
        }
    }

    /// Drop pools whose upstream no longer exists.
    pub async fn retain_keys(&self, live: &HashSet<String>) {
        self.transports
            .retain_async(|key, _| live.contains(key))
            .await;
    }

    pub fn len(&self) -> usize {
        self.transports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transports.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_same_settings_reuse_the_pool() {
        let cache = TransportCache::new();
        let tls = TlsOptions::default();
        let first = cache
            .client_for(TransportCache::cluster_key("rohan"), &tls)
            .await
            .unwrap();
        let second = cache
            .client_for(TransportCache::cluster_key("rohan"), &tls)
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_changed_settings_rebuild_the_pool() {
        let cache = TransportCache::new();
        let key = TransportCache::reverse_proxy_key("ui");
        let first = cache
            .client_for(key.clone(), &TlsOptions::default())
            .await
            .unwrap();
        let insecure = TlsOptions {
            ca_bundle: None,
            insecure_skip_verify: true,
        };
        let second = cache.client_for(key.clone(), &insecure).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        let third = cache.client_for(key, &insecure).await.unwrap();
        assert!(Arc::ptr_eq(&second, &third));
    }

    #[tokio::test]
    async fn test_retain_keys_prunes_stale_upstreams() {
        let cache = TransportCache::new();
        let tls = TlsOptions::default();
        for name in ["a", "b"] {
            cache
                .client_for(TransportCache::api_service_key(name), &tls)
                .await
                .unwrap();
        }
        let live = HashSet::from([TransportCache::api_service_key("a")]);
        cache.retain_keys(&live).await;
        assert_eq!(cache.len(), 1);
    }
}

pub mod audit;
pub mod config_providers;
pub mod dispatch;
pub mod filter_chain;
pub mod http_client;
pub mod http_handler;
pub mod proxy;
pub mod snapshot_store;
pub mod transport_cache;

pub use audit::{AuditFilter, AuditPipeline};
pub use config_providers::FileConfigProvider;
pub use dispatch::DispatchChain;
pub use filter_chain::{FilterChain, FilterChainBuilder};
pub use http_client::HttpClientAdapter;
pub use http_handler::HttpHandler;
pub use snapshot_store::SnapshotStore;
pub use transport_cache::TransportCache;

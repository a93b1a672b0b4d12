use async_trait::async_trait;
use eyre::Result;
use tokio::sync::mpsc;

use crate::config::models::GatewayConfig;

/// Source of the gateway configuration, including the hot-reloadable routing snapshot.
#[async_trait]
pub trait ConfigProvider: Send + Sync {
    async fn load_config(&self) -> Result<GatewayConfig>;

    /// Signals every change of the underlying source; the receiver reloads via
    /// `load_config`. Only the first call returns a receiver.
    fn watch(&self) -> Option<mpsc::Receiver<()>>;
}

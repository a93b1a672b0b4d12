use std::sync::Arc;

use async_trait::async_trait;

use crate::core::audit::EncodedBatch;

/// A sink for encoded audit batches.
///
/// Every configured backend receives every batch. Implementations log their own
/// failures; the pipeline never retries.
#[async_trait]
pub trait AuditBackend: Send + Sync + 'static {
    /// Stable name used in logs and metrics labels.
    fn name(&self) -> &'static str;

    async fn process(&self, batch: Arc<EncodedBatch>);
}

//! Request auditing: the filter that records events, the batching pipeline and the
//! delivery backends.
pub mod filter;
pub mod log_file;
pub mod pipeline;
pub mod webhook;

use std::sync::Arc;

use eyre::Result;

pub use filter::AuditFilter;
pub use log_file::{LogFileBackend, RotatingFile};
pub use pipeline::{AuditPipeline, BatchOptions};
pub use webhook::{WebhookBackend, WebhookError};

use crate::{
    config::models::AuditingOptions, core::audit::HostIdentity, ports::audit_backend::AuditBackend,
};

/// Start the pipeline and build the filter. Returns a pass-through filter and no
/// pipeline when auditing is off.
pub fn start(options: &AuditingOptions) -> Result<(AuditFilter, Option<Arc<AuditPipeline>>)> {
    if !options.enabled {
        tracing::info!("Auditing disabled");
        return Ok((AuditFilter::disabled(), None));
    }

    let mut backends: Vec<Arc<dyn AuditBackend>> = Vec::new();
    if options.webhook.enabled {
        backends.push(Arc::new(WebhookBackend::new(&options.webhook)?));
    }
    if options.log.enabled {
        backends.push(Arc::new(LogFileBackend::new(&options.log)));
    }

    let host = HostIdentity::resolve(options.host_name.as_deref(), options.host_ip.as_deref());
    let pipeline = AuditPipeline::start(BatchOptions::from_config(options)?, backends);
    let filter = AuditFilter::new(options, host, pipeline.clone());
    Ok((filter, Some(pipeline)))
}

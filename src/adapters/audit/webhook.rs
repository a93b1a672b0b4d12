use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use eyre::{Result, WrapErr};
use reqwest::{StatusCode, header};
use thiserror::Error;
use tokio::sync::Semaphore;

use crate::{
    config::models::WebhookOptions, core::audit::EncodedBatch, metrics,
    ports::audit_backend::AuditBackend,
};

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("no webhook sender became free within {0:?}")]
    SenderUnavailable(Duration),

    #[error("webhook request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("webhook answered {0}")]
    Status(StatusCode),
}

/// POSTs every batch as one JSON array, with a bounded number of deliveries in flight.
pub struct WebhookBackend {
    client: reqwest::Client,
    url: String,
    senders: Arc<Semaphore>,
    wait_timeout: Duration,
}

impl WebhookBackend {
    pub fn new(options: &WebhookOptions) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(options.send_timeout()?)
            .danger_accept_invalid_certs(options.insecure_skip_verify)
            .build()
            .wrap_err("Failed to build audit webhook client")?;
        Ok(Self {
            client,
            url: options.url.clone(),
            senders: Arc::new(Semaphore::new(options.senders.max(1))),
            wait_timeout: options.wait_timeout()?,
        })
    }

    pub async fn deliver(&self, batch: &EncodedBatch) -> Result<(), WebhookError> {
        let _permit = tokio::time::timeout(self.wait_timeout, self.senders.acquire())
            .await
            .map_err(|_| WebhookError::SenderUnavailable(self.wait_timeout))?
            .map_err(|_| WebhookError::SenderUnavailable(self.wait_timeout))?;

        let response = self
            .client
            .post(&self.url)
            .header(header::CONTENT_TYPE, "application/json")
            .body(batch.to_json_array())
            .send()
            .await?;
        if response.status() != StatusCode::OK {
            return Err(WebhookError::Status(response.status()));
        }
        Ok(())
    }
}

#[async_trait]
impl AuditBackend for WebhookBackend {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn process(&self, batch: Arc<EncodedBatch>) {
        match self.deliver(&batch).await {
            Ok(()) => {
                metrics::increment_audit_batches(self.name(), "delivered");
                tracing::debug!(events = batch.len(), url = %self.url, "Delivered audit batch");
            }
            Err(e) => {
                metrics::increment_audit_batches(self.name(), "failed");
                tracing::error!(events = batch.len(), url = %self.url, error = %e, "Failed to deliver audit batch");
            }
        }
    }
}

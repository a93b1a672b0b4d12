//! Bounded queue, batcher and backend fan-out for audit events.
use std::{sync::Arc, time::Duration};

use eyre::Result;
use tokio::{
    sync::{Mutex, mpsc, mpsc::error::TrySendError},
    task::JoinHandle,
    time::Instant,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::Instrument;

use crate::{
    config::models::AuditingOptions,
    core::audit::{AuditEvent, encode_batch},
    metrics,
    ports::audit_backend::AuditBackend,
    tracing_setup,
};

#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub batch_size: usize,
    pub batch_interval: Duration,
    pub queue_size: usize,
    pub enqueue_timeout: Duration,
}

impl BatchOptions {
    pub fn from_config(options: &AuditingOptions) -> Result<Self> {
        Ok(Self {
            batch_size: options.batch_size.max(1),
            batch_interval: options.batch_interval()?,
            queue_size: options.event_queue_size.max(1),
            enqueue_timeout: options.enqueue_timeout()?,
        })
    }
}

/// Owns the event queue and the long-lived batcher task.
///
/// Request handlers only ever call [`AuditPipeline::enqueue`], which never blocks.
pub struct AuditPipeline {
    sender: mpsc::Sender<AuditEvent>,
    enqueue_timeout: Duration,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    batcher: Mutex<Option<JoinHandle<()>>>,
}

impl AuditPipeline {
    /// Spawn the batcher. Must be called inside a Tokio runtime.
    pub fn start(options: BatchOptions, backends: Vec<Arc<dyn AuditBackend>>) -> Arc<Self> {
        let (sender, receiver) = mpsc::channel(options.queue_size);
        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();

        tracing::info!(
            batch_size = options.batch_size,
            batch_interval = ?options.batch_interval,
            queue_size = options.queue_size,
            backends = ?backends.iter().map(|b| b.name()).collect::<Vec<_>>(),
            "Starting audit pipeline"
        );
        let batcher = Batcher {
            receiver,
            backends,
            batch_size: options.batch_size,
            batch_interval: options.batch_interval,
            tracker: tracker.clone(),
        };
        let handle = tokio::spawn(
            batcher
                .run(shutdown.clone())
                .instrument(tracing_setup::component_span("audit_batcher")),
        );

        Arc::new(Self {
            sender,
            enqueue_timeout: options.enqueue_timeout,
            shutdown,
            tracker,
            batcher: Mutex::new(Some(handle)),
        })
    }

    /// Queue a finished event. When the queue is full the event waits up to the enqueue
    /// timeout on a background task, then is dropped.
    pub fn enqueue(&self, event: AuditEvent) {
        match self.sender.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Closed(event)) => {
                metrics::increment_audit_events_dropped("closed");
                tracing::warn!(audit_id = %event.audit_id, "Audit pipeline is shut down, dropping event");
            }
            Err(TrySendError::Full(event)) => {
                if tokio::runtime::Handle::try_current().is_err() {
                    metrics::increment_audit_events_dropped("queue_full");
                    tracing::warn!(audit_id = %event.audit_id, "Audit queue full, dropping event");
                    return;
                }
                let sender = self.sender.clone();
                let timeout = self.enqueue_timeout;
                self.tracker.spawn(async move {
                    let audit_id = event.audit_id;
                    if sender.send_timeout(event, timeout).await.is_err() {
                        metrics::increment_audit_events_dropped("queue_full");
                        tracing::warn!(%audit_id, ?timeout, "Audit queue full, dropping event");
                    }
                });
            }
        }
    }

    /// Deliver what is queued, then wait for every in-flight delivery.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        if let Some(handle) = self.batcher.lock().await.take() {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Audit batcher task failed");
            }
        }
        self.tracker.close();
        self.tracker.wait().await;
        tracing::info!("Audit pipeline drained");
    }
}

struct Batcher {
    receiver: mpsc::Receiver<AuditEvent>,
    backends: Vec<Arc<dyn AuditBackend>>,
    batch_size: usize,
    batch_interval: Duration,
    tracker: TaskTracker,
}

impl Batcher {
    async fn run(mut self, shutdown: CancellationToken) {
        let mut batch: Vec<AuditEvent> = Vec::with_capacity(self.batch_size);
        // The window opens with the first event of a batch.
        let mut deadline: Option<Instant> = None;

        loop {
            let window_end = deadline.unwrap_or_else(Instant::now);
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep_until(window_end), if deadline.is_some() => {
                    self.flush(&mut batch);
                    deadline = None;
                }
                event = self.receiver.recv() => match event {
                    Some(event) => {
                        if batch.is_empty() {
                            deadline = Some(Instant::now() + self.batch_interval);
                        }
                        batch.push(event);
                        if batch.len() >= self.batch_size {
                            self.flush(&mut batch);
                            deadline = None;
                        }
                    }
                    None => break,
                },
            }
        }

        self.receiver.close();
        while let Some(event) = self.receiver.recv().await {
            batch.push(event);
            if batch.len() >= self.batch_size {
                self.flush(&mut batch);
            }
        }
        self.flush(&mut batch);
        tracing::debug!("Audit batcher stopped");
    }

    fn flush(&self, batch: &mut Vec<AuditEvent>) {
        if batch.is_empty() {
            return;
        }
        let events = std::mem::replace(batch, Vec::with_capacity(self.batch_size));
        let encoded = Arc::new(encode_batch(&events));
        if encoded.is_empty() {
            return;
        }
        tracing::debug!(events = encoded.len(), "Dispatching audit batch");
        for backend in &self.backends {
            let backend = backend.clone();
            let encoded = encoded.clone();
            self.tracker.spawn(async move { backend.process(encoded).await });
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::core::{
        audit::{AuditLevel, EncodedBatch, HostIdentity, RequestMeta},
        request_info::RequestInfo,
    };

    #[derive(Default)]
    struct Recorder {
        batches: std::sync::Mutex<Vec<usize>>,
    }

    impl Recorder {
        fn sizes(&self) -> Vec<usize> {
            self.batches.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AuditBackend for Recorder {
        fn name(&self) -> &'static str {
            "recorder"
        }

        async fn process(&self, batch: Arc<EncodedBatch>) {
            self.batches.lock().unwrap().push(batch.len());
        }
    }

    fn event() -> AuditEvent {
        AuditEvent::begin(
            AuditLevel::Metadata,
            &RequestInfo::default(),
            None,
            RequestMeta::default(),
            &HostIdentity::default(),
        )
    }

    fn options(batch_size: usize) -> BatchOptions {
        BatchOptions {
            batch_size,
            batch_interval: Duration::from_secs(3),
            queue_size: 100,
            enqueue_timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_batches_by_size_then_by_window() {
        let recorder = Arc::new(Recorder::default());
        let pipeline = AuditPipeline::start(options(3), vec![recorder.clone()]);

        for _ in 0..7 {
            pipeline.enqueue(event());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(recorder.sizes(), vec![3, 3]);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(recorder.sizes(), vec![3, 3, 1]);

        pipeline.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_is_measured_from_first_event() {
        let recorder = Arc::new(Recorder::default());
        let pipeline = AuditPipeline::start(options(100), vec![recorder.clone()]);

        pipeline.enqueue(event());
        tokio::time::sleep(Duration::from_secs(2)).await;
        pipeline.enqueue(event());
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(recorder.sizes(), vec![2]);

        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_delivers_pending_events() {
        let first = Arc::new(Recorder::default());
        let second = Arc::new(Recorder::default());
        let pipeline = AuditPipeline::start(options(100), vec![first.clone(), second.clone()]);

        for _ in 0..5 {
            pipeline.enqueue(event());
        }
        pipeline.shutdown().await;

        assert_eq!(first.sizes().iter().sum::<usize>(), 5);
        assert_eq!(second.sizes().iter().sum::<usize>(), 5);

        // Events after shutdown are dropped, not delivered.
        pipeline.enqueue(event());
        assert_eq!(first.sizes().iter().sum::<usize>(), 5);
    }
}

//! Telemetry callback fan-out
//!
//! Callbacks run sequentially per request; one callback's failure is
//! logged and never blocks the others. Exporters that batch (object
//! storage, trace vendors) sit behind [`BatchingCallback`], which owns a
//! flush task with a ticker and a size trigger and drains on shutdown
//! under a bounded deadline.

use super::StandardLoggingPayload;
use crate::utils::error::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A telemetry consumer
#[async_trait]
pub trait TelemetryCallback: Send + Sync {
    /// Callback name, for logs
    fn name(&self) -> &str;

    /// Consume one payload
    async fn on_request(&self, payload: Arc<StandardLoggingPayload>) -> Result<()>;

    /// Flush and release resources
    async fn shutdown(&self) {}
}

/// Sequential fan-out over the registered callbacks
pub struct CallbackManager {
    callbacks: RwLock<Vec<Arc<dyn TelemetryCallback>>>,
}

impl fmt::Debug for CallbackManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackManager")
            .field("callbacks", &self.callbacks.read().len())
            .finish()
    }
}

impl CallbackManager {
    /// Create an empty manager
    pub fn new() -> Self {
        Self {
            callbacks: RwLock::new(Vec::new()),
        }
    }

    /// Register a callback
    pub fn register(&self, callback: Arc<dyn TelemetryCallback>) {
        self.callbacks.write().push(callback);
    }

    /// Registered callback count
    pub fn len(&self) -> usize {
        self.callbacks.read().len()
    }

    /// Whether no callbacks are registered
    pub fn is_empty(&self) -> bool {
        self.callbacks.read().is_empty()
    }

    /// Deliver one payload to every callback, in registration order
    pub async fn fire(&self, payload: Arc<StandardLoggingPayload>) {
        let callbacks: Vec<Arc<dyn TelemetryCallback>> = self.callbacks.read().clone();
        for callback in callbacks {
            if let Err(err) = callback.on_request(Arc::clone(&payload)).await {
                warn!(callback = callback.name(), %err, "telemetry callback failed");
            }
        }
    }

    /// Shut every callback down
    pub async fn shutdown(&self) {
        let callbacks: Vec<Arc<dyn TelemetryCallback>> = self.callbacks.read().clone();
        for callback in callbacks {
            callback.shutdown().await;
        }
    }
}

impl Default for CallbackManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Built-in callback writing one structured log line per request
#[derive(Debug, Default)]
pub struct LoggingCallback;

#[async_trait]
impl TelemetryCallback for LoggingCallback {
    fn name(&self) -> &str {
        "logging"
    }

    async fn on_request(&self, payload: Arc<StandardLoggingPayload>) -> Result<()> {
        info!(
            request_id = %payload.id,
            status = ?payload.status,
            gen_ai.request.model = %payload.requested_model,
            gen_ai.response.model = payload.actual_model.as_deref().unwrap_or(""),
            gen_ai.system = payload.provider.as_deref().unwrap_or(""),
            gen_ai.usage.input_tokens = payload.prompt_tokens,
            gen_ai.usage.output_tokens = payload.completion_tokens,
            cost = payload.cost,
            cache_hit = payload.cache_hit,
            fallbacks = payload.fallback_events.len(),
            error = payload.error.as_deref().unwrap_or(""),
            "request completed"
        );
        Ok(())
    }
}

/// Batch exporter contract
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    /// Sink name, for logs
    fn name(&self) -> &str;

    /// Export one batch
    async fn export(&self, batch: Vec<Arc<StandardLoggingPayload>>) -> Result<()>;
}

/// Batch size that triggers an early flush
const FLUSH_BATCH_SIZE: usize = 64;
/// Channel capacity; overflow drops payloads with a warning
const QUEUE_CAPACITY: usize = 4096;

enum QueueItem {
    Payload(Arc<StandardLoggingPayload>),
    Flush(tokio::sync::oneshot::Sender<()>),
}

/// Queues payloads and exports them in batches from a dedicated task
pub struct BatchingCallback {
    sink_name: String,
    tx: mpsc::Sender<QueueItem>,
    flush_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    drain_deadline: Duration,
}

impl fmt::Debug for BatchingCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchingCallback")
            .field("sink", &self.sink_name)
            .finish_non_exhaustive()
    }
}

impl BatchingCallback {
    /// Spawn the flush task for a sink
    pub fn new(sink: Arc<dyn TelemetrySink>, flush_interval: Duration) -> Self {
        let (tx, mut rx) = mpsc::channel::<QueueItem>(QUEUE_CAPACITY);
        let sink_name = sink.name().to_string();
        let task = tokio::spawn(async move {
            let mut pending: Vec<Arc<StandardLoggingPayload>> = Vec::with_capacity(FLUSH_BATCH_SIZE);
            let mut ticker = tokio::time::interval(flush_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    item = rx.recv() => match item {
                        Some(QueueItem::Payload(payload)) => {
                            pending.push(payload);
                            if pending.len() >= FLUSH_BATCH_SIZE {
                                Self::flush(&sink, &mut pending).await;
                            }
                        }
                        Some(QueueItem::Flush(done)) => {
                            Self::flush(&sink, &mut pending).await;
                            let _ = done.send(());
                        }
                        None => {
                            // Sender side closed: final drain
                            Self::flush(&sink, &mut pending).await;
                            break;
                        }
                    },
                    _ = ticker.tick() => {
                        Self::flush(&sink, &mut pending).await;
                    }
                }
            }
            debug!(sink = %sink.name(), "batching flush task stopped");
        });

        Self {
            sink_name,
            tx,
            flush_task: parking_lot::Mutex::new(Some(task)),
            drain_deadline: Duration::from_secs(5),
        }
    }

    async fn flush(sink: &Arc<dyn TelemetrySink>, pending: &mut Vec<Arc<StandardLoggingPayload>>) {
        if pending.is_empty() {
            return;
        }
        let batch = std::mem::take(pending);
        let size = batch.len();
        if let Err(err) = sink.export(batch).await {
            warn!(sink = sink.name(), size, %err, "telemetry batch export failed");
        }
    }

    /// Force a flush and wait for it
    pub async fn flush_now(&self) {
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        if self.tx.send(QueueItem::Flush(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
    }
}

#[async_trait]
impl TelemetryCallback for BatchingCallback {
    fn name(&self) -> &str {
        &self.sink_name
    }

    async fn on_request(&self, payload: Arc<StandardLoggingPayload>) -> Result<()> {
        if self.tx.try_send(QueueItem::Payload(payload)).is_err() {
            warn!(sink = %self.sink_name, "telemetry queue full, payload dropped");
        }
        Ok(())
    }

    async fn shutdown(&self) {
        self.flush_now().await;
        let task = self.flush_task.lock().take();
        if let Some(task) = task {
            task.abort();
            let _ = tokio::time::timeout(self.drain_deadline, async {
                let _ = task.await;
            })
            .await;
        }
    }
}

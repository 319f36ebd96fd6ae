use std::{
    collections::HashMap,
    fmt::{Debug, Display},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use bon::bon;
use tokio::{sync::oneshot, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument::WithSubscriber, warn};

use crate::{
    batch::{Batch, Failure, Outcome, Rejected},
    config::BatchingConfig,
    error::{BatchError, BatchResult},
    request::{BatchRequest, ValidRequest},
    timeout::Generation,
};

/// Coalesces concurrent requests that share a key into a single downstream call.
///
/// The first request for a key starts a batch and arms a timer for
/// [`send_after`](BatchingConfig::send_after). Every request for the same key that arrives before
/// the timer fires is combined into that batch. When the timer fires the batch is removed, its
/// combined body is sent once, and every caller receives the same result. A request arriving after
/// that starts a fresh batch, so there is at most one send in flight per batch generation.
///
/// Cheap to clone. Cloned instances share the same batches.
///
/// ## Shutdown
///
/// When the cancellation token given at construction is cancelled, every pending batch is dropped
/// without being sent and its callers receive [`BatchError::Stopped`]. Batches already being sent
/// are allowed to finish.
pub struct Batcher<B, R, E> {
    inner: Arc<BatcherInner<B, R, E>>,
    stop_guard: Arc<StopWatcherGuard>,
}

struct BatcherInner<B, R, E> {
    name: String,
    config: BatchingConfig,
    cancellation: CancellationToken,
    table: Mutex<BatchTable<B, R, E>>,
}

/// Pending batches, keyed by batch key.
struct BatchTable<B, R, E> {
    batches: HashMap<String, Batch<B, R, E>>,
    next_generation: Generation,
}

/// Aborts the task waiting for cancellation when the last batcher is dropped.
#[derive(Debug)]
struct StopWatcherGuard {
    handle: JoinHandle<()>,
}

#[bon]
impl<B, R, E> Batcher<B, R, E>
where
    B: Send + 'static,
    R: Clone + Send + 'static,
    E: Clone + Display + Send + 'static,
{
    /// Create a new batcher.
    ///
    /// Must be called from within a Tokio runtime.
    #[builder]
    pub fn new(
        /// Used in logs and spans to tell batchers apart.
        name: impl Into<String>,
        #[builder(default)] config: BatchingConfig,
        /// Stops the batcher when cancelled.
        #[builder(default)]
        cancellation: CancellationToken,
    ) -> Self {
        let inner = Arc::new(BatcherInner {
            name: name.into(),
            config,
            cancellation,
            table: Mutex::new(BatchTable {
                batches: HashMap::new(),
                next_generation: Generation::default(),
            }),
        });

        let handle = {
            let inner = Arc::clone(&inner);
            tokio::spawn(
                async move {
                    inner.cancellation.cancelled().await;
                    inner.stop();
                }
                .with_current_subscriber(),
            )
        };

        Self {
            inner,
            stop_guard: Arc::new(StopWatcherGuard { handle }),
        }
    }

    /// Submit a request to be batched under `key`, and wait up to `timeout` for the result.
    ///
    /// The timeout only stops this caller from waiting. The batch is still sent for everyone
    /// else.
    pub async fn submit(
        &self,
        key: impl Into<String>,
        request: BatchRequest<B, R, E>,
        timeout: Duration,
    ) -> BatchResult<R, E> {
        let key = key.into();

        let request = request.validate()?;
        let debug_id = request.debug_id.clone();

        if self.inner.cancellation.is_cancelled() {
            return Err(BatchError::Stopped { key });
        }

        if !self.inner.config.enable_batching {
            return self.send_unbatched(key, request).await;
        }

        let rx = self.inner.add(&key, request)?;

        // A timeout too large to represent waits forever rather than overflowing.
        match tokio::time::timeout(timeout, rx).await {
            Ok(received) => match received? {
                Ok(output) => Ok(output),
                Err(failure) => Err(match failure {
                    Failure::Send(source) => BatchError::BatchFailed {
                        key,
                        debug_id,
                        source,
                    },
                    Failure::Stopped => BatchError::Stopped { key },
                    Failure::Cancelled => BatchError::Cancelled,
                    Failure::Panicked => BatchError::Panic,
                }),
            },
            Err(_elapsed) => {
                debug!(
                    batch.name = self.inner.name,
                    batch.key = key,
                    request.debug_id = debug_id,
                    "Gave up waiting for batch after {:?}",
                    timeout
                );
                Err(BatchError::TimedOut {
                    key,
                    debug_id,
                    timeout,
                })
            }
        }
    }

    async fn send_unbatched(&self, key: String, request: ValidRequest<B, R, E>) -> BatchResult<R, E> {
        let ValidRequest {
            resource_name,
            body,
            send,
            debug_id,
            ..
        } = request;

        debug!(
            batch.name = self.inner.name,
            batch.key = key,
            request.debug_id = debug_id,
            "Batching disabled, sending request on its own"
        );

        send(resource_name, body)
            .await
            .map_err(|source| BatchError::BatchFailed {
                key,
                debug_id,
                source,
            })
    }

    /// The name given at construction.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The batching config in use.
    pub fn config(&self) -> BatchingConfig {
        self.inner.config
    }

    /// The number of batches currently accumulating requests.
    pub fn pending_batches(&self) -> usize {
        self.inner.table().batches.len()
    }
}

impl<B, R, E> BatcherInner<B, R, E>
where
    B: Send + 'static,
    R: Clone + Send + 'static,
    E: Clone + Display + Send + 'static,
{
    fn table(&self) -> MutexGuard<'_, BatchTable<B, R, E>> {
        // Caller code only runs under the lock behind `catch_unwind`, so the table is never left
        // half-updated.
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Join the pending batch for `key`, or start a new one.
    fn add(
        self: &Arc<Self>,
        key: &str,
        request: ValidRequest<B, R, E>,
    ) -> BatchResult<oneshot::Receiver<Outcome<R, E>>, E> {
        let mut table = self.table();

        // Checked under the lock: once stop() has drained the table, nothing new gets in.
        if self.cancellation.is_cancelled() {
            return Err(BatchError::Stopped {
                key: key.to_string(),
            });
        }

        if let Some(batch) = table.batches.get_mut(key) {
            debug!(
                batch.name = self.name,
                batch.key = key,
                request.debug_id = request.debug_id,
                "Adding request to existing batch"
            );

            let debug_id = request.debug_id.clone();
            return batch.add_request(request).map_err(|rejected| match rejected {
                Rejected::Combine(source) => BatchError::CombineFailed {
                    key: key.to_string(),
                    debug_id,
                    source,
                },
                Rejected::Panicked => {
                    warn!(
                        batch.name = self.name,
                        batch.key = key,
                        request.debug_id = debug_id,
                        "Combine function panicked, rejecting request"
                    );
                    BatchError::CombinePanicked {
                        key: key.to_string(),
                        debug_id,
                    }
                }
            });
        }

        let generation = table.next_generation;
        table.next_generation = generation.next();

        debug!(
            batch.name = self.name,
            batch.key = key,
            request.debug_id = request.debug_id,
            "Creating new batch, sending after {:?}",
            self.config.send_after
        );

        let (mut batch, rx) = Batch::new(key.to_string(), generation, request);

        let on_timeout = Arc::clone(self).on_timeout(key.to_string(), generation);
        batch
            .timeout_mut()
            .set_timeout(self.config.send_after, on_timeout);

        table.batches.insert(key.to_string(), batch);

        Ok(rx)
    }

    /// Remove the batch for `key` and send it, unless it has already been drained or replaced.
    async fn on_timeout(self: Arc<Self>, key: String, generation: Generation) {
        let batch = {
            let mut table = self.table();
            match table.batches.get(&key) {
                Some(batch) if batch.is_generation(generation) => table.batches.remove(&key),
                _ => None,
            }
        };

        match batch {
            Some(batch) => batch.fire(&self.name).await,
            None => {
                debug!(
                    batch.name = self.name,
                    batch.key = key,
                    "A batch timer fired but the batch is no longer pending"
                );
            }
        }
    }

    /// Drop every pending batch without sending it, and release its callers.
    fn stop(&self) {
        let batches: Vec<_> = {
            let mut table = self.table();
            table.batches.drain().map(|(_, batch)| batch).collect()
        };

        info!(
            "Batcher '{}' is stopping, releasing {} pending batches",
            self.name,
            batches.len()
        );

        for batch in batches {
            batch.stop();
        }
    }
}

impl<B, R, E> Clone for Batcher<B, R, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            stop_guard: Arc::clone(&self.stop_guard),
        }
    }
}

impl<B, R, E> Debug for Batcher<B, R, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Batcher")
            .field("name", &self.inner.name)
            .field("config", &self.inner.config)
            .field("stopped", &self.inner.cancellation.is_cancelled())
            .finish()
    }
}

impl Drop for StopWatcherGuard {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

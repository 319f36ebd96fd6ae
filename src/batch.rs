use std::{
    fmt::Debug,
    mem,
    panic::{catch_unwind, AssertUnwindSafe},
};

use tokio::{sync::oneshot, task::JoinError, time::Instant};
use tracing::{debug, instrument::WithSubscriber, span, Instrument, Level, Span};

use crate::{
    request::{SendFn, ValidRequest},
    timeout::{Generation, TimeoutHandle},
};

/// What a listener eventually receives for its batch.
pub(crate) type Outcome<R, E> = Result<R, Failure<E>>;

/// Why a batch produced no output.
#[derive(Debug, Clone)]
pub(crate) enum Failure<E> {
    /// The send function returned an error.
    Send(E),
    /// The batcher was stopped before the batch was sent.
    Stopped,
    /// The send task was cancelled.
    Cancelled,
    /// The send task panicked.
    Panicked,
}

/// Why a request could not join a pending batch.
#[derive(Debug)]
pub(crate) enum Rejected<E> {
    /// The combine function returned an error.
    Combine(E),
    /// The combine function panicked.
    Panicked,
}

/// One waiting caller.
struct Listener<R, E> {
    debug_id: String,
    tx: oneshot::Sender<Outcome<R, E>>,
    /// The caller joined the batch as part of this span.
    requesting_span: Span,
}

/// A batch of requests accumulating under one key.
///
/// Only ever touched while holding the batcher's lock, until its timer removes it from the table.
/// From then on the timer task owns it exclusively.
pub(crate) struct Batch<B, R, E> {
    key: String,
    resource_name: String,
    body: B,
    /// The seeding request's send function.
    send: SendFn<B, R, E>,
    listeners: Vec<Listener<R, E>>,
    timeout: TimeoutHandle,
    created_at: Instant,
}

impl<B, R, E> Debug for Batch<B, R, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Batch")
            .field("key", &self.key)
            .field("resource_name", &self.resource_name)
            .field("listeners", &self.listeners.len())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl<B, R, E> Batch<B, R, E>
where
    B: Send + 'static,
    R: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Start a new batch seeded with `request`'s body.
    pub(crate) fn new(
        key: String,
        generation: Generation,
        request: ValidRequest<B, R, E>,
    ) -> (Self, oneshot::Receiver<Outcome<R, E>>) {
        let ValidRequest {
            resource_name,
            body,
            combine: _,
            send,
            debug_id,
        } = request;

        let (tx, rx) = oneshot::channel();

        let batch = Self {
            key,
            resource_name,
            body,
            send,
            listeners: vec![Listener {
                debug_id,
                tx,
                requesting_span: Span::current(),
            }],
            timeout: TimeoutHandle::new(generation),
            created_at: Instant::now(),
        };

        (batch, rx)
    }

    pub(crate) fn generation(&self) -> Generation {
        self.timeout.generation()
    }

    pub(crate) fn is_generation(&self, generation: Generation) -> bool {
        self.generation() == generation
    }

    pub(crate) fn len(&self) -> usize {
        self.listeners.len()
    }

    pub(crate) fn timeout_mut(&mut self) -> &mut TimeoutHandle {
        &mut self.timeout
    }

    /// Combine `request` into this batch and register it as a listener.
    ///
    /// On a combine error or panic the batch is left as it was and only this caller is rejected.
    pub(crate) fn add_request(
        &mut self,
        request: ValidRequest<B, R, E>,
    ) -> Result<oneshot::Receiver<Outcome<R, E>>, Rejected<E>> {
        // The joining request's own send is ignored: the seeding request's send is used for the
        // whole batch.
        let ValidRequest {
            resource_name: _,
            body,
            combine,
            send: _,
            debug_id,
        } = request;

        // Runs under the batcher's lock. A panic here must not poison it.
        let current = &self.body;
        self.body = catch_unwind(AssertUnwindSafe(|| combine(current, body)))
            .map_err(|_| Rejected::Panicked)?
            .map_err(Rejected::Combine)?;

        let (tx, rx) = oneshot::channel();
        self.listeners.push(Listener {
            debug_id,
            tx,
            requesting_span: Span::current(),
        });

        Ok(rx)
    }

    /// Cancel the timer and release every listener with an explicit stopped result.
    pub(crate) fn stop(mut self) {
        self.timeout.cancel();

        let listeners = mem::take(&mut self.listeners);
        Self::broadcast(listeners, Err(Failure::Stopped));
    }

    /// Send the combined body and broadcast the result to every listener.
    ///
    /// Must only be called by the timer task after it has removed this batch from the table.
    pub(crate) async fn fire(mut self, batcher_name: &str) {
        // The timer task is running this. Don't let dropping the handle abort it.
        self.timeout.disarm();

        let batch_size = self.len();
        let wait_time_ms = self.created_at.elapsed().as_millis() as u64;

        let span = span!(
            Level::INFO,
            "send batch",
            batch.name = batcher_name,
            batch.key = self.key,
            // Convert to u64 so tracing will treat this as an integer instead of a string.
            batch.size = batch_size as u64,
            batch.wait_time_ms = wait_time_ms,
        );
        for listener in &self.listeners {
            // Many callers share one send, so link rather than parent.
            span.follows_from(&listener.requesting_span);
        }

        debug!(
            batch.key = self.key,
            batch.size = batch_size,
            "Sending batch for {}",
            self.resource_name
        );

        let Batch {
            resource_name,
            body,
            send,
            listeners,
            ..
        } = self;

        // Spawn a task so we can catch panics, including ones raised before `send` returns its
        // future.
        let outcome = tokio::spawn(
            async move { send(resource_name, body).await }
                .instrument(span)
                .with_current_subscriber(),
        )
        .await
        .map_err(join_error_to_failure)
        .and_then(|r| r.map_err(Failure::Send));

        Self::broadcast(listeners, outcome);
    }

    fn broadcast(listeners: Vec<Listener<R, E>>, outcome: Outcome<R, E>) {
        for listener in listeners {
            if listener.tx.send(outcome.clone()).is_err() {
                // The caller timed out or went away. Nobody is waiting for this any more.
                debug!(
                    request.debug_id = listener.debug_id,
                    "Unable to send output over oneshot channel. Receiver deallocated."
                );
            }
        }
    }
}

fn join_error_to_failure<E>(join_err: JoinError) -> Failure<E> {
    if join_err.is_cancelled() {
        Failure::Cancelled
    } else {
        Failure::Panicked
    }
}

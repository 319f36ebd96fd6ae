use std::{fmt::Debug, future::Future, time::Duration};

use tokio::{task::JoinHandle, time::Instant};
use tracing::instrument::WithSubscriber;

/// Generations are used to handle the case where a timer goes off after the associated batch has
/// already been sent or drained, and a new batch has already been created with the same key.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub(crate) struct Generation(u64);

impl Generation {
    pub(crate) fn next(&self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

/// The single-shot delay after which a batch is sent.
///
/// Aborts the timer task when cancelled or dropped, unless it has been disarmed first.
pub(crate) struct TimeoutHandle {
    generation: Generation,
    deadline: Option<Instant>,
    handle: Option<JoinHandle<()>>,
}

impl Debug for TimeoutHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let TimeoutHandle {
            generation,
            deadline,
            handle,
        } = self;
        f.debug_struct("TimeoutHandle")
            .field("generation", &generation)
            .field("deadline", &deadline)
            .field("handle", &handle.is_some())
            .field("[derived] is_expired", &self.is_expired())
            .finish()
    }
}

impl TimeoutHandle {
    pub fn new(generation: Generation) -> Self {
        Self {
            generation,
            deadline: None,
            handle: None,
        }
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn is_expired(&self) -> bool {
        self.deadline
            .is_some_and(|deadline| deadline <= Instant::now())
    }

    /// Run `on_timeout` once `duration` has elapsed. Replaces any previous timeout.
    pub fn set_timeout<F>(&mut self, duration: Duration, on_timeout: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.cancel();

        // Unrepresentable deadlines never fire.
        self.deadline = Instant::now().checked_add(duration);
        let sleep = tokio::time::sleep(duration);

        let new_handle = tokio::spawn(
            async move {
                sleep.await;
                on_timeout.await;
            }
            .with_current_subscriber(),
        );

        self.handle = Some(new_handle);
    }

    /// Stop the timer from firing.
    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
        self.deadline = None;
    }

    /// Let the timer task run to completion without being aborted on drop.
    ///
    /// Called from the timer task itself once it has claimed its batch.
    pub fn disarm(&mut self) {
        // Dropping a JoinHandle detaches the task.
        self.handle.take();
    }
}

impl Drop for TimeoutHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

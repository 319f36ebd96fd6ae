use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use request_batcher::{BatchRequest, Batcher, BatchingConfig};

pub type SumBatcher = Batcher<u32, String, String>;

/// Counts how many times a send function was called.
#[derive(Debug, Clone, Default)]
pub struct SendCounter(Arc<AtomicUsize>);

impl SendCounter {
    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

pub fn batcher(name: &str, send_after: Duration) -> SumBatcher {
    Batcher::builder()
        .name(name)
        .config(BatchingConfig {
            send_after,
            enable_batching: true,
        })
        .build()
}

/// A request whose body is summed with the rest of its batch, and whose send takes
/// `send_duration` to return `"<resource>: <total>"`.
pub fn sum_request(
    resource: &str,
    body: u32,
    sends: &SendCounter,
    send_duration: Duration,
) -> BatchRequest<u32, String, String> {
    let sends = sends.clone();
    BatchRequest::new(resource, body)
        .with_combine(|a: &u32, b| Ok(a + b))
        .with_send(move |name, total| {
            sends.0.fetch_add(1, Ordering::SeqCst);
            async move {
                tokio::time::sleep(send_duration).await;
                Ok(format!("{name}: {total}"))
            }
        })
        .with_debug_id(format!("{resource} +{body}"))
}

/// Like [`sum_request`], but the send always fails with `message`.
pub fn failing_request(
    resource: &str,
    body: u32,
    sends: &SendCounter,
    message: &'static str,
) -> BatchRequest<u32, String, String> {
    let sends = sends.clone();
    BatchRequest::new(resource, body)
        .with_combine(|a: &u32, b| Ok(a + b))
        .with_send(move |_, _| {
            sends.0.fetch_add(1, Ordering::SeqCst);
            async move { Err(message.to_string()) }
        })
        .with_debug_id(format!("{resource} +{body}"))
}

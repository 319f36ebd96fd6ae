//! Coalesce concurrent requests that share a key into a single downstream call.
//!
//! Some APIs are slow or tightly rate limited, yet are naturally called many times at once with
//! small, mergeable payloads. Enabling services on a cloud project is the typical case: many
//! resources being created in parallel each want a handful of APIs turned on.
//!
//! A [`Batcher`] collects every request submitted under the same key during a short window
//! ([`BatchingConfig::send_after`]), merges their bodies with a caller-supplied combine function,
//! and sends the merged body once. Every caller then receives the same result. Callers each wait
//! with their own timeout, and the whole batcher can be stopped through a
//! [`CancellationToken`](tokio_util::sync::CancellationToken).
//!
//! ```
//! use std::time::Duration;
//!
//! use request_batcher::{BatchRequest, Batcher, BatchingConfig};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let batcher: Batcher<u32, String, String> = Batcher::builder()
//!     .name("example")
//!     .config(BatchingConfig {
//!         send_after: Duration::from_millis(10),
//!         enable_batching: true,
//!     })
//!     .build();
//!
//! let request = BatchRequest::new("resource", 1)
//!     .with_combine(|a: &u32, b| Ok(a + b))
//!     .with_send(|name, total| async move { Ok(format!("{name}: {total}")) })
//!     .with_debug_id("request 1");
//!
//! let output = batcher
//!     .submit("key", request, Duration::from_secs(1))
//!     .await
//!     .unwrap();
//! assert_eq!(output, "resource: 1");
//! # }
//! ```

#![deny(missing_docs)]

mod batch;
mod batcher;
pub mod config;
pub mod error;
mod request;
pub mod service_usage;
mod timeout;

pub use batcher::Batcher;
pub use config::BatchingConfig;
pub use error::BatchError;
pub use request::{BatchRequest, CombineFn, SendFn};

use std::time::Duration;

use assert_matches::assert_matches;
use futures::future::join_all;
use request_batcher::{error::InvalidRequest, BatchError, BatchRequest, Batcher, BatchingConfig};
use tokio::{join, time::Instant};

use crate::{
    assert_elapsed,
    types::{batcher, failing_request, sum_request, SendCounter, SumBatcher},
};

const TIMEOUT: Duration = Duration::from_secs(60);

/// Given many callers submit under the same key within one window
/// When the batch is sent
/// Then the send happens once and every caller gets the combined result
#[tokio::test(start_paused = true)]
async fn one_send_per_batch() {
    let batcher = batcher("one_send_per_batch", Duration::from_millis(100));
    let sends = SendCounter::default();

    let mut tasks = vec![];
    for _ in 0..10 {
        tasks.push(tokio_test::task::spawn(batcher.submit(
            "k",
            sum_request("k", 1, &sends, Duration::ZERO),
            TIMEOUT,
        )));
    }

    let outputs = join_all(tasks.into_iter()).await;

    assert_eq!(sends.count(), 1);
    for output in outputs {
        assert_eq!(output.unwrap(), "k: 10");
    }
    assert_eq!(batcher.pending_batches(), 0);
}

/// Given batching is disabled
/// When callers submit under the same key
/// Then each request is sent on its own
#[tokio::test(start_paused = true)]
async fn disabled_batching_sends_each_request() {
    let batcher: SumBatcher = Batcher::builder()
        .name("disabled_batching_sends_each_request")
        .config(BatchingConfig {
            send_after: Duration::from_secs(10),
            enable_batching: false,
        })
        .build();
    let sends = SendCounter::default();

    let start = Instant::now();

    let h1 = tokio_test::task::spawn(batcher.submit(
        "k",
        sum_request("res", 1, &sends, Duration::ZERO),
        TIMEOUT,
    ));
    let h2 = tokio_test::task::spawn(batcher.submit(
        "k",
        sum_request("res", 1, &sends, Duration::ZERO),
        TIMEOUT,
    ));
    let h3 = tokio_test::task::spawn(batcher.submit(
        "k",
        sum_request("res", 1, &sends, Duration::ZERO),
        TIMEOUT,
    ));

    let (o1, o2, o3) = join!(h1, h2, h3);

    assert_eq!(o1.unwrap(), "res: 1");
    assert_eq!(o2.unwrap(), "res: 1");
    assert_eq!(o3.unwrap(), "res: 1");
    assert_eq!(sends.count(), 3);
    assert_eq!(batcher.pending_batches(), 0);
    assert_elapsed!(start, Duration::ZERO, Duration::from_millis(1));
}

/// Given a batch with one request
/// When a second request's combine fails
/// Then only the second caller sees the error, and the batch is still sent
#[tokio::test(start_paused = true)]
async fn combine_failure_only_affects_its_caller() {
    let batcher = batcher("combine_failure_only_affects_its_caller", Duration::from_millis(100));
    let sends = SendCounter::default();

    let bad_request = BatchRequest::new("res", 2)
        .with_combine(|_: &u32, _| Err("body is not combinable".to_string()))
        .with_send(|_, _| async { Ok("unused".to_string()) })
        .with_debug_id("bad");

    let h1 = tokio_test::task::spawn(batcher.submit(
        "k",
        sum_request("res", 1, &sends, Duration::ZERO),
        TIMEOUT,
    ));
    let h2 = tokio_test::task::spawn(batcher.submit("k", bad_request, TIMEOUT));

    let (o1, o2) = join!(h1, h2);

    assert_eq!(o1.unwrap(), "res: 1");
    let err = o2.unwrap_err();
    assert!(err.to_string().contains("body is not combinable"), "{err}");
    assert_matches!(err, BatchError::CombineFailed { key, debug_id, .. } if key == "k" && debug_id == "bad");
    assert_eq!(sends.count(), 1);
}

/// Given a pending batch
/// When a joining request's combine function panics
/// Then only that caller is rejected, and the batch and other keys keep working
#[tokio::test(start_paused = true)]
async fn combine_panic_only_affects_its_caller() {
    let batcher = batcher("combine_panic_only_affects_its_caller", Duration::from_millis(100));
    let sends = SendCounter::default();

    let panicking_request = BatchRequest::new("res", 2)
        .with_combine(|_: &u32, _: u32| -> Result<u32, String> { panic!("combine exploded") })
        .with_send(|_, _| async { Ok("unused".to_string()) })
        .with_debug_id("panicky");

    let h1 = tokio_test::task::spawn(batcher.submit(
        "k",
        sum_request("res", 1, &sends, Duration::ZERO),
        TIMEOUT,
    ));
    let h2 = tokio_test::task::spawn(batcher.submit("k", panicking_request, TIMEOUT));
    let h3 = tokio_test::task::spawn(batcher.submit(
        "unrelated",
        sum_request("other", 5, &sends, Duration::ZERO),
        TIMEOUT,
    ));

    let (o1, o2, o3) = join!(h1, h2, h3);

    assert_eq!(o1.unwrap(), "res: 1");
    assert_matches!(
        o2,
        Err(BatchError::CombinePanicked { key, debug_id }) if key == "k" && debug_id == "panicky"
    );
    assert_eq!(o3.unwrap(), "other: 5");
    assert_eq!(sends.count(), 2);

    // Still usable afterwards.
    let output = batcher
        .submit("k", sum_request("res", 7, &sends, Duration::ZERO), TIMEOUT)
        .await;
    assert_eq!(output.unwrap(), "res: 7");
}

/// Given a batch of several requests
/// When the send fails
/// Then every caller receives the send error
#[tokio::test(start_paused = true)]
async fn send_failure_reaches_every_caller() {
    let batcher = batcher("send_failure_reaches_every_caller", Duration::from_millis(100));
    let sends = SendCounter::default();

    let h1 = tokio_test::task::spawn(batcher.submit(
        "k",
        failing_request("res", 1, &sends, "backend unavailable"),
        TIMEOUT,
    ));
    let h2 = tokio_test::task::spawn(batcher.submit(
        "k",
        failing_request("res", 2, &sends, "backend unavailable"),
        TIMEOUT,
    ));

    let (o1, o2) = join!(h1, h2);

    for (output, debug_id) in [(o1, "res +1"), (o2, "res +2")] {
        let err = output.unwrap_err();
        assert!(err.to_string().contains("backend unavailable"), "{err}");
        assert_matches!(err, BatchError::BatchFailed { debug_id: id, .. } if id == debug_id);
    }
    assert_eq!(sends.count(), 1);
}

/// Given a batch has already been sent
/// When another request arrives for the same key
/// Then it starts a new batch
#[tokio::test(start_paused = true)]
async fn new_batch_after_send() {
    let send_after = Duration::from_millis(100);
    let batcher = batcher("new_batch_after_send", send_after);
    let sends = SendCounter::default();

    let first = batcher
        .submit("k", sum_request("res", 1, &sends, Duration::ZERO), TIMEOUT)
        .await;
    assert_eq!(first.unwrap(), "res: 1");

    let start = Instant::now();
    let second = batcher
        .submit("k", sum_request("res", 2, &sends, Duration::ZERO), TIMEOUT)
        .await;
    assert_eq!(second.unwrap(), "res: 2");

    assert_elapsed!(start, send_after, Duration::from_millis(2));
    assert_eq!(sends.count(), 2);
}

/// Given a batch is in the middle of being sent
/// When another request arrives for the same key
/// Then it does not join the in-flight batch, but starts a new one
#[tokio::test(start_paused = true)]
async fn straggler_starts_new_batch_during_send() {
    let send_after = Duration::from_millis(100);
    let send_duration = Duration::from_millis(500);
    let batcher = batcher("straggler_starts_new_batch_during_send", send_after);
    let sends = SendCounter::default();

    let h1 = {
        let batcher = batcher.clone();
        let request = sum_request("res", 1, &sends, send_duration);
        tokio::spawn(async move { batcher.submit("k", request, TIMEOUT).await })
    };

    // The first batch has been sent, but the send has not finished.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(sends.count(), 1);
    assert_eq!(batcher.pending_batches(), 0);

    let h2 = {
        let batcher = batcher.clone();
        let request = sum_request("res", 2, &sends, send_duration);
        tokio::spawn(async move { batcher.submit("k", request, TIMEOUT).await })
    };

    let (o1, o2) = join!(h1, h2);

    assert_eq!(o1.unwrap().unwrap(), "res: 1");
    assert_eq!(o2.unwrap().unwrap(), "res: 2");
    assert_eq!(sends.count(), 2);
}

/// Given requests under different keys
/// When they are submitted together
/// Then each key gets its own batch
#[tokio::test(start_paused = true)]
async fn keys_are_batched_separately() {
    let batcher = batcher("keys_are_batched_separately", Duration::from_millis(100));
    let sends = SendCounter::default();

    let h1 = tokio_test::task::spawn(batcher.submit(
        "a",
        sum_request("a", 1, &sends, Duration::ZERO),
        TIMEOUT,
    ));
    let h2 = tokio_test::task::spawn(batcher.submit(
        "b",
        sum_request("b", 2, &sends, Duration::ZERO),
        TIMEOUT,
    ));
    let h3 = tokio_test::task::spawn(batcher.submit(
        "a",
        sum_request("a", 3, &sends, Duration::ZERO),
        TIMEOUT,
    ));

    let (o1, o2, o3) = join!(h1, h2, h3);

    assert_eq!(o1.unwrap(), "a: 4");
    assert_eq!(o2.unwrap(), "b: 2");
    assert_eq!(o3.unwrap(), "a: 4");
    assert_eq!(sends.count(), 2);
}

/// Given a Duration-style window
/// When one request is submitted
/// Then it takes as long as the window plus the send
#[tokio::test(start_paused = true)]
async fn sent_after_window() {
    let send_after = Duration::from_millis(50);
    let send_duration = Duration::from_millis(30);
    let batcher = batcher("sent_after_window", send_after);
    let sends = SendCounter::default();

    let start = Instant::now();

    batcher
        .submit("k", sum_request("res", 1, &sends, send_duration), TIMEOUT)
        .await
        .unwrap();

    assert_elapsed!(start, send_after + send_duration, Duration::from_millis(2));
}

/// Requests without both functions are rejected before any batch is created.
#[tokio::test(start_paused = true)]
async fn invalid_requests_are_rejected() {
    let batcher = batcher("invalid_requests_are_rejected", Duration::from_millis(100));

    let no_combine: BatchRequest<u32, String, String> =
        BatchRequest::new("res", 1).with_send(|_, _| async { Ok(String::new()) });
    let no_send: BatchRequest<u32, String, String> =
        BatchRequest::new("res", 1).with_combine(|a: &u32, b| Ok(a + b));

    assert_matches!(
        batcher.submit("k", no_combine, TIMEOUT).await,
        Err(BatchError::InvalidRequest(InvalidRequest::MissingCombine))
    );
    assert_matches!(
        batcher.submit("k", no_send, TIMEOUT).await,
        Err(BatchError::InvalidRequest(InvalidRequest::MissingSend))
    );
    assert_eq!(batcher.pending_batches(), 0);
}

//! Structural cancellation: unsubscribing the last subscriber tears the
//! whole dependency chain down to the transport.

mod support;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use support::*;
use tokio::sync::oneshot;

async fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
    let end = tokio::time::Instant::now() + deadline;
    while tokio::time::Instant::now() < end {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

#[tokio::test]
async fn cancelling_the_only_caller_cancels_the_transport() {
    let loader = MockDataLoader::serving_slowly(raw_image_payload(), Duration::from_millis(200));
    let pipeline = pipeline_with_loader(Arc::clone(&loader));

    let completed = Arc::new(AtomicBool::new(false));
    let completed_flag = Arc::clone(&completed);
    let task = pipeline.load_image(
        request("https://img.test/slow.raw"),
        None,
        Box::new(move |_result| {
            completed_flag.store(true, Ordering::SeqCst);
        }),
    );

    // Let the fetch start before cancelling.
    assert!(
        wait_until(Duration::from_secs(2), || loader.total_load_count() == 1).await,
        "fetch should start"
    );
    task.cancel();

    assert!(
        wait_until(Duration::from_secs(2), || loader.cancel_count() == 1).await,
        "transport handle should be cancelled"
    );
    // Cancellation produces no completion event.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!completed.load(Ordering::SeqCst));
}

#[tokio::test]
async fn cancel_is_idempotent() {
    let loader = MockDataLoader::serving_slowly(raw_image_payload(), Duration::from_millis(200));
    let pipeline = pipeline_with_loader(Arc::clone(&loader));

    let task = pipeline.load_image(
        request("https://img.test/slow.raw"),
        None,
        Box::new(|_result| {}),
    );
    assert!(wait_until(Duration::from_secs(2), || loader.total_load_count() == 1).await);

    task.cancel();
    task.cancel();
    assert!(task.is_cancelled());

    assert!(wait_until(Duration::from_secs(2), || loader.cancel_count() == 1).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(loader.cancel_count(), 1, "second cancel must have no extra effect");
}

#[tokio::test]
async fn shared_work_survives_until_the_last_subscriber_leaves() {
    let loader = MockDataLoader::serving_slowly(raw_image_payload(), Duration::from_millis(100));
    let pipeline = pipeline_with_loader(Arc::clone(&loader));

    let first = pipeline.load_image(
        request("https://img.test/shared.raw"),
        None,
        Box::new(|_result| {}),
    );
    let (tx, rx) = oneshot::channel();
    let _second = pipeline.load_image(
        request("https://img.test/shared.raw"),
        None,
        Box::new(move |result| {
            let _ = tx.send(result);
        }),
    );
    assert!(wait_until(Duration::from_secs(2), || loader.total_load_count() == 1).await);

    // Cancelling one of two subscribers must not stop the shared fetch.
    first.cancel();
    let response = rx.await.unwrap().expect("remaining subscriber completes");
    assert_eq!(response.image().width, 4);
    assert_eq!(loader.cancel_count(), 0);
}

#[tokio::test]
async fn cancel_before_start_never_reaches_the_loader() {
    let loader = MockDataLoader::serving_slowly(raw_image_payload(), Duration::from_millis(50));
    let pipeline = pipeline_with_loader(Arc::clone(&loader));

    let task = pipeline.load_image(
        request("https://img.test/never.raw"),
        None,
        Box::new(|_result| panic!("cancelled load must not complete")),
    );
    task.cancel();

    tokio::time::sleep(Duration::from_millis(200)).await;
    // Either the subscription was never made, or it was unsubscribed before
    // the fetch was admitted; in both cases no transport work survives.
    assert!(loader.total_load_count() <= 1);
    if loader.total_load_count() == 1 {
        assert_eq!(loader.cancel_count(), 1);
    }
}

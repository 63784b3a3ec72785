//! Progressive decoding: previews first, the final frame last.

mod support;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use support::*;
use tokio::sync::oneshot;

/// 4x10 raw image split so the chunks are decodable at 3, 7 and 10 rows.
fn progressive_chunks() -> (Bytes, Vec<Bytes>) {
    let payload = raw_image_payload_sized(4, 10);
    let header = 12;
    let row = 16;
    let chunks = vec![
        payload.slice(..header + 3 * row),
        payload.slice(header + 3 * row..header + 7 * row),
        payload.slice(header + 7 * row..),
    ];
    (payload, chunks)
}

fn progressive_loader(chunk_delay: Duration) -> Arc<MockDataLoader> {
    let (payload, chunks) = progressive_chunks();
    MockDataLoader::with_handler(move |_| {
        MockResponse {
            status: 200,
            headers: vec![("Content-Length".into(), payload.len().to_string())],
            chunks: chunks.clone(),
            chunk_delay: Some(chunk_delay),
            fail_after_chunks: None,
        }
    })
}

#[tokio::test]
async fn previews_precede_the_final_frame() {
    let loader = progressive_loader(Duration::from_millis(100));
    let mut config = pipeline_config(loader);
    config.is_progressive_decoding_enabled = true;
    let pipeline = image_pipeline::Pipeline::new(config);

    let previews = Arc::new(Mutex::new(Vec::new()));
    let previews_sink = Arc::clone(&previews);
    let (tx, rx) = oneshot::channel();
    pipeline.load_image(
        request("https://img.test/progressive.raw"),
        Some(Box::new(move |response, _completed, _total| {
            if let Some(response) = response {
                previews_sink
                    .lock()
                    .unwrap()
                    .push((response.image().height, response.container.is_preview));
            }
        })),
        Box::new(move |result| {
            let _ = tx.send(result);
        }),
    );

    let final_response = rx.await.unwrap().expect("progressive load succeeds");
    assert_eq!(final_response.image().height, 10);
    assert!(!final_response.container.is_preview);

    let previews = previews.lock().unwrap().clone();
    assert_eq!(
        previews,
        vec![(3, true), (7, true)],
        "two previews, in order, before the terminal frame"
    );
}

#[tokio::test]
async fn progressive_decoding_off_decodes_only_the_completed_data() {
    let loader = progressive_loader(Duration::from_millis(20));
    let mut config = pipeline_config(loader);
    config.is_progressive_decoding_enabled = false;
    let pipeline = image_pipeline::Pipeline::new(config);

    let saw_preview = Arc::new(Mutex::new(false));
    let saw_preview_sink = Arc::clone(&saw_preview);
    let (tx, rx) = oneshot::channel();
    pipeline.load_image(
        request("https://img.test/progressive.raw"),
        Some(Box::new(move |response, _completed, _total| {
            if response.is_some() {
                *saw_preview_sink.lock().unwrap() = true;
            }
        })),
        Box::new(move |result| {
            let _ = tx.send(result);
        }),
    );

    let response = rx.await.unwrap().unwrap();
    assert_eq!(response.image().height, 10);
    assert!(!*saw_preview.lock().unwrap(), "no previews when disabled");
}

#[tokio::test]
async fn previews_enter_memory_cache_only_when_enabled() {
    // The stream dies after two chunks, leaving only previews behind.
    let failing_loader = |store_previews: bool| async move {
        let (payload, chunks) = progressive_chunks();
        let loader = MockDataLoader::with_handler(move |_| MockResponse {
            status: 200,
            headers: vec![("Content-Length".into(), payload.len().to_string())],
            chunks: chunks.clone(),
            chunk_delay: Some(Duration::from_millis(80)),
            fail_after_chunks: Some(2),
        });
        let mut config = pipeline_config(loader);
        config.is_progressive_decoding_enabled = true;
        config.is_storing_previews_in_memory_cache = store_previews;
        let pipeline = image_pipeline::Pipeline::new(config);

        let req = request("https://img.test/progressive.raw");
        load_image_await(&pipeline, req.clone()).await.unwrap_err();
        pipeline.cached_image(&req)
    };

    let cached = failing_loader(true).await;
    let container = cached.expect("preview should be cached when enabled");
    assert!(container.is_preview);

    let cached = failing_loader(false).await;
    assert!(cached.is_none(), "previews stay out of the cache by default");
}

#[tokio::test]
async fn byte_progress_reports_expected_total() {
    let loader = progressive_loader(Duration::from_millis(20));
    let mut config = pipeline_config(loader);
    config.is_progressive_decoding_enabled = true;
    let pipeline = image_pipeline::Pipeline::new(config);

    let totals = Arc::new(Mutex::new(Vec::new()));
    let totals_sink = Arc::clone(&totals);
    let (tx, rx) = oneshot::channel();
    pipeline.load_image(
        request("https://img.test/progressive.raw"),
        Some(Box::new(move |response, completed, total| {
            if response.is_none() {
                totals_sink.lock().unwrap().push((completed, total));
            }
        })),
        Box::new(move |result| {
            let _ = tx.send(result);
        }),
    );
    rx.await.unwrap().unwrap();

    let totals = totals.lock().unwrap().clone();
    assert!(!totals.is_empty());
    let expected_len = 12 + 4 * 10 * 4;
    for (completed, total) in &totals {
        assert_eq!(*total, expected_len as u64);
        assert!(*completed <= *total);
    }
    assert_eq!(totals.last().unwrap().0, expected_len as u64);
}

//! Shared test fixtures: a scriptable in-memory data loader, counting
//! decoder/processor wrappers and raw-bitmap payload helpers.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use image_pipeline::error::LoadError;
use image_pipeline::image::decode::{
    encode_raw_bitmap, DecoderRegistry, DecodingContext, ImageDecoder, ImageDecoderFactory,
    RawBitmapDecoder,
};
use image_pipeline::image::process::{ImageProcessor, ProcessingContext};
use image_pipeline::image::ImageContainer;
use image_pipeline::loader::{Cancellable, DataLoader, DataSink, UrlRequest, UrlResponse};
use image_pipeline::request::ImageRequest;
use url::Url;

pub fn url(s: &str) -> Url {
    Url::parse(s).unwrap()
}

pub fn request(s: &str) -> ImageRequest {
    ImageRequest::new(url(s))
}

/// A 4x4 RGBA8 raw-bitmap payload (12-byte header + 64 pixel bytes).
pub fn raw_image_payload() -> Bytes {
    raw_image_payload_sized(4, 4)
}

pub fn raw_image_payload_sized(width: u32, height: u32) -> Bytes {
    let pixels: Vec<u8> = (0..(width * height * 4)).map(|i| (i % 251) as u8).collect();
    encode_raw_bitmap(width, height, &pixels)
}

/// One scripted response from the mock loader.
#[derive(Clone)]
pub struct MockResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub chunks: Vec<Bytes>,
    /// Delay before each chunk, to keep a transfer in flight while the
    /// test issues more requests.
    pub chunk_delay: Option<Duration>,
    /// Send this many chunks, then report a network error.
    pub fail_after_chunks: Option<usize>,
}

impl MockResponse {
    pub fn ok(body: Bytes) -> Self {
        let len = body.len();
        Self {
            status: 200,
            headers: vec![("Content-Length".into(), len.to_string())],
            chunks: vec![body],
            chunk_delay: None,
            fail_after_chunks: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_chunks(mut self, chunks: Vec<Bytes>) -> Self {
        self.chunks = chunks;
        self
    }

    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }

    pub fn failing_after(mut self, chunks: usize) -> Self {
        self.fail_after_chunks = Some(chunks);
        self
    }
}

type Handler = Box<dyn Fn(&UrlRequest) -> MockResponse + Send + Sync>;

/// In-memory [`DataLoader`] driven by a handler function.
pub struct MockDataLoader {
    handler: Handler,
    load_counts: Mutex<HashMap<String, usize>>,
    requests: Mutex<Vec<UrlRequest>>,
    cancel_count: Arc<AtomicUsize>,
}

impl MockDataLoader {
    pub fn with_handler(
        handler: impl Fn(&UrlRequest) -> MockResponse + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            handler: Box::new(handler),
            load_counts: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
            cancel_count: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Serves `body` for every URL.
    pub fn serving(body: Bytes) -> Arc<Self> {
        Self::with_handler(move |_| MockResponse::ok(body.clone()))
    }

    /// Serves `body` for every URL with a per-chunk delay.
    pub fn serving_slowly(body: Bytes, delay: Duration) -> Arc<Self> {
        Self::with_handler(move |_| MockResponse::ok(body.clone()).with_chunk_delay(delay))
    }

    pub fn load_count(&self, url: &str) -> usize {
        *self.load_counts.lock().unwrap().get(url).unwrap_or(&0)
    }

    pub fn total_load_count(&self) -> usize {
        self.load_counts.lock().unwrap().values().sum()
    }

    pub fn cancel_count(&self) -> usize {
        self.cancel_count.load(Ordering::SeqCst)
    }

    /// All requests seen, most recent last.
    pub fn seen_requests(&self) -> Vec<UrlRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn last_request(&self) -> Option<UrlRequest> {
        self.requests.lock().unwrap().last().cloned()
    }
}

struct MockHandle {
    cancelled: Arc<AtomicBool>,
    counter: Arc<AtomicUsize>,
}

impl Cancellable for MockHandle {
    fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            self.counter.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl DataLoader for MockDataLoader {
    fn load_data(&self, request: &UrlRequest, sink: DataSink) -> Box<dyn Cancellable> {
        let url = request.url.as_str().to_string();
        *self.load_counts.lock().unwrap().entry(url).or_insert(0) += 1;
        self.requests.lock().unwrap().push(request.clone());

        let response = (self.handler)(request);
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancelled);
        let request_url = request.url.to_string();

        tokio::spawn(async move {
            let DataSink {
                mut on_data,
                on_finish,
            } = sink;

            if !(200..300).contains(&response.status) && response.status != 206 {
                on_finish(Some(LoadError::Status(response.status)));
                return;
            }

            let mut url_response = UrlResponse::new(request_url, response.status);
            for (name, value) in &response.headers {
                url_response = url_response.with_header(name.clone(), value.clone());
            }

            for (index, chunk) in response.chunks.iter().enumerate() {
                if let Some(fail_after) = response.fail_after_chunks {
                    if index >= fail_after {
                        on_finish(Some(LoadError::Network("connection reset".into())));
                        return;
                    }
                }
                if let Some(delay) = response.chunk_delay {
                    tokio::time::sleep(delay).await;
                }
                if flag.load(Ordering::SeqCst) {
                    on_finish(Some(LoadError::Cancelled));
                    return;
                }
                on_data(chunk.clone(), &url_response);
            }
            if response
                .fail_after_chunks
                .is_some_and(|fail_after| fail_after >= response.chunks.len())
            {
                on_finish(Some(LoadError::Network("connection reset".into())));
                return;
            }
            on_finish(None);
        });

        Box::new(MockHandle {
            cancelled,
            counter: Arc::clone(&self.cancel_count),
        })
    }
}

/// Decoder registry wrapping the raw decoder with a decode counter.
pub fn counting_registry() -> (DecoderRegistry, Arc<AtomicUsize>) {
    let count = Arc::new(AtomicUsize::new(0));
    let mut registry = DecoderRegistry::empty();
    registry.register(Arc::new(CountingRawFactory {
        count: Arc::clone(&count),
    }));
    (registry, count)
}

struct CountingRawFactory {
    count: Arc<AtomicUsize>,
}

impl ImageDecoderFactory for CountingRawFactory {
    fn make_decoder(&self, context: &DecodingContext<'_>) -> Option<Box<dyn ImageDecoder>> {
        if context.data.starts_with(b"rawb") {
            Some(Box::new(CountingRawDecoder {
                inner: RawBitmapDecoder,
                count: Arc::clone(&self.count),
            }))
        } else {
            None
        }
    }
}

struct CountingRawDecoder {
    inner: RawBitmapDecoder,
    count: Arc<AtomicUsize>,
}

impl ImageDecoder for CountingRawDecoder {
    fn decode(&mut self, data: &Bytes, is_completed: bool) -> Option<ImageContainer> {
        self.count.fetch_add(1, Ordering::SeqCst);
        self.inner.decode(data, is_completed)
    }
}

/// Identity processor counting invocations.
pub struct CountingProcessor {
    name: String,
    count: Arc<AtomicUsize>,
}

impl CountingProcessor {
    pub fn new(name: &str) -> (Arc<Self>, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        (
            Arc::new(Self {
                name: name.to_string(),
                count: Arc::clone(&count),
            }),
            count,
        )
    }
}

impl ImageProcessor for CountingProcessor {
    fn identifier(&self) -> String {
        self.name.clone()
    }

    fn process(
        &self,
        mut container: ImageContainer,
        _context: &ProcessingContext<'_>,
    ) -> Option<ImageContainer> {
        self.count.fetch_add(1, Ordering::SeqCst);
        container
            .user_info
            .insert(self.name.clone(), serde_json::Value::Bool(true));
        Some(container)
    }
}

/// Pipeline wired to a mock loader, rate limiter off so tests are not
/// timing sensitive.
pub fn pipeline_config(loader: Arc<MockDataLoader>) -> image_pipeline::PipelineConfig {
    let mut config = image_pipeline::PipelineConfig::new().with_data_loader(loader);
    config.is_rate_limiter_enabled = false;
    config
}

pub fn pipeline_with_loader(loader: Arc<MockDataLoader>) -> image_pipeline::Pipeline {
    image_pipeline::Pipeline::new(pipeline_config(loader))
}

/// Issues a load and waits for its completion result.
pub async fn load_image_await(
    pipeline: &image_pipeline::Pipeline,
    request: ImageRequest,
) -> Result<image_pipeline::ImageResponse, image_pipeline::PipelineError> {
    let (tx, rx) = tokio::sync::oneshot::channel();
    let _task = pipeline.load_image(
        request,
        None,
        Box::new(move |result| {
            let _ = tx.send(result);
        }),
    );
    rx.await.expect("completion dropped without firing")
}

/// Issues a data load and waits for its completion result.
pub async fn load_data_await(
    pipeline: &image_pipeline::Pipeline,
    request: ImageRequest,
) -> Result<
    (Bytes, Option<image_pipeline::loader::UrlResponse>),
    image_pipeline::PipelineError,
> {
    let (tx, rx) = tokio::sync::oneshot::channel();
    let _task = pipeline.load_data(
        request,
        None,
        Box::new(move |result| {
            let _ = tx.send(result);
        }),
    );
    rx.await.expect("completion dropped without firing")
}

/// Processor that always fails.
pub struct FailingProcessor;

impl ImageProcessor for FailingProcessor {
    fn identifier(&self) -> String {
        "failing".to_string()
    }

    fn process(
        &self,
        _container: ImageContainer,
        _context: &ProcessingContext<'_>,
    ) -> Option<ImageContainer> {
        None
    }
}

//! The pipeline facade: configuration, the serial core, and the public
//! request intake API.

pub mod image_task;
pub(crate) mod stages;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::debug;

use crate::cache::memory::{default_cost_limit, MemoryCache};
use crate::cache::DataCaching;
use crate::error::PipelineError;
use crate::exec::work_queue::WorkQueue;
use crate::exec::{self, SerialExecutor};
use crate::image::decode::DecoderRegistry;
use crate::image::encode::{ImageEncoder, RawBitmapEncoder};
use crate::image::process::ImageProcessor;
use crate::image::{ImageContainer, ImageResponse};
use crate::loader::http::HttpDataLoader;
use crate::loader::rate_limit::RateLimiter;
use crate::loader::resumable::ResumableDataStorage;
use crate::loader::{DataLoader, UrlResponse};
use crate::request::keys::{self, DataLoadKey, ImageCacheKey, ImageLoadKey};
use crate::request::ImageRequest;
use crate::task::pool::TaskPool;
use crate::task::{TaskEvent, TaskGraph, TaskValue};

pub use image_task::ImageTask;

/// Which disk-cache layers the pipeline writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataCacheItems {
    pub original_image_data: bool,
    pub final_image: bool,
}

impl Default for DataCacheItems {
    fn default() -> Self {
        Self {
            original_image_data: true,
            final_image: false,
        }
    }
}

/// Where progress and completion handlers run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallbackQueue {
    /// Directly on the pipeline's serial executor. Handlers must be cheap.
    Inline,
    /// On a dedicated dispatch task, preserving per-task ordering.
    #[default]
    Detached,
}

/// Pipeline configuration. Start from [`PipelineConfig::new`] and override
/// with the `with_*` builders.
#[derive(Clone)]
pub struct PipelineConfig {
    pub data_loader: Arc<dyn DataLoader>,
    pub decoders: Arc<DecoderRegistry>,
    pub encoder: Arc<dyn ImageEncoder>,
    pub data_cache: Option<Arc<dyn DataCaching>>,
    pub data_cache_stored_items: DataCacheItems,
    pub memory_cache_cost_limit: u64,
    pub memory_cache_count_limit: usize,
    pub is_deduplication_enabled: bool,
    pub is_rate_limiter_enabled: bool,
    pub is_progressive_decoding_enabled: bool,
    pub is_resumable_data_enabled: bool,
    pub is_decompression_enabled: bool,
    pub is_storing_previews_in_memory_cache: bool,
    /// Whether bytes recovered through range resumption count toward both
    /// `completed` and `total` in progress reports.
    pub resumed_bytes_count_toward_progress: bool,
    /// Applied when a request carries no processors of its own.
    pub default_processors: Vec<Arc<dyn ImageProcessor>>,
    pub callback_queue: CallbackQueue,
    pub data_loading_concurrency: usize,
    pub data_caching_concurrency: usize,
    pub decoding_concurrency: usize,
    pub encoding_concurrency: usize,
    pub processing_concurrency: usize,
    pub decompression_concurrency: usize,
}

impl PipelineConfig {
    pub fn new() -> Self {
        Self {
            data_loader: Arc::new(HttpDataLoader::new()),
            decoders: Arc::new(DecoderRegistry::new()),
            encoder: Arc::new(RawBitmapEncoder),
            data_cache: None,
            data_cache_stored_items: DataCacheItems::default(),
            memory_cache_cost_limit: default_cost_limit(),
            memory_cache_count_limit: usize::MAX,
            is_deduplication_enabled: true,
            is_rate_limiter_enabled: true,
            is_progressive_decoding_enabled: false,
            is_resumable_data_enabled: true,
            is_decompression_enabled: true,
            is_storing_previews_in_memory_cache: false,
            resumed_bytes_count_toward_progress: true,
            default_processors: Vec::new(),
            callback_queue: CallbackQueue::default(),
            data_loading_concurrency: 6,
            data_caching_concurrency: 2,
            decoding_concurrency: 1,
            encoding_concurrency: 1,
            processing_concurrency: 2,
            decompression_concurrency: 2,
        }
    }

    pub fn with_data_loader(mut self, loader: Arc<dyn DataLoader>) -> Self {
        self.data_loader = loader;
        self
    }

    pub fn with_data_cache(mut self, cache: Arc<dyn DataCaching>) -> Self {
        self.data_cache = Some(cache);
        self
    }

    pub fn with_data_cache_stored_items(mut self, items: DataCacheItems) -> Self {
        self.data_cache_stored_items = items;
        self
    }

    pub fn with_decoders(mut self, decoders: DecoderRegistry) -> Self {
        self.decoders = Arc::new(decoders);
        self
    }

    pub fn with_default_processors(mut self, processors: Vec<Arc<dyn ImageProcessor>>) -> Self {
        self.default_processors = processors;
        self
    }

    pub fn with_callback_queue(mut self, callback_queue: CallbackQueue) -> Self {
        self.callback_queue = callback_queue;
        self
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) struct Pools {
    pub decompressed: TaskPool<ImageLoadKey>,
    pub processed: TaskPool<ImageLoadKey>,
    pub original_image: TaskPool<DataLoadKey>,
    pub original_data: TaskPool<DataLoadKey>,
}

impl Pools {
    fn new() -> Self {
        Self {
            decompressed: TaskPool::new(),
            processed: TaskPool::new(),
            original_image: TaskPool::new(),
            original_data: TaskPool::new(),
        }
    }
}

pub(crate) struct StageQueues {
    pub data_loading: WorkQueue,
    pub data_caching: WorkQueue,
    pub decoding: WorkQueue,
    pub encoding: WorkQueue,
    pub processing: WorkQueue,
    pub decompression: WorkQueue,
}

impl StageQueues {
    fn new(config: &PipelineConfig) -> Self {
        Self {
            data_loading: WorkQueue::new(config.data_loading_concurrency),
            data_caching: WorkQueue::new(config.data_caching_concurrency),
            decoding: WorkQueue::new(config.decoding_concurrency),
            encoding: WorkQueue::new(config.encoding_concurrency),
            processing: WorkQueue::new(config.processing_concurrency),
            decompression: WorkQueue::new(config.decompression_concurrency),
        }
    }
}

/// All mutable pipeline state, owned by the serial executor.
pub(crate) struct PipelineCore {
    pub(crate) config: Arc<PipelineConfig>,
    pub(crate) executor: SerialExecutor<PipelineCore>,
    pub(crate) graph: TaskGraph,
    pub(crate) pools: Pools,
    pub(crate) memory_cache: Arc<MemoryCache<ImageCacheKey, ImageContainer>>,
    pub(crate) resumable: Arc<ResumableDataStorage>,
    pub(crate) rate_limiter: RateLimiter,
    pub(crate) queues: StageQueues,
    callback_tx: Option<mpsc::UnboundedSender<Box<dyn FnOnce() + Send>>>,
    next_op_seq: u64,
}

impl PipelineCore {
    /// Monotonic sequence for in-flight stage operations; completion
    /// continuations compare it to discard superseded results.
    pub(crate) fn next_op_seq(&mut self) -> u64 {
        self.next_op_seq += 1;
        self.next_op_seq
    }

    /// Runs a user-facing callback on the configured callback queue.
    pub(crate) fn dispatch_callback(&self, callback: Box<dyn FnOnce() + Send>) {
        match &self.callback_tx {
            Some(tx) => {
                let _ = tx.send(callback);
            }
            None => callback(),
        }
    }

    /// Runs CPU-bound work on a bounded stage queue and hands the result
    /// back to the serial executor.
    pub(crate) fn run_on_queue<T: Send + 'static>(
        &mut self,
        queue: WorkQueue,
        task: crate::task::TaskId,
        compute: impl FnOnce() -> T + Send + 'static,
        complete: impl FnOnce(&mut PipelineCore, crate::task::TaskId, T) + Send + 'static,
    ) -> crate::exec::work_queue::WorkHandle {
        let executor = self.executor.clone();
        let priority = self.task_priority(task);
        queue.submit(priority, move |token| {
            if token.is_cancelled() {
                token.finish();
                return;
            }
            tokio::spawn(async move {
                match tokio::task::spawn_blocking(compute).await {
                    Ok(value) => {
                        token.finish();
                        executor.submit(move |core| complete(core, task, value));
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "stage work panicked");
                        token.finish();
                    }
                }
            });
        })
    }

    /// Reads from the data cache on the data-caching queue.
    pub(crate) fn read_data_cache(
        &mut self,
        task: crate::task::TaskId,
        cache: Arc<dyn DataCaching>,
        key: String,
        complete: impl FnOnce(&mut PipelineCore, crate::task::TaskId, Option<Bytes>) + Send + 'static,
    ) -> crate::exec::work_queue::WorkHandle {
        let executor = self.executor.clone();
        let priority = self.task_priority(task);
        self.queues.data_caching.clone().submit(priority, move |token| {
            if token.is_cancelled() {
                token.finish();
                return;
            }
            tokio::spawn(async move {
                let data = cache.cached_data(&key).await;
                token.finish();
                executor.submit(move |core| complete(core, task, data));
            });
        })
    }
}

struct PipelineShared {
    executor: SerialExecutor<PipelineCore>,
    config: Arc<PipelineConfig>,
    memory_cache: Arc<MemoryCache<ImageCacheKey, ImageContainer>>,
    next_image_task_id: AtomicU64,
}

impl Drop for PipelineShared {
    fn drop(&mut self) {
        self.executor.close();
    }
}

/// The image loading pipeline.
///
/// Cloning is cheap and shares the underlying state. Construct inside a
/// tokio runtime.
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<PipelineShared>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Self {
        let config = Arc::new(config);
        let memory_cache = Arc::new(MemoryCache::new(
            config.memory_cache_cost_limit,
            config.memory_cache_count_limit,
        ));

        let callback_tx = match config.callback_queue {
            CallbackQueue::Inline => None,
            CallbackQueue::Detached => {
                let (tx, mut rx) = mpsc::unbounded_channel::<Box<dyn FnOnce() + Send>>();
                tokio::spawn(async move {
                    while let Some(callback) = rx.recv().await {
                        callback();
                    }
                });
                Some(tx)
            }
        };

        let core_config = Arc::clone(&config);
        let core_memory_cache = Arc::clone(&memory_cache);
        let executor = exec::spawn_with(move |handle| PipelineCore {
            queues: StageQueues::new(&core_config),
            config: core_config,
            executor: handle,
            graph: TaskGraph::new(),
            pools: Pools::new(),
            memory_cache: core_memory_cache,
            resumable: Arc::new(ResumableDataStorage::new()),
            rate_limiter: RateLimiter::new(),
            callback_tx,
            next_op_seq: 0,
        });

        Self {
            inner: Arc::new(PipelineShared {
                executor,
                config,
                memory_cache,
                next_image_task_id: AtomicU64::new(0),
            }),
        }
    }

    /// Loads, decodes, processes and decompresses the image for `request`.
    ///
    /// `progress` receives progressive previews (with a response) and byte
    /// progress (without); `completion` fires exactly once unless the task
    /// is cancelled first.
    pub fn load_image(
        &self,
        request: ImageRequest,
        progress: Option<image_task::ImageProgressHandler>,
        completion: image_task::ImageCompletionHandler,
    ) -> ImageTask {
        let request = self.inherit_default_processors(request);
        let task = self.new_image_task(&request);
        let state = task.state();
        self.inner.executor.submit(move |core| {
            image_task::start_image_load(core, state, request, progress, completion);
        });
        task
    }

    /// Loads the original image data without decoding it.
    pub fn load_data(
        &self,
        request: ImageRequest,
        progress: Option<image_task::DataProgressHandler>,
        completion: image_task::DataCompletionHandler,
    ) -> ImageTask {
        let task = self.new_image_task(&request);
        let state = task.state();
        self.inner.executor.submit(move |core| {
            image_task::start_data_load(core, state, request, progress, completion);
        });
        task
    }

    /// Synchronous memory-cache probe for the final image.
    pub fn cached_image(&self, request: &ImageRequest) -> Option<ImageContainer> {
        let request = self.inherit_default_processors(request.clone());
        self.inner
            .memory_cache
            .get(&ImageCacheKey::for_request(&request))
    }

    /// Purges the final image from the memory cache and both disk-cache
    /// keys.
    pub fn remove_cached_image(&self, request: &ImageRequest) {
        let request = self.inherit_default_processors(request.clone());
        self.inner
            .memory_cache
            .remove(&ImageCacheKey::for_request(&request));
        if let Some(cache) = &self.inner.config.data_cache {
            cache.remove_data(&keys::final_image_disk_key(&request));
            cache.remove_data(&keys::original_image_disk_key(&request));
        }
    }

    pub fn memory_cache(&self) -> &Arc<MemoryCache<ImageCacheKey, ImageContainer>> {
        &self.inner.memory_cache
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    fn inherit_default_processors(&self, request: ImageRequest) -> ImageRequest {
        if request.processors().is_empty() && !self.inner.config.default_processors.is_empty() {
            request.with_processors(self.inner.config.default_processors.clone())
        } else {
            request
        }
    }

    fn new_image_task(&self, request: &ImageRequest) -> ImageTask {
        let id = self.inner.next_image_task_id.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(id, url = %request.url(), "image task created");
        ImageTask::new(id, self.inner.executor.clone(), request.priority())
    }
}

/// Convenience constructor wiring a disk cache into the default config.
impl Pipeline {
    pub fn with_defaults() -> Self {
        Self::new(PipelineConfig::new())
    }
}

pub(crate) fn event_progress(event: &TaskEvent) -> Option<(u64, u64)> {
    match event {
        TaskEvent::Progress(progress) => Some((progress.completed, progress.total)),
        _ => None,
    }
}

pub(crate) fn event_image(event: &TaskEvent) -> Option<(&ImageResponse, bool)> {
    match event {
        TaskEvent::Value(TaskValue::Image(response), completed) => Some((response, *completed)),
        _ => None,
    }
}

pub(crate) fn event_data(event: &TaskEvent) -> Option<(&Bytes, Option<&UrlResponse>, bool)> {
    match event {
        TaskEvent::Value(TaskValue::Data(data, response), completed) => {
            Some((data, response.as_ref(), *completed))
        }
        _ => None,
    }
}

pub(crate) fn event_error(event: &TaskEvent) -> Option<&PipelineError> {
    match event {
        TaskEvent::Error(error) => Some(error),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::{Cancellable, DataLoader, DataSink, UrlRequest};
    use crate::request::keys::DataLoadKey;
    use crate::request::Priority;
    use crate::task::TaskProgress;
    use std::sync::Mutex;
    use tokio::sync::oneshot;
    use url::Url;

    /// Loader whose transfers start but never progress, keeping the task
    /// chain alive for inspection.
    struct PendingLoader;

    struct PendingHandle;

    impl Cancellable for PendingHandle {
        fn cancel(&self) {}
    }

    impl DataLoader for PendingLoader {
        fn load_data(&self, _request: &UrlRequest, _sink: DataSink) -> Box<dyn Cancellable> {
            Box::new(PendingHandle)
        }
    }

    fn test_pipeline() -> Pipeline {
        let mut config = PipelineConfig::new().with_data_loader(Arc::new(PendingLoader));
        config.is_rate_limiter_enabled = false;
        config.callback_queue = CallbackQueue::Inline;
        Pipeline::new(config)
    }

    /// Runs a closure on the pipeline's serial executor and awaits the
    /// result.
    async fn on_core<T: Send + 'static>(
        pipeline: &Pipeline,
        job: impl FnOnce(&mut PipelineCore) -> T + Send + 'static,
    ) -> T {
        let (tx, rx) = oneshot::channel();
        pipeline.inner.executor.submit(move |core| {
            let _ = tx.send(job(core));
        });
        rx.await.expect("pipeline executor dropped")
    }

    fn test_request(url: &str) -> ImageRequest {
        ImageRequest::new(Url::parse(url).unwrap())
    }

    #[tokio::test]
    async fn equal_requests_share_one_task_per_stage() {
        let pipeline = test_pipeline();
        let (a, b, c) = on_core(&pipeline, |core| {
            let request = test_request("https://t/a");
            let a = stages::decompressed_image_task(core, &request);
            let b = stages::decompressed_image_task(core, &request);
            let other = test_request("https://t/b");
            let c = stages::decompressed_image_task(core, &other);
            (a, b, c)
        })
        .await;
        assert_eq!(a, b, "same request coalesces");
        assert_ne!(a, c, "different URLs get fresh tasks");
    }

    #[tokio::test]
    async fn deduplication_disabled_returns_fresh_tasks() {
        let mut config = PipelineConfig::new().with_data_loader(Arc::new(PendingLoader));
        config.is_deduplication_enabled = false;
        config.is_rate_limiter_enabled = false;
        let pipeline = Pipeline::new(config);
        let (a, b) = on_core(&pipeline, |core| {
            let request = test_request("https://t/a");
            (
                stages::decompressed_image_task(core, &request),
                stages::decompressed_image_task(core, &request),
            )
        })
        .await;
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn task_priority_is_the_maximum_over_subscribers() {
        let pipeline = test_pipeline();
        let observed = on_core(&pipeline, |core| {
            let request = test_request("https://t/a");
            let task = stages::decompressed_image_task(core, &request);
            let s1 = core
                .subscribe(task, Priority::Low, Box::new(|_, _| {}))
                .expect("task is live");
            let after_one = core.task_priority(task);
            let s2 = core
                .subscribe(task, Priority::VeryHigh, Box::new(|_, _| {}))
                .expect("task is live");
            let after_two = core.task_priority(task);
            core.unsubscribe(s2);
            let after_drop = core.task_priority(task);
            core.set_subscription_priority(s1, Priority::High);
            let after_bump = core.task_priority(task);
            (after_one, after_two, after_drop, after_bump)
        })
        .await;
        assert_eq!(
            observed,
            (
                Priority::Low,
                Priority::VeryHigh,
                Priority::Low,
                Priority::High
            )
        );
    }

    #[tokio::test]
    async fn priority_changes_propagate_down_the_dependency_chain() {
        let pipeline = test_pipeline();
        let (initial, raised) = on_core(&pipeline, |core| {
            let request = test_request("https://t/a");
            let task = stages::decompressed_image_task(core, &request);
            let subscription = core
                .subscribe(task, Priority::Low, Box::new(|_, _| {}))
                .expect("task is live");
            let data_task = core
                .pools
                .original_data
                .get_live(&DataLoadKey::for_request(&request), &core.graph)
                .expect("fetch task exists");
            let initial = core.task_priority(data_task);
            core.set_subscription_priority(subscription, Priority::VeryHigh);
            (initial, core.task_priority(data_task))
        })
        .await;
        assert_eq!(initial, Priority::Low);
        assert_eq!(raised, Priority::VeryHigh);
    }

    #[tokio::test]
    async fn unsubscribing_the_last_subscriber_tears_down_the_chain() {
        let pipeline = test_pipeline();
        let (live_before, live_after, pool_len) = on_core(&pipeline, |core| {
            let request = test_request("https://t/a");
            let task = stages::decompressed_image_task(core, &request);
            let subscription = core
                .subscribe(task, Priority::Normal, Box::new(|_, _| {}))
                .expect("task is live");
            // Four stages: decompressed, processed, original image, data.
            let live_before = core.graph.live_count();
            core.unsubscribe(subscription);
            (
                live_before,
                core.graph.live_count(),
                core.pools.original_data.len(),
            )
        })
        .await;
        assert_eq!(live_before, 4);
        assert_eq!(live_after, 0, "cancellation cascades to every stage");
        assert_eq!(pool_len, 0, "pools drop disposed tasks");
    }

    #[tokio::test]
    async fn one_of_two_subscribers_leaving_keeps_the_task() {
        let pipeline = test_pipeline();
        let (live_mid, live_end) = on_core(&pipeline, |core| {
            let request = test_request("https://t/a");
            let task = stages::decompressed_image_task(core, &request);
            let s1 = core
                .subscribe(task, Priority::Normal, Box::new(|_, _| {}))
                .unwrap();
            let s2 = core
                .subscribe(task, Priority::Normal, Box::new(|_, _| {}))
                .unwrap();
            core.unsubscribe(s1);
            let live_mid = core.graph.live_count();
            core.unsubscribe(s2);
            (live_mid, core.graph.live_count())
        })
        .await;
        assert_eq!(live_mid, 4);
        assert_eq!(live_end, 0);
    }

    #[tokio::test]
    async fn events_reach_subscribers_in_registration_order() {
        let pipeline = test_pipeline();
        let order = Arc::new(Mutex::new(Vec::new()));
        let order_in = Arc::clone(&order);
        on_core(&pipeline, move |core| {
            let task = core.make_task(Box::new(|_, _| {}));
            let first = Arc::clone(&order_in);
            core.subscribe(
                task,
                Priority::Normal,
                Box::new(move |_, event| {
                    if event_progress(event).is_some() {
                        first.lock().unwrap().push("first");
                    }
                }),
            )
            .unwrap();
            let second = Arc::clone(&order_in);
            core.subscribe(
                task,
                Priority::Normal,
                Box::new(move |_, event| {
                    if event_progress(event).is_some() {
                        second.lock().unwrap().push("second");
                    }
                }),
            )
            .unwrap();
            core.send(
                task,
                TaskEvent::Progress(TaskProgress {
                    completed: 1,
                    total: 2,
                }),
            );
        })
        .await;
        assert_eq!(&*order.lock().unwrap(), &["first", "second"]);
    }

    #[tokio::test]
    async fn no_events_after_a_terminal_event() {
        let pipeline = test_pipeline();
        let seen = Arc::new(Mutex::new(0u32));
        let seen_in = Arc::clone(&seen);
        let live = on_core(&pipeline, move |core| {
            let task = core.make_task(Box::new(|_, _| {}));
            let counter = Arc::clone(&seen_in);
            core.subscribe(
                task,
                Priority::Normal,
                Box::new(move |_, _| {
                    *counter.lock().unwrap() += 1;
                }),
            )
            .unwrap();
            core.send(
                task,
                TaskEvent::Value(TaskValue::Data(Bytes::new(), None), true),
            );
            // The task is disposed; both sends below are ignored.
            core.send(
                task,
                TaskEvent::Progress(TaskProgress {
                    completed: 1,
                    total: 1,
                }),
            );
            core.send(
                task,
                TaskEvent::Value(TaskValue::Data(Bytes::new(), None), true),
            );
            core.graph.contains(task)
        })
        .await;
        assert!(!live);
        assert_eq!(*seen.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn subscribe_returns_none_when_the_starter_terminates_synchronously() {
        let pipeline = test_pipeline();
        let (subscription_was_none, events) = on_core(&pipeline, |core| {
            let task = core.make_task(Box::new(|core, id| {
                core.send(
                    id,
                    TaskEvent::Value(TaskValue::Data(Bytes::new(), None), true),
                );
            }));
            let events = Arc::new(Mutex::new(0u32));
            let counter = Arc::clone(&events);
            let subscription = core.subscribe(
                task,
                Priority::Normal,
                Box::new(move |_, _| {
                    *counter.lock().unwrap() += 1;
                }),
            );
            (subscription.is_none(), *events.lock().unwrap())
        })
        .await;
        assert!(subscription_was_none);
        assert_eq!(events, 1, "the synchronous event still reached the subscriber");
    }

    #[tokio::test]
    async fn disposal_is_idempotent() {
        let pipeline = test_pipeline();
        let live = on_core(&pipeline, |core| {
            let request = test_request("https://t/a");
            let task = stages::decompressed_image_task(core, &request);
            let subscription = core
                .subscribe(task, Priority::Normal, Box::new(|_, _| {}))
                .unwrap();
            core.unsubscribe(subscription);
            // Late duplicate teardown attempts must be no-ops.
            core.unsubscribe(subscription);
            core.dispose(task, crate::task::DisposeReason::Cancelled);
            core.graph.live_count()
        })
        .await;
        assert_eq!(live, 0);
    }
}

//! The four-stage task graph.
//!
//! ```text
//! decompressed → processed (self-recursive) → original image → original data
//! ```
//!
//! Each stage lives in its own task pool keyed by the stage's logical
//! identity, so concurrent requests share every piece of work they have in
//! common. Stage bodies run on the serial executor; CPU work is dispatched
//! to the bounded stage queues and re-enters through the executor.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, trace};

use crate::error::PipelineError;
use crate::exec::work_queue::WorkToken;
use crate::image::decode::{DecodingContext, ImageDecoder};
use crate::image::encode::EncodingContext;
use crate::image::process::{CompositeProcessor, ImageProcessor, ProcessingContext};
use crate::image::ImageResponse;
use crate::loader::resumable::ResumableData;
use crate::loader::{CachePolicy, Cancellable, DataSink, UrlResponse};
use crate::pipeline::{event_data, event_error, event_image, event_progress, PipelineCore};
use crate::request::keys::{self, DataLoadKey, ImageCacheKey, ImageLoadKey};
use crate::request::{ImageRequest, Priority};
use crate::task::{TaskEvent, TaskId, TaskProgress, TaskValue};

/// Per-task stage bookkeeping, stored on the task record.
pub(crate) enum StageState {
    None,
    Decompress(OpState),
    Process(OpState),
    Decode(DecodeState),
    Fetch(FetchState),
}

/// Tracks the single in-flight operation of a back-pressured stage.
/// Completion continuations compare the sequence number and discard
/// superseded results.
#[derive(Default)]
pub(crate) struct OpState {
    pub current_op: Option<u64>,
}

#[derive(Default)]
pub(crate) struct DecodeState {
    pub decoder: Option<Box<dyn ImageDecoder>>,
    pub current_op: Option<u64>,
}

pub(crate) struct FetchState {
    pub request: ImageRequest,
    chunks: Vec<Bytes>,
    received: u64,
    expected: Option<u64>,
    resumed: u64,
    resumable_candidate: Option<ResumableData>,
    url_response: Option<UrlResponse>,
    loader_handle: Option<Box<dyn Cancellable>>,
    token: Option<WorkToken>,
    rate_limit_flag: Option<Arc<AtomicBool>>,
}

impl FetchState {
    fn new(request: ImageRequest) -> Self {
        Self {
            request,
            chunks: Vec::new(),
            received: 0,
            expected: None,
            resumed: 0,
            resumable_candidate: None,
            url_response: None,
            loader_handle: None,
            token: None,
            rate_limit_flag: None,
        }
    }

    fn assemble(&self) -> Bytes {
        if self.chunks.len() == 1 {
            return self.chunks[0].clone();
        }
        let mut out = Vec::with_capacity(self.received as usize);
        for chunk in &self.chunks {
            out.extend_from_slice(chunk);
        }
        Bytes::from(out)
    }
}

impl StageState {
    /// Teardown for a cancelled task: stop the transport, release the
    /// admission flag and the queue slot, and park resumable data.
    pub(crate) fn cancel_cleanup(&mut self, core: &mut PipelineCore) {
        let StageState::Fetch(state) = self else {
            return;
        };
        if let Some(flag) = state.rate_limit_flag.take() {
            flag.store(true, Ordering::SeqCst);
        }
        let was_in_flight = state.loader_handle.is_some();
        if let Some(handle) = state.loader_handle.take() {
            handle.cancel();
        }
        if was_in_flight && core.config.is_resumable_data_enabled && state.received > 0 {
            if let Some(response) = &state.url_response {
                if let Some(resumable) = ResumableData::new(response, state.assemble()) {
                    debug!(
                        url = %state.request.url(),
                        bytes = resumable.data.len(),
                        "parked resumable data"
                    );
                    core.resumable
                        .store(state.request.url().as_str(), resumable);
                }
            }
        }
        if let Some(token) = state.token.take() {
            token.finish();
        }
    }

    /// Teardown for a finished task: release the queue slot if the
    /// terminal event short-circuited past the usual completion path.
    pub(crate) fn finished_cleanup(&mut self) {
        if let StageState::Fetch(state) = self {
            state.loader_handle = None;
            if let Some(token) = state.token.take() {
                token.finish();
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Stage 1 — decompressed image
// ---------------------------------------------------------------------------

pub(crate) fn decompressed_image_task(core: &mut PipelineCore, request: &ImageRequest) -> TaskId {
    let dedup = core.config.is_deduplication_enabled;
    let key = ImageLoadKey::for_request(request);
    if dedup {
        if let Some(id) = core.pools.decompressed.get_live(&key, &core.graph) {
            return id;
        }
    }
    let starter_request = request.clone();
    let id = core.make_task(Box::new(move |core, id| {
        start_decompressed(core, id, starter_request);
    }));
    if dedup {
        core.pools.decompressed.insert(key.clone(), id);
        if let Some(record) = core.graph.record_mut(id) {
            record.on_disposed = Some(Box::new(move |core| {
                core.pools.decompressed.remove_if(&key, id);
            }));
        }
    }
    id
}

fn start_decompressed(core: &mut PipelineCore, id: TaskId, request: ImageRequest) {
    if request.options().is_memory_cache_read_allowed {
        let cache_key = ImageCacheKey::for_request(&request);
        if let Some(container) = core.memory_cache.get(&cache_key) {
            let is_preview = container.is_preview;
            trace!(url = %request.url(), is_preview, "memory cache hit");
            let response = ImageResponse::new(container, None);
            core.send(
                id,
                TaskEvent::Value(TaskValue::Image(response), !is_preview),
            );
            if !is_preview {
                return;
            }
        }
    }

    let policy = request.resource().cache_policy();
    if core.config.data_cache_stored_items.final_image
        && policy != CachePolicy::ReloadIgnoringCachedData
    {
        if let Some(cache) = core.config.data_cache.clone() {
            let disk_key = keys::final_image_disk_key(&request);
            let op = core.read_data_cache(id, cache, disk_key, move |core, id, data| {
                if !core.graph.contains(id) {
                    return;
                }
                match data {
                    Some(data) => decode_cached_final(core, id, request, data),
                    None => subscribe_processed(core, id, request),
                }
            });
            core.set_operation(id, op);
            return;
        }
    }

    subscribe_processed(core, id, request);
}

/// Decodes bytes found in the processed-image disk cache. A decode failure
/// falls back to the full processing chain.
fn decode_cached_final(core: &mut PipelineCore, id: TaskId, request: ImageRequest, data: Bytes) {
    let registry = Arc::clone(&core.config.decoders);
    let compute_request = request.clone();
    let op = core.run_on_queue(
        core.queues.decoding.clone(),
        id,
        move || {
            let context = DecodingContext {
                request: &compute_request,
                data: &data,
                url_response: None,
                is_completed: true,
            };
            registry
                .decoder(&context)
                .and_then(|mut decoder| decoder.decode(&data, true))
        },
        move |core, id, container| {
            if !core.graph.contains(id) {
                return;
            }
            match container {
                Some(container) => {
                    trace!(url = %request.url(), "final image served from disk cache");
                    let response = ImageResponse::new(container, None);
                    decompress_and_deliver(core, id, request, response, true);
                }
                None => subscribe_processed(core, id, request),
            }
        },
    );
    core.set_operation(id, op);
}

fn subscribe_processed(core: &mut PipelineCore, id: TaskId, request: ImageRequest) {
    if !core.graph.contains(id) {
        return;
    }
    let dep = processed_image_task(core, &request);
    let priority = core.task_priority(id);
    let observer_request = request;
    let subscription = core.subscribe(
        dep,
        priority,
        Box::new(move |core, event| {
            if let Some((response, completed)) = event_image(event) {
                on_processed_image(
                    core,
                    id,
                    observer_request.clone(),
                    response.clone(),
                    completed,
                );
            } else if let Some((completed, total)) = event_progress(event) {
                core.send(id, TaskEvent::Progress(TaskProgress { completed, total }));
            } else if let Some(error) = event_error(event) {
                core.send(id, TaskEvent::Error(error.clone()));
            }
        }),
    );
    if let Some(subscription) = subscription {
        core.set_dependency(id, subscription);
    }
}

fn on_processed_image(
    core: &mut PipelineCore,
    id: TaskId,
    request: ImageRequest,
    response: ImageResponse,
    completed: bool,
) {
    if !core.graph.contains(id) {
        return;
    }
    if completed && !response.container.is_preview {
        store_final_image_in_data_cache(core, &request, &response);
    }
    decompress_and_deliver(core, id, request, response, completed);
}

fn decompress_and_deliver(
    core: &mut PipelineCore,
    id: TaskId,
    request: ImageRequest,
    response: ImageResponse,
    completed: bool,
) {
    if !core.config.is_decompression_enabled || !response.container.needs_decompression() {
        finalize_image(core, id, request, response, completed);
        return;
    }

    let seq = core.next_op_seq();
    {
        let Some(record) = core.graph.record_mut(id) else {
            return;
        };
        if !matches!(record.stage, StageState::Decompress(_)) {
            record.stage = StageState::Decompress(OpState::default());
        }
        let StageState::Decompress(state) = &mut record.stage else {
            return;
        };
        if completed {
            // A final frame replaces any pending progressive decompression.
            if state.current_op.is_some() {
                if let Some(operation) = record.operation.take() {
                    operation.cancel();
                }
            }
        } else if state.current_op.is_some() {
            // Back-pressure: drop progressive frames while one is in flight.
            trace!(url = %request.url(), "progressive frame dropped (decompression busy)");
            return;
        }
        state.current_op = Some(seq);
    }

    let compute_response = response;
    let op = core.run_on_queue(
        core.queues.decompression.clone(),
        id,
        move || {
            let image = compute_response.container.image.decompressed();
            let mut container = compute_response.container.clone();
            container.image = Arc::new(image);
            ImageResponse {
                container,
                url_response: compute_response.url_response.clone(),
            }
        },
        move |core, id, response| {
            {
                let Some(record) = core.graph.record_mut(id) else {
                    return;
                };
                let StageState::Decompress(state) = &mut record.stage else {
                    return;
                };
                if state.current_op != Some(seq) {
                    return; // superseded by a newer frame
                }
                state.current_op = None;
                record.operation = None;
            }
            finalize_image(core, id, request, response, completed);
        },
    );
    core.set_operation(id, op);
}

/// Memory-cache write and delivery; the last step of stage 1.
fn finalize_image(
    core: &mut PipelineCore,
    id: TaskId,
    request: ImageRequest,
    response: ImageResponse,
    completed: bool,
) {
    if !core.graph.contains(id) {
        return;
    }
    let container = &response.container;
    let should_store = if container.is_preview {
        core.config.is_storing_previews_in_memory_cache
    } else {
        completed
    };
    if should_store && request.options().is_memory_cache_write_allowed {
        core.memory_cache.set(
            ImageCacheKey::for_request(&request),
            container.clone(),
            container.cost(),
        );
    }
    core.send(id, TaskEvent::Value(TaskValue::Image(response), completed));
}

/// Encodes the final image on the encoding queue and stores it under the
/// processed-image disk key. Fire and forget; not bound to the task.
fn store_final_image_in_data_cache(
    core: &mut PipelineCore,
    request: &ImageRequest,
    response: &ImageResponse,
) {
    if !core.config.data_cache_stored_items.final_image {
        return;
    }
    let Some(cache) = core.config.data_cache.clone() else {
        return;
    };
    let encoder = Arc::clone(&core.config.encoder);
    let disk_key = keys::final_image_disk_key(request);
    let container = response.container.clone();
    let request = request.clone();
    core.queues
        .encoding
        .clone()
        .submit(Priority::VeryLow, move |token| {
            tokio::spawn(async move {
                let encoded = tokio::task::spawn_blocking(move || {
                    let context = EncodingContext { request: &request };
                    encoder.encode(&container, &context)
                })
                .await;
                if let Ok(Some(data)) = encoded {
                    cache.store_data(&disk_key, data);
                }
                token.finish();
            });
        });
}

// ---------------------------------------------------------------------------
// Stage 2 — processed image
// ---------------------------------------------------------------------------

pub(crate) fn processed_image_task(core: &mut PipelineCore, request: &ImageRequest) -> TaskId {
    let dedup = core.config.is_deduplication_enabled;
    let key = ImageLoadKey::for_request(request);
    if dedup {
        if let Some(id) = core.pools.processed.get_live(&key, &core.graph) {
            return id;
        }
    }
    let starter_request = request.clone();
    let id = core.make_task(Box::new(move |core, id| {
        start_processed(core, id, starter_request);
    }));
    if dedup {
        core.pools.processed.insert(key.clone(), id);
        if let Some(record) = core.graph.record_mut(id) {
            record.on_disposed = Some(Box::new(move |core| {
                core.pools.processed.remove_if(&key, id);
            }));
        }
    }
    id
}

fn start_processed(core: &mut PipelineCore, id: TaskId, request: ImageRequest) {
    if request.processors().is_empty() {
        let dep = original_image_task(core, &request);
        forward_all(core, id, dep);
        return;
    }

    if request.options().is_memory_cache_read_allowed {
        if let Some(container) = core.memory_cache.get(&ImageCacheKey::for_request(&request)) {
            if !container.is_preview {
                core.send(
                    id,
                    TaskEvent::Value(TaskValue::Image(ImageResponse::new(container, None)), true),
                );
                return;
            }
        }
    }

    if core.config.is_deduplication_enabled {
        // Peel off the last processor and share everything before it with
        // requests carrying the same prefix.
        let (subrequest, popped) = request.dropping_last_processor();
        let dep = processed_image_task(core, &subrequest);
        subscribe_for_processing(core, id, dep, request, popped);
    } else {
        let composite: Arc<dyn ImageProcessor> =
            Arc::new(CompositeProcessor::new(request.processors().to_vec()));
        let dep = original_image_task(core, &request);
        subscribe_for_processing(core, id, dep, request, composite);
    }
}

fn subscribe_for_processing(
    core: &mut PipelineCore,
    id: TaskId,
    dep: TaskId,
    request: ImageRequest,
    processor: Arc<dyn ImageProcessor>,
) {
    let priority = core.task_priority(id);
    let subscription = core.subscribe(
        dep,
        priority,
        Box::new(move |core, event| {
            if let Some((response, completed)) = event_image(event) {
                apply_processor(
                    core,
                    id,
                    request.clone(),
                    Arc::clone(&processor),
                    response.clone(),
                    completed,
                );
            } else if let Some((completed, total)) = event_progress(event) {
                core.send(id, TaskEvent::Progress(TaskProgress { completed, total }));
            } else if let Some(error) = event_error(event) {
                core.send(id, TaskEvent::Error(error.clone()));
            }
        }),
    );
    if let Some(subscription) = subscription {
        core.set_dependency(id, subscription);
    }
}

fn apply_processor(
    core: &mut PipelineCore,
    id: TaskId,
    request: ImageRequest,
    processor: Arc<dyn ImageProcessor>,
    response: ImageResponse,
    completed: bool,
) {
    if !core.graph.contains(id) {
        return;
    }

    let seq = core.next_op_seq();
    {
        let Some(record) = core.graph.record_mut(id) else {
            return;
        };
        if !matches!(record.stage, StageState::Process(_)) {
            record.stage = StageState::Process(OpState::default());
        }
        let StageState::Process(state) = &mut record.stage else {
            return;
        };
        if completed {
            if state.current_op.is_some() {
                if let Some(operation) = record.operation.take() {
                    operation.cancel();
                }
            }
        } else if state.current_op.is_some() {
            trace!(url = %request.url(), "progressive frame dropped (processing busy)");
            return;
        }
        state.current_op = Some(seq);
    }

    let url = request.url().to_string();
    let processor_id = processor.identifier();
    let compute_request = request;
    let op = core.run_on_queue(
        core.queues.processing.clone(),
        id,
        move || {
            let context = ProcessingContext {
                request: &compute_request,
                is_completed: completed,
            };
            let url_response = response.url_response.clone();
            processor
                .process(response.container, &context)
                .map(|container| ImageResponse {
                    container,
                    url_response,
                })
        },
        move |core, id, output| {
            {
                let Some(record) = core.graph.record_mut(id) else {
                    return;
                };
                let StageState::Process(state) = &mut record.stage else {
                    return;
                };
                if state.current_op != Some(seq) {
                    return;
                }
                state.current_op = None;
                record.operation = None;
            }
            match output {
                Some(response) => {
                    core.send(id, TaskEvent::Value(TaskValue::Image(response), completed));
                }
                None if completed => {
                    core.send(
                        id,
                        TaskEvent::Error(PipelineError::ProcessingFailed {
                            url,
                            processor: processor_id,
                        }),
                    );
                }
                None => {
                    // Progressive processing failures are dropped.
                    trace!(url = %url, "progressive processing failure dropped");
                }
            }
        },
    );
    core.set_operation(id, op);
}

// ---------------------------------------------------------------------------
// Stage 3 — original decoded image
// ---------------------------------------------------------------------------

pub(crate) fn original_image_task(core: &mut PipelineCore, request: &ImageRequest) -> TaskId {
    let dedup = core.config.is_deduplication_enabled;
    let key = DataLoadKey::for_request(request);
    if dedup {
        if let Some(id) = core.pools.original_image.get_live(&key, &core.graph) {
            return id;
        }
    }
    let starter_request = request.clone();
    let id = core.make_task(Box::new(move |core, id| {
        start_original_image(core, id, starter_request);
    }));
    if dedup {
        core.pools.original_image.insert(key.clone(), id);
        if let Some(record) = core.graph.record_mut(id) {
            record.on_disposed = Some(Box::new(move |core| {
                core.pools.original_image.remove_if(&key, id);
            }));
        }
    }
    id
}

fn start_original_image(core: &mut PipelineCore, id: TaskId, request: ImageRequest) {
    if let Some(record) = core.graph.record_mut(id) {
        record.stage = StageState::Decode(DecodeState::default());
    }
    let dep = original_data_task(core, &request);
    let priority = core.task_priority(id);
    let subscription = core.subscribe(
        dep,
        priority,
        Box::new(move |core, event| {
            if let Some((data, response, completed)) = event_data(event) {
                on_original_data(
                    core,
                    id,
                    request.clone(),
                    data.clone(),
                    response.cloned(),
                    completed,
                );
            } else if let Some((completed, total)) = event_progress(event) {
                core.send(id, TaskEvent::Progress(TaskProgress { completed, total }));
            } else if let Some(error) = event_error(event) {
                core.send(id, TaskEvent::Error(error.clone()));
            }
        }),
    );
    if let Some(subscription) = subscription {
        core.set_dependency(id, subscription);
    }
}

fn on_original_data(
    core: &mut PipelineCore,
    id: TaskId,
    request: ImageRequest,
    data: Bytes,
    url_response: Option<UrlResponse>,
    completed: bool,
) {
    if !completed && !core.config.is_progressive_decoding_enabled {
        return;
    }

    let seq = core.next_op_seq();
    let existing_decoder = {
        let Some(record) = core.graph.record_mut(id) else {
            return;
        };
        if !matches!(record.stage, StageState::Decode(_)) {
            record.stage = StageState::Decode(DecodeState::default());
        }
        let StageState::Decode(state) = &mut record.stage else {
            return;
        };
        if completed {
            if state.current_op.is_some() {
                if let Some(operation) = record.operation.take() {
                    operation.cancel();
                }
                state.current_op = None;
            }
        } else if state.current_op.is_some() {
            // Only one decode in flight; later chunks supersede this one.
            trace!(url = %request.url(), "chunk dropped (decoder busy)");
            return;
        }
        state.decoder.take()
    };

    // Decoders are constructed lazily once data starts to look decodable.
    let decoder = existing_decoder.or_else(|| {
        let context = DecodingContext {
            request: &request,
            data: &data,
            url_response: url_response.as_ref(),
            is_completed: completed,
        };
        core.config.decoders.decoder(&context)
    });
    let Some(mut decoder) = decoder else {
        if completed {
            core.send(
                id,
                TaskEvent::Error(PipelineError::DecoderNotRegistered {
                    url: request.url().to_string(),
                    data_len: data.len(),
                }),
            );
        }
        return;
    };

    {
        let Some(record) = core.graph.record_mut(id) else {
            return;
        };
        let StageState::Decode(state) = &mut record.stage else {
            return;
        };
        state.current_op = Some(seq);
    }

    let url = request.url().to_string();
    let op = core.run_on_queue(
        core.queues.decoding.clone(),
        id,
        move || {
            let container = decoder.decode(&data, completed);
            (decoder, container)
        },
        move |core, id, (decoder, container)| {
            {
                let Some(record) = core.graph.record_mut(id) else {
                    return;
                };
                let StageState::Decode(state) = &mut record.stage else {
                    return;
                };
                if state.current_op != Some(seq) {
                    return;
                }
                state.current_op = None;
                state.decoder = Some(decoder);
                record.operation = None;
            }
            match container {
                Some(container) => {
                    core.send(
                        id,
                        TaskEvent::Value(
                            TaskValue::Image(ImageResponse::new(container, url_response)),
                            completed,
                        ),
                    );
                }
                None if completed => {
                    core.send(id, TaskEvent::Error(PipelineError::DecodingFailed { url }));
                }
                None => {
                    // Not decodable yet; wait for more data.
                }
            }
        },
    );
    core.set_operation(id, op);
}

// ---------------------------------------------------------------------------
// Stage 4 — original image data
// ---------------------------------------------------------------------------

pub(crate) fn original_data_task(core: &mut PipelineCore, request: &ImageRequest) -> TaskId {
    let dedup = core.config.is_deduplication_enabled;
    let key = DataLoadKey::for_request(request);
    if dedup {
        if let Some(id) = core.pools.original_data.get_live(&key, &core.graph) {
            return id;
        }
    }
    let starter_request = request.clone();
    let id = core.make_task(Box::new(move |core, id| {
        start_original_data(core, id, starter_request);
    }));
    if dedup {
        core.pools.original_data.insert(key.clone(), id);
        if let Some(record) = core.graph.record_mut(id) {
            record.on_disposed = Some(Box::new(move |core| {
                core.pools.original_data.remove_if(&key, id);
            }));
        }
    }
    id
}

fn start_original_data(core: &mut PipelineCore, id: TaskId, request: ImageRequest) {
    if let Some(record) = core.graph.record_mut(id) {
        record.stage = StageState::Fetch(FetchState::new(request));
    }

    if core.config.is_rate_limiter_enabled {
        let flag = Arc::new(AtomicBool::new(false));
        if let Some(record) = core.graph.record_mut(id) {
            if let StageState::Fetch(state) = &mut record.stage {
                state.rate_limit_flag = Some(Arc::clone(&flag));
            }
        }
        let executor = core.executor.clone();
        let limiter = core.rate_limiter.clone();
        limiter.execute(flag, move || {
            executor.submit(move |core| admit_original_data(core, id));
        });
    } else {
        admit_original_data(core, id);
    }
}

fn admit_original_data(core: &mut PipelineCore, id: TaskId) {
    let request = {
        let Some(record) = core.graph.record(id) else {
            return;
        };
        let StageState::Fetch(state) = &record.stage else {
            return;
        };
        state.request.clone()
    };

    let policy = request.resource().cache_policy();
    if core.config.data_cache_stored_items.original_image_data
        && policy != CachePolicy::ReloadIgnoringCachedData
    {
        if let Some(cache) = core.config.data_cache.clone() {
            let disk_key = keys::original_image_disk_key(&request);
            let op = core.read_data_cache(id, cache, disk_key, move |core, id, data| {
                if !core.graph.contains(id) {
                    return;
                }
                match data {
                    Some(data) => {
                        trace!(url = %request.url(), "original data served from disk cache");
                        core.send(id, TaskEvent::Value(TaskValue::Data(data, None), true));
                    }
                    None => start_fetch(core, id),
                }
            });
            core.set_operation(id, op);
            return;
        }
    }

    start_fetch(core, id);
}

/// Wraps the network fetch in an operation on the data-loading queue so the
/// per-stage concurrency cap applies. The operation finishes when the
/// transport reports completion, not when the starting closure returns.
fn start_fetch(core: &mut PipelineCore, id: TaskId) {
    if !core.graph.contains(id) {
        return;
    }
    let executor = core.executor.clone();
    let priority = core.task_priority(id);
    let op = core
        .queues
        .data_loading
        .clone()
        .submit(priority, move |token| {
            executor.submit(move |core| begin_fetch(core, id, token));
        });
    core.set_operation(id, op);
}

fn begin_fetch(core: &mut PipelineCore, id: TaskId, token: WorkToken) {
    if token.is_cancelled() || !core.graph.contains(id) {
        token.finish();
        return;
    }
    let request = {
        let Some(record) = core.graph.record(id) else {
            token.finish();
            return;
        };
        let StageState::Fetch(state) = &record.stage else {
            token.finish();
            return;
        };
        state.request.clone()
    };

    let mut url_request = request.resource().as_url_request();
    let mut resumable_candidate = None;
    if core.config.is_resumable_data_enabled {
        if let Some(resumable) = core.resumable.take(request.url().as_str()) {
            debug!(
                url = %request.url(),
                offset = resumable.data.len(),
                "attempting range resume"
            );
            url_request = resumable.resuming_request(url_request);
            resumable_candidate = Some(resumable);
        }
    }

    let executor = core.executor.clone();
    let finish_executor = core.executor.clone();
    let sink = DataSink {
        on_data: Box::new(move |chunk, response| {
            let response = response.clone();
            executor.submit(move |core| on_fetch_chunk(core, id, chunk, response));
        }),
        on_finish: Box::new(move |error| {
            finish_executor.submit(move |core| on_fetch_finished(core, id, error));
        }),
    };
    let handle = core.config.data_loader.load_data(&url_request, sink);

    let Some(record) = core.graph.record_mut(id) else {
        handle.cancel();
        token.finish();
        return;
    };
    let StageState::Fetch(state) = &mut record.stage else {
        handle.cancel();
        token.finish();
        return;
    };
    state.loader_handle = Some(handle);
    state.token = Some(token);
    state.resumable_candidate = resumable_candidate;
}

fn on_fetch_chunk(core: &mut PipelineCore, id: TaskId, chunk: Bytes, response: UrlResponse) {
    let progressive = core.config.is_progressive_decoding_enabled;
    let count_resumed = core.config.resumed_bytes_count_toward_progress;

    let (progress, preview) = {
        let Some(record) = core.graph.record_mut(id) else {
            return;
        };
        let StageState::Fetch(state) = &mut record.stage else {
            return;
        };

        if state.url_response.is_none() {
            if let Some(resumable) = state.resumable_candidate.take() {
                if ResumableData::is_resumed_response(&response) {
                    debug!(url = %state.request.url(), "server honored range resume");
                    state.resumed = resumable.data.len() as u64;
                    state.received = state.resumed;
                    state.chunks.push(resumable.data);
                }
                // Anything but 206 invalidates the stored prefix.
            }
            state.expected = response.expected_content_length();
            state.url_response = Some(response);
        }

        state.received += chunk.len() as u64;
        state.chunks.push(chunk);

        let progress = if count_resumed {
            TaskProgress {
                completed: state.received,
                total: state.expected.map_or(0, |e| e + state.resumed),
            }
        } else {
            TaskProgress {
                completed: state.received - state.resumed,
                total: state.expected.unwrap_or(0),
            }
        };

        // The final chunk arrives through the terminal value instead.
        let total_len = state.expected.map(|e| e + state.resumed);
        let preview = (progressive && total_len.is_some_and(|t| state.received < t))
            .then(|| (state.assemble(), state.url_response.clone()));
        (progress, preview)
    };

    core.send(id, TaskEvent::Progress(progress));
    if let Some((data, url_response)) = preview {
        core.send(
            id,
            TaskEvent::Value(TaskValue::Data(data, url_response), false),
        );
    }
}

fn on_fetch_finished(
    core: &mut PipelineCore,
    id: TaskId,
    error: Option<crate::error::LoadError>,
) {
    let (token, outcome) = {
        let Some(record) = core.graph.record_mut(id) else {
            return;
        };
        let StageState::Fetch(state) = &mut record.stage else {
            return;
        };
        let token = state.token.take();
        state.loader_handle = None;
        match &error {
            None => {
                let data = state.assemble();
                let response = state.url_response.clone();
                let request = state.request.clone();
                (token, Ok((data, response, request)))
            }
            Some(err) => {
                let resumable = state
                    .url_response
                    .as_ref()
                    .filter(|_| state.received > 0)
                    .and_then(|response| ResumableData::new(response, state.assemble()));
                let url = state.request.url().as_str().to_string();
                (token, Err((err.clone(), resumable, url)))
            }
        }
    };

    if let Some(token) = token {
        token.finish();
    }

    match outcome {
        Ok((data, response, request)) => {
            if core.config.data_cache_stored_items.original_image_data {
                if let Some(cache) = &core.config.data_cache {
                    cache.store_data(&keys::original_image_disk_key(&request), data.clone());
                }
            }
            core.send(id, TaskEvent::Value(TaskValue::Data(data, response), true));
        }
        Err((err, resumable, url)) => {
            if core.config.is_resumable_data_enabled {
                if let Some(resumable) = resumable {
                    debug!(url = %url, bytes = resumable.data.len(), "parked resumable data");
                    core.resumable.store(&url, resumable);
                }
            }
            core.send(
                id,
                TaskEvent::Error(PipelineError::data_loading(err)),
            );
        }
    }
}

fn forward_all(core: &mut PipelineCore, id: TaskId, dep: TaskId) {
    let priority = core.task_priority(id);
    let subscription = core.subscribe(
        dep,
        priority,
        Box::new(move |core, event| {
            core.send(id, event.clone());
        }),
    );
    if let Some(subscription) = subscription {
        core.set_dependency(id, subscription);
    }
}

//! Low-priority bulk warm-up of the pipeline's caches.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::debug;
use url::Url;

use crate::exec::work_queue::{WorkHandle, WorkQueue, WorkToken};
use crate::pipeline::{ImageTask, Pipeline};
use crate::request::keys::ImageLoadKey;
use crate::request::{ImageRequest, Priority};

/// Admission slot shared between the completion callback and the stop
/// path; whichever runs first releases it.
type TokenSlot = Arc<Mutex<Option<WorkToken>>>;

/// Where prefetched images end up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrefetchDestination {
    /// Fetch, decode, process and decompress, then keep the result in the
    /// memory cache.
    #[default]
    MemoryCache,
    /// Fetch and store raw data in the disk cache, skipping decode.
    DiskCache,
}

struct PrefetchHandle {
    operation: WorkHandle,
    image_task: Option<ImageTask>,
    token_slot: Option<TokenSlot>,
}

struct PrefetcherState {
    tasks: HashMap<ImageLoadKey, PrefetchHandle>,
    priority: Priority,
}

/// Warms caches for URLs likely to be requested soon.
///
/// Requests run at the prefetcher's priority (low by default) through a
/// small dedicated admission queue, so prefetching never starves
/// interactive loads. Dropping the prefetcher cancels everything still
/// outstanding.
pub struct Prefetcher {
    pipeline: Pipeline,
    destination: PrefetchDestination,
    queue: WorkQueue,
    state: Arc<Mutex<PrefetcherState>>,
}

impl Prefetcher {
    pub fn new(pipeline: Pipeline) -> Self {
        Self::with_destination(pipeline, PrefetchDestination::default())
    }

    pub fn with_destination(pipeline: Pipeline, destination: PrefetchDestination) -> Self {
        Self {
            pipeline,
            destination,
            queue: WorkQueue::new(2),
            state: Arc::new(Mutex::new(PrefetcherState {
                tasks: HashMap::new(),
                priority: Priority::Low,
            })),
        }
    }

    pub fn start_prefetching_urls(&self, urls: impl IntoIterator<Item = Url>) {
        self.start_prefetching(urls.into_iter().map(ImageRequest::new));
    }

    pub fn start_prefetching(&self, requests: impl IntoIterator<Item = ImageRequest>) {
        for request in requests {
            self.start_one(request);
        }
    }

    fn start_one(&self, request: ImageRequest) {
        let priority = self.state.lock().unwrap().priority;
        let request = request.with_priority(priority);
        let key = ImageLoadKey::for_request(&request);

        let mut state = self.state.lock().unwrap();
        if state.tasks.contains_key(&key) {
            return;
        }
        if self.pipeline.cached_image(&request).is_some() {
            return;
        }

        let pipeline = self.pipeline.clone();
        let destination = self.destination;
        let prefetch_state = Arc::clone(&self.state);
        let task_key = key.clone();
        let operation = self.queue.submit(priority, move |token| {
            // The slot is released when the load completes, or by the stop
            // path if the prefetch is cancelled mid-flight.
            let token_slot: TokenSlot = Arc::new(Mutex::new(Some(token)));
            let finished_state = Arc::clone(&prefetch_state);
            let finished_key = task_key.clone();
            let finished_token = Arc::clone(&token_slot);
            let finished = move || {
                release_token(&finished_token);
                finished_state.lock().unwrap().tasks.remove(&finished_key);
            };

            let image_task = match destination {
                PrefetchDestination::MemoryCache => pipeline.load_image(
                    request,
                    None,
                    Box::new(move |_result| finished()),
                ),
                PrefetchDestination::DiskCache => pipeline.load_data(
                    request,
                    None,
                    Box::new(move |_result| finished()),
                ),
            };

            // Keep the handles so stop/priority updates reach the task.
            let mut state = prefetch_state.lock().unwrap();
            match state.tasks.get_mut(&task_key) {
                Some(handle) => {
                    handle.image_task = Some(image_task);
                    handle.token_slot = Some(token_slot);
                }
                None => {
                    // Stopped while starting.
                    drop(state);
                    image_task.cancel();
                    release_token(&token_slot);
                }
            }
        });

        debug!(?key, "prefetch queued");
        state.tasks.insert(
            key,
            PrefetchHandle {
                operation,
                image_task: None,
                token_slot: None,
            },
        );
    }

    pub fn stop_prefetching_urls(&self, urls: impl IntoIterator<Item = Url>) {
        self.stop_prefetching(urls.into_iter().map(ImageRequest::new));
    }

    pub fn stop_prefetching(&self, requests: impl IntoIterator<Item = ImageRequest>) {
        let mut state = self.state.lock().unwrap();
        for request in requests {
            let key = ImageLoadKey::for_request(&request);
            if let Some(handle) = state.tasks.remove(&key) {
                cancel_handle(handle);
            }
        }
    }

    pub fn stop_all(&self) {
        let mut state = self.state.lock().unwrap();
        for (_, handle) in state.tasks.drain() {
            cancel_handle(handle);
        }
    }

    pub fn priority(&self) -> Priority {
        self.state.lock().unwrap().priority
    }

    /// Re-prioritizes queued admissions and everything already in flight.
    pub fn set_priority(&self, priority: Priority) {
        let mut state = self.state.lock().unwrap();
        state.priority = priority;
        for handle in state.tasks.values() {
            handle.operation.set_priority(priority);
            if let Some(task) = &handle.image_task {
                task.set_priority(priority);
            }
        }
    }
}

fn cancel_handle(handle: PrefetchHandle) {
    handle.operation.cancel();
    if let Some(task) = handle.image_task {
        task.cancel();
    }
    if let Some(slot) = handle.token_slot {
        release_token(&slot);
    }
}

fn release_token(slot: &TokenSlot) {
    if let Some(token) = slot.lock().unwrap().take() {
        token.finish();
    }
}

impl Drop for Prefetcher {
    fn drop(&mut self) {
        self.stop_all();
    }
}

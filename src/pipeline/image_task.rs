//! Per-caller handle to one image load.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tracing::trace;

use crate::error::PipelineError;
use crate::exec::SerialExecutor;
use crate::image::ImageResponse;
use crate::loader::UrlResponse;
use crate::pipeline::{event_data, event_error, event_image, event_progress, stages, PipelineCore};
use crate::request::{ImageRequest, Priority};
use crate::task::{TaskProgress, TaskSubscription};

/// Progressive previews arrive with a response; byte progress without one.
pub type ImageProgressHandler = Box<dyn FnMut(Option<&ImageResponse>, u64, u64) + Send>;
pub type ImageCompletionHandler = Box<dyn FnOnce(Result<ImageResponse, PipelineError>) + Send>;

pub type DataProgressHandler = Box<dyn FnMut(u64, u64) + Send>;
pub type DataCompletionHandler =
    Box<dyn FnOnce(Result<(Bytes, Option<UrlResponse>), PipelineError>) + Send>;

pub(crate) struct ImageTaskState {
    pub(crate) priority: Mutex<Priority>,
    pub(crate) cancelled: AtomicBool,
    pub(crate) progress: Mutex<TaskProgress>,
    pub(crate) subscription: Mutex<Option<TaskSubscription>>,
}

/// Handle returned by [`Pipeline::load_image`](crate::Pipeline::load_image)
/// and [`Pipeline::load_data`](crate::Pipeline::load_data).
///
/// Cancellation and priority changes are thread-safe and take effect on the
/// pipeline's serial executor. Dropping the handle does *not* cancel the
/// load.
pub struct ImageTask {
    id: u64,
    state: Arc<ImageTaskState>,
    executor: SerialExecutor<PipelineCore>,
}

impl ImageTask {
    pub(crate) fn new(
        id: u64,
        executor: SerialExecutor<PipelineCore>,
        priority: Priority,
    ) -> Self {
        Self {
            id,
            state: Arc::new(ImageTaskState {
                priority: Mutex::new(priority),
                cancelled: AtomicBool::new(false),
                progress: Mutex::new(TaskProgress::default()),
                subscription: Mutex::new(None),
            }),
            executor,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Unsubscribes this caller. When it was the last subscriber the whole
    /// chain of underlying work is cancelled. Idempotent.
    pub fn cancel(&self) {
        if self.state.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        trace!(id = self.id, "image task cancelled");
        let state = Arc::clone(&self.state);
        self.executor.submit(move |core| {
            if let Some(subscription) = state.subscription.lock().unwrap().take() {
                core.unsubscribe(subscription);
            }
        });
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }

    pub fn priority(&self) -> Priority {
        *self.state.priority.lock().unwrap()
    }

    /// Updates this caller's priority; the effective task priority is the
    /// maximum across all subscribers.
    pub fn set_priority(&self, priority: Priority) {
        *self.state.priority.lock().unwrap() = priority;
        let state = Arc::clone(&self.state);
        self.executor.submit(move |core| {
            if let Some(subscription) = *state.subscription.lock().unwrap() {
                core.set_subscription_priority(subscription, priority);
            }
        });
    }

    /// Latest observed byte progress as `(completed, total)`.
    pub fn progress(&self) -> (u64, u64) {
        let progress = *self.state.progress.lock().unwrap();
        (progress.completed, progress.total)
    }

    pub(crate) fn state(&self) -> Arc<ImageTaskState> {
        Arc::clone(&self.state)
    }
}

/// Subscribes the caller to the decompressed-image stage. Runs on the
/// pipeline executor.
pub(crate) fn start_image_load(
    core: &mut PipelineCore,
    state: Arc<ImageTaskState>,
    request: ImageRequest,
    progress: Option<ImageProgressHandler>,
    completion: ImageCompletionHandler,
) {
    if state.cancelled.load(Ordering::SeqCst) {
        return;
    }
    let task = stages::decompressed_image_task(core, &request);
    let priority = *state.priority.lock().unwrap();

    let progress = progress.map(|handler| Arc::new(Mutex::new(handler)));
    let completion = Arc::new(Mutex::new(Some(completion)));
    let observer_state = Arc::clone(&state);

    let subscription = core.subscribe(
        task,
        priority,
        Box::new(move |core, event| {
            if let Some((completed, total)) = event_progress(event) {
                *observer_state.progress.lock().unwrap() = TaskProgress { completed, total };
                if let Some(progress) = &progress {
                    let progress = Arc::clone(progress);
                    core.dispatch_callback(Box::new(move || {
                        (progress.lock().unwrap())(None, completed, total);
                    }));
                }
            } else if let Some((response, is_completed)) = event_image(event) {
                if is_completed {
                    let completion = Arc::clone(&completion);
                    let response = response.clone();
                    core.dispatch_callback(Box::new(move || {
                        if let Some(completion) = completion.lock().unwrap().take() {
                            completion(Ok(response));
                        }
                    }));
                } else if let Some(progress) = &progress {
                    let (completed, total) = {
                        let snapshot = observer_state.progress.lock().unwrap();
                        (snapshot.completed, snapshot.total)
                    };
                    let progress = Arc::clone(progress);
                    let response = response.clone();
                    core.dispatch_callback(Box::new(move || {
                        (progress.lock().unwrap())(Some(&response), completed, total);
                    }));
                }
            } else if let Some(error) = event_error(event) {
                let completion = Arc::clone(&completion);
                let error = error.clone();
                core.dispatch_callback(Box::new(move || {
                    if let Some(completion) = completion.lock().unwrap().take() {
                        completion(Err(error));
                    }
                }));
            }
        }),
    );

    store_subscription(core, state, subscription);
}

/// Subscribes the caller to the original-data stage. Runs on the pipeline
/// executor.
pub(crate) fn start_data_load(
    core: &mut PipelineCore,
    state: Arc<ImageTaskState>,
    request: ImageRequest,
    progress: Option<DataProgressHandler>,
    completion: DataCompletionHandler,
) {
    if state.cancelled.load(Ordering::SeqCst) {
        return;
    }
    let task = stages::original_data_task(core, &request);
    let priority = *state.priority.lock().unwrap();

    let progress = progress.map(|handler| Arc::new(Mutex::new(handler)));
    let completion = Arc::new(Mutex::new(Some(completion)));
    let observer_state = Arc::clone(&state);

    let subscription = core.subscribe(
        task,
        priority,
        Box::new(move |core, event| {
            if let Some((completed, total)) = event_progress(event) {
                *observer_state.progress.lock().unwrap() = TaskProgress { completed, total };
                if let Some(progress) = &progress {
                    let progress = Arc::clone(progress);
                    core.dispatch_callback(Box::new(move || {
                        (progress.lock().unwrap())(completed, total);
                    }));
                }
            } else if let Some((data, response, true)) = event_data(event) {
                let completion = Arc::clone(&completion);
                let data = data.clone();
                let response = response.cloned();
                core.dispatch_callback(Box::new(move || {
                    if let Some(completion) = completion.lock().unwrap().take() {
                        completion(Ok((data, response)));
                    }
                }));
            } else if let Some(error) = event_error(event) {
                let completion = Arc::clone(&completion);
                let error = error.clone();
                core.dispatch_callback(Box::new(move || {
                    if let Some(completion) = completion.lock().unwrap().take() {
                        completion(Err(error));
                    }
                }));
            }
        }),
    );

    store_subscription(core, state, subscription);
}

fn store_subscription(
    core: &mut PipelineCore,
    state: Arc<ImageTaskState>,
    subscription: Option<TaskSubscription>,
) {
    let Some(subscription) = subscription else {
        // The task terminated synchronously; events already went out.
        return;
    };
    if state.cancelled.load(Ordering::SeqCst) {
        // Cancelled between submission and subscription.
        core.unsubscribe(subscription);
        return;
    }
    *state.subscription.lock().unwrap() = Some(subscription);
}

//! Tasks: multi-subscriber, priority-aware, cancellable units of work.
//!
//! Task records live in an arena owned by the pipeline and are addressed by
//! generational ids, so subscribers and continuations hold plain copyable
//! ids instead of owning references. A stale id (the task finished or was
//! cancelled) simply fails the lookup, which is how late results from
//! worker threads are discarded.
//!
//! All operations here must run on the pipeline's serial executor.

pub(crate) mod pool;

use bytes::Bytes;
use tracing::trace;

use crate::error::PipelineError;
use crate::exec::work_queue::WorkHandle;
use crate::image::ImageResponse;
use crate::loader::UrlResponse;
use crate::pipeline::stages::StageState;
use crate::pipeline::PipelineCore;
use crate::request::Priority;

/// Opaque generational handle to a task record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct TaskId {
    index: u32,
    generation: u32,
}

/// One subscriber's registration with a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TaskSubscription {
    pub task: TaskId,
    pub id: u64,
}

/// Payload flowing between stages.
#[derive(Debug, Clone)]
pub(crate) enum TaskValue {
    /// Cumulative downloaded bytes; the response is absent for cache hits.
    Data(Bytes, Option<UrlResponse>),
    Image(ImageResponse),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct TaskProgress {
    pub completed: u64,
    pub total: u64,
}

/// Events delivered to subscribers. The stream ends after the first
/// completed value or the first error.
#[derive(Debug, Clone)]
pub(crate) enum TaskEvent {
    Value(TaskValue, bool),
    Progress(TaskProgress),
    Error(PipelineError),
}

impl TaskEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskEvent::Value(_, true) | TaskEvent::Error(_))
    }
}

pub(crate) type Observer = Box<dyn FnMut(&mut PipelineCore, &TaskEvent) + Send>;
pub(crate) type Starter = Box<dyn FnOnce(&mut PipelineCore, TaskId) + Send>;
pub(crate) type DisposeHook = Box<dyn FnOnce(&mut PipelineCore) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DisposeReason {
    Finished,
    Cancelled,
}

struct Subscriber {
    id: u64,
    priority: Priority,
    /// Taken out during delivery so the observer can mutate the core.
    observer: Option<Observer>,
}

pub(crate) struct TaskRecord {
    subscribers: Vec<Subscriber>,
    next_subscription_id: u64,
    priority: Priority,
    started: bool,
    starter: Option<Starter>,
    pub(crate) dependency: Option<TaskSubscription>,
    pub(crate) operation: Option<WorkHandle>,
    pub(crate) on_cancelled: Option<DisposeHook>,
    pub(crate) on_disposed: Option<DisposeHook>,
    pub(crate) stage: StageState,
}

impl TaskRecord {
    fn new(starter: Starter) -> Self {
        Self {
            subscribers: Vec::new(),
            next_subscription_id: 0,
            priority: Priority::VeryLow,
            started: false,
            starter: Some(starter),
            dependency: None,
            operation: None,
            on_cancelled: None,
            on_disposed: None,
            stage: StageState::None,
        }
    }
}

struct Slot {
    generation: u32,
    record: Option<TaskRecord>,
}

/// Arena of task records.
pub(crate) struct TaskGraph {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    fn insert(&mut self, record: TaskRecord) -> TaskId {
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.record = Some(record);
                TaskId {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    record: Some(record),
                });
                TaskId {
                    index: (self.slots.len() - 1) as u32,
                    generation: 0,
                }
            }
        }
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.record(id).is_some()
    }

    pub fn record(&self, id: TaskId) -> Option<&TaskRecord> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.record.as_ref()
    }

    pub fn record_mut(&mut self, id: TaskId) -> Option<&mut TaskRecord> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.record.as_mut()
    }

    fn remove(&mut self, id: TaskId) -> Option<TaskRecord> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let record = slot.record.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        Some(record)
    }

    pub fn live_count(&self) -> usize {
        self.slots.len() - self.free.len()
    }
}

impl PipelineCore {
    /// Creates a task whose starter runs on first subscription.
    pub(crate) fn make_task(&mut self, starter: Starter) -> TaskId {
        self.graph.insert_record(TaskRecord::new(starter))
    }

    /// Registers an observer. Returns `None` when the task is already
    /// disposed, including the case where the starter terminates the task
    /// synchronously.
    pub(crate) fn subscribe(
        &mut self,
        task: TaskId,
        priority: Priority,
        observer: Observer,
    ) -> Option<TaskSubscription> {
        let (id, first) = {
            let record = self.graph.record_mut(task)?;
            let id = record.next_subscription_id;
            record.next_subscription_id += 1;
            record.subscribers.push(Subscriber {
                id,
                priority,
                observer: Some(observer),
            });
            let first = !record.started;
            record.started = true;
            (id, first)
        };
        self.recompute_task_priority(task);

        if first {
            let starter = self
                .graph
                .record_mut(task)
                .and_then(|record| record.starter.take());
            if let Some(starter) = starter {
                starter(self, task);
            }
        }

        if self.graph.contains(task) {
            Some(TaskSubscription { task, id })
        } else {
            None
        }
    }

    /// Removes the subscriber; cancels the task when it was the last one.
    pub(crate) fn unsubscribe(&mut self, subscription: TaskSubscription) {
        let now_empty = {
            let Some(record) = self.graph.record_mut(subscription.task) else {
                return;
            };
            let before = record.subscribers.len();
            record.subscribers.retain(|s| s.id != subscription.id);
            if record.subscribers.len() == before {
                return;
            }
            record.subscribers.is_empty()
        };
        if now_empty {
            self.dispose(subscription.task, DisposeReason::Cancelled);
        } else {
            self.recompute_task_priority(subscription.task);
        }
    }

    pub(crate) fn set_subscription_priority(
        &mut self,
        subscription: TaskSubscription,
        priority: Priority,
    ) {
        let changed = {
            let Some(record) = self.graph.record_mut(subscription.task) else {
                return;
            };
            let Some(subscriber) = record
                .subscribers
                .iter_mut()
                .find(|s| s.id == subscription.id)
            else {
                return;
            };
            if subscriber.priority == priority {
                false
            } else {
                subscriber.priority = priority;
                true
            }
        };
        if changed {
            self.recompute_task_priority(subscription.task);
        }
    }

    /// Delivers the event to all current subscribers in registration order,
    /// then disposes the task if the event was terminal. No-op for
    /// disposed tasks.
    pub(crate) fn send(&mut self, task: TaskId, event: TaskEvent) {
        let Some(record) = self.graph.record(task) else {
            return;
        };
        let ids: Vec<u64> = record.subscribers.iter().map(|s| s.id).collect();

        for id in ids {
            // An earlier observer may have disposed the task or removed
            // this subscriber.
            let observer = match self.graph.record_mut(task) {
                Some(record) => record
                    .subscribers
                    .iter_mut()
                    .find(|s| s.id == id)
                    .and_then(|s| s.observer.take()),
                None => return,
            };
            let Some(mut observer) = observer else {
                continue;
            };
            observer(self, &event);
            if let Some(record) = self.graph.record_mut(task) {
                if let Some(subscriber) = record.subscribers.iter_mut().find(|s| s.id == id) {
                    subscriber.observer = Some(observer);
                }
            }
        }

        if event.is_terminal() {
            self.dispose(task, DisposeReason::Finished);
        }
    }

    /// Binds the dependency subscription, or unwinds it when the task got
    /// disposed while the dependency was being set up.
    pub(crate) fn set_dependency(&mut self, task: TaskId, dependency: TaskSubscription) {
        match self.graph.record_mut(task) {
            Some(record) => record.dependency = Some(dependency),
            None => self.unsubscribe(dependency),
        }
    }

    /// Binds the queue operation, or cancels it when the task is gone.
    pub(crate) fn set_operation(&mut self, task: TaskId, operation: WorkHandle) {
        match self.graph.record_mut(task) {
            Some(record) => {
                operation.set_priority(record.priority);
                record.operation = Some(operation);
            }
            None => operation.cancel(),
        }
    }

    pub(crate) fn task_priority(&self, task: TaskId) -> Priority {
        self.graph
            .record(task)
            .map(|record| record.priority)
            .unwrap_or_default()
    }

    /// Effective priority is the maximum across live subscribers; changes
    /// propagate to the bound operation and down the dependency chain.
    fn recompute_task_priority(&mut self, task: TaskId) {
        let dependency = {
            let Some(record) = self.graph.record_mut(task) else {
                return;
            };
            let Some(max) = record.subscribers.iter().map(|s| s.priority).max() else {
                return;
            };
            if max == record.priority {
                return;
            }
            record.priority = max;
            if let Some(operation) = &record.operation {
                operation.set_priority(max);
            }
            record.dependency
        };
        if let Some(dependency) = dependency {
            let priority = self.task_priority(task);
            self.set_subscription_priority(dependency, priority);
        }
    }

    /// Removes the record and runs the teardown hooks. Idempotent: a second
    /// call with the same id finds nothing.
    pub(crate) fn dispose(&mut self, task: TaskId, reason: DisposeReason) {
        let Some(mut record) = self.graph.remove_record(task) else {
            return;
        };
        trace!(?task, ?reason, "task disposed");
        record.subscribers.clear();

        let dependency = record.dependency.take();
        match reason {
            DisposeReason::Cancelled => {
                if let Some(operation) = record.operation.take() {
                    operation.cancel();
                }
                if let Some(dependency) = dependency {
                    self.unsubscribe(dependency);
                }
                let mut stage = std::mem::replace(&mut record.stage, StageState::None);
                stage.cancel_cleanup(self);
                if let Some(hook) = record.on_cancelled.take() {
                    hook(self);
                }
            }
            DisposeReason::Finished => {
                if let Some(dependency) = dependency {
                    self.unsubscribe(dependency);
                }
                let mut stage = std::mem::replace(&mut record.stage, StageState::None);
                stage.finished_cleanup();
            }
        }
        if let Some(hook) = record.on_disposed.take() {
            hook(self);
        }
    }
}

// Arena plumbing kept separate from the task semantics above.
impl TaskGraph {
    pub(crate) fn insert_record(&mut self, record: TaskRecord) -> TaskId {
        self.insert(record)
    }

    pub(crate) fn remove_record(&mut self, id: TaskId) -> Option<TaskRecord> {
        self.remove(id)
    }
}

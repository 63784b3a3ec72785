//! Bounded work queues for the heavy pipeline stages.
//!
//! Each stage owns a queue with a concurrency cap. Queued items carry a
//! priority and can be re-prioritized or cancelled before they start.
//! Items finish cooperatively: the work receives a [`WorkToken`] and must
//! call [`WorkToken::finish`] when its logical work is done, which may be
//! long after the starting closure returned (e.g. when a network callback
//! completes the operation).

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::trace;

use crate::request::Priority;

type WorkFn = Box<dyn FnOnce(WorkToken) + Send>;

struct QueuedItem {
    priority: Priority,
    work: WorkFn,
    shared: Arc<ItemShared>,
}

struct ItemShared {
    cancelled: AtomicBool,
}

struct QueueState {
    max_concurrent: usize,
    active: usize,
    // One FIFO bucket per priority level; dispatch pops the highest
    // non-empty bucket.
    buckets: [VecDeque<u64>; 5],
    items: HashMap<u64, QueuedItem>,
    next_id: u64,
}

impl QueueState {
    fn enqueue(&mut self, priority: Priority, work: WorkFn, shared: Arc<ItemShared>) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        self.items.insert(
            id,
            QueuedItem {
                priority,
                work,
                shared,
            },
        );
        self.buckets[priority.bucket()].push_back(id);
        id
    }

    fn dequeue(&mut self) -> Option<QueuedItem> {
        for level in (0..self.buckets.len()).rev() {
            while let Some(id) = self.buckets[level].pop_front() {
                // Ids left behind by cancel or re-prioritization are stale;
                // an item is live only in the bucket matching its current
                // priority.
                let live = self
                    .items
                    .get(&id)
                    .is_some_and(|item| item.priority.bucket() == level);
                if live {
                    return self.items.remove(&id);
                }
            }
        }
        None
    }
}

/// A bounded-concurrency queue. Construct inside a tokio runtime.
#[derive(Clone)]
pub(crate) struct WorkQueue {
    state: Arc<Mutex<QueueState>>,
    runtime: tokio::runtime::Handle,
}

impl WorkQueue {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState {
                max_concurrent: max_concurrent.max(1),
                active: 0,
                buckets: Default::default(),
                items: HashMap::new(),
                next_id: 0,
            })),
            runtime: tokio::runtime::Handle::current(),
        }
    }

    /// Enqueues work and returns a handle for cancellation and priority
    /// updates. Work starts when a concurrency slot frees up.
    pub fn submit(
        &self,
        priority: Priority,
        work: impl FnOnce(WorkToken) + Send + 'static,
    ) -> WorkHandle {
        let shared = Arc::new(ItemShared {
            cancelled: AtomicBool::new(false),
        });
        let id = {
            let mut state = self.state.lock().unwrap();
            state.enqueue(priority, Box::new(work), Arc::clone(&shared))
        };
        self.pump();
        WorkHandle {
            id,
            shared,
            queue: Arc::clone(&self.state),
        }
    }

    pub fn active_count(&self) -> usize {
        self.state.lock().unwrap().active
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().unwrap().items.len()
    }

    /// Starts queued work while slots are free.
    fn pump(&self) {
        loop {
            let item = {
                let mut state = self.state.lock().unwrap();
                if state.active >= state.max_concurrent {
                    return;
                }
                let Some(item) = state.dequeue() else {
                    return;
                };
                state.active += 1;
                item
            };
            let token = WorkToken {
                shared: item.shared,
                queue: self.clone(),
                finished: Arc::new(AtomicBool::new(false)),
            };
            if token.is_cancelled() {
                // Admitted between cancel and removal; release the slot.
                token.finish();
                continue;
            }
            let work = item.work;
            self.runtime.spawn(async move {
                work(token);
            });
        }
    }

    fn finish_one(&self) {
        {
            let mut state = self.state.lock().unwrap();
            state.active = state.active.saturating_sub(1);
        }
        self.pump();
    }
}

/// Given to running work; releases the concurrency slot exactly once.
pub(crate) struct WorkToken {
    shared: Arc<ItemShared>,
    queue: WorkQueue,
    finished: Arc<AtomicBool>,
}

impl WorkToken {
    pub fn finish(&self) {
        if !self.finished.swap(true, Ordering::SeqCst) {
            self.queue.finish_one();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::SeqCst)
    }
}

/// External handle to one submitted item.
pub(crate) struct WorkHandle {
    id: u64,
    shared: Arc<ItemShared>,
    queue: Arc<Mutex<QueueState>>,
}

impl WorkHandle {
    /// Cancels the item. Pending work never starts; running work observes
    /// the flag cooperatively through its token.
    pub fn cancel(&self) {
        self.shared.cancelled.store(true, Ordering::SeqCst);
        let removed = {
            let mut state = self.queue.lock().unwrap();
            state.items.remove(&self.id).is_some()
        };
        if removed {
            trace!(id = self.id, "cancelled queued work");
        }
    }

    /// Moves the item to another priority bucket if it has not started.
    pub fn set_priority(&self, priority: Priority) {
        let mut guard = self.queue.lock().unwrap();
        let state = &mut *guard;
        if let Some(item) = state.items.get_mut(&self.id) {
            if item.priority != priority {
                item.priority = priority;
                // The old bucket keeps a stale id; dequeue skips it.
                state.buckets[priority.bucket()].push_back(self.id);
            }
        }
    }
}

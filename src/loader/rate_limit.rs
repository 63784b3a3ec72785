//! Token-bucket admission control in front of network dispatch.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::trace;

/// Classic token bucket with lazy linear refill.
struct TokenBucket {
    rate: f64,
    burst: f64,
    bucket: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(rate: f64, burst: f64) -> Self {
        Self {
            rate,
            burst,
            bucket: burst,
            last_refill: Instant::now(),
        }
    }

    fn try_consume(&mut self, count: f64, now: Instant) -> bool {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.bucket = (self.bucket + self.rate * elapsed).min(self.burst);
        self.last_refill = now;
        if self.bucket >= count {
            self.bucket -= count;
            true
        } else {
            false
        }
    }
}

struct Pending {
    work: Box<dyn FnOnce() + Send>,
    cancelled: Arc<AtomicBool>,
}

struct LimiterState {
    bucket: TokenBucket,
    pending: VecDeque<Pending>,
    drain_scheduled: bool,
}

/// Admits work immediately while tokens last; queues the rest and drains the
/// queue in FIFO order on a deferred timer. Construct inside a tokio
/// runtime.
#[derive(Clone)]
pub struct RateLimiter {
    state: Arc<Mutex<LimiterState>>,
    drain_delay: Duration,
}

impl RateLimiter {
    /// Defaults: 80 requests per second with a burst of 25.
    pub fn new() -> Self {
        Self::with_limits(80.0, 25.0)
    }

    pub fn with_limits(rate: f64, burst: f64) -> Self {
        // Wake a little slower than the refill period so a drain admits a
        // few items per run.
        let delay_ms = (2.1 * (1000.0 / rate)).clamp(15.0, 100.0);
        Self {
            state: Arc::new(Mutex::new(LimiterState {
                bucket: TokenBucket::new(rate, burst),
                pending: VecDeque::new(),
                drain_scheduled: false,
            })),
            drain_delay: Duration::from_millis(delay_ms as u64),
        }
    }

    /// Runs `work` now if a token is available, otherwise queues it. The
    /// cancellation flag is checked at drain time; cancelled items are
    /// dropped without consuming a token.
    pub fn execute(&self, cancelled: Arc<AtomicBool>, work: impl FnOnce() + Send + 'static) {
        let run_now = {
            let mut state = self.state.lock().unwrap();
            if state.pending.is_empty() && state.bucket.try_consume(1.0, Instant::now()) {
                true
            } else {
                state.pending.push_back(Pending {
                    work: Box::new(work),
                    cancelled,
                });
                let needs_drain = !state.drain_scheduled;
                state.drain_scheduled = true;
                if needs_drain {
                    self.schedule_drain();
                }
                return;
            }
        };
        if run_now {
            work();
        }
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().unwrap().pending.len()
    }

    fn schedule_drain(&self) {
        let limiter = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(limiter.drain_delay).await;
            limiter.drain();
        });
    }

    fn drain(&self) {
        let mut admitted: Vec<Box<dyn FnOnce() + Send>> = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            state.drain_scheduled = false;
            while let Some(item) = state.pending.front() {
                if item.cancelled.load(Ordering::SeqCst) {
                    state.pending.pop_front();
                    continue;
                }
                if !state.bucket.try_consume(1.0, Instant::now()) {
                    break;
                }
                let item = state.pending.pop_front().unwrap();
                admitted.push(item.work);
            }
            if !state.pending.is_empty() && !state.drain_scheduled {
                state.drain_scheduled = true;
                self.schedule_drain();
            }
        }
        trace!(admitted = admitted.len(), "rate limiter drain");
        for work in admitted {
            work();
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

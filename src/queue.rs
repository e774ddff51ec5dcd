// src/queue.rs
//
// Bounded, thread-safe frame queue decoupling the capture loop from
// consumers. Capacity is fixed at construction and never exceeded;
// overflow behavior is explicit and counted, never silent.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::frame::Frame;

/// What a full queue does with the next push.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the head to admit the new frame. Favors freshness; the
    /// eviction is counted as a drop.
    DropOldest,
    /// Reject the new frame.
    DropNewest,
    /// Producer waits for space, bounded. On expiry the frame is dropped
    /// and counted; the capture path is never blocked indefinitely.
    Block { max_wait_ms: u64 },
}

/// Why a frame was dropped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DropReason {
    /// Queue full under `DropNewest`.
    Full,
    /// Bounded wait expired under `Block`.
    Timeout,
    /// Queue closed for teardown.
    Closed,
}

/// Outcome of a push.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PushOutcome {
    /// Frame enqueued.
    Accepted,
    /// Frame enqueued after evicting the oldest entry (`DropOldest`).
    /// The eviction is counted against the drop counter.
    AcceptedAfterEviction,
    /// Frame rejected.
    Dropped(DropReason),
}

struct Inner {
    buf: VecDeque<Frame>,
    closed: bool,
}

/// Fixed-capacity concurrent FIFO queue for captured frames.
///
/// The only structure in the core shared between two execution contexts:
/// the capture loop pushes, a consumer loop pops.
pub struct FrameQueue {
    inner: Mutex<Inner>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
    policy: OverflowPolicy,
    accepted: AtomicU64,
    dropped: AtomicU64,
}

impl FrameQueue {
    /// Default capacity when none is configured.
    pub const DEFAULT_CAPACITY: usize = 256;

    pub fn new(policy: OverflowPolicy) -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY, policy)
    }

    /// Capacity is clamped to at least one entry.
    pub fn with_capacity(capacity: usize, policy: OverflowPolicy) -> Self {
        let capacity = capacity.max(1);
        FrameQueue {
            inner: Mutex::new(Inner {
                buf: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
            policy,
            accepted: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue a frame, applying the overflow policy when full.
    pub fn push(&self, frame: Frame) -> PushOutcome {
        let Ok(mut inner) = self.inner.lock() else {
            return PushOutcome::Dropped(DropReason::Closed);
        };
        if inner.closed {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return PushOutcome::Dropped(DropReason::Closed);
        }

        if inner.buf.len() >= self.capacity {
            match self.policy {
                OverflowPolicy::DropOldest => {
                    inner.buf.pop_front();
                    inner.buf.push_back(frame);
                    self.accepted.fetch_add(1, Ordering::Relaxed);
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    self.not_empty.notify_one();
                    return PushOutcome::AcceptedAfterEviction;
                }
                OverflowPolicy::DropNewest => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    return PushOutcome::Dropped(DropReason::Full);
                }
                OverflowPolicy::Block { max_wait_ms } => {
                    let deadline = Instant::now() + Duration::from_millis(max_wait_ms);
                    while inner.buf.len() >= self.capacity && !inner.closed {
                        let remaining = deadline.saturating_duration_since(Instant::now());
                        if remaining.is_zero() {
                            self.dropped.fetch_add(1, Ordering::Relaxed);
                            return PushOutcome::Dropped(DropReason::Timeout);
                        }
                        let (guard, _) = match self.not_full.wait_timeout(inner, remaining) {
                            Ok(r) => r,
                            Err(_) => return PushOutcome::Dropped(DropReason::Closed),
                        };
                        inner = guard;
                    }
                    if inner.closed {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        return PushOutcome::Dropped(DropReason::Closed);
                    }
                }
            }
        }

        inner.buf.push_back(frame);
        self.accepted.fetch_add(1, Ordering::Relaxed);
        self.not_empty.notify_one();
        PushOutcome::Accepted
    }

    /// Dequeue the oldest frame, waiting up to `timeout` for one to
    /// arrive. `None` means empty-on-timeout or closed-and-drained; it is
    /// a normal outcome, not a fault.
    pub fn pop(&self, timeout: Duration) -> Option<Frame> {
        let deadline = Instant::now() + timeout;
        let Ok(mut inner) = self.inner.lock() else {
            return None;
        };
        loop {
            if let Some(frame) = inner.buf.pop_front() {
                self.not_full.notify_one();
                return Some(frame);
            }
            if inner.closed {
                return None;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let (guard, _) = self.not_empty.wait_timeout(inner, remaining).ok()?;
            inner = guard;
        }
    }

    /// Close the queue for teardown. Pending frames remain poppable;
    /// new pushes are dropped and all waiters wake.
    pub fn close(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.closed = true;
        }
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().map(|i| i.closed).unwrap_or(true)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|i| i.buf.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Frames successfully enqueued over the queue's lifetime.
    pub fn accepted_count(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    /// Frames dropped over the queue's lifetime (evictions included).
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

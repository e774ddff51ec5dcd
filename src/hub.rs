// src/hub.rs
//
// Dispatch hub: fans out queued frames to registered sinks.
//
// Each sink sits behind its own bounded sub-queue and worker thread, so
// one slow or blocked sink cannot starve the others and delivery order
// per sink matches capture order. A sink that errors is deregistered
// automatically; the rest keep receiving.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::CaptureError;
use crate::queue::{FrameQueue, OverflowPolicy, PushOutcome};
use crate::sink::FrameSink;

/// Identifies one sink registration.
pub type RegistrationId = Uuid;

/// Per-sink sub-queue depth. Deep enough to ride out short stalls, small
/// enough that a wedged sink shows up in the drop counters quickly.
const SINK_QUEUE_CAPACITY: usize = 64;

/// How a sink's sub-queue behaves when the sink falls behind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryPolicy {
    /// The hub waits for space, bounded; an expired wait drops the frame.
    /// For sinks where completeness matters more than latency.
    Blocking { max_wait_ms: u64 },
    /// Keep the freshest frames. The right choice for live display.
    DropOldest,
    /// Keep the oldest frames, reject new ones.
    DropNewest,
}

impl DeliveryPolicy {
    fn overflow_policy(&self) -> OverflowPolicy {
        match *self {
            DeliveryPolicy::Blocking { max_wait_ms } => OverflowPolicy::Block { max_wait_ms },
            DeliveryPolicy::DropOldest => OverflowPolicy::DropOldest,
            DeliveryPolicy::DropNewest => OverflowPolicy::DropNewest,
        }
    }
}

struct Registration {
    name: String,
    queue: Arc<FrameQueue>,
    delivered: Arc<AtomicU64>,
    failed: Arc<AtomicBool>,
    worker: Option<thread::JoinHandle<()>>,
}

struct HubShared {
    registrations: Mutex<HashMap<RegistrationId, Registration>>,
    stop: AtomicBool,
    dispatched: AtomicU64,
    sink_failures: AtomicU64,
}

/// Status of one registered sink.
#[derive(Clone, Debug, Serialize)]
pub struct SinkStatus {
    pub id: RegistrationId,
    pub name: String,
    pub delivered: u64,
    pub dropped: u64,
}

/// Point-in-time hub status.
#[derive(Clone, Debug, Serialize)]
pub struct HubStatus {
    pub running: bool,
    pub queue_depth: usize,
    pub queue_dropped: u64,
    pub dispatched: u64,
    pub sink_failures: u64,
    pub sinks: Vec<SinkStatus>,
}

/// Fans frames out from a capture queue to registered sinks.
///
/// Registration and deregistration are independent of capture state.
pub struct DispatchHub {
    queue: Arc<FrameQueue>,
    shared: Arc<HubShared>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl DispatchHub {
    pub fn new(queue: Arc<FrameQueue>) -> Self {
        DispatchHub {
            queue,
            shared: Arc::new(HubShared {
                registrations: Mutex::new(HashMap::new()),
                stop: AtomicBool::new(false),
                dispatched: AtomicU64::new(0),
                sink_failures: AtomicU64::new(0),
            }),
            task: None,
        }
    }

    /// Start the dispatch loop. Must be called within a Tokio runtime.
    /// A no-op when already running.
    pub fn start(&mut self) {
        if self.task.is_some() {
            return;
        }
        self.shared.stop.store(false, Ordering::SeqCst);
        let queue = self.queue.clone();
        let shared = self.shared.clone();
        self.task = Some(tokio::task::spawn_blocking(move || {
            run_dispatch_loop(queue, shared);
        }));
    }

    /// Attach a sink. Its worker starts immediately and delivers frames
    /// in capture order, under the given policy.
    pub fn register(&self, sink: Box<dyn FrameSink>, policy: DeliveryPolicy) -> RegistrationId {
        let id = Uuid::new_v4();
        let name = sink.name().to_string();
        let queue = Arc::new(FrameQueue::with_capacity(
            SINK_QUEUE_CAPACITY,
            policy.overflow_policy(),
        ));
        let delivered = Arc::new(AtomicU64::new(0));
        let failed = Arc::new(AtomicBool::new(false));

        let worker = {
            let queue = queue.clone();
            let delivered = delivered.clone();
            let failed = failed.clone();
            let name = name.clone();
            thread::spawn(move || run_sink_worker(sink, queue, delivered, failed, name))
        };

        if let Ok(mut regs) = self.shared.registrations.lock() {
            regs.insert(
                id,
                Registration {
                    name: name.clone(),
                    queue,
                    delivered,
                    failed,
                    worker: Some(worker),
                },
            );
        }
        info!(sink = %name, %id, "sink registered");
        id
    }

    /// Detach a sink, joining its worker after the sub-queue drains.
    pub fn deregister(&self, id: RegistrationId) -> Result<(), CaptureError> {
        let registration = {
            let Ok(mut regs) = self.shared.registrations.lock() else {
                return Err(CaptureError::SinkNotFound(id));
            };
            regs.remove(&id)
        };
        match registration {
            Some(mut reg) => {
                reg.queue.close();
                if let Some(worker) = reg.worker.take() {
                    let _ = worker.join();
                }
                info!(sink = %reg.name, %id, "sink deregistered");
                Ok(())
            }
            None => Err(CaptureError::SinkNotFound(id)),
        }
    }

    pub fn status(&self) -> HubStatus {
        let sinks = self
            .shared
            .registrations
            .lock()
            .map(|regs| {
                regs.iter()
                    .map(|(id, reg)| SinkStatus {
                        id: *id,
                        name: reg.name.clone(),
                        delivered: reg.delivered.load(Ordering::Relaxed),
                        dropped: reg.queue.dropped_count(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        HubStatus {
            running: self.task.is_some(),
            queue_depth: self.queue.len(),
            queue_dropped: self.queue.dropped_count(),
            dispatched: self.shared.dispatched.load(Ordering::Relaxed),
            sink_failures: self.shared.sink_failures.load(Ordering::Relaxed),
            sinks,
        }
    }

    /// Stop the dispatch loop and detach every sink.
    pub async fn shutdown(&mut self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        let ids: Vec<RegistrationId> = self
            .shared
            .registrations
            .lock()
            .map(|regs| regs.keys().copied().collect())
            .unwrap_or_default();
        for id in ids {
            let _ = self.deregister(id);
        }
        info!("dispatch hub shut down");
    }
}

fn run_dispatch_loop(queue: Arc<FrameQueue>, shared: Arc<HubShared>) {
    info!("dispatch hub started");
    while !shared.stop.load(Ordering::SeqCst) {
        reap_failed_sinks(&shared);

        match queue.pop(Duration::from_millis(50)) {
            Some(frame) => {
                shared.dispatched.fetch_add(1, Ordering::Relaxed);
                if let Ok(regs) = shared.registrations.lock() {
                    for reg in regs.values() {
                        if reg.failed.load(Ordering::Relaxed) {
                            continue;
                        }
                        if let PushOutcome::Dropped(reason) = reg.queue.push(frame.clone()) {
                            debug!(sink = %reg.name, ?reason, "frame dropped for sink");
                        }
                    }
                }
            }
            None => {
                if queue.is_closed() {
                    break;
                }
            }
        }
    }
    reap_failed_sinks(&shared);
    info!("dispatch hub stopped");
}

/// Remove registrations whose worker reported a sink error. The failure
/// is isolated: other sinks keep their workers and queues.
fn reap_failed_sinks(shared: &HubShared) {
    let dead: Vec<(RegistrationId, Registration)> = {
        let Ok(mut regs) = shared.registrations.lock() else {
            return;
        };
        let ids: Vec<RegistrationId> = regs
            .iter()
            .filter(|(_, reg)| reg.failed.load(Ordering::Relaxed))
            .map(|(id, _)| *id)
            .collect();
        ids.into_iter()
            .filter_map(|id| regs.remove(&id).map(|reg| (id, reg)))
            .collect()
    };
    for (id, mut reg) in dead {
        reg.queue.close();
        if let Some(worker) = reg.worker.take() {
            let _ = worker.join();
        }
        shared.sink_failures.fetch_add(1, Ordering::Relaxed);
        warn!(sink = %reg.name, %id, "sink failed and was deregistered");
    }
}

fn run_sink_worker(
    mut sink: Box<dyn FrameSink>,
    queue: Arc<FrameQueue>,
    delivered: Arc<AtomicU64>,
    failed: Arc<AtomicBool>,
    name: String,
) {
    loop {
        match queue.pop(Duration::from_millis(100)) {
            Some(frame) => match sink.receive(&frame) {
                Ok(()) => {
                    delivered.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    warn!(sink = %name, error = %e, "sink rejected frame");
                    failed.store(true, Ordering::SeqCst);
                    break;
                }
            },
            None => {
                if queue.is_closed() {
                    break;
                }
            }
        }
    }
    debug!(sink = %name, "sink worker exited");
}

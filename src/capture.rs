// src/capture.rs
//
// Capture session: owns the channel source lifecycle and the dedicated
// blocking read loop that feeds the frame queue.
//
// At most one capture loop runs per session. The loop is the only code
// that touches the source after start(); control calls communicate with
// it through the shared state and the stop flag, and stop() is observable
// within one read-timeout interval.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::CaptureError;
use crate::frame::Frame;
use crate::queue::{FrameQueue, PushOutcome};
use crate::source::{open_source, BusConfig, ChannelSource, ReadOutcome, SourceConfig};

/// Default `read_frame` timeout. Bounds worst-case stop latency.
pub const DEFAULT_READ_TIMEOUT_MS: u64 = 1_000;

const STATS_INTERVAL: Duration = Duration::from_secs(5);

/// Current state of a capture session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureState {
    Stopped,
    Starting,
    Running,
    Pausing,
    Paused,
    Stopping,
}

impl std::fmt::Display for CaptureState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CaptureState::Stopped => "stopped",
            CaptureState::Starting => "starting",
            CaptureState::Running => "running",
            CaptureState::Pausing => "pausing",
            CaptureState::Paused => "paused",
            CaptureState::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

/// Messages surfaced from the capture loop to the operational surface.
#[derive(Clone, Debug)]
pub enum CaptureEvent {
    StateChanged {
        previous: CaptureState,
        current: CaptureState,
    },
    /// Runtime device fault. Capture has already stopped when this is
    /// delivered.
    DeviceError(String),
    /// The capture loop exited. Reason is "stopped" or "error".
    Ended { reason: &'static str },
}

/// Point-in-time session status for the operational surface.
#[derive(Clone, Debug, Serialize)]
pub struct CaptureStatus {
    pub state: CaptureState,
    /// Channel identity once a source has been opened.
    pub channel: Option<String>,
    /// Frames read from the source over the session's lifetime.
    pub frames_captured: u64,
    /// Frames dropped by the queue's overflow policy.
    pub frames_dropped: u64,
    pub last_error: Option<String>,
}

/// Session configuration.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub source: SourceConfig,
    pub bus: BusConfig,
    pub read_timeout_ms: u64,
}

impl SessionConfig {
    pub fn new(source: SourceConfig) -> Self {
        SessionConfig {
            source,
            bus: BusConfig::default(),
            read_timeout_ms: DEFAULT_READ_TIMEOUT_MS,
        }
    }

    pub fn with_bus(mut self, bus: BusConfig) -> Self {
        self.bus = bus;
        self
    }

    pub fn with_read_timeout_ms(mut self, read_timeout_ms: u64) -> Self {
        self.read_timeout_ms = read_timeout_ms;
        self
    }
}

/// Operational surface shared by capture sessions.
///
/// Lifecycle errors are returned synchronously; runtime device faults are
/// reported through the event channel and `status()`.
#[async_trait]
pub trait CaptureControl: Send + Sync {
    /// Open and configure the source, turn the bus on, begin polling.
    /// Valid only from `Stopped`.
    async fn start(&mut self) -> Result<(), CaptureError>;

    /// Stop pulling from the source; the handle stays open and the bus
    /// stays on. Valid only from `Running`.
    async fn pause(&mut self) -> Result<(), CaptureError>;

    /// Return to `Running`. Valid only from `Paused`.
    async fn resume(&mut self) -> Result<(), CaptureError>;

    /// Tear down the bus and release the handle. Valid from any state;
    /// a no-op from `Stopped`.
    async fn stop(&mut self) -> Result<(), CaptureError>;

    fn state(&self) -> CaptureState;

    fn status(&self) -> CaptureStatus;
}

struct Shared {
    state: Mutex<CaptureState>,
    state_cv: Condvar,
    stop: AtomicBool,
    frames_captured: AtomicU64,
    last_error: Mutex<Option<String>>,
    channel: Mutex<Option<String>>,
    events: mpsc::Sender<CaptureEvent>,
}

impl Shared {
    fn state(&self) -> CaptureState {
        self.state.lock().map(|s| *s).unwrap_or(CaptureState::Stopped)
    }

    /// Set the state and emit a change event. Events are advisory; a
    /// full or unclaimed channel never blocks a transition.
    fn set_state(&self, next: CaptureState) {
        let previous = {
            let Ok(mut state) = self.state.lock() else { return };
            let previous = *state;
            *state = next;
            previous
        };
        self.state_cv.notify_all();
        if previous != next {
            self.emit(CaptureEvent::StateChanged {
                previous,
                current: next,
            });
        }
    }

    fn emit(&self, event: CaptureEvent) {
        if self.events.try_send(event).is_err() {
            debug!("capture event channel full or closed, event dropped");
        }
    }

    fn record_error(&self, detail: &str) {
        if let Ok(mut last) = self.last_error.lock() {
            *last = Some(detail.to_string());
        }
    }
}

/// One open bus handle plus its run state.
pub struct CaptureSession {
    config: SessionConfig,
    queue: Arc<FrameQueue>,
    shared: Arc<Shared>,
    events_rx: Option<mpsc::Receiver<CaptureEvent>>,
    loop_handle: Option<tokio::task::JoinHandle<()>>,
}

impl CaptureSession {
    /// Create a session feeding the given queue. Nothing is opened until
    /// `start()`.
    pub fn new(config: SessionConfig, queue: Arc<FrameQueue>) -> Self {
        let (events_tx, events_rx) = mpsc::channel(64);
        CaptureSession {
            config,
            queue,
            shared: Arc::new(Shared {
                state: Mutex::new(CaptureState::Stopped),
                state_cv: Condvar::new(),
                stop: AtomicBool::new(false),
                frames_captured: AtomicU64::new(0),
                last_error: Mutex::new(None),
                channel: Mutex::new(None),
                events: events_tx,
            }),
            events_rx: Some(events_rx),
            loop_handle: None,
        }
    }

    /// Take the event receiver. Yields `None` after the first call.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<CaptureEvent>> {
        self.events_rx.take()
    }

    /// The queue this session feeds.
    pub fn queue(&self) -> Arc<FrameQueue> {
        self.queue.clone()
    }

    fn transition(&self, op: &'static str, from: &[CaptureState]) -> Result<CaptureState, CaptureError> {
        let current = self.shared.state();
        if from.contains(&current) {
            Ok(current)
        } else {
            Err(CaptureError::InvalidStateTransition { op, state: current })
        }
    }
}

#[async_trait]
impl CaptureControl for CaptureSession {
    async fn start(&mut self) -> Result<(), CaptureError> {
        self.transition("start", &[CaptureState::Stopped])?;
        self.shared.set_state(CaptureState::Starting);
        self.shared.stop.store(false, Ordering::SeqCst);
        if let Ok(mut last) = self.shared.last_error.lock() {
            *last = None;
        }

        // Open, configure, and bus-on happen on the blocking pool: the
        // driver may take its time, and open-time failures are returned
        // synchronously to the caller.
        let source_config = self.config.source.clone();
        let bus_config = self.config.bus;
        let opened = tokio::task::spawn_blocking(move || -> Result<Box<dyn ChannelSource>, CaptureError> {
            let mut source = open_source(&source_config)?;
            source.configure(&bus_config)?;
            source.bus_on()?;
            Ok(source)
        })
        .await;

        let source = match opened {
            Ok(Ok(source)) => source,
            Ok(Err(e)) => {
                self.shared.record_error(&e.to_string());
                self.shared.set_state(CaptureState::Stopped);
                return Err(e);
            }
            Err(join_err) => {
                let e = CaptureError::DeviceError(format!("open task failed: {join_err}"));
                self.shared.record_error(&e.to_string());
                self.shared.set_state(CaptureState::Stopped);
                return Err(e);
            }
        };

        if let Ok(mut channel) = self.shared.channel.lock() {
            *channel = Some(source.channel_name().to_string());
        }
        self.shared.set_state(CaptureState::Running);

        let shared = self.shared.clone();
        let queue = self.queue.clone();
        let read_timeout = Duration::from_millis(self.config.read_timeout_ms);
        self.loop_handle = Some(tokio::task::spawn_blocking(move || {
            run_capture_loop(source, shared, queue, read_timeout);
        }));
        Ok(())
    }

    async fn pause(&mut self) -> Result<(), CaptureError> {
        self.transition("pause", &[CaptureState::Running])?;
        self.shared.set_state(CaptureState::Pausing);
        self.shared.set_state(CaptureState::Paused);
        Ok(())
    }

    async fn resume(&mut self) -> Result<(), CaptureError> {
        self.transition("resume", &[CaptureState::Paused])?;
        self.shared.set_state(CaptureState::Running);
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), CaptureError> {
        if self.shared.state() == CaptureState::Stopped {
            // Idempotent: the loop may already have stopped itself on a
            // device error.
            if let Some(handle) = self.loop_handle.take() {
                let _ = handle.await;
            }
            return Ok(());
        }
        self.shared.set_state(CaptureState::Stopping);
        self.shared.stop.store(true, Ordering::SeqCst);
        self.shared.state_cv.notify_all();
        if let Some(handle) = self.loop_handle.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "capture loop join failed");
            }
        }
        self.shared.set_state(CaptureState::Stopped);
        Ok(())
    }

    fn state(&self) -> CaptureState {
        self.shared.state()
    }

    fn status(&self) -> CaptureStatus {
        CaptureStatus {
            state: self.shared.state(),
            channel: self.shared.channel.lock().ok().and_then(|c| c.clone()),
            frames_captured: self.shared.frames_captured.load(Ordering::Relaxed),
            frames_dropped: self.queue.dropped_count(),
            last_error: self.shared.last_error.lock().ok().and_then(|e| e.clone()),
        }
    }
}

fn run_capture_loop(
    mut source: Box<dyn ChannelSource>,
    shared: Arc<Shared>,
    queue: Arc<FrameQueue>,
    read_timeout: Duration,
) {
    let channel = source.channel_name().to_string();
    info!(channel = %channel, "capture loop started");

    // A pause can land while a read is in flight; the frame it returns is
    // parked here and enqueued first after resume, so pausing never
    // changes queue depth and never loses a frame the driver surfaced.
    let mut parked: Option<Frame> = None;
    let mut last_stats = Instant::now();

    loop {
        if shared.stop.load(Ordering::SeqCst) {
            break;
        }

        // Park while paused without touching the driver.
        if paused(&shared) {
            wait_while_paused(&shared);
            continue;
        }

        if let Some(frame) = parked.take() {
            enqueue(&queue, frame);
        }

        match source.read_frame(read_timeout) {
            Ok(ReadOutcome::NoMessage) => {
                // Idle bus; nothing worth displaying.
            }
            Ok(ReadOutcome::Frame(frame)) => {
                shared.frames_captured.fetch_add(1, Ordering::Relaxed);
                if paused(&shared) {
                    parked = Some(frame);
                } else {
                    enqueue(&queue, frame);
                }
            }
            Err(e) => {
                // Persistent device faults need operator intervention;
                // stop rather than retry forever.
                warn!(channel = %channel, error = %e, "device fault, stopping capture");
                shared.record_error(&e.to_string());
                teardown(&mut source, &channel);
                shared.stop.store(true, Ordering::SeqCst);
                // Events first: once the state reads Stopped, the fault
                // must already be observable on the channel.
                shared.emit(CaptureEvent::DeviceError(e.to_string()));
                shared.emit(CaptureEvent::Ended { reason: "error" });
                shared.set_state(CaptureState::Stopped);
                return;
            }
        }

        if last_stats.elapsed() >= STATS_INTERVAL {
            debug!(
                channel = %channel,
                captured = shared.frames_captured.load(Ordering::Relaxed),
                dropped = queue.dropped_count(),
                "capture counters"
            );
            last_stats = Instant::now();
        }
    }

    // Cooperative stop: drain the parked frame, then tear down.
    if let Some(frame) = parked.take() {
        enqueue(&queue, frame);
    }
    teardown(&mut source, &channel);
    shared.emit(CaptureEvent::Ended { reason: "stopped" });
    info!(
        channel = %channel,
        captured = shared.frames_captured.load(Ordering::Relaxed),
        "capture loop stopped"
    );
}

fn paused(shared: &Shared) -> bool {
    matches!(
        shared.state(),
        CaptureState::Pausing | CaptureState::Paused
    )
}

fn wait_while_paused(shared: &Shared) {
    let Ok(mut state) = shared.state.lock() else {
        return;
    };
    while matches!(*state, CaptureState::Pausing | CaptureState::Paused)
        && !shared.stop.load(Ordering::SeqCst)
    {
        let Ok((guard, _)) = shared
            .state_cv
            .wait_timeout(state, Duration::from_millis(100))
        else {
            return;
        };
        state = guard;
    }
}

fn enqueue(queue: &FrameQueue, frame: Frame) {
    let id = frame.id;
    if let PushOutcome::Dropped(reason) = queue.push(frame) {
        debug!(frame_id = id, ?reason, "frame dropped by queue policy");
    }
}

fn teardown(source: &mut Box<dyn ChannelSource>, channel: &str) {
    if let Err(e) = source.bus_off() {
        warn!(channel = %channel, error = %e, "bus off failed");
    }
    if let Err(e) = source.close() {
        warn!(channel = %channel, error = %e, "close failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::OverflowPolicy;
    use crate::source::SimBus;

    fn sim_session(bus: &SimBus) -> CaptureSession {
        let queue = Arc::new(FrameQueue::with_capacity(
            64,
            OverflowPolicy::Block { max_wait_ms: 100 },
        ));
        let config = SessionConfig::new(SourceConfig::Sim {
            bus: bus.clone(),
            channel_index: 0,
        })
        .with_read_timeout_ms(50);
        CaptureSession::new(config, queue)
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..100 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within 1s");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_start_captures_injected_frames() {
        let bus = SimBus::new();
        let mut session = sim_session(&bus);
        let queue = session.queue();

        session.start().await.unwrap();
        assert_eq!(session.state(), CaptureState::Running);

        bus.inject(Frame::new(0x100, &[1, 2, 3]).unwrap());
        bus.inject(Frame::new(0x200, &[]).unwrap());
        wait_for(|| queue.len() == 2).await;

        let first = queue.pop(Duration::from_millis(100)).unwrap();
        let second = queue.pop(Duration::from_millis(100)).unwrap();
        assert_eq!(first.id, 0x100);
        assert_eq!(second.id, 0x200);

        session.stop().await.unwrap();
        assert_eq!(session.state(), CaptureState::Stopped);
        assert_eq!(session.status().frames_captured, 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_invalid_transitions_are_rejected_without_state_change() {
        let bus = SimBus::new();
        let mut session = sim_session(&bus);

        // pause() from Stopped
        let err = session.pause().await.unwrap_err();
        assert!(matches!(
            err,
            CaptureError::InvalidStateTransition { op: "pause", .. }
        ));
        assert_eq!(session.state(), CaptureState::Stopped);

        // resume() from Stopped
        assert!(session.resume().await.is_err());

        session.start().await.unwrap();
        // start() while Running
        assert!(matches!(
            session.start().await.unwrap_err(),
            CaptureError::InvalidStateTransition { op: "start", .. }
        ));

        session.pause().await.unwrap();
        // start() from Paused
        assert!(session.start().await.is_err());
        assert_eq!(session.state(), CaptureState::Paused);

        session.stop().await.unwrap();
        // stop() from Stopped is an accepted no-op
        session.stop().await.unwrap();
        assert_eq!(session.state(), CaptureState::Stopped);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_pause_leaves_queue_untouched_and_resume_delivers() {
        let bus = SimBus::new();
        let mut session = sim_session(&bus);
        let queue = session.queue();

        session.start().await.unwrap();
        session.pause().await.unwrap();
        // Let any in-flight read run dry before injecting.
        tokio::time::sleep(Duration::from_millis(120)).await;

        bus.inject(Frame::new(0x300, &[7]).unwrap());
        bus.inject(Frame::new(0x301, &[8]).unwrap());
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(queue.len(), 0, "paused loop must not enqueue");
        assert_eq!(bus.pending(), 2, "frames wait at the driver while paused");

        session.resume().await.unwrap();
        wait_for(|| queue.len() == 2).await;
        assert_eq!(queue.pop(Duration::from_millis(100)).unwrap().id, 0x300);
        assert_eq!(queue.pop(Duration::from_millis(100)).unwrap().id, 0x301);

        session.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_device_fault_stops_capture_and_surfaces_error() {
        let bus = SimBus::new();
        let mut session = sim_session(&bus);
        let mut events = session.take_events().unwrap();

        session.start().await.unwrap();
        bus.raise_fault("controller unplugged");

        wait_for(|| session.state() == CaptureState::Stopped).await;
        let status = session.status();
        assert!(status.last_error.unwrap().contains("controller unplugged"));

        // Event stream carries the fault and the end-of-stream marker.
        let mut saw_fault = false;
        let mut saw_ended = false;
        while let Ok(event) = events.try_recv() {
            match event {
                CaptureEvent::DeviceError(detail) => {
                    assert!(detail.contains("controller unplugged"));
                    saw_fault = true;
                }
                CaptureEvent::Ended { reason } => {
                    assert_eq!(reason, "error");
                    saw_ended = true;
                }
                CaptureEvent::StateChanged { .. } => {}
            }
        }
        assert!(saw_fault && saw_ended);

        // stop() after an automatic stop is a no-op.
        session.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_session_restart_after_stop() {
        let bus = SimBus::new();
        let mut session = sim_session(&bus);
        let queue = session.queue();

        session.start().await.unwrap();
        session.stop().await.unwrap();
        session.start().await.unwrap();
        bus.inject(Frame::new(0x42, &[]).unwrap());
        wait_for(|| queue.len() == 1).await;
        session.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_open_failure_is_synchronous_and_resets_state() {
        let config = SessionConfig::new(SourceConfig::Sim {
            bus: SimBus::new(),
            channel_index: 0,
        })
        .with_bus(BusConfig {
            bitrate: 0,
            ..BusConfig::default()
        });
        let queue = Arc::new(FrameQueue::new(OverflowPolicy::DropOldest));
        let mut session = CaptureSession::new(config, queue);

        assert!(matches!(
            session.start().await.unwrap_err(),
            CaptureError::InvalidParameter(_)
        ));
        assert_eq!(session.state(), CaptureState::Stopped);
    }
}

// src/source/sim.rs
//
// In-process simulated CAN bus. Frames injected into a SimBus are read
// back by the SimSource opened on it, with the same blocking-read
// semantics as a hardware channel. Faults can be injected to exercise
// the device-error path.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::CaptureError;
use crate::frame::Frame;

use super::{BusConfig, ChannelSource, ReadOutcome};

#[derive(Debug)]
struct SimInner {
    pending: Mutex<PendingState>,
    arrived: Condvar,
}

#[derive(Debug)]
struct PendingState {
    frames: VecDeque<Frame>,
    fault: Option<String>,
}

/// Shared handle to a simulated bus. Clones refer to the same bus.
#[derive(Clone, Debug)]
pub struct SimBus {
    inner: Arc<SimInner>,
}

impl SimBus {
    pub fn new() -> Self {
        SimBus {
            inner: Arc::new(SimInner {
                pending: Mutex::new(PendingState {
                    frames: VecDeque::new(),
                    fault: None,
                }),
                arrived: Condvar::new(),
            }),
        }
    }

    /// Put a frame on the wire. It stays pending until a source reads it.
    pub fn inject(&self, frame: Frame) {
        if let Ok(mut state) = self.inner.pending.lock() {
            state.frames.push_back(frame);
        }
        self.inner.arrived.notify_all();
    }

    pub fn inject_all(&self, frames: impl IntoIterator<Item = Frame>) {
        for frame in frames {
            self.inject(frame);
        }
    }

    /// Make the next read fail with a device error.
    pub fn raise_fault(&self, detail: impl Into<String>) {
        if let Ok(mut state) = self.inner.pending.lock() {
            state.fault = Some(detail.into());
        }
        self.inner.arrived.notify_all();
    }

    /// Frames injected but not yet read by any source.
    pub fn pending(&self) -> usize {
        self.inner
            .pending
            .lock()
            .map(|s| s.frames.len())
            .unwrap_or(0)
    }
}

impl Default for SimBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Channel source backed by a `SimBus`.
pub struct SimSource {
    bus: SimBus,
    name: String,
    config: BusConfig,
    bus_on: bool,
    closed: bool,
}

impl SimSource {
    pub fn open(bus: SimBus, channel_index: u32) -> Self {
        SimSource {
            bus,
            name: format!("sim{channel_index}"),
            config: BusConfig::default(),
            bus_on: false,
            closed: false,
        }
    }

    /// Bus parameters last applied via `configure`.
    pub fn bus_config(&self) -> &BusConfig {
        &self.config
    }

    fn ensure_open(&self) -> Result<(), CaptureError> {
        if self.closed {
            Err(CaptureError::SessionClosed)
        } else {
            Ok(())
        }
    }
}

impl ChannelSource for SimSource {
    fn channel_name(&self) -> &str {
        &self.name
    }

    fn configure(&mut self, config: &BusConfig) -> Result<(), CaptureError> {
        self.ensure_open()?;
        config.validate()?;
        self.config = *config;
        Ok(())
    }

    fn bus_on(&mut self) -> Result<(), CaptureError> {
        self.ensure_open()?;
        self.bus_on = true;
        Ok(())
    }

    fn bus_off(&mut self) -> Result<(), CaptureError> {
        self.ensure_open()?;
        self.bus_on = false;
        Ok(())
    }

    fn read_frame(&mut self, timeout: Duration) -> Result<ReadOutcome, CaptureError> {
        self.ensure_open()?;
        if !self.bus_on {
            return Err(CaptureError::device(&self.name, "bus is off"));
        }

        let deadline = Instant::now() + timeout;
        let Ok(mut state) = self.bus.inner.pending.lock() else {
            return Err(CaptureError::device(&self.name, "bus state poisoned"));
        };
        loop {
            if let Some(detail) = state.fault.take() {
                return Err(CaptureError::device(&self.name, detail));
            }
            if let Some(frame) = state.frames.pop_front() {
                return Ok(ReadOutcome::Frame(frame));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(ReadOutcome::NoMessage);
            }
            let (guard, _) = self
                .bus
                .inner
                .arrived
                .wait_timeout(state, remaining)
                .map_err(|_| CaptureError::device(&self.name, "bus state poisoned"))?;
            state = guard;
        }
    }

    fn close(&mut self) -> Result<(), CaptureError> {
        self.ensure_open()?;
        self.bus_on = false;
        self.closed = true;
        Ok(())
    }
}

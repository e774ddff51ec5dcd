// src/sink/display.rs
//
// Display sink: keeps the latest frame's textual rendering, replacing the
// previous one. A UI polls the cloneable handle; the sink itself never
// touches widgets.

use std::sync::{Arc, RwLock};

use tracing::trace;

use crate::codec::{FrameCodec, TextCodec};
use crate::frame::Frame;

use super::{FrameSink, SinkError};

#[derive(Default)]
struct DisplayState {
    latest: RwLock<Option<String>>,
    stopped: RwLock<Option<String>>,
}

/// Read side of the display: what a UI renders.
#[derive(Clone)]
pub struct DisplayHandle {
    state: Arc<DisplayState>,
}

impl DisplayHandle {
    /// Rendering of the most recently delivered frame.
    pub fn latest(&self) -> Option<String> {
        self.state.latest.read().ok().and_then(|l| l.clone())
    }

    /// Flag the display as stopped (wired to the session's error events).
    pub fn mark_stopped(&self, reason: impl Into<String>) {
        if let Ok(mut stopped) = self.state.stopped.write() {
            *stopped = Some(reason.into());
        }
    }

    pub fn clear_stopped(&self) {
        if let Ok(mut stopped) = self.state.stopped.write() {
            *stopped = None;
        }
    }

    pub fn stopped_reason(&self) -> Option<String> {
        self.state.stopped.read().ok().and_then(|s| s.clone())
    }

    /// One line for a status bar: the stop indicator wins over the
    /// latest frame.
    pub fn status_line(&self) -> String {
        if let Some(reason) = self.stopped_reason() {
            return format!("capture stopped: {reason}");
        }
        self.latest().unwrap_or_else(|| "listening".to_string())
    }
}

/// Sink that renders the latest frame for a display.
pub struct DisplaySink {
    name: String,
    state: Arc<DisplayState>,
}

impl DisplaySink {
    pub fn new() -> (Self, DisplayHandle) {
        let state = Arc::new(DisplayState::default());
        (
            DisplaySink {
                name: "display".to_string(),
                state: state.clone(),
            },
            DisplayHandle { state },
        )
    }
}

impl FrameSink for DisplaySink {
    fn name(&self) -> &str {
        &self.name
    }

    fn receive(&mut self, frame: &Frame) -> Result<(), SinkError> {
        let text = TextCodec::encode(frame).map_err(|e| SinkError::new(e.to_string()))?;
        trace!(sink = %self.name, "{text}");
        let mut latest = self
            .state
            .latest
            .write()
            .map_err(|_| SinkError::new("display state poisoned"))?;
        *latest = Some(text);
        Ok(())
    }
}

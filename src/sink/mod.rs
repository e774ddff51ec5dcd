// src/sink/mod.rs
//
// Consumer sink contract. A sink failure is scoped to that sink: the hub
// deregisters it and keeps delivering to the rest.

mod display;
mod log;
mod tcp;

pub use display::{DisplayHandle, DisplaySink};
pub use log::{read_log_file, LogFormat, LogSink};
pub use tcp::TcpSink;

use thiserror::Error;

use crate::frame::Frame;

/// Failure delivering to one sink.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct SinkError {
    message: String,
}

impl SinkError {
    pub fn new(message: impl Into<String>) -> Self {
        SinkError {
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for SinkError {
    fn from(e: std::io::Error) -> Self {
        SinkError::new(e.to_string())
    }
}

/// A consumer of captured frames.
///
/// `receive` is called from the sink's worker, one frame at a time, in
/// capture order. Implementations own their resource lifecycle; the hub
/// only ever holds the boxed sink.
pub trait FrameSink: Send {
    /// Sink identity for logging and status.
    fn name(&self) -> &str;

    /// Consume one frame. An error deregisters this sink.
    fn receive(&mut self, frame: &Frame) -> Result<(), SinkError>;
}

// src/error.rs
//
// Error taxonomy for the capture pipeline.
//
// Queue drops are deliberately NOT represented here: a full queue is a
// metric (see `queue::PushOutcome`), not a fault. Sink failures have their
// own type (`sink::SinkError`) because they isolate a single consumer
// rather than the session.

use thiserror::Error;

use crate::capture::CaptureState;
use crate::hub::RegistrationId;

/// Errors surfaced by the capture core.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// The channel could not be opened (no device, no permissions).
    /// Fatal to session start.
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Bad bus parameters or frame fields. Fatal to the operation that
    /// supplied them.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// Runtime fault reported by the driver. Triggers automatic stop.
    #[error("device error: {0}")]
    DeviceError(String),

    /// Operation on a source whose handle has already been released.
    #[error("session closed")]
    SessionClosed,

    /// Lifecycle operation called from a state that does not allow it.
    /// State is left unchanged.
    #[error("invalid state transition: {op}() while {state}")]
    InvalidStateTransition {
        op: &'static str,
        state: CaptureState,
    },

    /// Deregistration of an id the hub does not know.
    #[error("no sink registered with id {0}")]
    SinkNotFound(RegistrationId),
}

impl CaptureError {
    /// Open failure on a named channel.
    pub fn unavailable(channel: &str, detail: impl std::fmt::Display) -> Self {
        CaptureError::DeviceUnavailable(format!("{channel}: {detail}"))
    }

    /// Runtime fault on a named channel.
    pub fn device(channel: &str, detail: impl std::fmt::Display) -> Self {
        CaptureError::DeviceError(format!("{channel}: {detail}"))
    }

    /// Parameter rejection.
    pub fn invalid(detail: impl std::fmt::Display) -> Self {
        CaptureError::InvalidParameter(detail.to_string())
    }
}

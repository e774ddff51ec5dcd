// src/frame.rs
//
// Captured CAN frame and the monotonic capture clock.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::time::Instant;

use crate::error::CaptureError;

/// Extended (29-bit) id flag bit, SocketCAN `can_id` layout.
pub const EFF_FLAG: u32 = 0x8000_0000;
/// Remote transmission request flag bit.
pub const RTR_FLAG: u32 = 0x4000_0000;
/// Error frame flag bit.
pub const ERR_FLAG: u32 = 0x2000_0000;
/// Standard (11-bit) id mask.
pub const SFF_MASK: u32 = 0x0000_07FF;
/// Extended (29-bit) id mask.
pub const EFF_MASK: u32 = 0x1FFF_FFFF;

/// Maximum payload for a classic CAN frame.
pub const MAX_DATA_LEN: usize = 8;

static MONO_EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Current monotonic time in microseconds since the process clock epoch.
///
/// Capture timestamps are monotonic rather than wall-clock so they stay
/// ordered across system time adjustments.
pub fn now_us() -> u64 {
    MONO_EPOCH.elapsed().as_micros() as u64
}

/// One captured CAN message.
///
/// Immutable once constructed: the queue owns it until dequeued, the hub
/// clones it per consumer, and sinks only ever see a shared reference.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    /// Frame identifier (11-bit standard or 29-bit extended).
    pub id: u32,
    /// Capture timestamp in microseconds, monotonic.
    pub timestamp_us: u64,
    /// Data length code. Equals `data.len()` for data frames; remote
    /// frames carry a dlc but no data bytes.
    pub dlc: u8,
    /// Payload (0-8 bytes; empty for remote frames).
    pub data: Vec<u8>,
    /// Extended (29-bit) identifier.
    pub is_extended: bool,
    /// Remote transmission request.
    pub is_rtr: bool,
    /// Bus error report delivered through the frame stream.
    pub is_error: bool,
}

impl Frame {
    /// Standard (11-bit) data frame, timestamped now.
    pub fn new(id: u32, data: &[u8]) -> Result<Self, CaptureError> {
        if id > SFF_MASK {
            return Err(CaptureError::invalid(format!(
                "standard frame id 0x{id:X} exceeds 11 bits"
            )));
        }
        Self::build(id, data, false, false, false)
    }

    /// Extended (29-bit) data frame, timestamped now.
    pub fn new_extended(id: u32, data: &[u8]) -> Result<Self, CaptureError> {
        if id > EFF_MASK {
            return Err(CaptureError::invalid(format!(
                "extended frame id 0x{id:X} exceeds 29 bits"
            )));
        }
        Self::build(id, data, true, false, false)
    }

    /// Remote transmission request frame. Carries a dlc but no payload.
    pub fn remote(id: u32, dlc: u8, extended: bool) -> Result<Self, CaptureError> {
        let mask = if extended { EFF_MASK } else { SFF_MASK };
        if id > mask {
            return Err(CaptureError::invalid(format!(
                "remote frame id 0x{id:X} out of range"
            )));
        }
        if dlc as usize > MAX_DATA_LEN {
            return Err(CaptureError::invalid(format!("remote frame dlc {dlc} exceeds 8")));
        }
        Ok(Frame {
            id,
            timestamp_us: now_us(),
            dlc,
            data: Vec::new(),
            is_extended: extended,
            is_rtr: true,
            is_error: false,
        })
    }

    /// Bus error report. The id carries the driver's error class bits.
    pub fn error_frame(id: u32, data: &[u8]) -> Result<Self, CaptureError> {
        if id > EFF_MASK {
            return Err(CaptureError::invalid(format!(
                "error frame id 0x{id:X} exceeds 29 bits"
            )));
        }
        Self::build(id, data, false, false, true)
    }

    fn build(
        id: u32,
        data: &[u8],
        is_extended: bool,
        is_rtr: bool,
        is_error: bool,
    ) -> Result<Self, CaptureError> {
        if data.len() > MAX_DATA_LEN {
            return Err(CaptureError::invalid(format!(
                "payload of {} bytes exceeds classic CAN maximum of {MAX_DATA_LEN}",
                data.len()
            )));
        }
        Ok(Frame {
            id,
            timestamp_us: now_us(),
            dlc: data.len() as u8,
            data: data.to_vec(),
            is_extended,
            is_rtr,
            is_error,
        })
    }

    /// Replace the capture timestamp (driver-supplied timestamps, tests).
    pub fn with_timestamp(mut self, timestamp_us: u64) -> Self {
        self.timestamp_us = timestamp_us;
        self
    }

    /// The id with flag bits applied, SocketCAN `can_id` layout.
    pub fn raw_can_id(&self) -> u32 {
        let mut raw = self.id & EFF_MASK;
        if self.is_extended {
            raw |= EFF_FLAG;
        }
        if self.is_rtr {
            raw |= RTR_FLAG;
        }
        if self.is_error {
            raw |= ERR_FLAG;
        }
        raw
    }

    /// Rebuild a frame from a raw `can_id` and payload. Used by the text
    /// codec and driver adapters.
    pub fn from_raw_can_id(raw: u32, data: &[u8], timestamp_us: u64) -> Result<Self, CaptureError> {
        let is_extended = raw & EFF_FLAG != 0;
        let is_rtr = raw & RTR_FLAG != 0;
        let is_error = raw & ERR_FLAG != 0;
        let id = raw & EFF_MASK;
        if !is_extended && !is_error && id > SFF_MASK {
            return Err(CaptureError::invalid(format!(
                "standard frame id 0x{id:X} exceeds 11 bits"
            )));
        }
        if data.len() > MAX_DATA_LEN {
            return Err(CaptureError::invalid(format!(
                "payload of {} bytes exceeds classic CAN maximum of {MAX_DATA_LEN}",
                data.len()
            )));
        }
        Ok(Frame {
            id,
            timestamp_us,
            dlc: data.len() as u8,
            data: data.to_vec(),
            is_extended,
            is_rtr,
            is_error,
        })
    }
}

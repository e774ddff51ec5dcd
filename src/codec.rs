// src/codec.rs
//
// Frame codec trait and the text line codec shared by the display and
// log sinks.
//
// Text line format, one frame per line:
//
//   (<seconds>.<micros>) <id-hex>#<data-hex>
//
//   (0.000123) 123#DEADBEEF          standard data frame
//   (5.000000) 8000ABCD#0011         8 hex digits carry can_id flag bits
//   (0.000200) 40000123#R4           remote frame, dlc after 'R'
//
// A 3-digit id is a bare standard data frame. An 8-digit id is a raw
// SocketCAN `can_id`: bit 31 extended, bit 30 remote, bit 29 error frame,
// low 29 bits the identifier. Timestamps round-trip at microsecond
// precision.

use crate::error::CaptureError;
use crate::frame::Frame;

/// Trait for frame codecs.
///
/// The associated types define the codec-specific raw and encoded forms.
pub trait FrameCodec {
    /// The raw form for decoding (e.g. a text line).
    type Raw: ?Sized;
    /// The encoded form for writing.
    type Encoded;

    /// Decode a raw frame.
    fn decode(raw: &Self::Raw) -> Result<Frame, CaptureError>;

    /// Encode a frame for writing.
    fn encode(frame: &Frame) -> Result<Self::Encoded, CaptureError>;
}

/// Text line codec.
pub struct TextCodec;

impl FrameCodec for TextCodec {
    type Raw = str;
    type Encoded = String;

    fn decode(line: &str) -> Result<Frame, CaptureError> {
        let line = line.trim();

        let rest = line
            .strip_prefix('(')
            .ok_or_else(|| CaptureError::invalid(format!("missing timestamp: {line:?}")))?;
        let (stamp, rest) = rest
            .split_once(')')
            .ok_or_else(|| CaptureError::invalid(format!("unterminated timestamp: {line:?}")))?;
        let timestamp_us = parse_timestamp(stamp)?;

        let body = rest.trim_start();
        let (id_part, data_part) = body
            .split_once('#')
            .ok_or_else(|| CaptureError::invalid(format!("missing '#' separator: {line:?}")))?;

        let raw_id = match id_part.len() {
            3 | 8 => u32::from_str_radix(id_part, 16)
                .map_err(|_| CaptureError::invalid(format!("invalid hex id: {id_part:?}")))?,
            n => {
                return Err(CaptureError::invalid(format!(
                    "id field must be 3 or 8 hex digits, got {n}"
                )))
            }
        };

        if let Some(dlc_part) = data_part.strip_prefix('R') {
            let dlc = u8::from_str_radix(dlc_part, 16)
                .map_err(|_| CaptureError::invalid(format!("invalid remote dlc: {dlc_part:?}")))?;
            if dlc as usize > crate::frame::MAX_DATA_LEN {
                return Err(CaptureError::invalid(format!("remote dlc {dlc} exceeds 8")));
            }
            let mut frame =
                Frame::from_raw_can_id(raw_id | crate::frame::RTR_FLAG, &[], timestamp_us)?;
            frame.dlc = dlc;
            return Ok(frame);
        }

        if data_part.len() % 2 != 0 {
            return Err(CaptureError::invalid(format!(
                "odd-length data field: {data_part:?}"
            )));
        }
        let data = hex::decode(data_part)
            .map_err(|_| CaptureError::invalid(format!("invalid hex data: {data_part:?}")))?;
        Frame::from_raw_can_id(raw_id, &data, timestamp_us)
    }

    fn encode(frame: &Frame) -> Result<String, CaptureError> {
        let secs = frame.timestamp_us / 1_000_000;
        let micros = frame.timestamp_us % 1_000_000;

        let id_part = if frame.is_extended || frame.is_rtr || frame.is_error {
            format!("{:08X}", frame.raw_can_id())
        } else {
            format!("{:03X}", frame.id)
        };

        let data_part = if frame.is_rtr {
            format!("R{:X}", frame.dlc)
        } else {
            hex::encode_upper(&frame.data)
        };

        Ok(format!("({secs}.{micros:06}) {id_part}#{data_part}"))
    }
}

fn parse_timestamp(stamp: &str) -> Result<u64, CaptureError> {
    let (secs, micros) = stamp
        .split_once('.')
        .ok_or_else(|| CaptureError::invalid(format!("invalid timestamp: {stamp:?}")))?;
    if micros.len() != 6 {
        return Err(CaptureError::invalid(format!(
            "timestamp fraction must be 6 digits: {stamp:?}"
        )));
    }
    let secs: u64 = secs
        .parse()
        .map_err(|_| CaptureError::invalid(format!("invalid timestamp seconds: {secs:?}")))?;
    let micros: u64 = micros
        .parse()
        .map_err(|_| CaptureError::invalid(format!("invalid timestamp micros: {micros:?}")))?;
    Ok(secs * 1_000_000 + micros)
}

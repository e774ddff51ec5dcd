// src/source/socketcan.rs
//
// SocketCAN channel source for Linux native CAN interfaces.
//
// Requires the interface to be configured first:
//   sudo ip link set can0 up type can bitrate 125000
// or `configure_link` set in the config, which applies the bitrate via
// pkexec at configure time.
//
// This module is only compiled on Linux.

use std::time::Duration;

use socketcan::{CanFrame, CanSocket, EmbeddedFrame, Frame as _, Socket};
use tracing::{debug, info};

use crate::error::CaptureError;
use crate::frame::{self, Frame};

use super::{BusConfig, ChannelSource, OutputMode, ReadOutcome, SocketCanConfig};

/// Channel source backed by a SocketCAN socket.
///
/// Bus-on/off is modeled as gating the socket: the handle stays open for
/// the life of the source, reads are only permitted while the bus is on.
pub struct SocketCanSource {
    socket: CanSocket,
    interface: String,
    configure_link: bool,
    bus_on: bool,
    closed: bool,
}

impl std::fmt::Debug for SocketCanSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketCanSource")
            .field("interface", &self.interface)
            .field("configure_link", &self.configure_link)
            .field("bus_on", &self.bus_on)
            .field("closed", &self.closed)
            .finish()
    }
}

impl SocketCanSource {
    /// Open the channel, falling back to the virtual interface when the
    /// physical one is absent and the config allows it.
    pub fn open(config: &SocketCanConfig) -> Result<Self, CaptureError> {
        let mut candidates = Vec::new();
        match &config.interface {
            Some(name) => candidates.push(name.clone()),
            None => {
                candidates.push(format!("can{}", config.channel_index));
                if config.accept_virtual {
                    candidates.push(format!("vcan{}", config.channel_index));
                }
            }
        }

        let mut last_err = None;
        for name in &candidates {
            match CanSocket::open(name) {
                Ok(socket) => {
                    info!(interface = %name, "opened SocketCAN channel");
                    return Ok(SocketCanSource {
                        socket,
                        interface: name.clone(),
                        configure_link: config.configure_link,
                        bus_on: false,
                        closed: false,
                    });
                }
                Err(e) => {
                    debug!(interface = %name, error = %e, "open failed");
                    last_err = Some(e);
                }
            }
        }

        let device = format!("socketcan({})", candidates.join("|"));
        match last_err {
            Some(e) => Err(CaptureError::unavailable(&device, e)),
            None => Err(CaptureError::unavailable(&device, "no interface candidates")),
        }
    }

    fn ensure_open(&self) -> Result<(), CaptureError> {
        if self.closed {
            Err(CaptureError::SessionClosed)
        } else {
            Ok(())
        }
    }

    fn device(&self) -> String {
        format!("socketcan({})", self.interface)
    }
}

impl ChannelSource for SocketCanSource {
    fn channel_name(&self) -> &str {
        &self.interface
    }

    fn configure(&mut self, config: &BusConfig) -> Result<(), CaptureError> {
        self.ensure_open()?;
        config.validate()?;

        if config.output_mode == OutputMode::ListenOnly {
            // The socket never transmits; listen-only needs no controller
            // mode change here.
            debug!(interface = %self.interface, "listen-only requested");
        }

        // Virtual interfaces carry no bitrate.
        if self.configure_link && !self.interface.starts_with("vcan") {
            configure_interface(&self.interface, config.bitrate)
                .map_err(CaptureError::InvalidParameter)?;
        }
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
            return Err(CaptureError::device(&self.device(), "bus is off"));
        }

        self.socket
            .set_read_timeout(timeout)
            .map_err(|e| CaptureError::device(&self.device(), format!("set read timeout: {e}")))?;

        match self.socket.read_frame() {
            Ok(raw) => Ok(ReadOutcome::Frame(convert_frame(raw)?)),
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(ReadOutcome::NoMessage),
            Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(ReadOutcome::NoMessage),
            Err(e) => Err(CaptureError::device(&self.device(), format!("read error: {e}"))),
        }
    }

    fn close(&mut self) -> Result<(), CaptureError> {
        self.ensure_open()?;
        self.bus_on = false;
        self.closed = true;
        Ok(())
    }
}

/// Convert a SocketCAN frame to the capture frame model.
fn convert_frame(raw: CanFrame) -> Result<Frame, CaptureError> {
    let timestamp_us = frame::now_us();
    match raw {
        CanFrame::Data(f) => Frame::from_raw_can_id(
            f.raw_id() & frame::EFF_MASK
                | if f.is_extended() { frame::EFF_FLAG } else { 0 },
            f.data(),
            timestamp_us,
        ),
        CanFrame::Remote(f) => {
            let mut out = Frame::from_raw_can_id(
                f.raw_id() & frame::EFF_MASK
                    | frame::RTR_FLAG
                    | if f.is_extended() { frame::EFF_FLAG } else { 0 },
                &[],
                timestamp_us,
            )?;
            out.dlc = f.dlc() as u8;
            Ok(out)
        }
        CanFrame::Error(f) => Frame::from_raw_can_id(
            f.raw_id() & frame::EFF_MASK | frame::ERR_FLAG,
            f.data(),
            timestamp_us,
        ),
    }
}

/// Configure a SocketCAN interface using pkexec for privilege escalation.
/// Brings the interface down, sets the bitrate, and brings it back up.
fn configure_interface(interface: &str, bitrate: u32) -> Result<(), String> {
    use std::process::Command;

    info!(interface = %interface, bitrate = bitrate, "configuring interface via pkexec");

    let script = format!(
        "ip link set {iface} down && ip link set {iface} type can bitrate {bitrate} && ip link set {iface} up",
        iface = interface,
        bitrate = bitrate
    );

    let output = Command::new("pkexec")
        .args(["sh", "-c", &script])
        .output()
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                "pkexec not found. Install polkit or configure the interface manually.".to_string()
            } else {
                format!("Failed to run pkexec: {e}")
            }
        })?;

    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    let stdout = String::from_utf8_lossy(&output.stdout);
    if stderr.contains("dismissed") || stderr.contains("cancelled") {
        Err("Authentication cancelled by user".to_string())
    } else if stderr.contains("Not authorized") {
        Err("Not authorised to configure network interfaces".to_string())
    } else {
        let detail = if !stderr.is_empty() {
            stderr.trim().to_string()
        } else if !stdout.is_empty() {
            stdout.trim().to_string()
        } else {
            format!("Exit code: {:?}", output.status.code())
        };
        Err(format!("Failed to configure interface: {detail}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_missing_interface_is_device_unavailable() {
        // Interface names are limited to 15 chars; this one cannot exist.
        let config = SocketCanConfig {
            channel_index: 0,
            accept_virtual: false,
            interface: Some("canmissing0".to_string()),
            configure_link: false,
        };
        assert!(matches!(
            SocketCanSource::open(&config),
            Err(CaptureError::DeviceUnavailable(_))
        ));
    }

    #[test]
    fn test_candidate_order_prefers_physical_interface() {
        // Without an override, the physical name is tried first and the
        // virtual fallback only when allowed.
        let config = SocketCanConfig {
            channel_index: 3,
            accept_virtual: true,
            interface: None,
            configure_link: false,
        };
        // Neither interface exists in the test environment; the error
        // message records the candidate order.
        let err = SocketCanSource::open(&config).unwrap_err();
        assert!(err.to_string().contains("can3|vcan3"));
    }
}

// src/source/mod.rs
//
// Channel source boundary: the capture core consumes this capability
// interface, not a specific vendor API.

mod sim;
#[cfg(target_os = "linux")]
mod socketcan;

pub use sim::{SimBus, SimSource};
#[cfg(target_os = "linux")]
pub use socketcan::SocketCanSource;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CaptureError;
use crate::frame::Frame;

/// Bus output drive mode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    /// Normal drive: acknowledge and (in principle) transmit.
    #[default]
    Normal,
    /// Listen without acknowledging.
    ListenOnly,
}

/// Bus parameters applied by `ChannelSource::configure`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusConfig {
    /// Bitrate in bits/second.
    #[serde(default = "default_bitrate")]
    pub bitrate: u32,
    #[serde(default)]
    pub output_mode: OutputMode,
}

fn default_bitrate() -> u32 {
    125_000
}

impl Default for BusConfig {
    fn default() -> Self {
        BusConfig {
            bitrate: default_bitrate(),
            output_mode: OutputMode::Normal,
        }
    }
}

impl BusConfig {
    /// Reject parameter combinations no controller supports.
    pub fn validate(&self) -> Result<(), CaptureError> {
        if self.bitrate == 0 {
            return Err(CaptureError::invalid("bitrate must be non-zero"));
        }
        if self.bitrate > 1_000_000 {
            return Err(CaptureError::invalid(format!(
                "bitrate {} exceeds classic CAN maximum of 1 Mbit/s",
                self.bitrate
            )));
        }
        Ok(())
    }
}

/// Result of one read attempt.
///
/// `NoMessage` is the normal steady-state outcome of an idle bus, distinct
/// from a device fault.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    Frame(Frame),
    NoMessage,
}

/// One open CAN channel.
///
/// `read_frame` blocks up to `timeout` and is the only blocking operation
/// on the capture path. After `close`, every operation fails with
/// `SessionClosed`.
pub trait ChannelSource: Send {
    /// Channel identity for logging and status (e.g. "can0", "sim0").
    fn channel_name(&self) -> &str;

    /// Apply bus parameters. Valid before `bus_on`.
    fn configure(&mut self, config: &BusConfig) -> Result<(), CaptureError>;

    /// Connect the channel to the bus.
    fn bus_on(&mut self) -> Result<(), CaptureError>;

    /// Disconnect the channel from the bus. The handle stays open.
    fn bus_off(&mut self) -> Result<(), CaptureError>;

    /// Read the next frame, waiting up to `timeout`.
    fn read_frame(&mut self, timeout: Duration) -> Result<ReadOutcome, CaptureError>;

    /// Release the underlying handle.
    fn close(&mut self) -> Result<(), CaptureError>;
}

/// SocketCAN channel selection.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SocketCanConfig {
    /// Channel index, mapped to `can<N>`.
    pub channel_index: u32,
    /// Fall back to the virtual `vcan<N>` interface when the physical
    /// one is absent.
    #[serde(default)]
    pub accept_virtual: bool,
    /// Explicit interface name override. Takes precedence over
    /// `channel_index` when set.
    #[serde(default)]
    pub interface: Option<String>,
    /// Apply the configured bitrate to the interface via `pkexec ip link`
    /// at configure time. When unset the interface is used as already
    /// configured by the system.
    #[serde(default)]
    pub configure_link: bool,
}

/// Which kind of channel a session opens.
#[derive(Clone, Debug)]
pub enum SourceConfig {
    /// Linux SocketCAN interface.
    SocketCan(SocketCanConfig),
    /// In-process simulated bus (tests, demos).
    Sim { bus: SimBus, channel_index: u32 },
}

/// Open a channel source for the given configuration.
pub fn open_source(config: &SourceConfig) -> Result<Box<dyn ChannelSource>, CaptureError> {
    match config {
        #[cfg(target_os = "linux")]
        SourceConfig::SocketCan(cfg) => Ok(Box::new(SocketCanSource::open(cfg)?)),
        #[cfg(not(target_os = "linux"))]
        SourceConfig::SocketCan(_) => Err(CaptureError::DeviceUnavailable(
            "SocketCAN is only available on Linux".to_string(),
        )),
        SourceConfig::Sim { bus, channel_index } => {
            Ok(Box::new(SimSource::open(bus.clone(), *channel_index)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bus_config_defaults() {
        let config = BusConfig::default();
        assert_eq!(config.bitrate, 125_000);
        assert_eq!(config.output_mode, OutputMode::Normal);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_bus_config_rejects_bad_bitrate() {
        let zero = BusConfig {
            bitrate: 0,
            ..BusConfig::default()
        };
        assert!(matches!(
            zero.validate(),
            Err(CaptureError::InvalidParameter(_))
        ));

        let wide = BusConfig {
            bitrate: 2_000_000,
            ..BusConfig::default()
        };
        assert!(wide.validate().is_err());
    }

    #[test]
    fn test_open_source_builds_sim_channel() {
        let bus = SimBus::new();
        let source = open_source(&SourceConfig::Sim {
            bus,
            channel_index: 0,
        })
        .unwrap();
        assert_eq!(source.channel_name(), "sim0");
    }
}

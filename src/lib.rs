//! CAN bus capture-and-dispatch core.
//!
//! A bounded, backpressure-aware pipeline that reads frames from a CAN
//! channel and fans them out to registered consumers without loss under
//! normal operation and with counted, observable drops under overload:
//!
//! ```text
//! ChannelSource -> CaptureSession (loop) -> FrameQueue -> DispatchHub -> FrameSink(s)
//! ```
//!
//! The capture loop runs on its own blocking task and `read_frame` is the
//! only blocking call on the capture path, so `stop()` is observable
//! within one read-timeout interval. Sinks each sit behind a bounded
//! sub-queue with their own delivery policy; a slow or failing sink never
//! stalls or corrupts the others.
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use cantap::{
//!     BusConfig, CaptureControl, CaptureSession, DeliveryPolicy, DispatchHub, DisplaySink,
//!     FrameQueue, OverflowPolicy, SessionConfig, SocketCanConfig, SourceConfig,
//! };
//!
//! #[tokio::main(flavor = "multi_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let queue = Arc::new(FrameQueue::new(OverflowPolicy::DropOldest));
//!
//!     let config = SessionConfig::new(SourceConfig::SocketCan(SocketCanConfig {
//!         channel_index: 0,
//!         accept_virtual: true,
//!         interface: None,
//!         configure_link: false,
//!     }))
//!     .with_bus(BusConfig::default());
//!     let mut session = CaptureSession::new(config, queue.clone());
//!
//!     let mut hub = DispatchHub::new(queue);
//!     let (display, handle) = DisplaySink::new();
//!     hub.register(Box::new(display), DeliveryPolicy::DropOldest);
//!     hub.start();
//!
//!     session.start().await?;
//!     tokio::time::sleep(std::time::Duration::from_secs(1)).await;
//!     println!("{}", handle.status_line());
//!
//!     session.stop().await?;
//!     hub.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod capture;
pub mod codec;
pub mod error;
pub mod frame;
pub mod hub;
pub mod queue;
pub mod sink;
pub mod source;

pub use capture::{
    CaptureControl, CaptureEvent, CaptureSession, CaptureState, CaptureStatus, SessionConfig,
};
pub use codec::{FrameCodec, TextCodec};
pub use error::CaptureError;
pub use frame::Frame;
pub use hub::{DeliveryPolicy, DispatchHub, HubStatus, RegistrationId, SinkStatus};
pub use queue::{FrameQueue, OverflowPolicy, PushOutcome};
pub use sink::{
    read_log_file, DisplayHandle, DisplaySink, FrameSink, LogFormat, LogSink, SinkError, TcpSink,
};
pub use source::{
    open_source, BusConfig, ChannelSource, OutputMode, ReadOutcome, SimBus, SimSource,
    SocketCanConfig, SourceConfig,
};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    //! End-to-end pipeline scenarios: session -> queue -> hub -> sinks.

    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
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

    /// Open channel 0 (virtual bus), bitrate 125000, normal output mode;
    /// start; inject two frames; the display must show the second frame's
    /// rendering as the latest state.
    #[tokio::test(flavor = "multi_thread")]
    async fn test_display_shows_latest_frame() {
        init_tracing();
        let bus = SimBus::new();
        let queue = Arc::new(FrameQueue::new(OverflowPolicy::Block { max_wait_ms: 500 }));
        let config = SessionConfig::new(SourceConfig::Sim {
            bus: bus.clone(),
            channel_index: 0,
        })
        .with_bus(BusConfig {
            bitrate: 125_000,
            output_mode: OutputMode::Normal,
        })
        .with_read_timeout_ms(50);
        let mut session = CaptureSession::new(config, queue.clone());

        let mut hub = DispatchHub::new(queue);
        let (display, handle) = DisplaySink::new();
        hub.register(
            Box::new(display),
            DeliveryPolicy::Blocking { max_wait_ms: 500 },
        );
        hub.start();

        session.start().await.unwrap();
        bus.inject(Frame::new(0x100, &[1, 2, 3]).unwrap().with_timestamp(0));
        bus.inject(Frame::new(0x200, &[]).unwrap().with_timestamp(5));

        wait_for(|| handle.latest() == Some("(0.000005) 200#".to_string())).await;

        session.stop().await.unwrap();
        hub.shutdown().await;
    }

    /// A device fault stops capture; the display handle, wired to the
    /// session's events, shows a visible stop indicator.
    #[tokio::test(flavor = "multi_thread")]
    async fn test_display_indicates_stop_on_device_error() {
        init_tracing();
        let bus = SimBus::new();
        let queue = Arc::new(FrameQueue::new(OverflowPolicy::DropOldest));
        let config = SessionConfig::new(SourceConfig::Sim {
            bus: bus.clone(),
            channel_index: 0,
        })
        .with_read_timeout_ms(50);
        let mut session = CaptureSession::new(config, queue.clone());
        let mut events = session.take_events().unwrap();

        let mut hub = DispatchHub::new(queue);
        let (display, handle) = DisplaySink::new();
        hub.register(Box::new(display), DeliveryPolicy::DropOldest);
        hub.start();

        session.start().await.unwrap();
        bus.inject(Frame::new(0x123, &[0xAB]).unwrap().with_timestamp(1));
        wait_for(|| handle.latest().is_some()).await;

        bus.raise_fault("transceiver failure");
        wait_for(|| session.state() == CaptureState::Stopped).await;

        // Operator wiring: forward device errors to the display.
        while let Ok(event) = events.try_recv() {
            if let CaptureEvent::DeviceError(detail) = event {
                handle.mark_stopped(detail);
            }
        }
        let status_line = handle.status_line();
        assert!(status_line.starts_with("capture stopped:"), "{status_line}");
        assert!(status_line.contains("transceiver failure"));
        // The last delivered frame is still available underneath.
        assert_eq!(handle.latest().unwrap(), "(0.000001) 123#AB");

        session.stop().await.unwrap();
        hub.shutdown().await;
    }

    /// Capture to a log file through the full pipeline and read it back.
    #[tokio::test(flavor = "multi_thread")]
    async fn test_log_sink_roundtrip_through_pipeline() {
        init_tracing();
        let bus = SimBus::new();
        let queue = Arc::new(FrameQueue::new(OverflowPolicy::Block { max_wait_ms: 500 }));
        let config = SessionConfig::new(SourceConfig::Sim {
            bus: bus.clone(),
            channel_index: 0,
        })
        .with_read_timeout_ms(50);
        let mut session = CaptureSession::new(config, queue.clone());

        let path = std::env::temp_dir().join(format!("cantap-pipeline-{}.log", uuid::Uuid::new_v4()));
        let mut hub = DispatchHub::new(queue);
        let log = LogSink::create(&path, LogFormat::Text).unwrap();
        hub.register(Box::new(log), DeliveryPolicy::Blocking { max_wait_ms: 500 });
        hub.start();

        session.start().await.unwrap();
        let injected = vec![
            Frame::new(0x100, &[1, 2, 3]).unwrap().with_timestamp(10),
            Frame::new_extended(0xABCDE, &[9]).unwrap().with_timestamp(20),
            Frame::remote(0x7FF, 8, false).unwrap().with_timestamp(30),
        ];
        bus.inject_all(injected.clone());

        wait_for(|| read_log_file(&path).map(|f| f.len()).unwrap_or(0) == 3).await;
        session.stop().await.unwrap();
        hub.shutdown().await;

        assert_eq!(read_log_file(&path).unwrap(), injected);
        let _ = std::fs::remove_file(&path);
    }
}

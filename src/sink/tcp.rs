// src/sink/tcp.rs
//
// Network sink: forwards rendered frame lines over a TCP connection.
// Connection loss surfaces as a SinkError, which deregisters the sink;
// reconnection is the caller's decision, by registering a fresh sink.

use std::io::Write;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::info;

use crate::codec::{FrameCodec, TextCodec};
use crate::frame::Frame;

use super::{FrameSink, SinkError};

const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Sink forwarding frames as text lines over TCP.
pub struct TcpSink {
    name: String,
    stream: TcpStream,
}

impl TcpSink {
    pub fn connect(addr: impl ToSocketAddrs) -> Result<Self, SinkError> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        stream.set_write_timeout(Some(WRITE_TIMEOUT))?;
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        info!(peer = %peer, "tcp sink connected");
        Ok(TcpSink {
            name: format!("tcp({peer})"),
            stream,
        })
    }
}

impl FrameSink for TcpSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn receive(&mut self, frame: &Frame) -> Result<(), SinkError> {
        let line = TextCodec::encode(frame).map_err(|e| SinkError::new(e.to_string()))?;
        self.stream.write_all(line.as_bytes())?;
        self.stream.write_all(b"\n")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader};
    use std::net::TcpListener;

    #[test]
    fn test_frames_arrive_as_lines() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream);
            let mut first = String::new();
            let mut second = String::new();
            reader.read_line(&mut first).unwrap();
            reader.read_line(&mut second).unwrap();
            (first, second)
        });

        let mut sink = TcpSink::connect(addr).unwrap();
        sink.receive(&Frame::new(0x100, &[1, 2, 3]).unwrap().with_timestamp(0))
            .unwrap();
        sink.receive(&Frame::new(0x200, &[]).unwrap().with_timestamp(5))
            .unwrap();
        drop(sink);

        let (first, second) = server.join().unwrap();
        assert_eq!(first.trim_end(), "(0.000000) 100#010203");
        assert_eq!(second.trim_end(), "(0.000005) 200#");
    }

    #[test]
    fn test_connect_failure_is_an_error() {
        // Bind then drop to get a port with nothing listening on it.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        assert!(TcpSink::connect(addr).is_err());
    }

    #[test]
    fn test_write_after_peer_close_eventually_errors() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut sink = TcpSink::connect(addr).unwrap();
        let (stream, _) = listener.accept().unwrap();
        drop(stream);
        drop(listener);

        let frame = Frame::new(0x1, &[0xFF; 8]).unwrap().with_timestamp(1);
        // The first writes may land in kernel buffers; keep writing
        // until the broken pipe surfaces.
        let mut failed = false;
        for _ in 0..10_000 {
            if sink.receive(&frame).is_err() {
                failed = true;
                break;
            }
        }
        assert!(failed, "writes to a closed peer must eventually fail");
    }
}

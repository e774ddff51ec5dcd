// src/sink/log.rs
//
// File log sink. Appends one frame per line, either the text codec's
// line format or JSON, under a `#` header comment. `read_log_file`
// parses either format back into frames.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::codec::{FrameCodec, TextCodec};
use crate::error::CaptureError;
use crate::frame::Frame;

use super::{FrameSink, SinkError};

/// On-disk line format.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Text codec lines: `(secs.micros) id#data`.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

/// Sink appending captured frames to a file.
pub struct LogSink {
    name: String,
    path: PathBuf,
    format: LogFormat,
    writer: BufWriter<File>,
}

impl LogSink {
    /// Open the file for appending, writing a header comment.
    pub fn create(path: impl AsRef<Path>, format: LogFormat) -> Result<Self, SinkError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let mut writer = BufWriter::new(file);
        writeln!(
            writer,
            "# cantap capture log, started {}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f")
        )?;
        writer.flush()?;
        info!(path = %path.display(), ?format, "log sink opened");
        Ok(LogSink {
            name: format!("log({})", path.display()),
            path,
            format,
            writer,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl FrameSink for LogSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn receive(&mut self, frame: &Frame) -> Result<(), SinkError> {
        let line = match self.format {
            LogFormat::Text => {
                TextCodec::encode(frame).map_err(|e| SinkError::new(e.to_string()))?
            }
            LogFormat::Json => {
                serde_json::to_string(frame).map_err(|e| SinkError::new(e.to_string()))?
            }
        };
        writeln!(self.writer, "{line}")?;
        // Flush per frame: a capture log that lags the bus is useless
        // when the process dies with it.
        self.writer.flush()?;
        Ok(())
    }
}

/// Parse a log file written by `LogSink`, either format. Header comments
/// and blank lines are skipped.
pub fn read_log_file(path: impl AsRef<Path>) -> Result<Vec<Frame>, CaptureError> {
    let file = File::open(path.as_ref())
        .map_err(|e| CaptureError::invalid(format!("cannot open log: {e}")))?;
    let reader = BufReader::new(file);
    let mut frames = Vec::new();
    for line in reader.lines() {
        let line = line.map_err(|e| CaptureError::invalid(format!("cannot read log: {e}")))?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let frame = if line.starts_with('{') {
            serde_json::from_str(line)
                .map_err(|e| CaptureError::invalid(format!("bad JSON log line: {e}")))?
        } else {
            TextCodec::decode(line)?
        };
        frames.push(frame);
    }
    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_log_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("cantap-{tag}-{}.log", uuid::Uuid::new_v4()))
    }

    fn sample_frames() -> Vec<Frame> {
        vec![
            Frame::new(0x100, &[1, 2, 3]).unwrap().with_timestamp(0),
            Frame::new(0x200, &[]).unwrap().with_timestamp(5),
            Frame::new_extended(0xABCDE, &[0xDE, 0xAD]).unwrap().with_timestamp(1_000_001),
            Frame::remote(0x321, 2, false).unwrap().with_timestamp(77),
        ]
    }

    #[test]
    fn test_text_log_roundtrip() {
        let path = temp_log_path("text");
        let frames = sample_frames();
        {
            let mut sink = LogSink::create(&path, LogFormat::Text).unwrap();
            for frame in &frames {
                sink.receive(frame).unwrap();
            }
        }
        let read_back = read_log_file(&path).unwrap();
        assert_eq!(read_back, frames);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_json_log_roundtrip() {
        let path = temp_log_path("json");
        let frames = sample_frames();
        {
            let mut sink = LogSink::create(&path, LogFormat::Json).unwrap();
            for frame in &frames {
                sink.receive(frame).unwrap();
            }
        }
        let read_back = read_log_file(&path).unwrap();
        assert_eq!(read_back, frames);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_header_comment_is_skipped() {
        let path = temp_log_path("header");
        {
            let mut sink = LogSink::create(&path, LogFormat::Text).unwrap();
            sink.receive(&Frame::new(0x1, &[]).unwrap().with_timestamp(9))
                .unwrap();
        }
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with("# cantap capture log"));
        assert_eq!(read_log_file(&path).unwrap().len(), 1);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_reader_rejects_corrupt_lines() {
        let path = temp_log_path("corrupt");
        std::fs::write(&path, "(0.000001) 123#AA\nnot a frame\n").unwrap();
        assert!(read_log_file(&path).is_err());
        let _ = std::fs::remove_file(&path);
    }
}

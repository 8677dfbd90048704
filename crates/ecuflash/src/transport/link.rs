//! Raw CAN link abstraction and frame audit sinks

use std::fmt;
use std::fmt::Write as _;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;

use super::TransportError;

/// Largest 11-bit arbitration ID.
pub const STANDARD_ID_MAX: u16 = 0x7FF;

/// One classical CAN frame: 11-bit arbitration ID, up to 8 data bytes.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct CanFrame {
    id: u16,
    dlc: u8,
    bytes: [u8; 8],
}

impl CanFrame {
    pub fn new(id: u16, data: &[u8]) -> Result<Self, TransportError> {
        if id > STANDARD_ID_MAX {
            return Err(TransportError::InvalidFrame(format!(
                "arbitration ID 0x{id:X} exceeds 11 bits"
            )));
        }
        if data.len() > 8 {
            return Err(TransportError::InvalidFrame(format!(
                "{} data bytes exceed the classical CAN frame",
                data.len()
            )));
        }
        let mut bytes = [0u8; 8];
        bytes[..data.len()].copy_from_slice(data);
        Ok(Self {
            id,
            dlc: data.len() as u8,
            bytes,
        })
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn dlc(&self) -> u8 {
        self.dlc
    }

    pub fn data(&self) -> &[u8] {
        &self.bytes[..self.dlc as usize]
    }
}

impl fmt::Debug for CanFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CanFrame {{ id: 0x{:03X}, data: [", self.id)?;
        for (i, byte) in self.data().iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{byte:02X}")?;
        }
        f.write_str("] }")
    }
}

/// Direction of a frame relative to this client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Tx,
    Rx,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Direction::Tx => "TX",
            Direction::Rx => "RX",
        })
    }
}

/// Observer for every frame crossing a link.
pub trait FrameSink: Send + Sync {
    fn record(&self, direction: Direction, frame: &CanFrame);
}

/// Audit line for one frame: `TX id=0x7E0 dlc=8 data=02 10 03 00 00 00 00 00`.
pub fn audit_line(direction: Direction, frame: &CanFrame) -> String {
    let mut line = format!("{direction} id=0x{:X} dlc={}", frame.id(), frame.dlc());
    line.push_str(" data=");
    for (i, byte) in frame.data().iter().enumerate() {
        if i > 0 {
            line.push(' ');
        }
        let _ = write!(line, "{byte:02X}");
    }
    line
}

/// Default sink: frames go to the tracing subscriber at debug level.
pub struct TraceSink;

impl FrameSink for TraceSink {
    fn record(&self, direction: Direction, frame: &CanFrame) {
        tracing::debug!(target: "ecuflash::frames", "{}", audit_line(direction, frame));
    }
}

/// File sink appending one audit line per frame.
///
/// The file is opened for append on every frame, so external log rotation
/// never loses writes.
pub struct FrameLog {
    path: PathBuf,
}

impl FrameLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl FrameSink for FrameLog {
    fn record(&self, direction: Direction, frame: &CanFrame) {
        let line = audit_line(direction, frame);
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| writeln!(file, "{line}"));
        if let Err(e) = result {
            tracing::warn!(path = %self.path.display(), error = %e, "frame audit write failed");
        }
    }
}

/// Blocking send/receive of classical CAN frames on one channel.
///
/// A link is exclusively owned by one flash run or probe; there is one
/// reader and one writer, both on the same scheduler context. Receive
/// filtering happens at the driver where possible; callers still match the
/// arbitration ID of returned frames.
#[async_trait]
pub trait CanLink: Send + Sync {
    async fn send(&self, frame: &CanFrame) -> Result<(), TransportError>;

    /// Wait up to `timeout` for the next frame; `Ok(None)` on timeout.
    async fn recv(&self, timeout: Duration) -> Result<Option<CanFrame>, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_rejects_wide_id_and_long_data() {
        assert!(CanFrame::new(0x800, &[0x00]).is_err());
        assert!(CanFrame::new(0x7FF, &[0x00]).is_ok());
        assert!(CanFrame::new(0x100, &[0u8; 9]).is_err());
    }

    #[test]
    fn frame_pads_internally_but_keeps_dlc() {
        let frame = CanFrame::new(0x7E0, &[0x02, 0x10, 0x03]).unwrap();
        assert_eq!(frame.dlc(), 3);
        assert_eq!(frame.data(), &[0x02, 0x10, 0x03]);
    }

    #[test]
    fn audit_line_format() {
        let frame =
            CanFrame::new(0x7E0, &[0x02, 0x10, 0x03, 0x00, 0x00, 0x00, 0x00, 0x00]).unwrap();
        assert_eq!(
            audit_line(Direction::Tx, &frame),
            "TX id=0x7E0 dlc=8 data=02 10 03 00 00 00 00 00"
        );
        let response = CanFrame::new(0x7E8, &[0x02, 0x50, 0x03]).unwrap();
        assert_eq!(
            audit_line(Direction::Rx, &response),
            "RX id=0x7E8 dlc=3 data=02 50 03"
        );
    }

    #[test]
    fn frame_log_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frames.log");
        let log = FrameLog::new(&path);
        let frame = CanFrame::new(0x7E0, &[0x02, 0x3E, 0x00]).unwrap();
        log.record(Direction::Tx, &frame);
        log.record(Direction::Rx, &frame);
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("TX id=0x7E0"));
        assert!(lines[1].starts_with("RX id=0x7E0"));
    }
}

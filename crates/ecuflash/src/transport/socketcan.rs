//! Raw SocketCAN link (Linux)

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use socketcan::{CanFilter, CanSocket, EmbeddedFrame, Id, Socket, SocketOptions, StandardId};

use super::{CanFrame, CanLink, Direction, FrameSink, TraceSink, TransportError};

/// Hardware CAN link over a SocketCAN interface.
///
/// The socket is blocking; calls are routed through `spawn_blocking` so the
/// single-threaded flash run can still observe timeouts. The interface must
/// already be configured and up (`ip link set can0 type can bitrate 500000`).
pub struct SocketCanLink {
    socket: Arc<Mutex<CanSocket>>,
    sink: Arc<dyn FrameSink>,
}

impl SocketCanLink {
    /// Open `interface` with the kernel receive filter restricted to the
    /// given `(id, mask)` pairs.
    pub fn open(interface: &str, filters: &[(u16, u16)]) -> Result<Self, TransportError> {
        let socket = CanSocket::open(interface)
            .map_err(|e| TransportError::Bus(format!("open {interface}: {e}")))?;
        if !filters.is_empty() {
            let rules: Vec<CanFilter> = filters
                .iter()
                .map(|&(id, mask)| CanFilter::new(id as u32, mask as u32))
                .collect();
            socket
                .set_filters(rules.as_slice())
                .map_err(|e| TransportError::Bus(format!("set filters: {e}")))?;
        }
        Ok(Self {
            socket: Arc::new(Mutex::new(socket)),
            sink: Arc::new(TraceSink),
        })
    }

    pub fn with_sink(mut self, sink: Arc<dyn FrameSink>) -> Self {
        self.sink = sink;
        self
    }
}

#[async_trait]
impl CanLink for SocketCanLink {
    async fn send(&self, frame: &CanFrame) -> Result<(), TransportError> {
        let socket = self.socket.clone();
        let id = StandardId::new(frame.id()).ok_or_else(|| {
            TransportError::InvalidFrame(format!("arbitration ID 0x{:X}", frame.id()))
        })?;
        let data = frame.data().to_vec();

        tokio::task::spawn_blocking(move || {
            let raw = socketcan::CanFrame::new(id, &data).ok_or_else(|| {
                TransportError::InvalidFrame("frame payload exceeds 8 bytes".into())
            })?;
            socket
                .lock()
                .write_frame(&raw)
                .map_err(|e| TransportError::Bus(format!("send: {e}")))
        })
        .await
        .map_err(|e| TransportError::Bus(format!("send task: {e}")))??;

        self.sink.record(Direction::Tx, frame);
        Ok(())
    }

    async fn recv(&self, timeout: Duration) -> Result<Option<CanFrame>, TransportError> {
        let socket = self.socket.clone();
        let received = tokio::task::spawn_blocking(move || {
            let guard = socket.lock();
            guard
                .set_read_timeout(timeout)
                .map_err(|e| TransportError::Bus(format!("set timeout: {e}")))?;
            match guard.read_frame() {
                Ok(frame) => Ok(Some(frame)),
                Err(ref e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    Ok(None)
                }
                Err(e) => Err(TransportError::Bus(format!("recv: {e}"))),
            }
        })
        .await
        .map_err(|e| TransportError::Bus(format!("recv task: {e}")))??;

        let Some(raw) = received else {
            return Ok(None);
        };
        // Remote, error, and 29-bit frames are irrelevant to this client.
        let socketcan::CanFrame::Data(data_frame) = raw else {
            return Ok(None);
        };
        let Id::Standard(id) = data_frame.id() else {
            return Ok(None);
        };
        let frame = CanFrame::new(id.as_raw(), data_frame.data())?;
        self.sink.record(Direction::Rx, &frame);
        Ok(Some(frame))
    }
}

//! Scripted link for frame-exact transport tests

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{CanFrame, CanLink, Direction, FrameSink, TransportError};

/// Test double that records every transmitted frame and replays a scripted
/// queue of incoming frames. An empty queue behaves like a receive timeout.
#[derive(Default)]
pub struct ScriptedLink {
    sent: Mutex<Vec<CanFrame>>,
    queue: Mutex<VecDeque<CanFrame>>,
    sink: Mutex<Option<Arc<dyn FrameSink>>>,
}

impl ScriptedLink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_sink(&self, sink: Arc<dyn FrameSink>) {
        *self.sink.lock() = Some(sink);
    }

    /// Queue a frame to be returned by the next `recv` calls.
    pub fn push_frame(&self, id: u16, data: &[u8]) {
        let frame = CanFrame::new(id, data).expect("scripted frame");
        self.queue.lock().push_back(frame);
    }

    /// Frames transmitted so far, in order.
    pub fn sent(&self) -> Vec<CanFrame> {
        self.sent.lock().clone()
    }

    pub fn clear_sent(&self) {
        self.sent.lock().clear();
    }
}

#[async_trait]
impl CanLink for ScriptedLink {
    async fn send(&self, frame: &CanFrame) -> Result<(), TransportError> {
        if let Some(sink) = self.sink.lock().as_ref() {
            sink.record(Direction::Tx, frame);
        }
        self.sent.lock().push(*frame);
        Ok(())
    }

    async fn recv(&self, _timeout: Duration) -> Result<Option<CanFrame>, TransportError> {
        let frame = self.queue.lock().pop_front();
        if let (Some(frame), Some(sink)) = (&frame, self.sink.lock().as_ref()) {
            sink.record(Direction::Rx, frame);
        }
        Ok(frame)
    }
}

//! ISO 15765-2 segmented transport over a raw CAN link
//!
//! Frames arbitrary payloads of up to 4095 bytes onto 8-byte classical CAN
//! frames and reassembles them, honoring the peer's flow control. Only the
//! "continue to send" flow status is supported; wait and overflow abort the
//! transfer.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use super::{CanFrame, CanLink, TransportError};

/// Largest payload expressible in a first frame's 12-bit length field.
pub const MAX_PDU: usize = 4095;

/// Data bytes carried by a single frame.
const SF_CAPACITY: usize = 7;
/// Payload prefix carried by a first frame.
const FF_PREFIX: usize = 6;
/// Data bytes per consecutive frame.
const CF_CAPACITY: usize = 7;

const PADDING: u8 = 0x00;
const FIRST_FRAME_ATTEMPTS: u32 = 3;
const FLOW_CONTROL_TIMEOUT: Duration = Duration::from_secs(2);

/// PCI frame types (high nibble of the first data byte).
mod pci {
    pub const SINGLE: u8 = 0x0;
    pub const FIRST: u8 = 0x1;
    pub const CONSECUTIVE: u8 = 0x2;
    pub const FLOW_CONTROL: u8 = 0x3;
}

/// Flow control statuses (low nibble of a flow-control PCI byte).
mod flow_status {
    pub const CONTINUE: u8 = 0x0;
    pub const WAIT: u8 = 0x1;
    pub const OVERFLOW: u8 = 0x2;
}

/// Decode an STmin byte into a separation time.
///
/// `0x00..=0x7F` are milliseconds, `0xF1..=0xF9` are 100..900 microseconds,
/// every reserved value maps to zero.
pub fn decode_st_min(raw: u8) -> Duration {
    match raw {
        0x00..=0x7F => Duration::from_millis(raw as u64),
        0xF1..=0xF9 => Duration::from_micros((raw as u64 - 0xF0) * 100),
        _ => Duration::ZERO,
    }
}

/// One ISO-TP conversation with a fixed request/response CAN ID pair.
///
/// Carries the flow-control state of the transmit direction: the block-size
/// budget and separation time granted by the peer's last flow control.
pub struct IsoTpEndpoint {
    link: Arc<dyn CanLink>,
    tx_id: u16,
    rx_id: u16,
    block_size: u8,
    st_min: Duration,
}

impl IsoTpEndpoint {
    pub fn new(link: Arc<dyn CanLink>, tx_id: u16, rx_id: u16) -> Self {
        Self {
            link,
            tx_id,
            rx_id,
            block_size: 0,
            st_min: Duration::ZERO,
        }
    }

    pub fn link(&self) -> &Arc<dyn CanLink> {
        &self.link
    }

    async fn send_frame(&self, data: &[u8]) -> Result<(), TransportError> {
        let frame = CanFrame::new(self.tx_id, data)?;
        self.link.send(&frame).await
    }

    /// Next frame from our peer; frames with other arbitration IDs are
    /// skipped until the deadline passes.
    async fn recv_frame(&self, timeout: Duration) -> Result<CanFrame, TransportError> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TransportError::Timeout);
            }
            match self.link.recv(remaining).await? {
                Some(frame) if frame.id() == self.rx_id => return Ok(frame),
                Some(frame) => trace!(id = frame.id(), "skipping frame from other endpoint"),
                None => return Err(TransportError::Timeout),
            }
        }
    }

    /// Send one payload as a single frame or a first-frame/consecutive-frame
    /// train paced by the peer's flow control.
    pub async fn transmit(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        if payload.len() > MAX_PDU {
            return Err(TransportError::PayloadTooLarge(payload.len()));
        }

        if payload.len() <= SF_CAPACITY {
            let mut data = Vec::with_capacity(8);
            data.push(payload.len() as u8);
            data.extend_from_slice(payload);
            data.resize(8, PADDING);
            return self.send_frame(&data).await;
        }

        let mut first = Vec::with_capacity(8);
        first.push((pci::FIRST << 4) | ((payload.len() >> 8) as u8 & 0x0F));
        first.push((payload.len() & 0xFF) as u8);
        first.extend_from_slice(&payload[..FF_PREFIX]);

        let mut attempt = 1;
        loop {
            debug!(attempt, len = payload.len(), "sending first frame");
            self.send_frame(&first).await?;
            match self.await_flow_control().await {
                Ok(()) => break,
                Err(fatal @ (TransportError::Wait | TransportError::Overflow)) => {
                    return Err(fatal)
                }
                Err(e) if attempt >= FIRST_FRAME_ATTEMPTS => return Err(e),
                Err(e) => {
                    warn!(attempt, error = %e, "no valid flow control, retrying first frame");
                    attempt += 1;
                }
            }
        }

        let remainder = &payload[FF_PREFIX..];
        let total_frames = remainder.len().div_ceil(CF_CAPACITY);
        let mut sequence: u8 = 1;
        let mut sent_in_block: u8 = 0;
        for (index, chunk) in remainder.chunks(CF_CAPACITY).enumerate() {
            let mut frame = Vec::with_capacity(8);
            frame.push((pci::CONSECUTIVE << 4) | sequence);
            frame.extend_from_slice(chunk);
            frame.resize(8, PADDING);
            self.send_frame(&frame).await?;
            sequence = (sequence + 1) % 16;

            if !self.st_min.is_zero() {
                tokio::time::sleep(self.st_min).await;
            }
            // BS = 0 clears the whole remainder; the last frame needs no
            // further clearance either.
            if self.block_size != 0 && index + 1 < total_frames {
                sent_in_block += 1;
                if sent_in_block >= self.block_size {
                    self.await_flow_control().await?;
                    sent_in_block = 0;
                }
            }
        }
        Ok(())
    }

    async fn await_flow_control(&mut self) -> Result<(), TransportError> {
        let frame = self.recv_frame(FLOW_CONTROL_TIMEOUT).await?;
        let data = frame.data();
        if data.len() < 3 || data[0] >> 4 != pci::FLOW_CONTROL {
            return Err(TransportError::FlowControl(format!(
                "unexpected frame {data:02X?}"
            )));
        }
        match data[0] & 0x0F {
            flow_status::CONTINUE => {
                self.block_size = data[1];
                self.st_min = decode_st_min(data[2]);
                trace!(bs = self.block_size, st_min = ?self.st_min, "flow control: continue");
                Ok(())
            }
            flow_status::WAIT => Err(TransportError::Wait),
            flow_status::OVERFLOW => Err(TransportError::Overflow),
            other => Err(TransportError::FlowControl(format!(
                "unknown flow status 0x{other:X}"
            ))),
        }
    }

    /// Read one complete payload, reassembling multi-frame transfers.
    pub async fn receive(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let first = self.recv_frame(timeout).await?;
        let data = first.data();
        if data.is_empty() {
            return Err(TransportError::InvalidFrame("empty frame".into()));
        }

        match data[0] >> 4 {
            pci::SINGLE => {
                let len = (data[0] & 0x0F) as usize;
                if len > SF_CAPACITY || data.len() < 1 + len {
                    return Err(TransportError::InvalidFrame(format!(
                        "single frame length {len} exceeds frame data"
                    )));
                }
                let payload = data[1..1 + len].to_vec();
                if payload.first() == Some(&0x7F) {
                    debug!(data = ?payload, "negative response");
                }
                Ok(payload)
            }
            pci::FIRST => {
                if data.len() < 8 {
                    return Err(TransportError::InvalidFrame("truncated first frame".into()));
                }
                let total = (((data[0] & 0x0F) as usize) << 8) | data[1] as usize;
                let mut payload = Vec::with_capacity(total);
                payload.extend_from_slice(&data[2..]);

                // Clear the peer to send everything: BS = 0, STmin = 0.
                self.send_frame(&[
                    (pci::FLOW_CONTROL << 4) | flow_status::CONTINUE,
                    0x00,
                    0x00,
                    PADDING,
                    PADDING,
                    PADDING,
                    PADDING,
                    PADDING,
                ])
                .await?;

                let mut expected: u8 = 1;
                while payload.len() < total {
                    let frame = self.recv_frame(timeout).await?;
                    let data = frame.data();
                    if data.is_empty() || data[0] >> 4 != pci::CONSECUTIVE {
                        return Err(TransportError::InvalidFrame(format!(
                            "expected consecutive frame, got {data:02X?}"
                        )));
                    }
                    let got = data[0] & 0x0F;
                    if got != expected {
                        return Err(TransportError::SequenceMismatch { expected, got });
                    }
                    payload.extend_from_slice(&data[1..]);
                    expected = (expected + 1) % 16;
                }
                payload.truncate(total);
                Ok(payload)
            }
            other => Err(TransportError::InvalidFrame(format!(
                "unexpected PCI type 0x{other:X}"
            ))),
        }
    }

    /// Send a request and read the full response payload.
    pub async fn request(
        &mut self,
        request: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        self.transmit(request).await?;
        self.receive(timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::super::ScriptedLink;
    use super::*;

    const TX: u16 = 0x7E0;
    const RX: u16 = 0x7E8;

    fn endpoint(link: &Arc<ScriptedLink>) -> IsoTpEndpoint {
        IsoTpEndpoint::new(link.clone() as Arc<dyn CanLink>, TX, RX)
    }

    #[test]
    fn st_min_decoding() {
        assert_eq!(decode_st_min(0x00), Duration::ZERO);
        assert_eq!(decode_st_min(0x7F), Duration::from_millis(127));
        assert_eq!(decode_st_min(0xF1), Duration::from_micros(100));
        assert_eq!(decode_st_min(0xF9), Duration::from_micros(900));
        assert_eq!(decode_st_min(0x80), Duration::ZERO);
        assert_eq!(decode_st_min(0xF0), Duration::ZERO);
    }

    #[tokio::test]
    async fn short_payload_goes_out_as_padded_single_frame() {
        let link = Arc::new(ScriptedLink::new());
        let mut tp = endpoint(&link);
        tp.transmit(&[0x10, 0x03]).await.unwrap();

        let sent = link.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].id(), TX);
        assert_eq!(
            sent[0].data(),
            &[0x02, 0x10, 0x03, 0x00, 0x00, 0x00, 0x00, 0x00]
        );
    }

    #[tokio::test]
    async fn seven_bytes_single_frame_eight_bytes_first_frame() {
        let link = Arc::new(ScriptedLink::new());
        let mut tp = endpoint(&link);
        tp.transmit(&[0xAA; 7]).await.unwrap();
        assert_eq!(link.sent()[0].data()[0], 0x07);

        link.clear_sent();
        link.push_frame(RX, &[0x30, 0x00, 0x00, 0, 0, 0, 0, 0]);
        tp.transmit(&[0xAA; 8]).await.unwrap();
        assert_eq!(link.sent()[0].data()[0], 0x10);
    }

    #[tokio::test]
    async fn twenty_byte_payload_frames_exactly() {
        let payload: Vec<u8> = (0x00..0x14).collect();
        let link = Arc::new(ScriptedLink::new());
        link.push_frame(RX, &[0x30, 0x00, 0x00, 0, 0, 0, 0, 0]);
        let mut tp = endpoint(&link);
        tp.transmit(&payload).await.unwrap();

        let sent = link.sent();
        assert_eq!(sent.len(), 3);
        assert_eq!(
            sent[0].data(),
            &[0x14, 0x14, 0x00, 0x01, 0x02, 0x03, 0x04, 0x05]
        );
        assert_eq!(
            sent[1].data(),
            &[0x21, 0x06, 0x07, 0x08, 0x09, 0x0A, 0x0B, 0x0C]
        );
        assert_eq!(
            sent[2].data(),
            &[0x22, 0x0D, 0x0E, 0x0F, 0x10, 0x11, 0x12, 0x13]
        );
    }

    #[tokio::test]
    async fn frame_count_matches_length_formula() {
        for len in [8usize, 62, 63, 64, 4095] {
            let link = Arc::new(ScriptedLink::new());
            link.push_frame(RX, &[0x30, 0x00, 0x00, 0, 0, 0, 0, 0]);
            let mut tp = endpoint(&link);
            tp.transmit(&vec![0x55; len]).await.unwrap();
            assert_eq!(link.sent().len(), 1 + (len - 6).div_ceil(7), "len {len}");
        }
    }

    #[tokio::test]
    async fn oversized_payload_rejected() {
        let link = Arc::new(ScriptedLink::new());
        let mut tp = endpoint(&link);
        assert_eq!(
            tp.transmit(&[0u8; 4096]).await,
            Err(TransportError::PayloadTooLarge(4096))
        );
        assert!(link.sent().is_empty());
    }

    #[tokio::test]
    async fn first_frame_retried_three_times_then_fatal() {
        let link = Arc::new(ScriptedLink::new());
        let mut tp = endpoint(&link);
        let err = tp.transmit(&[0x11; 20]).await.unwrap_err();
        assert_eq!(err, TransportError::Timeout);
        // three identical first-frame attempts, no consecutive frames
        assert_eq!(link.sent().len(), 3);
        assert!(link.sent().iter().all(|f| f.data()[0] == 0x10));
    }

    #[tokio::test]
    async fn flow_control_wait_and_overflow_are_fatal() {
        for (status, expected) in [(0x31, TransportError::Wait), (0x32, TransportError::Overflow)]
        {
            let link = Arc::new(ScriptedLink::new());
            link.push_frame(RX, &[status, 0x00, 0x00, 0, 0, 0, 0, 0]);
            let mut tp = endpoint(&link);
            assert_eq!(tp.transmit(&[0x11; 20]).await, Err(expected));
            // no retry once the peer answered
            assert_eq!(link.sent().len(), 1);
        }
    }

    #[tokio::test]
    async fn block_size_requests_fresh_flow_control() {
        // 34-byte payload: FF carries 6, then 4 CFs. BS=2 means a second
        // flow control is consumed after the first two CFs.
        let link = Arc::new(ScriptedLink::new());
        link.push_frame(RX, &[0x30, 0x02, 0x00, 0, 0, 0, 0, 0]);
        link.push_frame(RX, &[0x30, 0x02, 0x00, 0, 0, 0, 0, 0]);
        let mut tp = endpoint(&link);
        tp.transmit(&[0x22; 34]).await.unwrap();
        assert_eq!(link.sent().len(), 5);
    }

    #[tokio::test]
    async fn receive_single_frame_strips_padding() {
        let link = Arc::new(ScriptedLink::new());
        link.push_frame(RX, &[0x02, 0x50, 0x03, 0x00, 0x00, 0x00, 0x00, 0x00]);
        let mut tp = endpoint(&link);
        let payload = tp.receive(Duration::from_millis(100)).await.unwrap();
        assert_eq!(payload, vec![0x50, 0x03]);
    }

    #[tokio::test]
    async fn receive_multi_frame_reassembles_and_acknowledges() {
        let link = Arc::new(ScriptedLink::new());
        link.push_frame(RX, &[0x10, 0x0A, 0x62, 0xF1, 0x90, 0x41, 0x42, 0x43]);
        link.push_frame(RX, &[0x21, 0x44, 0x45, 0x46, 0x47, 0xAA, 0xAA, 0xAA]);
        let mut tp = endpoint(&link);
        let payload = tp.receive(Duration::from_millis(100)).await.unwrap();
        assert_eq!(
            payload,
            vec![0x62, 0xF1, 0x90, 0x41, 0x42, 0x43, 0x44, 0x45, 0x46, 0x47]
        );
        // the flow control we emitted: continue, BS=0, STmin=0
        let sent = link.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].data(), &[0x30, 0x00, 0x00, 0, 0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn receive_rejects_sequence_mismatch() {
        let link = Arc::new(ScriptedLink::new());
        link.push_frame(RX, &[0x10, 0x0A, 0x62, 0xF1, 0x90, 0x41, 0x42, 0x43]);
        link.push_frame(RX, &[0x22, 0x44, 0x45, 0x46, 0x47, 0xAA, 0xAA, 0xAA]);
        let mut tp = endpoint(&link);
        let err = tp.receive(Duration::from_millis(100)).await.unwrap_err();
        assert_eq!(err, TransportError::SequenceMismatch { expected: 1, got: 2 });
    }

    #[tokio::test]
    async fn receive_skips_foreign_ids() {
        let link = Arc::new(ScriptedLink::new());
        link.push_frame(0x123, &[0x08, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]);
        link.push_frame(RX, &[0x01, 0x7E, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
        let mut tp = endpoint(&link);
        let payload = tp.receive(Duration::from_millis(100)).await.unwrap();
        assert_eq!(payload, vec![0x7E]);
    }

    #[tokio::test]
    async fn request_round_trip() {
        let link = Arc::new(ScriptedLink::new());
        link.push_frame(RX, &[0x02, 0x50, 0x03, 0x00, 0x00, 0x00, 0x00, 0x00]);
        let mut tp = endpoint(&link);
        let response = tp
            .request(&[0x10, 0x03], Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(response, vec![0x50, 0x03]);
        assert_eq!(
            link.sent()[0].data(),
            &[0x02, 0x10, 0x03, 0x00, 0x00, 0x00, 0x00, 0x00]
        );
    }
}

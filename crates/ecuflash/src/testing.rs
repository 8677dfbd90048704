//! In-process test doubles
//!
//! A channel-backed CAN link pair plus a mock bootloader ECU speaking
//! server-side ISO-TP and the diagnostic services the flash pipeline uses.
//! The mock verifies seed/key with the real AES contract and recomputes the
//! transfer CRC in its validate routine, so end-to-end tests exercise the
//! same byte-level agreements as the hardware.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::flash::{derive_key, TRANSFER_CRC};
use crate::transport::{CanFrame, CanLink, Direction, FrameSink, TransportError};
use crate::uds::service_id;

/// One side of an in-process CAN bus.
pub struct ChannelLink {
    tx: UnboundedSender<CanFrame>,
    rx: Mutex<UnboundedReceiver<CanFrame>>,
    sink: Option<Arc<dyn FrameSink>>,
}

/// Two cross-connected links forming a private bus.
pub fn link_pair() -> (ChannelLink, ChannelLink) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    (
        ChannelLink {
            tx: a_tx,
            rx: Mutex::new(a_rx),
            sink: None,
        },
        ChannelLink {
            tx: b_tx,
            rx: Mutex::new(b_rx),
            sink: None,
        },
    )
}

impl ChannelLink {
    pub fn with_sink(mut self, sink: Arc<dyn FrameSink>) -> Self {
        self.sink = Some(sink);
        self
    }
}

#[async_trait]
impl CanLink for ChannelLink {
    async fn send(&self, frame: &CanFrame) -> Result<(), TransportError> {
        if let Some(sink) = &self.sink {
            sink.record(Direction::Tx, frame);
        }
        self.tx
            .send(*frame)
            .map_err(|_| TransportError::Bus("peer closed".into()))
    }

    async fn recv(&self, timeout: Duration) -> Result<Option<CanFrame>, TransportError> {
        let mut rx = self.rx.lock().await;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(frame)) => {
                if let Some(sink) = &self.sink {
                    sink.record(Direction::Rx, &frame);
                }
                Ok(Some(frame))
            }
            Ok(None) => Err(TransportError::Bus("peer closed".into())),
            Err(_) => Ok(None),
        }
    }
}

/// Behavior knobs for the mock bootloader.
#[derive(Debug, Clone)]
pub struct MockEcuConfig {
    pub tx_id: u16,
    pub rx_id: u16,
    /// Seed returned for every seed request.
    pub seed: [u8; 16],
    /// maxNumberOfBlockLength advertised by RequestDownload.
    pub max_block_len: u16,
    /// Flow-control window granted when receiving multi-frame requests.
    pub block_size: u8,
    pub st_min: u8,
    /// Refuse every key, answering invalidKey.
    pub reject_keys: bool,
}

impl Default for MockEcuConfig {
    fn default() -> Self {
        Self {
            tx_id: 0x7E8,
            rx_id: 0x7E0,
            seed: [
                0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xAA, 0xBB, 0xCC,
                0xDD, 0xEE, 0xFF,
            ],
            max_block_len: 0x0082,
            block_size: 0,
            st_min: 0,
            reject_keys: false,
        }
    }
}

/// Everything the mock ECU observed during a run.
#[derive(Debug, Clone, Default)]
pub struct EcuState {
    /// Raw UDS requests in arrival order.
    pub requests: Vec<Vec<u8>>,
    /// Region erased by the last erase routine.
    pub erased: Option<(u32, u32)>,
    /// Region accepted by the last RequestDownload.
    pub download: Option<(u32, u32)>,
    /// Bytes accumulated from TransferData, in arrival order.
    pub received: Vec<u8>,
    /// Sequence counter expected by the next TransferData.
    pub expected_sequence: u8,
    /// Security levels unlocked, in order.
    pub unlocked: Vec<u8>,
    /// Reset sub-functions observed.
    pub resets: Vec<u8>,
    /// Outcome of the last validate routine.
    pub validate_ok: Option<bool>,
}

/// A mock bootloader running as a background task.
pub struct MockEcu {
    state: Arc<SyncMutex<EcuState>>,
    handle: JoinHandle<()>,
}

impl MockEcu {
    pub fn spawn(link: ChannelLink, config: MockEcuConfig) -> Self {
        let state = Arc::new(SyncMutex::new(EcuState {
            expected_sequence: 1,
            ..EcuState::default()
        }));
        let handle = tokio::spawn(run_ecu(link, config, state.clone()));
        Self { state, handle }
    }

    /// Snapshot of the observed state.
    pub fn state(&self) -> EcuState {
        self.state.lock().clone()
    }

    pub fn abort(&self) {
        self.handle.abort();
    }
}

impl Drop for MockEcu {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn run_ecu(link: ChannelLink, config: MockEcuConfig, state: Arc<SyncMutex<EcuState>>) {
    let mut pending_key: Option<(u8, [u8; 16])> = None;
    loop {
        let Ok(request) = ecu_receive(&link, &config).await else {
            return;
        };
        state.lock().requests.push(request.clone());
        if let Some(response) = handle_request(&request, &config, &state, &mut pending_key) {
            if ecu_send(&link, &config, &response).await.is_err() {
                return;
            }
        }
    }
}

/// Server-side ISO-TP reassembly of one request.
async fn ecu_receive(link: &ChannelLink, config: &MockEcuConfig) -> Result<Vec<u8>, ()> {
    loop {
        let frame = match link.recv(Duration::from_secs(60)).await {
            Ok(Some(frame)) if frame.id() == config.rx_id => frame,
            Ok(Some(_)) | Ok(None) => continue,
            Err(_) => return Err(()),
        };
        let data = frame.data();
        match data[0] >> 4 {
            0x0 => {
                let len = (data[0] & 0x0F) as usize;
                return Ok(data[1..1 + len].to_vec());
            }
            0x1 => {
                let total = (((data[0] & 0x0F) as usize) << 8) | data[1] as usize;
                let mut payload = data[2..].to_vec();
                let clearance = [
                    0x30,
                    config.block_size,
                    config.st_min,
                    0,
                    0,
                    0,
                    0,
                    0,
                ];
                send_raw(link, config.tx_id, &clearance).await?;

                let mut sequence: u8 = 1;
                let mut in_window: u8 = 0;
                while payload.len() < total {
                    let frame = match link.recv(Duration::from_secs(5)).await {
                        Ok(Some(frame)) if frame.id() == config.rx_id => frame,
                        Ok(Some(_)) => continue,
                        _ => return Err(()),
                    };
                    let data = frame.data();
                    if data[0] >> 4 != 0x2 || (data[0] & 0x0F) != sequence {
                        return Err(());
                    }
                    payload.extend_from_slice(&data[1..]);
                    sequence = (sequence + 1) % 16;
                    if config.block_size != 0 && payload.len() < total {
                        in_window += 1;
                        if in_window >= config.block_size {
                            send_raw(link, config.tx_id, &clearance).await?;
                            in_window = 0;
                        }
                    }
                }
                payload.truncate(total);
                return Ok(payload);
            }
            _ => continue,
        }
    }
}

/// Client-facing ISO-TP transmit, honoring the tester's flow control.
async fn ecu_send(link: &ChannelLink, config: &MockEcuConfig, payload: &[u8]) -> Result<(), ()> {
    if payload.len() <= 7 {
        let mut data = vec![payload.len() as u8];
        data.extend_from_slice(payload);
        data.resize(8, 0);
        return send_raw(link, config.tx_id, &data).await;
    }

    let mut first = vec![
        0x10 | ((payload.len() >> 8) as u8 & 0x0F),
        (payload.len() & 0xFF) as u8,
    ];
    first.extend_from_slice(&payload[..6]);
    send_raw(link, config.tx_id, &first).await?;

    loop {
        match link.recv(Duration::from_secs(5)).await {
            Ok(Some(frame)) if frame.id() == config.rx_id && frame.data()[0] >> 4 == 0x3 => break,
            Ok(Some(_)) => continue,
            _ => return Err(()),
        }
    }

    let mut sequence: u8 = 1;
    for chunk in payload[6..].chunks(7) {
        let mut data = vec![0x20 | sequence];
        data.extend_from_slice(chunk);
        data.resize(8, 0);
        send_raw(link, config.tx_id, &data).await?;
        sequence = (sequence + 1) % 16;
    }
    Ok(())
}

async fn send_raw(link: &ChannelLink, id: u16, data: &[u8]) -> Result<(), ()> {
    let frame = CanFrame::new(id, data).map_err(|_| ())?;
    link.send(&frame).await.map_err(|_| ())
}

fn positive(sid: u8, data: &[u8]) -> Vec<u8> {
    let mut response = Vec::with_capacity(1 + data.len());
    response.push(sid + 0x40);
    response.extend_from_slice(data);
    response
}

fn negative(sid: u8, nrc: u8) -> Vec<u8> {
    vec![service_id::NEGATIVE_RESPONSE, sid, nrc]
}

fn handle_request(
    request: &[u8],
    config: &MockEcuConfig,
    state: &Arc<SyncMutex<EcuState>>,
    pending_key: &mut Option<(u8, [u8; 16])>,
) -> Option<Vec<u8>> {
    let sid = *request.first()?;
    match sid {
        service_id::DIAGNOSTIC_SESSION_CONTROL => {
            Some(positive(sid, &[request[1], 0x00, 0x19, 0x01, 0xF4]))
        }
        service_id::ECU_RESET => {
            state.lock().resets.push(request[1]);
            Some(positive(sid, &[request[1]]))
        }
        service_id::TESTER_PRESENT => Some(positive(sid, &[0x00])),
        service_id::CONTROL_DTC_SETTING => Some(positive(sid, &[request[1]])),
        service_id::SECURITY_ACCESS => {
            let sub = request[1];
            if sub % 2 == 1 {
                // seed request: remember the key this seed must produce
                let key = derive_key(sub, &config.seed).ok()?;
                *pending_key = Some((sub, key));
                let mut record = vec![sub];
                record.extend_from_slice(&config.seed);
                Some(positive(sid, &record))
            } else {
                match pending_key.take() {
                    Some((level, key))
                        if !config.reject_keys
                            && sub == level + 1
                            && request[2..] == key =>
                    {
                        state.lock().unlocked.push(level);
                        Some(positive(sid, &[sub]))
                    }
                    _ => Some(negative(sid, 0x35)), // invalidKey
                }
            }
        }
        service_id::ROUTINE_CONTROL => {
            // 31 01 <routine:2> 44 <addr:4> <len:4> [crc:2]
            if request.len() < 13 || request[1] != 0x01 {
                return Some(negative(sid, 0x13));
            }
            let routine = u16::from_be_bytes([request[2], request[3]]);
            let address = u32::from_be_bytes([request[5], request[6], request[7], request[8]]);
            let length = u32::from_be_bytes([request[9], request[10], request[11], request[12]]);
            let mut state = state.lock();
            match routine {
                0xFF00 => {
                    state.erased = Some((address, length));
                    state.received.clear();
                    Some(positive(sid, &request[1..4]))
                }
                0xFF01 => {
                    if request.len() < 15 {
                        return Some(negative(sid, 0x13));
                    }
                    let crc = u16::from_be_bytes([request[13], request[14]]);
                    let ok = state.received.len() as u32 == length
                        && TRANSFER_CRC.checksum(&state.received) == crc;
                    state.validate_ok = Some(ok);
                    if ok {
                        Some(positive(sid, &request[1..4]))
                    } else {
                        Some(negative(sid, 0x72)) // generalProgrammingFailure
                    }
                }
                _ => Some(negative(sid, 0x31)),
            }
        }
        service_id::REQUEST_DOWNLOAD => {
            // 34 <fmt> <alfid> <addr:4> <size:4>
            if request.len() < 11 {
                return Some(negative(sid, 0x13));
            }
            let address = u32::from_be_bytes([request[3], request[4], request[5], request[6]]);
            let size = u32::from_be_bytes([request[7], request[8], request[9], request[10]]);
            let mut state = state.lock();
            state.download = Some((address, size));
            state.expected_sequence = 1;
            let max = config.max_block_len.to_be_bytes();
            Some(positive(sid, &[0x20, max[0], max[1]]))
        }
        service_id::TRANSFER_DATA => {
            let sequence = request[1];
            let mut state = state.lock();
            if sequence != state.expected_sequence {
                return Some(negative(sid, 0x73)); // wrongBlockSequenceCounter
            }
            state.received.extend_from_slice(&request[2..]);
            state.expected_sequence = if sequence == 0xFF { 0x00 } else { sequence + 1 };
            Some(positive(sid, &[sequence]))
        }
        service_id::REQUEST_TRANSFER_EXIT => Some(positive(sid, &[])),
        _ => Some(negative(sid, 0x11)), // serviceNotSupported
    }
}

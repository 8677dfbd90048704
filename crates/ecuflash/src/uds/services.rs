//! UDS service layer driving the segmented transport

use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::{dtc, routine_sub_function, service_id, Dtc, NegativeResponseCode, UdsError};
use crate::config::SessionTimings;
use crate::transport::IsoTpEndpoint;

/// Upper bound on how long a response-pending exchange may stay open.
const RESPONSE_PENDING_CAP: Duration = Duration::from_secs(30);

/// Diagnostic client for one ECU endpoint.
///
/// Owns the monotonic clock of the last exchange; when a service call finds
/// the session idle for more than S3/2, a TesterPresent goes out first.
pub struct UdsClient {
    tp: IsoTpEndpoint,
    timings: SessionTimings,
    last_exchange: Instant,
}

impl UdsClient {
    pub fn new(tp: IsoTpEndpoint, timings: SessionTimings) -> Self {
        Self {
            tp,
            timings,
            last_exchange: Instant::now(),
        }
    }

    pub fn timings(&self) -> SessionTimings {
        self.timings
    }

    /// Keep-alive gate plus one request/response exchange.
    async fn service(&mut self, request: &[u8], timeout: Duration) -> Result<Vec<u8>, UdsError> {
        self.keep_alive_if_due().await;
        self.exchange(request, timeout).await
    }

    /// Send one request and return the checked positive response.
    ///
    /// A requestCorrectlyReceived-responsePending answer keeps the exchange
    /// open: the final response is awaited on the extended P2* deadline.
    async fn exchange(&mut self, request: &[u8], timeout: Duration) -> Result<Vec<u8>, UdsError> {
        let started = Instant::now();
        let mut response = self.tp.request(request, timeout).await?;
        self.last_exchange = Instant::now();
        loop {
            match response.first() {
                None => return Err(UdsError::InvalidResponse("empty response".into())),
                Some(&service_id::NEGATIVE_RESPONSE) => {
                    if response.len() < 3 {
                        return Err(UdsError::InvalidResponse(
                            "negative response too short".into(),
                        ));
                    }
                    let nrc = NegativeResponseCode::from(response[2]);
                    if nrc == NegativeResponseCode::ResponsePending
                        && started.elapsed() < RESPONSE_PENDING_CAP
                    {
                        debug!(sid = request[0], "response pending, waiting on P2*");
                        response = self.tp.receive(self.timings.p2_star()).await?;
                        self.last_exchange = Instant::now();
                        continue;
                    }
                    return Err(UdsError::NegativeResponse {
                        sid: response[1],
                        nrc,
                    });
                }
                Some(&sid) if sid == request[0].wrapping_add(0x40) => return Ok(response),
                Some(&sid) => {
                    return Err(UdsError::UnexpectedSid {
                        expected: request[0].wrapping_add(0x40),
                        got: sid,
                    })
                }
            }
        }
    }

    /// TesterPresent when the session has been idle for more than S3/2.
    /// Failure is logged and the caller's request still proceeds.
    async fn keep_alive_if_due(&mut self) {
        if self.last_exchange.elapsed() < self.timings.s3() / 2 {
            return;
        }
        let p2 = self.timings.p2();
        match self.exchange(&[service_id::TESTER_PRESENT, 0x00], p2).await {
            Ok(_) => debug!("tester present acknowledged"),
            Err(e) => warn!(error = %e, "tester present failed"),
        }
    }

    /// DiagnosticSessionControl (0x10)
    pub async fn diagnostic_session_control(&mut self, session: u8) -> Result<Vec<u8>, UdsError> {
        let p2 = self.timings.p2();
        self.service(&[service_id::DIAGNOSTIC_SESSION_CONTROL, session], p2)
            .await
    }

    /// ECUReset (0x11)
    pub async fn ecu_reset(&mut self, reset: u8) -> Result<Vec<u8>, UdsError> {
        let p2 = self.timings.p2();
        self.service(&[service_id::ECU_RESET, reset], p2).await
    }

    /// SecurityAccess (0x27) - request seed; returns the seed bytes.
    pub async fn security_access_request_seed(&mut self, level: u8) -> Result<Vec<u8>, UdsError> {
        let p2 = self.timings.p2();
        let response = self.service(&[service_id::SECURITY_ACCESS, level], p2).await?;
        if response.len() < 2 {
            return Err(UdsError::InvalidResponse("seed response too short".into()));
        }
        Ok(response[2..].to_vec())
    }

    /// SecurityAccess (0x27) - send the key at sub-function `level + 1`.
    pub async fn security_access_send_key(
        &mut self,
        level: u8,
        key: &[u8],
    ) -> Result<(), UdsError> {
        let mut request = vec![service_id::SECURITY_ACCESS, level + 1];
        request.extend_from_slice(key);
        let p2 = self.timings.p2();
        self.service(&request, p2).await?;
        Ok(())
    }

    /// TesterPresent (0x3E), zero sub-function
    pub async fn tester_present(&mut self) -> Result<(), UdsError> {
        let p2 = self.timings.p2();
        self.exchange(&[service_id::TESTER_PRESENT, 0x00], p2).await?;
        Ok(())
    }

    /// ControlDTCSetting (0x85)
    pub async fn control_dtc_setting(
        &mut self,
        setting: u8,
        record: &[u8],
    ) -> Result<(), UdsError> {
        let mut request = vec![service_id::CONTROL_DTC_SETTING, setting];
        request.extend_from_slice(record);
        let p2 = self.timings.p2();
        self.service(&request, p2).await?;
        Ok(())
    }

    /// RoutineControl (0x31) - start a routine; returns the status record.
    ///
    /// Runs on the extended deadline: erase and validate routines take far
    /// longer than P2.
    pub async fn routine_control_start(
        &mut self,
        routine: u16,
        params: &[u8],
    ) -> Result<Vec<u8>, UdsError> {
        let mut request = vec![
            service_id::ROUTINE_CONTROL,
            routine_sub_function::START_ROUTINE,
        ];
        request.extend_from_slice(&routine.to_be_bytes());
        request.extend_from_slice(params);
        let p2_star = self.timings.p2_star();
        let response = self.service(&request, p2_star).await?;
        if response.len() < 4 {
            return Err(UdsError::InvalidResponse(
                "routine response too short".into(),
            ));
        }
        Ok(response[4..].to_vec())
    }

    /// RequestDownload (0x34); returns the negotiated per-request payload
    /// capacity for TransferData.
    pub async fn request_download(
        &mut self,
        data_format: u8,
        address: u32,
        size: u32,
        addr_len: u8,
        size_len: u8,
    ) -> Result<usize, UdsError> {
        let mut request = vec![
            service_id::REQUEST_DOWNLOAD,
            data_format,
            (addr_len << 4) | size_len,
        ];
        request.extend_from_slice(&address.to_be_bytes()[4 - addr_len as usize..]);
        request.extend_from_slice(&size.to_be_bytes()[4 - size_len as usize..]);
        let p2 = self.timings.p2();
        let response = self.service(&request, p2).await?;
        chunk_capacity(&response)
    }

    /// TransferData (0x36)
    pub async fn transfer_data(&mut self, sequence: u8, data: &[u8]) -> Result<(), UdsError> {
        let mut request = Vec::with_capacity(2 + data.len());
        request.push(service_id::TRANSFER_DATA);
        request.push(sequence);
        request.extend_from_slice(data);
        let p2 = self.timings.p2();
        self.service(&request, p2).await?;
        Ok(())
    }

    /// RequestTransferExit (0x37)
    pub async fn request_transfer_exit(&mut self) -> Result<(), UdsError> {
        let p2 = self.timings.p2();
        self.service(&[service_id::REQUEST_TRANSFER_EXIT], p2).await?;
        Ok(())
    }

    /// ReadDataByIdentifier (0x22), single identifier
    pub async fn read_data_by_id(&mut self, did: u16) -> Result<Vec<u8>, UdsError> {
        let mut request = vec![service_id::READ_DATA_BY_ID];
        request.extend_from_slice(&did.to_be_bytes());
        let p2 = self.timings.p2();
        let response = self.service(&request, p2).await?;
        if response.len() < 3 {
            return Err(UdsError::InvalidResponse("read response too short".into()));
        }
        Ok(response[3..].to_vec())
    }

    /// ReadDTCInformation (0x19) - report DTCs matching a status mask
    pub async fn read_dtc_by_status_mask(&mut self, mask: u8) -> Result<Vec<Dtc>, UdsError> {
        let request = [
            service_id::READ_DTC_INFO,
            dtc::sub_function::REPORT_DTC_BY_STATUS_MASK,
            mask,
        ];
        let p2 = self.timings.p2();
        let response = self.service(&request, p2).await?;
        if response.len() < 3 {
            return Err(UdsError::InvalidResponse("DTC report too short".into()));
        }
        Ok(Dtc::parse_report(&response[3..]))
    }

    /// ClearDiagnosticInformation (0x14); `group` is a 3-byte DTC group.
    pub async fn clear_dtc(&mut self, group: u32) -> Result<(), UdsError> {
        let bytes = group.to_be_bytes();
        let request = [
            service_id::CLEAR_DIAGNOSTIC_INFO,
            bytes[1],
            bytes[2],
            bytes[3],
        ];
        let p2 = self.timings.p2();
        self.service(&request, p2).await?;
        Ok(())
    }
}

/// Derive the TransferData payload capacity from a RequestDownload response.
///
/// The high nibble of the lengthFormatIdentifier counts the bytes encoding
/// maxNumberOfBlockLength; two bytes of every block go to the SID and the
/// block sequence counter.
pub fn chunk_capacity(response: &[u8]) -> Result<usize, UdsError> {
    if response.len() < 2 {
        return Err(UdsError::InvalidResponse(
            "download response too short".into(),
        ));
    }
    let count = (response[1] >> 4) as usize;
    if count == 0 || response.len() < 2 + count {
        return Err(UdsError::InvalidResponse(
            "maxNumberOfBlockLength missing".into(),
        ));
    }
    let mut max_block_len: usize = 0;
    for &byte in &response[2..2 + count] {
        max_block_len = (max_block_len << 8) | byte as usize;
    }
    if max_block_len < 3 {
        return Err(UdsError::InvalidResponse(format!(
            "maxNumberOfBlockLength {max_block_len} leaves no payload"
        )));
    }
    Ok(max_block_len - 2)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::transport::{CanLink, ScriptedLink};

    const TX: u16 = 0x7E0;
    const RX: u16 = 0x7E8;

    fn client(link: &Arc<ScriptedLink>) -> UdsClient {
        let tp = IsoTpEndpoint::new(link.clone() as Arc<dyn CanLink>, TX, RX);
        UdsClient::new(tp, SessionTimings::default())
    }

    #[tokio::test]
    async fn positive_response_passes_sid_gate() {
        let link = Arc::new(ScriptedLink::new());
        link.push_frame(RX, &[0x06, 0x50, 0x03, 0x00, 0x19, 0x01, 0xF4]);
        let mut uds = client(&link);
        let response = uds.diagnostic_session_control(0x03).await.unwrap();
        assert_eq!(response[..2], [0x50, 0x03]);
    }

    #[tokio::test]
    async fn negative_response_surfaces_nrc() {
        let link = Arc::new(ScriptedLink::new());
        link.push_frame(RX, &[0x03, 0x7F, 0x27, 0x35, 0x00, 0x00, 0x00, 0x00]);
        let mut uds = client(&link);
        let err = uds.security_access_send_key(0x03, &[0u8; 16]).await.unwrap_err();
        assert_eq!(
            err,
            UdsError::NegativeResponse {
                sid: 0x27,
                nrc: NegativeResponseCode::InvalidKey,
            }
        );
    }

    #[tokio::test]
    async fn mismatched_sid_is_rejected() {
        let link = Arc::new(ScriptedLink::new());
        link.push_frame(RX, &[0x02, 0x51, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00]);
        let mut uds = client(&link);
        let err = uds.diagnostic_session_control(0x01).await.unwrap_err();
        assert_eq!(err, UdsError::UnexpectedSid { expected: 0x50, got: 0x51 });
    }

    #[tokio::test]
    async fn response_pending_waits_for_final_answer() {
        let link = Arc::new(ScriptedLink::new());
        link.push_frame(RX, &[0x03, 0x7F, 0x31, 0x78, 0x00, 0x00, 0x00, 0x00]);
        link.push_frame(RX, &[0x05, 0x71, 0x01, 0xFF, 0x00, 0x00, 0x00, 0x00]);
        let mut uds = client(&link);
        let record = uds.routine_control_start(0xFF00, &[]).await.unwrap();
        assert_eq!(record, vec![0x00]);
    }

    #[tokio::test]
    async fn seed_is_sliced_after_sub_function() {
        let link = Arc::new(ScriptedLink::new());
        let mut response = vec![0x10, 0x12, 0x67, 0x03];
        response.extend_from_slice(&[0xAA; 4]);
        link.push_frame(RX, &response);
        let mut cf = vec![0x21];
        cf.extend_from_slice(&[0xBB; 7]);
        link.push_frame(RX, &cf);
        let mut cf2 = vec![0x22];
        cf2.extend_from_slice(&[0xCC; 7]);
        link.push_frame(RX, &cf2);
        let mut uds = client(&link);
        let seed = uds.security_access_request_seed(0x03).await.unwrap();
        assert_eq!(seed.len(), 16);
        assert_eq!(&seed[..4], &[0xAA; 4]);
    }

    #[tokio::test]
    async fn keep_alive_precedes_service_when_idle() {
        let link = Arc::new(ScriptedLink::new());
        // tester present ack, then the real response
        link.push_frame(RX, &[0x02, 0x7E, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
        link.push_frame(RX, &[0x02, 0x50, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00]);
        let timings = SessionTimings { s3_ms: 0, ..SessionTimings::default() };
        let tp = IsoTpEndpoint::new(link.clone() as Arc<dyn CanLink>, TX, RX);
        let mut uds = UdsClient::new(tp, timings);
        uds.diagnostic_session_control(0x01).await.unwrap();

        let sent = link.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(&sent[0].data()[..3], &[0x02, 0x3E, 0x00]);
        assert_eq!(&sent[1].data()[..3], &[0x02, 0x10, 0x01]);
    }

    #[tokio::test]
    async fn keep_alive_failure_does_not_block_request() {
        let link = Arc::new(ScriptedLink::new());
        // no tester present ack queued: it times out, request still runs
        link.push_frame(RX, &[0x03, 0x7F, 0x3E, 0x11, 0x00, 0x00, 0x00, 0x00]);
        link.push_frame(RX, &[0x02, 0x50, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00]);
        let timings = SessionTimings { s3_ms: 0, ..SessionTimings::default() };
        let tp = IsoTpEndpoint::new(link.clone() as Arc<dyn CanLink>, TX, RX);
        let mut uds = UdsClient::new(tp, timings);
        uds.diagnostic_session_control(0x01).await.unwrap();
    }

    #[tokio::test]
    async fn request_download_negotiates_capacity() {
        let link = Arc::new(ScriptedLink::new());
        // the 11-byte request is multi-frame: clear it, then answer
        link.push_frame(RX, &[0x30, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
        link.push_frame(RX, &[0x04, 0x74, 0x20, 0x00, 0x82, 0x00, 0x00, 0x00]);
        let mut uds = client(&link);
        let capacity = uds
            .request_download(0x00, 0xFF1E_0000, 25_014, 4, 4)
            .await
            .unwrap();
        assert_eq!(capacity, 0x82 - 2);

        // the request on the wire: 34 00 44 FF1E0000 000061B6 (11 bytes)
        let sent = link.sent();
        assert_eq!(
            sent[0].data(),
            &[0x10, 0x0B, 0x34, 0x00, 0x44, 0xFF, 0x1E, 0x00]
        );
        assert_eq!(
            sent[1].data(),
            &[0x21, 0x00, 0x00, 0x00, 0x61, 0xB6, 0x00, 0x00]
        );
    }

    #[test]
    fn chunk_capacity_rejects_degenerate_lengths() {
        assert!(chunk_capacity(&[0x74]).is_err());
        // high nibble zero: no maxNumberOfBlockLength bytes follow
        assert!(chunk_capacity(&[0x74, 0x00]).is_err());
        // declared two bytes but only one present
        assert!(chunk_capacity(&[0x74, 0x20, 0x01]).is_err());
        // too small to carry SID + sequence counter
        assert!(chunk_capacity(&[0x74, 0x10, 0x02]).is_err());
        assert_eq!(chunk_capacity(&[0x74, 0x10, 0x82]).unwrap(), 0x80);
        assert_eq!(chunk_capacity(&[0x74, 0x20, 0x01, 0x00]).unwrap(), 0xFE);
    }
}

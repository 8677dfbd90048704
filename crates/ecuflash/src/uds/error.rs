//! UDS protocol errors

use thiserror::Error;

use super::NegativeResponseCode;
use crate::transport::TransportError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UdsError {
    #[error("service 0x{sid:02X} rejected: {nrc}")]
    NegativeResponse {
        sid: u8,
        nrc: NegativeResponseCode,
    },

    #[error("unexpected response SID: expected 0x{expected:02X}, got 0x{got:02X}")]
    UnexpectedSid { expected: u8, got: u8 },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

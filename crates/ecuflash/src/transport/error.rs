//! Transport layer errors

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("CAN bus error: {0}")]
    Bus(String),

    #[error("no matching frame within deadline")]
    Timeout,

    #[error("flow control requested wait, not supported by this client")]
    Wait,

    #[error("flow control reported overflow, receiver buffer too small")]
    Overflow,

    #[error("flow control invalid or missing: {0}")]
    FlowControl(String),

    #[error("consecutive frame out of order: expected {expected}, got {got}")]
    SequenceMismatch { expected: u8, got: u8 },

    #[error("payload of {0} bytes exceeds the 4095-byte transport limit")]
    PayloadTooLarge(usize),

    #[error("malformed frame: {0}")]
    InvalidFrame(String),

    #[error("transport not supported: {0}")]
    Unsupported(String),
}

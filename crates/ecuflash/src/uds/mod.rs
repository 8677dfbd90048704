//! ISO 14229 diagnostic client
//!
//! A thin request/response layer over the segmented transport: one method
//! per diagnostic service, positive-SID checking, negative-response
//! surfacing, and the tester-present keep-alive.

pub mod dtc;
mod error;
mod nrc;
mod services;

pub use dtc::Dtc;
pub use error::UdsError;
pub use nrc::NegativeResponseCode;
pub use services::{chunk_capacity, UdsClient};

/// Standard UDS service ID constants
pub mod service_id {
    pub const DIAGNOSTIC_SESSION_CONTROL: u8 = 0x10;
    pub const ECU_RESET: u8 = 0x11;
    pub const CLEAR_DIAGNOSTIC_INFO: u8 = 0x14;
    pub const READ_DTC_INFO: u8 = 0x19;
    pub const READ_DATA_BY_ID: u8 = 0x22;
    pub const SECURITY_ACCESS: u8 = 0x27;
    pub const ROUTINE_CONTROL: u8 = 0x31;
    pub const REQUEST_DOWNLOAD: u8 = 0x34;
    pub const TRANSFER_DATA: u8 = 0x36;
    pub const REQUEST_TRANSFER_EXIT: u8 = 0x37;
    pub const TESTER_PRESENT: u8 = 0x3E;
    pub const CONTROL_DTC_SETTING: u8 = 0x85;
    pub const NEGATIVE_RESPONSE: u8 = 0x7F;
}

/// DiagnosticSessionControl (0x10) sub-functions
pub mod session_type {
    pub const DEFAULT: u8 = 0x01;
    pub const PROGRAMMING: u8 = 0x02;
    pub const EXTENDED: u8 = 0x03;
}

/// ECUReset (0x11) sub-functions
pub mod reset_type {
    /// Hard reset - complete shutdown and restart of ECU
    pub const HARD_RESET: u8 = 0x01;
    /// OEM application reset into the bootloader
    pub const APPLICATION_TO_BOOT: u8 = 0x60;
}

/// SecurityAccess (0x27) seed-request levels used by the unlock sequence.
/// The matching send-key sub-function is `level + 1`.
pub mod security_level {
    /// First unlock, performed in the extended session
    pub const EXTENDED: u8 = 0x03;
    /// Second unlock, performed in the secondary programming session
    pub const PROGRAMMING: u8 = 0x01;
}

/// RoutineControl (0x31) sub-functions
pub mod routine_sub_function {
    pub const START_ROUTINE: u8 = 0x01;
    pub const STOP_ROUTINE: u8 = 0x02;
    pub const REQUEST_ROUTINE_RESULTS: u8 = 0x03;
}

/// Bootloader routine identifiers
pub mod routine_id {
    /// Erase a flash region
    pub const ERASE: u16 = 0xFF00;
    /// Validate a programmed region against a CRC
    pub const VALIDATE: u16 = 0xFF01;
}

/// ControlDTCSetting (0x85) sub-functions
pub mod dtc_setting {
    pub const ON: u8 = 0x01;
    pub const OFF: u8 = 0x02;
}

//! ecuflash - UDS-over-CAN bootloader flash client
//!
//! Unlocks a target ECU over ISO 15765-2 / ISO 14229, erases and reprograms
//! its non-volatile memory from a Motorola S-record image, validates each
//! region against a running CRC, and resets the ECU.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                   Flasher                    │
//! │   preflash / flash_blocks / postflash        │
//! │                                              │
//! │  ┌──────────────┐      ┌──────────────────┐  │
//! │  │FirmwareImage │      │ security (AES,   │  │
//! │  │ (S-records)  │      │ transfer CRC)    │  │
//! │  └──────────────┘      └──────────────────┘  │
//! │                ┌───────────┐                 │
//! │                │ UdsClient │  services,      │
//! │                │           │  keep-alive     │
//! │                └─────┬─────┘                 │
//! │              ┌───────┴───────┐               │
//! │              │ IsoTpEndpoint │  framing,     │
//! │              │               │  flow control │
//! │              └───────┬───────┘               │
//! │                ┌─────┴─────┐                 │
//! │                │  CanLink  │  SocketCAN /    │
//! │                │           │  test bus       │
//! │                └───────────┘                 │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! One flash run owns its link exclusively and is strictly sequential: no
//! two diagnostic requests are ever in flight at once. Telemetry probes are
//! independent leaves that reuse only the link layer.

pub mod config;
pub mod error;
pub mod flash;
pub mod image;
pub mod probes;
pub mod testing;
pub mod transport;
pub mod uds;

pub use config::{ConfigError, FlashConfig, SessionTimings};
pub use error::FlashError;
pub use flash::{FlashEvent, Flasher};
pub use image::{Block, FirmwareImage, ImageError};
pub use probes::{Probe, ProbeValue};
pub use transport::{CanFrame, CanLink, IsoTpEndpoint, TransportError};
pub use uds::{NegativeResponseCode, UdsClient, UdsError};

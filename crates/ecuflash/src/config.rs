//! Flasher configuration
//!
//! Loaded from TOML; every field has a default matching the production
//! flash endpoint (500 kbit/s, tester 0x7E0, ECU 0x7E8).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::transport::link::STANDARD_ID_MAX;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid CAN ID '{0}'")]
    InvalidCanId(String),
}

/// ISO 14229 session timing parameters, in milliseconds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SessionTimings {
    /// Response wait
    #[serde(default = "default_p2_ms")]
    pub p2_ms: u64,
    /// Extended response wait (response pending, long routines)
    #[serde(default = "default_p2_star_ms")]
    pub p2_star_ms: u64,
    /// Tester-present inter-arrival ceiling in non-default sessions
    #[serde(default = "default_s3_ms")]
    pub s3_ms: u64,
}

fn default_p2_ms() -> u64 {
    500
}

fn default_p2_star_ms() -> u64 {
    5000
}

fn default_s3_ms() -> u64 {
    5000
}

impl Default for SessionTimings {
    fn default() -> Self {
        Self {
            p2_ms: default_p2_ms(),
            p2_star_ms: default_p2_star_ms(),
            s3_ms: default_s3_ms(),
        }
    }
}

impl SessionTimings {
    pub fn p2(&self) -> Duration {
        Duration::from_millis(self.p2_ms)
    }

    pub fn p2_star(&self) -> Duration {
        Duration::from_millis(self.p2_star_ms)
    }

    pub fn s3(&self) -> Duration {
        Duration::from_millis(self.s3_ms)
    }
}

/// Configuration for one flash run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlashConfig {
    /// CAN interface name (e.g. "can0")
    #[serde(default = "default_interface")]
    pub interface: String,
    /// Bus bitrate; informational, the interface must already be up
    #[serde(default = "default_bitrate")]
    pub bitrate: u32,
    /// Transmit CAN ID (tester -> ECU)
    #[serde(default = "default_tx_id")]
    pub tx_id: String,
    /// Receive CAN ID (ECU -> tester)
    #[serde(default = "default_rx_id")]
    pub rx_id: String,
    #[serde(default)]
    pub timings: SessionTimings,
    /// Frame audit log path; omitted disables the file sink
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_log: Option<PathBuf>,
}

fn default_interface() -> String {
    "can0".to_string()
}

fn default_bitrate() -> u32 {
    500_000
}

fn default_tx_id() -> String {
    "0x7E0".to_string()
}

fn default_rx_id() -> String {
    "0x7E8".to_string()
}

impl Default for FlashConfig {
    fn default() -> Self {
        Self {
            interface: default_interface(),
            bitrate: default_bitrate(),
            tx_id: default_tx_id(),
            rx_id: default_rx_id(),
            timings: SessionTimings::default(),
            frame_log: None,
        }
    }
}

impl FlashConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Parsed `(tx_id, rx_id)` endpoint pair.
    pub fn endpoint(&self) -> Result<(u16, u16), ConfigError> {
        Ok((parse_can_id(&self.tx_id)?, parse_can_id(&self.rx_id)?))
    }
}

/// Parse a standard CAN ID from decimal or 0x-prefixed hex.
pub fn parse_can_id(s: &str) -> Result<u16, ConfigError> {
    let trimmed = s.trim();
    let (digits, radix) = match trimmed.strip_prefix("0x").or_else(|| trimmed.strip_prefix("0X")) {
        Some(rest) => (rest, 16),
        None => (trimmed, 10),
    };
    let id = u16::from_str_radix(digits, radix)
        .map_err(|_| ConfigError::InvalidCanId(s.to_string()))?;
    if id > STANDARD_ID_MAX {
        return Err(ConfigError::InvalidCanId(s.to_string()));
    }
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_can_id_accepts_hex_and_decimal() {
        assert_eq!(parse_can_id("0x7E0").unwrap(), 0x7E0);
        assert_eq!(parse_can_id("0X7e8").unwrap(), 0x7E8);
        assert_eq!(parse_can_id("1952").unwrap(), 1952);
        assert!(parse_can_id("0x800").is_err());
        assert!(parse_can_id("garbage").is_err());
    }

    #[test]
    fn defaults_describe_the_flash_endpoint() {
        let config = FlashConfig::default();
        assert_eq!(config.endpoint().unwrap(), (0x7E0, 0x7E8));
        assert_eq!(config.bitrate, 500_000);
        assert_eq!(config.timings.p2(), Duration::from_millis(500));
        assert_eq!(config.timings.s3(), Duration::from_millis(5000));
    }

    #[test]
    fn loads_partial_toml_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flash.toml");
        std::fs::write(
            &path,
            "interface = \"can1\"\n\n[timings]\np2_ms = 1000\n",
        )
        .unwrap();
        let config = FlashConfig::load(&path).unwrap();
        assert_eq!(config.interface, "can1");
        assert_eq!(config.timings.p2_ms, 1000);
        assert_eq!(config.timings.s3_ms, 5000);
        assert_eq!(config.endpoint().unwrap(), (0x7E0, 0x7E8));
    }
}

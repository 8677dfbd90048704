//! Passive CAN telemetry probes
//!
//! Each probe opens the bus filtered to its own arbitration IDs, listens
//! for at most one second, and decodes a single value from the first
//! matching frame. Probes share nothing with the flash pipeline beyond the
//! CAN link.

use std::fmt;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::transport::{CanLink, TransportError};

/// Listen window for a single probe.
pub const PROBE_WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq)]
pub enum ProbeValue {
    /// The node is transmitting on one of its known IDs.
    Present,
    Scalar { value: f64, unit: &'static str },
    Version(String),
}

impl fmt::Display for ProbeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeValue::Present => f.write_str("present"),
            ProbeValue::Scalar { value, unit } => write!(f, "{value} {unit}"),
            ProbeValue::Version(version) => f.write_str(version),
        }
    }
}

/// Catalogue of read-only telemetry probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    BatteryPresence,
    BatterySoc,
    BatteryVoltage,
    BatteryVersion,
    MinCellTemp,
    CellImbalance,
    McuPresence,
    McuVersion,
    ClusterPresence,
    ClusterVersion,
    TelematicsPresence,
    TelematicsVersion,
    VcuPresence,
}

impl Probe {
    pub const ALL: &'static [Probe] = &[
        Probe::BatteryPresence,
        Probe::BatterySoc,
        Probe::BatteryVoltage,
        Probe::BatteryVersion,
        Probe::MinCellTemp,
        Probe::CellImbalance,
        Probe::McuPresence,
        Probe::McuVersion,
        Probe::ClusterPresence,
        Probe::ClusterVersion,
        Probe::TelematicsPresence,
        Probe::TelematicsVersion,
        Probe::VcuPresence,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Probe::BatteryPresence => "battery-presence",
            Probe::BatterySoc => "battery-soc",
            Probe::BatteryVoltage => "battery-voltage",
            Probe::BatteryVersion => "battery-version",
            Probe::MinCellTemp => "min-cell-temp",
            Probe::CellImbalance => "cell-imbalance",
            Probe::McuPresence => "mcu-presence",
            Probe::McuVersion => "mcu-version",
            Probe::ClusterPresence => "cluster-presence",
            Probe::ClusterVersion => "cluster-version",
            Probe::TelematicsPresence => "telematics-presence",
            Probe::TelematicsVersion => "telematics-version",
            Probe::VcuPresence => "vcu-presence",
        }
    }

    pub fn from_name(name: &str) -> Option<Probe> {
        Probe::ALL.iter().copied().find(|probe| probe.name() == name)
    }

    /// Arbitration IDs this probe listens on.
    pub fn ids(&self) -> &'static [u16] {
        match self {
            Probe::BatteryPresence => &[0x28, 0x2D, 0x2F, 0x22, 0x27, 0x23, 0x26, 0x2E],
            Probe::BatterySoc => &[0x775],
            Probe::BatteryVoltage => &[0x22],
            Probe::BatteryVersion => &[0x23],
            Probe::MinCellTemp => &[0x26],
            Probe::CellImbalance => &[0x28],
            Probe::McuPresence => &[
                0xA0, 0xC8, 0x15, 0xB0, 0xAF, 0xAB, 0xB7, 0xCA, 0x668, 0xCB, 0xC7,
            ],
            Probe::McuVersion => &[0xC7],
            Probe::ClusterPresence => &[0x77A],
            Probe::ClusterVersion => &[0x77C],
            Probe::TelematicsPresence => &[0x701, 0x702, 0x703],
            Probe::TelematicsVersion => &[0x702],
            Probe::VcuPresence => &[0x7C5, 0x669],
        }
    }

    /// Receive filter rules for this probe's IDs.
    pub fn filters(&self) -> Vec<(u16, u16)> {
        self.ids().iter().map(|&id| (id, 0x7FF)).collect()
    }

    /// Decode the probe value from a matching frame's data bytes.
    pub fn decode(&self, data: &[u8]) -> Option<ProbeValue> {
        match self {
            Probe::BatteryPresence
            | Probe::McuPresence
            | Probe::ClusterPresence
            | Probe::TelematicsPresence
            | Probe::VcuPresence => Some(ProbeValue::Present),
            Probe::BatterySoc => Some(ProbeValue::Scalar {
                value: *data.get(3)? as f64,
                unit: "%",
            }),
            Probe::BatteryVoltage => {
                // 10-bit field: the low 2 bits of byte 2, all 8 of byte 3
                let raw = ((*data.get(2)? & 0x03) as u16) << 8 | *data.get(3)? as u16;
                Some(ProbeValue::Scalar { value: raw as f64 * 0.1, unit: "V" })
            }
            Probe::BatteryVersion => Some(ProbeValue::Version(format!(
                "{}.{}.{}",
                data.get(2)?,
                data.get(1)?,
                data.get(3)?
            ))),
            Probe::MinCellTemp => Some(ProbeValue::Scalar {
                value: *data.get(1)? as f64,
                unit: "degC",
            }),
            Probe::CellImbalance => {
                let raw = u16::from_be_bytes([*data.get(6)?, *data.get(7)?]);
                Some(ProbeValue::Scalar { value: raw as f64 * 0.01, unit: "V" })
            }
            Probe::McuVersion => Some(ProbeValue::Version(format!(
                "{}.{}.{}",
                data.first()?,
                data.get(1)?,
                data.get(2)?
            ))),
            Probe::ClusterVersion => Some(ProbeValue::Version(format!(
                "{}.{}.{}",
                data.get(3)?,
                data.get(4)?,
                data.get(5)?
            ))),
            Probe::TelematicsVersion => Some(ProbeValue::Version(format!(
                "{}.{}.{}",
                data.get(4)?,
                data.get(5)?,
                data.get(6)?
            ))),
        }
    }

    /// Run the probe: the first matching frame inside the window wins;
    /// `None` when nothing showed up.
    pub async fn run(&self, link: &dyn CanLink) -> Result<Option<ProbeValue>, TransportError> {
        let deadline = Instant::now() + PROBE_WINDOW;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            match link.recv(remaining).await? {
                Some(frame) if self.ids().contains(&frame.id()) => {
                    debug!(probe = self.name(), frame = ?frame, "probe frame");
                    return Ok(self.decode(frame.data()));
                }
                Some(_) => continue,
                None => return Ok(None),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ScriptedLink;

    #[test]
    fn battery_voltage_scales_by_tenths() {
        let value = Probe::BatteryVoltage
            .decode(&[0x00, 0x00, 0x02, 0x08, 0, 0, 0, 0])
            .unwrap();
        assert_eq!(value, ProbeValue::Scalar { value: 52.0, unit: "V" });
    }

    #[test]
    fn battery_voltage_keeps_only_ten_bits() {
        // the top 6 bits of byte 2 are not part of the voltage field
        let decoded = Probe::BatteryVoltage
            .decode(&[0x00, 0x00, 0xFF, 0x00, 0, 0, 0, 0])
            .unwrap();
        let ProbeValue::Scalar { value, unit } = decoded else {
            panic!("expected a scalar, got {decoded:?}");
        };
        assert_eq!(unit, "V");
        assert!((value - 76.8).abs() < 1e-9, "got {value}");
    }

    #[test]
    fn cell_imbalance_scales_by_hundredths() {
        let value = Probe::CellImbalance
            .decode(&[0, 0, 0, 0, 0, 0, 0x00, 0x19])
            .unwrap();
        assert_eq!(value, ProbeValue::Scalar { value: 0.25, unit: "V" });
    }

    #[test]
    fn version_probes_pick_their_bytes() {
        assert_eq!(
            Probe::McuVersion.decode(&[2, 1, 9, 0, 0, 0, 0, 0]),
            Some(ProbeValue::Version("2.1.9".into()))
        );
        // battery version is ordered major=b2, minor=b1, revision=b3
        assert_eq!(
            Probe::BatteryVersion.decode(&[0, 4, 7, 1, 0, 0, 0, 0]),
            Some(ProbeValue::Version("7.4.1".into()))
        );
        assert_eq!(
            Probe::TelematicsVersion.decode(&[0, 0, 0, 0, 3, 2, 8, 0]),
            Some(ProbeValue::Version("3.2.8".into()))
        );
    }

    #[test]
    fn short_frame_decodes_to_nothing() {
        assert_eq!(Probe::BatterySoc.decode(&[0x01]), None);
    }

    #[test]
    fn names_round_trip() {
        for &probe in Probe::ALL {
            assert_eq!(Probe::from_name(probe.name()), Some(probe));
        }
        assert_eq!(Probe::from_name("nonsense"), None);
    }

    #[tokio::test]
    async fn run_matches_only_listed_ids() {
        let link = ScriptedLink::new();
        link.push_frame(0x123, &[0xFF; 8]);
        link.push_frame(0x775, &[0, 0, 0, 87, 0, 0, 0, 0]);
        let value = Probe::BatterySoc.run(&link).await.unwrap();
        assert_eq!(value, Some(ProbeValue::Scalar { value: 87.0, unit: "%" }));
    }

    #[tokio::test]
    async fn run_reports_absence() {
        let link = ScriptedLink::new();
        let value = Probe::VcuPresence.run(&link).await.unwrap();
        assert_eq!(value, None);
    }
}

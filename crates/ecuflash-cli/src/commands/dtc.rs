//! DTC command - read or clear MCU trouble codes

use anyhow::Result;

use ecuflash::transport::open_link;
use ecuflash::uds::session_type;
use ecuflash::{FlashConfig, IsoTpEndpoint, UdsClient};

/// The motor controller answers diagnostics on its own endpoint pair.
const MCU_TX_ID: u16 = 0x7E1;
const MCU_RX_ID: u16 = 0x7E9;

/// All DTC groups, for ClearDiagnosticInformation.
const ALL_GROUPS: u32 = 0xFF_FFFF;

pub async fn run(config: &FlashConfig, clear: bool) -> Result<()> {
    let link = open_link(
        &config.interface,
        &[(MCU_RX_ID, 0x7FF)],
        Some(super::frame_sink(config)),
    )?;
    let tp = IsoTpEndpoint::new(link, MCU_TX_ID, MCU_RX_ID);
    let mut uds = UdsClient::new(tp, config.timings);

    if clear {
        uds.clear_dtc(ALL_GROUPS).await?;
        println!("DTCs cleared");
        return Ok(());
    }

    uds.diagnostic_session_control(session_type::EXTENDED).await?;
    let dtcs = uds.read_dtc_by_status_mask(0x8F).await?;
    if dtcs.is_empty() {
        println!("no stored DTCs");
        return Ok(());
    }
    for dtc in dtcs {
        println!("{}  status=0x{:02X}", dtc.code(), dtc.status);
    }
    Ok(())
}

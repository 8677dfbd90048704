//! CLI subcommands

pub mod blocks;
pub mod dtc;
pub mod flash;
pub mod postflash;
pub mod preflash;
pub mod probe;

use std::sync::Arc;

use anyhow::Result;

use ecuflash::transport::{open_link, FrameLog, FrameSink, TraceSink};
use ecuflash::{FlashConfig, Flasher, IsoTpEndpoint, UdsClient};

/// File sink when the config names an audit log, tracing sink otherwise.
pub(crate) fn frame_sink(config: &FlashConfig) -> Arc<dyn FrameSink> {
    match &config.frame_log {
        Some(path) => Arc::new(FrameLog::new(path.clone())),
        None => Arc::new(TraceSink),
    }
}

/// Open the flash endpoint and assemble the full stack on top of it.
pub(crate) fn build_flasher(config: &FlashConfig) -> Result<Flasher> {
    let (tx_id, rx_id) = config.endpoint()?;
    let link = open_link(&config.interface, &[(rx_id, 0x7FF)], Some(frame_sink(config)))?;
    let tp = IsoTpEndpoint::new(link, tx_id, rx_id);
    Ok(Flasher::new(UdsClient::new(tp, config.timings)))
}

//! Probe command - one-shot telemetry reads

use anyhow::{anyhow, bail, Result};

use ecuflash::transport::open_link;
use ecuflash::{FlashConfig, Probe};

pub async fn run(config: &FlashConfig, name: Option<&str>, list: bool) -> Result<()> {
    if list {
        for probe in Probe::ALL {
            println!("{}", probe.name());
        }
        return Ok(());
    }

    let name = name.expect("clap guarantees a name unless --list");
    let probe = Probe::from_name(name).ok_or_else(|| {
        let known: Vec<&str> = Probe::ALL.iter().map(|p| p.name()).collect();
        anyhow!("unknown probe '{name}', expected one of: {}", known.join(", "))
    })?;

    let link = open_link(
        &config.interface,
        &probe.filters(),
        Some(super::frame_sink(config)),
    )?;
    match probe.run(link.as_ref()).await? {
        Some(value) => {
            println!("{}: {value}", probe.name());
            println!("Status: Passed");
            Ok(())
        }
        None => {
            println!("{}: not detected", probe.name());
            println!("Status: Failed");
            bail!("no frame within the probe window")
        }
    }
}

//! Postflash command - finalize one region

use anyhow::Result;

use ecuflash::FlashConfig;

pub async fn run(config: &FlashConfig, address: u32, length: u32, crc: u16) -> Result<()> {
    let mut flasher = super::build_flasher(config)?;
    flasher.postflash(address, length, crc).await?;
    println!("region 0x{address:08X}+{length} validated against crc 0x{crc:04X}");
    Ok(())
}

//! Blocks command - inspect an image offline

use std::path::Path;

use anyhow::{Context, Result};

use ecuflash::FirmwareImage;

pub fn run(image_path: &Path) -> Result<()> {
    let image = FirmwareImage::from_file(image_path)
        .with_context(|| format!("decoding {}", image_path.display()))?;
    for (index, block) in image.blocks().iter().enumerate() {
        println!("block {index}: 0x{:08X} +{} bytes", block.start, block.len);
    }
    println!("{} bytes in {} block(s)", image.len(), image.blocks().len());
    Ok(())
}

//! Flash command - full firmware programming run

use std::cell::Cell;
use std::path::Path;
use std::sync::atomic::Ordering;

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

use ecuflash::{FirmwareImage, FlashConfig, FlashEvent};

pub async fn run(config: &FlashConfig, image_path: &Path) -> Result<()> {
    let image = FirmwareImage::from_file(image_path)
        .with_context(|| format!("decoding {}", image_path.display()))?;
    info!(
        blocks = image.blocks().len(),
        bytes = image.len(),
        "image decoded"
    );

    let bar = ProgressBar::new(image.len() as u64);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}")
            .unwrap()
            .progress_chars("=>-"),
    );

    let progress_bar = bar.clone();
    // (block, bytes reported for it) so cumulative chunk events turn into
    // bar increments
    let last = Cell::new((0usize, 0u64));
    let mut flasher = super::build_flasher(config)?.with_progress(move |event| match event {
        FlashEvent::StepCompleted { step } => progress_bar.set_message(step.to_string()),
        FlashEvent::BlockStarted { block, address, .. } => {
            last.set((*block, 0));
            progress_bar.set_message(format!("block {} @ 0x{address:08X}", block + 1));
        }
        FlashEvent::ChunkSent { block, sent, .. } => {
            let (prev_block, prev_sent) = last.get();
            let delta = if prev_block == *block { sent - prev_sent } else { *sent };
            progress_bar.inc(delta);
            last.set((*block, *sent));
        }
        FlashEvent::BlockValidated { block, crc } => {
            progress_bar.set_message(format!("block {} validated, crc 0x{crc:04X}", block + 1));
        }
    });

    let cancel = flasher.cancel_flag();
    ctrlc::set_handler(move || cancel.store(true, Ordering::SeqCst))
        .context("installing ctrl-c handler")?;

    flasher.preflash().await?;
    flasher.flash_blocks(&image).await?;

    bar.finish_with_message("complete");
    info!("firmware update completed");
    Ok(())
}

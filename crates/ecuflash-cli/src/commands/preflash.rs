//! Preflash command - session unlock only

use anyhow::Result;

use ecuflash::{FlashConfig, FlashEvent};

pub async fn run(config: &FlashConfig) -> Result<()> {
    let mut flasher = super::build_flasher(config)?.with_progress(|event| {
        if let FlashEvent::StepCompleted { step } = event {
            println!("[OK] {step}");
        }
    });
    flasher.preflash().await?;
    println!("preflash successful");
    Ok(())
}

//! Flash pipeline: session unlock, block programming, validation
//!
//! Composes the diagnostic client and the image decoder into the full
//! programming sequence: the preflash unlock, then per block
//! Erase -> RequestDownload -> TransferData* -> RequestTransferExit ->
//! Validate, with a running CRC over the bytes in transmit order.

mod security;

pub use security::{derive_key, TRANSFER_CRC};

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info};

use crate::error::FlashError;
use crate::image::{Block, FirmwareImage};
use crate::uds::{dtc_setting, reset_type, routine_id, security_level, session_type, UdsClient};

/// Progress notifications, emitted synchronously on the transfer path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlashEvent {
    /// A preflash or postflash step finished.
    StepCompleted { step: &'static str },
    BlockStarted {
        block: usize,
        address: u32,
        length: u32,
        chunks: u64,
    },
    ChunkSent {
        block: usize,
        sent: u64,
        total: u64,
    },
    BlockValidated { block: usize, crc: u16 },
}

type ProgressFn = dyn Fn(&FlashEvent) + Send;

/// Drives one complete flash run over an exclusively owned endpoint.
///
/// The underlying CAN link is released when the flasher is dropped, on every
/// exit path.
pub struct Flasher {
    uds: UdsClient,
    progress: Option<Box<ProgressFn>>,
    cancel: Arc<AtomicBool>,
}

impl Flasher {
    pub fn new(uds: UdsClient) -> Self {
        Self {
            uds,
            progress: None,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Register a synchronous progress callback. It runs between transfer
    /// chunks and must return promptly.
    pub fn with_progress(mut self, progress: impl Fn(&FlashEvent) + Send + 'static) -> Self {
        self.progress = Some(Box::new(progress));
        self
    }

    /// Cooperative cancellation flag, checked between chunks.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    fn emit(&self, event: FlashEvent) {
        if let Some(callback) = &self.progress {
            callback(&event);
        }
    }

    /// Drive the ECU from the default session into the unlocked secondary
    /// programming session and reset it into the bootloader.
    pub async fn preflash(&mut self) -> Result<(), FlashError> {
        self.uds
            .diagnostic_session_control(session_type::DEFAULT)
            .await?;
        self.emit(FlashEvent::StepCompleted { step: "default session" });

        self.uds
            .diagnostic_session_control(session_type::EXTENDED)
            .await?;
        self.emit(FlashEvent::StepCompleted { step: "extended session" });

        self.unlock(security_level::EXTENDED).await?;

        self.uds.control_dtc_setting(dtc_setting::OFF, &[]).await?;
        self.emit(FlashEvent::StepCompleted { step: "dtc logging off" });

        self.uds
            .diagnostic_session_control(session_type::DEFAULT)
            .await?;
        self.uds
            .diagnostic_session_control(session_type::PROGRAMMING)
            .await?;
        self.emit(FlashEvent::StepCompleted { step: "programming session" });

        self.unlock(security_level::PROGRAMMING).await?;

        self.uds.ecu_reset(reset_type::APPLICATION_TO_BOOT).await?;
        self.emit(FlashEvent::StepCompleted { step: "reset to bootloader" });

        info!("preflash complete");
        Ok(())
    }

    /// Seed/key handshake for one security level.
    async fn unlock(&mut self, level: u8) -> Result<(), FlashError> {
        let seed = self.uds.security_access_request_seed(level).await?;
        let key = security::derive_key(level, &seed)?;
        self.uds.security_access_send_key(level, &key).await?;
        debug!(level, "security access granted");
        self.emit(FlashEvent::StepCompleted {
            step: match level {
                security_level::EXTENDED => "security level 3 unlocked",
                _ => "security level 1 unlocked",
            },
        });
        Ok(())
    }

    /// Program every contiguous block of `image`, in address order.
    pub async fn flash_blocks(&mut self, image: &FirmwareImage) -> Result<(), FlashError> {
        for (index, &block) in image.blocks().iter().enumerate() {
            self.flash_block(image, index, block).await?;
        }
        Ok(())
    }

    /// Erase, download, stream, and validate one block. Returns the running
    /// checksum the ECU verified.
    pub async fn flash_block(
        &mut self,
        image: &FirmwareImage,
        index: usize,
        block: Block,
    ) -> Result<u16, FlashError> {
        info!(
            index,
            address = format_args!("0x{:08X}", block.start),
            length = block.len,
            "flashing block"
        );

        let mut region = vec![0x44];
        region.extend_from_slice(&block.start.to_be_bytes());
        region.extend_from_slice(&block.len.to_be_bytes());
        self.uds
            .routine_control_start(routine_id::ERASE, &region)
            .await?;

        let capacity = self
            .uds
            .request_download(0x00, block.start, block.len, 4, 4)
            .await?;
        let chunks = (block.len as u64).div_ceil(capacity as u64);
        self.emit(FlashEvent::BlockStarted {
            block: index,
            address: block.start,
            length: block.len,
            chunks,
        });

        let mut digest = TRANSFER_CRC.digest();
        let mut sequence: u8 = 1;
        let mut sent: u64 = 0;
        for chunk in image.chunks(block, capacity) {
            if self.cancel.load(Ordering::SeqCst) {
                return Err(FlashError::Cancelled);
            }
            digest.update(&chunk);
            self.uds.transfer_data(sequence, &chunk).await?;
            sent += chunk.len() as u64;
            self.emit(FlashEvent::ChunkSent {
                block: index,
                sent,
                total: block.len as u64,
            });
            // The block sequence counter wraps to 0x00, not to 0x01.
            sequence = if sequence == 0xFF { 0x00 } else { sequence + 1 };
        }
        let crc = digest.finalize();

        self.uds.request_transfer_exit().await?;

        let mut validate = region;
        validate.extend_from_slice(&crc.to_be_bytes());
        self.uds
            .routine_control_start(routine_id::VALIDATE, &validate)
            .await?;
        self.emit(FlashEvent::BlockValidated { block: index, crc });
        info!(index, crc = format_args!("0x{crc:04X}"), "block validated");
        Ok(crc)
    }

    /// Standalone transfer-exit plus validation of a region the orchestrator
    /// streamed itself.
    pub async fn postflash(
        &mut self,
        address: u32,
        length: u32,
        crc: u16,
    ) -> Result<(), FlashError> {
        self.uds.request_transfer_exit().await?;
        self.emit(FlashEvent::StepCompleted { step: "transfer exit" });

        let mut params = vec![0x44];
        params.extend_from_slice(&address.to_be_bytes());
        params.extend_from_slice(&length.to_be_bytes());
        params.extend_from_slice(&crc.to_be_bytes());
        self.uds
            .routine_control_start(routine_id::VALIDATE, &params)
            .await?;
        self.emit(FlashEvent::StepCompleted { step: "validate" });
        Ok(())
    }

    /// Full run: decode the image, unlock the ECU, program every block.
    pub async fn flash_image(&mut self, path: &Path) -> Result<(), FlashError> {
        let image = FirmwareImage::from_file(path)?;
        info!(
            blocks = image.blocks().len(),
            bytes = image.len(),
            "image decoded"
        );
        self.preflash().await?;
        self.flash_blocks(&image).await
    }
}

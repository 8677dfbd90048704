//! Top of the error tower

use thiserror::Error;

use crate::image::ImageError;
use crate::transport::TransportError;
use crate::uds::UdsError;

/// Any failure that aborts a flash run.
#[derive(Debug, Error)]
pub enum FlashError {
    #[error(transparent)]
    Uds(#[from] UdsError),

    #[error(transparent)]
    Image(#[from] ImageError),

    #[error("flash run cancelled")]
    Cancelled,

    #[error("key derivation failed: {0}")]
    KeyDerivation(String),
}

impl From<TransportError> for FlashError {
    fn from(e: TransportError) -> Self {
        FlashError::Uds(UdsError::Transport(e))
    }
}

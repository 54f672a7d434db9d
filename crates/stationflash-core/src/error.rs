use thiserror::Error;

use crate::assets::LoadError;
use crate::catalog::FetchError;
use crate::device::{AcquisitionError, DeviceError};
use crate::loader::LoaderError;
use crate::status::FlashStage;

/// The ROM handshake failed or timed out.
#[derive(Error, Debug)]
#[error("Failed to connect to chip: {0}")]
pub struct HandshakeError(#[source] pub LoaderError);

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("Flash write failed: {0}")]
    Write(#[source] LoaderError),

    #[error("Failed to reset device: {0}")]
    Reset(#[source] LoaderError),
}

/// A release step failed. Cleanup logs these and never propagates them.
#[derive(Error, Debug)]
pub enum CleanupError {
    #[error("Failed to close loader transport: {0}")]
    Transport(#[source] LoaderError),

    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// Any failure of a flash session.
#[derive(Error, Debug)]
pub enum FlashError {
    #[error("A flash session is already running ({0})")]
    Busy(FlashStage),

    #[error(transparent)]
    Acquisition(#[from] AcquisitionError),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    #[error(transparent)]
    Transfer(#[from] TransferError),
}

impl FlashError {
    /// Whether the user backed out rather than something failing.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, FlashError::Acquisition(AcquisitionError::UserCancelled))
    }
}

//! Serial loader abstraction.
//!
//! Defines the `SerialLoader` trait: the contract of the external library
//! that speaks the ROM bootloader protocol. The orchestrator only drives it;
//! framing, stub upload and chip detection live behind this seam.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::assets::{FlashImage, TransferEncoding};
use crate::device::{DeviceHandle, Open, SerialDevice};

#[derive(Error, Debug)]
pub enum LoaderError {
    #[error("Serial I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Device did not respond within {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Device disconnected")]
    Disconnected,
}

/// Chip identity reported by the ROM handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChipInfo {
    pub chip: String,
    pub mac_address: Option<String>,
    pub features: Vec<String>,
}

impl fmt::Display for ChipInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.chip)?;
        if let Some(mac) = &self.mac_address {
            write!(f, " [{mac}]")?;
        }
        if !self.features.is_empty() {
            write!(f, " ({})", self.features.join(", "))?;
        }
        Ok(())
    }
}

/// Options for the multi-image write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteOptions {
    pub erase_all: bool,
    pub compress: bool,
    pub flash_mode: String,
    pub flash_freq: String,
    /// "keep" leaves the size field of the bootloader header untouched.
    pub flash_size: String,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            erase_all: false,
            compress: true,
            flash_mode: "dio".to_string(),
            flash_freq: "40m".to_string(),
            flash_size: "keep".to_string(),
        }
    }
}

/// One progress report from the loader during `write_images`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteProgress {
    /// Index into the image list.
    pub file_index: usize,
    /// Bytes of this image written so far.
    pub written: u64,
    /// Total bytes of this image.
    pub total: u64,
}

pub type ProgressSender = mpsc::UnboundedSender<WriteProgress>;

/// Abstract serial loader interface.
///
/// This trait enables:
/// - Production implementation on top of espflash (feature `espflash`)
/// - Mock implementation for unit testing
#[async_trait]
pub trait SerialLoader: Send + Sync {
    type Device: SerialDevice;
    type Transport: Send;

    /// Encoding `write_images` expects image data in.
    fn encoding(&self) -> TransferEncoding {
        TransferEncoding::Raw
    }

    /// Build the loader's channel over an open device.
    async fn open_transport(
        &self,
        device: &mut DeviceHandle<Self::Device, Open>,
        baud_rate: u32,
    ) -> Result<Self::Transport, LoaderError>;

    /// Sync with the ROM bootloader and identify the chip.
    async fn handshake(&self, transport: &mut Self::Transport) -> Result<ChipInfo, LoaderError>;

    /// Write all images in order, reporting progress on `progress`.
    ///
    /// The sender must not outlive the call; the session stops draining
    /// progress once every sender is dropped.
    async fn write_images(
        &self,
        transport: &mut Self::Transport,
        images: &[FlashImage],
        options: &WriteOptions,
        progress: ProgressSender,
    ) -> Result<(), LoaderError>;

    /// Drive the chip reset line (DTR on USB-serial bridges).
    async fn set_reset_line(
        &self,
        transport: &mut Self::Transport,
        asserted: bool,
    ) -> Result<(), LoaderError>;

    /// Tear the channel down.
    async fn close_transport(&self, transport: Self::Transport) -> Result<(), LoaderError>;
}

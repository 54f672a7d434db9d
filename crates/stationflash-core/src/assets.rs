//! Firmware image download and transfer preparation.
//!
//! A version always consists of three images written at fixed offsets of
//! the ESP32 memory map:
//!
//! | Image           | Offset    |
//! |-----------------|-----------|
//! | bootloader      | `0x1000`  |
//! | partition table | `0x8000`  |
//! | application     | `0x10000` |

use std::fmt;

use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, info, instrument};
use url::Url;

use crate::catalog::FirmwareVersion;
use crate::http::HttpFetch;

pub const BOOTLOADER_ADDRESS: u32 = 0x1000;
pub const PARTITION_TABLE_ADDRESS: u32 = 0x8000;
pub const APPLICATION_ADDRESS: u32 = 0x10000;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    #[error("Failed to download firmware files: {asset}: {reason}")]
    PartialFetch { asset: AssetKind, reason: String },
}

/// The three images of a firmware version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssetKind {
    Bootloader,
    PartitionTable,
    Application,
}

impl AssetKind {
    /// Write order.
    pub const ALL: [AssetKind; 3] = [
        AssetKind::Bootloader,
        AssetKind::PartitionTable,
        AssetKind::Application,
    ];

    pub fn flash_address(self) -> u32 {
        match self {
            AssetKind::Bootloader => BOOTLOADER_ADDRESS,
            AssetKind::PartitionTable => PARTITION_TABLE_ADDRESS,
            AssetKind::Application => APPLICATION_ADDRESS,
        }
    }

    /// Short name used in manifests and downloaded file names.
    pub fn file_stem(self) -> &'static str {
        match self {
            AssetKind::Bootloader => "bootloader",
            AssetKind::PartitionTable => "partitions",
            AssetKind::Application => "firmware",
        }
    }
}

impl fmt::Display for AssetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssetKind::Bootloader => write!(f, "bootloader"),
            AssetKind::PartitionTable => write!(f, "partition table"),
            AssetKind::Application => write!(f, "application image"),
        }
    }
}

/// One downloaded image paired with its flash offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareAsset {
    pub kind: AssetKind,
    pub bytes: Bytes,
    pub flash_address: u32,
}

/// Bootloader, partition table and application, in write order.
pub type AssetSet = [FirmwareAsset; 3];

/// Encoding the loader's write API expects image data in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferEncoding {
    /// Bytes passed through unchanged.
    #[default]
    Raw,
    /// Lowercase hex text, two characters per byte.
    Hex,
}

/// Re-encode image bytes for the loader. Pure; `Raw` shares the buffer.
pub fn encode_image(bytes: &Bytes, encoding: TransferEncoding) -> Bytes {
    match encoding {
        TransferEncoding::Raw => bytes.clone(),
        TransferEncoding::Hex => Bytes::from(hex::encode(bytes)),
    }
}

/// An image ready to hand to the loader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashImage {
    pub kind: AssetKind,
    pub address: u32,
    pub encoding: TransferEncoding,
    pub data: Bytes,
    /// Size of the image before encoding.
    pub image_len: usize,
}

/// Encode a full asset set for the loader, keeping write order.
pub fn prepare_images(assets: &AssetSet, encoding: TransferEncoding) -> Vec<FlashImage> {
    assets
        .iter()
        .map(|asset| FlashImage {
            kind: asset.kind,
            address: asset.flash_address,
            encoding,
            data: encode_image(&asset.bytes, encoding),
            image_len: asset.bytes.len(),
        })
        .collect()
}

/// Download the three images of `version` concurrently.
///
/// Any single failure fails the whole set; a partial set is never returned.
#[instrument(skip(fetcher, version), fields(version = %version.version_id))]
pub async fn load_assets<F: HttpFetch + ?Sized>(
    fetcher: &F,
    version: &FirmwareVersion,
) -> Result<AssetSet, LoadError> {
    let urls = &version.assets;
    let (bootloader, partitions, application) = tokio::try_join!(
        fetch_asset(fetcher, AssetKind::Bootloader, urls.url(AssetKind::Bootloader)),
        fetch_asset(fetcher, AssetKind::PartitionTable, urls.url(AssetKind::PartitionTable)),
        fetch_asset(fetcher, AssetKind::Application, urls.url(AssetKind::Application)),
    )?;

    info!(
        bootloader = bootloader.bytes.len(),
        partitions = partitions.bytes.len(),
        application = application.bytes.len(),
        "Firmware images downloaded"
    );
    Ok([bootloader, partitions, application])
}

async fn fetch_asset<F: HttpFetch + ?Sized>(
    fetcher: &F,
    kind: AssetKind,
    url: &Url,
) -> Result<FirmwareAsset, LoadError> {
    let bytes = fetcher
        .get(url)
        .await
        .map_err(|e| LoadError::PartialFetch {
            asset: kind,
            reason: e.to_string(),
        })?;

    debug!(asset = %kind, url = %url, len = bytes.len(), "Image fetched");
    Ok(FirmwareAsset {
        kind,
        bytes,
        flash_address: kind.flash_address(),
    })
}

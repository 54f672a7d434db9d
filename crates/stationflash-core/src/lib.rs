//! StationFlash-Core: firmware flashing orchestrator for StationBoard devices.
//!
//! This crate drives an external serial loader to write a three-image ESP32
//! firmware set (bootloader, partition table, application) fetched from a
//! version manifest, and guarantees the serial port is released on every
//! exit path.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Catalog**: version manifest parsing and version selection
//! - **Device**: vendor-filtered device acquisition and the open/closed handle
//! - **Assets**: concurrent image download and transfer encoding
//! - **Loader**: the contract of the external serial loader (plus mock)
//! - **Progress**: aggregation of per-file write progress
//! - **Cleanup**: transport/port teardown
//! - **Session**: the state machine tying it all together
//!
//! # Example
//!
//! ```no_run
//! use stationflash_core::config::FlasherConfig;
//! use stationflash_core::http::ReqwestFetcher;
//! use stationflash_core::loader::mock::{MockDevice, MockLoader, MockPicker};
//! use stationflash_core::session::FlashSession;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let picker = MockPicker::new();
//! picker.queue_device(MockDevice::new("/dev/ttyUSB0", 0x10C4, 0xEA60));
//! let mut session = FlashSession::new(
//!     picker,
//!     MockLoader::new(),
//!     ReqwestFetcher::new()?,
//!     FlasherConfig::default(),
//! );
//! session.start(None).await?;
//! # Ok(())
//! # }
//! ```

pub mod assets;
pub mod catalog;
pub mod cleanup;
pub mod config;
pub mod device;
pub mod error;
pub mod http;
pub mod loader;
pub mod progress;
pub mod serial;
pub mod session;
pub mod status;

// Re-exports for convenience
pub use assets::{AssetKind, FirmwareAsset, FlashImage, LoadError, TransferEncoding};
pub use catalog::{Catalog, FetchError, FirmwareVersion};
pub use config::FlasherConfig;
pub use device::{AcquisitionError, DeviceError, DeviceHandle, DeviceInfo, DevicePicker, SerialDevice};
pub use error::{CleanupError, FlashError, HandshakeError, TransferError};
pub use http::{HttpError, HttpFetch, ReqwestFetcher};
pub use loader::{ChipInfo, LoaderError, SerialLoader, WriteOptions, WriteProgress};
pub use session::FlashSession;
pub use status::{FlashStage, SessionStatus, StatusHistory, StatusObserver};

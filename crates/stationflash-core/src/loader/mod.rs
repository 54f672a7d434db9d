//! Serial loader layer module.

pub mod mock;
pub mod traits;

#[cfg(feature = "espflash")]
pub mod espflash;

pub use traits::{ChipInfo, LoaderError, ProgressSender, SerialLoader, WriteOptions, WriteProgress};

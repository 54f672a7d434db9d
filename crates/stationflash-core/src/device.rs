//! Device acquisition and the exclusive device handle.
//!
//! A [`DeviceHandle`] carries its port state in its type: a handle is
//! `Closed` when the picker hands it out and becomes `Open` only through
//! [`DeviceHandle::open`]. Cleanup never has to guess whether a port is open.

use std::fmt;
use std::marker::PhantomData;

use async_trait::async_trait;
use thiserror::Error;

/// Baud rate used for both the ROM handshake and the data transfer.
pub const SERIAL_BAUD_RATE: u32 = 921_600;

/// Silicon Labs (CP210x).
pub const SILICON_LABS_VENDOR_ID: u16 = 0x10C4;
/// QinHeng (CH340).
pub const QINHENG_VENDOR_ID: u16 = 0x1A86;
/// FTDI.
pub const FTDI_VENDOR_ID: u16 = 0x0403;
/// Espressif (native USB).
pub const ESPRESSIF_VENDOR_ID: u16 = 0x303A;

/// USB-to-serial bridge vendors offered in the device chooser.
pub const SUPPORTED_VENDOR_IDS: [u16; 4] = [
    SILICON_LABS_VENDOR_ID,
    QINHENG_VENDOR_ID,
    FTDI_VENDOR_ID,
    ESPRESSIF_VENDOR_ID,
];

/// Check a vendor id against a chooser filter.
pub fn vendor_allowed(filter: &[u16], vendor_id: u16) -> bool {
    filter.contains(&vendor_id)
}

/// Human-readable bridge name for a vendor id.
pub fn vendor_name(vendor_id: u16) -> &'static str {
    match vendor_id {
        SILICON_LABS_VENDOR_ID => "Silicon Labs CP210x",
        QINHENG_VENDOR_ID => "QinHeng CH340",
        FTDI_VENDOR_ID => "FTDI",
        ESPRESSIF_VENDOR_ID => "Espressif USB",
        _ => "Unknown",
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AcquisitionError {
    #[error("No device selected")]
    UserCancelled,

    #[error("Serial devices are not supported on this platform")]
    PlatformUnsupported,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("Failed to open {port}: {reason}")]
    OpenFailed { port: String, reason: String },

    #[error("Failed to close {port}: {reason}")]
    CloseFailed { port: String, reason: String },

    #[error("Port {0} is not open")]
    NotOpen(String),
}

/// Identity of a candidate serial device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub port_name: String,
    pub vendor_id: u16,
    pub product_id: u16,
    pub serial_number: Option<String>,
    pub product: Option<String>,
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({:04X}:{:04X} {})",
            self.port_name,
            self.vendor_id,
            self.product_id,
            vendor_name(self.vendor_id)
        )
    }
}

/// A physical serial device as provided by the platform.
#[async_trait]
pub trait SerialDevice: Send + Sync {
    fn info(&self) -> &DeviceInfo;

    /// Open the port at the given baud rate.
    async fn open(&mut self, baud_rate: u32) -> Result<(), DeviceError>;

    /// Close the port.
    async fn close(&mut self) -> Result<(), DeviceError>;
}

/// Platform service presenting a user-mediated device chooser.
#[async_trait]
pub trait DevicePicker: Send + Sync {
    type Device: SerialDevice;

    /// Whether the host can talk to serial devices at all.
    fn is_supported(&self) -> bool;

    /// Let the user pick one device whose vendor id is in `vendor_filter`.
    async fn request_device(&self, vendor_filter: &[u16])
    -> Result<Self::Device, AcquisitionError>;
}

/// Port state marker: not open.
#[derive(Debug)]
pub struct Closed;

/// Port state marker: open at the session baud rate.
#[derive(Debug)]
pub struct Open;

/// Exclusive capability over one physical device.
#[derive(Debug)]
pub struct DeviceHandle<D, S = Closed> {
    device: D,
    _state: PhantomData<S>,
}

impl<D, S> DeviceHandle<D, S> {
    fn wrap(device: D) -> Self {
        Self {
            device,
            _state: PhantomData,
        }
    }
}

impl<D: SerialDevice, S> DeviceHandle<D, S> {
    pub fn info(&self) -> &DeviceInfo {
        self.device.info()
    }
}

impl<D: SerialDevice> DeviceHandle<D, Closed> {
    pub fn new(device: D) -> Self {
        Self::wrap(device)
    }

    /// Open the port. On failure the closed handle is handed back.
    pub async fn open(self, baud_rate: u32) -> Result<DeviceHandle<D, Open>, (Self, DeviceError)> {
        let mut device = self.device;
        match device.open(baud_rate).await {
            Ok(()) => Ok(DeviceHandle::wrap(device)),
            Err(e) => Err((Self::wrap(device), e)),
        }
    }
}

impl<D: SerialDevice> DeviceHandle<D, Open> {
    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    /// Close the port. The handle is closed afterwards whatever the outcome.
    pub async fn close(self) -> (DeviceHandle<D, Closed>, Result<(), DeviceError>) {
        let mut device = self.device;
        let result = device.close().await;
        (DeviceHandle::wrap(device), result)
    }
}

/// A device held by a session, in either port state.
#[derive(Debug)]
pub enum HeldDevice<D> {
    Closed(DeviceHandle<D, Closed>),
    Open(DeviceHandle<D, Open>),
}

impl<D: SerialDevice> HeldDevice<D> {
    pub fn info(&self) -> &DeviceInfo {
        match self {
            HeldDevice::Closed(handle) => handle.info(),
            HeldDevice::Open(handle) => handle.info(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::mock::MockDevice;

    #[test]
    fn test_vendor_filter() {
        assert!(vendor_allowed(&SUPPORTED_VENDOR_IDS, 0x10C4));
        assert!(vendor_allowed(&SUPPORTED_VENDOR_IDS, 0x303A));
        assert!(!vendor_allowed(&SUPPORTED_VENDOR_IDS, 0x2341));
    }

    #[test]
    fn test_device_info_display() {
        let info = DeviceInfo {
            port_name: "/dev/ttyUSB0".into(),
            vendor_id: 0x1A86,
            product_id: 0x7523,
            serial_number: None,
            product: None,
        };
        assert_eq!(info.to_string(), "/dev/ttyUSB0 (1A86:7523 QinHeng CH340)");
    }

    #[tokio::test]
    async fn test_open_close_roundtrip() {
        let device = MockDevice::new("/dev/ttyUSB0", 0x10C4, 0xEA60);
        let probe = device.clone();
        let handle = DeviceHandle::new(device);

        let open = handle.open(SERIAL_BAUD_RATE).await.unwrap();
        assert!(probe.is_open());
        assert_eq!(probe.last_baud_rate(), Some(SERIAL_BAUD_RATE));

        let (_closed, result) = open.close().await;
        assert!(result.is_ok());
        assert!(!probe.is_open());
    }

    #[tokio::test]
    async fn test_failed_open_returns_closed_handle() {
        let device = MockDevice::new("/dev/ttyUSB0", 0x10C4, 0xEA60);
        device.fail_next_open();
        let probe = device.clone();

        let (closed, err) = DeviceHandle::new(device).open(SERIAL_BAUD_RATE).await.unwrap_err();
        assert!(matches!(err, DeviceError::OpenFailed { .. }));
        assert_eq!(closed.info().port_name, "/dev/ttyUSB0");
        assert!(!probe.is_open());
    }
}

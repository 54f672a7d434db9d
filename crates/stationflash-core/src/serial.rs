//! Native serial devices on top of the `serialport` crate.
//!
//! The platform "chooser" is split in two: enumeration and vendor filtering
//! live here, while presenting the candidates to a human is left to a
//! [`PortChooser`] supplied by the frontend.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serialport::{SerialPortInfo, SerialPortType, UsbPortInfo};
use tracing::{debug, info, warn};

use crate::device::{
    AcquisitionError, DeviceError, DeviceInfo, DevicePicker, SerialDevice, vendor_allowed,
};

#[cfg(unix)]
pub type NativePort = serialport::TTYPort;
#[cfg(windows)]
pub type NativePort = serialport::COMPort;

const PORT_TIMEOUT: Duration = Duration::from_millis(3000);

/// An enumerated USB serial port that passed the vendor filter.
#[derive(Debug, Clone)]
pub struct PortCandidate {
    pub info: DeviceInfo,
    pub usb_info: UsbPortInfo,
}

impl PortCandidate {
    fn from_port(port: SerialPortInfo) -> Option<Self> {
        match port.port_type {
            SerialPortType::UsbPort(usb) => Some(Self {
                info: DeviceInfo {
                    port_name: port.port_name,
                    vendor_id: usb.vid,
                    product_id: usb.pid,
                    serial_number: usb.serial_number.clone(),
                    product: usb.product.clone(),
                },
                usb_info: usb,
            }),
            _ => None,
        }
    }
}

/// macOS lists each USB serial device as both `/dev/tty.*` and `/dev/cu.*`;
/// keep only the `cu` side, which opens without waiting for carrier detect.
fn drop_tty_twins(ports: Vec<SerialPortInfo>) -> Vec<SerialPortInfo> {
    let cu_names: HashSet<String> = ports
        .iter()
        .filter_map(|p| p.port_name.strip_prefix("/dev/cu.").map(String::from))
        .collect();
    ports
        .into_iter()
        .filter(|p| {
            p.port_name
                .strip_prefix("/dev/tty.")
                .is_none_or(|suffix| !cu_names.contains(suffix))
        })
        .collect()
}

fn filter_candidates(ports: Vec<SerialPortInfo>, vendor_filter: &[u16]) -> Vec<PortCandidate> {
    drop_tty_twins(ports)
        .into_iter()
        .filter_map(PortCandidate::from_port)
        .filter(|c| vendor_allowed(vendor_filter, c.info.vendor_id))
        .collect()
}

/// Enumerate USB serial ports whose vendor id is in `vendor_filter`.
pub fn list_candidates(vendor_filter: &[u16]) -> Result<Vec<PortCandidate>, serialport::Error> {
    let ports = serialport::available_ports()?;
    let total = ports.len();
    let candidates = filter_candidates(ports, vendor_filter);
    debug!(total, matching = candidates.len(), "Serial ports enumerated");
    Ok(candidates)
}

/// Presents candidates to the user. Runs on a blocking thread.
pub trait PortChooser: Send + Sync + 'static {
    /// Index of the chosen candidate, or `None` if the user backed out.
    fn choose(&self, candidates: &[DeviceInfo]) -> Option<usize>;
}

/// Chooser that picks a port by name, for `--port` style selection.
#[derive(Debug, Clone)]
pub struct NamedPort(pub String);

impl PortChooser for NamedPort {
    fn choose(&self, candidates: &[DeviceInfo]) -> Option<usize> {
        candidates.iter().position(|c| c.port_name == self.0)
    }
}

/// Chooser that takes the only candidate and refuses to guess between several.
#[derive(Debug, Clone, Copy, Default)]
pub struct SoleCandidate;

impl PortChooser for SoleCandidate {
    fn choose(&self, candidates: &[DeviceInfo]) -> Option<usize> {
        match candidates {
            [_] => Some(0),
            _ => None,
        }
    }
}

/// [`DevicePicker`] over the host's serial ports.
pub struct SerialPortPicker<C> {
    chooser: Arc<C>,
}

impl<C: PortChooser> SerialPortPicker<C> {
    pub fn new(chooser: C) -> Self {
        Self {
            chooser: Arc::new(chooser),
        }
    }
}

#[async_trait]
impl<C: PortChooser> DevicePicker for SerialPortPicker<C> {
    type Device = NativeSerialDevice;

    fn is_supported(&self) -> bool {
        serialport::available_ports().is_ok()
    }

    async fn request_device(
        &self,
        vendor_filter: &[u16],
    ) -> Result<NativeSerialDevice, AcquisitionError> {
        let filter = vendor_filter.to_vec();
        let chooser = self.chooser.clone();

        tokio::task::spawn_blocking(move || {
            let candidates = list_candidates(&filter).map_err(|e| {
                warn!(error = %e, "Serial port enumeration failed");
                AcquisitionError::PlatformUnsupported
            })?;
            let infos: Vec<DeviceInfo> = candidates.iter().map(|c| c.info.clone()).collect();
            let index = chooser
                .choose(&infos)
                .ok_or(AcquisitionError::UserCancelled)?;
            candidates
                .into_iter()
                .nth(index)
                .map(NativeSerialDevice::from_candidate)
                .ok_or(AcquisitionError::UserCancelled)
        })
        .await
        .map_err(|e| {
            warn!(error = %e, "Device chooser task failed");
            AcquisitionError::UserCancelled
        })?
    }
}

/// A host serial port.
pub struct NativeSerialDevice {
    info: DeviceInfo,
    usb_info: UsbPortInfo,
    port: Mutex<Option<NativePort>>,
}

impl fmt::Debug for NativeSerialDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeSerialDevice")
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

impl NativeSerialDevice {
    pub fn from_candidate(candidate: PortCandidate) -> Self {
        Self {
            info: candidate.info,
            usb_info: candidate.usb_info,
            port: Mutex::new(None),
        }
    }

    pub fn usb_info(&self) -> &UsbPortInfo {
        &self.usb_info
    }

    /// Hand the open port to a loader. The device stays logically open.
    pub fn take_port(&mut self) -> Option<NativePort> {
        self.port_slot().take()
    }

    fn port_slot(&mut self) -> &mut Option<NativePort> {
        self.port
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl SerialDevice for NativeSerialDevice {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    async fn open(&mut self, baud_rate: u32) -> Result<(), DeviceError> {
        let name = self.info.port_name.clone();
        let open_failed = |reason: String| DeviceError::OpenFailed {
            port: self.info.port_name.clone(),
            reason,
        };

        let port = tokio::task::spawn_blocking(move || {
            serialport::new(name, baud_rate)
                .timeout(PORT_TIMEOUT)
                .open_native()
        })
        .await
        .map_err(|e| open_failed(e.to_string()))?
        .map_err(|e| open_failed(e.to_string()))?;

        *self.port_slot() = Some(port);
        info!(port = %self.info.port_name, baud = baud_rate, "Serial port opened");
        Ok(())
    }

    async fn close(&mut self) -> Result<(), DeviceError> {
        // Dropping the native port closes the descriptor. If a loader took
        // the port, it closed it when its transport went away.
        if self.port_slot().take().is_some() {
            debug!(port = %self.info.port_name, "Serial port closed");
        }
        Ok(())
    }
}

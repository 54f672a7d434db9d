//! Resource release after success or failure.
//!
//! The loader transport sits on top of the open port, so it is always torn
//! down first. Release is best effort: every step runs even when an earlier
//! one failed, failures are logged, and the session ends up holding nothing.

use tracing::{debug, warn};

use crate::device::{HeldDevice, SerialDevice};
use crate::error::CleanupError;
use crate::loader::SerialLoader;

/// Resources a session may be holding at any point.
#[derive(Debug)]
pub struct Resources<D, T> {
    pub device: Option<HeldDevice<D>>,
    pub transport: Option<T>,
}

impl<D, T> Default for Resources<D, T> {
    fn default() -> Self {
        Self {
            device: None,
            transport: None,
        }
    }
}

/// Outcome of one release pass.
#[derive(Debug, Default)]
pub struct CleanupReport {
    pub transport_closed: bool,
    pub device_closed: bool,
    pub errors: Vec<CleanupError>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Release everything in `resources`. Idempotent; never fails.
pub async fn release<L: SerialLoader>(
    loader: &L,
    resources: &mut Resources<L::Device, L::Transport>,
) -> CleanupReport {
    let mut report = CleanupReport::default();

    if let Some(transport) = resources.transport.take() {
        match loader.close_transport(transport).await {
            Ok(()) => report.transport_closed = true,
            Err(e) => {
                warn!(error = %e, "Failed to close loader transport");
                report.errors.push(CleanupError::Transport(e));
            }
        }
    }

    match resources.device.take() {
        Some(HeldDevice::Open(handle)) => {
            let port = handle.info().port_name.clone();
            let (_closed, result) = handle.close().await;
            match result {
                Ok(()) => {
                    debug!(port = %port, "Port closed");
                    report.device_closed = true;
                }
                Err(e) => {
                    warn!(port = %port, error = %e, "Failed to close port");
                    report.errors.push(CleanupError::Device(e));
                }
            }
        }
        Some(HeldDevice::Closed(handle)) => {
            debug!(port = %handle.info().port_name, "Releasing unopened device");
        }
        None => {}
    }

    report
}

/// Port name of the held device, open or not.
pub fn held_port<D: SerialDevice, T>(resources: &Resources<D, T>) -> Option<&str> {
    resources
        .device
        .as_ref()
        .map(|held| held.info().port_name.as_str())
}

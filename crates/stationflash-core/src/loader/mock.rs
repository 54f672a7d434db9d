//! Mock collaborators for testing the orchestrator without hardware.
//!
//! Every mock is a cheap `Clone` over shared state, so a test can hand one
//! copy to the session and keep another to script failures and inspect the
//! recorded calls.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::time::Instant;
use url::Url;

use super::traits::{ChipInfo, LoaderError, ProgressSender, SerialLoader, WriteOptions, WriteProgress};
use crate::assets::{FlashImage, TransferEncoding};
use crate::device::{
    AcquisitionError, DeviceError, DeviceHandle, DeviceInfo, DevicePicker, Open, SerialDevice,
    vendor_allowed,
};
use crate::http::{HttpError, HttpFetch};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ---------------------------------------------------------------------------
// Device
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct DeviceState {
    open: bool,
    opens: usize,
    closes: usize,
    baud_rate: Option<u32>,
    fail_next_open: bool,
    fail_close: bool,
}

/// Mock serial device. Clones share the same simulated port.
///
/// Opening an already-open port fails, like a real OS port would, so a
/// leaked port shows up as a failed reopen.
#[derive(Debug, Clone)]
pub struct MockDevice {
    info: DeviceInfo,
    state: Arc<Mutex<DeviceState>>,
}

impl MockDevice {
    pub fn new(port_name: &str, vendor_id: u16, product_id: u16) -> Self {
        Self {
            info: DeviceInfo {
                port_name: port_name.to_string(),
                vendor_id,
                product_id,
                serial_number: None,
                product: Some("Mock USB-UART".to_string()),
            },
            state: Arc::new(Mutex::new(DeviceState::default())),
        }
    }

    /// Make the next `open` fail.
    pub fn fail_next_open(&self) {
        lock(&self.state).fail_next_open = true;
    }

    /// Make every `close` fail and leave the port open.
    pub fn fail_close(&self) {
        lock(&self.state).fail_close = true;
    }

    pub fn is_open(&self) -> bool {
        lock(&self.state).open
    }

    pub fn open_count(&self) -> usize {
        lock(&self.state).opens
    }

    pub fn close_count(&self) -> usize {
        lock(&self.state).closes
    }

    pub fn last_baud_rate(&self) -> Option<u32> {
        lock(&self.state).baud_rate
    }
}

#[async_trait]
impl SerialDevice for MockDevice {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    async fn open(&mut self, baud_rate: u32) -> Result<(), DeviceError> {
        let mut state = lock(&self.state);
        if state.fail_next_open {
            state.fail_next_open = false;
            return Err(DeviceError::OpenFailed {
                port: self.info.port_name.clone(),
                reason: "simulated open failure".into(),
            });
        }
        if state.open {
            return Err(DeviceError::OpenFailed {
                port: self.info.port_name.clone(),
                reason: "port is already open".into(),
            });
        }
        state.open = true;
        state.opens += 1;
        state.baud_rate = Some(baud_rate);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), DeviceError> {
        let mut state = lock(&self.state);
        if !state.open {
            return Err(DeviceError::NotOpen(self.info.port_name.clone()));
        }
        if state.fail_close {
            return Err(DeviceError::CloseFailed {
                port: self.info.port_name.clone(),
                reason: "simulated close failure".into(),
            });
        }
        state.open = false;
        state.closes += 1;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Picker
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct PickerState {
    supported: bool,
    choices: VecDeque<Result<MockDevice, AcquisitionError>>,
    filters: Vec<Vec<u16>>,
}

/// Mock device chooser returning queued outcomes in order.
///
/// An empty queue, or a queued device whose vendor is filtered out, behaves
/// like the user dismissing the chooser.
#[derive(Debug, Clone)]
pub struct MockPicker {
    state: Arc<Mutex<PickerState>>,
}

impl MockPicker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(PickerState {
                supported: true,
                choices: VecDeque::new(),
                filters: Vec::new(),
            })),
        }
    }

    /// A picker on a host without serial support.
    pub fn unsupported() -> Self {
        let picker = Self::new();
        lock(&picker.state).supported = false;
        picker
    }

    pub fn queue_device(&self, device: MockDevice) {
        lock(&self.state).choices.push_back(Ok(device));
    }

    pub fn queue_cancel(&self) {
        lock(&self.state)
            .choices
            .push_back(Err(AcquisitionError::UserCancelled));
    }

    pub fn request_count(&self) -> usize {
        lock(&self.state).filters.len()
    }

    pub fn last_filter(&self) -> Option<Vec<u16>> {
        lock(&self.state).filters.last().cloned()
    }
}

impl Default for MockPicker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DevicePicker for MockPicker {
    type Device = MockDevice;

    fn is_supported(&self) -> bool {
        lock(&self.state).supported
    }

    async fn request_device(
        &self,
        vendor_filter: &[u16],
    ) -> Result<MockDevice, AcquisitionError> {
        let mut state = lock(&self.state);
        if !state.supported {
            return Err(AcquisitionError::PlatformUnsupported);
        }
        state.filters.push(vendor_filter.to_vec());

        match state.choices.pop_front() {
            Some(Ok(device)) if vendor_allowed(vendor_filter, device.info().vendor_id) => {
                Ok(device)
            }
            Some(Err(e)) => Err(e),
            _ => Err(AcquisitionError::UserCancelled),
        }
    }
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Calls recorded by [`MockLoader`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoaderCall {
    OpenTransport { port: String, baud_rate: u32 },
    Handshake,
    WriteImages { addresses: Vec<u32>, lengths: Vec<usize> },
    SetResetLine(bool),
    CloseTransport,
}

#[derive(Debug)]
struct LoaderState {
    calls: Vec<LoaderCall>,
    reset_edges: Vec<(bool, Instant)>,
    write_options: Option<WriteOptions>,
    encoding: TransferEncoding,
    chip: String,
    fail_open_transport: bool,
    fail_handshakes: usize,
    stall_handshake: bool,
    fail_write_at: Option<usize>,
    fail_reset: bool,
    fail_close_transport: bool,
    progress_script: Option<Vec<WriteProgress>>,
}

/// Mock serial loader.
///
/// By default every step succeeds and `write_images` reports
/// `(i, 0, len)`, `(i, len / 2, len)`, `(i, len, len)` for each image.
#[derive(Debug, Clone)]
pub struct MockLoader {
    state: Arc<Mutex<LoaderState>>,
}

/// Transport handed out by [`MockLoader`].
#[derive(Debug)]
pub struct MockLink {
    pub port: String,
    pub baud_rate: u32,
}

impl MockLoader {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(LoaderState {
                calls: Vec::new(),
                reset_edges: Vec::new(),
                write_options: None,
                encoding: TransferEncoding::Raw,
                chip: "ESP32-D0WD-V3".to_string(),
                fail_open_transport: false,
                fail_handshakes: 0,
                stall_handshake: false,
                fail_write_at: None,
                fail_reset: false,
                fail_close_transport: false,
                progress_script: None,
            })),
        }
    }

    pub fn with_encoding(self, encoding: TransferEncoding) -> Self {
        lock(&self.state).encoding = encoding;
        self
    }

    pub fn fail_open_transport(&self) {
        lock(&self.state).fail_open_transport = true;
    }

    /// Fail the next `count` handshakes.
    pub fn fail_handshakes(&self, count: usize) {
        lock(&self.state).fail_handshakes = count;
    }

    /// Make the handshake never complete.
    pub fn stall_handshake(&self) {
        lock(&self.state).stall_handshake = true;
    }

    /// Fail the write once image `file_index` has started.
    pub fn fail_write_at(&self, file_index: usize) {
        lock(&self.state).fail_write_at = Some(file_index);
    }

    pub fn fail_reset(&self) {
        lock(&self.state).fail_reset = true;
    }

    pub fn fail_close_transport(&self) {
        lock(&self.state).fail_close_transport = true;
    }

    /// Replace the default progress reports with an explicit sequence.
    pub fn script_progress(&self, script: Vec<WriteProgress>) {
        lock(&self.state).progress_script = Some(script);
    }

    pub fn calls(&self) -> Vec<LoaderCall> {
        lock(&self.state).calls.clone()
    }

    pub fn reset_edges(&self) -> Vec<(bool, Instant)> {
        lock(&self.state).reset_edges.clone()
    }

    pub fn last_write_options(&self) -> Option<WriteOptions> {
        lock(&self.state).write_options.clone()
    }

    fn record(&self, call: LoaderCall) {
        lock(&self.state).calls.push(call);
    }
}

impl Default for MockLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SerialLoader for MockLoader {
    type Device = MockDevice;
    type Transport = MockLink;

    fn encoding(&self) -> TransferEncoding {
        lock(&self.state).encoding
    }

    async fn open_transport(
        &self,
        device: &mut DeviceHandle<MockDevice, Open>,
        baud_rate: u32,
    ) -> Result<MockLink, LoaderError> {
        let port = device.info().port_name.clone();
        self.record(LoaderCall::OpenTransport {
            port: port.clone(),
            baud_rate,
        });
        if lock(&self.state).fail_open_transport {
            return Err(LoaderError::Protocol("transport setup failed".into()));
        }
        Ok(MockLink { port, baud_rate })
    }

    async fn handshake(&self, _transport: &mut MockLink) -> Result<ChipInfo, LoaderError> {
        self.record(LoaderCall::Handshake);
        let (stall, chip) = {
            let mut state = lock(&self.state);
            if state.fail_handshakes > 0 {
                state.fail_handshakes -= 1;
                return Err(LoaderError::Timeout { timeout_ms: 3000 });
            }
            (state.stall_handshake, state.chip.clone())
        };
        if stall {
            std::future::pending::<()>().await;
        }
        Ok(ChipInfo {
            chip,
            mac_address: Some("24:0a:c4:00:00:01".to_string()),
            features: vec!["WiFi".to_string(), "BT".to_string()],
        })
    }

    async fn write_images(
        &self,
        _transport: &mut MockLink,
        images: &[FlashImage],
        options: &WriteOptions,
        progress: ProgressSender,
    ) -> Result<(), LoaderError> {
        self.record(LoaderCall::WriteImages {
            addresses: images.iter().map(|i| i.address).collect(),
            lengths: images.iter().map(|i| i.data.len()).collect(),
        });

        let (script, fail_at) = {
            let mut state = lock(&self.state);
            state.write_options = Some(options.clone());
            (state.progress_script.clone(), state.fail_write_at)
        };

        if let Some(script) = script {
            for update in script {
                let _ = progress.send(update);
            }
            return Ok(());
        }

        for (file_index, image) in images.iter().enumerate() {
            let total = image.data.len() as u64;
            let _ = progress.send(WriteProgress {
                file_index,
                written: 0,
                total,
            });
            if fail_at == Some(file_index) {
                return Err(LoaderError::Protocol(format!(
                    "flash write failed at 0x{:X}",
                    image.address
                )));
            }
            tokio::task::yield_now().await;
            for written in [total / 2, total] {
                let _ = progress.send(WriteProgress {
                    file_index,
                    written,
                    total,
                });
            }
        }
        Ok(())
    }

    async fn set_reset_line(
        &self,
        _transport: &mut MockLink,
        asserted: bool,
    ) -> Result<(), LoaderError> {
        self.record(LoaderCall::SetResetLine(asserted));
        let mut state = lock(&self.state);
        if state.fail_reset {
            return Err(LoaderError::Disconnected);
        }
        state.reset_edges.push((asserted, Instant::now()));
        Ok(())
    }

    async fn close_transport(&self, _transport: MockLink) -> Result<(), LoaderError> {
        self.record(LoaderCall::CloseTransport);
        if lock(&self.state).fail_close_transport {
            return Err(LoaderError::Disconnected);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// HTTP
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct FetcherState {
    routes: HashMap<String, Result<Bytes, u16>>,
    latency: Duration,
    requests: Vec<String>,
}

/// Mock HTTP fetcher serving canned bodies by exact URL. Unknown URLs are 404.
#[derive(Debug, Clone, Default)]
pub struct MockFetcher {
    state: Arc<Mutex<FetcherState>>,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, url: &str, body: &[u8]) {
        lock(&self.state)
            .routes
            .insert(url.to_string(), Ok(Bytes::copy_from_slice(body)));
    }

    pub fn fail_with_status(&self, url: &str, status: u16) {
        lock(&self.state).routes.insert(url.to_string(), Err(status));
    }

    /// Delay every response by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        lock(&self.state).latency = latency;
    }

    pub fn requests(&self) -> Vec<String> {
        lock(&self.state).requests.clone()
    }
}

#[async_trait]
impl HttpFetch for MockFetcher {
    async fn get(&self, url: &Url) -> Result<Bytes, HttpError> {
        let (route, latency) = {
            let mut state = lock(&self.state);
            state.requests.push(url.to_string());
            (state.routes.get(url.as_str()).cloned(), state.latency)
        };

        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        match route {
            Some(Ok(body)) => Ok(body),
            Some(Err(status)) => Err(HttpError::Status {
                url: url.to_string(),
                status,
            }),
            None => Err(HttpError::Status {
                url: url.to_string(),
                status: 404,
            }),
        }
    }
}

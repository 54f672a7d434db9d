//! Flash session - the orchestrator driving one board from chooser to reboot.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::assets::{load_assets, prepare_images};
use crate::catalog::{Catalog, FetchError, fetch_catalog};
use crate::cleanup::{self, Resources};
use crate::config::FlasherConfig;
use crate::device::{
    AcquisitionError, DeviceHandle, DevicePicker, HeldDevice, SERIAL_BAUD_RATE,
    SUPPORTED_VENDOR_IDS, SerialDevice,
};
use crate::error::{FlashError, HandshakeError, TransferError};
use crate::http::HttpFetch;
use crate::loader::{ChipInfo, SerialLoader};
use crate::progress::{
    CHIP_INIT_PERCENT, COMPLETE_PERCENT, PREPARE_PERCENT, ProgressAggregator,
    TRANSFER_END_PERCENT, TRANSFER_START_PERCENT, part_message,
};
use crate::status::{FlashStage, SessionStatus, StatusBoard, StatusObserver};

/// Hold time of the reset pulse.
pub const RESET_SETTLE: Duration = Duration::from_millis(100);

/// One flashing station: a device picker, a loader and a firmware source.
///
/// At most one flash is in flight per session. `start` is the only entry
/// point that touches the device; observers follow along through
/// [`FlashSession::subscribe`].
pub struct FlashSession<P, L, F>
where
    P: DevicePicker,
    L: SerialLoader<Device = P::Device>,
    F: HttpFetch,
{
    picker: P,
    loader: L,
    fetcher: F,
    config: FlasherConfig,
    supported: bool,
    board: StatusBoard,
    resources: Resources<P::Device, L::Transport>,
    catalog: Option<Arc<Catalog>>,
    chip: Option<ChipInfo>,
}

impl<P, L, F> FlashSession<P, L, F>
where
    P: DevicePicker,
    L: SerialLoader<Device = P::Device>,
    F: HttpFetch,
{
    pub fn new(picker: P, loader: L, fetcher: F, config: FlasherConfig) -> Self {
        let supported = picker.is_supported();
        if !supported {
            warn!("Serial devices are not supported on this platform");
        }
        Self {
            picker,
            loader,
            fetcher,
            config,
            supported,
            board: StatusBoard::new(),
            resources: Resources::default(),
            catalog: None,
            chip: None,
        }
    }

    /// Register an observer that sees every status update.
    pub fn with_observer(mut self, observer: Arc<dyn StatusObserver>) -> Self {
        self.board.add_observer(observer);
        self
    }

    /// Current status snapshot.
    pub fn status(&self) -> SessionStatus {
        self.board.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.board.subscribe()
    }

    /// Platform serial capability, checked once at construction.
    pub fn is_supported(&self) -> bool {
        self.supported
    }

    /// Chip identity from the most recent successful handshake.
    pub fn last_chip(&self) -> Option<&ChipInfo> {
        self.chip.as_ref()
    }

    /// Catalog fetched by an earlier call, if any.
    pub fn catalog(&self) -> Option<Arc<Catalog>> {
        self.catalog.clone()
    }

    pub fn config(&self) -> &FlasherConfig {
        &self.config
    }

    pub fn holds_device(&self) -> bool {
        self.resources.device.is_some()
    }

    pub fn holds_transport(&self) -> bool {
        self.resources.transport.is_some()
    }

    /// Fetch the manifest again and cache the result for later sessions.
    pub async fn refresh_catalog(&mut self) -> Result<Arc<Catalog>, FetchError> {
        self.catalog = None;
        cached_catalog(&mut self.catalog, &self.fetcher, &self.config).await
    }

    /// Flash `version_id`, or the latest version when omitted or unknown.
    ///
    /// Rejected with [`FlashError::Busy`] while a flash is in flight. On any
    /// failure the device and transport are released before the error is
    /// returned, so calling `start` again is always legal afterwards.
    #[instrument(skip(self))]
    pub async fn start(&mut self, version_id: Option<&str>) -> Result<(), FlashError> {
        let stage = self.board.stage();
        if !stage.accepts_start() {
            warn!(stage = %stage, "Start rejected: flash already in flight");
            return Err(FlashError::Busy(stage));
        }

        self.chip = None;
        self.board
            .reset(FlashStage::Connecting, "Waiting for USB device...");

        let started = Instant::now();
        match self.run(version_id).await {
            Ok(()) => {
                info!(elapsed_ms = started.elapsed().as_millis() as u64, "Flash complete");
                Ok(())
            }
            Err(e) => {
                let port = cleanup::held_port(&self.resources).map(str::to_owned);
                let report = cleanup::release(&self.loader, &mut self.resources).await;
                if !report.is_clean() {
                    warn!(errors = report.errors.len(), "Cleanup finished with errors");
                }
                if e.is_cancelled() {
                    info!("Device selection cancelled");
                } else {
                    error!(error = %e, port = ?port, "Flash failed");
                }
                self.board.reset(FlashStage::Error, e.to_string());
                Err(e)
            }
        }
    }

    async fn run(&mut self, version_id: Option<&str>) -> Result<(), FlashError> {
        if !self.supported {
            return Err(AcquisitionError::PlatformUnsupported.into());
        }

        // Connecting
        let held = match self.resources.device.take() {
            Some(held) => held,
            None => {
                let device = self.picker.request_device(&SUPPORTED_VENDOR_IDS).await?;
                info!(device = %device.info(), "Device selected");
                HeldDevice::Closed(DeviceHandle::new(device))
            }
        };

        self.board
            .advance(FlashStage::Connecting, "Connecting to device...", 0.0);
        let mut handle = match held {
            HeldDevice::Open(handle) => handle,
            HeldDevice::Closed(handle) => match handle.open(SERIAL_BAUD_RATE).await {
                Ok(open) => open,
                Err((closed, e)) => {
                    self.resources.device = Some(HeldDevice::Closed(closed));
                    return Err(e.into());
                }
            },
        };
        debug!(port = %handle.info().port_name, baud = SERIAL_BAUD_RATE, "Port open");

        let transport = self.loader.open_transport(&mut handle, SERIAL_BAUD_RATE).await;
        self.resources.device = Some(HeldDevice::Open(handle));
        let transport = self
            .resources
            .transport
            .insert(transport.map_err(HandshakeError)?);

        self.board
            .advance(FlashStage::Connecting, "Initializing chip...", CHIP_INIT_PERCENT);
        let chip = self
            .loader
            .handshake(transport)
            .await
            .map_err(HandshakeError)?;
        info!(chip = %chip, "Chip connected");
        self.chip = Some(chip);
        self.board
            .advance(FlashStage::Connecting, "Preparing flash...", PREPARE_PERCENT);

        // Downloading
        self.board.advance(
            FlashStage::Downloading,
            "Downloading firmware files...",
            PREPARE_PERCENT,
        );
        let catalog = cached_catalog(&mut self.catalog, &self.fetcher, &self.config).await?;
        let version = catalog.select_version(version_id);
        info!(version = %version.version_id, "Version selected");
        let assets = load_assets(&self.fetcher, version).await?;
        let images = prepare_images(&assets, self.loader.encoding());

        // Flashing
        self.board.advance(
            FlashStage::Flashing,
            "Flashing firmware...",
            TRANSFER_START_PERCENT,
        );
        let options = self.config.write_options();
        let total_files = images.len();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let board = &self.board;

        let write = self.loader.write_images(transport, &images, &options, tx);
        let drain = async {
            let mut aggregator = ProgressAggregator::new(total_files);
            while let Some(update) = rx.recv().await {
                let percent = aggregator.update(update);
                trace!(?update, percent, "Write progress");
                board.advance(FlashStage::Flashing, part_message(&update, total_files), percent);
            }
        };
        let (written, ()) = tokio::join!(write, drain);
        written.map_err(TransferError::Write)?;

        // Verifying
        self.board
            .advance(FlashStage::Verifying, "Resetting device...", TRANSFER_END_PERCENT);
        self.loader
            .set_reset_line(transport, false)
            .await
            .map_err(TransferError::Reset)?;
        tokio::time::sleep(RESET_SETTLE).await;
        self.loader
            .set_reset_line(transport, true)
            .await
            .map_err(TransferError::Reset)?;

        let report = cleanup::release(&self.loader, &mut self.resources).await;
        if !report.is_clean() {
            warn!(errors = report.errors.len(), "Release after flash finished with errors");
        }

        self.board.advance(
            FlashStage::Complete,
            "Flash complete! Device restarting...",
            COMPLETE_PERCENT,
        );
        Ok(())
    }
}

/// Return the cached catalog, fetching it first if needed.
async fn cached_catalog<F: HttpFetch + ?Sized>(
    cache: &mut Option<Arc<Catalog>>,
    fetcher: &F,
    config: &FlasherConfig,
) -> Result<Arc<Catalog>, FetchError> {
    if let Some(catalog) = cache {
        return Ok(catalog.clone());
    }

    let url = config.manifest_url().map_err(|e| {
        FetchError::Unreachable(format!("invalid manifest URL {:?}: {e}", config.manifest_url))
    })?;
    let catalog = Arc::new(fetch_catalog(fetcher, &url).await?);
    *cache = Some(catalog.clone());
    Ok(catalog)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::TransferEncoding;
    use crate::loader::WriteOptions;
    use crate::loader::mock::{LoaderCall, MockDevice, MockFetcher, MockLoader, MockPicker};
    use pretty_assertions::assert_eq;

    const MANIFEST_URL: &str = "https://boards.example/firmware/versions.json";
    const MANIFEST: &str = r#"{"versions": [
        {"version": "1.2.0", "date": "2025-03-01", "changes": ["Departure board tweaks"],
         "files": {"bootloader": "1.2.0/bootloader.bin", "partitions": "1.2.0/partitions.bin",
                   "firmware": "1.2.0/firmware.bin"}},
        {"version": "1.1.0", "date": "2025-01-20", "changes": [],
         "files": {"bootloader": "1.1.0/bootloader.bin", "partitions": "1.1.0/partitions.bin",
                   "firmware": "1.1.0/firmware.bin"}}
    ]}"#;

    fn fetcher() -> MockFetcher {
        let fetcher = MockFetcher::new();
        fetcher.respond(MANIFEST_URL, MANIFEST.as_bytes());
        for version in ["1.2.0", "1.1.0"] {
            for (file, len) in [("bootloader", 16), ("partitions", 8), ("firmware", 64)] {
                let url = format!("https://boards.example/firmware/{version}/{file}.bin");
                fetcher.respond(&url, &vec![0xE9; len]);
            }
        }
        fetcher
    }

    fn config() -> FlasherConfig {
        FlasherConfig {
            manifest_url: MANIFEST_URL.to_string(),
            ..Default::default()
        }
    }

    fn session_with(
        loader: MockLoader,
    ) -> (FlashSession<MockPicker, MockLoader, MockFetcher>, MockPicker) {
        let picker = MockPicker::new();
        picker.queue_device(MockDevice::new("/dev/ttyUSB0", 0x10C4, 0xEA60));
        let session = FlashSession::new(picker.clone(), loader, fetcher(), config());
        (session, picker)
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_flash_records_chip() {
        let (mut session, _) = session_with(MockLoader::new());
        session.start(None).await.unwrap();

        let status = session.status();
        assert_eq!(status.stage, FlashStage::Complete);
        assert_eq!(status.message, "Flash complete! Device restarting...");
        assert_eq!(status.progress, 100.0);
        assert_eq!(session.last_chip().unwrap().chip, "ESP32-D0WD-V3");
        assert!(!session.holds_device());
        assert!(!session.holds_transport());
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_receives_selected_version_and_options() {
        let loader = MockLoader::new().with_encoding(TransferEncoding::Hex);
        let probe = loader.clone();
        let (mut session, _) = session_with(loader);
        session.start(Some("1.1.0")).await.unwrap();

        let write = probe
            .calls()
            .into_iter()
            .find(|c| matches!(c, LoaderCall::WriteImages { .. }))
            .unwrap();
        assert_eq!(
            write,
            LoaderCall::WriteImages {
                addresses: vec![0x1000, 0x8000, 0x10000],
                lengths: vec![32, 16, 128],
            }
        );
        assert_eq!(probe.last_write_options(), Some(WriteOptions::default()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_catalog_fetched_once_across_sessions() {
        let fetcher = fetcher();
        let requests = fetcher.clone();
        let picker = MockPicker::new();
        let device = MockDevice::new("/dev/ttyUSB0", 0x10C4, 0xEA60);
        picker.queue_device(device.clone());
        picker.queue_device(device);
        let mut session = FlashSession::new(picker, MockLoader::new(), fetcher, config());

        session.start(None).await.unwrap();
        session.start(None).await.unwrap();

        let manifest_hits = requests
            .requests()
            .iter()
            .filter(|url| url.as_str() == MANIFEST_URL)
            .count();
        assert_eq!(manifest_hits, 1);
        assert_eq!(session.catalog().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_rejected_while_in_flight() {
        let loader = MockLoader::new();
        loader.stall_handshake();
        let (mut session, picker) = session_with(loader);

        let first = tokio::time::timeout(Duration::from_millis(50), session.start(None)).await;
        assert!(first.is_err());
        let before = session.status();
        assert_eq!(before.stage, FlashStage::Connecting);
        assert_eq!(before.message, "Initializing chip...");

        let err = session.start(None).await.unwrap_err();
        assert!(matches!(err, FlashError::Busy(FlashStage::Connecting)));
        assert_eq!(session.status(), before);
        assert!(session.holds_device());
        assert_eq!(picker.request_count(), 1);
    }

    #[tokio::test]
    async fn test_unsupported_platform_fails_without_prompt() {
        let picker = MockPicker::unsupported();
        let mut session =
            FlashSession::new(picker.clone(), MockLoader::new(), fetcher(), config());
        assert!(!session.is_supported());

        let err = session.start(None).await.unwrap_err();
        assert!(matches!(
            err,
            FlashError::Acquisition(AcquisitionError::PlatformUnsupported)
        ));
        assert_eq!(session.status().stage, FlashStage::Error);
        assert_eq!(picker.request_count(), 0);
    }

    #[tokio::test]
    async fn test_bad_manifest_url_is_unreachable() {
        let picker = MockPicker::new();
        picker.queue_device(MockDevice::new("/dev/ttyUSB0", 0x10C4, 0xEA60));
        let config = FlasherConfig {
            manifest_url: "not a url".into(),
            ..Default::default()
        };
        let mut session = FlashSession::new(picker, MockLoader::new(), fetcher(), config);

        let err = session.start(None).await.unwrap_err();
        assert!(matches!(err, FlashError::Fetch(FetchError::Unreachable(_))));
        assert!(!session.holds_device());
    }

    #[tokio::test]
    async fn test_refresh_catalog() {
        let (mut session, _) = session_with(MockLoader::new());
        assert!(session.catalog().is_none());
        let catalog = session.refresh_catalog().await.unwrap();
        assert_eq!(catalog.latest().version_id, "1.2.0");
        assert!(session.catalog().is_some());
        assert_eq!(session.status().stage, FlashStage::Idle);
    }
}

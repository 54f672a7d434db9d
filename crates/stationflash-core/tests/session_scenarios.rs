//! End-to-end flash sessions against the mock picker, loader and fetcher.

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use stationflash_core::assets::AssetKind;
use stationflash_core::loader::mock::{LoaderCall, MockDevice, MockFetcher, MockLoader, MockPicker};
use stationflash_core::{
    FlashError, FlashSession, FlashStage, FlasherConfig, LoadError, StatusHistory, TransferError,
    WriteProgress,
};

const MANIFEST_URL: &str = "https://boards.example/firmware/versions.json";
const MANIFEST: &str = r#"{"versions": [{
    "version": "1.2.0",
    "date": "2025-03-01",
    "changes": ["Departure board layout", "Wi-Fi reconnect fix"],
    "files": {
        "bootloader": "bootloader.bin",
        "partitions": "partitions.bin",
        "firmware": "firmware.bin"
    }
}]}"#;

type MockSession = FlashSession<MockPicker, MockLoader, MockFetcher>;

struct Bench {
    session: MockSession,
    picker: MockPicker,
    loader: MockLoader,
    fetcher: MockFetcher,
    device: MockDevice,
    history: Arc<StatusHistory>,
}

fn fetcher() -> MockFetcher {
    let fetcher = MockFetcher::new();
    fetcher.respond(MANIFEST_URL, MANIFEST.as_bytes());
    fetcher.respond("https://boards.example/firmware/bootloader.bin", &[0xE9; 100]);
    fetcher.respond("https://boards.example/firmware/partitions.bin", &[0xAA; 100]);
    fetcher.respond("https://boards.example/firmware/firmware.bin", &[0x01; 100]);
    fetcher
}

fn bench() -> Bench {
    let picker = MockPicker::new();
    let loader = MockLoader::new();
    let fetcher = fetcher();
    let device = MockDevice::new("/dev/ttyUSB0", 0x10C4, 0xEA60);
    picker.queue_device(device.clone());

    let history = Arc::new(StatusHistory::new());
    let config = FlasherConfig {
        manifest_url: MANIFEST_URL.to_string(),
        ..Default::default()
    };
    let session = FlashSession::new(picker.clone(), loader.clone(), fetcher.clone(), config)
        .with_observer(history.clone());

    Bench {
        session,
        picker,
        loader,
        fetcher,
        device,
        history,
    }
}

fn wrote_images(loader: &MockLoader) -> bool {
    loader
        .calls()
        .iter()
        .any(|c| matches!(c, LoaderCall::WriteImages { .. }))
}

#[tokio::test(start_paused = true)]
async fn test_scenario_a_full_flash() {
    let mut bench = bench();
    bench.loader.script_progress(vec![
        WriteProgress { file_index: 0, written: 0, total: 100 },
        WriteProgress { file_index: 1, written: 0, total: 100 },
        WriteProgress { file_index: 2, written: 100, total: 100 },
    ]);

    bench.session.start(None).await.unwrap();

    assert_eq!(
        bench.history.progress_trace(),
        vec![0.0, 0.0, 10.0, 20.0, 20.0, 30.0, 30.0, 50.0, 90.0, 90.0, 100.0]
    );

    let stages: Vec<FlashStage> = bench.history.entries().iter().map(|s| s.stage).collect();
    let mut distinct = stages.clone();
    distinct.dedup();
    assert_eq!(
        distinct,
        vec![
            FlashStage::Connecting,
            FlashStage::Downloading,
            FlashStage::Flashing,
            FlashStage::Verifying,
            FlashStage::Complete,
        ]
    );

    let messages: Vec<String> = bench
        .history
        .entries()
        .into_iter()
        .filter(|s| s.stage == FlashStage::Flashing)
        .map(|s| s.message)
        .collect();
    assert_eq!(
        messages,
        vec![
            "Flashing firmware...",
            "Flashing part 1/3 (0%)...",
            "Flashing part 2/3 (0%)...",
            "Flashing part 3/3 (100%)...",
        ]
    );

    assert_eq!(
        bench.loader.calls(),
        vec![
            LoaderCall::OpenTransport {
                port: "/dev/ttyUSB0".into(),
                baud_rate: 921_600,
            },
            LoaderCall::Handshake,
            LoaderCall::WriteImages {
                addresses: vec![0x1000, 0x8000, 0x10000],
                lengths: vec![100, 100, 100],
            },
            LoaderCall::SetResetLine(false),
            LoaderCall::SetResetLine(true),
            LoaderCall::CloseTransport,
        ]
    );
    assert_eq!(bench.device.last_baud_rate(), Some(921_600));
    assert!(!bench.device.is_open());
    assert!(!bench.session.holds_device());
    assert!(!bench.session.holds_transport());
}

#[tokio::test]
async fn test_scenario_b_chooser_cancelled() {
    let picker = MockPicker::new();
    picker.queue_cancel();
    let loader = MockLoader::new();
    let history = Arc::new(StatusHistory::new());
    let config = FlasherConfig {
        manifest_url: MANIFEST_URL.to_string(),
        ..Default::default()
    };
    let mut session = FlashSession::new(picker, loader.clone(), fetcher(), config)
        .with_observer(history.clone());
    assert_eq!(session.status().stage, FlashStage::Idle);

    let err = session.start(None).await.unwrap_err();
    assert!(err.is_cancelled());

    let stages: Vec<FlashStage> = history.entries().iter().map(|s| s.stage).collect();
    assert_eq!(stages, vec![FlashStage::Connecting, FlashStage::Error]);
    let status = session.status();
    assert_eq!(status.message, "No device selected");
    assert_eq!(status.progress, 0.0);
    assert!(!session.holds_device());
    assert!(!session.holds_transport());
    assert!(loader.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_scenario_c_handshake_failure_then_recovery() {
    let mut bench = bench();
    bench.loader.fail_handshakes(1);
    bench.picker.queue_device(bench.device.clone());

    let err = bench.session.start(None).await.unwrap_err();
    assert!(matches!(err, FlashError::Handshake(_)));

    let status = bench.session.status();
    assert_eq!(status.stage, FlashStage::Error);
    assert_eq!(
        status.message,
        "Failed to connect to chip: Device did not respond within 3000ms"
    );
    assert!(!bench.device.is_open());
    assert_eq!(bench.device.close_count(), 1);
    assert!(!bench.session.holds_device());
    assert!(!bench.session.holds_transport());
    assert_eq!(bench.loader.calls().last(), Some(&LoaderCall::CloseTransport));

    // The same physical port must reopen cleanly.
    bench.session.start(None).await.unwrap();
    assert_eq!(bench.session.status().stage, FlashStage::Complete);
    assert_eq!(bench.device.open_count(), 2);
    assert_eq!(bench.picker.request_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_scenario_d_missing_image() {
    let mut bench = bench();
    bench
        .fetcher
        .fail_with_status("https://boards.example/firmware/firmware.bin", 404);

    let err = bench.session.start(None).await.unwrap_err();
    match err {
        FlashError::Load(LoadError::PartialFetch { asset, reason }) => {
            assert_eq!(asset, AssetKind::Application);
            assert!(reason.contains("404"));
        }
        other => panic!("unexpected error: {other:?}"),
    }

    assert!(!wrote_images(&bench.loader));
    assert_eq!(bench.session.status().stage, FlashStage::Error);
    assert!(!bench.device.is_open());
    assert!(!bench.session.holds_device());
}

#[tokio::test(start_paused = true)]
async fn test_start_rejected_mid_flight_leaves_session_untouched() {
    let mut bench = bench();
    bench.loader.stall_handshake();

    let first =
        tokio::time::timeout(Duration::from_millis(20), bench.session.start(None)).await;
    assert!(first.is_err());

    let before = bench.session.status();
    let updates_before = bench.history.entries().len();
    let err = bench.session.start(Some("1.2.0")).await.unwrap_err();

    assert!(matches!(err, FlashError::Busy(FlashStage::Connecting)));
    assert_eq!(bench.session.status(), before);
    assert_eq!(bench.history.entries().len(), updates_before);
    assert!(bench.session.holds_device());
    assert!(bench.device.is_open());
    assert_eq!(bench.picker.request_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_reset_pulse_holds_for_settle_interval() {
    let mut bench = bench();
    bench.session.start(None).await.unwrap();

    let edges = bench.loader.reset_edges();
    assert_eq!(edges.len(), 2);
    let (first, released_at) = edges[0];
    let (second, asserted_at) = edges[1];
    assert!(!first);
    assert!(second);
    assert_eq!(asserted_at - released_at, Duration::from_millis(100));
}

#[tokio::test(start_paused = true)]
async fn test_write_failure_mid_sequence() {
    let mut bench = bench();
    bench.loader.fail_write_at(1);

    let err = bench.session.start(None).await.unwrap_err();
    assert!(matches!(err, FlashError::Transfer(TransferError::Write(_))));

    let trace = bench.history.progress_trace();
    let peak = trace.iter().cloned().fold(0.0, f64::max);
    assert_eq!(peak, 50.0);
    assert_eq!(bench.session.status().progress, 0.0);
    assert!(
        !bench
            .loader
            .calls()
            .iter()
            .any(|c| matches!(c, LoaderCall::SetResetLine(_)))
    );
    assert!(!bench.device.is_open());
}

#[tokio::test(start_paused = true)]
async fn test_reset_failure_is_transfer_error() {
    let mut bench = bench();
    bench.loader.fail_reset();

    let err = bench.session.start(None).await.unwrap_err();
    assert!(matches!(err, FlashError::Transfer(TransferError::Reset(_))));
    assert!(!bench.device.is_open());
    assert!(!bench.session.holds_transport());
}

#[tokio::test(start_paused = true)]
async fn test_cleanup_failure_does_not_block_recovery() {
    let mut bench = bench();
    bench.loader.fail_handshakes(1);
    bench.loader.fail_close_transport();
    bench.picker.queue_device(bench.device.clone());

    bench.session.start(None).await.unwrap_err();
    assert!(!bench.session.holds_transport());
    assert!(!bench.device.is_open());

    bench.session.start(None).await.unwrap();
    assert_eq!(bench.session.status().stage, FlashStage::Complete);
}

#[tokio::test(start_paused = true)]
async fn test_flash_again_after_complete() {
    let mut bench = bench();
    bench.picker.queue_device(bench.device.clone());

    bench.session.start(None).await.unwrap();
    let mut rx = bench.session.subscribe();
    bench.session.start(None).await.unwrap();

    assert!(rx.has_changed().unwrap());
    assert_eq!(rx.borrow_and_update().stage, FlashStage::Complete);
    // The second session starts again from zero.
    let resets = bench
        .history
        .entries()
        .iter()
        .filter(|s| s.message == "Waiting for USB device...")
        .count();
    assert_eq!(resets, 2);
}

//! Observable session status.
//!
//! Frontends never poke at the session internals; they subscribe to a
//! single [`SessionStatus`] value published through a `watch` channel.

use std::fmt;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tracing::info;

use crate::progress::COMPLETE_PERCENT;

/// Stages of a flash session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlashStage {
    /// No session has run yet.
    #[default]
    Idle,
    /// Acquiring the device, opening the port and running the chip handshake.
    Connecting,
    /// Fetching the catalog and the firmware images.
    Downloading,
    /// The loader is writing images.
    Flashing,
    /// Write finished; pulsing the reset line and releasing the port.
    Verifying,
    /// All operations complete.
    Complete,
    /// Session failed; resources have been released.
    Error,
}

impl fmt::Display for FlashStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlashStage::Idle => write!(f, "Idle"),
            FlashStage::Connecting => write!(f, "Connecting"),
            FlashStage::Downloading => write!(f, "Downloading"),
            FlashStage::Flashing => write!(f, "Flashing"),
            FlashStage::Verifying => write!(f, "Verifying"),
            FlashStage::Complete => write!(f, "Complete"),
            FlashStage::Error => write!(f, "Error"),
        }
    }
}

impl FlashStage {
    /// Check if a session is currently running (Connecting through Verifying).
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            FlashStage::Connecting
                | FlashStage::Downloading
                | FlashStage::Flashing
                | FlashStage::Verifying
        )
    }

    /// Check if `start()` is legal from this stage.
    pub fn accepts_start(&self) -> bool {
        !self.is_in_flight()
    }

    /// Label for the action button a frontend shows in this stage.
    pub fn action_label(&self) -> &'static str {
        match self {
            FlashStage::Idle => "Connect & Flash Firmware",
            FlashStage::Connecting => "Connecting...",
            FlashStage::Downloading => "Downloading...",
            FlashStage::Flashing => "Flashing...",
            FlashStage::Verifying => "Verifying...",
            FlashStage::Complete => "Flash Complete - Flash Another",
            FlashStage::Error => "Try Again",
        }
    }
}

/// Snapshot of a session as seen by observers.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionStatus {
    pub stage: FlashStage,
    pub message: String,
    /// Overall progress, 0.0 to 100.0.
    pub progress: f64,
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self {
            stage: FlashStage::Idle,
            message: "Ready to flash".to_string(),
            progress: 0.0,
        }
    }
}

impl SessionStatus {
    /// Progress rounded for display.
    pub fn percent(&self) -> u8 {
        self.progress.round().clamp(0.0, COMPLETE_PERCENT) as u8
    }
}

/// Observer notified synchronously on every status update.
///
/// A `watch` receiver only sees the latest value; observers see each one.
pub trait StatusObserver: Send + Sync {
    fn on_status(&self, status: &SessionStatus);
}

/// Observer that keeps every status it was shown.
#[derive(Debug, Default)]
pub struct StatusHistory {
    entries: Mutex<Vec<SessionStatus>>,
}

impl StatusHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<SessionStatus> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn progress_trace(&self) -> Vec<f64> {
        self.entries().iter().map(|s| s.progress).collect()
    }
}

impl StatusObserver for StatusHistory {
    fn on_status(&self, status: &SessionStatus) {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(status.clone());
    }
}

/// Publishing side of the observable status.
///
/// `advance` never lowers progress; only `reset` (entering Connecting from a
/// resting stage, or Error) brings it back to zero.
pub struct StatusBoard {
    tx: watch::Sender<SessionStatus>,
    observers: Vec<Arc<dyn StatusObserver>>,
}

impl fmt::Debug for StatusBoard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatusBoard")
            .field("status", &*self.tx.borrow())
            .field("observers", &self.observers.len())
            .finish()
    }
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusBoard {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(SessionStatus::default());
        Self {
            tx,
            observers: Vec::new(),
        }
    }

    pub fn add_observer(&mut self, observer: Arc<dyn StatusObserver>) {
        self.observers.push(observer);
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.tx.subscribe()
    }

    pub fn snapshot(&self) -> SessionStatus {
        self.tx.borrow().clone()
    }

    pub fn stage(&self) -> FlashStage {
        self.tx.borrow().stage
    }

    /// Enter `stage` with progress back at zero.
    pub fn reset(&self, stage: FlashStage, message: impl Into<String>) {
        let message = message.into();
        self.tx.send_modify(|status| {
            log_transition(status.stage, stage);
            status.stage = stage;
            status.message = message;
            status.progress = 0.0;
        });
        self.notify();
    }

    /// Move to `stage`, raising progress to `progress` if it is higher.
    pub fn advance(&self, stage: FlashStage, message: impl Into<String>, progress: f64) {
        let message = message.into();
        self.tx.send_modify(|status| {
            log_transition(status.stage, stage);
            status.stage = stage;
            status.message = message;
            status.progress = status.progress.max(progress.min(COMPLETE_PERCENT));
        });
        self.notify();
    }

    fn notify(&self) {
        if self.observers.is_empty() {
            return;
        }
        let status = self.snapshot();
        for observer in &self.observers {
            observer.on_status(&status);
        }
    }
}

fn log_transition(from: FlashStage, to: FlashStage) {
    if from != to {
        info!(from = %from, to = %to, "Stage transition");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_flight_stages_reject_start() {
        for stage in [
            FlashStage::Connecting,
            FlashStage::Downloading,
            FlashStage::Flashing,
            FlashStage::Verifying,
        ] {
            assert!(stage.is_in_flight());
            assert!(!stage.accepts_start());
        }
        for stage in [FlashStage::Idle, FlashStage::Complete, FlashStage::Error] {
            assert!(stage.accepts_start());
        }
    }

    #[test]
    fn test_advance_never_lowers_progress() {
        let board = StatusBoard::new();
        board.advance(FlashStage::Flashing, "a", 50.0);
        board.advance(FlashStage::Flashing, "b", 40.0);
        let status = board.snapshot();
        assert_eq!(status.progress, 50.0);
        assert_eq!(status.message, "b");
    }

    #[test]
    fn test_reset_clears_progress() {
        let board = StatusBoard::new();
        board.advance(FlashStage::Flashing, "writing", 70.0);
        board.reset(FlashStage::Error, "boom");
        let status = board.snapshot();
        assert_eq!(status.stage, FlashStage::Error);
        assert_eq!(status.progress, 0.0);
    }

    #[test]
    fn test_subscribers_see_updates() {
        let board = StatusBoard::new();
        let mut rx = board.subscribe();
        board.advance(FlashStage::Connecting, "Waiting for USB device...", 0.0);
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().stage, FlashStage::Connecting);
    }

    #[test]
    fn test_observers_see_every_update() {
        let history = Arc::new(StatusHistory::new());
        let mut board = StatusBoard::new();
        board.add_observer(history.clone());

        board.reset(FlashStage::Connecting, "Waiting for USB device...");
        board.advance(FlashStage::Connecting, "Initializing chip...", 10.0);
        board.advance(FlashStage::Connecting, "Preparing flash...", 20.0);

        assert_eq!(history.progress_trace(), vec![0.0, 10.0, 20.0]);
        assert_eq!(history.entries()[1].message, "Initializing chip...");
    }

    #[test]
    fn test_percent_rounds() {
        let status = SessionStatus {
            stage: FlashStage::Flashing,
            message: String::new(),
            progress: 49.6,
        };
        assert_eq!(status.percent(), 50);
    }
}

//! Application state and logic.
//!
//! Contains the app state (Model), input handling (Controller).

use std::collections::VecDeque;
use std::sync::Arc;

use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};
use stationflash_core::device::SUPPORTED_VENDOR_IDS;
use stationflash_core::serial::list_candidates;
use stationflash_core::{Catalog, DeviceInfo, FlashStage, SessionStatus};

use crate::worker::{Command, SelectedPort, Worker};

/// Maximum log entries to keep.
const MAX_LOG_ENTRIES: usize = 1000;

/// Application state.
pub struct App {
    /// Whether to quit the application.
    pub should_quit: bool,
    /// Current focus (which pane is active).
    pub focus: Focus,
    /// Current view/tab.
    pub current_tab: Tab,
    /// Latest session status from the worker.
    pub status: SessionStatus,
    /// Firmware catalog, once loaded.
    pub catalog: Option<Arc<Catalog>>,
    pub catalog_loading: bool,
    pub version_index: usize,
    /// Candidate serial ports from the last scan.
    pub ports: Vec<DeviceInfo>,
    pub port_index: usize,
    /// A flash command was sent and its result has not come back yet.
    pub flash_pending: bool,
    /// Chip reported by the last successful flash.
    pub chip: Option<String>,
    /// Log entries.
    pub logs: VecDeque<LogEntry>,
    /// Log scroll position.
    pub log_scroll: usize,
    worker: Worker,
    selected_port: SelectedPort,
}

/// Which pane is focused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Focus {
    Versions,
    Ports,
}

/// Tab/view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tab {
    Main,
    Logs,
    Help,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// Log entry.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
    pub timestamp: String,
}

impl App {
    pub fn new(worker: Worker, selected_port: SelectedPort) -> Self {
        let status = worker.status.borrow().clone();
        let mut app = Self {
            should_quit: false,
            focus: Focus::Versions,
            current_tab: Tab::Main,
            status,
            catalog: None,
            catalog_loading: false,
            version_index: 0,
            ports: Vec::new(),
            port_index: 0,
            flash_pending: false,
            chip: None,
            logs: VecDeque::with_capacity(MAX_LOG_ENTRIES),
            log_scroll: 0,
            worker,
            selected_port,
        };
        app.request_catalog();
        app.scan_ports();
        app
    }

    pub fn is_running(&self) -> bool {
        self.flash_pending || self.status.stage.is_in_flight()
    }

    pub fn selected_port(&self) -> Option<&DeviceInfo> {
        self.ports.get(self.port_index)
    }

    fn selected_version_id(&self) -> Option<String> {
        self.catalog
            .as_ref()
            .and_then(|c| c.versions().get(self.version_index))
            .map(|v| v.version_id.clone())
    }

    /// Handle keyboard input. Returns true if app should quit.
    pub fn on_key(&mut self, key: KeyEvent) -> bool {
        // Global shortcuts
        match key.code {
            KeyCode::Char('q') | KeyCode::Char('c')
                if key.modifiers.contains(KeyModifiers::CONTROL) =>
            {
                self.should_quit = true;
                return true;
            }
            KeyCode::Esc => {
                if self.current_tab != Tab::Main {
                    self.current_tab = Tab::Main;
                    return false;
                }
                self.should_quit = true;
                return true;
            }
            KeyCode::F(1) => {
                self.current_tab = Tab::Help;
                return false;
            }
            KeyCode::F(2) => {
                self.current_tab = Tab::Logs;
                return false;
            }
            _ => {}
        }

        match self.current_tab {
            Tab::Main => self.handle_main_key(key),
            Tab::Logs => self.handle_logs_key(key),
            Tab::Help => {
                // Any key returns to main
                self.current_tab = Tab::Main;
            }
        }

        false
    }

    fn handle_main_key(&mut self, key: KeyEvent) {
        match key.code {
            KeyCode::Tab => {
                self.focus = match self.focus {
                    Focus::Versions => Focus::Ports,
                    Focus::Ports => Focus::Versions,
                };
            }
            KeyCode::Up | KeyCode::Char('k') => match self.focus {
                Focus::Versions => self.version_index = self.version_index.saturating_sub(1),
                Focus::Ports => self.port_index = self.port_index.saturating_sub(1),
            },
            KeyCode::Down | KeyCode::Char('j') => match self.focus {
                Focus::Versions => {
                    let len = self.catalog.as_ref().map_or(0, |c| c.len());
                    if self.version_index + 1 < len {
                        self.version_index += 1;
                    }
                }
                Focus::Ports => {
                    if self.port_index + 1 < self.ports.len() {
                        self.port_index += 1;
                    }
                }
            },
            KeyCode::Enter => self.start_flash(),
            KeyCode::Char('r') => self.request_catalog(),
            KeyCode::Char('p') => self.scan_ports(),
            _ => {}
        }
    }

    fn handle_logs_key(&mut self, key: KeyEvent) {
        match key.code {
            KeyCode::Up | KeyCode::Char('k') => {
                self.log_scroll = self.log_scroll.saturating_sub(1);
            }
            KeyCode::Down | KeyCode::Char('j') => {
                if self.log_scroll < self.logs.len().saturating_sub(1) {
                    self.log_scroll += 1;
                }
            }
            KeyCode::PageUp => {
                self.log_scroll = self.log_scroll.saturating_sub(10);
            }
            KeyCode::PageDown => {
                self.log_scroll = (self.log_scroll + 10).min(self.logs.len().saturating_sub(1));
            }
            KeyCode::Home => {
                self.log_scroll = 0;
            }
            KeyCode::End => {
                self.log_scroll = self.logs.len().saturating_sub(1);
            }
            _ => {}
        }
    }

    fn request_catalog(&mut self) {
        if self.catalog_loading {
            return;
        }
        self.catalog_loading = true;
        self.worker.send(Command::LoadCatalog);
    }

    fn scan_ports(&mut self) {
        match list_candidates(&SUPPORTED_VENDOR_IDS) {
            Ok(candidates) => {
                self.ports = candidates.into_iter().map(|c| c.info).collect();
                self.port_index = self.port_index.min(self.ports.len().saturating_sub(1));
                self.add_log(
                    LogLevel::Info,
                    format!("Found {} supported serial device(s)", self.ports.len()),
                );
            }
            Err(e) => {
                self.ports.clear();
                self.add_log(LogLevel::Error, format!("Port scan failed: {e}"));
            }
        }
    }

    fn start_flash(&mut self) {
        if self.is_running() {
            self.add_log(LogLevel::Warn, "A flash is already in progress");
            return;
        }

        let port = self.selected_port().map(|p| p.port_name.clone());
        self.selected_port.set(port.clone());
        let version = self.selected_version_id();
        self.add_log(
            LogLevel::Info,
            format!(
                "Flashing {} to {}",
                version.as_deref().map_or("latest".to_string(), |v| format!("v{v}")),
                port.as_deref().unwrap_or("(no device)")
            ),
        );
        self.chip = None;
        self.flash_pending = true;
        self.worker.send(Command::Flash { version });
    }

    /// Called on each tick - pick up status changes from the session.
    pub fn on_tick(&mut self) {
        if !self.worker.status.has_changed().unwrap_or(false) {
            return;
        }
        let status = self.worker.status.borrow_and_update().clone();
        if status.stage != self.status.stage {
            let level = match status.stage {
                FlashStage::Error => LogLevel::Error,
                _ => LogLevel::Info,
            };
            self.add_log(level, format!("{}: {}", status.stage, status.message));
        }
        self.status = status;
    }

    pub fn on_catalog(&mut self, result: Result<Arc<Catalog>, String>) {
        self.catalog_loading = false;
        match result {
            Ok(catalog) => {
                self.add_log(
                    LogLevel::Info,
                    format!(
                        "Loaded {} firmware version(s), latest v{}",
                        catalog.len(),
                        catalog.latest().version_id
                    ),
                );
                self.version_index = self.version_index.min(catalog.len() - 1);
                self.catalog = Some(catalog);
            }
            Err(e) => self.add_log(LogLevel::Error, e),
        }
    }

    pub fn on_flash_finished(&mut self, result: Result<Option<String>, String>) {
        // Pick up the terminal status even if no tick has run since.
        self.on_tick();
        self.flash_pending = false;
        match result {
            Ok(chip) => {
                if let Some(chip) = &chip {
                    self.add_log(LogLevel::Info, format!("Chip: {chip}"));
                }
                self.chip = chip;
            }
            Err(e) => self.add_log(LogLevel::Error, e),
        }
    }

    fn add_log(&mut self, level: LogLevel, message: impl Into<String>) {
        let now = chrono::Local::now();
        let entry = LogEntry {
            level,
            message: message.into(),
            timestamp: now.format("%H:%M:%S").to_string(),
        };

        if self.logs.len() >= MAX_LOG_ENTRIES {
            self.logs.pop_front();
        }
        self.logs.push_back(entry);

        // Auto-scroll to bottom
        self.log_scroll = self.logs.len().saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn press(app: &mut App, code: KeyCode) {
        app.on_key(KeyEvent::new(code, KeyModifiers::NONE));
    }

    fn flash_commands(rx: &mut UnboundedReceiver<Command>) -> usize {
        let mut count = 0;
        while let Ok(command) = rx.try_recv() {
            if matches!(command, Command::Flash { .. }) {
                count += 1;
            }
        }
        count
    }

    #[test]
    fn test_repeated_enter_sends_one_flash() {
        let (worker, mut commands, _status) = Worker::detached();
        let mut app = App::new(worker, SelectedPort::default());

        press(&mut app, KeyCode::Enter);
        press(&mut app, KeyCode::Enter);
        press(&mut app, KeyCode::Enter);

        assert_eq!(flash_commands(&mut commands), 1);
        assert!(app.flash_pending);
        assert!(app.is_running());
        assert_eq!(
            app.logs.back().map(|e| e.level),
            Some(LogLevel::Warn)
        );
    }

    #[test]
    fn test_enter_allowed_again_after_flash_finishes() {
        let (worker, mut commands, status) = Worker::detached();
        let mut app = App::new(worker, SelectedPort::default());

        press(&mut app, KeyCode::Enter);
        status.send_replace(SessionStatus {
            stage: FlashStage::Error,
            message: "No device selected".into(),
            progress: 0.0,
        });
        app.on_flash_finished(Err("No device selected".into()));
        assert!(!app.flash_pending);
        assert_eq!(app.status.stage, FlashStage::Error);

        press(&mut app, KeyCode::Enter);
        assert_eq!(flash_commands(&mut commands), 2);
    }

    #[test]
    fn test_enter_rejected_while_session_in_flight() {
        let (worker, mut commands, status) = Worker::detached();
        let mut app = App::new(worker, SelectedPort::default());

        status.send_replace(SessionStatus {
            stage: FlashStage::Flashing,
            message: "Flashing firmware...".into(),
            progress: 30.0,
        });
        app.on_tick();
        press(&mut app, KeyCode::Enter);

        assert_eq!(flash_commands(&mut commands), 0);
    }
}

//! StationBoard Flasher TUI
//!
//! Pick a firmware version and a serial port, then flash with live progress
//! and a log viewer.

mod app;
mod event;
mod ui;
mod worker;

use std::io;
use std::panic;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use crossterm::{
    event::{DisableMouseCapture, EnableMouseCapture, KeyEventKind},
    execute,
    terminal::{EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode},
};
use ratatui::prelude::*;
use stationflash_core::FlasherConfig;
use tracing_subscriber::prelude::*;

use app::App;
use event::{Event, EventHandler};
use worker::{SelectedPort, Worker};

const CONFIG_FILE: &str = "stationflash.toml";
const LOG_FILE: &str = "stationflash-tui.log";

fn main() -> Result<()> {
    // Setup panic hook to restore terminal on crash
    let original_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        let _ = restore_terminal();
        original_hook(panic_info);
    }));

    // Trace to a file, the terminal belongs to the UI
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(LOG_FILE)
        .with_context(|| format!("opening {LOG_FILE}"))?;
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(Mutex::new(log_file));

    tracing_subscriber::registry()
        .with(file_layer)
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = if Path::new(CONFIG_FILE).exists() {
        FlasherConfig::load_from_file(CONFIG_FILE)?
    } else {
        FlasherConfig::default()
    };

    let events = EventHandler::new(100);
    let selected_port = SelectedPort::default();
    let worker = Worker::spawn(config, selected_port.clone(), events.sender())?;

    let terminal = setup_terminal()?;
    let result = run_app(terminal, App::new(worker, selected_port), &events);
    restore_terminal()?;

    result
}

fn setup_terminal() -> Result<Terminal<CrosstermBackend<io::Stdout>>> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    let terminal = Terminal::new(backend)?;
    Ok(terminal)
}

fn restore_terminal() -> Result<()> {
    disable_raw_mode()?;
    execute!(io::stdout(), LeaveAlternateScreen, DisableMouseCapture)?;
    Ok(())
}

fn run_app(
    mut terminal: Terminal<CrosstermBackend<io::Stdout>>,
    mut app: App,
    events: &EventHandler,
) -> Result<()> {
    loop {
        terminal.draw(|frame| ui::draw(frame, &app))?;

        match events.next()? {
            Event::Tick => app.on_tick(),
            Event::Key(key) => {
                if key.kind == KeyEventKind::Press && app.on_key(key) {
                    break;
                }
            }
            Event::Resize(_, _) => {
                // Terminal resize is handled automatically by ratatui
            }
            Event::CatalogLoaded(result) => app.on_catalog(result),
            Event::FlashFinished(result) => app.on_flash_finished(result),
        }

        if app.should_quit {
            break;
        }
    }

    Ok(())
}

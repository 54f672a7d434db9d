//! Event handling for the TUI.
//!
//! Terminal input is read on a background thread. The flash worker posts its
//! results into the same channel, so the main loop has a single source.

use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use crossterm::event::{self, KeyEvent};
use stationflash_core::Catalog;

/// Events consumed by the main loop.
#[derive(Debug)]
pub enum Event {
    /// Periodic tick; the app polls session status here.
    Tick,
    /// Keyboard event.
    Key(KeyEvent),
    /// Terminal resize.
    #[allow(dead_code)]
    Resize(u16, u16),
    /// Manifest fetch finished.
    CatalogLoaded(Result<Arc<Catalog>, String>),
    /// A flash session ended. Carries the chip description on success.
    FlashFinished(Result<Option<String>, String>),
}

/// Event source fed by the input thread and the flash worker.
pub struct EventHandler {
    sender: mpsc::Sender<Event>,
    receiver: mpsc::Receiver<Event>,
}

impl EventHandler {
    /// Create a new event handler with the specified tick rate.
    pub fn new(tick_rate_ms: u64) -> Self {
        let tick_rate = Duration::from_millis(tick_rate_ms);
        let (sender, receiver) = mpsc::channel();

        let input = sender.clone();
        thread::spawn(move || {
            let mut last_tick = std::time::Instant::now();
            loop {
                let timeout = tick_rate
                    .checked_sub(last_tick.elapsed())
                    .unwrap_or(Duration::ZERO);

                if event::poll(timeout).unwrap_or(false) {
                    let forwarded = match event::read() {
                        Ok(event::Event::Key(key)) => Some(Event::Key(key)),
                        Ok(event::Event::Resize(w, h)) => Some(Event::Resize(w, h)),
                        _ => None,
                    };
                    if let Some(e) = forwarded {
                        if input.send(e).is_err() {
                            break;
                        }
                    }
                }

                if last_tick.elapsed() >= tick_rate {
                    if input.send(Event::Tick).is_err() {
                        break;
                    }
                    last_tick = std::time::Instant::now();
                }
            }
        });

        Self { sender, receiver }
    }

    /// Sender for background producers.
    pub fn sender(&self) -> mpsc::Sender<Event> {
        self.sender.clone()
    }

    /// Get the next event, blocking.
    pub fn next(&self) -> Result<Event> {
        Ok(self.receiver.recv()?)
    }
}

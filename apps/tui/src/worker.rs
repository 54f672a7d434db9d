//! Background flash worker.
//!
//! Owns the flash session on its own thread with a current-thread tokio
//! runtime. The UI sends commands and reads status through a `watch`
//! receiver; results come back as [`Event`]s.

use std::sync::{Arc, Mutex, mpsc};
use std::thread;

use anyhow::{Context, Result, anyhow};
use stationflash_core::serial::PortChooser;
use stationflash_core::{DeviceInfo, FlasherConfig, SessionStatus};
use tokio::sync::{mpsc as tokio_mpsc, watch};
use tracing::{info, warn};

use crate::event::Event;

/// Commands accepted by the worker.
#[derive(Debug)]
pub enum Command {
    LoadCatalog,
    Flash { version: Option<String> },
}

/// Port picked in the UI, read by the session's chooser.
#[derive(Debug, Clone, Default)]
pub struct SelectedPort(Arc<Mutex<Option<String>>>);

impl SelectedPort {
    pub fn set(&self, port: Option<String>) {
        *self.0.lock().unwrap_or_else(|e| e.into_inner()) = port;
    }
}

impl PortChooser for SelectedPort {
    fn choose(&self, candidates: &[DeviceInfo]) -> Option<usize> {
        let wanted = self.0.lock().unwrap_or_else(|e| e.into_inner()).clone()?;
        candidates.iter().position(|c| c.port_name == wanted)
    }
}

/// Handle to the worker thread.
pub struct Worker {
    commands: tokio_mpsc::UnboundedSender<Command>,
    pub status: watch::Receiver<SessionStatus>,
}

impl Worker {
    pub fn spawn(
        config: FlasherConfig,
        port: SelectedPort,
        events: mpsc::Sender<Event>,
    ) -> Result<Self> {
        let (commands, mut command_rx) = tokio_mpsc::unbounded_channel();
        let (status_tx, status_rx) = mpsc::channel();

        thread::Builder::new()
            .name("flash-worker".into())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        warn!(error = %e, "Failed to start worker runtime");
                        let _ = status_tx.send(Err(e.to_string()));
                        return;
                    }
                };

                let mut backend = match backend::Backend::new(config, port) {
                    Ok(backend) => backend,
                    Err(e) => {
                        let _ = status_tx.send(Err(e));
                        return;
                    }
                };
                if status_tx.send(Ok(backend.subscribe())).is_err() {
                    return;
                }

                runtime.block_on(async move {
                    while let Some(command) = command_rx.recv().await {
                        info!(?command, "Worker command");
                        let event = match command {
                            Command::LoadCatalog => Event::CatalogLoaded(backend.catalog().await),
                            Command::Flash { version } => {
                                Event::FlashFinished(backend.flash(version.as_deref()).await)
                            }
                        };
                        if events.send(event).is_err() {
                            break;
                        }
                    }
                });
            })
            .context("spawning flash worker")?;

        let status = status_rx
            .recv()
            .context("flash worker failed to start")?
            .map_err(|e| anyhow!("flash worker failed to start: {e}"))?;
        Ok(Self { commands, status })
    }

    pub fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            warn!("Flash worker has stopped");
        }
    }

    /// Worker without a thread; commands land in the returned receiver.
    #[cfg(test)]
    pub fn detached() -> (
        Self,
        tokio_mpsc::UnboundedReceiver<Command>,
        watch::Sender<SessionStatus>,
    ) {
        let (commands, command_rx) = tokio_mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(SessionStatus::default());
        (Self { commands, status }, command_rx, status_tx)
    }
}

#[cfg(feature = "espflash")]
mod backend {
    use std::sync::Arc;

    use stationflash_core::loader::espflash::{NativeFlashSession, native_session};
    use stationflash_core::{Catalog, FlasherConfig, SessionStatus};
    use tokio::sync::watch;

    use super::SelectedPort;

    pub struct Backend {
        session: NativeFlashSession<SelectedPort>,
    }

    impl Backend {
        pub fn new(config: FlasherConfig, port: SelectedPort) -> Result<Self, String> {
            let session = native_session(port, config).map_err(|e| e.to_string())?;
            Ok(Self { session })
        }

        pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
            self.session.subscribe()
        }

        pub async fn catalog(&mut self) -> Result<Arc<Catalog>, String> {
            self.session.refresh_catalog().await.map_err(|e| e.to_string())
        }

        pub async fn flash(&mut self, version: Option<&str>) -> Result<Option<String>, String> {
            if !self.session.is_supported() {
                return Err("Serial devices are not supported on this platform".into());
            }
            self.session
                .start(version)
                .await
                .map(|()| self.session.last_chip().map(|chip| chip.to_string()))
                .map_err(|e| e.to_string())
        }
    }
}

#[cfg(not(feature = "espflash"))]
mod backend {
    use std::sync::Arc;

    use stationflash_core::catalog::fetch_catalog;
    use stationflash_core::{Catalog, FlashStage, FlasherConfig, ReqwestFetcher, SessionStatus};
    use tokio::sync::watch;

    use super::SelectedPort;

    const NO_BACKEND: &str = "No loader backend compiled in; rebuild with --features espflash";

    /// Catalog browsing only; flashing reports the missing backend.
    pub struct Backend {
        config: FlasherConfig,
        fetcher: ReqwestFetcher,
        status: watch::Sender<SessionStatus>,
    }

    impl Backend {
        pub fn new(config: FlasherConfig, _port: SelectedPort) -> Result<Self, String> {
            let fetcher = ReqwestFetcher::new().map_err(|e| e.to_string())?;
            let (status, _) = watch::channel(SessionStatus::default());
            Ok(Self {
                config,
                fetcher,
                status,
            })
        }

        pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
            self.status.subscribe()
        }

        pub async fn catalog(&mut self) -> Result<Arc<Catalog>, String> {
            let url = self.config.manifest_url().map_err(|e| e.to_string())?;
            fetch_catalog(&self.fetcher, &url)
                .await
                .map(Arc::new)
                .map_err(|e| e.to_string())
        }

        pub async fn flash(&mut self, _version: Option<&str>) -> Result<Option<String>, String> {
            self.status.send_replace(SessionStatus {
                stage: FlashStage::Error,
                message: NO_BACKEND.to_string(),
                progress: 0.0,
            });
            Err(NO_BACKEND.to_string())
        }
    }
}

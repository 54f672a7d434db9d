//! Serial loader backed by the `espflash` library.
//!
//! espflash is blocking, so every call runs on tokio's blocking pool with the
//! flasher moved in and handed back afterwards.

use std::borrow::Cow;
use std::mem;

use async_trait::async_trait;
use espflash::connection::{Connection, ResetAfterOperation, ResetBeforeOperation};
use espflash::flasher::Flasher;
use espflash::image_format::Segment;
use espflash::target::ProgressCallbacks;
use serialport::SerialPort;
use tracing::{debug, info, warn};

use super::traits::{ChipInfo, LoaderError, ProgressSender, SerialLoader, WriteOptions, WriteProgress};
use crate::assets::{FlashImage, TransferEncoding};
use crate::config::FlasherConfig;
use crate::device::{DeviceHandle, Open};
use crate::http::{HttpError, ReqwestFetcher};
use crate::serial::{NativeSerialDevice, PortChooser, SerialPortPicker};
use crate::session::FlashSession;

/// Session over host serial ports, espflash and HTTP.
pub type NativeFlashSession<C> = FlashSession<SerialPortPicker<C>, EspflashLoader, ReqwestFetcher>;

/// Build a session for real hardware.
pub fn native_session<C: PortChooser>(
    chooser: C,
    config: FlasherConfig,
) -> Result<NativeFlashSession<C>, HttpError> {
    Ok(FlashSession::new(
        SerialPortPicker::new(chooser),
        EspflashLoader::new(),
        ReqwestFetcher::new()?,
        config,
    ))
}

#[derive(Debug, Default, Clone, Copy)]
pub struct EspflashLoader;

impl EspflashLoader {
    pub fn new() -> Self {
        Self
    }
}

enum LinkState {
    /// Port wrapped, ROM not yet synced.
    Connected(Box<Connection>),
    /// Synced with the ROM bootloader (stub loaded).
    Synced(Box<Flasher>),
    /// Moved out for a blocking call, or lost after a failed one.
    Detached,
}

/// espflash transport over a port taken from a [`NativeSerialDevice`].
pub struct EspflashLink {
    state: LinkState,
}

impl EspflashLink {
    async fn with_flasher<R, F>(&mut self, op: F) -> Result<R, LoaderError>
    where
        R: Send + 'static,
        F: FnOnce(&mut Flasher) -> Result<R, LoaderError> + Send + 'static,
    {
        let LinkState::Synced(mut flasher) = mem::replace(&mut self.state, LinkState::Detached)
        else {
            return Err(LoaderError::Protocol("chip handshake has not completed".into()));
        };

        let (flasher, result) = tokio::task::spawn_blocking(move || {
            let result = op(&mut flasher);
            (flasher, result)
        })
        .await
        .map_err(|e| LoaderError::Protocol(format!("loader task failed: {e}")))?;

        self.state = LinkState::Synced(flasher);
        result
    }
}

fn protocol_error(e: espflash::Error) -> LoaderError {
    LoaderError::Protocol(e.to_string())
}

/// Forwards espflash progress callbacks into the session's channel.
struct ChannelProgress {
    tx: ProgressSender,
    file_index: Option<usize>,
    total: u64,
}

impl ChannelProgress {
    fn new(tx: ProgressSender) -> Self {
        Self {
            tx,
            file_index: None,
            total: 0,
        }
    }
}

impl ProgressCallbacks for ChannelProgress {
    fn init(&mut self, addr: u32, total: usize) {
        let file_index = self.file_index.map_or(0, |i| i + 1);
        debug!(file_index, addr = format_args!("0x{addr:X}"), total, "Segment write started");
        self.file_index = Some(file_index);
        self.total = total as u64;
        let _ = self.tx.send(WriteProgress {
            file_index,
            written: 0,
            total: self.total,
        });
    }

    fn update(&mut self, current: usize) {
        let _ = self.tx.send(WriteProgress {
            file_index: self.file_index.unwrap_or(0),
            written: current as u64,
            total: self.total,
        });
    }

    fn verifying(&mut self) {}

    fn finish(&mut self, skipped: bool) {
        if skipped {
            debug!(file_index = ?self.file_index, "Segment already up to date");
        }
        let _ = self.tx.send(WriteProgress {
            file_index: self.file_index.unwrap_or(0),
            written: self.total,
            total: self.total,
        });
    }
}

#[async_trait]
impl SerialLoader for EspflashLoader {
    type Device = NativeSerialDevice;
    type Transport = EspflashLink;

    fn encoding(&self) -> TransferEncoding {
        TransferEncoding::Raw
    }

    async fn open_transport(
        &self,
        device: &mut DeviceHandle<NativeSerialDevice, Open>,
        baud_rate: u32,
    ) -> Result<EspflashLink, LoaderError> {
        let device = device.device_mut();
        let usb_info = device.usb_info().clone();
        let port = device.take_port().ok_or(LoaderError::Disconnected)?;

        let connection = Connection::new(
            port,
            usb_info,
            ResetAfterOperation::NoReset,
            ResetBeforeOperation::DefaultReset,
            baud_rate,
        );
        Ok(EspflashLink {
            state: LinkState::Connected(Box::new(connection)),
        })
    }

    async fn handshake(&self, transport: &mut EspflashLink) -> Result<ChipInfo, LoaderError> {
        let LinkState::Connected(connection) =
            mem::replace(&mut transport.state, LinkState::Detached)
        else {
            return Err(LoaderError::Protocol("transport already synced".into()));
        };

        let flasher = tokio::task::spawn_blocking(move || {
            Flasher::connect(*connection, true, true, true, None, None)
        })
        .await
        .map_err(|e| LoaderError::Protocol(format!("loader task failed: {e}")))?
        .map_err(protocol_error)?;
        transport.state = LinkState::Synced(Box::new(flasher));

        let info = transport
            .with_flasher(|flasher| flasher.device_info().map_err(protocol_error))
            .await?;
        Ok(ChipInfo {
            chip: info.chip.to_string(),
            mac_address: None,
            features: info.features.iter().map(|f| f.to_string()).collect(),
        })
    }

    async fn write_images(
        &self,
        transport: &mut EspflashLink,
        images: &[FlashImage],
        options: &WriteOptions,
        progress: ProgressSender,
    ) -> Result<(), LoaderError> {
        if !options.compress {
            warn!("espflash always compresses with the stub loader; ignoring compress = false");
        }
        debug!(
            mode = %options.flash_mode,
            freq = %options.flash_freq,
            size = %options.flash_size,
            "Images are written as built; header fields untouched"
        );

        let erase_all = options.erase_all;
        let segments: Vec<(u32, bytes::Bytes)> =
            images.iter().map(|i| (i.address, i.data.clone())).collect();

        transport
            .with_flasher(move |flasher| {
                if erase_all {
                    info!("Erasing entire flash");
                    flasher.erase_flash().map_err(protocol_error)?;
                }
                let segments: Vec<Segment<'_>> = segments
                    .iter()
                    .map(|(addr, data)| Segment {
                        addr: *addr,
                        data: Cow::Borrowed(&data[..]),
                    })
                    .collect();
                let mut callbacks = ChannelProgress::new(progress);
                flasher
                    .write_bins_to_flash(&segments, &mut callbacks)
                    .map_err(protocol_error)
            })
            .await
    }

    async fn set_reset_line(
        &self,
        transport: &mut EspflashLink,
        asserted: bool,
    ) -> Result<(), LoaderError> {
        transport
            .with_flasher(move |flasher| {
                flasher
                    .connection()
                    .serial_port_mut()
                    .write_data_terminal_ready(asserted)
                    .map_err(|e| LoaderError::Io(e.into()))
            })
            .await
    }

    async fn close_transport(&self, transport: EspflashLink) -> Result<(), LoaderError> {
        // Dropping the connection closes the native port.
        tokio::task::spawn_blocking(move || drop(transport))
            .await
            .map_err(|e| LoaderError::Protocol(format!("loader task failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::{ProgressAggregator, TRANSFER_END_PERCENT};
    use tokio::sync::mpsc;

    fn drain(rx: &mut mpsc::UnboundedReceiver<WriteProgress>) -> Vec<WriteProgress> {
        let mut updates = Vec::new();
        while let Ok(update) = rx.try_recv() {
            updates.push(update);
        }
        updates
    }

    #[test]
    fn test_segments_map_to_file_indices() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut callbacks = ChannelProgress::new(tx);

        for (addr, len) in [(0x1000u32, 400usize), (0x8000, 100), (0x10000, 800)] {
            callbacks.init(addr, len);
            callbacks.update(len / 2);
            callbacks.finish(false);
        }

        let updates = drain(&mut rx);
        let indices: Vec<usize> = updates.iter().map(|u| u.file_index).collect();
        assert_eq!(indices, vec![0, 0, 0, 1, 1, 1, 2, 2, 2]);
        assert_eq!(
            updates[3],
            WriteProgress { file_index: 1, written: 0, total: 100 }
        );
        assert_eq!(
            updates[8],
            WriteProgress { file_index: 2, written: 800, total: 800 }
        );
    }

    #[test]
    fn test_skipped_segment_counts_as_written() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut callbacks = ChannelProgress::new(tx);

        callbacks.init(0x1000, 256);
        callbacks.finish(true);

        assert_eq!(
            drain(&mut rx),
            vec![
                WriteProgress { file_index: 0, written: 0, total: 256 },
                WriteProgress { file_index: 0, written: 256, total: 256 },
            ]
        );
    }

    #[test]
    fn test_aggregated_percent_never_decreases() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut callbacks = ChannelProgress::new(tx);

        for (i, len) in [4096usize, 3072, 65536].into_iter().enumerate() {
            callbacks.init(0x1000 * (i as u32 + 1), len);
            for written in (0..=len).step_by(1024) {
                callbacks.update(written);
            }
            callbacks.verifying();
            callbacks.finish(i == 1);
        }

        let mut aggregator = ProgressAggregator::new(3);
        let percents: Vec<f64> = drain(&mut rx)
            .into_iter()
            .map(|update| aggregator.update(update))
            .collect();
        assert!(percents.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(percents.last().copied(), Some(TRANSFER_END_PERCENT));
    }
}

//! `flash` command.

#[cfg(not(feature = "espflash"))]
pub async fn run(
    _config: stationflash_core::FlasherConfig,
    _version: Option<String>,
    _port: Option<String>,
) -> anyhow::Result<()> {
    anyhow::bail!("no loader backend compiled in; rebuild with --features espflash")
}

#[cfg(feature = "espflash")]
pub use backend::run;

#[cfg(feature = "espflash")]
mod backend {
    use std::io::{self, BufRead, Write};
    use std::sync::Arc;

    use anyhow::{Result, bail};
    use indicatif::{ProgressBar, ProgressStyle};
    use stationflash_core::loader::espflash::native_session;
    use stationflash_core::serial::{NamedPort, PortChooser};
    use stationflash_core::{DeviceInfo, FlasherConfig, SessionStatus, StatusObserver};

    /// Mirrors session status onto a progress bar.
    struct BarObserver {
        bar: ProgressBar,
    }

    impl StatusObserver for BarObserver {
        fn on_status(&self, status: &SessionStatus) {
            self.bar.set_position(status.percent() as u64);
            self.bar.set_message(status.message.clone());
        }
    }

    /// Numbered prompt on stdin.
    struct StdinChooser {
        bar: ProgressBar,
    }

    impl PortChooser for StdinChooser {
        fn choose(&self, candidates: &[DeviceInfo]) -> Option<usize> {
            if candidates.is_empty() {
                self.bar
                    .suspend(|| eprintln!("No supported USB serial device found."));
                return None;
            }
            self.bar.suspend(|| prompt(candidates))
        }
    }

    fn prompt(candidates: &[DeviceInfo]) -> Option<usize> {
        println!("Select a device:");
        for (i, info) in candidates.iter().enumerate() {
            println!("  [{}] {}", i + 1, info);
        }
        print!("Device number (empty to cancel): ");
        io::stdout().flush().ok()?;

        let mut line = String::new();
        io::stdin().lock().read_line(&mut line).ok()?;
        let choice: usize = line.trim().parse().ok()?;
        (1..=candidates.len()).contains(&choice).then(|| choice - 1)
    }

    pub async fn run(config: FlasherConfig, version: Option<String>, port: Option<String>) -> Result<()> {
        let bar = ProgressBar::new(100);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos:>3}% {msg}")?
                .progress_chars("#>-"),
        );

        match port {
            Some(port) => flash_with(NamedPort(port), config, version, bar).await,
            None => {
                let chooser = StdinChooser { bar: bar.clone() };
                flash_with(chooser, config, version, bar).await
            }
        }
    }

    async fn flash_with<C: PortChooser>(
        chooser: C,
        config: FlasherConfig,
        version: Option<String>,
        bar: ProgressBar,
    ) -> Result<()> {
        let mut session = native_session(chooser, config)?
            .with_observer(Arc::new(BarObserver { bar: bar.clone() }));
        if !session.is_supported() {
            bail!("Serial devices are not supported on this platform");
        }

        match session.start(version.as_deref()).await {
            Ok(()) => {
                bar.finish_with_message(session.status().message);
                if let Some(chip) = session.last_chip() {
                    println!("Chip: {chip}");
                }
                Ok(())
            }
            Err(e) => {
                bar.abandon_with_message(e.to_string());
                Err(e.into())
            }
        }
    }
}

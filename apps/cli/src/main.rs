use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use stationflash_core::assets::load_assets;
use stationflash_core::catalog::fetch_catalog;
use stationflash_core::config::ConfigOverrides;
use stationflash_core::device::SUPPORTED_VENDOR_IDS;
use stationflash_core::serial::list_candidates;
use stationflash_core::{FlasherConfig, ReqwestFetcher};
use tracing::info;

mod flash;

#[derive(Parser, Debug)]
#[command(author, version, about = "StationBoard firmware flasher", long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Version manifest URL (overrides the config file)
    #[arg(long, global = true)]
    manifest_url: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List available firmware versions, latest first
    Versions,

    /// List serial ports from supported USB-serial bridges
    Ports,

    /// Download a version's images for manual flashing
    Download {
        /// Version to download (default: latest)
        #[arg(long)]
        version: Option<String>,

        /// Output directory
        #[arg(short, long, default_value = ".")]
        out: PathBuf,
    },

    /// Flash a board
    Flash {
        /// Version to flash (default: latest)
        #[arg(long)]
        version: Option<String>,

        /// Serial port to use instead of prompting
        #[arg(short, long)]
        port: Option<String>,

        /// Erase the whole flash before writing
        #[arg(long)]
        erase_all: bool,

        /// Send images uncompressed
        #[arg(long)]
        no_compress: bool,

        #[arg(long)]
        flash_mode: Option<String>,

        #[arg(long)]
        flash_freq: Option<String>,

        #[arg(long)]
        flash_size: Option<String>,
    },

    /// Write the default configuration to a file
    InitConfig {
        #[arg(default_value = "stationflash.toml")]
        path: PathBuf,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")?;

    let config = match &args.config {
        Some(path) => FlasherConfig::load_from_file(path)?,
        None => FlasherConfig::default(),
    };
    let config = config.merge(ConfigOverrides {
        manifest_url: args.manifest_url.clone(),
        ..Default::default()
    });

    match args.command {
        Command::Versions => versions(&config).await,
        Command::Ports => ports(),
        Command::Download { version, out } => download(&config, version.as_deref(), &out).await,
        Command::Flash {
            version,
            port,
            erase_all,
            no_compress,
            flash_mode,
            flash_freq,
            flash_size,
        } => {
            let config = config.merge(ConfigOverrides {
                erase_all: erase_all.then_some(true),
                compress: no_compress.then_some(false),
                flash_mode,
                flash_freq,
                flash_size,
                ..Default::default()
            });
            flash::run(config, version, port).await
        }
        Command::InitConfig { path } => {
            config.save_to_file(&path)?;
            println!("Wrote {}", path.display());
            Ok(())
        }
    }
}

async fn versions(config: &FlasherConfig) -> Result<()> {
    let url = config.manifest_url()?;
    let catalog = fetch_catalog(&ReqwestFetcher::new()?, &url).await?;

    for (i, version) in catalog.versions().iter().enumerate() {
        let tag = if i == 0 { "  (Latest)" } else { "" };
        println!("v{}  {}{}", version.version_id, version.release_date, tag);
        for change in &version.change_notes {
            println!("    - {change}");
        }
    }
    Ok(())
}

fn ports() -> Result<()> {
    let candidates =
        list_candidates(&SUPPORTED_VENDOR_IDS).context("Failed to enumerate serial ports")?;
    if candidates.is_empty() {
        println!("No supported serial devices found.");
        return Ok(());
    }
    for candidate in &candidates {
        println!("{}", candidate.info);
    }
    Ok(())
}

async fn download(config: &FlasherConfig, version: Option<&str>, out: &Path) -> Result<()> {
    let fetcher = ReqwestFetcher::new()?;
    let url = config.manifest_url()?;
    let catalog = fetch_catalog(&fetcher, &url).await?;
    let selected = catalog.select_version(version);
    if let Some(requested) = version.filter(|v| !selected.matches(v)) {
        println!(
            "Version {requested} not found, using latest (v{})",
            selected.version_id
        );
    }

    let assets = load_assets(&fetcher, selected).await?;
    std::fs::create_dir_all(out).with_context(|| format!("creating {}", out.display()))?;
    for asset in &assets {
        let name = format!(
            "stationboard-v{}-{}.bin",
            selected.version_id,
            asset.kind.file_stem()
        );
        let path = out.join(name);
        std::fs::write(&path, &asset.bytes)
            .with_context(|| format!("writing {}", path.display()))?;
        info!(path = %path.display(), address = %format!("0x{:X}", asset.flash_address), "Saved");
        println!("0x{:05X}  {}", asset.flash_address, path.display());
    }
    Ok(())
}

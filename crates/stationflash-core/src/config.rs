//! Flasher configuration, persisted as TOML.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::loader::WriteOptions;

pub const DEFAULT_MANIFEST_URL: &str = "http://localhost:3000/firmware/versions.json";

/// Configuration for a flash session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlasherConfig {
    /// Version manifest location. Image paths resolve relative to it.
    pub manifest_url: String,
    /// Erase the whole flash before writing.
    pub erase_all: bool,
    /// Compress images on the wire.
    pub compress: bool,
    pub flash_mode: String,
    pub flash_freq: String,
    pub flash_size: String,
}

impl Default for FlasherConfig {
    fn default() -> Self {
        let options = WriteOptions::default();
        Self {
            manifest_url: DEFAULT_MANIFEST_URL.to_string(),
            erase_all: options.erase_all,
            compress: options.compress,
            flash_mode: options.flash_mode,
            flash_freq: options.flash_freq,
            flash_size: options.flash_size,
        }
    }
}

/// Command-line overrides. `None` keeps the configured value.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub manifest_url: Option<String>,
    pub erase_all: Option<bool>,
    pub compress: Option<bool>,
    pub flash_mode: Option<String>,
    pub flash_freq: Option<String>,
    pub flash_size: Option<String>,
}

impl FlasherConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: FlasherConfig = toml::from_str(&content)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Parsed manifest location.
    pub fn manifest_url(&self) -> Result<Url, url::ParseError> {
        Url::parse(&self.manifest_url)
    }

    /// Apply command-line overrides on top of this configuration.
    pub fn merge(mut self, overrides: ConfigOverrides) -> Self {
        if let Some(url) = overrides.manifest_url {
            self.manifest_url = url;
        }
        if let Some(erase_all) = overrides.erase_all {
            self.erase_all = erase_all;
        }
        if let Some(compress) = overrides.compress {
            self.compress = compress;
        }
        if let Some(mode) = overrides.flash_mode {
            self.flash_mode = mode;
        }
        if let Some(freq) = overrides.flash_freq {
            self.flash_freq = freq;
        }
        if let Some(size) = overrides.flash_size {
            self.flash_size = size;
        }
        self
    }

    /// Options handed to the loader's write call.
    pub fn write_options(&self) -> WriteOptions {
        WriteOptions {
            erase_all: self.erase_all,
            compress: self.compress,
            flash_mode: self.flash_mode.clone(),
            flash_freq: self.flash_freq.clone(),
            flash_size: self.flash_size.clone(),
        }
    }
}

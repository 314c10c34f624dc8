//! Configuration
//!
//! Loads configuration from TOML file at `~/.config/kasane/config.toml`
//! unless another path is given on the command line. A default file is
//! written on first run.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub compositor: CompositorConfig,
    pub control: ControlConfig,
}

impl Config {
    /// Load configuration from `path` (or the default location)
    ///
    /// A missing file yields defaults, a malformed one is an error.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = match path {
            Some(path) => path,
            None => Self::config_path()?,
        };

        if !config_path.exists() {
            info!("Config file not found at {:?}, using defaults", config_path);
            if let Err(e) = Self::save_default(&config_path) {
                warn!("Failed to create default config file: {:#}", e);
            }
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file {:?}", config_path))?;
        let config = Self::parse(&content)
            .with_context(|| format!("Failed to parse config file {:?}", config_path))?;

        info!("Configuration loaded from {:?}", config_path);
        debug!("Config: {:?}", config);
        Ok(config)
    }

    fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Get the path to the config file
    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get config directory")?
            .join(env!("CARGO_PKG_NAME"));

        Ok(config_dir.join("config.toml"))
    }

    /// Save default configuration to file
    fn save_default(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let toml_string = toml::to_string_pretty(&Self::default())
            .context("Failed to serialize default config")?;
        fs::write(path, toml_string).context("Failed to write default config file")?;

        info!("Created default config file at {:?}", path);
        Ok(())
    }
}

/// Compositor configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompositorConfig {
    /// Built-in plugins to load, in registration order
    pub plugins: Vec<String>,
    /// Pace frames on the display vertical blank
    pub vsync: bool,
    /// DRM device used to wait for vertical blanks
    pub drm_device: PathBuf,
    /// Fill when the root window has no background pixmap (hex: 0xRRGGBB)
    pub background_color: u32,
}

impl Default for CompositorConfig {
    fn default() -> Self {
        Self {
            plugins: vec!["opacity".to_string()],
            vsync: true,
            drm_device: PathBuf::from("/dev/dri/card0"),
            background_color: 0x2e3440,
        }
    }
}

/// Control channel configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Serve plugin control messages on the session bus
    pub dbus: bool,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self { dbus: true }
    }
}

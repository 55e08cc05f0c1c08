//! Configuration for the scene compositor
//!
//! Loads configuration from TOML file at `~/.config/area/scene.toml`.
//! Auto-generates default config file on first run if missing.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::compositor::backend::{BackendKind, SwapStrategy};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub compositor: CompositorConfig,
    pub decorations: DecorationConfig,
    pub shadow: ShadowConfig,
}

impl Config {
    /// Load configuration from file, or use defaults if file doesn't exist.
    /// Environment overrides are applied on top.
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;
        let mut config = Self::load_from(&config_path)?;
        config.apply_env(|key| std::env::var(key).ok());
        debug!("Config: {:?}", config);
        Ok(config)
    }

    fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!("Config file not found at {:?}, using defaults", path);
            if let Err(e) = Self::save_default(path) {
                warn!("Failed to create default config file: {}", e);
            }
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).context("Failed to read config file")?;
        let config = Self::parse(&content)?;
        info!("Configuration loaded from {:?}", path);
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse config file")
    }

    /// `AREA_EXPLICIT_SYNC=0` and `AREA_USE_BUFFER_AGE=0` switch the
    /// respective feature off
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        let disabled = |key: &str| var(key).is_some_and(|v| v.trim() == "0");
        if disabled("AREA_EXPLICIT_SYNC") {
            info!("Explicit sync disabled by AREA_EXPLICIT_SYNC");
            self.compositor.explicit_sync = false;
        }
        if disabled("AREA_USE_BUFFER_AGE") {
            info!("Buffer age disabled by AREA_USE_BUFFER_AGE");
            self.compositor.buffer_age = false;
        }
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get config directory")?
            .join("area");

        Ok(config_dir.join("scene.toml"))
    }

    fn save_default(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let toml_string =
            toml::to_string_pretty(&Self::default()).context("Failed to serialize default config")?;
        fs::write(path, toml_string).context("Failed to write default config file")?;

        info!("Created default config file at {:?}", path);
        Ok(())
    }
}

/// Compositor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompositorConfig {
    /// Backends in order of preference
    pub backends: Vec<BackendKind>,
    pub swap_strategy: SwapStrategy,
    /// Synchronize with the X server through fences
    pub explicit_sync: bool,
    /// Use buffer age to repaint only what a reused back buffer is missing
    pub buffer_age: bool,
    /// Repaint timer frequency in Hz
    pub refresh_rate: u32,
    pub vsync: bool,
}

impl Default for CompositorConfig {
    fn default() -> Self {
        Self {
            backends: BackendKind::FALLBACK_ORDER.to_vec(),
            swap_strategy: SwapStrategy::default(),
            explicit_sync: true,
            buffer_age: true,
            refresh_rate: 60,
            vsync: true,
        }
    }
}

/// Built-in decoration painter
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecorationConfig {
    /// Draw decorations around managed windows
    pub enabled: bool,
    /// Decoration render worker threads; 0 renders on the main thread
    pub threads: usize,
    pub titlebar_height: u16,
    pub border_width: u16,
    /// Titlebar color (hex: 0xAARRGGBB)
    pub titlebar: u32,
    /// Border color (hex: 0xAARRGGBB)
    pub border: u32,
}

impl Default for DecorationConfig {
    fn default() -> Self {
        // Nord colors
        Self {
            enabled: false,
            threads: 2,
            titlebar_height: 32,
            border_width: 2,
            titlebar: 0xff3b4252,
            border: 0xff5e81ac,
        }
    }
}

/// Built-in shadow for windows without a shadow property
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShadowConfig {
    pub enabled: bool,
    /// Tile edge length in pixels
    pub size: i32,
    /// Offsets of the shadow outside the window
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
    pub left: i32,
    /// Darkest alpha at the window edge
    pub strength: u8,
}

impl Default for ShadowConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            size: 16,
            top: 8,
            right: 12,
            bottom: 16,
            left: 12,
            strength: 0x60,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.compositor.backends, BackendKind::FALLBACK_ORDER.to_vec());
        assert_eq!(config.compositor.swap_strategy, SwapStrategy::ExtendDamage);
        assert!(config.compositor.explicit_sync);
        assert!(config.compositor.buffer_age);
        assert_eq!(config.compositor.refresh_rate, 60);
        assert_eq!(config.decorations.threads, 2);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = Config::parse(
            r#"
            [compositor]
            backends = ["xrender", "raster"]
            swap_strategy = "copy_front_buffer"
            "#,
        )
        .unwrap();
        assert_eq!(config.compositor.backends, vec![BackendKind::XRender, BackendKind::Raster]);
        assert_eq!(config.compositor.swap_strategy, SwapStrategy::CopyFrontBuffer);
        assert_eq!(config.compositor.refresh_rate, 60);
        assert!(config.shadow.enabled);
    }

    #[test]
    fn test_unknown_backend_is_rejected() {
        assert!(Config::parse("[compositor]\nbackends = [\"vulkan\"]\n").is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config.apply_env(|key| match key {
            "AREA_EXPLICIT_SYNC" => Some("0".into()),
            "AREA_USE_BUFFER_AGE" => Some("1".into()),
            _ => None,
        });
        assert!(!config.compositor.explicit_sync);
        assert!(config.compositor.buffer_age);
    }

    #[test]
    fn test_default_round_trips_through_toml() {
        let text = toml::to_string_pretty(&Config::default()).unwrap();
        let parsed = Config::parse(&text).unwrap();
        assert_eq!(parsed.compositor.backends, Config::default().compositor.backends);
    }
}

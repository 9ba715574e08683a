//! Settings - every fixed constant of the generator in one place
//!
//! Layered: built-in defaults, then an optional TOML file, then
//! `STOREPRINT__*` environment variables.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Expected template frame size, at 100 DPI (exported ×3 for 300 DPI).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameSpec {
    pub width: u32,
    pub height: u32,
    pub physical: String,
    pub name: String,
}

impl FrameSpec {
    fn new(width: u32, height: u32, physical: &str, name: &str) -> Self {
        Self {
            width,
            height,
            physical: physical.to_string(),
            name: name.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameSizes {
    pub poster: FrameSpec,
    pub flyer: FrameSpec,
    pub sticker: FrameSpec,
}

impl Default for FrameSizes {
    fn default() -> Self {
        Self {
            poster: FrameSpec::new(1654, 2339, "420×594mm", "A2 Poster"),
            flyer: FrameSpec::new(591, 835, "150×212mm (with bleed)", "A5 Flyer"),
            sticker: FrameSpec::new(174, 174, "44×44mm (with bleed)", "44mm Sticker"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QrSettings {
    pub timeout_ms: u64,
    /// Case-insensitive name marker of the placeholder frame.
    pub marker: String,
    pub default_color: String,
}

impl Default for QrSettings {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            marker: "qrcode_here".to_string(),
            default_color: "#000000".to_string(),
        }
    }
}

impl QrSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportSettings {
    pub scale: f64,
    pub delay_ms: u64,
}

impl Default for ExportSettings {
    fn default() -> Self {
        Self {
            scale: 3.0,
            delay_ms: 100,
        }
    }
}

impl ExportSettings {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ContainerSpacing {
    pub item_spacing: f64,
    pub padding: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LayoutSettings {
    pub run: ContainerSpacing,
    pub brand: ContainerSpacing,
}

impl Default for LayoutSettings {
    fn default() -> Self {
        Self {
            run: ContainerSpacing {
                item_spacing: 40.0,
                padding: 40.0,
            },
            brand: ContainerSpacing {
                item_spacing: 20.0,
                padding: 20.0,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub frames: FrameSizes,
    /// Allowed deviation in whole units on each axis.
    pub size_tolerance: u32,
    pub qr: QrSettings,
    pub export: ExportSettings,
    pub layout: LayoutSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            frames: FrameSizes::default(),
            size_tolerance: 1,
            qr: QrSettings::default(),
            export: ExportSettings::default(),
            layout: LayoutSettings::default(),
        }
    }
}

impl Settings {
    pub fn load(path: Option<&Path>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&Settings::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("STOREPRINT")
                .prefix_separator("__")
                .separator("__"),
        );

        builder.build()?.try_deserialize()
    }
}

//! Configuration types for text2image rendering.

use crate::error::{Result, Text2ImageError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Canvas used when `Resolution::Auto` has no custom dimensions.
pub const DEFAULT_CANVAS_WIDTH: u32 = 800;
pub const DEFAULT_CANVAS_HEIGHT: u32 = 600;

/// Largest accepted canvas side in pixels. Covers every preset (8K is
/// 7680 wide) and keeps one RGBA canvas within 1 GiB.
pub const MAX_CANVAS_DIMENSION: u32 = 16_384;

/// Output resolution presets.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Resolution {
    /// Use the custom dimensions, or the default canvas.
    #[default]
    #[serde(rename = "auto")]
    Auto = 0,
    /// 1280x720
    #[serde(rename = "720p")]
    P720 = 1,
    /// 1920x1080
    #[serde(rename = "1080p")]
    P1080 = 2,
    /// 2560x1440
    #[serde(rename = "2k")]
    K2 = 3,
    /// 3840x2160
    #[serde(rename = "4k")]
    K4 = 4,
    /// 7680x4320
    #[serde(rename = "8k")]
    K8 = 5,
}

impl Resolution {
    /// Pixel dimensions of a preset; `None` for `Auto`.
    pub fn dimensions(self) -> Option<(u32, u32)> {
        match self {
            Resolution::Auto => None,
            Resolution::P720 => Some((1280, 720)),
            Resolution::P1080 => Some((1920, 1080)),
            Resolution::K2 => Some((2560, 1440)),
            Resolution::K4 => Some((3840, 2160)),
            Resolution::K8 => Some((7680, 4320)),
        }
    }
}

impl TryFrom<i32> for Resolution {
    type Error = Text2ImageError;

    fn try_from(value: i32) -> Result<Self> {
        Ok(match value {
            0 => Resolution::Auto,
            1 => Resolution::P720,
            2 => Resolution::P1080,
            3 => Resolution::K2,
            4 => Resolution::K4,
            5 => Resolution::K8,
            other => {
                return Err(Text2ImageError::InvalidArgument(format!(
                    "unknown resolution {}",
                    other
                )))
            }
        })
    }
}

/// Encoded output formats. `Jpeg`, `Tiff` and `Heic` also answer to their
/// short aliases (`jpg`, `tif`, `heif`).
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    #[default]
    Png = 0,
    #[serde(alias = "jpg")]
    Jpeg = 1,
    Webp = 2,
    Bmp = 3,
    #[serde(alias = "tif")]
    Tiff = 4,
    #[serde(alias = "heif")]
    Heic = 5,
    Avif = 6,
}

impl ImageFormat {
    /// Look up a format by file extension, case-insensitively.
    pub fn from_extension(ext: &str) -> Option<Self> {
        let ext = ext.trim_start_matches('.').to_ascii_lowercase();
        Some(match ext.as_str() {
            "png" => ImageFormat::Png,
            "jpg" | "jpeg" => ImageFormat::Jpeg,
            "webp" => ImageFormat::Webp,
            "bmp" => ImageFormat::Bmp,
            "tif" | "tiff" => ImageFormat::Tiff,
            "heic" | "heif" => ImageFormat::Heic,
            "avif" => ImageFormat::Avif,
            _ => return None,
        })
    }

    /// Canonical file extension.
    pub fn extension(self) -> &'static str {
        match self {
            ImageFormat::Png => "png",
            ImageFormat::Jpeg => "jpg",
            ImageFormat::Webp => "webp",
            ImageFormat::Bmp => "bmp",
            ImageFormat::Tiff => "tiff",
            ImageFormat::Heic => "heic",
            ImageFormat::Avif => "avif",
        }
    }
}

impl TryFrom<i32> for ImageFormat {
    type Error = Text2ImageError;

    fn try_from(value: i32) -> Result<Self> {
        Ok(match value {
            0 => ImageFormat::Png,
            1 => ImageFormat::Jpeg,
            2 => ImageFormat::Webp,
            3 => ImageFormat::Bmp,
            4 => ImageFormat::Tiff,
            5 => ImageFormat::Heic,
            6 => ImageFormat::Avif,
            other => {
                return Err(Text2ImageError::InvalidArgument(format!(
                    "unknown image format {}",
                    other
                )))
            }
        })
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// How the canvas background is painted.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackgroundType {
    #[default]
    Solid = 0,
    Image = 1,
}

impl TryFrom<i32> for BackgroundType {
    type Error = Text2ImageError;

    fn try_from(value: i32) -> Result<Self> {
        match value {
            0 => Ok(BackgroundType::Solid),
            1 => Ok(BackgroundType::Image),
            other => Err(Text2ImageError::InvalidArgument(format!(
                "unknown background type {}",
                other
            ))),
        }
    }
}

/// Per-task render options.
///
/// A task copies its options at creation, so changing a caller's instance
/// afterwards never affects an in-flight render.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderOptions {
    /// Output resolution preset.
    pub resolution: Resolution,

    /// Output encoding.
    pub format: ImageFormat,

    /// Encoder quality (0-100). Only lossy formats use it.
    /// Default: 90.
    pub quality: u8,

    /// Canvas width when `resolution` is `Auto` (0 = default).
    pub custom_width: u32,

    /// Canvas height when `resolution` is `Auto` (0 = default).
    pub custom_height: u32,

    /// Background kind.
    pub background_type: BackgroundType,

    /// Background colour, ARGB.
    /// Default: opaque white.
    pub background_color: u32,

    /// Background image path, required for `BackgroundType::Image`.
    pub background_image: Option<PathBuf>,

    /// Background blur amount (0-100).
    pub background_blur: f32,

    /// Corner radius of the output image in pixels.
    pub border_radius: u32,

    /// Reserved for engines that host a script runtime.
    pub enable_javascript: bool,

    /// Render time budget; zero disables it.
    /// Default: 30 seconds.
    #[serde(rename = "timeout_ms", with = "duration_ms")]
    pub timeout: Duration,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            resolution: Resolution::Auto,
            format: ImageFormat::Png,
            quality: 90,
            custom_width: 0,
            custom_height: 0,
            background_type: BackgroundType::Solid,
            background_color: 0xFFFF_FFFF,
            background_image: None,
            background_blur: 0.0,
            border_radius: 0,
            enable_javascript: false,
            timeout: Duration::from_millis(30_000),
        }
    }
}

impl RenderOptions {
    /// Set the resolution preset.
    pub fn resolution(mut self, resolution: Resolution) -> Self {
        self.resolution = resolution;
        self
    }

    /// Set the output format.
    pub fn format(mut self, format: ImageFormat) -> Self {
        self.format = format;
        self
    }

    /// Set the encoder quality, clamped to 100.
    pub fn quality(mut self, quality: u8) -> Self {
        self.quality = quality.min(100);
        self
    }

    /// Use a custom canvas size (implies `Resolution::Auto`).
    pub fn custom_size(mut self, width: u32, height: u32) -> Self {
        self.resolution = Resolution::Auto;
        self.custom_width = width;
        self.custom_height = height;
        self
    }

    /// Paint a solid ARGB background.
    pub fn background_color(mut self, argb: u32) -> Self {
        self.background_type = BackgroundType::Solid;
        self.background_color = argb;
        self
    }

    /// Paint an image background with the given blur.
    pub fn background_image(mut self, path: impl Into<PathBuf>, blur: f32) -> Self {
        self.background_type = BackgroundType::Image;
        self.background_image = Some(path.into());
        self.background_blur = blur;
        self
    }

    /// Set the corner radius.
    pub fn border_radius(mut self, radius: u32) -> Self {
        self.border_radius = radius;
        self
    }

    /// Set the render time budget.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Canvas dimensions these options resolve to.
    pub fn canvas_size(&self) -> (u32, u32) {
        match self.resolution.dimensions() {
            Some(dims) => dims,
            None => (
                if self.custom_width > 0 {
                    self.custom_width
                } else {
                    DEFAULT_CANVAS_WIDTH
                },
                if self.custom_height > 0 {
                    self.custom_height
                } else {
                    DEFAULT_CANVAS_HEIGHT
                },
            ),
        }
    }

    /// Validate the options.
    pub fn validate(&self) -> Result<()> {
        if self.quality > 100 {
            return Err(Text2ImageError::InvalidArgument(
                "quality must be between 0 and 100".to_string(),
            ));
        }
        if self.custom_width > MAX_CANVAS_DIMENSION || self.custom_height > MAX_CANVAS_DIMENSION {
            return Err(Text2ImageError::InvalidArgument(format!(
                "canvas {}x{} exceeds the {} pixel limit per side",
                self.custom_width, self.custom_height, MAX_CANVAS_DIMENSION
            )));
        }
        if !self.background_blur.is_finite() || !(0.0..=100.0).contains(&self.background_blur) {
            return Err(Text2ImageError::InvalidArgument(
                "background_blur must be between 0 and 100".to_string(),
            ));
        }
        if self.background_type == BackgroundType::Image && self.background_image.is_none() {
            return Err(Text2ImageError::InvalidArgument(
                "image background requires background_image".to_string(),
            ));
        }
        Ok(())
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Configuration for the worker pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of worker threads.
    /// Default: number of CPU cores.
    pub pool_size: usize,

    /// Prefix for worker thread names.
    /// Default: "text2image-worker".
    pub thread_name_prefix: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_size: num_cpus::get(),
            thread_name_prefix: "text2image-worker".to_string(),
        }
    }
}

impl PoolConfig {
    /// Create a new pool config with specified pool size.
    pub fn with_pool_size(pool_size: usize) -> Self {
        Self {
            pool_size,
            ..Default::default()
        }
    }

    /// Set the worker thread name prefix.
    pub fn thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.pool_size == 0 {
            return Err(Text2ImageError::InvalidConfig(
                "pool_size must be at least 1".to_string(),
            ));
        }
        if self.thread_name_prefix.is_empty() {
            return Err(Text2ImageError::InvalidConfig(
                "thread_name_prefix must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Combined configuration for a library context.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Pool configuration.
    pub pool: PoolConfig,

    /// Options used when a task is created without its own.
    pub default_options: RenderOptions,
}

impl ContextConfig {
    /// Create a context config with the given pool size.
    pub fn new(pool_size: usize) -> Self {
        Self {
            pool: PoolConfig::with_pool_size(pool_size),
            default_options: RenderOptions::default(),
        }
    }

    /// Parse a JSON document; absent fields keep their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: ContextConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the entire configuration.
    pub fn validate(&self) -> Result<()> {
        self.pool.validate()?;
        self.default_options
            .validate()
            .map_err(|e| Text2ImageError::InvalidConfig(e.to_string()))?;
        Ok(())
    }
}

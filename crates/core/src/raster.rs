//! Built-in raster backend.
//!
//! Produces the page canvas a document is laid out on:
//! - Canvas sized from the resolution preset or custom dimensions
//! - Solid or image backgrounds, with optional Gaussian blur
//! - Rounded corners with anti-aliased edges (rows processed via rayon)
//! - PNG encoding through the `png` crate, other formats through `image`

use crate::config::{BackgroundType, ImageFormat, RenderOptions, MAX_CANVAS_DIMENSION};
use crate::engine::RenderEngine;
use crate::task::Task;
use anyhow::{bail, Context};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::{ImageBuffer, RgbImage, Rgba, RgbaImage};
use rayon::prelude::*;
use std::io::Cursor;
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Canvas renderer used when no other engine is configured.
#[derive(Debug, Clone)]
pub struct RasterEngine {
    compression: png::Compression,
}

impl Default for RasterEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl RasterEngine {
    /// Create an engine using fast PNG compression.
    pub fn new() -> Self {
        Self {
            compression: png::Compression::Fast,
        }
    }

    /// Set the PNG compression level.
    pub fn with_compression(mut self, compression: png::Compression) -> Self {
        self.compression = compression;
        self
    }

    /// Build the canvas for `options`, without encoding it.
    pub fn paint(&self, options: &RenderOptions) -> anyhow::Result<RgbaImage> {
        let deadline = Deadline::new(options.timeout);
        self.paint_within(options, &deadline)
    }

    fn paint_within(&self, options: &RenderOptions, deadline: &Deadline) -> anyhow::Result<RgbaImage> {
        let (width, height) = options.canvas_size();
        if width > MAX_CANVAS_DIMENSION || height > MAX_CANVAS_DIMENSION {
            bail!(
                "canvas {}x{} exceeds the {} pixel limit per side",
                width,
                height,
                MAX_CANVAS_DIMENSION
            );
        }

        let mut canvas = match (options.background_type, &options.background_image) {
            (BackgroundType::Image, Some(path)) => image_background(
                path,
                width,
                height,
                options.background_color,
                options.background_blur,
            )?,
            (BackgroundType::Image, None) => bail!("image background requires a path"),
            (BackgroundType::Solid, _) => {
                blank_canvas(width, height, argb_to_rgba(options.background_color))?
            }
        };
        deadline.check()?;

        if options.border_radius > 0 {
            round_corners(&mut canvas, options.border_radius);
            deadline.check()?;
        }

        Ok(canvas)
    }

    fn encode(&self, canvas: &RgbaImage, options: &RenderOptions) -> anyhow::Result<Vec<u8>> {
        match options.format {
            ImageFormat::Png => encode_png(canvas, self.compression),
            ImageFormat::Heic | ImageFormat::Avif => {
                warn!("{} output is not supported, encoding PNG instead", options.format);
                encode_png(canvas, self.compression)
            }
            ImageFormat::Jpeg => {
                let flattened = flatten(canvas, options.background_color)?;
                let mut buffer = Vec::new();
                JpegEncoder::new_with_quality(&mut buffer, options.quality.clamp(1, 100))
                    .encode_image(&flattened)
                    .context("failed to encode JPEG")?;
                Ok(buffer)
            }
            ImageFormat::Webp => write_with_image(canvas, image::ImageFormat::WebP),
            ImageFormat::Bmp => write_with_image(canvas, image::ImageFormat::Bmp),
            ImageFormat::Tiff => write_with_image(canvas, image::ImageFormat::Tiff),
        }
    }
}

impl RenderEngine for RasterEngine {
    fn name(&self) -> &str {
        "raster"
    }

    fn initialize(&self) -> anyhow::Result<()> {
        info!("Raster engine initialized ({:?} PNG compression)", self.compression);
        Ok(())
    }

    fn shutdown(&self) {
        debug!("Raster engine released");
    }

    fn render(&self, task: &Task) -> anyhow::Result<Vec<u8>> {
        let options = task.options();
        let deadline = Deadline::new(options.timeout);

        let canvas = self.paint_within(options, &deadline)?;
        let bytes = self.encode(&canvas, options)?;
        deadline.check()?;

        debug!(
            "Task {}: {}x{} canvas encoded as {} ({} bytes)",
            task.handle(),
            canvas.width(),
            canvas.height(),
            options.format,
            bytes.len()
        );
        Ok(bytes)
    }
}

/// Render time budget, checked between stages. A zero budget never expires.
#[derive(Debug, Clone, Copy)]
struct Deadline {
    start: Instant,
    budget: Duration,
}

impl Deadline {
    fn new(budget: Duration) -> Self {
        Self {
            start: Instant::now(),
            budget,
        }
    }

    fn check(&self) -> anyhow::Result<()> {
        if !self.budget.is_zero() && self.start.elapsed() > self.budget {
            bail!(
                "render exceeded timeout of {} ms",
                self.budget.as_millis()
            );
        }
        Ok(())
    }
}

/// Reserve a `width * height * channels` byte buffer, failing instead of
/// aborting when the size overflows or memory is short.
fn pixel_buffer(width: u32, height: u32, channels: usize) -> anyhow::Result<Vec<u8>> {
    let len = (width as usize)
        .checked_mul(height as usize)
        .and_then(|pixels| pixels.checked_mul(channels))
        .with_context(|| format!("canvas {}x{} is too large", width, height))?;
    let mut buffer = Vec::new();
    buffer
        .try_reserve_exact(len)
        .with_context(|| format!("failed to allocate {} bytes for a {}x{} canvas", len, width, height))?;
    Ok(buffer)
}

/// A canvas filled with `pixel`.
fn blank_canvas(width: u32, height: u32, pixel: Rgba<u8>) -> anyhow::Result<RgbaImage> {
    let mut buffer = pixel_buffer(width, height, 4)?;
    let pixels = width as usize * height as usize;
    buffer.extend(std::iter::repeat(pixel.0).take(pixels).flatten());
    ImageBuffer::from_raw(width, height, buffer).context("canvas buffer has the wrong size")
}

fn argb_to_rgba(argb: u32) -> Rgba<u8> {
    let [a, r, g, b] = argb.to_be_bytes();
    Rgba([r, g, b, a])
}

/// Scale `path` to cover the canvas, crop the centre and blur it.
fn image_background(
    path: &Path,
    width: u32,
    height: u32,
    underlay: u32,
    blur: f32,
) -> anyhow::Result<RgbaImage> {
    let source = image::open(path)
        .with_context(|| format!("failed to load background image {:?}", path))?
        .to_rgba8();
    if source.width() == 0 || source.height() == 0 {
        bail!("background image {:?} is empty", path);
    }

    let scale = f64::max(
        width as f64 / source.width() as f64,
        height as f64 / source.height() as f64,
    );
    let scaled_w = ((source.width() as f64 * scale).ceil() as u32).max(width);
    let scaled_h = ((source.height() as f64 * scale).ceil() as u32).max(height);
    // Extreme aspect ratios would scale one side far past the canvas.
    if scaled_w > MAX_CANVAS_DIMENSION * 4 || scaled_h > MAX_CANVAS_DIMENSION * 4 {
        bail!(
            "background image {:?} cannot cover a {}x{} canvas ({}x{} after scaling)",
            path,
            width,
            height,
            scaled_w,
            scaled_h
        );
    }
    let scaled = imageops::resize(&source, scaled_w, scaled_h, FilterType::Triangle);

    let x = (scaled_w - width) / 2;
    let y = (scaled_h - height) / 2;
    let mut cover = imageops::crop_imm(&scaled, x, y, width, height).to_image();

    if blur > 0.0 {
        cover = imageops::blur(&cover, blur_sigma(blur));
    }

    // Transparent areas of the image show the background colour.
    let mut canvas = blank_canvas(width, height, argb_to_rgba(underlay))?;
    imageops::overlay(&mut canvas, &cover, 0, 0);
    Ok(canvas)
}

/// Map the 0-100 blur amount to a Gaussian sigma in pixels.
fn blur_sigma(amount: f32) -> f32 {
    amount.clamp(0.0, 100.0) / 2.0
}

/// Make everything outside the rounded rectangle transparent.
fn round_corners(canvas: &mut RgbaImage, radius: u32) {
    let (width, height) = canvas.dimensions();
    let r = radius.min(width / 2).min(height / 2) as f32;
    if r <= 0.0 {
        return;
    }
    let (w, h) = (width as f32, height as f32);
    let row_len = width as usize * 4;

    let pixels: &mut [u8] = &mut *canvas;
    pixels
        .par_chunks_mut(row_len)
        .enumerate()
        .for_each(|(y, row)| {
            let py = y as f32 + 0.5;
            if py >= r && py <= h - r {
                return;
            }
            for (x, pixel) in row.chunks_exact_mut(4).enumerate() {
                let px = x as f32 + 0.5;
                let cx = px.clamp(r, w - r);
                let cy = py.clamp(r, h - r);
                let distance = (px - cx).hypot(py - cy);
                let coverage = (r + 0.5 - distance).clamp(0.0, 1.0);
                if coverage < 1.0 {
                    pixel[3] = (pixel[3] as f32 * coverage).round() as u8;
                }
            }
        });
}

/// Blend transparent areas onto an opaque colour.
fn flatten(canvas: &RgbaImage, background: u32) -> anyhow::Result<RgbImage> {
    let Rgba([r, g, b, _]) = argb_to_rgba(background);
    let mut buffer = pixel_buffer(canvas.width(), canvas.height(), 3)?;

    for src in canvas.pixels() {
        let alpha = src[3] as f32 / 255.0;
        let inv_alpha = 1.0 - alpha;
        buffer.extend_from_slice(&[
            ((src[0] as f32 * alpha) + (r as f32 * inv_alpha)) as u8,
            ((src[1] as f32 * alpha) + (g as f32 * inv_alpha)) as u8,
            ((src[2] as f32 * alpha) + (b as f32 * inv_alpha)) as u8,
        ]);
    }

    ImageBuffer::from_raw(canvas.width(), canvas.height(), buffer)
        .context("flattened buffer has the wrong size")
}

fn encode_png(image: &RgbaImage, compression: png::Compression) -> anyhow::Result<Vec<u8>> {
    let mut buffer = Cursor::new(Vec::new());

    let mut encoder = png::Encoder::new(&mut buffer, image.width(), image.height());
    encoder.set_color(png::ColorType::Rgba);
    encoder.set_depth(png::BitDepth::Eight);
    encoder.set_compression(compression);

    let mut writer = encoder
        .write_header()
        .context("failed to write PNG header")?;
    writer
        .write_image_data(image.as_raw())
        .context("failed to write PNG data")?;
    drop(writer);

    Ok(buffer.into_inner())
}

fn write_with_image(image: &RgbaImage, format: image::ImageFormat) -> anyhow::Result<Vec<u8>> {
    let mut buffer = Cursor::new(Vec::new());
    image
        .write_to(&mut buffer, format)
        .with_context(|| format!("failed to encode {:?}", format))?;
    Ok(buffer.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Resolution;
    use crate::registry::TaskHandle;
    use image::Rgb;
    use tempfile::TempDir;

    const PNG_MAGIC: [u8; 8] = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];

    fn render(options: RenderOptions) -> anyhow::Result<Vec<u8>> {
        let task = Task::new(
            TaskHandle::from_raw(1 << (usize::BITS / 2)).unwrap(),
            "<p>A</p>",
            "",
            options,
        );
        RasterEngine::new().render(&task)
    }

    fn small() -> RenderOptions {
        RenderOptions::default().custom_size(40, 30)
    }

    // ========== Canvas tests ==========

    #[test]
    fn test_default_canvas_size() {
        let canvas = RasterEngine::new().paint(&RenderOptions::default()).unwrap();
        assert_eq!(canvas.dimensions(), (800, 600));
    }

    #[test]
    fn test_preset_canvas_size() {
        let options = RenderOptions::default().resolution(Resolution::P720);
        let canvas = RasterEngine::new().paint(&options).unwrap();
        assert_eq!(canvas.dimensions(), (1280, 720));
    }

    #[test]
    fn test_solid_background_color() {
        let options = small().background_color(0xFF10_2030);
        let canvas = RasterEngine::new().paint(&options).unwrap();
        assert_eq!(canvas.get_pixel(20, 15), &Rgba([0x10, 0x20, 0x30, 0xFF]));
    }

    #[test]
    fn test_argb_unpacking() {
        assert_eq!(argb_to_rgba(0x80FF_0000), Rgba([255, 0, 0, 0x80]));
        assert_eq!(argb_to_rgba(0xFFFF_FFFF), Rgba([255, 255, 255, 255]));
    }

    #[test]
    fn test_oversized_canvas_fails_without_allocating() {
        let mut options = RenderOptions::default();
        options.custom_width = 1_000_000;
        options.custom_height = 1_000_000;

        let err = render(options).unwrap_err();
        assert!(err.to_string().contains("exceeds"));
    }

    #[test]
    fn test_canvas_buffer_overflow_is_an_error() {
        assert!(blank_canvas(u32::MAX, u32::MAX, Rgba([0, 0, 0, 0])).is_err());
        assert!(pixel_buffer(u32::MAX, u32::MAX, 4).is_err());
    }

    #[test]
    fn test_blank_canvas_fills_every_pixel() {
        let canvas = blank_canvas(3, 2, Rgba([1, 2, 3, 4])).unwrap();
        assert_eq!(canvas.dimensions(), (3, 2));
        assert!(canvas.pixels().all(|p| *p == Rgba([1, 2, 3, 4])));
    }

    // ========== Border radius tests ==========

    #[test]
    fn test_round_corners_clears_corners_only() {
        let options = small().border_radius(10);
        let canvas = RasterEngine::new().paint(&options).unwrap();
        assert_eq!(canvas.get_pixel(0, 0)[3], 0);
        assert_eq!(canvas.get_pixel(39, 29)[3], 0);
        assert_eq!(canvas.get_pixel(20, 15)[3], 255);
        assert_eq!(canvas.get_pixel(20, 0)[3], 255);
        assert_eq!(canvas.get_pixel(0, 15)[3], 255);
    }

    #[test]
    fn test_round_corners_clamps_radius() {
        let mut canvas = RgbaImage::from_pixel(10, 10, Rgba([0, 0, 0, 255]));
        round_corners(&mut canvas, 1000);
        assert_eq!(canvas.get_pixel(0, 0)[3], 0);
        assert_eq!(canvas.get_pixel(5, 5)[3], 255);
    }

    // ========== Background image tests ==========

    #[test]
    fn test_image_background_covers_canvas() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bg.png");
        RgbaImage::from_pixel(4, 2, Rgba([0, 0, 255, 255]))
            .save(&path)
            .unwrap();

        let options = small().background_image(&path, 0.0);
        let canvas = RasterEngine::new().paint(&options).unwrap();
        assert_eq!(canvas.dimensions(), (40, 30));
        assert_eq!(canvas.get_pixel(20, 15), &Rgba([0, 0, 255, 255]));
    }

    #[test]
    fn test_image_background_with_blur() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bg.png");
        RgbaImage::from_pixel(8, 8, Rgba([200, 100, 50, 255]))
            .save(&path)
            .unwrap();

        let options = small().background_image(&path, 10.0);
        let canvas = RasterEngine::new().paint(&options).unwrap();
        assert_eq!(canvas.dimensions(), (40, 30));
        assert_eq!(canvas.get_pixel(20, 15)[3], 255);
    }

    #[test]
    fn test_missing_background_image_fails() {
        let options = small().background_image("/nonexistent/bg.png", 0.0);
        let err = render(options).unwrap_err();
        assert!(format!("{:#}", err).contains("failed to load background image"));
    }

    // ========== Encoding tests ==========

    #[test]
    fn test_encode_png() {
        let bytes = render(small()).unwrap();
        assert_eq!(&bytes[0..8], &PNG_MAGIC);
        let decoded = image::load_from_memory(&bytes).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (40, 30));
    }

    #[test]
    fn test_encode_jpeg() {
        let bytes = render(small().format(ImageFormat::Jpeg).quality(80)).unwrap();
        assert_eq!(&bytes[0..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn test_encode_bmp_tiff_webp() {
        let bmp = render(small().format(ImageFormat::Bmp)).unwrap();
        assert_eq!(&bmp[0..2], b"BM");

        let tiff = render(small().format(ImageFormat::Tiff)).unwrap();
        assert!(&tiff[0..4] == b"II*\0" || &tiff[0..4] == b"MM\0*");

        let webp = render(small().format(ImageFormat::Webp)).unwrap();
        assert_eq!(&webp[0..4], b"RIFF");
        assert_eq!(&webp[8..12], b"WEBP");
    }

    #[test]
    fn test_unsupported_formats_fall_back_to_png() {
        for format in [ImageFormat::Heic, ImageFormat::Avif] {
            let bytes = render(small().format(format)).unwrap();
            assert_eq!(&bytes[0..8], &PNG_MAGIC);
        }
    }

    #[test]
    fn test_flatten_blends_onto_background() {
        let canvas = RgbaImage::from_pixel(1, 1, Rgba([0, 0, 0, 0]));
        let flattened = flatten(&canvas, 0xFFFF_FFFF).unwrap();
        assert_eq!(flattened.get_pixel(0, 0), &Rgb([255, 255, 255]));
    }

    // ========== Deadline tests ==========

    #[test]
    fn test_zero_deadline_never_expires() {
        let deadline = Deadline::new(Duration::ZERO);
        std::thread::sleep(Duration::from_millis(2));
        assert!(deadline.check().is_ok());
    }

    #[test]
    fn test_expired_deadline_fails() {
        let deadline = Deadline::new(Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(5));
        let err = deadline.check().unwrap_err();
        assert_eq!(err.to_string(), "render exceeded timeout of 1 ms");
    }
}

//! Dual-camera composite synthesis.
//!
//! The secondary (selfie) image is scaled to a third of the background width,
//! clipped to rounded corners, framed in a black rounded card and laid over
//! the top-left corner of the primary image. The result is flattened onto
//! white and encoded in the format named by the output extension.

use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage, ImageFormat, Luma, Rgb, RgbImage, Rgba, RgbaImage};
use std::io::Cursor;
use std::path::{Path, PathBuf};

use crate::error::{ExportError, Result};
use crate::exif::{TagSet, write_metadata};
use crate::export::{ExportOutcome, ExportedImage, existing_output};
use crate::pipeline::ImageKind;

pub const JPEG_QUALITY: u8 = 95;
pub const WEBP_QUALITY: f32 = 95.0;

/// Distance of the card from the top and left edges.
pub const PADDING: u32 = 20;
/// Width of the black frame around the overlay.
pub const BORDER: u32 = 4;
/// Mask supersampling factor for anti-aliased corners.
const SUPERSAMPLE: u32 = 4;

/// Inputs and output of one composite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompositeSpec {
    pub background: PathBuf,
    pub overlay: PathBuf,
    pub output: PathBuf,
}

/// Sizes derived from the two input dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CardGeometry {
    pub overlay_width: u32,
    pub overlay_height: u32,
    /// Corner radius of the overlay image itself.
    pub radius: u32,
    pub card_width: u32,
    pub card_height: u32,
    pub card_radius: u32,
    /// Top-left corner of the card on the background.
    pub offset: (u32, u32),
}

impl CardGeometry {
    /// ```rust
    /// use bereal_export::composite::CardGeometry;
    ///
    /// let g = CardGeometry::compute((1200, 1600), (400, 600)).unwrap();
    /// assert_eq!((g.overlay_width, g.overlay_height, g.radius), (400, 600, 40));
    /// ```
    pub fn compute(background: (u32, u32), overlay: (u32, u32)) -> Result<Self> {
        let (bg_w, _) = background;
        let (ov_w, ov_h) = overlay;
        if ov_w == 0 || ov_h == 0 {
            return Err(ExportError::Composition("overlay has no pixels".into()));
        }

        let overlay_width = bg_w / 3;
        // truncating, like the integer division of the width
        let overlay_height = (ov_h as u64 * overlay_width as u64 / ov_w as u64) as u32;
        if overlay_width == 0 || overlay_height == 0 {
            return Err(ExportError::Composition(format!(
                "background {}x{} too small for an overlay",
                background.0, background.1
            )));
        }

        let radius = overlay_width.min(overlay_height) / 10;
        Ok(Self {
            overlay_width,
            overlay_height,
            radius,
            card_width: overlay_width + 2 * BORDER,
            card_height: overlay_height + 2 * BORDER,
            card_radius: radius + BORDER,
            offset: (PADDING, PADDING),
        })
    }
}

/// Anti-aliased rounded-rectangle coverage mask.
pub fn rounded_mask(width: u32, height: u32, radius: u32) -> GrayImage {
    let (w, h, r) = (
        width * SUPERSAMPLE,
        height * SUPERSAMPLE,
        (radius * SUPERSAMPLE) as f64,
    );
    let big = GrayImage::from_fn(w, h, |x, y| {
        let (px, py) = (x as f64 + 0.5, y as f64 + 0.5);
        let cx = px.clamp(r, (w as f64 - r).max(r));
        let cy = py.clamp(r, (h as f64 - r).max(r));
        let inside = (px - cx).powi(2) + (py - cy).powi(2) <= r * r;
        Luma([if inside { 255 } else { 0 }])
    });
    imageops::resize(&big, width, height, FilterType::Triangle)
}

/// Decode by content rather than by extension.
pub fn open_image(path: &Path) -> Result<DynamicImage> {
    Ok(image::ImageReader::open(path)?
        .with_guessed_format()?
        .decode()?)
}

/// Alpha-composite onto an opaque white canvas.
pub fn flatten_on_white(img: &DynamicImage) -> RgbImage {
    let rgba = img.to_rgba8();
    RgbImage::from_fn(rgba.width(), rgba.height(), |x, y| {
        let Rgba([r, g, b, a]) = *rgba.get_pixel(x, y);
        let blend = |c: u8| ((c as u32 * a as u32 + 255 * (255 - a as u32) + 127) / 255) as u8;
        Rgb([blend(r), blend(g), blend(b)])
    })
}

pub fn encode_jpeg(img: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut buf = Cursor::new(Vec::new());
    let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut buf, quality);
    img.write_with_encoder(encoder)?;
    Ok(buf.into_inner())
}

pub fn encode_webp(img: &RgbImage, quality: f32) -> Result<Vec<u8>> {
    let dynamic = DynamicImage::ImageRgb8(img.clone());
    let encoder = webp::Encoder::from_image(&dynamic)
        .map_err(|e| ExportError::Composition(format!("WebP encoder: {e}")))?;
    Ok(encoder.encode(quality).to_vec())
}

/// Build the composite pixels from two decoded images.
pub fn compose(background: &DynamicImage, overlay: &DynamicImage) -> Result<RgbImage> {
    let geom = CardGeometry::compute(
        (background.width(), background.height()),
        (overlay.width(), overlay.height()),
    )?;

    let mut inner = imageops::resize(
        &overlay.to_rgba8(),
        geom.overlay_width,
        geom.overlay_height,
        FilterType::Lanczos3,
    );
    let inner_mask = rounded_mask(geom.overlay_width, geom.overlay_height, geom.radius);
    for (x, y, px) in inner.enumerate_pixels_mut() {
        let coverage = inner_mask.get_pixel(x, y).0[0] as u32;
        px.0[3] = (px.0[3] as u32 * coverage / 255) as u8;
    }

    let card_mask = rounded_mask(geom.card_width, geom.card_height, geom.card_radius);
    let mut card = RgbaImage::from_fn(geom.card_width, geom.card_height, |x, y| {
        Rgba([0, 0, 0, card_mask.get_pixel(x, y).0[0]])
    });
    imageops::overlay(&mut card, &inner, BORDER as i64, BORDER as i64);

    let mut canvas = background.to_rgba8();
    imageops::overlay(
        &mut canvas,
        &card,
        geom.offset.0 as i64,
        geom.offset.1 as i64,
    );

    Ok(flatten_on_white(&DynamicImage::ImageRgba8(canvas)))
}

fn render(spec: &CompositeSpec) -> Result<PathBuf> {
    let background = open_image(&spec.background)?;
    let overlay = open_image(&spec.overlay)?;
    let pixels = compose(&background, &overlay)?;

    let bytes = match ImageFormat::from_path(&spec.output) {
        Ok(ImageFormat::Jpeg) => encode_jpeg(&pixels, JPEG_QUALITY)?,
        _ => encode_webp(&pixels, WEBP_QUALITY)?,
    };
    if let Some(parent) = spec.output.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&spec.output, bytes)?;
    Ok(spec.output.clone())
}

/// Copy the background in place of a composite that could not be built.
fn copy_background(spec: &CompositeSpec) -> Result<(PathBuf, Option<ImageKind>)> {
    let kind = ImageKind::detect(&spec.background);
    let target = match kind {
        Some(kind) => spec.output.with_extension(kind.extension()),
        None => spec.output.clone(),
    };
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::copy(&spec.background, &target)?;
    Ok((target, kind))
}

/// Build and tag one composite. Never fails the caller.
///
/// An existing composite (with either extension) is left untouched. When
/// composition fails the background is copied in its place.
pub fn synthesize(spec: &CompositeSpec, tags: &TagSet) -> ExportOutcome {
    if let Some(existing) = existing_output(&spec.output) {
        log::debug!("Composite exists, skipping: {}", existing.display());
        return ExportOutcome::Skipped(existing);
    }

    let (path, kind) = match render(spec) {
        Ok(path) => {
            let kind = ImageKind::from_path(&path);
            (path, kind)
        }
        Err(e) => {
            log::warn!(
                "Composite failed for {}: {e}; using the background instead",
                spec.output.display()
            );
            let _ = std::fs::remove_file(&spec.output);
            match copy_background(spec) {
                Ok(copied) => copied,
                Err(e) => {
                    log::error!("Could not copy background for {}: {e}", spec.output.display());
                    return ExportOutcome::Failed(spec.output.clone());
                }
            }
        }
    };

    let outcome = write_metadata(&path, tags);
    let path = outcome.path().to_path_buf();
    log::debug!("Composite written: {}", path.display());
    ExportOutcome::Exported(ExportedImage {
        detected_format: ImageKind::from_path(&path).or(kind),
        path,
    })
}

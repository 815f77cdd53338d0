//! Vertical page merge: all pages of a questionnaire become one image so the
//! model sees the whole form in a single call.

use std::io::Cursor;
use std::path::{Path, PathBuf};

use base64::Engine as _;
use image::imageops::FilterType;
use image::{DynamicImage, ImageOutputFormat, Rgb, RgbImage};

use super::ExtractionError;
use crate::config::PipelineConfig;

/// White, so pages narrower than the widest one are padded on the right.
const BACKGROUND: Rgb<u8> = Rgb([255, 255, 255]);

/// Encoded result of a merge.
#[derive(Debug, Clone)]
pub struct MergedImage {
    pub png: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub page_count: usize,
}

impl MergedImage {
    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(&self.png)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ImageMerger {
    max_dimension: u32,
    max_bytes: u64,
}

impl ImageMerger {
    pub fn new(max_dimension: u32, max_bytes: u64) -> Self {
        Self {
            max_dimension,
            max_bytes,
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(config.max_image_dimension, config.max_image_bytes)
    }

    /// Stack `pages` top to bottom, left-aligned, on a white canvas as wide
    /// as the widest page. The result is downscaled so its longer side fits
    /// `max_dimension` and encoded as PNG.
    pub fn merge(&self, pages: &[PathBuf]) -> Result<MergedImage, ExtractionError> {
        if pages.is_empty() {
            return Err(ExtractionError::Image("no pages to merge".into()));
        }

        let images = pages
            .iter()
            .map(|p| load_page(p, self.max_bytes))
            .collect::<Result<Vec<_>, _>>()?;

        let width = images.iter().map(|img| img.width()).max().unwrap_or(0);
        let height = images
            .iter()
            .try_fold(0u32, |acc, img| acc.checked_add(img.height()))
            .ok_or_else(|| ExtractionError::Image("merged image too tall".into()))?;
        if width == 0 || height == 0 {
            return Err(ExtractionError::Image("pages have no pixels".into()));
        }

        let mut canvas = RgbImage::from_pixel(width, height, BACKGROUND);
        let mut y = 0;
        for img in &images {
            image::imageops::overlay(&mut canvas, img, 0, y);
            y += img.height();
        }
        drop(images);

        let canvas = downscale(canvas, self.max_dimension);
        let png = encode_png(&canvas)?;
        if png.len() as u64 > self.max_bytes {
            return Err(ExtractionError::Image(format!(
                "merged image is {} bytes, limit is {}",
                png.len(),
                self.max_bytes
            )));
        }

        tracing::debug!(
            pages = pages.len(),
            width = canvas.width(),
            height = canvas.height(),
            bytes = png.len(),
            "Pages merged"
        );

        Ok(MergedImage {
            png,
            width: canvas.width(),
            height: canvas.height(),
            page_count: pages.len(),
        })
    }
}

/// Decode one page and apply its EXIF orientation. Files larger than
/// `max_bytes` are rejected before being read.
fn load_page(path: &Path, max_bytes: u64) -> Result<RgbImage, ExtractionError> {
    let size = std::fs::metadata(path)
        .map_err(|e| ExtractionError::Image(format!("{}: {e}", path.display())))?
        .len();
    if size > max_bytes {
        return Err(ExtractionError::Image(format!(
            "{}: file is {size} bytes, limit is {max_bytes}",
            path.display()
        )));
    }

    let bytes = std::fs::read(path)
        .map_err(|e| ExtractionError::Image(format!("{}: {e}", path.display())))?;
    let img = image::load_from_memory(&bytes)
        .map_err(|e| ExtractionError::Image(format!("{}: {e}", path.display())))?;
    Ok(apply_orientation(img, read_exif_orientation(&bytes)).to_rgb8())
}

/// EXIF tag 0x0112, 1 (normal) when absent.
fn read_exif_orientation(bytes: &[u8]) -> u32 {
    let mut cursor = Cursor::new(bytes);
    let reader = match exif::Reader::new().read_from_container(&mut cursor) {
        Ok(r) => r,
        Err(_) => return 1,
    };

    reader
        .get_field(exif::Tag::Orientation, exif::In::PRIMARY)
        .and_then(|f| f.value.get_uint(0))
        .unwrap_or(1)
}

/// 1 = normal, 2 = mirrored, 3 = 180°, 4 = flipped, 5-8 = the 90°/270°
/// rotations with and without mirroring.
fn apply_orientation(img: DynamicImage, orientation: u32) -> DynamicImage {
    match orientation {
        2 => img.fliph(),
        3 => img.rotate180(),
        4 => img.flipv(),
        5 => img.rotate90().fliph(),
        6 => img.rotate90(),
        7 => img.rotate270().fliph(),
        8 => img.rotate270(),
        _ => img,
    }
}

/// Shrink so the longer side is at most `max_dim`, keeping aspect ratio.
/// Smaller images are returned as is.
fn downscale(img: RgbImage, max_dim: u32) -> RgbImage {
    let (w, h) = (img.width(), img.height());
    let largest = w.max(h);
    if largest <= max_dim {
        return img;
    }

    let ratio = max_dim as f64 / largest as f64;
    let new_w = ((w as f64 * ratio) as u32).max(1);
    let new_h = ((h as f64 * ratio) as u32).max(1);
    image::imageops::resize(&img, new_w, new_h, FilterType::Lanczos3)
}

fn encode_png(img: &RgbImage) -> Result<Vec<u8>, ExtractionError> {
    let mut cursor = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(img.clone())
        .write_to(&mut cursor, ImageOutputFormat::Png)
        .map_err(|e| ExtractionError::Image(format!("PNG encoding failed: {e}")))?;
    Ok(cursor.into_inner())
}

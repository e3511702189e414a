//! Border trimming and thumbnail generation

use anyhow::{bail, Context, Result};
use image::imageops::FilterType;
use image::{DynamicImage, Rgba};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::{
    CROPPED_DIR, KIT_THUMBNAIL_SIZE, PART_CROP_PADDING, PART_THUMBNAIL_SIZE, THUMBNAILS_DIR,
};

/// Maximum per-channel difference from the background colour that still
/// counts as background. Absorbs JPEG noise in the white frame.
pub const BORDER_TOLERANCE: u8 = 10;

/// Extensions (by first letter) picked up when cropping: gif, png, jpg/jpeg
const CROP_INITIALS: &[char] = &['g', 'p', 'j'];
/// Cropping re-encodes GIFs as PNG, so thumbnails only look at png and jpg
const THUMBNAIL_INITIALS: &[char] = &['p', 'j'];

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ProcessStats {
    pub written: usize,
    pub failed: usize,
}

/// Bounding box `(left, top, right, bottom)` of everything that is not
/// background, right/bottom exclusive. The background is the top-left pixel.
/// Returns None when the whole image is background.
pub fn content_bounds(img: &DynamicImage, tolerance: u8) -> Option<(u32, u32, u32, u32)> {
    let rgba = img.to_rgba8();
    let (width, height) = rgba.dimensions();
    if width == 0 || height == 0 {
        return None;
    }

    let bg = *rgba.get_pixel(0, 0);
    let is_background = |p: &Rgba<u8>| {
        p.0.iter()
            .zip(bg.0.iter())
            .all(|(a, b)| a.abs_diff(*b) <= tolerance)
    };

    let (mut left, mut top, mut right, mut bottom) = (width, height, 0, 0);
    for (x, y, pixel) in rgba.enumerate_pixels() {
        if !is_background(pixel) {
            left = left.min(x);
            top = top.min(y);
            right = right.max(x + 1);
            bottom = bottom.max(y + 1);
        }
    }

    if right == 0 {
        None
    } else {
        Some((left, top, right, bottom))
    }
}

/// Remove the uniform frame around an image, optionally keeping `padding`
/// pixels of it. An image that is all background comes back unchanged.
pub fn crop_image(img: &DynamicImage, padding: Option<u32>) -> DynamicImage {
    let Some((mut left, mut top, mut right, mut bottom)) = content_bounds(img, BORDER_TOLERANCE)
    else {
        return img.clone();
    };

    if let Some(pad) = padding {
        left = left.saturating_sub(pad);
        top = top.saturating_sub(pad);
        right = (right + pad).min(img.width());
        bottom = (bottom + pad).min(img.height());
    }

    img.crop_imm(left, top, right - left, bottom - top)
}

/// Shrink to fit into `size`×`size`, keeping the aspect ratio. Never enlarges.
pub fn thumbnail(img: &DynamicImage, size: u32) -> DynamicImage {
    if img.width() <= size && img.height() <= size {
        return img.clone();
    }
    img.resize(size, size, FilterType::Lanczos3)
}

fn has_initial(path: &Path, initials: &[char]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .and_then(|e| e.chars().next())
        .is_some_and(|c| initials.contains(&c.to_ascii_lowercase()))
}

/// Image files of `dir` whose extension starts with one of `initials`, sorted by name
fn image_files(dir: &Path, initials: &[char]) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("Failed to read {}", dir.display()))?
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && has_initial(path, initials))
        .collect();
    files.sort();
    Ok(files)
}

fn save_image(img: &DynamicImage, path: &Path) -> Result<()> {
    let is_jpeg = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| matches!(e.to_ascii_lowercase().as_str(), "jpg" | "jpeg"));

    let result = if is_jpeg {
        DynamicImage::ImageRgb8(img.to_rgb8()).save(path)
    } else {
        img.save(path)
    };
    result.with_context(|| format!("Failed to save {}", path.display()))
}

/// Apply `transform` to every matching image of `source_dir` and store the
/// result in `target_dir` under the name chosen by `target_name`
fn process_dir(
    source_dir: &Path,
    target_dir: &Path,
    initials: &[char],
    target_name: impl Fn(&str) -> String,
    transform: impl Fn(&DynamicImage) -> DynamicImage,
) -> Result<ProcessStats> {
    fs::create_dir_all(target_dir)
        .with_context(|| format!("Failed to create {}", target_dir.display()))?;

    let mut stats = ProcessStats::default();
    for path in image_files(source_dir, initials)? {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let target = target_dir.join(target_name(name));
        let result = image::open(&path)
            .with_context(|| format!("Failed to open {}", path.display()))
            .and_then(|img| save_image(&transform(&img), &target));
        match result {
            Ok(()) => stats.written += 1,
            Err(e) => {
                warn!("Skipping image: {:#}", e);
                stats.failed += 1;
            }
        }
    }
    Ok(stats)
}

/// Crop all images of `source_dir` into `target_dir`. GIFs are stored as PNG.
pub fn crop_images(
    source_dir: &Path,
    target_dir: &Path,
    padding: Option<u32>,
) -> Result<ProcessStats> {
    process_dir(
        source_dir,
        target_dir,
        CROP_INITIALS,
        |name| name.replace(".gif", ".png"),
        |img| crop_image(img, padding),
    )
}

/// Write a thumbnail of every image in `source_dir` to `target_dir`
pub fn thumbnails(source_dir: &Path, target_dir: &Path, size: u32) -> Result<ProcessStats> {
    process_dir(
        source_dir,
        target_dir,
        THUMBNAIL_INITIALS,
        |name| name.to_string(),
        |img| thumbnail(img, size),
    )
}

pub fn run_crop(images_root: &Path) -> Result<()> {
    if !images_root.is_dir() {
        bail!("{} not found. Run `ftdb images` first.", images_root.display());
    }
    let cropped = Path::new(CROPPED_DIR);
    let thumbs = Path::new(THUMBNAILS_DIR);

    for (kind, padding, size) in [
        ("parts", Some(PART_CROP_PADDING), PART_THUMBNAIL_SIZE),
        ("kits", None, KIT_THUMBNAIL_SIZE),
    ] {
        let source = images_root.join(kind);
        if !source.is_dir() {
            warn!(dir = %source.display(), "No images to crop");
            continue;
        }
        let stats = crop_images(&source, &cropped.join(kind), padding)?;
        info!(kind, written = stats.written, failed = stats.failed, "Cropped images");
        let stats = thumbnails(&cropped.join(kind), &thumbs.join(kind), size)?;
        info!(kind, written = stats.written, failed = stats.failed, "Created thumbnails");
    }
    Ok(())
}

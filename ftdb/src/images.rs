use anyhow::{bail, Context, Result};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::client::{Fetch, FtdbClient};
use crate::dump::load_dump;
use crate::types::{Dump, Ticket};
use crate::{IMAGES_DIR, KIT_IMAGE_SIZE, PART_IMAGE_SIZE};

/// Outcome of one download batch
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DownloadStats {
    pub downloaded: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// File extension for an image content type, e.g. "image/png" -> "png".
/// None for anything that is not an image.
fn image_extension(content_type: Option<&str>) -> Option<String> {
    let mime = content_type?.split(';').next()?.trim();
    let ext = mime.strip_prefix("image/")?;
    if ext.is_empty() || ext.contains('/') {
        return None;
    }
    Some(ext.to_string())
}

/// Stems of the files already in `dir`, i.e. the ids that need no download
fn downloaded_ids(dir: &Path) -> Result<HashSet<String>> {
    let entries = fs::read_dir(dir).with_context(|| format!("Failed to read {}", dir.display()))?;
    Ok(entries
        .flatten()
        .filter(|entry| entry.file_type().is_ok_and(|t| t.is_file()))
        .filter_map(|entry| {
            let path = entry.path();
            path.file_stem().and_then(|s| s.to_str()).map(|s| s.to_string())
        })
        .collect())
}

fn download_one(
    fetcher: &dyn Fetch,
    ticket: &Ticket,
    url: &str,
    dir: &Path,
    size: u32,
) -> Result<()> {
    let download = fetcher.fetch_image(&format!("{}?size={}", url, size))?;
    let Some(ext) = image_extension(download.content_type.as_deref()) else {
        bail!(
            "Not an image: {} ({})",
            url,
            download.content_type.as_deref().unwrap_or("no content type")
        );
    };

    // `<id>.<ext>.part` has stem `<id>.<ext>`, so an interrupted write never
    // counts as downloaded
    let path = dir.join(format!("{}.{}", ticket.id, ext));
    let partial = dir.join(format!("{}.{}.part", ticket.id, ext));
    fs::write(&partial, &download.bytes)
        .with_context(|| format!("Failed to write {}", partial.display()))?;
    fs::rename(&partial, &path)
        .with_context(|| format!("Failed to move {} into place", partial.display()))?;
    debug!(id = ticket.id, path = %path.display(), "Downloaded image");
    Ok(())
}

/// Download the thumbnail of every ticket that has one into `dir`.
/// Tickets whose image is already on disk are not requested again.
pub fn download_images<'a>(
    fetcher: &dyn Fetch,
    tickets: impl IntoIterator<Item = &'a Ticket>,
    dir: &Path,
    size: u32,
) -> Result<DownloadStats> {
    fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    let mut present = downloaded_ids(dir)?;

    let mut stats = DownloadStats::default();
    for ticket in tickets {
        let Some(url) = &ticket.thumbnail_url else {
            continue;
        };
        let id = ticket.id.to_string();
        if present.contains(&id) {
            stats.skipped += 1;
            continue;
        }
        match download_one(fetcher, ticket, url, dir, size) {
            Ok(()) => {
                present.insert(id);
                stats.downloaded += 1;
            }
            Err(e) => {
                warn!(id = ticket.id, "Image download failed: {:#}", e);
                stats.failed += 1;
            }
        }
    }
    Ok(stats)
}

/// Download kit and part images of a dump into `images_root/{kits,parts}`
pub fn download_dump_images(
    fetcher: &dyn Fetch,
    dump: &Dump,
    images_root: &Path,
) -> Result<(DownloadStats, DownloadStats)> {
    let kits = download_images(
        fetcher,
        dump.kits.values().map(|k| &k.ticket),
        &images_root.join("kits"),
        KIT_IMAGE_SIZE,
    )?;
    info!(
        downloaded = kits.downloaded,
        skipped = kits.skipped,
        failed = kits.failed,
        "Kit images done"
    );

    let parts = download_images(
        fetcher,
        dump.parts.values().map(|p| &p.ticket),
        &images_root.join("parts"),
        PART_IMAGE_SIZE,
    )?;
    info!(
        downloaded = parts.downloaded,
        skipped = parts.skipped,
        failed = parts.failed,
        "Part images done"
    );

    Ok((kits, parts))
}

pub fn run_images(dump_path: &Path) -> Result<()> {
    let dump = load_dump(dump_path)?;
    let client = FtdbClient::new()?;
    download_dump_images(&client, &dump, Path::new(IMAGES_DIR))?;
    Ok(())
}

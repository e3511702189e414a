use anyhow::{Context, Result};
use rust_xlsxwriter::{Color, Format, FormatAlign, Image, Url, Workbook, Worksheet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::dump::load_dump;
use crate::types::{format_article_numbers, ArticleNumbers, Dump, Kit, Ticket};

const THUMBNAIL_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg"];

const PARTS_FILE: &str = "einzelteile.xlsx";
const KITS_FILE: &str = "baukaesten.xlsx";
const KITS_SUBDIR: &str = "kits";

const IMAGE_ROW_HEIGHT: f64 = 100.0;
const KIT_IMAGE_ROW_HEIGHT: f64 = 180.0;

/// One spreadsheet line describing a kit or a part
#[derive(Debug, Clone)]
pub struct Row<'a> {
    pub id: u64,
    pub title: &'a str,
    pub url: &'a str,
    pub article_numbers: &'a ArticleNumbers,
    pub count: Option<u32>,
    /// Thumbnail on disk; None leaves the picture cell blank
    pub image: Option<PathBuf>,
}

impl<'a> Row<'a> {
    fn new(ticket: &'a Ticket, count: Option<u32>, thumbnail_dir: &Path) -> Self {
        Self {
            id: ticket.id,
            title: &ticket.title,
            url: &ticket.url,
            article_numbers: &ticket.article_numbers,
            count,
            image: find_thumbnail(thumbnail_dir, ticket.id),
        }
    }
}

/// Locate `<id>.<ext>` in `dir`
pub fn find_thumbnail(dir: &Path, id: u64) -> Option<PathBuf> {
    THUMBNAIL_EXTENSIONS
        .iter()
        .map(|ext| dir.join(format!("{}.{}", id, ext)))
        .find(|path| path.is_file())
}

/// Rows of the part overview, in dump order
pub fn part_rows<'a>(dump: &'a Dump, thumbnail_dir: &Path) -> Vec<Row<'a>> {
    dump.parts
        .values()
        .map(|p| Row::new(&p.ticket, None, thumbnail_dir))
        .collect()
}

/// Rows of the kit overview; the count column holds the number of distinct parts
pub fn kit_rows<'a>(dump: &'a Dump, thumbnail_dir: &Path) -> Vec<Row<'a>> {
    dump.kits
        .values()
        .map(|k| Row::new(&k.ticket, Some(k.parts.len() as u32), thumbnail_dir))
        .collect()
}

/// Rows of a single kit's part list, sorted by title
pub fn kit_part_rows<'a>(dump: &'a Dump, kit: &Kit, thumbnail_dir: &Path) -> Vec<Row<'a>> {
    dump.parts_of(kit)
        .into_iter()
        .map(|(p, count)| Row::new(&p.ticket, count, thumbnail_dir))
        .collect()
}

/// File name for a kit workbook: `<id>-<title>.xlsx` with a filesystem-safe title
pub fn kit_file_name(kit: &Kit) -> String {
    let title: String = kit
        .ticket
        .title
        .chars()
        .filter(|c| !matches!(c, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|'))
        .map(|c| if c == ' ' { '_' } else { c })
        .collect();
    format!("{}-{}.xlsx", kit.ticket.id, title)
}

struct Styles {
    bold: Format,
    title: Format,
    text: Format,
}

impl Styles {
    fn new() -> Self {
        Self {
            bold: Format::new().set_bold(),
            title: Format::new().set_bold().set_font_size(14),
            text: Format::new()
                .set_align(FormatAlign::Top)
                .set_font_color(Color::Black),
        }
    }
}

/// Write the header cells and freeze everything above the first data row
fn write_header(sheet: &mut Worksheet, headers: &[&str], row: u32, style: &Format) -> Result<()> {
    for (col, header) in headers.iter().enumerate() {
        sheet.write_string_with_format(row, col as u16, *header, style)?;
    }
    sheet.set_freeze_panes(row + 1, 0)?;
    Ok(())
}

/// Insert a picture, degrading to an empty cell if the file cannot be used
fn insert_image(sheet: &mut Worksheet, row: u32, col: u16, id: u64, path: &Path) {
    let result = Image::new(path).and_then(|img| sheet.insert_image(row, col, &img).map(|_| ()));
    if let Err(e) = result {
        warn!(id, path = %path.display(), "Leaving image cell blank: {}", e);
    }
}

/// Picture | title link | [count] | article numbers
fn write_rows(
    sheet: &mut Worksheet,
    rows: &[Row],
    start_row: u32,
    with_count: bool,
    style: &Format,
) -> Result<()> {
    let article_nos_col: u16 = if with_count { 3 } else { 2 };

    for (offset, row) in rows.iter().enumerate() {
        let row_idx = start_row + offset as u32;
        if let Some(image) = &row.image {
            insert_image(sheet, row_idx, 0, row.id, image);
        }
        sheet.set_row_height(row_idx, IMAGE_ROW_HEIGHT)?;
        sheet.write_url_with_format(row_idx, 1, Url::new(row.url).set_text(row.title), style)?;
        if with_count {
            if let Some(count) = row.count {
                sheet.write_number_with_format(row_idx, 2, count as f64, style)?;
            }
        }
        sheet.write_string_with_format(
            row_idx,
            article_nos_col,
            format_article_numbers(row.article_numbers),
            style,
        )?;
    }

    sheet.set_column_width(0, 20)?;
    sheet.set_column_width(1, 70)?;
    sheet.set_column_width(article_nos_col, 22)?;
    Ok(())
}

fn save(workbook: &mut Workbook, path: &Path) -> Result<()> {
    workbook
        .save(path)
        .with_context(|| format!("Failed to write {}", path.display()))
}

/// Overview of all parts
pub fn create_parts_workbook(dump: &Dump, thumbnail_dir: &Path, path: &Path) -> Result<()> {
    let styles = Styles::new();
    let mut workbook = Workbook::new();
    let sheet = workbook.add_worksheet();
    sheet.set_name("Einzelteile")?;
    write_header(
        sheet,
        &["Bild", "Beschreibung", "Artikelnummer (Jahr)"],
        0,
        &styles.bold,
    )?;
    write_rows(sheet, &part_rows(dump, thumbnail_dir), 1, false, &styles.text)?;
    save(&mut workbook, path)
}

/// Overview of all kits
pub fn create_kits_workbook(dump: &Dump, thumbnail_dir: &Path, path: &Path) -> Result<()> {
    let styles = Styles::new();
    let mut workbook = Workbook::new();
    let sheet = workbook.add_worksheet();
    sheet.set_name("Baukästen")?;
    write_header(
        sheet,
        &["Bild", "Beschreibung", "Teile", "Artikelnummer (Jahr)"],
        0,
        &styles.bold,
    )?;
    write_rows(sheet, &kit_rows(dump, thumbnail_dir), 1, true, &styles.text)?;
    save(&mut workbook, path)
}

/// Part list of a single kit, headed by the kit's title, link and picture
pub fn create_kit_workbook(
    dump: &Dump,
    kit: &Kit,
    kit_thumbnail_dir: &Path,
    part_thumbnail_dir: &Path,
    path: &Path,
) -> Result<()> {
    let styles = Styles::new();
    let mut workbook = Workbook::new();
    let sheet = workbook.add_worksheet();
    sheet.set_name(kit.ticket.id.to_string())?;

    sheet.write_string_with_format(0, 0, &kit.ticket.title, &styles.title)?;
    sheet.write_url_with_format(1, 0, Url::new(&kit.ticket.url), &styles.text)?;
    sheet.write_string(2, 0, format_article_numbers(&kit.ticket.article_numbers))?;
    if let Some(image) = find_thumbnail(kit_thumbnail_dir, kit.ticket.id) {
        insert_image(sheet, 3, 0, kit.ticket.id, &image);
        sheet.set_row_height(3, KIT_IMAGE_ROW_HEIGHT)?;
    }

    write_header(
        sheet,
        &["Bild", "Beschreibung", "Anzahl", "Artikelnummer (Jahr)"],
        4,
        &styles.bold,
    )?;
    let rows = kit_part_rows(dump, kit, part_thumbnail_dir);
    write_rows(sheet, &rows, 5, true, &styles.text)?;
    save(&mut workbook, path)
}

/// Render all workbooks into `out_dir`, returning the paths written
pub fn export(dump: &Dump, thumbnails_root: &Path, out_dir: &Path) -> Result<Vec<PathBuf>> {
    let kits_dir = out_dir.join(KITS_SUBDIR);
    fs::create_dir_all(&kits_dir)
        .with_context(|| format!("Failed to create {}", kits_dir.display()))?;

    let kit_thumbs = thumbnails_root.join("kits");
    let part_thumbs = thumbnails_root.join("parts");
    let mut written = Vec::new();

    let parts_path = out_dir.join(PARTS_FILE);
    create_parts_workbook(dump, &part_thumbs, &parts_path)?;
    written.push(parts_path);

    let kits_path = out_dir.join(KITS_FILE);
    create_kits_workbook(dump, &kit_thumbs, &kits_path)?;
    written.push(kits_path);

    for kit in dump.kits.values().filter(|k| !k.parts.is_empty()) {
        let path = kits_dir.join(kit_file_name(kit));
        match create_kit_workbook(dump, kit, &kit_thumbs, &part_thumbs, &path) {
            Ok(()) => written.push(path),
            Err(e) => warn!(kit = kit.ticket.id, "Skipping kit workbook: {:#}", e),
        }
    }

    Ok(written)
}

pub fn run_excel(dump_path: &Path, thumbnails_root: &Path, out_dir: &Path) -> Result<()> {
    let dump = load_dump(dump_path)?;
    let written = export(&dump, thumbnails_root, out_dir)?;
    info!(files = written.len(), dir = %out_dir.display(), "Wrote workbooks");
    Ok(())
}

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

mod client;
mod crop;
mod dump;
mod excel;
mod images;
mod types;

pub const FTDB_URL: &str = "https://ft-datenbank.de";
/// Category listing all construction kits
pub const KIT_CATEGORY: &str = "653";
/// fischertip kits, dropped from the dump
pub const EXCLUDED_CATEGORY: &str = "661";

pub const DUMP_FILE: &str = "ftdb-dump.json";
pub const IMAGES_DIR: &str = "images";
pub const CROPPED_DIR: &str = "cropped_images";
pub const THUMBNAILS_DIR: &str = "thumbnails";
pub const EXCEL_DIR: &str = "excel";

/// Edge length requested from the thumbnail service
pub const KIT_IMAGE_SIZE: u32 = 200;
pub const PART_IMAGE_SIZE: u32 = 100;

pub const KIT_THUMBNAIL_SIZE: u32 = 200;
pub const PART_THUMBNAIL_SIZE: u32 = 100;
pub const PART_CROP_PADDING: u32 = 2;

#[derive(Parser)]
#[command(name = "ftdb")]
#[command(about = "fischertechnik database dumper, image processor and spreadsheet exporter")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download all construction kits and their parts into ftdb-dump-<date>.json
    Dump {
        /// Directory for the dump and the ftdb-dump.json link
        #[arg(short, long, default_value = ".")]
        output: PathBuf,
    },
    /// Download kit and part images listed in the dump into images/
    Images {
        #[arg(short, long, default_value = DUMP_FILE)]
        dump: PathBuf,
    },
    /// Trim white frames into cropped_images/ and create thumbnails/
    Crop {
        #[arg(short, long, default_value = IMAGES_DIR)]
        images: PathBuf,
    },
    /// Render the dump into XLSX files in excel/
    Excel {
        #[arg(short, long, default_value = DUMP_FILE)]
        dump: PathBuf,
        #[arg(short, long, default_value = THUMBNAILS_DIR)]
        thumbnails: PathBuf,
        #[arg(short, long, default_value = EXCEL_DIR)]
        output: PathBuf,
    },
    /// Remove generated image and spreadsheet directories
    Clean,
}

fn run_clean() -> Result<()> {
    for dir in [IMAGES_DIR, CROPPED_DIR, THUMBNAILS_DIR, EXCEL_DIR] {
        let path = Path::new(dir);
        if path.exists() {
            fs::remove_dir_all(path)?;
            info!("Removed {}/", dir);
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Dump { output } => dump::run_dump(&output),
        Commands::Images { dump } => images::run_images(&dump),
        Commands::Crop { images } => crop::run_crop(&images),
        Commands::Excel {
            dump,
            thumbnails,
            output,
        } => excel::run_excel(&dump, &thumbnails, &output),
        Commands::Clean => run_clean(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_defaults() {
        Cli::command().debug_assert();

        let cli = Cli::try_parse_from(["ftdb", "excel"]).unwrap();
        match cli.command {
            Commands::Excel {
                dump,
                thumbnails,
                output,
            } => {
                assert_eq!(dump, PathBuf::from(DUMP_FILE));
                assert_eq!(thumbnails, PathBuf::from(THUMBNAILS_DIR));
                assert_eq!(output, PathBuf::from(EXCEL_DIR));
            }
            _ => panic!("expected excel subcommand"),
        }
    }
}

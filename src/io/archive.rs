use crate::types::{FindusError, FindusResult};
use chrono::NaiveDate;
use regex::Regex;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use zip::ZipArchive;

/// Suffix of an unpacked product directory
pub const SAFE_SUFFIX: &str = ".SAFE";

/// Identification parsed from a Sentinel-2 product name such as
/// `S2A_MSIL2A_20190614T102031_N0212_R065_T32TMT_20190614T134713`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductName {
    pub name: String,
    /// Tile identifier, e.g. `T32TMT`
    pub tile_id: String,
    pub sensing_date: Option<NaiveDate>,
}

impl ProductName {
    pub fn parse(name: &str) -> FindusResult<Self> {
        let name = strip_product_suffix(name);

        let tile_re = Regex::new(r"_([A-Z]\d{2}[A-Z]{3})_")
            .map_err(|e| FindusError::Processing(format!("Invalid tile pattern: {}", e)))?;
        let tile_id = tile_re
            .captures(name)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .ok_or_else(|| {
                FindusError::InvalidFormat(format!("No tile identifier in product name {}", name))
            })?;

        let date_re = Regex::new(r"_(\d{8})T\d{6}")
            .map_err(|e| FindusError::Processing(format!("Invalid date pattern: {}", e)))?;
        let sensing_date = date_re
            .captures(name)
            .and_then(|c| c.get(1))
            .and_then(|m| NaiveDate::parse_from_str(m.as_str(), "%Y%m%d").ok());

        Ok(Self {
            name: name.to_string(),
            tile_id,
            sensing_date,
        })
    }

    /// Product name of an archive or `.SAFE` directory path
    pub fn from_path<P: AsRef<Path>>(path: P) -> FindusResult<Self> {
        let file_name = path
            .as_ref()
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| {
                FindusError::InvalidFormat(format!(
                    "Not a product path: {}",
                    path.as_ref().display()
                ))
            })?;
        Self::parse(&file_name)
    }
}

/// Drop a trailing `.zip` and/or `.SAFE`
pub fn strip_product_suffix(name: &str) -> &str {
    let name = name.strip_suffix(".zip").unwrap_or(name);
    name.strip_suffix(SAFE_SUFFIX).unwrap_or(name)
}

/// Unpack a downloaded product archive next to itself.
///
/// The archive is extracted into a scratch directory inside `raw_directory`
/// and moved to `<name>.SAFE` once complete; the archive file is removed
/// only after that, so a failed extraction leaves the archive in place.
pub fn extract_product<P: AsRef<Path>, Q: AsRef<Path>>(
    archive_path: P,
    raw_directory: Q,
) -> FindusResult<PathBuf> {
    let archive_path = archive_path.as_ref();
    let raw_directory = raw_directory.as_ref();

    let file_name = archive_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| {
            FindusError::InvalidFormat(format!("Not an archive path: {}", archive_path.display()))
        })?;
    let product_name = strip_product_suffix(&file_name).to_string();
    let target = raw_directory.join(format!("{}{}", product_name, SAFE_SUFFIX));

    log::info!("Unzipping {} -> {}", archive_path.display(), target.display());

    let scratch = tempfile::Builder::new()
        .prefix(".extract-")
        .tempdir_in(raw_directory)?;

    let file = File::open(archive_path)?;
    let mut archive = ZipArchive::new(file)?;
    archive.extract(scratch.path())?;

    // Product archives carry a single `<name>.SAFE` root; anything else is
    // taken as the product tree itself.
    let nested = scratch.path().join(format!("{}{}", product_name, SAFE_SUFFIX));
    let unpacked = if nested.is_dir() {
        nested
    } else {
        single_safe_root(scratch.path())?.unwrap_or_else(|| scratch.path().to_path_buf())
    };

    if target.exists() {
        log::warn!("Replacing existing product directory {}", target.display());
        fs::remove_dir_all(&target)?;
    }
    fs::rename(&unpacked, &target)?;
    drop(scratch);

    fs::remove_file(archive_path)?;
    log::debug!("Removed archive {}", archive_path.display());

    Ok(target)
}

/// Extract every `.zip` in a directory, returning the product directories
pub fn extract_all<P: AsRef<Path>>(raw_directory: P) -> FindusResult<Vec<PathBuf>> {
    let raw_directory = raw_directory.as_ref();
    let mut archives: Vec<PathBuf> = fs::read_dir(raw_directory)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().map(|ext| ext == "zip").unwrap_or(false))
        .collect();
    archives.sort();

    archives
        .iter()
        .map(|archive| extract_product(archive, raw_directory))
        .collect()
}

fn single_safe_root(dir: &Path) -> FindusResult<Option<PathBuf>> {
    let roots: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_dir() && p.to_string_lossy().ends_with(SAFE_SUFFIX))
        .collect();
    Ok(if roots.len() == 1 { roots.into_iter().next() } else { None })
}

use crate::types::{FindusError, FindusResult};
use std::fs;
use std::path::{Path, PathBuf};

/// Scene classification layer code
pub const SCENE_CLASSIFICATION: &str = "SCL";

/// Bands imported when the caller does not choose
pub const DEFAULT_BANDS: [&str; 6] = ["B02", "B03", "B04", "B08", "B11", "SCL"];

/// Band code -> (resolution folder, native resolution in meters), following
/// the Sentinel-2 Level-2A `IMG_DATA` layout
const BAND_TABLE: [(&str, &str, u32); 11] = [
    ("B02", "R10m", 10),
    ("B03", "R10m", 10),
    ("B04", "R10m", 10),
    ("B08", "R10m", 10),
    ("B05", "R20m", 20),
    ("B06", "R20m", 20),
    ("B07", "R20m", 20),
    ("B8A", "R20m", 20),
    ("B11", "R20m", 20),
    ("B12", "R20m", 20),
    ("SCL", "R20m", 20),
];

/// Native resolution folder and pixel size of a band
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BandResolution {
    pub folder: &'static str,
    pub meters: u32,
}

/// Look up a band in the fixed band table
pub fn band_resolution(band: &str) -> Option<BandResolution> {
    BAND_TABLE
        .iter()
        .find(|(code, _, _)| *code == band)
        .map(|&(_, folder, meters)| BandResolution { folder, meters })
}

/// Resolves per-band raster files inside an unpacked `.SAFE` product
pub struct BandLocator {
    product_path: PathBuf,
}

impl BandLocator {
    pub fn new<P: AsRef<Path>>(product_path: P) -> Self {
        Self {
            product_path: product_path.as_ref().to_path_buf(),
        }
    }

    /// `GRANULE/<granule>/IMG_DATA` of the product
    pub fn image_directory(&self) -> FindusResult<PathBuf> {
        let granule_root = self.product_path.join("GRANULE");
        let mut granules = list_sorted(&granule_root).map_err(|_| {
            FindusError::ResourceNotFound(format!(
                "No GRANULE directory in {}",
                self.product_path.display()
            ))
        })?;
        granules.retain(|p| p.is_dir());

        let granule = granules.into_iter().next().ok_or_else(|| {
            FindusError::ResourceNotFound(format!(
                "Empty GRANULE directory in {}",
                self.product_path.display()
            ))
        })?;

        Ok(granule.join("IMG_DATA"))
    }

    /// Path of a single band
    pub fn locate(&self, band: &str) -> FindusResult<PathBuf> {
        let resolution = band_resolution(band).ok_or_else(|| {
            FindusError::ResourceNotFound(format!("Band {} is not in the band table", band))
        })?;

        let band_directory = self.image_directory()?.join(resolution.folder);
        let files = list_sorted(&band_directory).map_err(|_| {
            FindusError::ResourceNotFound(format!(
                "Missing {} folder for band {} in {}",
                resolution.folder,
                band,
                self.product_path.display()
            ))
        })?;

        files
            .into_iter()
            .find(|p| {
                p.file_name()
                    .map(|name| name.to_string_lossy().contains(band))
                    .unwrap_or(false)
            })
            .ok_or_else(|| {
                FindusError::ResourceNotFound(format!(
                    "No file for band {} in {}",
                    band,
                    band_directory.display()
                ))
            })
    }

    /// Resolve every band independently
    pub fn locate_each(&self, bands: &[&str]) -> Vec<(String, FindusResult<PathBuf>)> {
        bands
            .iter()
            .map(|band| (band.to_string(), self.locate(band)))
            .collect()
    }

    /// Resolve all bands, failing on the first one that is missing
    pub fn locate_all(&self, bands: &[&str]) -> FindusResult<Vec<(String, PathBuf)>> {
        let mut paths = Vec::with_capacity(bands.len());
        for band in bands {
            let path = self.locate(band)?;
            log::debug!("Band {} -> {}", band, path.display());
            paths.push((band.to_string(), path));
        }
        Ok(paths)
    }
}

fn list_sorted(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut entries = fs::read_dir(dir)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<std::io::Result<Vec<_>>>()?;
    entries.sort();
    Ok(entries)
}

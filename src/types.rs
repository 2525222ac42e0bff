use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Reflectance or class values of one band, always held as floats so that
/// masked pixels can carry NaN
pub type BandImage = Array2<f32>;

/// Superpixel labels
pub type LabelImage = Array2<u32>;

/// Geospatial transformation parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub top_left_x: f64,
    pub pixel_width: f64,
    pub rotation_x: f64,
    pub top_left_y: f64,
    pub rotation_y: f64,
    pub pixel_height: f64,
}

impl GeoTransform {
    /// Build from the GDAL coefficient order
    pub fn from_gdal(gt: [f64; 6]) -> Self {
        Self {
            top_left_x: gt[0],
            pixel_width: gt[1],
            rotation_x: gt[2],
            top_left_y: gt[3],
            rotation_y: gt[4],
            pixel_height: gt[5],
        }
    }

    pub fn to_gdal(&self) -> [f64; 6] {
        [
            self.top_left_x,
            self.pixel_width,
            self.rotation_x,
            self.top_left_y,
            self.rotation_y,
            self.pixel_height,
        ]
    }

    /// Map coordinates of a (fractional) pixel position
    pub fn pixel_to_geo(&self, col: f64, row: f64) -> (f64, f64) {
        (
            self.top_left_x + col * self.pixel_width + row * self.rotation_x,
            self.top_left_y + col * self.rotation_y + row * self.pixel_height,
        )
    }

    /// Fractional pixel position of map coordinates (north-up only)
    pub fn geo_to_pixel(&self, x: f64, y: f64) -> (f64, f64) {
        (
            (x - self.top_left_x) / self.pixel_width,
            (y - self.top_left_y) / self.pixel_height,
        )
    }

    /// Transform of a window starting at the given pixel offset
    pub fn shifted(&self, col_off: usize, row_off: usize) -> Self {
        let (x, y) = self.pixel_to_geo(col_off as f64, row_off as f64);
        Self {
            top_left_x: x,
            top_left_y: y,
            ..*self
        }
    }
}

/// Georeferencing shared by a raster and everything derived from it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoMeta {
    pub geo_transform: GeoTransform,
    /// Projection as WKT, empty when the source carried none
    pub projection: String,
    pub width: usize,
    pub height: usize,
    pub nodata: Option<f64>,
}

impl GeoMeta {
    /// Metadata of the same footprint on a grid `zoom` times finer
    pub fn refined(&self, zoom: usize) -> Self {
        let z = zoom as f64;
        Self {
            geo_transform: GeoTransform {
                pixel_width: self.geo_transform.pixel_width / z,
                rotation_x: self.geo_transform.rotation_x / z,
                rotation_y: self.geo_transform.rotation_y / z,
                pixel_height: self.geo_transform.pixel_height / z,
                ..self.geo_transform
            },
            width: self.width * zoom,
            height: self.height * zoom,
            ..self.clone()
        }
    }

    /// Same origin, trimmed to `(height, width)`
    pub fn with_shape(&self, (height, width): (usize, usize)) -> Self {
        Self {
            width,
            height,
            ..self.clone()
        }
    }

    /// Absolute pixel size in map units
    pub fn resolution(&self) -> f64 {
        self.geo_transform.pixel_width.abs()
    }
}

/// One band of one product together with its georeferencing
#[derive(Debug, Clone)]
pub struct BandRaster {
    pub data: BandImage,
    pub meta: GeoMeta,
}

/// Temporally aggregated bands on one shared grid
#[derive(Debug, Clone)]
pub struct Composite {
    pub bands: BTreeMap<String, BandImage>,
    pub meta: GeoMeta,
    /// Number of products that contributed to every band
    pub depth: usize,
}

impl Composite {
    pub fn band(&self, code: &str) -> Option<&BandImage> {
        self.bands.get(code)
    }

    pub fn band_codes(&self) -> Vec<String> {
        self.bands.keys().cloned().collect()
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.meta.height, self.meta.width)
    }
}

/// Superpixel label raster for one composite band
#[derive(Debug, Clone)]
pub struct Segmentation {
    pub labels: LabelImage,
    pub meta: GeoMeta,
    /// Band the segmentation was derived from
    pub band: String,
}

impl Segmentation {
    /// Number of distinct labels
    pub fn segment_count(&self) -> usize {
        let mut labels: Vec<u32> = self.labels.iter().copied().collect();
        labels.sort_unstable();
        labels.dedup();
        labels.len()
    }
}

/// Error types for AOI processing
#[derive(Debug, thiserror::Error)]
pub enum FindusError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("GDAL error: {0}")]
    Gdal(#[from] gdal::errors::GdalError),

    #[error("Archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    #[error("Dimension mismatch: expected {expected:?}, found {found:?}")]
    DimensionMismatch {
        expected: (usize, usize),
        found: (usize, usize),
    },

    #[error("Catalog failure: {0}")]
    CatalogFailure(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Invalid data format: {0}")]
    InvalidFormat(String),

    #[error("Processing error: {0}")]
    Processing(String),
}

/// Result type for AOI processing
pub type FindusResult<T> = Result<T, FindusError>;

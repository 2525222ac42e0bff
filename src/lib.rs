//! Findus: Sentinel-2 field segmentation over an area of interest
//!
//! This library downloads Level-2A products for a polygon, crops their bands,
//! builds a cloud-masked temporal composite and segments it into
//! superpixels that are written as a labelled GeoTIFF.

pub mod types;
pub mod io;
pub mod core;
pub mod config;
pub mod aoi;

#[cfg(feature = "python")]
mod python;

// Re-export main types and functions for easier access
pub use types::{
    BandImage, BandRaster, Composite, FindusError, FindusResult, GeoMeta, GeoTransform, LabelImage,
    Segmentation,
};

pub use aoi::{reproject_polygon, Aoi, AoiDirectories};
pub use config::PipelineConfig;
pub use io::{BandLocator, DirectoryCatalog, HttpCatalog, ProductCatalog};

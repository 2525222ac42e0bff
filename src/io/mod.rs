//! Product access: catalog, archives, band files and raster I/O

pub mod archive;
pub mod band_locator;
pub mod catalog;
pub mod raster;

pub use archive::{extract_all, extract_product, ProductName};
pub use band_locator::{
    band_resolution, BandLocator, BandResolution, DEFAULT_BANDS, SCENE_CLASSIFICATION,
};
pub use catalog::{
    rank_by_cloud_cover, select_best, CatalogQuery, DirectoryCatalog, HttpCatalog, ProductCatalog,
    ProductEntry,
};
pub use raster::{dataset_meta, read_band, write_geotiff, write_raster};

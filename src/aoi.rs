//! Area-of-interest orchestration.
//!
//! An [`Aoi`] owns the polygon, its CRS and the on-disk layout
//! `<base>/<name>/Data/{Raw,Processed}` and `<base>/<name>/Results`. Every
//! stage returns its artifact; nothing is cached on the AOI itself.

use crate::config::PipelineConfig;
use crate::core::{
    export_segmentation, Aggregation, AoiCropper, CloudMaskBuilder, ProductLayers,
    SegmentationParams, Segmenter, TemporalCompositor,
};
use crate::io::{
    band_resolution, extract_all, read_band, select_best, write_geotiff, BandLocator,
    CatalogQuery, ProductCatalog, ProductEntry, ProductName,
};
use crate::io::archive::SAFE_SUFFIX;
use crate::types::{Composite, FindusError, FindusResult, Segmentation};
use chrono::NaiveDate;
use gdal::spatial_ref::{CoordTransform, SpatialRef};
use gdal::Dataset;
use geo::{LineString, Polygon};
use std::fs;
use std::path::{Path, PathBuf};

/// File name of the exported label raster
pub const SEGMENTS_FILE: &str = "segments.tif";

/// CRS understood by product catalogs
const CATALOG_CRS: &str = "EPSG:4326";

/// Managed storage locations of one AOI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AoiDirectories {
    pub raw: PathBuf,
    pub processed: PathBuf,
    pub results: PathBuf,
}

impl AoiDirectories {
    pub fn new<P: AsRef<Path>>(base_directory: P, name: &str) -> Self {
        let root = base_directory.as_ref().join(name);
        Self {
            raw: root.join("Data").join("Raw"),
            processed: root.join("Data").join("Processed"),
            results: root.join("Results"),
        }
    }

    pub fn create_all(&self) -> FindusResult<()> {
        for dir in [&self.raw, &self.processed, &self.results] {
            if !dir.is_dir() {
                log::debug!("Creating {}", dir.display());
                fs::create_dir_all(dir)?;
            }
        }
        Ok(())
    }
}

/// Target polygon with its storage layout
#[derive(Debug, Clone)]
pub struct Aoi {
    name: String,
    original_bounds: Polygon<f64>,
    source_crs: String,
    working_crs: String,
    bounds: Polygon<f64>,
    directories: AoiDirectories,
}

impl Aoi {
    /// Create an AOI from a polygon in `source_crs`, reprojecting it to
    /// `working_crs` and creating the directory layout
    pub fn new<P: AsRef<Path>>(
        bounds: Polygon<f64>,
        name: &str,
        base_directory: P,
        source_crs: &str,
        working_crs: &str,
    ) -> FindusResult<Self> {
        let projected = reproject_polygon(&bounds, source_crs, working_crs)?;
        let directories = AoiDirectories::new(base_directory, name);
        directories.create_all()?;

        log::info!(
            "AOI {} ready in {} ({} -> {})",
            name,
            directories.results.parent().unwrap_or(&directories.results).display(),
            source_crs,
            working_crs
        );

        Ok(Self {
            name: name.to_string(),
            original_bounds: bounds,
            source_crs: source_crs.to_string(),
            working_crs: working_crs.to_string(),
            bounds: projected,
            directories,
        })
    }

    pub fn from_config(
        bounds: Polygon<f64>,
        name: &str,
        config: &PipelineConfig,
    ) -> FindusResult<Self> {
        Self::new(
            bounds,
            name,
            &config.base_directory,
            &config.source_crs,
            &config.working_crs,
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Polygon in the working CRS
    pub fn bounds(&self) -> &Polygon<f64> {
        &self.bounds
    }

    /// Polygon as given, in the source CRS
    pub fn original_bounds(&self) -> &Polygon<f64> {
        &self.original_bounds
    }

    pub fn working_crs(&self) -> &str {
        &self.working_crs
    }

    pub fn directories(&self) -> &AoiDirectories {
        &self.directories
    }

    /// Polygon expressed in another CRS; the working CRS maps to `bounds()`
    pub fn reproject_to(&self, crs: &str) -> FindusResult<Polygon<f64>> {
        reproject_polygon(&self.bounds, &self.working_crs, crs)
    }

    /// Polygon in the CRS of a band dataset. Rasters without a projection are
    /// assumed to be in the working CRS.
    fn footprint_for(&self, dataset: &Dataset) -> FindusResult<Polygon<f64>> {
        let wkt = dataset.projection();
        if wkt.is_empty() {
            return Ok(self.bounds.clone());
        }
        let mut band_srs = SpatialRef::from_wkt(&wkt)?;
        let working_srs = spatial_ref(&self.working_crs)?;
        if band_srs == working_srs {
            return Ok(self.bounds.clone());
        }
        log::debug!("Reprojecting AOI into band CRS for {}", self.name);
        band_srs.set_axis_mapping_strategy(
            gdal_sys::OSRAxisMappingStrategy::OAMS_TRADITIONAL_GIS_ORDER,
        );
        transform_polygon(&self.bounds, &working_srs, &band_srs)
    }

    /// Ask a catalog for acquisitions over this AOI
    pub fn request_data(
        &self,
        catalog: &dyn ProductCatalog,
        start_date: NaiveDate,
        end_date: NaiveDate,
    ) -> FindusResult<Vec<ProductEntry>> {
        let footprint = reproject_polygon(&self.original_bounds, &self.source_crs, CATALOG_CRS)?;
        let query = CatalogQuery::new(footprint, start_date, end_date);
        catalog.query(&query)
    }

    /// Download the `num_images` least cloudy products and unpack them into
    /// the raw directory. Any catalog error aborts.
    pub fn download_data(
        &self,
        catalog: &dyn ProductCatalog,
        available: Vec<ProductEntry>,
        num_images: usize,
    ) -> FindusResult<Vec<PathBuf>> {
        let selected = select_best(available, num_images);
        log::info!("Downloading {} products for {}", selected.len(), self.name);

        for entry in &selected {
            log::info!("{} (cloud cover {:.1}%)", entry.name, entry.cloud_cover);
            catalog.download(entry, &self.directories.raw)?;
        }
        log::info!("Finished data download");

        extract_all(&self.directories.raw)
    }

    /// Unpacked products in the raw directory
    pub fn raw_products(&self) -> FindusResult<Vec<PathBuf>> {
        let mut products: Vec<PathBuf> = fs::read_dir(&self.directories.raw)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_dir() && p.to_string_lossy().ends_with(SAFE_SUFFIX))
            .collect();
        products.sort();
        Ok(products)
    }

    /// Crop the requested bands of one product into
    /// `Processed/<product>/<band>.<ext>`
    pub fn process_raw_product<P: AsRef<Path>>(
        &self,
        product_path: P,
        bands: &[&str],
    ) -> FindusResult<PathBuf> {
        let product_path = product_path.as_ref();
        let product = ProductName::from_path(product_path)?;
        log::info!("Processing {} (tile {})", product.name, product.tile_id);

        let band_paths = BandLocator::new(product_path).locate_all(bands)?;

        let export_directory = self.directories.processed.join(&product.name);
        fs::create_dir_all(&export_directory)?;

        for (band, path) in band_paths {
            let dataset = Dataset::open(&path)?;
            let cropper = AoiCropper::new(self.footprint_for(&dataset)?);
            drop(dataset);

            let extension = path
                .extension()
                .map(|e| e.to_string_lossy().to_string())
                .unwrap_or_else(|| "jp2".to_string());
            let target = export_directory.join(format!("{}.{}", band, extension));
            let meta = cropper.crop_to_file(&path, &target)?;
            log::debug!("{} {}: {}x{}", product.name, band, meta.width, meta.height);
        }

        Ok(export_directory)
    }

    /// Process every raw product, skipping (and logging) the ones that fail
    pub fn start_raw_product_processing(&self, bands: &[&str]) -> FindusResult<Vec<PathBuf>> {
        log::info!("Start processing of raw products");
        let mut processed = Vec::new();
        for product in self.raw_products()? {
            match self.process_raw_product(&product, bands) {
                Ok(dir) => processed.push(dir),
                Err(e) => log::warn!("Skipping {}: {}", product.display(), e),
            }
        }
        log::info!("Processed {} products", processed.len());
        Ok(processed)
    }

    /// Read the cropped bands of one processed product
    pub fn load_processed_product<P: AsRef<Path>>(
        &self,
        directory: P,
    ) -> FindusResult<ProductLayers> {
        let directory = directory.as_ref();
        let name = directory
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let mut layers = ProductLayers::new(&name);

        let mut files: Vec<PathBuf> = fs::read_dir(directory)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file())
            .collect();
        files.sort();

        for file in files {
            let band = match file.file_stem().map(|s| s.to_string_lossy().to_string()) {
                Some(stem) if band_resolution(&stem).is_some() => stem,
                _ => continue,
            };
            layers.insert(&band, read_band(&file)?);
        }

        Ok(layers)
    }

    /// Composite every processed product; unreadable or incomplete products
    /// are logged and left out
    pub fn combine_processed_products(
        &self,
        bands: &[&str],
        mask_builder: CloudMaskBuilder,
        aggregation: Aggregation,
    ) -> FindusResult<Composite> {
        let mut compositor = TemporalCompositor::new(bands, mask_builder);

        let mut directories: Vec<PathBuf> = fs::read_dir(&self.directories.processed)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_dir())
            .collect();
        directories.sort();

        for directory in directories {
            let added = self
                .load_processed_product(&directory)
                .and_then(|layers| compositor.add_product(&layers));
            if let Err(e) = added {
                log::warn!("Leaving {} out of the composite: {}", directory.display(), e);
            }
        }

        compositor.finish(aggregation)
    }

    /// Segment one composite band and save it as `Results/segments.tif`
    pub fn perform_image_segmentation(
        &self,
        composite: &Composite,
        band: &str,
        params: SegmentationParams,
    ) -> FindusResult<Segmentation> {
        let segmentation = Segmenter::with_params(params).segment_composite(composite, band)?;
        export_segmentation(&segmentation, self.segments_path())?;
        Ok(segmentation)
    }

    pub fn segments_path(&self) -> PathBuf {
        self.directories.results.join(SEGMENTS_FILE)
    }

    /// Save every composite band as `Results/composite_<band>.tif`
    pub fn export_composite(&self, composite: &Composite) -> FindusResult<Vec<PathBuf>> {
        let mut meta = composite.meta.clone();
        meta.nodata = Some(f64::NAN);

        let mut written = Vec::new();
        for (band, image) in &composite.bands {
            let path = self.directories.results.join(format!("composite_{}.tif", band));
            write_geotiff(&path, image, &meta)?;
            written.push(path);
        }
        Ok(written)
    }

    /// Crop, composite and segment everything already in the raw directory
    pub fn run(&self, config: &PipelineConfig) -> FindusResult<(Composite, Segmentation)> {
        config.validate()?;
        let bands = config.band_refs();

        self.start_raw_product_processing(&bands)?;
        let composite =
            self.combine_processed_products(&bands, config.mask_builder(), config.aggregation)?;
        let segmentation = self.perform_image_segmentation(
            &composite,
            &config.segmentation_band,
            config.segmentation.clone(),
        )?;

        Ok((composite, segmentation))
    }

    /// Query the catalog, download the `config.num_images` least cloudy
    /// acquisitions between the two dates and run the pipeline on them
    pub fn run_from_catalog(
        &self,
        catalog: &dyn ProductCatalog,
        start_date: NaiveDate,
        end_date: NaiveDate,
        config: &PipelineConfig,
    ) -> FindusResult<(Composite, Segmentation)> {
        config.validate()?;

        let available = self.request_data(catalog, start_date, end_date)?;
        if available.is_empty() {
            return Err(FindusError::ResourceNotFound(format!(
                "No acquisitions for {} between {} and {}",
                self.name, start_date, end_date
            )));
        }
        self.download_data(catalog, available, config.num_images)?;

        self.run(config)
    }
}

fn spatial_ref(definition: &str) -> FindusResult<SpatialRef> {
    let mut srs = SpatialRef::from_definition(definition)?;
    srs.set_axis_mapping_strategy(gdal_sys::OSRAxisMappingStrategy::OAMS_TRADITIONAL_GIS_ORDER);
    Ok(srs)
}

/// Reproject a polygon between two CRS definitions (`EPSG:xxxx`, WKT, ...);
/// identical definitions return the polygon unchanged
pub fn reproject_polygon(
    polygon: &Polygon<f64>,
    from: &str,
    to: &str,
) -> FindusResult<Polygon<f64>> {
    if from == to {
        return Ok(polygon.clone());
    }
    transform_polygon(polygon, &spatial_ref(from)?, &spatial_ref(to)?)
}

fn transform_polygon(
    polygon: &Polygon<f64>,
    from: &SpatialRef,
    to: &SpatialRef,
) -> FindusResult<Polygon<f64>> {
    let transform = CoordTransform::new(from, to)?;
    let exterior = transform_ring(polygon.exterior(), &transform)?;
    let interiors = polygon
        .interiors()
        .iter()
        .map(|ring| transform_ring(ring, &transform))
        .collect::<FindusResult<Vec<_>>>()?;
    Ok(Polygon::new(exterior, interiors))
}

fn transform_ring(
    ring: &LineString<f64>,
    transform: &CoordTransform,
) -> FindusResult<LineString<f64>> {
    let mut xs: Vec<f64> = ring.coords().map(|c| c.x).collect();
    let mut ys: Vec<f64> = ring.coords().map(|c| c.y).collect();
    let mut zs = vec![0.0; xs.len()];
    transform.transform_coords(&mut xs, &mut ys, &mut zs)?;

    if xs.iter().chain(ys.iter()).any(|v| !v.is_finite()) {
        return Err(FindusError::Processing(
            "Polygon could not be reprojected".to_string(),
        ));
    }
    Ok(LineString::from(xs.into_iter().zip(ys).collect::<Vec<(f64, f64)>>()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::{polygon, Area, BoundingRect};

    fn aoi_polygon() -> Polygon<f64> {
        polygon![
            (x: 8.50, y: 47.30),
            (x: 8.52, y: 47.30),
            (x: 8.52, y: 47.32),
            (x: 8.50, y: 47.32),
        ]
    }

    #[test]
    fn test_directories_are_created() {
        let base = tempfile::tempdir().unwrap();
        let aoi = Aoi::new(aoi_polygon(), "GRF", base.path(), "EPSG:4326", "EPSG:32632").unwrap();

        let dirs = aoi.directories();
        assert_eq!(dirs.raw, base.path().join("GRF/Data/Raw"));
        assert_eq!(dirs.processed, base.path().join("GRF/Data/Processed"));
        assert_eq!(dirs.results, base.path().join("GRF/Results"));
        assert!(dirs.raw.is_dir() && dirs.processed.is_dir() && dirs.results.is_dir());
        assert_eq!(aoi.segments_path(), base.path().join("GRF/Results/segments.tif"));
    }

    #[test]
    fn test_bounds_are_in_working_crs() {
        let base = tempfile::tempdir().unwrap();
        let aoi = Aoi::new(aoi_polygon(), "GRF", base.path(), "EPSG:4326", "EPSG:32632").unwrap();

        let rect = aoi.bounds().bounding_rect().unwrap();
        // UTM 32N easting/northing around Zurich
        assert!(rect.min().x > 400_000.0 && rect.max().x < 500_000.0);
        assert!(rect.min().y > 5_200_000.0 && rect.max().y < 5_300_000.0);
        // roughly 1.5 km x 2.2 km
        let area = aoi.bounds().unsigned_area();
        assert!(area > 2.5e6 && area < 4.0e6, "area {}", area);

        // reprojecting to the CRS it is already in is the identity
        assert_eq!(&aoi.reproject_to("EPSG:32632").unwrap(), aoi.bounds());
    }

    #[test]
    fn test_round_trip_reprojection() {
        let there = reproject_polygon(&aoi_polygon(), "EPSG:4326", "EPSG:32632").unwrap();
        let back = reproject_polygon(&there, "EPSG:32632", "EPSG:4326").unwrap();
        for (a, b) in back.exterior().coords().zip(aoi_polygon().exterior().coords()) {
            assert!((a.x - b.x).abs() < 1e-7 && (a.y - b.y).abs() < 1e-7);
        }
    }
}

use crate::io::raster::{dataset_meta, write_raster};
use crate::types::{BandRaster, FindusError, FindusResult, GeoMeta};
use gdal::raster::{GdalDataType, GdalType};
use gdal::Dataset;
use geo::{BoundingRect, Intersects, Point, Polygon};
use ndarray::{Array2, Zip};
use num_traits::{NumCast, Zero};
use std::path::Path;

/// Tolerance used when snapping polygon bounds onto the pixel grid
const GRID_EPSILON: f64 = 1e-6;

/// Pixel window of a raster, in pixels from the top-left corner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelWindow {
    pub col_off: usize,
    pub row_off: usize,
    pub width: usize,
    pub height: usize,
}

/// Crops band rasters to an AOI polygon.
///
/// The polygon must already be expressed in the raster's CRS; no
/// reprojection happens here.
pub struct AoiCropper {
    footprint: Polygon<f64>,
}

impl AoiCropper {
    pub fn new(footprint: Polygon<f64>) -> Self {
        Self { footprint }
    }

    pub fn footprint(&self) -> &Polygon<f64> {
        &self.footprint
    }

    /// Window covering the polygon's bounding box, rounded outwards and
    /// clipped to the raster
    pub fn window(&self, meta: &GeoMeta) -> FindusResult<PixelWindow> {
        let rect = self
            .footprint
            .bounding_rect()
            .ok_or_else(|| FindusError::InvalidParameter("Empty AOI polygon".to_string()))?;

        let gt = &meta.geo_transform;
        let (c_a, r_a) = gt.geo_to_pixel(rect.min().x, rect.max().y);
        let (c_b, r_b) = gt.geo_to_pixel(rect.max().x, rect.min().y);

        let col0 = (c_a.min(c_b) + GRID_EPSILON).floor().max(0.0);
        let row0 = (r_a.min(r_b) + GRID_EPSILON).floor().max(0.0);
        let col1 = (c_a.max(c_b) - GRID_EPSILON).ceil().min(meta.width as f64);
        let row1 = (r_a.max(r_b) - GRID_EPSILON).ceil().min(meta.height as f64);

        if col1 <= col0 || row1 <= row0 {
            return Err(FindusError::ResourceNotFound(
                "AOI does not overlap the raster".to_string(),
            ));
        }

        Ok(PixelWindow {
            col_off: col0 as usize,
            row_off: row0 as usize,
            width: (col1 - col0) as usize,
            height: (row1 - row0) as usize,
        })
    }

    /// Georeferencing of a window of `meta`. Sources without a no-data
    /// value get 0, the value written outside the polygon.
    pub fn window_meta(meta: &GeoMeta, window: &PixelWindow) -> GeoMeta {
        GeoMeta {
            geo_transform: meta.geo_transform.shifted(window.col_off, window.row_off),
            width: window.width,
            height: window.height,
            nodata: meta.nodata.or(Some(0.0)),
            ..meta.clone()
        }
    }

    /// Which pixels of a grid have their centre inside the polygon
    pub fn inside_mask(&self, meta: &GeoMeta) -> Array2<bool> {
        let gt = meta.geo_transform;
        Array2::from_shape_fn((meta.height, meta.width), |(row, col)| {
            let (x, y) = gt.pixel_to_geo(col as f64 + 0.5, row as f64 + 0.5);
            self.footprint.intersects(&Point::new(x, y))
        })
    }

    /// Crop the first band of a dataset into memory as `f32`
    pub fn crop(&self, dataset: &Dataset) -> FindusResult<BandRaster> {
        let meta = dataset_meta(dataset)?;
        let window = self.window(&meta)?;
        let out_meta = Self::window_meta(&meta, &window);
        let inside = self.inside_mask(&out_meta);

        let mut data = read_window::<f32>(dataset, &window)?;
        let fill = out_meta.nodata.map(|v| v as f32).unwrap_or(0.0);
        Zip::from(&mut data).and(&inside).for_each(|value, &keep| {
            if !keep {
                *value = fill;
            }
        });

        Ok(BandRaster {
            data,
            meta: out_meta,
        })
    }

    /// Crop a band file and write the result with the source's driver and
    /// pixel type
    pub fn crop_to_file<P: AsRef<Path>, Q: AsRef<Path>>(
        &self,
        source: P,
        target: Q,
    ) -> FindusResult<GeoMeta> {
        log::debug!(
            "Cropping {} -> {}",
            source.as_ref().display(),
            target.as_ref().display()
        );

        let dataset = Dataset::open(source.as_ref())?;
        let meta = dataset_meta(&dataset)?;
        let window = self.window(&meta)?;
        let out_meta = Self::window_meta(&meta, &window);
        let driver = dataset.driver().short_name();

        let band_type = dataset.rasterband(1)?.band_type();
        let target = target.as_ref();
        let (ds, win, meta) = (&dataset, &window, &out_meta);
        match band_type {
            GdalDataType::UInt8 => self.write_window::<u8>(ds, win, meta, &driver, target)?,
            GdalDataType::UInt16 => self.write_window::<u16>(ds, win, meta, &driver, target)?,
            GdalDataType::Int16 => self.write_window::<i16>(ds, win, meta, &driver, target)?,
            GdalDataType::UInt32 => self.write_window::<u32>(ds, win, meta, &driver, target)?,
            GdalDataType::Int32 => self.write_window::<i32>(ds, win, meta, &driver, target)?,
            GdalDataType::Float32 => self.write_window::<f32>(ds, win, meta, &driver, target)?,
            _ => self.write_window::<f64>(ds, win, meta, &driver, target)?,
        }

        Ok(out_meta)
    }

    fn write_window<T>(
        &self,
        dataset: &Dataset,
        window: &PixelWindow,
        out_meta: &GeoMeta,
        driver: &str,
        target: &Path,
    ) -> FindusResult<()>
    where
        T: GdalType + Copy + NumCast + Zero,
    {
        let mut data = read_window::<T>(dataset, window)?;
        let inside = self.inside_mask(out_meta);
        let fill = out_meta
            .nodata
            .and_then(|v| <T as NumCast>::from(v))
            .unwrap_or_else(T::zero);

        Zip::from(&mut data).and(&inside).for_each(|value, &keep| {
            if !keep {
                *value = fill;
            }
        });

        write_raster(target, driver, &data, out_meta)
    }
}

fn read_window<T: GdalType + Copy>(
    dataset: &Dataset,
    window: &PixelWindow,
) -> FindusResult<Array2<T>> {
    let rasterband = dataset.rasterband(1)?;
    let buffer = rasterband.read_as::<T>(
        (window.col_off as isize, window.row_off as isize),
        (window.width, window.height),
        (window.width, window.height),
        None,
    )?;
    Array2::from_shape_vec((window.height, window.width), buffer.data)
        .map_err(|e| FindusError::Processing(format!("Failed to reshape cropped window: {}", e)))
}

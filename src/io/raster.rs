use crate::types::{BandRaster, FindusError, FindusResult, GeoMeta, GeoTransform};
use gdal::raster::{Buffer, GdalType};
use gdal::{Dataset, DriverManager};
use ndarray::Array2;
use std::path::Path;

/// Georeferencing of the first band of an open dataset
pub fn dataset_meta(dataset: &Dataset) -> FindusResult<GeoMeta> {
    let geo_transform = dataset.geo_transform()?;
    let (width, height) = dataset.raster_size();
    let nodata = dataset.rasterband(1)?.no_data_value();

    Ok(GeoMeta {
        geo_transform: GeoTransform::from_gdal(geo_transform),
        projection: dataset.projection(),
        width,
        height,
        nodata,
    })
}

/// Read the first band of a raster as `f32` along with its georeferencing
pub fn read_band<P: AsRef<Path>>(path: P) -> FindusResult<BandRaster> {
    log::debug!("Reading band raster: {}", path.as_ref().display());

    let dataset = Dataset::open(path.as_ref())?;
    let meta = dataset_meta(&dataset)?;

    let rasterband = dataset.rasterband(1)?;
    let buffer = rasterband.read_as::<f32>(
        (0, 0),
        (meta.width, meta.height),
        (meta.width, meta.height),
        None,
    )?;

    let data = Array2::from_shape_vec((meta.height, meta.width), buffer.data)
        .map_err(|e| FindusError::Processing(format!("Failed to reshape band data: {}", e)))?;

    Ok(BandRaster { data, meta })
}

/// Write a single-band raster through the named GDAL driver.
///
/// GeoTIFF is created directly; any other driver (JPEG2000 in particular,
/// which only supports copies) is written through an in-memory dataset.
pub fn write_raster<T, P>(
    path: P,
    driver_name: &str,
    data: &Array2<T>,
    meta: &GeoMeta,
) -> FindusResult<()>
where
    T: GdalType + Copy,
    P: AsRef<Path>,
{
    let (height, width) = data.dim();
    if (height, width) != (meta.height, meta.width) {
        return Err(FindusError::DimensionMismatch {
            expected: (meta.height, meta.width),
            found: (height, width),
        });
    }

    log::debug!(
        "Writing {}x{} raster with {} to {}",
        width,
        height,
        driver_name,
        path.as_ref().display()
    );

    if driver_name == "GTiff" {
        let driver = DriverManager::get_driver_by_name("GTiff")?;
        let mut dataset = driver.create_with_band_type::<T, _>(
            path.as_ref(),
            width as isize,
            height as isize,
            1,
        )?;
        fill_dataset(&mut dataset, data, meta)?;
        return Ok(());
    }

    let mem_driver = DriverManager::get_driver_by_name("MEM")?;
    let mut staging =
        mem_driver.create_with_band_type::<T, _>("", width as isize, height as isize, 1)?;
    fill_dataset(&mut staging, data, meta)?;

    let driver = DriverManager::get_driver_by_name(driver_name)?;
    staging.create_copy(&driver, path.as_ref(), &[])?;
    Ok(())
}

/// Write a single-band GeoTIFF
pub fn write_geotiff<T, P>(path: P, data: &Array2<T>, meta: &GeoMeta) -> FindusResult<()>
where
    T: GdalType + Copy,
    P: AsRef<Path>,
{
    write_raster(path, "GTiff", data, meta)
}

fn fill_dataset<T: GdalType + Copy>(
    dataset: &mut Dataset,
    data: &Array2<T>,
    meta: &GeoMeta,
) -> FindusResult<()> {
    let (height, width) = data.dim();

    dataset.set_geo_transform(&meta.geo_transform.to_gdal())?;
    if !meta.projection.is_empty() {
        dataset.set_projection(&meta.projection)?;
    }

    let mut rasterband = dataset.rasterband(1)?;
    let flat_data: Vec<T> = data.iter().cloned().collect();
    let buffer = Buffer::new((width, height), flat_data);
    rasterband.write((0, 0), (width, height), &buffer)?;

    if let Some(nodata) = meta.nodata {
        rasterband.set_no_data_value(Some(nodata))?;
    }

    Ok(())
}

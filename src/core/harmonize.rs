use crate::io::band_resolution;
use crate::types::{BandImage, BandRaster, FindusError, FindusResult, GeoMeta};
use ndarray::{s, Array2};
use std::collections::BTreeMap;

/// Bands of one product on their native grids, keyed by band code
#[derive(Debug, Clone, Default)]
pub struct ProductLayers {
    pub name: String,
    pub bands: BTreeMap<String, BandRaster>,
}

impl ProductLayers {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            bands: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, band: &str, raster: BandRaster) {
        self.bands.insert(band.to_string(), raster);
    }
}

/// Bands of one product resampled onto its finest grid
#[derive(Debug, Clone)]
pub struct HarmonizedProduct {
    pub name: String,
    pub bands: BTreeMap<String, BandImage>,
    pub meta: GeoMeta,
}

/// Integer upscaling factor from a native to a finer target resolution
pub fn zoom_factor(native_meters: u32, target_meters: u32) -> FindusResult<usize> {
    if target_meters == 0 || native_meters < target_meters || native_meters % target_meters != 0 {
        return Err(FindusError::InvalidParameter(format!(
            "Resolution {} m is not an integer multiple of {} m",
            native_meters, target_meters
        )));
    }
    Ok((native_meters / target_meters) as usize)
}

/// Nearest-neighbour upscaling: every input pixel becomes a `zoom`x`zoom` block
pub fn upsample_nearest<T: Clone>(image: &Array2<T>, zoom: usize) -> Array2<T> {
    if zoom <= 1 {
        return image.clone();
    }
    let (height, width) = image.dim();
    Array2::from_shape_fn((height * zoom, width * zoom), |(i, j)| {
        image[[i / zoom, j / zoom]].clone()
    })
}

/// Top-left `(height, width)` window of an image
pub fn truncate<T: Clone>(image: &Array2<T>, (height, width): (usize, usize)) -> Array2<T> {
    if image.dim() == (height, width) {
        return image.clone();
    }
    image.slice(s![..height, ..width]).to_owned()
}

/// Common shape of a set of arrays, or `DimensionMismatch` naming the first
/// array that disagrees with the first one
pub fn check_shapes<'a, I>(images: I) -> FindusResult<(usize, usize)>
where
    I: IntoIterator<Item = &'a BandImage>,
{
    let mut iter = images.into_iter();
    let expected = match iter.next() {
        Some(first) => first.dim(),
        None => return Ok((0, 0)),
    };
    for image in iter {
        if image.dim() != expected {
            return Err(FindusError::DimensionMismatch {
                expected,
                found: image.dim(),
            });
        }
    }
    Ok(expected)
}

/// Smallest height and smallest width over a set of arrays
pub fn min_common_shape<'a, I>(images: I) -> Option<(usize, usize)>
where
    I: IntoIterator<Item = &'a BandImage>,
{
    images.into_iter().map(|a| a.dim()).reduce(|(h0, w0), (h1, w1)| (h0.min(h1), w0.min(w1)))
}

fn native_resolution(band: &str, raster: &BandRaster) -> u32 {
    band_resolution(band)
        .map(|r| r.meters)
        .unwrap_or_else(|| raster.meta.resolution().round() as u32)
}

/// Resample every band of a product to the finest resolution present
pub fn harmonize_product(layers: &ProductLayers) -> FindusResult<HarmonizedProduct> {
    let target = layers
        .bands
        .iter()
        .map(|(band, raster)| native_resolution(band, raster))
        .min()
        .ok_or_else(|| {
            FindusError::ResourceNotFound(format!("Product {} has no bands", layers.name))
        })?;

    let mut bands = BTreeMap::new();
    let mut meta: Option<GeoMeta> = None;

    for (band, raster) in &layers.bands {
        let zoom = zoom_factor(native_resolution(band, raster), target)?;
        if zoom > 1 {
            log::debug!("Upsampling {} of {} by {}x", band, layers.name, zoom);
        }
        if meta.is_none() && zoom == 1 {
            meta = Some(raster.meta.clone());
        }
        bands.insert(band.clone(), upsample_nearest(&raster.data, zoom));
    }

    let meta = meta.ok_or_else(|| {
        FindusError::Processing(format!("No band of {} at {} m", layers.name, target))
    })?;

    Ok(HarmonizedProduct {
        name: layers.name.clone(),
        bands,
        meta,
    })
}

//! Temporal compositing of cloud-masked products.
//!
//! Each product is masked with its own scene classification, brought to its
//! finest grid and appended to one stack per band. Stacks are reduced once,
//! pixel by pixel, when the composite is finished.

use crate::core::cloud_mask::CloudMaskBuilder;
use crate::core::harmonize::{
    check_shapes, harmonize_product, min_common_shape, truncate, ProductLayers,
};
use crate::io::SCENE_CLASSIFICATION;
use crate::types::{BandImage, Composite, FindusError, FindusResult, GeoMeta};
use ndarray::{Array2, Zip};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

/// Pixel-wise reduction along the time axis; every variant skips NaN samples
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    #[default]
    NanMean,
    NanMedian,
    NanMin,
    NanMax,
    NanStd,
}

impl Aggregation {
    /// Reduce one pixel's samples. NaN when no sample is finite.
    pub fn reduce(&self, samples: &[f32]) -> f32 {
        let mut valid: Vec<f32> = samples.iter().copied().filter(|v| !v.is_nan()).collect();
        if valid.is_empty() {
            return f32::NAN;
        }
        let n = valid.len() as f64;

        match self {
            Aggregation::NanMean => (valid.iter().map(|&v| v as f64).sum::<f64>() / n) as f32,
            Aggregation::NanMin => valid.iter().copied().fold(f32::INFINITY, f32::min),
            Aggregation::NanMax => valid.iter().copied().fold(f32::NEG_INFINITY, f32::max),
            Aggregation::NanMedian => {
                valid.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
                let mid = valid.len() / 2;
                if valid.len() % 2 == 0 {
                    ((valid[mid - 1] as f64 + valid[mid] as f64) / 2.0) as f32
                } else {
                    valid[mid]
                }
            }
            Aggregation::NanStd => {
                let mean = valid.iter().map(|&v| v as f64).sum::<f64>() / n;
                let var = valid.iter().map(|&v| (v as f64 - mean).powi(2)).sum::<f64>() / n;
                var.sqrt() as f32
            }
        }
    }
}

impl FromStr for Aggregation {
    type Err = FindusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().trim_start_matches("nan").trim_start_matches('_') {
            "mean" => Ok(Aggregation::NanMean),
            "median" => Ok(Aggregation::NanMedian),
            "min" => Ok(Aggregation::NanMin),
            "max" => Ok(Aggregation::NanMax),
            "std" => Ok(Aggregation::NanStd),
            _ => Err(FindusError::InvalidParameter(format!(
                "Unknown aggregation function: {}",
                s
            ))),
        }
    }
}

/// Accumulates masked, harmonized products and reduces them into a [`Composite`]
pub struct TemporalCompositor {
    mask_builder: CloudMaskBuilder,
    target_bands: Vec<String>,
    stacks: BTreeMap<String, Vec<BandImage>>,
    shape: Option<(usize, usize)>,
    meta: Option<GeoMeta>,
    products: Vec<String>,
}

impl TemporalCompositor {
    /// Compositor for the given bands; the scene classification layer is
    /// only used for masking and never composited
    pub fn new(bands: &[&str], mask_builder: CloudMaskBuilder) -> Self {
        let target_bands: Vec<String> = bands
            .iter()
            .filter(|b| **b != SCENE_CLASSIFICATION)
            .map(|b| b.to_string())
            .collect();
        let stacks = target_bands.iter().map(|b| (b.clone(), Vec::new())).collect();

        Self {
            mask_builder,
            target_bands,
            stacks,
            shape: None,
            meta: None,
            products: Vec::new(),
        }
    }

    /// Names of the products accepted so far
    pub fn products(&self) -> &[String] {
        &self.products
    }

    /// Common `(height, width)` of every stacked array
    pub fn shape(&self) -> Option<(usize, usize)> {
        self.shape
    }

    /// Stack collected so far for one band
    pub fn stack(&self, band: &str) -> Option<&[BandImage]> {
        self.stacks.get(band).map(|s| s.as_slice())
    }

    /// Mask, harmonize and append one product.
    ///
    /// A product lacking its scene classification or any target band is
    /// rejected with `ResourceNotFound` and leaves the stacks untouched.
    pub fn add_product(&mut self, layers: &ProductLayers) -> FindusResult<()> {
        log::info!("Adding product {} to composite", layers.name);

        if !layers.bands.contains_key(SCENE_CLASSIFICATION) {
            return Err(FindusError::ResourceNotFound(format!(
                "Product {} has no {} layer",
                layers.name, SCENE_CLASSIFICATION
            )));
        }
        if let Some(missing) = self.target_bands.iter().find(|b| !layers.bands.contains_key(*b)) {
            return Err(FindusError::ResourceNotFound(format!(
                "Product {} has no band {}",
                layers.name, missing
            )));
        }

        let harmonized = harmonize_product(layers)?;
        if let Err(e) = check_shapes(harmonized.bands.values()) {
            log::warn!("{}: {}; truncating to the common extent", layers.name, e);
        }

        let scl_nodata = layers.bands[SCENE_CLASSIFICATION].meta.nodata;
        let mask = self
            .mask_builder
            .build_with_nodata(&harmonized.bands[SCENE_CLASSIFICATION], scl_nodata);

        // fill outside the AOI and sensor gaps carry the band's no-data value
        let masked: BTreeMap<String, BandImage> = self
            .target_bands
            .iter()
            .map(|band| {
                let valid = CloudMaskBuilder::mask_nodata(
                    &harmonized.bands[band],
                    layers.bands[band].meta.nodata,
                );
                (band.clone(), CloudMaskBuilder::apply(&valid, &mask))
            })
            .collect();

        let product_shape = min_common_shape(masked.values()).ok_or_else(|| {
            FindusError::Processing(format!("No bands to composite for {}", layers.name))
        })?;
        let shape = match self.shape {
            Some((h, w)) => (h.min(product_shape.0), w.min(product_shape.1)),
            None => product_shape,
        };

        if let Some(previous) = self.shape.filter(|previous| *previous != shape) {
            log::warn!(
                "Truncating composite stacks from {:?} to {:?} for {}",
                previous,
                shape,
                layers.name
            );
            for stack in self.stacks.values_mut() {
                for image in stack.iter_mut() {
                    *image = truncate(image, shape);
                }
            }
        }

        for (band, image) in masked {
            if let Some(stack) = self.stacks.get_mut(&band) {
                stack.push(truncate(&image, shape));
            }
        }

        if self.meta.is_none() {
            self.meta = Some(harmonized.meta.clone());
        }
        self.shape = Some(shape);
        self.products.push(layers.name.clone());

        log::debug!("Composite stack depth {} at shape {:?}", self.products.len(), shape);
        Ok(())
    }

    /// Reduce every band stack along time
    pub fn finish(self, aggregation: Aggregation) -> FindusResult<Composite> {
        let (shape, meta) = match (self.shape, self.meta) {
            (Some(shape), Some(meta)) if !self.products.is_empty() => (shape, meta),
            _ => {
                return Err(FindusError::Processing(
                    "No products were added to the composite".to_string(),
                ))
            }
        };

        log::info!(
            "Combining {} products with {:?} over {} bands",
            self.products.len(),
            aggregation,
            self.stacks.len()
        );

        let mut bands = BTreeMap::new();
        for (band, stack) in &self.stacks {
            let (reduced, empty) = reduce_stack(stack, shape, aggregation);
            if empty > 0 {
                log::warn!(
                    "{}: {} pixels have no valid sample and stay NaN",
                    band,
                    empty
                );
            }
            bands.insert(band.clone(), reduced);
        }

        Ok(Composite {
            bands,
            meta: meta.with_shape(shape),
            depth: self.products.len(),
        })
    }
}

/// Reduce a stack of equally shaped arrays, also counting all-NaN pixels
pub fn reduce_stack(
    stack: &[BandImage],
    shape: (usize, usize),
    aggregation: Aggregation,
) -> (BandImage, usize) {
    let mut reduced = Array2::<f32>::zeros(shape);

    let reduce_pixel = |(i, j): (usize, usize), out: &mut f32| {
        let samples: Vec<f32> = stack.iter().map(|image| image[[i, j]]).collect();
        *out = aggregation.reduce(&samples);
    };

    #[cfg(feature = "parallel")]
    Zip::indexed(&mut reduced).par_for_each(reduce_pixel);

    #[cfg(not(feature = "parallel"))]
    Zip::indexed(&mut reduced).for_each(reduce_pixel);

    let empty = Zip::indexed(&reduced).fold(0usize, |count, (i, j), _| {
        if stack.iter().all(|image| image[[i, j]].is_nan()) {
            count + 1
        } else {
            count
        }
    });

    (reduced, empty)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BandRaster, GeoTransform};
    use approx::assert_relative_eq;
    use ndarray::array;

    fn raster(data: BandImage, pixel: f64) -> BandRaster {
        let (height, width) = data.dim();
        BandRaster {
            data,
            meta: GeoMeta {
                geo_transform: GeoTransform::from_gdal([
                    300000.0, pixel, 0.0, 5000000.0, 0.0, -pixel,
                ]),
                projection: String::new(),
                width,
                height,
                nodata: Some(0.0),
            },
        }
    }

    fn product(name: &str, b02: BandImage, scl: BandImage) -> ProductLayers {
        let mut layers = ProductLayers::new(name);
        layers.insert("B02", raster(b02, 10.0));
        layers.insert("SCL", raster(scl, 20.0));
        layers
    }

    #[test]
    fn test_nan_mean_scenario() {
        let nan = f32::NAN;
        let a = array![[10.0f32, nan], [20.0, 30.0]];
        let b = array![[14.0f32, 18.0], [nan, 34.0]];

        let (mean, empty) = reduce_stack(&[a, b], (2, 2), Aggregation::NanMean);
        assert_eq!(mean, array![[12.0f32, 18.0], [20.0, 32.0]]);
        assert_eq!(empty, 0);
    }

    #[test]
    fn test_aggregations() {
        let samples = [4.0f32, f32::NAN, 1.0, 3.0];
        assert_relative_eq!(Aggregation::NanMean.reduce(&samples), 8.0 / 3.0, epsilon = 1e-6);
        assert_eq!(Aggregation::NanMedian.reduce(&samples), 3.0);
        assert_eq!(Aggregation::NanMedian.reduce(&[1.0, 2.0]), 1.5);
        assert_eq!(Aggregation::NanMin.reduce(&samples), 1.0);
        assert_eq!(Aggregation::NanMax.reduce(&samples), 4.0);
        assert_relative_eq!(Aggregation::NanStd.reduce(&[2.0, 4.0]), 1.0);
        assert!(Aggregation::NanMean.reduce(&[f32::NAN, f32::NAN]).is_nan());
    }

    #[test]
    fn test_parse_aggregation() {
        assert_eq!("nanmean".parse::<Aggregation>().unwrap(), Aggregation::NanMean);
        assert_eq!("median".parse::<Aggregation>().unwrap(), Aggregation::NanMedian);
        assert_eq!("nan_max".parse::<Aggregation>().unwrap(), Aggregation::NanMax);
        assert!("mode".parse::<Aggregation>().is_err());
    }

    #[test]
    fn test_single_product_equals_masked_band() {
        let b02 = array![[100.0f32, 200.0, 300.0, 400.0], [500.0, 600.0, 700.0, 800.0]];
        let scl = array![[4.0f32, 9.0]];

        let mut compositor = TemporalCompositor::new(&["B02", "SCL"], CloudMaskBuilder::default());
        compositor.add_product(&product("p1", b02.clone(), scl)).unwrap();
        let composite = compositor.finish(Aggregation::NanMean).unwrap();

        assert_eq!(composite.band_codes(), vec!["B02".to_string()]);
        let out = composite.band("B02").unwrap();
        for ((i, j), value) in out.indexed_iter() {
            if j >= 2 {
                assert!(value.is_nan());
            } else {
                assert_eq!(*value, b02[[i, j]]);
            }
        }
        assert_eq!(composite.shape(), (2, 4));
        assert_eq!(composite.depth, 1);
    }

    #[test]
    fn test_stacks_truncate_to_smallest_product() {
        let mut compositor = TemporalCompositor::new(&["B02", "SCL"], CloudMaskBuilder::default());
        compositor
            .add_product(&product("a", Array2::ones((100, 100)), Array2::from_elem((50, 50), 4.0)))
            .unwrap();
        compositor
            .add_product(&product("b", Array2::ones((99, 100)), Array2::from_elem((50, 50), 4.0)))
            .unwrap();

        assert_eq!(compositor.shape(), Some((99, 100)));
        for image in compositor.stack("B02").unwrap() {
            assert_eq!(image.dim(), (99, 100));
        }

        let composite = compositor.finish(Aggregation::NanMean).unwrap();
        assert_eq!((composite.meta.height, composite.meta.width), (99, 100));
        assert_eq!(composite.band("B02").unwrap().dim(), (99, 100));
    }

    #[test]
    fn test_product_without_classification_is_rejected() {
        let mut compositor = TemporalCompositor::new(&["B02", "SCL"], CloudMaskBuilder::default());
        let mut layers = ProductLayers::new("no-scl");
        layers.insert("B02", raster(Array2::ones((2, 2)), 10.0));

        assert!(matches!(
            compositor.add_product(&layers),
            Err(FindusError::ResourceNotFound(_))
        ));
        assert!(compositor.products().is_empty());
        assert!(compositor.finish(Aggregation::NanMean).is_err());
    }

    #[test]
    fn test_classification_nodata_is_not_composited() {
        let mut layers = product("p1", Array2::from_elem((2, 2), 100.0), array![[255.0f32]]);
        if let Some(scl) = layers.bands.get_mut("SCL") {
            scl.meta.nodata = Some(255.0);
        }

        let mut compositor = TemporalCompositor::new(&["B02", "SCL"], CloudMaskBuilder::default());
        compositor.add_product(&layers).unwrap();
        let composite = compositor.finish(Aggregation::NanMean).unwrap();
        assert!(composite.band("B02").unwrap().iter().all(|v| v.is_nan()));
    }

    #[test]
    fn test_band_fill_is_not_averaged_in() {
        // first acquisition is all fill (no-data 0), second is valid
        let mut compositor = TemporalCompositor::new(&["B02", "SCL"], CloudMaskBuilder::default());
        compositor
            .add_product(&product("a", Array2::zeros((2, 2)), array![[4.0f32]]))
            .unwrap();
        compositor
            .add_product(&product("b", Array2::from_elem((2, 2), 400.0), array![[4.0f32]]))
            .unwrap();

        let composite = compositor.finish(Aggregation::NanMean).unwrap();
        assert_eq!(composite.band("B02").unwrap(), &Array2::from_elem((2, 2), 400.0f32));
    }

    #[test]
    fn test_all_nan_pixels_stay_nan() {
        let mut compositor = TemporalCompositor::new(&["B02", "SCL"], CloudMaskBuilder::default());
        for name in ["a", "b"] {
            compositor
                .add_product(&product(name, Array2::ones((2, 2)), array![[8.0f32]]))
                .unwrap();
        }
        let composite = compositor.finish(Aggregation::NanMedian).unwrap();
        assert!(composite.band("B02").unwrap().iter().all(|v| v.is_nan()));
    }
}

use crate::types::{BandImage, BandRaster};
use ndarray::{s, Array2};
use serde::{Deserialize, Serialize};

/// Scene classification codes masked out by default: no data (0),
/// unclassified (7), medium and high cloud probability (8, 9), thin cirrus
/// (10) and snow/ice (11).
pub const DEFAULT_INVALID_CLASSES: [u8; 6] = [0, 7, 8, 9, 10, 11];

/// Turns a scene classification layer into a validity mask
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudMaskBuilder {
    pub invalid_classes: Vec<u8>,
}

impl Default for CloudMaskBuilder {
    fn default() -> Self {
        Self {
            invalid_classes: DEFAULT_INVALID_CLASSES.to_vec(),
        }
    }
}

impl CloudMaskBuilder {
    pub fn new(invalid_classes: &[u8]) -> Self {
        Self {
            invalid_classes: invalid_classes.to_vec(),
        }
    }

    fn is_invalid(&self, class: f32, nodata: Option<f32>) -> bool {
        if !class.is_finite() || nodata == Some(class) {
            return true;
        }
        class >= 0.0
            && class <= u8::MAX as f32
            && class.fract() == 0.0
            && self.invalid_classes.contains(&(class as u8))
    }

    /// 1.0 for usable pixels, NaN for masked or non-finite classes
    pub fn build(&self, scene_classification: &BandImage) -> Array2<f32> {
        self.build_with_nodata(scene_classification, None)
    }

    /// Like [`build`](Self::build), also masking pixels equal to the layer's
    /// no-data value
    pub fn build_with_nodata(
        &self,
        scene_classification: &BandImage,
        nodata: Option<f64>,
    ) -> Array2<f32> {
        let nodata = nodata.map(|v| v as f32);
        let mask = scene_classification.mapv(|class| {
            if self.is_invalid(class, nodata) {
                f32::NAN
            } else {
                1.0
            }
        });

        let masked = mask.iter().filter(|v| v.is_nan()).count();
        log::debug!("Cloud mask: {} of {} pixels invalid", masked, mask.len());
        mask
    }

    /// Mask of a scene classification raster, honouring its no-data value
    pub fn build_raster(&self, scene_classification: &BandRaster) -> Array2<f32> {
        self.build_with_nodata(&scene_classification.data, scene_classification.meta.nodata)
    }

    /// Band values equal to the band's no-data value replaced by NaN
    pub fn mask_nodata(band: &BandImage, nodata: Option<f64>) -> BandImage {
        match nodata.map(|v| v as f32) {
            Some(fill) if fill.is_finite() => band.mapv(|v| if v == fill { f32::NAN } else { v }),
            _ => band.clone(),
        }
    }

    /// Multiply a band by a mask over their common leading extent, so masked
    /// pixels become NaN
    pub fn apply(band: &BandImage, mask: &Array2<f32>) -> BandImage {
        let rows = band.nrows().min(mask.nrows());
        let cols = band.ncols().min(mask.ncols());
        let band = band.slice(s![..rows, ..cols]);
        let mask = mask.slice(s![..rows, ..cols]);
        &band * &mask
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_reference_scenario() {
        let scl = array![[0.0f32, 4.0], [4.0, 11.0]];
        let mask = CloudMaskBuilder::default().build(&scl);

        assert!(mask[[0, 0]].is_nan());
        assert_eq!(mask[[0, 1]], 1.0);
        assert_eq!(mask[[1, 0]], 1.0);
        assert!(mask[[1, 1]].is_nan());
    }

    #[test]
    fn test_custom_classes_and_nodata() {
        let scl = array![[3.0f32, 4.0, f32::NAN], [8.0, 5.0, 6.0]];
        let mask = CloudMaskBuilder::new(&[3]).build(&scl);

        assert!(mask[[0, 0]].is_nan());
        assert!(mask[[0, 2]].is_nan());
        assert_eq!(mask[[1, 0]], 1.0);
        assert_eq!(mask.iter().filter(|v| **v == 1.0).count(), 4);
    }

    #[test]
    fn test_masked_pixels_become_nan() {
        let scl = array![[4.0f32, 9.0, 4.0], [8.0, 4.0, 4.0]];
        let band = array![[1200.0f32, 0.0, 300.0], [-5.0, 77.0, 1.0]];
        let mask = CloudMaskBuilder::default().build(&scl);

        let masked = CloudMaskBuilder::apply(&band, &mask);
        for ((idx, value), m) in masked.indexed_iter().zip(mask.iter()) {
            if m.is_nan() {
                assert!(value.is_nan(), "pixel {:?} should be NaN", idx);
            } else {
                assert_eq!(*value, band[idx]);
            }
        }
    }

    #[test]
    fn test_classification_nodata_is_masked() {
        let scl = array![[255.0f32, 4.0], [5.0, 255.0]];
        let mask = CloudMaskBuilder::default().build_with_nodata(&scl, Some(255.0));
        assert!(mask[[0, 0]].is_nan());
        assert!(mask[[1, 1]].is_nan());
        assert_eq!(mask[[0, 1]], 1.0);
        assert_eq!(mask[[1, 0]], 1.0);

        // without a declared no-data value 255 is an ordinary class
        let unmasked = CloudMaskBuilder::default().build(&scl);
        assert!(unmasked.iter().all(|v| *v == 1.0));
    }

    #[test]
    fn test_band_nodata_becomes_nan() {
        let band = array![[0.0f32, 400.0], [12.0, 0.0]];
        let cleaned = CloudMaskBuilder::mask_nodata(&band, Some(0.0));
        assert!(cleaned[[0, 0]].is_nan() && cleaned[[1, 1]].is_nan());
        assert_eq!(cleaned[[0, 1]], 400.0);

        assert_eq!(CloudMaskBuilder::mask_nodata(&band, None), band);
    }

    #[test]
    fn test_apply_truncates_to_common_extent() {
        let band = Array2::<f32>::ones((4, 5));
        let mask = Array2::<f32>::ones((5, 4));
        assert_eq!(CloudMaskBuilder::apply(&band, &mask).dim(), (4, 4));
    }
}

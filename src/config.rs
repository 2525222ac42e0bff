use crate::core::{Aggregation, CloudMaskBuilder, SegmentationParams, DEFAULT_INVALID_CLASSES};
use crate::io::{band_resolution, DEFAULT_BANDS, SCENE_CLASSIFICATION};
use crate::types::{FindusError, FindusResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Settings for a complete AOI run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Root under which `<aoi>/Data` and `<aoi>/Results` are created
    pub base_directory: PathBuf,
    /// CRS the AOI polygon is given in
    pub source_crs: String,
    /// Projected CRS used for cropping
    pub working_crs: String,
    pub bands: Vec<String>,
    pub invalid_classes: Vec<u8>,
    pub aggregation: Aggregation,
    pub segmentation: SegmentationParams,
    /// Composite band that is segmented
    pub segmentation_band: String,
    /// Number of least cloudy products to download
    pub num_images: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            base_directory: dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("findus"),
            source_crs: "EPSG:4326".to_string(),
            working_crs: "EPSG:32632".to_string(),
            bands: DEFAULT_BANDS.iter().map(|b| b.to_string()).collect(),
            invalid_classes: DEFAULT_INVALID_CLASSES.to_vec(),
            aggregation: Aggregation::default(),
            segmentation: SegmentationParams::default(),
            segmentation_band: "B02".to_string(),
            num_images: 1,
        }
    }
}

impl PipelineConfig {
    /// Read a JSON config; missing keys take their defaults
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> FindusResult<Self> {
        log::info!("Loading pipeline config from {}", path.as_ref().display());
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> FindusResult<()> {
        if let Some(unknown) = self.bands.iter().find(|b| band_resolution(b).is_none()) {
            return Err(FindusError::InvalidParameter(format!("Unknown band {}", unknown)));
        }
        if !self.bands.iter().any(|b| b == SCENE_CLASSIFICATION) {
            return Err(FindusError::InvalidParameter(format!(
                "Band list must include {} for cloud masking",
                SCENE_CLASSIFICATION
            )));
        }
        if self.segmentation_band == SCENE_CLASSIFICATION
            || !self.bands.iter().any(|b| *b == self.segmentation_band)
        {
            return Err(FindusError::InvalidParameter(format!(
                "Segmentation band {} is not a composited band",
                self.segmentation_band
            )));
        }
        if self.num_images == 0 {
            return Err(FindusError::InvalidParameter(
                "num_images must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn band_refs(&self) -> Vec<&str> {
        self.bands.iter().map(|b| b.as_str()).collect()
    }

    pub fn mask_builder(&self) -> CloudMaskBuilder {
        CloudMaskBuilder::new(&self.invalid_classes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = PipelineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.aggregation, Aggregation::NanMean);
        assert_eq!(config.segmentation.n_segments, 500);
        assert_eq!(config.mask_builder(), CloudMaskBuilder::default());
    }

    #[test]
    fn test_partial_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                "base_directory": "/tmp/findus",
                "aggregation": "nan_median",
                "segmentation": { "n_segments": 200, "compactness": 5.0 },
                "segmentation_band": "B08"
            }"#,
        )
        .unwrap();

        let config = PipelineConfig::from_json_file(&path).unwrap();
        assert_eq!(config.base_directory, PathBuf::from("/tmp/findus"));
        assert_eq!(config.aggregation, Aggregation::NanMedian);
        assert_eq!(config.segmentation.n_segments, 200);
        assert_eq!(config.segmentation.max_iter, 10);
        assert_eq!(config.working_crs, "EPSG:32632");
    }

    #[test]
    fn test_rejects_missing_classification() {
        let config = PipelineConfig {
            bands: vec!["B02".to_string(), "B03".to_string()],
            ..PipelineConfig::default()
        };
        assert!(matches!(config.validate(), Err(FindusError::InvalidParameter(_))));
    }
}

//! Core AOI processing modules

pub mod crop;
pub mod cloud_mask;
pub mod harmonize;
pub mod composite;
pub mod segment;

// Re-export main types
pub use crop::{AoiCropper, PixelWindow};
pub use cloud_mask::{CloudMaskBuilder, DEFAULT_INVALID_CLASSES};
pub use harmonize::{
    harmonize_product, upsample_nearest, zoom_factor, HarmonizedProduct, ProductLayers,
};
pub use composite::{Aggregation, TemporalCompositor};
pub use segment::{export_segmentation, SegmentationParams, Segmenter};

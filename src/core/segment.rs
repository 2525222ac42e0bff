//! SLIC superpixel segmentation of a single composite band.
//!
//! Cluster centres start on a regular grid with spacing `S = sqrt(N / k)`,
//! are nudged to the lowest local gradient, and are refined by k-means
//! restricted to a `2S` window using the distance
//! `(v - v_c)^2 + ((dy^2 + dx^2) / S^2) * m^2`. Small disconnected fragments
//! are merged into a neighbouring segment afterwards.

use crate::io::write_geotiff;
use crate::types::{BandImage, Composite, FindusError, FindusResult, LabelImage, Segmentation};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::Path;

/// Smallest grid spacing in pixels; keeps segments at least 2x2
const MIN_GRID_STEP: f64 = 2.0;

const UNASSIGNED: u32 = u32::MAX;

/// Segmentation parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentationParams {
    /// Approximate number of segments
    pub n_segments: usize,
    /// Weight of spatial proximity against intensity similarity
    pub compactness: f32,
    pub max_iter: usize,
    /// Gaussian pre-smoothing width in pixels, 0 disables smoothing
    pub sigma: f32,
    pub enforce_connectivity: bool,
    /// Fragments smaller than this fraction of the mean segment size are merged
    pub min_size_factor: f32,
}

impl Default for SegmentationParams {
    fn default() -> Self {
        Self {
            n_segments: 500,
            compactness: 15.0,
            max_iter: 10,
            sigma: 0.0,
            enforce_connectivity: true,
            min_size_factor: 0.5,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Cluster {
    y: f64,
    x: f64,
    value: f64,
}

/// Superpixel segmenter
pub struct Segmenter {
    params: SegmentationParams,
}

impl Segmenter {
    /// Create a segmenter with default parameters
    pub fn new() -> Self {
        Self {
            params: SegmentationParams::default(),
        }
    }

    /// Create a segmenter with custom parameters
    pub fn with_params(params: SegmentationParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &SegmentationParams {
        &self.params
    }

    fn validate(&self, image: &BandImage) -> FindusResult<()> {
        if self.params.n_segments == 0 {
            return Err(FindusError::InvalidParameter(
                "n_segments must be positive".to_string(),
            ));
        }
        if !self.params.compactness.is_finite() || self.params.compactness < 0.0 {
            return Err(FindusError::InvalidParameter(format!(
                "compactness must be a non-negative number, got {}",
                self.params.compactness
            )));
        }
        if !self.params.sigma.is_finite() || self.params.sigma < 0.0 {
            return Err(FindusError::InvalidParameter(format!(
                "sigma must be a non-negative number, got {}",
                self.params.sigma
            )));
        }
        if image.is_empty() {
            return Err(FindusError::InvalidParameter(
                "Cannot segment an empty image".to_string(),
            ));
        }
        Ok(())
    }

    /// Segment one band. Non-finite values are replaced by 0 first.
    pub fn segment(&self, image: &BandImage) -> FindusResult<LabelImage> {
        self.validate(image)?;
        let (height, width) = image.dim();
        log::info!(
            "Running SLIC on {}x{} image: n_segments={}, compactness={}",
            width,
            height,
            self.params.n_segments,
            self.params.compactness
        );

        let mut replaced = 0usize;
        let mut input = image.mapv(|v| {
            if v.is_finite() {
                v as f64
            } else {
                replaced += 1;
                0.0
            }
        });
        if replaced > 0 {
            log::warn!("Replaced {} non-finite pixels with 0 before segmentation", replaced);
        }

        if self.params.sigma > 0.0 {
            input = gaussian_smooth(&input, self.params.sigma as f64);
        }

        let step = ((height * width) as f64 / self.params.n_segments as f64)
            .sqrt()
            .max(MIN_GRID_STEP);
        let mut clusters = initial_clusters(&input, step);
        log::debug!("Grid step {:.2} px, {} initial clusters", step, clusters.len());

        let labels = self.iterate(&input, &mut clusters, step);

        let labels = if self.params.enforce_connectivity {
            let segment_size = (height * width) as f64 / clusters.len() as f64;
            let min_size = (self.params.min_size_factor as f64 * segment_size) as usize;
            enforce_connectivity(&labels, min_size)
        } else {
            relabel_sequential(&labels)
        };

        log::info!("Segmentation produced {} segments", count_labels(&labels));
        Ok(labels)
    }

    /// k-means refinement of the cluster centres, returning raw cluster indices
    fn iterate(&self, image: &Array2<f64>, clusters: &mut [Cluster], step: f64) -> Array2<u32> {
        let (height, width) = image.dim();
        let mut labels = Array2::<u32>::from_elem((height, width), UNASSIGNED);
        let mut distances = Array2::<f64>::from_elem((height, width), f64::INFINITY);

        let spatial_weight = (self.params.compactness as f64 / step).powi(2);
        let radius = step.ceil() as isize;

        for iteration in 0..self.params.max_iter.max(1) {
            distances.fill(f64::INFINITY);
            let previous = labels.clone();

            for (k, cluster) in clusters.iter().enumerate() {
                let cy = cluster.y.round() as isize;
                let cx = cluster.x.round() as isize;
                let y0 = (cy - radius).max(0) as usize;
                let y1 = ((cy + radius + 1).max(0) as usize).min(height);
                let x0 = (cx - radius).max(0) as usize;
                let x1 = ((cx + radius + 1).max(0) as usize).min(width);

                for y in y0..y1 {
                    for x in x0..x1 {
                        let dv = image[[y, x]] - cluster.value;
                        let dy = y as f64 - cluster.y;
                        let dx = x as f64 - cluster.x;
                        let distance = dv * dv + (dy * dy + dx * dx) * spatial_weight;
                        if distance < distances[[y, x]] {
                            distances[[y, x]] = distance;
                            labels[[y, x]] = k as u32;
                        }
                    }
                }
            }

            assign_orphans(&mut labels, clusters);
            update_centres(image, &labels, clusters);

            let changed = labels.iter().zip(previous.iter()).filter(|(a, b)| a != b).count();

            log::debug!("SLIC iteration {}: {} label changes", iteration + 1, changed);
            if changed == 0 {
                break;
            }
        }

        labels
    }

    /// Segment a composite band, carrying over its georeferencing
    pub fn segment_composite(
        &self,
        composite: &Composite,
        band: &str,
    ) -> FindusResult<Segmentation> {
        let image = composite.band(band).ok_or_else(|| {
            FindusError::ResourceNotFound(format!("Band {} is not part of the composite", band))
        })?;

        let labels = self.segment(image)?;
        let mut meta = composite.meta.with_shape(labels.dim());
        meta.nodata = None;

        Ok(Segmentation {
            labels,
            meta,
            band: band.to_string(),
        })
    }
}

impl Default for Segmenter {
    fn default() -> Self {
        Self::new()
    }
}

/// Write labels as a single-band UInt32 GeoTIFF
pub fn export_segmentation<P: AsRef<Path>>(
    segmentation: &Segmentation,
    path: P,
) -> FindusResult<()> {
    log::info!("Saving segments to {}", path.as_ref().display());
    write_geotiff(path, &segmentation.labels, &segmentation.meta)
}

fn initial_clusters(image: &Array2<f64>, step: f64) -> Vec<Cluster> {
    let (height, width) = image.dim();
    let rows = ((height as f64 / step).round() as usize).clamp(1, height);
    let cols = ((width as f64 / step).round() as usize).clamp(1, width);
    let step_y = height as f64 / rows as f64;
    let step_x = width as f64 / cols as f64;

    let mut clusters = Vec::with_capacity(rows * cols);
    for r in 0..rows {
        for c in 0..cols {
            let y = (((r as f64 + 0.5) * step_y) as usize).min(height - 1);
            let x = (((c as f64 + 0.5) * step_x) as usize).min(width - 1);
            let (y, x) = lowest_gradient(image, y, x);
            clusters.push(Cluster {
                y: y as f64,
                x: x as f64,
                value: image[[y, x]],
            });
        }
    }
    clusters
}

/// Position of the smallest gradient magnitude in the 3x3 neighbourhood
fn lowest_gradient(image: &Array2<f64>, y: usize, x: usize) -> (usize, usize) {
    let (height, width) = image.dim();
    let gradient = |y: usize, x: usize| {
        let gx = image[[y, (x + 1).min(width - 1)]] - image[[y, x.saturating_sub(1)]];
        let gy = image[[(y + 1).min(height - 1), x]] - image[[y.saturating_sub(1), x]];
        gx * gx + gy * gy
    };

    let mut best = (y, x);
    let mut best_gradient = gradient(y, x);
    for ny in y.saturating_sub(1)..=(y + 1).min(height - 1) {
        for nx in x.saturating_sub(1)..=(x + 1).min(width - 1) {
            let g = gradient(ny, nx);
            if g < best_gradient {
                best_gradient = g;
                best = (ny, nx);
            }
        }
    }
    best
}

/// Pixels outside every search window go to the spatially nearest centre
fn assign_orphans(labels: &mut Array2<u32>, clusters: &[Cluster]) {
    for ((y, x), label) in labels.indexed_iter_mut() {
        if *label != UNASSIGNED {
            continue;
        }
        let nearest = clusters
            .iter()
            .enumerate()
            .map(|(k, c)| (k, (c.y - y as f64).powi(2) + (c.x - x as f64).powi(2)))
            .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(k, _)| k as u32);
        if let Some(k) = nearest {
            *label = k;
        }
    }
}

fn update_centres(image: &Array2<f64>, labels: &Array2<u32>, clusters: &mut [Cluster]) {
    let mut sums = vec![(0.0f64, 0.0f64, 0.0f64, 0usize); clusters.len()];
    for ((y, x), &label) in labels.indexed_iter() {
        if let Some(sum) = sums.get_mut(label as usize) {
            sum.0 += y as f64;
            sum.1 += x as f64;
            sum.2 += image[[y, x]];
            sum.3 += 1;
        }
    }
    for (cluster, (sy, sx, sv, n)) in clusters.iter_mut().zip(sums) {
        if n > 0 {
            let n = n as f64;
            *cluster = Cluster {
                y: sy / n,
                x: sx / n,
                value: sv / n,
            };
        }
    }
}

static NEIGHBOURS: [(isize, isize); 4] = [(-1, 0), (0, -1), (1, 0), (0, 1)];

fn neighbours(
    y: usize,
    x: usize,
    height: usize,
    width: usize,
) -> impl Iterator<Item = (usize, usize)> {
    NEIGHBOURS.iter().filter_map(move |&(dy, dx)| {
        let ny = y as isize + dy;
        let nx = x as isize + dx;
        if ny >= 0 && nx >= 0 && (ny as usize) < height && (nx as usize) < width {
            Some((ny as usize, nx as usize))
        } else {
            None
        }
    })
}

/// Relabel 4-connected components from 1 in raster order, folding components
/// smaller than `min_size` into the already labelled segment they touch
pub fn enforce_connectivity(labels: &Array2<u32>, min_size: usize) -> LabelImage {
    let (height, width) = labels.dim();
    let mut output = Array2::<u32>::zeros((height, width));
    let mut next_label = 1u32;
    let mut queue = VecDeque::new();
    let mut component = Vec::new();

    for y in 0..height {
        for x in 0..width {
            if output[[y, x]] != 0 {
                continue;
            }

            let adjacent = neighbours(y, x, height, width)
                .map(|(ny, nx)| output[[ny, nx]])
                .find(|&label| label != 0);

            let source = labels[[y, x]];
            component.clear();
            queue.push_back((y, x));
            output[[y, x]] = next_label;

            while let Some((cy, cx)) = queue.pop_front() {
                component.push((cy, cx));
                for (ny, nx) in neighbours(cy, cx, height, width) {
                    if output[[ny, nx]] == 0 && labels[[ny, nx]] == source {
                        output[[ny, nx]] = next_label;
                        queue.push_back((ny, nx));
                    }
                }
            }

            match adjacent {
                Some(label) if component.len() < min_size => {
                    for &(cy, cx) in &component {
                        output[[cy, cx]] = label;
                    }
                }
                _ => next_label += 1,
            }
        }
    }

    output
}

/// Map arbitrary labels onto 1..=n in order of first appearance
fn relabel_sequential(labels: &Array2<u32>) -> LabelImage {
    let mut mapping = std::collections::HashMap::new();
    labels.mapv(|label| {
        let next = mapping.len() as u32 + 1;
        *mapping.entry(label).or_insert(next)
    })
}

fn count_labels(labels: &LabelImage) -> usize {
    let mut seen: Vec<u32> = labels.iter().copied().collect();
    seen.sort_unstable();
    seen.dedup();
    seen.len()
}

/// Separable Gaussian blur with edge clamping, truncated at 4 sigma
fn gaussian_smooth(image: &Array2<f64>, sigma: f64) -> Array2<f64> {
    let radius = (4.0 * sigma).ceil() as isize;
    let kernel: Vec<f64> = (-radius..=radius)
        .map(|i| (-(i * i) as f64 / (2.0 * sigma * sigma)).exp())
        .collect();
    let norm: f64 = kernel.iter().sum();
    let kernel: Vec<f64> = kernel.iter().map(|k| k / norm).collect();

    let horizontal = convolve_axis(image, &kernel, false);
    convolve_axis(&horizontal, &kernel, true)
}

fn clamp_index(i: isize, n: usize) -> usize {
    i.clamp(0, n as isize - 1) as usize
}

/// 1-D convolution along rows (`vertical == false`) or columns
fn convolve_axis(image: &Array2<f64>, kernel: &[f64], vertical: bool) -> Array2<f64> {
    let (height, width) = image.dim();
    let radius = (kernel.len() / 2) as isize;

    let sample = |y: usize, x: usize| -> f64 {
        kernel
            .iter()
            .enumerate()
            .map(|(k, w)| {
                let offset = k as isize - radius;
                if vertical {
                    w * image[[clamp_index(y as isize + offset, height), x]]
                } else {
                    w * image[[y, clamp_index(x as isize + offset, width)]]
                }
            })
            .sum()
    };

    #[cfg(feature = "parallel")]
    {
        use rayon::prelude::*;

        let values: Vec<f64> = (0..height * width)
            .into_par_iter()
            .map(|i| sample(i / width, i % width))
            .collect();
        Array2::from_shape_fn((height, width), |(y, x)| values[y * width + x])
    }

    #[cfg(not(feature = "parallel"))]
    {
        Array2::from_shape_fn((height, width), |(y, x)| sample(y, x))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{GeoMeta, GeoTransform};
    use ndarray::s;
    use std::collections::BTreeMap;

    fn params(n_segments: usize, compactness: f32) -> SegmentationParams {
        SegmentationParams {
            n_segments,
            compactness,
            ..SegmentationParams::default()
        }
    }

    #[test]
    fn test_uniform_image_gives_few_labels() {
        let image = Array2::<f32>::from_elem((40, 40), 1234.0);
        for compactness in [0.0, 1.0, 15.0, 100.0] {
            let labels = Segmenter::with_params(params(16, compactness)).segment(&image).unwrap();
            let count = count_labels(&labels);
            assert!(count >= 1 && count <= 32, "compactness {}: {} labels", compactness, count);
            assert!(count < image.len());
        }
    }

    #[test]
    fn test_two_halves_are_separated() {
        let mut image = Array2::<f32>::zeros((30, 30));
        image.slice_mut(s![.., 15..]).fill(1000.0);

        let labels = Segmenter::with_params(params(9, 1.0)).segment(&image).unwrap();
        for y in 0..30 {
            for x_left in 0..15 {
                for x_right in 15..30 {
                    assert_ne!(labels[[y, x_left]], labels[[y, x_right]]);
                }
            }
        }
    }

    #[test]
    fn test_labels_start_at_one_and_cover_image() {
        let image = Array2::from_shape_fn((25, 35), |(y, x)| ((y / 5 + x / 7) % 3) as f32 * 50.0);
        let labels = Segmenter::with_params(params(20, 10.0)).segment(&image).unwrap();
        assert_eq!(labels.dim(), (25, 35));
        assert!(labels.iter().all(|&l| l >= 1));
        assert_eq!(*labels.iter().max().unwrap() as usize, count_labels(&labels));
    }

    #[test]
    fn test_nan_input_is_replaced() {
        let mut image = Array2::<f32>::from_elem((20, 20), 5.0);
        image[[3, 3]] = f32::NAN;
        image[[10, 12]] = f32::INFINITY;
        let labels = Segmenter::with_params(params(4, 10.0)).segment(&image).unwrap();
        assert!(labels.iter().all(|&l| l >= 1));
    }

    #[test]
    fn test_invalid_parameters() {
        let image = Array2::<f32>::ones((10, 10));
        assert!(Segmenter::with_params(params(0, 10.0)).segment(&image).is_err());
        assert!(Segmenter::with_params(params(10, -1.0)).segment(&image).is_err());
        assert!(Segmenter::new().segment(&Array2::<f32>::zeros((0, 0))).is_err());
    }

    #[test]
    fn test_connectivity_merges_small_fragments() {
        let mut raw = Array2::<u32>::zeros((6, 6));
        raw.slice_mut(s![.., 3..]).fill(1);
        raw[[0, 1]] = 7;
        raw[[2, 4]] = 0;

        let merged = enforce_connectivity(&raw, 3);
        assert_eq!(count_labels(&merged), 2);

        let kept = enforce_connectivity(&raw, 0);
        assert_eq!(count_labels(&kept), 4);
    }

    #[test]
    fn test_smoothing_preserves_constant() {
        let image = Array2::<f64>::from_elem((8, 9), 3.0);
        let smoothed = gaussian_smooth(&image, 1.5);
        assert!(smoothed.iter().all(|v| (v - 3.0).abs() < 1e-9));
    }

    #[test]
    fn test_segment_composite_carries_meta() {
        let meta = GeoMeta {
            geo_transform: GeoTransform::from_gdal([400000.0, 10.0, 0.0, 5100000.0, 0.0, -10.0]),
            projection: "PROJCS[...]".to_string(),
            width: 12,
            height: 10,
            nodata: Some(0.0),
        };
        let mut bands = BTreeMap::new();
        bands.insert("B02".to_string(), Array2::<f32>::from_elem((10, 12), f32::NAN));
        let composite = Composite { bands, meta: meta.clone(), depth: 1 };

        let segmentation = Segmenter::with_params(params(4, 15.0))
            .segment_composite(&composite, "B02")
            .unwrap();
        assert_eq!(segmentation.labels.dim(), (10, 12));
        assert_eq!(segmentation.meta.geo_transform, meta.geo_transform);
        assert_eq!(segmentation.meta.nodata, None);
        assert_eq!(segmentation.band, "B02");

        assert!(Segmenter::new().segment_composite(&composite, "B11").is_err());
    }
}

//! Python bindings, built with the `python` feature

use crate::aoi::Aoi;
use crate::config::PipelineConfig;
use crate::core::{Aggregation, CloudMaskBuilder, SegmentationParams, Segmenter};
use crate::types::FindusError;
use geo::{LineString, Polygon};
use numpy::{IntoPyArray, PyArray2, PyReadonlyArray2};
use pyo3::prelude::*;
use std::collections::HashMap;

fn to_py_err(e: FindusError) -> PyErr {
    match e {
        FindusError::InvalidParameter(_) | FindusError::DimensionMismatch { .. } => {
            PyErr::new::<pyo3::exceptions::PyValueError, _>(format!("{}", e))
        }
        FindusError::ResourceNotFound(_) => {
            PyErr::new::<pyo3::exceptions::PyFileNotFoundError, _>(format!("{}", e))
        }
        _ => PyErr::new::<pyo3::exceptions::PyRuntimeError, _>(format!("{}", e)),
    }
}

/// Python module definition
#[pymodule]
fn _core(_py: Python, m: &PyModule) -> PyResult<()> {
    m.add_class::<PyAoi>()?;
    m.add_function(wrap_pyfunction!(segment_array, m)?)?;
    Ok(())
}

/// SLIC segmentation of a 2-D float array
#[pyfunction]
#[pyo3(signature = (image, n_segments=500, compactness=15.0, max_iter=10, sigma=0.0))]
fn segment_array<'py>(
    py: Python<'py>,
    image: PyReadonlyArray2<'py, f32>,
    n_segments: usize,
    compactness: f32,
    max_iter: usize,
    sigma: f32,
) -> PyResult<&'py PyArray2<u32>> {
    let params = SegmentationParams {
        n_segments,
        compactness,
        max_iter,
        sigma,
        ..SegmentationParams::default()
    };
    let image = image.as_array().to_owned();
    let labels = Segmenter::with_params(params).segment(&image).map_err(to_py_err)?;
    Ok(labels.into_pyarray(py))
}

/// Python wrapper for Aoi
#[pyclass(name = "Aoi")]
struct PyAoi {
    inner: Aoi,
}

#[pymethods]
impl PyAoi {
    #[new]
    #[pyo3(signature = (
        bounds,
        name,
        base_directory,
        source_crs = "EPSG:4326",
        working_crs = "EPSG:32632"
    ))]
    fn new(
        bounds: Vec<(f64, f64)>,
        name: &str,
        base_directory: &str,
        source_crs: &str,
        working_crs: &str,
    ) -> PyResult<Self> {
        if bounds.len() < 3 {
            return Err(PyErr::new::<pyo3::exceptions::PyValueError, _>(
                "An AOI polygon needs at least three vertices",
            ));
        }
        let polygon = Polygon::new(LineString::from(bounds), vec![]);
        let inner = Aoi::new(polygon, name, base_directory, source_crs, working_crs)
            .map_err(to_py_err)?;
        Ok(PyAoi { inner })
    }

    #[getter]
    fn name(&self) -> String {
        self.inner.name().to_string()
    }

    /// Exterior ring in the working CRS
    #[getter]
    fn bounds(&self) -> Vec<(f64, f64)> {
        self.inner.bounds().exterior().coords().map(|c| (c.x, c.y)).collect()
    }

    #[getter]
    fn raw_directory(&self) -> String {
        self.inner.directories().raw.to_string_lossy().to_string()
    }

    #[getter]
    fn results_directory(&self) -> String {
        self.inner.directories().results.to_string_lossy().to_string()
    }

    fn process(&self, bands: Vec<String>) -> PyResult<Vec<String>> {
        let bands: Vec<&str> = bands.iter().map(|b| b.as_str()).collect();
        let processed = self.inner.start_raw_product_processing(&bands).map_err(to_py_err)?;
        Ok(processed.iter().map(|p| p.to_string_lossy().to_string()).collect())
    }

    /// Cloud-masked composite of every processed product, one array per band
    #[pyo3(signature = (bands, aggregation="nanmean"))]
    fn composite<'py>(
        &self,
        py: Python<'py>,
        bands: Vec<String>,
        aggregation: &str,
    ) -> PyResult<HashMap<String, &'py PyArray2<f32>>> {
        let aggregation: Aggregation = aggregation.parse().map_err(to_py_err)?;
        let bands: Vec<&str> = bands.iter().map(|b| b.as_str()).collect();
        let composite = self
            .inner
            .combine_processed_products(&bands, CloudMaskBuilder::default(), aggregation)
            .map_err(to_py_err)?;

        Ok(composite
            .bands
            .into_iter()
            .map(|(band, image)| (band, image.into_pyarray(py)))
            .collect())
    }

    /// Process, composite and segment with a JSON config (or the defaults),
    /// returning the label image
    #[pyo3(signature = (config_path=None))]
    fn run<'py>(&self, py: Python<'py>, config_path: Option<&str>) -> PyResult<&'py PyArray2<u32>> {
        let config = match config_path {
            Some(path) => PipelineConfig::from_json_file(path).map_err(to_py_err)?,
            None => PipelineConfig::default(),
        };
        let (_, segmentation) = self.inner.run(&config).map_err(to_py_err)?;
        Ok(segmentation.labels.into_pyarray(py))
    }

    fn __repr__(&self) -> String {
        format!("Aoi('{}', crs='{}')", self.inner.name(), self.inner.working_crs())
    }
}

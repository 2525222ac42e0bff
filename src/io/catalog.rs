//! Access to a remote product archive.
//!
//! The catalog answers footprint/date queries with candidate acquisitions and
//! hands out zipped products. Ranking and selection happen on this side so
//! that every catalog behaves the same way.

use crate::types::{FindusError, FindusResult};
use chrono::NaiveDate;
use geo::{BoundingRect, Polygon};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Search parameters for one AOI
#[derive(Debug, Clone)]
pub struct CatalogQuery {
    /// Footprint in geographic coordinates (lon/lat)
    pub footprint: Polygon<f64>,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub platform: String,
    pub processing_level: String,
}

impl CatalogQuery {
    pub fn new(footprint: Polygon<f64>, start_date: NaiveDate, end_date: NaiveDate) -> Self {
        Self {
            footprint,
            start_date,
            end_date,
            platform: "Sentinel-2".to_string(),
            processing_level: "Level-2A".to_string(),
        }
    }

    /// `[min_x, min_y, max_x, max_y]` of the footprint
    pub fn bbox(&self) -> FindusResult<[f64; 4]> {
        let rect = self
            .footprint
            .bounding_rect()
            .ok_or_else(|| FindusError::InvalidParameter("Empty query footprint".to_string()))?;
        Ok([rect.min().x, rect.min().y, rect.max().x, rect.max().y])
    }
}

/// One candidate acquisition returned by a catalog
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductEntry {
    pub id: String,
    pub name: String,
    pub cloud_cover: f64,
    #[serde(default)]
    pub sensing_date: Option<NaiveDate>,
    /// Footprint bounding box `[min_x, min_y, max_x, max_y]` in lon/lat
    #[serde(default)]
    pub bbox: Option<[f64; 4]>,
    #[serde(default)]
    pub download_url: Option<String>,
}

/// Remote archive of acquisitions
pub trait ProductCatalog {
    /// Acquisitions intersecting the query footprint within the date range
    fn query(&self, query: &CatalogQuery) -> FindusResult<Vec<ProductEntry>>;

    /// Retrieve the zipped product into `directory`, returning the archive path
    fn download(&self, entry: &ProductEntry, directory: &Path) -> FindusResult<PathBuf>;
}

/// Order candidates from least to most cloudy
pub fn rank_by_cloud_cover(entries: &mut [ProductEntry]) {
    entries.sort_by(|a, b| {
        a.cloud_cover
            .partial_cmp(&b.cloud_cover)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}

/// The `count` least cloudy candidates
pub fn select_best(mut entries: Vec<ProductEntry>, count: usize) -> Vec<ProductEntry> {
    rank_by_cloud_cover(&mut entries);
    entries.truncate(count);
    entries
}

fn archive_name(entry: &ProductEntry) -> String {
    format!("{}.zip", entry.name)
}

fn bbox_intersects(a: &[f64; 4], b: &[f64; 4]) -> bool {
    a[0] <= b[2] && b[0] <= a[2] && a[1] <= b[3] && b[1] <= a[3]
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    products: Vec<ProductEntry>,
}

/// JSON-over-HTTP catalog client.
///
/// Searches `GET {base}/search` and downloads either the entry's own
/// `download_url` or `GET {base}/products/{id}/download`.
pub struct HttpCatalog {
    base_url: String,
    client: reqwest::blocking::Client,
    credentials: Option<(String, String)>,
}

impl HttpCatalog {
    pub fn new(base_url: &str) -> FindusResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(600))
            .user_agent(concat!("findus/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| {
                FindusError::CatalogFailure(format!("Failed to create HTTP client: {}", e))
            })?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            credentials: None,
        })
    }

    /// Basic-auth credentials sent with every request
    pub fn with_credentials(mut self, username: &str, password: &str) -> Self {
        self.credentials = Some((username.to_string(), password.to_string()));
        self
    }

    fn get(&self, url: &str) -> reqwest::blocking::RequestBuilder {
        let request = self.client.get(url);
        match &self.credentials {
            Some((user, password)) => request.basic_auth(user, Some(password)),
            None => request,
        }
    }
}

impl ProductCatalog for HttpCatalog {
    fn query(&self, query: &CatalogQuery) -> FindusResult<Vec<ProductEntry>> {
        let bbox = query.bbox()?;
        let url = format!("{}/search", self.base_url);
        log::info!(
            "Querying {} for {} {} products between {} and {}",
            url,
            query.platform,
            query.processing_level,
            query.start_date,
            query.end_date
        );

        let response = self
            .get(&url)
            .query(&[
                ("bbox", format!("{},{},{},{}", bbox[0], bbox[1], bbox[2], bbox[3])),
                ("start", query.start_date.to_string()),
                ("end", query.end_date.to_string()),
                ("platform", query.platform.clone()),
                ("processing_level", query.processing_level.clone()),
            ])
            .send()
            .map_err(|e| FindusError::CatalogFailure(format!("Search request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(FindusError::CatalogFailure(format!(
                "Search returned HTTP {}",
                response.status()
            )));
        }

        let body: SearchResponse = response
            .json()
            .map_err(|e| FindusError::CatalogFailure(format!("Malformed search response: {}", e)))?;

        log::info!("Catalog returned {} products", body.products.len());
        Ok(body.products)
    }

    fn download(&self, entry: &ProductEntry, directory: &Path) -> FindusResult<PathBuf> {
        let url = entry
            .download_url
            .clone()
            .unwrap_or_else(|| format!("{}/products/{}/download", self.base_url, entry.id));
        let target = directory.join(archive_name(entry));
        let partial = directory.join(format!("{}.part", archive_name(entry)));

        log::info!("Downloading {} from {}", entry.name, url);

        let mut response = self
            .get(&url)
            .send()
            .map_err(|e| {
                FindusError::CatalogFailure(format!("Download of {} failed: {}", entry.name, e))
            })?;

        if !response.status().is_success() {
            return Err(FindusError::CatalogFailure(format!(
                "Download of {} returned HTTP {}",
                entry.name,
                response.status()
            )));
        }

        let mut file = File::create(&partial)?;
        response
            .copy_to(&mut file)
            .map_err(|e| {
                FindusError::CatalogFailure(format!("Download of {} failed: {}", entry.name, e))
            })?;
        drop(file);
        fs::rename(&partial, &target)?;

        Ok(target)
    }
}

/// Catalog backed by a local mirror directory.
///
/// The directory holds the zipped products and an `index.json` listing them
/// as [`ProductEntry`] records; an entry's archive is `<name>.zip`.
pub struct DirectoryCatalog {
    root: PathBuf,
}

impl DirectoryCatalog {
    pub const INDEX_FILE: &'static str = "index.json";

    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn read_index(&self) -> FindusResult<Vec<ProductEntry>> {
        let index_path = self.root.join(Self::INDEX_FILE);
        let content = fs::read_to_string(&index_path).map_err(|e| {
            FindusError::CatalogFailure(format!("Cannot read {}: {}", index_path.display(), e))
        })?;
        serde_json::from_str(&content).map_err(|e| {
            FindusError::CatalogFailure(format!("Malformed {}: {}", index_path.display(), e))
        })
    }
}

impl ProductCatalog for DirectoryCatalog {
    fn query(&self, query: &CatalogQuery) -> FindusResult<Vec<ProductEntry>> {
        let bbox = query.bbox()?;
        let entries = self
            .read_index()?
            .into_iter()
            .filter(|entry| match entry.sensing_date {
                Some(date) => date >= query.start_date && date <= query.end_date,
                None => true,
            })
            .filter(|entry| match &entry.bbox {
                Some(footprint) => bbox_intersects(footprint, &bbox),
                None => true,
            })
            .collect::<Vec<_>>();

        log::info!("Local catalog {} matched {} products", self.root.display(), entries.len());
        Ok(entries)
    }

    fn download(&self, entry: &ProductEntry, directory: &Path) -> FindusResult<PathBuf> {
        let source = self.root.join(archive_name(entry));
        if !source.is_file() {
            return Err(FindusError::CatalogFailure(format!(
                "Archive {} missing from local catalog",
                source.display()
            )));
        }
        let target = directory.join(archive_name(entry));
        fs::copy(&source, &target)?;
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::polygon;

    fn entry(name: &str, cloud_cover: f64, date: (i32, u32, u32)) -> ProductEntry {
        ProductEntry {
            id: format!("id-{}", name),
            name: name.to_string(),
            cloud_cover,
            sensing_date: NaiveDate::from_ymd_opt(date.0, date.1, date.2),
            bbox: Some([8.0, 46.0, 9.5, 47.0]),
            download_url: None,
        }
    }

    fn query() -> CatalogQuery {
        CatalogQuery::new(
            polygon![(x: 8.5, y: 46.5), (x: 8.6, y: 46.5), (x: 8.6, y: 46.6), (x: 8.5, y: 46.6)],
            NaiveDate::from_ymd_opt(2019, 6, 1).unwrap(),
            NaiveDate::from_ymd_opt(2019, 6, 30).unwrap(),
        )
    }

    #[test]
    fn test_select_least_cloudy() {
        let entries = vec![
            entry("a", 40.0, (2019, 6, 2)),
            entry("b", 3.5, (2019, 6, 5)),
            entry("c", 12.0, (2019, 6, 9)),
        ];
        let best = select_best(entries, 2);
        let names: Vec<&str> = best.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["b", "c"]);
    }

    #[test]
    fn test_directory_catalog_filters_and_downloads() {
        let mirror = tempfile::tempdir().unwrap();
        let raw = tempfile::tempdir().unwrap();

        let mut outside = entry("far", 1.0, (2019, 6, 3));
        outside.bbox = Some([20.0, 50.0, 21.0, 51.0]);
        let index = vec![
            entry("june", 5.0, (2019, 6, 14)),
            entry("july", 2.0, (2019, 7, 14)),
            outside,
        ];
        fs::write(
            mirror.path().join(DirectoryCatalog::INDEX_FILE),
            serde_json::to_string(&index).unwrap(),
        )
        .unwrap();
        fs::write(mirror.path().join("june.zip"), b"zip").unwrap();

        let catalog = DirectoryCatalog::new(mirror.path());
        let found = catalog.query(&query()).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "june");

        let archive = catalog.download(&found[0], raw.path()).unwrap();
        assert_eq!(archive, raw.path().join("june.zip"));
        assert!(archive.is_file());
    }

    #[test]
    fn test_missing_index_is_catalog_failure() {
        let mirror = tempfile::tempdir().unwrap();
        let catalog = DirectoryCatalog::new(mirror.path());
        assert!(matches!(catalog.query(&query()), Err(FindusError::CatalogFailure(_))));
    }
}

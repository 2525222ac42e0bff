use chrono::NaiveDate;
use findus::io::{DirectoryCatalog, ProductCatalog, ProductEntry};
use findus::Aoi;
use geo::polygon;
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use zip::write::FileOptions;
use zip::ZipWriter;

fn entry(name: &str, cloud_cover: f64, day: u32) -> ProductEntry {
    ProductEntry {
        id: format!("uuid-{}", day),
        name: name.to_string(),
        cloud_cover,
        sensing_date: NaiveDate::from_ymd_opt(2019, 6, day),
        bbox: Some([7.66, 46.85, 9.18, 47.85]),
        download_url: None,
    }
}

/// Zip holding `<name>.SAFE/GRANULE/<granule>/IMG_DATA/R10m/<band file>`
fn write_archive(dir: &Path, name: &str) {
    let file = File::create(dir.join(format!("{}.zip", name))).unwrap();
    let mut zip = ZipWriter::new(file);
    let options = FileOptions::default();
    zip.start_file(
        format!("{}.SAFE/GRANULE/L2A_T32TMT/IMG_DATA/R10m/T32TMT_B02_10m.jp2", name),
        options,
    )
    .unwrap();
    zip.write_all(b"not really a jp2").unwrap();
    zip.start_file(format!("{}.SAFE/MTD_MSIL2A.xml", name), options).unwrap();
    zip.write_all(b"<xml/>").unwrap();
    zip.finish().unwrap();
}

#[test]
fn test_request_and_download_least_cloudy() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mirror = tempfile::tempdir().unwrap();
    let base = tempfile::tempdir().unwrap();

    let clear = "S2A_MSIL2A_20190614T102031_N0212_R065_T32TMT_20190614T134713";
    let hazy = "S2B_MSIL2A_20190619T102029_N0212_R065_T32TMT_20190619T125437";
    let cloudy = "S2A_MSIL2A_20190624T102031_N0212_R065_T32TMT_20190624T131842";
    let index = vec![entry(cloudy, 71.0, 24), entry(clear, 0.4, 14), entry(hazy, 18.2, 19)];
    fs::write(
        mirror.path().join(DirectoryCatalog::INDEX_FILE),
        serde_json::to_string_pretty(&index).unwrap(),
    )
    .unwrap();
    for name in [clear, hazy, cloudy] {
        write_archive(mirror.path(), name);
    }

    let aoi = Aoi::new(
        polygon![
            (x: 8.50, y: 47.30),
            (x: 8.52, y: 47.30),
            (x: 8.52, y: 47.32),
            (x: 8.50, y: 47.32),
        ],
        "GRF",
        base.path(),
        "EPSG:4326",
        "EPSG:32632",
    )
    .unwrap();

    let catalog = DirectoryCatalog::new(mirror.path());
    let available = aoi
        .request_data(
            &catalog,
            NaiveDate::from_ymd_opt(2019, 6, 1).unwrap(),
            NaiveDate::from_ymd_opt(2019, 6, 20).unwrap(),
        )
        .unwrap();
    // the 24 June acquisition is outside the date range
    assert_eq!(available.len(), 2);

    let products = aoi.download_data(&catalog, available, 1).unwrap();
    assert_eq!(products, vec![aoi.directories().raw.join(format!("{}.SAFE", clear))]);
    assert!(products[0].join("MTD_MSIL2A.xml").is_file());
    assert_eq!(aoi.raw_products().unwrap(), products);

    // archives are removed once unpacked
    let leftovers: Vec<_> = fs::read_dir(&aoi.directories().raw)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().map(|x| x == "zip").unwrap_or(false))
        .collect();
    assert!(leftovers.is_empty());
}

#[test]
fn test_missing_archive_is_a_catalog_failure() {
    let mirror = tempfile::tempdir().unwrap();
    let raw = tempfile::tempdir().unwrap();
    let catalog = DirectoryCatalog::new(mirror.path());

    let missing = entry("S2A_MSIL2A_20190614T102031_N0212_R065_T32TMT_20190614T134713", 1.0, 14);
    let result = catalog.download(&missing, raw.path());
    assert!(matches!(result, Err(findus::FindusError::CatalogFailure(_))));
}

//! # Masked Index Export
//!
//! Builds the export job for one accepted scene: a single-band spectral index
//! (NDVI, EVI or FAI) computed from the scene's Sentinel-2 bands, masked to the
//! open interval `(low, high)`, clipped to the study area and reprojected to
//! the requested EPSG code at 10 m/pixel.
//!
//! Jobs are handed to an [`ExportSink`] and not awaited further. Submission
//! failures are logged and counted by the caller, never raised, so one bad
//! export does not stop the run.
//!
//! A job manifest carries the index `expression` and the `mask`, not pixels.
//! [`masked_index`] is the reference evaluation of that pair: a raster worker
//! consuming the manifests must produce the same values for the same bands,
//! NaN included.

use crate::{Bounds, ImageCandidate};
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{info, warn};

/// Sentinel-2 band centre wavelengths (µm) used by the floating algae index.
const LAMBDA_NIR: f64 = 0.842;
const LAMBDA_RED_EDGE: f64 = 0.705;
const LAMBDA_SWIR: f64 = 1.610;

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("export IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("export encoding: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("band {band} has {got} pixels, expected {expected}")]
    BandShape {
        band: String,
        got: usize,
        expected: usize,
    },

    #[error("band {0} missing from the stack")]
    MissingBand(String),
}

/// Spectral index applied to accepted scenes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexKind {
    /// `(B8 - B4) / (B8 + B4)`
    #[default]
    Ndvi,
    /// `2.5 * (B8 - B4) / (B8 + 6 * B4 - 7.5 * B2 + 1)`
    Evi,
    /// Floating algae index from B8, B5 and B11
    Fai,
}

impl IndexKind {
    pub fn name(&self) -> &'static str {
        match self {
            IndexKind::Ndvi => "ndvi",
            IndexKind::Evi => "evi",
            IndexKind::Fai => "fai",
        }
    }

    /// Sentinel-2 bands the formula reads.
    pub fn bands(&self) -> &'static [&'static str] {
        match self {
            IndexKind::Ndvi => &["B08", "B04"],
            IndexKind::Evi => &["B08", "B04", "B02"],
            IndexKind::Fai => &["B08", "B05", "B11"],
        }
    }

    /// Band-math expression shipped with the export job.
    pub fn expression(&self) -> String {
        match self {
            IndexKind::Ndvi => "(B08 - B04) / (B08 + B04)".to_string(),
            IndexKind::Evi => "2.5 * (B08 - B04) / (B08 + 6 * B04 - 7.5 * B02 + 1)".to_string(),
            IndexKind::Fai => format!(
                "B08 - (B05 + (B11 - B05) * ({} - {}) / ({} - {}))",
                LAMBDA_NIR, LAMBDA_RED_EDGE, LAMBDA_SWIR, LAMBDA_RED_EDGE
            ),
        }
    }

    /// Evaluate the index for one pixel. `None` when an input is missing or
    /// not finite, or when the denominator vanishes.
    pub fn evaluate(&self, band: impl Fn(&str) -> Option<f64>) -> Option<f64> {
        let get = |name: &str| band(name).filter(|v| v.is_finite());
        let value = match self {
            IndexKind::Ndvi => {
                let (nir, red) = (get("B08")?, get("B04")?);
                ratio(nir - red, nir + red)?
            }
            IndexKind::Evi => {
                let (nir, red, blue) = (get("B08")?, get("B04")?, get("B02")?);
                2.5 * ratio(nir - red, nir + 6.0 * red - 7.5 * blue + 1.0)?
            }
            IndexKind::Fai => {
                let (nir, red_edge, swir) = (get("B08")?, get("B05")?, get("B11")?);
                let slope = (LAMBDA_NIR - LAMBDA_RED_EDGE) / (LAMBDA_SWIR - LAMBDA_RED_EDGE);
                nir - (red_edge + (swir - red_edge) * slope)
            }
        };
        value.is_finite().then_some(value)
    }
}

fn ratio(num: f64, den: f64) -> Option<f64> {
    (den.abs() > 1e-10).then(|| num / den)
}

/// Open interval of index values that survive masking.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct MaskRange {
    pub low: f64,
    pub high: f64,
}

impl MaskRange {
    /// `low < value < high`
    pub fn keeps(&self, value: f64) -> bool {
        value > self.low && value < self.high
    }
}

/// Compute the masked index over co-registered band rasters.
///
/// Every band must hold the same number of pixels. Pixels that are undefined
/// or fall outside the mask come back as NaN.
pub fn masked_index(
    kind: IndexKind,
    mask: MaskRange,
    stack: &BTreeMap<String, Vec<f64>>,
) -> Result<Vec<f64>, ExportError> {
    let mut len = None;
    for band in kind.bands() {
        let pixels = stack
            .get(*band)
            .ok_or_else(|| ExportError::MissingBand(band.to_string()))?;
        match len {
            None => len = Some(pixels.len()),
            Some(expected) if expected != pixels.len() => {
                return Err(ExportError::BandShape {
                    band: band.to_string(),
                    got: pixels.len(),
                    expected,
                })
            }
            Some(_) => {}
        }
    }

    Ok((0..len.unwrap_or(0))
        .map(|i| {
            kind.evaluate(|band| stack.get(band).map(|px| px[i]))
                .filter(|v| mask.keeps(*v))
                .unwrap_or(f64::NAN)
        })
        .collect())
}

/// Export file name: index name plus the acquisition date without separators.
pub fn export_name(kind: IndexKind, date: NaiveDate) -> String {
    format!("{}_{}", kind.name(), date.format("%Y%m%d"))
}

/// Destination settings shared by every job of a run.
#[derive(Clone, Debug, PartialEq)]
pub struct ExportSettings {
    pub folder: String,
    pub epsg: u32,
    /// Output pixel size in metres
    pub scale_m: f64,
    pub max_pixels: f64,
}

impl Default for ExportSettings {
    fn default() -> Self {
        Self {
            folder: "Dollymount_Strand".to_string(),
            epsg: 32629,
            scale_m: 10.0,
            max_pixels: 1e13,
        }
    }
}

/// A queued raster export.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExportJob {
    pub name: String,
    pub file_name_prefix: String,
    pub folder: String,
    /// `EPSG:<code>`
    pub crs: String,
    pub scale_m: f64,
    pub max_pixels: f64,
    /// Closed `[lon, lat]` ring
    pub region: Vec<[f64; 2]>,
    pub image_id: String,
    pub collection: Option<String>,
    pub acquisition_date: NaiveDate,
    pub index: IndexKind,
    pub expression: String,
    /// Band name to asset href, limited to the bands the index reads
    pub bands: BTreeMap<String, String>,
    pub mask: MaskRange,
}

/// Destination for export jobs.
#[async_trait]
pub trait ExportSink: Send + Sync {
    async fn submit(&self, job: &ExportJob) -> Result<(), ExportError>;
}

/// Writes each job as `<root>/<folder>/<name>__<image id>.json` for a
/// downstream raster worker. The image id keeps scenes from different tiles
/// on the same day in separate files.
pub struct ManifestSink {
    root: PathBuf,
}

impl ManifestSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn job_path(&self, job: &ExportJob) -> PathBuf {
        let image: String = job
            .image_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.root
            .join(&job.folder)
            .join(format!("{}__{}.json", job.file_name_prefix, image))
    }
}

#[async_trait]
impl ExportSink for ManifestSink {
    async fn submit(&self, job: &ExportJob) -> Result<(), ExportError> {
        let path = self.job_path(job);
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let data = serde_json::to_vec_pretty(job)?;
        tokio::fs::write(&path, data).await?;
        Ok(())
    }
}

/// Turns accepted scenes into export jobs.
pub struct IndexExporter<S: ExportSink> {
    sink: S,
    kind: IndexKind,
    mask: MaskRange,
    settings: ExportSettings,
}

impl<S: ExportSink> IndexExporter<S> {
    pub fn new(sink: S, kind: IndexKind, mask: MaskRange, settings: ExportSettings) -> Self {
        Self {
            sink,
            kind,
            mask,
            settings,
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Describe the export of `image` clipped to `bounds`.
    pub fn job(&self, image: &ImageCandidate, date: NaiveDate, bounds: &Bounds) -> ExportJob {
        let name = export_name(self.kind, date);
        let bands: BTreeMap<String, String> = self
            .kind
            .bands()
            .iter()
            .filter_map(|band| {
                image
                    .handle
                    .bands
                    .get(*band)
                    .map(|href| (band.to_string(), href.clone()))
            })
            .collect();
        if bands.len() < self.kind.bands().len() {
            warn!(image = %image.id, index = self.kind.name(), "scene is missing bands needed by the index");
        }

        ExportJob {
            file_name_prefix: name.clone(),
            name,
            folder: self.settings.folder.clone(),
            crs: format!("EPSG:{}", self.settings.epsg),
            scale_m: self.settings.scale_m,
            max_pixels: self.settings.max_pixels,
            region: bounds.ring(),
            image_id: image.id.clone(),
            collection: image.handle.collection.clone(),
            acquisition_date: date,
            index: self.kind,
            expression: self.kind.expression(),
            bands,
            mask: self.mask,
        }
    }

    /// Queue the export. Returns whether the sink accepted the job.
    pub async fn export(&self, image: &ImageCandidate, date: NaiveDate, bounds: &Bounds) -> bool {
        let job = self.job(image, date, bounds);
        match self.sink.submit(&job).await {
            Ok(()) => {
                info!("Image '{}/{}' export queued", job.folder, job.name);
                true
            }
            Err(e) => {
                warn!(image = %image.id, error = %e, "export submission failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ImageHandle;
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2021, 6, 15).unwrap()
    }

    fn candidate() -> ImageCandidate {
        let bands = [("B04", "s3://b04.tif"), ("B08", "s3://b08.tif"), ("B02", "s3://b02.tif")]
            .iter()
            .map(|(b, h)| (b.to_string(), h.to_string()))
            .collect();
        ImageCandidate {
            id: "20210615T114629_20210615T114624_T29UPV".to_string(),
            acquired: Utc.with_ymd_and_hms(2021, 6, 15, 11, 46, 29).unwrap(),
            cloud_cover: Some(4.0),
            tile_code: Some("T29UPV".to_string()),
            handle: ImageHandle {
                collection: Some("sentinel-2-l2a".to_string()),
                bands,
                clip: Bounds::around(53.35, -6.16, 0.05),
            },
        }
    }

    fn pixel<'a>(values: &'a [(&'static str, f64)]) -> impl Fn(&str) -> Option<f64> + 'a {
        move |band| values.iter().find(|(b, _)| *b == band).map(|(_, v)| *v)
    }

    #[test]
    fn test_export_name_strips_separators() {
        assert_eq!(export_name(IndexKind::Ndvi, day()), "ndvi_20210615");
        assert_eq!(export_name(IndexKind::Fai, day()), "fai_20210615");
    }

    #[test]
    fn test_ndvi_values() {
        let v = IndexKind::Ndvi.evaluate(pixel(&[("B08", 0.5), ("B04", 0.1)])).unwrap();
        assert!((v - 0.4 / 0.6).abs() < 1e-12);
        assert!(IndexKind::Ndvi.evaluate(pixel(&[("B08", 0.0), ("B04", 0.0)])).is_none());
        assert!(IndexKind::Ndvi.evaluate(pixel(&[("B08", 0.5)])).is_none());
    }

    #[test]
    fn test_evi_and_fai_values() {
        let evi = IndexKind::Evi
            .evaluate(pixel(&[("B08", 0.4), ("B04", 0.1), ("B02", 0.05)]))
            .unwrap();
        assert!((evi - 2.5 * 0.3 / (0.4 + 0.6 - 0.375 + 1.0)).abs() < 1e-12);

        // Flat spectrum has no algae signal.
        let fai = IndexKind::Fai
            .evaluate(pixel(&[("B08", 0.2), ("B05", 0.2), ("B11", 0.2)]))
            .unwrap();
        assert!(fai.abs() < 1e-12);
    }

    #[test]
    fn test_mask_is_strict_on_both_sides() {
        let mask = MaskRange { low: 0.1, high: 1.0 };
        assert!(!mask.keeps(0.1));
        assert!(mask.keeps(0.1000001));
        assert!(mask.keeps(0.99));
        assert!(!mask.keeps(1.0));
    }

    #[test]
    fn test_masked_index_marks_rejected_pixels_nan() {
        let mut stack = BTreeMap::new();
        stack.insert("B08".to_string(), vec![0.5, 0.1, 0.0, 0.3]);
        stack.insert("B04".to_string(), vec![0.1, 0.5, 0.0, 0.1]);

        let out = masked_index(IndexKind::Ndvi, MaskRange { low: 0.1, high: 1.0 }, &stack).unwrap();

        assert_eq!(out.len(), 4);
        assert!((out[0] - 0.4 / 0.6).abs() < 1e-12);
        assert!(out[1].is_nan()); // negative NDVI
        assert!(out[2].is_nan()); // undefined
        assert!((out[3] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_masked_index_checks_the_stack() {
        let mut stack = BTreeMap::new();
        stack.insert("B08".to_string(), vec![0.5, 0.1]);
        let mask = MaskRange { low: -1.0, high: 1.0 };
        assert!(matches!(
            masked_index(IndexKind::Ndvi, mask, &stack),
            Err(ExportError::MissingBand(ref b)) if b == "B04"
        ));

        stack.insert("B04".to_string(), vec![0.1]);
        assert!(matches!(
            masked_index(IndexKind::Ndvi, mask, &stack),
            Err(ExportError::BandShape { got: 1, expected: 2, .. })
        ));
    }

    #[test]
    fn test_job_fields() {
        let sink = ManifestSink::new("/tmp/unused");
        let exporter = IndexExporter::new(
            sink,
            IndexKind::Ndvi,
            MaskRange { low: 0.1, high: 1.0 },
            ExportSettings::default(),
        );
        let image = candidate();
        let job = exporter.job(&image, day(), &image.handle.clip);

        assert_eq!(job.name, "ndvi_20210615");
        assert_eq!(job.file_name_prefix, job.name);
        assert_eq!(job.crs, "EPSG:32629");
        assert_eq!(job.scale_m, 10.0);
        assert_eq!(job.max_pixels, 1e13);
        assert_eq!(job.region.len(), 5);
        assert_eq!(job.region.first(), job.region.last());
        // Only the bands NDVI reads are shipped.
        assert_eq!(job.bands.keys().collect::<Vec<_>>(), vec!["B04", "B08"]);
    }

    #[tokio::test]
    async fn test_manifest_sink_writes_job_file() {
        let dir = TempDir::new().unwrap();
        let exporter = IndexExporter::new(
            ManifestSink::new(dir.path()),
            IndexKind::Evi,
            MaskRange { low: -1.0, high: 1.0 },
            ExportSettings::default(),
        );
        let image = candidate();

        assert!(exporter.export(&image, day(), &image.handle.clip).await);

        let path = dir
            .path()
            .join("Dollymount_Strand")
            .join("evi_20210615__20210615T114629_20210615T114624_T29UPV.json");
        let job: ExportJob = serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap();
        assert_eq!(job.index, IndexKind::Evi);
        assert_eq!(job.image_id, image.id);
        assert_eq!(job.bands.len(), 3);
    }

    #[test]
    fn test_job_path_is_unique_per_scene() {
        let sink = ManifestSink::new("/out");
        let exporter = IndexExporter::new(
            ManifestSink::new("/unused"),
            IndexKind::Ndvi,
            MaskRange { low: 0.1, high: 1.0 },
            ExportSettings::default(),
        );
        let mut image = candidate();
        let first = exporter.job(&image, day(), &image.handle.clip);
        image.id = "S2B_29UQV_20210615_0_L2A".to_string();
        let second = exporter.job(&image, day(), &image.handle.clip);

        assert_eq!(first.name, second.name);
        assert_ne!(sink.job_path(&first), sink.job_path(&second));

        image.id = "../../etc/S2B".to_string();
        let odd = exporter.job(&image, day(), &image.handle.clip);
        assert_eq!(
            sink.job_path(&odd),
            PathBuf::from(format!("/out/Dollymount_Strand/ndvi_20210615__{}etc_S2B.json", "_".repeat(6)))
        );
    }
}

//! # Configuration Management
//!
//! This module loads run parameters and service settings from
//! `intertidal-config.toml`. The `[parameters]` table mirrors the fields an
//! operator fills in (kept as text so [`crate::validation`] can apply the same
//! checks to every front end); the other tables tune the external services.

use crate::index::IndexKind;
use crate::pipeline::EmptyTidePolicy;
use crate::tide_window::IntervalPolicy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Default configuration file name, looked up in the working directory.
pub const CONFIG_FILE: &str = "intertidal-config.toml";

/// Application configuration loaded from intertidal-config.toml
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Operator-supplied run parameters
    pub parameters: Parameters,
    /// WorldTides settings
    pub tides: TideServiceConfig,
    /// STAC catalog settings
    pub catalog: CatalogConfig,
    /// Export destination settings
    pub export: ExportConfig,
    /// Orchestration behaviour
    pub run: RunConfig,
}

/// Run parameters exactly as entered.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Parameters {
    pub latitude: String,
    pub longitude: String,
    /// WorldTides API key
    pub api_key: String,
    /// Two-digit UTC hours, `"00"` to `"24"`
    pub start_hour: String,
    pub end_hour: String,
    /// `YYYY-MM-DD`, no earlier than 2017-03-01
    pub start_date: String,
    pub end_date: String,
    /// Maximum cloud cover, integer percent
    pub cloud_percentage: String,
    /// One or more tile tokens, comma separated (e.g. `"T29UPV,T29UQV"`)
    pub tile: String,
    /// Index mask bounds, each in [-1, 1]
    pub index_low: String,
    pub index_high: String,
    /// Study area: `"west,south,east,north"` in degrees, or a named reference
    /// resolved to a box around the coordinates
    pub geometry: String,
    pub epsg: String,
    /// Destination folder name
    pub folder: String,
}

impl Default for Parameters {
    fn default() -> Self {
        Parameters {
            latitude: "53.35293".to_string(),
            longitude: "-6.16435".to_string(),
            api_key: String::new(), // supplied per operator, never shipped
            start_hour: "10".to_string(),
            end_hour: "14".to_string(),
            start_date: "2021-06-01".to_string(),
            end_date: "2021-08-30".to_string(),
            cloud_percentage: "30".to_string(),
            tile: "T29UPV".to_string(),
            index_low: "0.10".to_string(),
            index_high: "1".to_string(),
            geometry: "DollymountStrand_32629".to_string(),
            epsg: "32629".to_string(),
            folder: "Dollymount_Strand".to_string(),
        }
    }
}

/// WorldTides service configuration
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct TideServiceConfig {
    pub endpoint: String,
    /// Keys tried in order after the operator's key runs out of credits
    pub fallback_keys: Vec<String>,
    /// Upper edge handling of the hour window
    pub interval_policy: IntervalPolicy,
    /// Reuse one lookup for scenes sharing a day
    pub dedupe_by_date: bool,
    pub timeout_secs: u64,
}

impl Default for TideServiceConfig {
    fn default() -> Self {
        TideServiceConfig {
            endpoint: crate::tide_data::WORLDTIDES_ENDPOINT.to_string(),
            fallback_keys: Vec::new(),
            interval_policy: IntervalPolicy::Closed,
            dedupe_by_date: false,
            timeout_secs: 30,
        }
    }
}

/// STAC catalog configuration
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct CatalogConfig {
    pub endpoint: String,
    pub collection: String,
    pub page_size: u32,
    pub max_items: usize,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        CatalogConfig {
            endpoint: crate::catalog::EARTH_SEARCH_URL.to_string(),
            collection: crate::catalog::SENTINEL2_L2A.to_string(),
            page_size: 100,
            max_items: 1000,
            timeout_secs: 30,
            max_retries: 3,
        }
    }
}

/// Export configuration
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ExportConfig {
    /// Index computed for accepted scenes
    pub index: IndexKind,
    /// Root directory receiving job manifests
    pub output_dir: PathBuf,
    /// Output pixel size in metres
    pub scale_m: f64,
    pub max_pixels: f64,
}

impl Default for ExportConfig {
    fn default() -> Self {
        ExportConfig {
            index: IndexKind::Ndvi,
            output_dir: PathBuf::from("exports"),
            scale_m: 10.0,
            max_pixels: 1e13,
        }
    }
}

/// Orchestration configuration
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct RunConfig {
    /// What a day without any predicted extremes does to the run
    pub empty_tide_policy: EmptyTidePolicy,
    /// Half-size in degrees of the box used when `geometry` is a name
    pub area_half_size_deg: f64,
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig {
            empty_tide_policy: EmptyTidePolicy::Abort,
            area_half_size_deg: 0.05,
        }
    }
}

impl Config {
    /// Load configuration from intertidal-config.toml
    /// Falls back to default configuration if file doesn't exist or is invalid
    pub fn load() -> Self {
        Self::load_from_path(CONFIG_FILE)
    }

    /// Load configuration from specified path
    /// Falls back to default configuration if file doesn't exist or is invalid
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(contents) => match toml::from_str::<Config>(&contents) {
                Ok(config) => {
                    info!(path = %path.display(), folder = %config.parameters.folder, "loaded configuration");
                    config
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "invalid config file format, using defaults");
                    Self::default()
                }
            },
            Err(_) => {
                info!(path = %path.display(), "no config file found, using defaults");
                Self::default()
            }
        }
    }

    /// Save current configuration to `path`
    pub fn save_to_path<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path.as_ref(), contents)?;
        info!(path = %path.as_ref().display(), "configuration saved");
        Ok(())
    }
}

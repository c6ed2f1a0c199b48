//! # Parameter Validation
//!
//! Checks the operator's [`Parameters`] once, before any network call, and
//! turns them into the typed [`PipelineConfig`] a run is driven by.

use crate::config::Config;
use crate::index::MaskRange;
use crate::pipeline::PipelineConfig;
use crate::tide_window::MatchWindow;
use crate::{Bounds, DateRange};
use chrono::NaiveDate;
use regex::Regex;
use std::path::{Component, Path};
use std::sync::OnceLock;
use thiserror::Error;
use tracing::warn;

#[cfg(doc)]
use crate::config::Parameters;

/// First day with Sentinel-2 surface reflectance coverage.
pub const ARCHIVE_START: (i32, u32, u32) = (2017, 3, 1);

/// Reasons a parameter set is rejected.
#[derive(Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("fields must not be empty: {0}")]
    EmptyField(&'static str),

    #[error("invalid input for {field}: {value:?}")]
    NotANumber { field: &'static str, value: String },

    #[error("{field} out of range: {value}")]
    Coordinate { field: &'static str, value: f64 },

    #[error("low tide time range must be two-digit integers between 00 and 24")]
    HourRange,

    #[error("date range must be in the format 'YYYY-MM-DD'")]
    DateFormat,

    #[error("not a calendar date: {0}")]
    InvalidDate(String),

    #[error("start date must be on or after March 1st 2017")]
    BeforeArchive,

    #[error("start date {start} is after end date {end}")]
    DateOrder { start: NaiveDate, end: NaiveDate },

    #[error("cloudy percentage must be an integer between 0 and 100")]
    CloudRange,

    #[error("index range must be values between -1 and 1 (for example 0.10 or -0.5)")]
    IndexRange,

    #[error("EPSG code must be a positive integer, got {0:?}")]
    Epsg(String),

    #[error("geometry bounds must be west,south,east,north with west<east and south<north")]
    Geometry,

    #[error("area half size must be a positive number of degrees, got {0}")]
    AreaSize(f64),

    #[error("folder must be a single directory name, got {0:?}")]
    Folder(String),
}

fn date_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^\d{4}-\d{2}-\d{2}$").expect("static pattern"))
}

/// Validate the whole configuration into a [`PipelineConfig`].
pub fn validate(config: &Config) -> Result<PipelineConfig, ValidationError> {
    let p = &config.parameters;

    for (name, value) in [
        ("latitude", &p.latitude),
        ("longitude", &p.longitude),
        ("api_key", &p.api_key),
        ("tile", &p.tile),
        ("geometry", &p.geometry),
        ("epsg", &p.epsg),
        ("folder", &p.folder),
    ] {
        if value.trim().is_empty() {
            return Err(ValidationError::EmptyField(name));
        }
    }

    let latitude = parse_coordinate("latitude", &p.latitude, 90.0)?;
    let longitude = parse_coordinate("longitude", &p.longitude, 180.0)?;

    let start_hour = parse_hour("start_hour", &p.start_hour)?;
    let end_hour = parse_hour("end_hour", &p.end_hour)?;
    if start_hour > end_hour {
        warn!(start_hour, end_hour, "hour window is empty, no scene can match");
    }

    let dates = parse_date_range(&p.start_date, &p.end_date)?;
    let cloud_ceiling = parse_cloud(&p.cloud_percentage)?;

    let index_low = parse_index_bound("index_low", &p.index_low)?;
    let index_high = parse_index_bound("index_high", &p.index_high)?;
    if index_low >= index_high {
        warn!(index_low, index_high, "index mask is empty, exports will be fully masked");
    }

    let epsg = p
        .epsg
        .trim()
        .parse::<u32>()
        .ok()
        .filter(|code| *code > 0)
        .ok_or_else(|| ValidationError::Epsg(p.epsg.clone()))?;

    let bounds = parse_geometry(&p.geometry, latitude, longitude, config.run.area_half_size_deg)?;
    let folder = parse_folder(&p.folder)?;

    let tiles: Vec<String> = p
        .tile
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(String::from)
        .collect();
    if tiles.is_empty() {
        return Err(ValidationError::EmptyField("tile"));
    }

    Ok(PipelineConfig {
        latitude,
        longitude,
        api_key: p.api_key.trim().to_string(),
        fallback_keys: config.tides.fallback_keys.clone(),
        window: MatchWindow::new(start_hour, end_hour, config.tides.interval_policy),
        dates,
        cloud_ceiling,
        tiles,
        index: config.export.index,
        mask: MaskRange {
            low: index_low,
            high: index_high,
        },
        geometry: p.geometry.trim().to_string(),
        bounds,
        epsg,
        folder,
        empty_tide_policy: config.run.empty_tide_policy,
    })
}

fn parse_number(field: &'static str, value: &str) -> Result<f64, ValidationError> {
    value
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| ValidationError::NotANumber {
            field,
            value: value.to_string(),
        })
}

fn parse_coordinate(field: &'static str, value: &str, limit: f64) -> Result<f64, ValidationError> {
    let v = parse_number(field, value)?;
    if v.abs() > limit {
        return Err(ValidationError::Coordinate { field, value: v });
    }
    Ok(v)
}

/// An hour must be an integer in 0..=24 written with exactly two characters.
pub fn parse_hour(field: &'static str, value: &str) -> Result<u32, ValidationError> {
    let hour: i64 = value.trim().parse().map_err(|_| ValidationError::NotANumber {
        field,
        value: value.to_string(),
    })?;
    if !(0..=24).contains(&hour) || value.len() != 2 {
        return Err(ValidationError::HourRange);
    }
    Ok(hour as u32)
}

/// Parse a `YYYY-MM-DD` day.
pub fn parse_date(value: &str) -> Result<NaiveDate, ValidationError> {
    if !date_pattern().is_match(value) {
        return Err(ValidationError::DateFormat);
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map_err(|_| ValidationError::InvalidDate(value.to_string()))
}

/// Parse the date range and enforce the archive start and ordering.
pub fn parse_date_range(start: &str, end: &str) -> Result<DateRange, ValidationError> {
    let (start, end) = (parse_date(start)?, parse_date(end)?);
    let (y, m, d) = ARCHIVE_START;
    let archive_start = NaiveDate::from_ymd_opt(y, m, d).ok_or(ValidationError::BeforeArchive)?;
    if start < archive_start {
        return Err(ValidationError::BeforeArchive);
    }
    if start > end {
        return Err(ValidationError::DateOrder { start, end });
    }
    Ok(DateRange { start, end })
}

fn parse_cloud(value: &str) -> Result<f64, ValidationError> {
    let pct: i64 = value.trim().parse().map_err(|_| ValidationError::NotANumber {
        field: "cloud_percentage",
        value: value.to_string(),
    })?;
    if !(0..=100).contains(&pct) {
        return Err(ValidationError::CloudRange);
    }
    Ok(pct as f64)
}

fn parse_index_bound(field: &'static str, value: &str) -> Result<f64, ValidationError> {
    let v = parse_number(field, value)?;
    if !(-1.0..=1.0).contains(&v) {
        return Err(ValidationError::IndexRange);
    }
    Ok(v)
}

/// Four comma-separated numbers are explicit bounds; anything else names an
/// area that is approximated by a box around the coordinates.
fn parse_geometry(
    value: &str,
    lat: f64,
    lon: f64,
    half_size: f64,
) -> Result<Bounds, ValidationError> {
    let parts: Vec<&str> = value.split(',').map(str::trim).collect();
    if parts.len() != 4 {
        if !(half_size.is_finite() && half_size > 0.0) {
            return Err(ValidationError::AreaSize(half_size));
        }
        return Ok(Bounds::around(lat, lon, half_size));
    }
    let numbers: Vec<f64> = parts.iter().filter_map(|s| s.parse().ok()).collect();
    let [west, south, east, north] = numbers[..] else {
        return Err(ValidationError::Geometry);
    };
    let bounds = Bounds::new(west, south, east, north);
    if !bounds.is_well_formed() {
        return Err(ValidationError::Geometry);
    }
    Ok(bounds)
}

/// The folder becomes one directory under the export root.
fn parse_folder(value: &str) -> Result<String, ValidationError> {
    let folder = value.trim();
    let mut components = Path::new(folder).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) if !folder.contains(['/', '\\']) => {
            Ok(folder.to_string())
        }
        _ => Err(ValidationError::Folder(value.to_string())),
    }
}

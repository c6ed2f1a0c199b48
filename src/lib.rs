//! # BioIntertidal Mapper Core Library
//!
//! This library selects satellite scenes of an intertidal zone that were
//! acquired while the tide was low, and queues a masked spectral index export
//! for each of them.
//!
//! ## Data Flow
//! 1. **Catalog**: query Sentinel-2 scenes by date range, bounds and cloud cover
//! 2. **Tiles**: keep only scenes whose identifier carries a requested tile token
//! 3. **Tides**: fetch the predicted low-tide extremes for each scene's UTC day
//! 4. **Window**: accept the scene when a low tide falls inside the hour window
//! 5. **Export**: queue a masked NDVI/EVI/FAI raster job for the accepted scene
//!
//! The catalog, the tide service and the export destination are external
//! collaborators hidden behind the traits in [`catalog`], [`tide_data`] and
//! [`index`]; [`pipeline`] wires them together.
//!
//! ## Core Types
//! - [`TideExtreme`]: one predicted high or low water at a UTC instant
//! - [`ImageCandidate`]: one catalog scene with its acquisition instant
//! - [`Bounds`] and [`DateRange`]: the spatial and temporal query filters

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub mod catalog;
pub mod config;
pub mod index;
pub mod pipeline;
pub mod tide_data;
pub mod tide_window;
pub mod validation;

#[cfg(test)]
mod tests;

/// Kind of tide extreme reported by the prediction service.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TideKind {
    High,
    Low,
}

/// A predicted local maximum or minimum of sea level.
///
/// `at` carries minute precision as delivered by the service. `source_date`
/// is the calendar day the prediction was requested for, which is not always
/// the UTC day of `at` when the service answers in a local offset.
///
/// # Example
/// ```
/// use chrono::{NaiveDate, TimeZone, Utc};
/// use intertidal_lib::{TideExtreme, TideKind};
///
/// let day = NaiveDate::from_ymd_opt(2021, 6, 15).unwrap();
/// let low = TideExtreme {
///     kind: TideKind::Low,
///     at: Utc.with_ymd_and_hms(2021, 6, 15, 11, 23, 0).unwrap(),
///     source_date: day,
///     height_m: Some(-1.4),
/// };
/// assert!(low.is_low());
/// assert_eq!(low.hour(), 11);
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TideExtreme {
    pub kind: TideKind,
    pub at: DateTime<Utc>,
    pub source_date: NaiveDate,
    /// Height relative to the service datum, when reported
    pub height_m: Option<f64>,
}

impl TideExtreme {
    pub fn is_low(&self) -> bool {
        self.kind == TideKind::Low
    }

    /// UTC hour of day (0..=23).
    pub fn hour(&self) -> u32 {
        chrono::Timelike::hour(&self.at)
    }

    /// `HH:MM` in UTC, as shown in the run log.
    pub fn clock_time(&self) -> String {
        self.at.format("%H:%M").to_string()
    }
}

/// Axis-aligned geographic bounds in WGS84 degrees.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub west: f64,
    pub south: f64,
    pub east: f64,
    pub north: f64,
}

impl Bounds {
    pub fn new(west: f64, south: f64, east: f64, north: f64) -> Self {
        Self {
            west,
            south,
            east,
            north,
        }
    }

    /// Small box centred on a point, `half_size` degrees on each side.
    pub fn around(lat: f64, lon: f64, half_size: f64) -> Self {
        Self::new(lon - half_size, lat - half_size, lon + half_size, lat + half_size)
    }

    /// `[west, south, east, north]`, the STAC bbox order.
    pub fn to_bbox(&self) -> Vec<f64> {
        vec![self.west, self.south, self.east, self.north]
    }

    /// Closed coordinate ring (`[lon, lat]` pairs, first point repeated).
    pub fn ring(&self) -> Vec<[f64; 2]> {
        vec![
            [self.west, self.south],
            [self.east, self.south],
            [self.east, self.north],
            [self.west, self.north],
            [self.west, self.south],
        ]
    }

    pub fn intersects(&self, other: &Bounds) -> bool {
        self.west <= other.east
            && other.west <= self.east
            && self.south <= other.north
            && other.south <= self.north
    }

    pub fn is_well_formed(&self) -> bool {
        self.west < self.east
            && self.south < self.north
            && (-180.0..=180.0).contains(&self.west)
            && (-180.0..=180.0).contains(&self.east)
            && (-90.0..=90.0).contains(&self.south)
            && (-90.0..=90.0).contains(&self.north)
    }
}

/// Inclusive range of calendar days.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn contains(&self, day: NaiveDate) -> bool {
        self.start <= day && day <= self.end
    }

    /// RFC 3339 interval covering both end days completely.
    pub fn to_interval(&self) -> String {
        format!(
            "{}T00:00:00Z/{}T23:59:59Z",
            self.start.format("%Y-%m-%d"),
            self.end.format("%Y-%m-%d")
        )
    }
}

/// Opaque reference to a scene's raster data inside the backing catalog.
///
/// Nothing is downloaded client-side: the band hrefs and the clip region are
/// handed to the export destination, which materializes the raster.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImageHandle {
    pub collection: Option<String>,
    /// Band name (e.g. `"B04"`) to asset href
    pub bands: BTreeMap<String, String>,
    /// Region the scene is clipped to
    pub clip: Bounds,
}

/// A catalog scene that passed the date, bounds and cloud filters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImageCandidate {
    pub id: String,
    pub acquired: DateTime<Utc>,
    pub cloud_cover: Option<f64>,
    /// Normalized grid cell code such as `T29UPV`, when the catalog reports one
    pub tile_code: Option<String>,
    pub handle: ImageHandle,
}

impl ImageCandidate {
    /// UTC calendar day of acquisition.
    pub fn acquisition_date(&self) -> NaiveDate {
        self.acquired.date_naive()
    }

    /// Substring test of a tile token against the identifier, falling back
    /// to the catalog-reported tile code.
    pub fn matches_tile(&self, token: &str) -> bool {
        if token.is_empty() {
            return false;
        }
        self.id.contains(token)
            || self
                .tile_code
                .as_deref()
                .map(|code| code.contains(token))
                .unwrap_or(false)
    }

    /// First token that matches, in the caller's order.
    pub fn first_matching_tile<'a>(&self, tokens: &'a [String]) -> Option<&'a str> {
        tokens
            .iter()
            .map(String::as_str)
            .find(|token| self.matches_tile(token))
    }
}

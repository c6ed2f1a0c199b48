//! # Low-Tide Scene Pipeline
//!
//! Runs one selection pass: query the catalog, keep the scenes on the
//! requested tiles, look up the low tides of each scene's UTC day, and queue
//! an index export for every scene whose day has a low tide inside the hour
//! window.
//!
//! Scenes are handled strictly one after another. The tide client's key ring
//! and the list of matches belong to a single run, and the stop rules below
//! depend on that order:
//! - a tide service failure (keys out of credits, invalid key, transport
//!   error) stops the run;
//! - a day for which the service lists no low tide at all stops the run under
//!   [`EmptyTidePolicy::Abort`] and is skipped under [`EmptyTidePolicy::Skip`];
//! - a raised [`CancellationFlag`] stops the run before the next scene.
//!
//! Matches found before a stop are kept in the [`PipelineResult`].

use crate::catalog::{CatalogError, CatalogQuery, ImageCatalog};
use crate::index::{ExportSink, IndexExporter, IndexKind, MaskRange};
use crate::tide_data::{TideError, TideKeyRing, TideSource};
use crate::tide_window::{self, MatchWindow};
use crate::{Bounds, DateRange, TideExtreme};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What a day without any predicted low tide does to the run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmptyTidePolicy {
    /// Stop processing the remaining scenes
    #[default]
    Abort,
    /// Move on to the next scene
    Skip,
}

/// Validated, immutable parameters of one run.
#[derive(Clone, Debug, PartialEq)]
pub struct PipelineConfig {
    pub latitude: f64,
    pub longitude: f64,
    pub api_key: String,
    pub fallback_keys: Vec<String>,
    pub window: MatchWindow,
    pub dates: DateRange,
    /// Percent, exclusive
    pub cloud_ceiling: f64,
    /// Tile tokens, any of which may appear in a scene identifier
    pub tiles: Vec<String>,
    pub index: IndexKind,
    pub mask: MaskRange,
    /// Geometry reference as entered
    pub geometry: String,
    pub bounds: Bounds,
    pub epsg: u32,
    pub folder: String,
    pub empty_tide_policy: EmptyTidePolicy,
}

impl PipelineConfig {
    pub fn catalog_query(&self) -> CatalogQuery {
        CatalogQuery {
            bounds: self.bounds,
            cloud_ceiling: self.cloud_ceiling,
            dates: self.dates,
        }
    }

    /// Fresh key ring: the operator's key, then the fallbacks in order.
    pub fn key_ring(&self) -> TideKeyRing {
        TideKeyRing::new(self.api_key.clone(), &self.fallback_keys)
    }
}

/// Receives progress updates from a run.
pub trait ProgressReporter: Send {
    /// Overall completion, 0 to 100.
    fn progress(&mut self, percent: f64);

    /// Called once per accepted scene.
    fn matched(&mut self, _found: &MatchedImage) {}
}

/// Reporter that ignores every update.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn progress(&mut self, _percent: f64) {}
}

/// Cooperative stop request, checked between scenes.
#[derive(Clone, Debug, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A scene accepted for export.
#[derive(Clone, Debug, PartialEq)]
pub struct MatchedImage {
    pub date: NaiveDate,
    pub image_id: String,
    /// Tile token that selected the scene
    pub tile: String,
    /// First low tide inside the window
    pub low_tide: TideExtreme,
    /// Whether the export sink accepted the job
    pub export_queued: bool,
}

/// Why a run stopped early.
#[derive(Debug)]
pub enum AbortReason {
    Catalog(CatalogError),
    TideService { image_id: String, error: TideError },
    EmptyTideDay { image_id: String, date: NaiveDate },
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AbortReason::Catalog(e) => write!(f, "catalog query failed: {}", e),
            AbortReason::TideService { image_id, error } => {
                write!(f, "tide lookup for '{}' failed: {}", image_id, error)
            }
            AbortReason::EmptyTideDay { image_id, date } => {
                write!(f, "no low tides predicted on {} for '{}'", date, image_id)
            }
        }
    }
}

/// Terminal state of a run.
#[derive(Debug)]
pub enum RunStatus {
    Completed,
    NoMatches,
    Aborted(AbortReason),
    Cancelled,
}

/// Outcome of a run.
#[derive(Debug)]
pub struct PipelineResult {
    pub matches: Vec<MatchedImage>,
    pub status: RunStatus,
    /// Scenes returned by the catalog
    pub scenes_found: usize,
    /// Scenes on a requested tile whose tides were looked up
    pub scenes_checked: usize,
    pub export_failures: usize,
}

impl PipelineResult {
    /// Accepted days, in processing order.
    pub fn matched_dates(&self) -> Vec<NaiveDate> {
        self.matches.iter().map(|m| m.date).collect()
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self.status, RunStatus::Aborted(_))
    }
}

/// Ties the catalog, the tide source and the exporter together.
pub struct Pipeline<C: ImageCatalog, T: TideSource, S: ExportSink> {
    catalog: C,
    tides: T,
    exporter: IndexExporter<S>,
}

impl<C: ImageCatalog, T: TideSource, S: ExportSink> Pipeline<C, T, S> {
    pub fn new(catalog: C, tides: T, exporter: IndexExporter<S>) -> Self {
        Self {
            catalog,
            tides,
            exporter,
        }
    }

    pub fn exporter(&self) -> &IndexExporter<S> {
        &self.exporter
    }

    /// Execute one selection pass.
    pub async fn run(
        &mut self,
        config: &PipelineConfig,
        progress: &mut dyn ProgressReporter,
        cancel: &CancellationFlag,
    ) -> PipelineResult {
        let mut result = PipelineResult {
            matches: Vec::new(),
            status: RunStatus::Completed,
            scenes_found: 0,
            scenes_checked: 0,
            export_failures: 0,
        };
        progress.progress(10.0);

        let candidates = match self.catalog.find_candidates(&config.catalog_query()).await {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!(error = %e, "catalog query failed");
                result.status = RunStatus::Aborted(AbortReason::Catalog(e));
                progress.progress(100.0);
                return result;
            }
        };
        result.scenes_found = candidates.len();
        info!(scenes = candidates.len(), tiles = ?config.tiles, "scanning catalog scenes");

        let step = if candidates.is_empty() {
            0.0
        } else {
            60.0 / candidates.len() as f64
        };
        progress.progress(40.0);

        for (i, candidate) in candidates.iter().enumerate() {
            if cancel.is_cancelled() {
                info!(processed = i, "run cancelled");
                result.status = RunStatus::Cancelled;
                break;
            }
            progress.progress(40.0 + step * (i + 1) as f64);

            let Some(tile) = candidate.first_matching_tile(&config.tiles) else {
                debug!(image = %candidate.id, "scene not on a requested tile");
                continue;
            };
            result.scenes_checked += 1;

            let day = candidate.acquisition_date();
            let lows = match self
                .tides
                .fetch_low_tides(day, config.latitude, config.longitude)
                .await
            {
                Ok(lows) => lows,
                Err(error) => {
                    warn!(image = %candidate.id, %error, "tide lookup failed, stopping run");
                    result.status = RunStatus::Aborted(AbortReason::TideService {
                        image_id: candidate.id.clone(),
                        error,
                    });
                    break;
                }
            };

            if lows.is_empty() {
                match config.empty_tide_policy {
                    EmptyTidePolicy::Abort => {
                        warn!(image = %candidate.id, %day, "no low tides predicted, stopping run");
                        result.status = RunStatus::Aborted(AbortReason::EmptyTideDay {
                            image_id: candidate.id.clone(),
                            date: day,
                        });
                        break;
                    }
                    EmptyTidePolicy::Skip => {
                        warn!(image = %candidate.id, %day, "no low tides predicted, skipping scene");
                        continue;
                    }
                }
            }

            let Some(low) = tide_window::matches(&lows, &config.window) else {
                debug!(image = %candidate.id, %day, "no low tide inside the window");
                continue;
            };
            info!(
                "For image '{}', the first low tide between {} on {} is at {}",
                candidate.id,
                config.window.describe(),
                day,
                low.clock_time()
            );

            let export_queued = self.exporter.export(candidate, day, &config.bounds).await;
            if !export_queued {
                result.export_failures += 1;
            }
            let found = MatchedImage {
                date: day,
                image_id: candidate.id.clone(),
                tile: tile.to_string(),
                low_tide: low.clone(),
                export_queued,
            };
            progress.matched(&found);
            result.matches.push(found);
        }

        if matches!(result.status, RunStatus::Completed) && result.matches.is_empty() {
            result.status = RunStatus::NoMatches;
        }
        progress.progress(100.0);
        result
    }
}

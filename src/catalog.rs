//! # Sentinel-2 Scene Catalog
//!
//! Finds candidate scenes through a STAC API (Earth Search by default) with
//! three filters: acquisition date range (both days inclusive), intersection
//! with the study-area bounds, and a cloud-cover ceiling that is strictly
//! exclusive (`eo:cloud_cover < ceiling`).
//!
//! Scenes are never downloaded here. Each [`ImageCandidate`] carries its
//! identifier, acquisition instant, grid tile and an [`ImageHandle`] with the
//! band hrefs and the clip region, which the export destination consumes.
//! The catalog is queried fresh on every run.

use crate::{Bounds, DateRange, ImageCandidate, ImageHandle};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Earth Search (Element 84) STAC API root.
pub const EARTH_SEARCH_URL: &str = "https://earth-search.aws.element84.com/v1";

/// Sentinel-2 surface reflectance collection on Earth Search.
pub const SENTINEL2_L2A: &str = "sentinel-2-l2a";

/// Errors raised while querying the catalog.
#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("network error: {0}")]
    Network(String),

    #[error("unreadable catalog response: {0}")]
    Decode(String),
}

/// Filters for one catalog search.
#[derive(Clone, Debug, PartialEq)]
pub struct CatalogQuery {
    pub bounds: Bounds,
    /// Maximum cloud cover in percent, exclusive
    pub cloud_ceiling: f64,
    pub dates: DateRange,
}

/// Source of candidate scenes for the orchestrator.
#[async_trait]
pub trait ImageCatalog: Send + Sync {
    /// All scenes passing the filters, oldest first.
    async fn find_candidates(&self, query: &CatalogQuery) -> Result<Vec<ImageCandidate>, CatalogError>;
}

// ---------------------------------------------------------------------------
// STAC wire types
// ---------------------------------------------------------------------------

/// Body for `POST /search`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StacSearchParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bbox: Option<Vec<f64>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub datetime: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub collections: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,

    /// Property filters (query extension)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<serde_json::Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub sortby: Option<Vec<StacSortBy>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StacSortBy {
    pub field: String,
    pub direction: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StacItemCollection {
    #[serde(default)]
    pub features: Vec<StacItem>,
    #[serde(default)]
    pub links: Vec<StacLink>,
}

impl StacItemCollection {
    pub fn next_link(&self) -> Option<&StacLink> {
        self.links.iter().find(|l| l.rel == "next")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StacItem {
    pub id: String,
    #[serde(default)]
    pub bbox: Option<Vec<f64>>,
    pub properties: StacItemProperties,
    #[serde(default)]
    pub assets: HashMap<String, StacAsset>,
    #[serde(default)]
    pub collection: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StacItemProperties {
    #[serde(default)]
    pub datetime: Option<String>,
    #[serde(rename = "eo:cloud_cover", default)]
    pub eo_cloud_cover: Option<f64>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StacAsset {
    pub href: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StacLink {
    pub rel: String,
    pub href: String,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub body: Option<serde_json::Value>,
    #[serde(default)]
    pub merge: Option<bool>,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Settings for [`StacCatalog`].
#[derive(Clone, Debug)]
pub struct StacCatalogOptions {
    /// API root, with or without a trailing `/search`
    pub endpoint: String,
    pub collection: String,
    pub page_size: u32,
    /// Upper bound on scenes collected across pages
    pub max_items: usize,
    pub request_timeout: Duration,
    /// Retries on transport errors and 5xx responses
    pub max_retries: u32,
}

impl Default for StacCatalogOptions {
    fn default() -> Self {
        Self {
            endpoint: EARTH_SEARCH_URL.to_string(),
            collection: SENTINEL2_L2A.to_string(),
            page_size: 100,
            max_items: 1000,
            request_timeout: Duration::from_secs(30),
            max_retries: 3,
        }
    }
}

/// STAC Item Search backed catalog.
pub struct StacCatalog {
    client: reqwest::Client,
    options: StacCatalogOptions,
}

impl StacCatalog {
    pub fn new(options: StacCatalogOptions) -> Result<Self, CatalogError> {
        let client = reqwest::Client::builder()
            .timeout(options.request_timeout)
            .build()?;
        Ok(Self { client, options })
    }

    pub fn search_url(&self) -> String {
        let base = self.options.endpoint.trim_end_matches('/');
        if base.ends_with("/search") {
            base.to_string()
        } else {
            format!("{}/search", base)
        }
    }

    /// Search body for a query.
    pub fn search_params(&self, query: &CatalogQuery) -> StacSearchParams {
        StacSearchParams {
            bbox: Some(query.bounds.to_bbox()),
            datetime: Some(query.dates.to_interval()),
            collections: Some(vec![self.options.collection.clone()]),
            limit: Some(self.options.page_size),
            query: Some(serde_json::json!({
                "eo:cloud_cover": { "lt": query.cloud_ceiling }
            })),
            sortby: Some(vec![StacSortBy {
                field: "properties.datetime".to_string(),
                direction: "asc".to_string(),
            }]),
            token: None,
        }
    }

    async fn post_search(
        &self,
        url: &str,
        params: &StacSearchParams,
    ) -> Result<StacItemCollection, CatalogError> {
        let mut last_err = None;

        for attempt in 0..=self.options.max_retries {
            if attempt > 0 {
                let delay = backoff_delay(attempt);
                debug!(attempt, ?delay, "retrying catalog search");
                tokio::time::sleep(delay).await;
            }

            match self.client.post(url).json(params).send().await {
                Ok(resp) if resp.status().is_success() => {
                    let body = resp.text().await?;
                    return serde_json::from_str(&body)
                        .map_err(|e| CatalogError::Decode(e.to_string()));
                }
                Ok(resp) => {
                    let status = resp.status();
                    let body = resp.text().await.unwrap_or_default();
                    last_err = Some(CatalogError::Network(format!(
                        "catalog search returned HTTP {}: {}",
                        status,
                        body.chars().take(500).collect::<String>()
                    )));
                    if status.is_client_error() {
                        break;
                    }
                }
                Err(e) => last_err = Some(CatalogError::Http(e)),
            }
        }

        Err(last_err.unwrap_or_else(|| CatalogError::Network("catalog search failed".into())))
    }

    async fn follow_next(
        &self,
        link: &StacLink,
        original: &StacSearchParams,
    ) -> Result<StacItemCollection, CatalogError> {
        let method = link.method.as_deref().unwrap_or("GET").to_uppercase();
        if method == "POST" {
            let params = next_page_params(link, original)?;
            return self.post_search(&link.href, &params).await;
        }

        let resp = self.client.get(&link.href).send().await?;
        if !resp.status().is_success() {
            return Err(CatalogError::Network(format!(
                "catalog pagination returned HTTP {}",
                resp.status()
            )));
        }
        let body = resp.text().await?;
        serde_json::from_str(&body).map_err(|e| CatalogError::Decode(e.to_string()))
    }
}

#[async_trait]
impl ImageCatalog for StacCatalog {
    async fn find_candidates(&self, query: &CatalogQuery) -> Result<Vec<ImageCandidate>, CatalogError> {
        let params = self.search_params(query);
        let mut items: Vec<StacItem> = Vec::new();
        let mut page = self.post_search(&self.search_url(), &params).await?;

        loop {
            let next = page.next_link().cloned();
            let empty = page.features.is_empty();
            items.append(&mut page.features);

            if items.len() >= self.options.max_items || empty {
                break;
            }
            match next {
                Some(link) => page = self.follow_next(&link, &params).await?,
                None => break,
            }
        }
        items.truncate(self.options.max_items);

        let candidates = collect_candidates(items, query);
        info!(
            scenes = candidates.len(),
            collection = %self.options.collection,
            "catalog query complete"
        );
        Ok(candidates)
    }
}

/// Longest wait between two search attempts.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// 500 ms doubled per retry, capped at [`MAX_BACKOFF`].
fn backoff_delay(attempt: u32) -> Duration {
    let factor = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
    Duration::from_millis(500u64.saturating_mul(factor)).min(MAX_BACKOFF)
}

/// Request body for a POST `next` link, honouring `merge`.
fn next_page_params(
    link: &StacLink,
    original: &StacSearchParams,
) -> Result<StacSearchParams, CatalogError> {
    let encode = |e: serde_json::Error| CatalogError::Decode(e.to_string());
    let body = match (&link.body, link.merge.unwrap_or(false)) {
        (Some(link_body), true) => {
            let mut base = serde_json::to_value(original).map_err(encode)?;
            if let (Some(base_obj), Some(link_obj)) = (base.as_object_mut(), link_body.as_object()) {
                for (k, v) in link_obj {
                    base_obj.insert(k.clone(), v.clone());
                }
            }
            base
        }
        (Some(link_body), false) => link_body.clone(),
        (None, _) => serde_json::to_value(original).map_err(encode)?,
    };
    serde_json::from_value(body).map_err(encode)
}

/// Convert, re-filter, de-duplicate and order search results.
pub fn collect_candidates(items: Vec<StacItem>, query: &CatalogQuery) -> Vec<ImageCandidate> {
    let mut seen = HashSet::new();
    let mut candidates: Vec<ImageCandidate> = items
        .into_iter()
        .filter_map(|item| to_candidate(item, query))
        .filter(|c| seen.insert(c.id.clone()))
        .collect();
    candidates.sort_by(|a, b| a.acquired.cmp(&b.acquired).then_with(|| a.id.cmp(&b.id)));
    candidates
}

fn to_candidate(item: StacItem, query: &CatalogQuery) -> Option<ImageCandidate> {
    let Some(acquired) = item
        .properties
        .datetime
        .as_deref()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
    else {
        warn!(id = %item.id, "scene without a readable datetime, skipping");
        return None;
    };

    if !query.dates.contains(acquired.date_naive()) {
        return None;
    }
    // Catalog-side filters are advisory on some servers; enforce the ceiling here.
    if let Some(cover) = item.properties.eo_cloud_cover {
        if cover >= query.cloud_ceiling {
            return None;
        }
    }
    if let Some(bbox) = item.bbox.as_deref() {
        if let [w, s, e, n] = *bbox {
            if !Bounds::new(w, s, e, n).intersects(&query.bounds) {
                return None;
            }
        }
    }

    let tile_code = tile_code(&item.properties.extra);
    let bands = band_hrefs(&item.assets);
    Some(ImageCandidate {
        id: item.id,
        acquired,
        cloud_cover: item.properties.eo_cloud_cover,
        tile_code,
        handle: ImageHandle {
            collection: item.collection,
            bands,
            clip: query.bounds,
        },
    })
}

/// MGRS tile as `T` + zone + latitude band + grid square, e.g. `T29UPV`.
fn tile_code(props: &HashMap<String, serde_json::Value>) -> Option<String> {
    if let Some(tile) = props.get("s2:mgrs_tile").and_then(|v| v.as_str()) {
        let tile = tile.trim_start_matches('T');
        return Some(format!("T{}", tile));
    }
    let zone = props.get("mgrs:utm_zone").and_then(|v| v.as_u64())?;
    let band = props.get("mgrs:latitude_band").and_then(|v| v.as_str())?;
    let square = props.get("mgrs:grid_square").and_then(|v| v.as_str())?;
    Some(format!("T{:02}{}{}", zone, band, square))
}

/// Map catalog asset keys onto Sentinel-2 band names.
fn band_hrefs(assets: &HashMap<String, StacAsset>) -> BTreeMap<String, String> {
    const ALIASES: &[(&str, &str)] = &[
        ("blue", "B02"),
        ("green", "B03"),
        ("red", "B04"),
        ("rededge1", "B05"),
        ("nir", "B08"),
        ("swir16", "B11"),
    ];
    let mut bands = BTreeMap::new();
    for (key, asset) in assets {
        let upper = key.to_uppercase();
        if upper.len() == 3 && upper.starts_with('B') {
            bands.insert(upper, asset.href.clone());
        } else if let Some((_, band)) = ALIASES.iter().find(|(alias, _)| *alias == key.as_str()) {
            bands.entry(band.to_string()).or_insert_with(|| asset.href.clone());
        }
    }
    bands
}

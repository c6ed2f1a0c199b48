//! # WorldTides Low-Tide Lookup
//!
//! This module fetches the predicted tide extremes for one calendar day at one
//! location from the WorldTides v3 API and hands back the low waters.
//!
//! ## Request
//! ```text
//! GET https://www.worldtides.info/api/v3?extremes&date=2021-06-15&lat=53.35&lon=-6.16&days=1&key=<key>
//! ```
//!
//! ## Response
//! ```json
//! {"status": 200, "extremes": [{"dt": 1623756180, "date": "2021-06-15T11:23+0000", "height": -1.41, "type": "Low"}]}
//! {"status": 400, "error": "Not enough credits"}
//! ```
//!
//! ## Key Fallback
//! WorldTides is credit-metered. The client holds an ordered [`TideKeyRing`]:
//! the caller's key first, then the configured fallback keys. When the service
//! answers `"Not enough credits"` the head key is dropped for the rest of the
//! run and the request is repeated with the next one, so a lookup makes at most
//! `fallbacks + 1` attempts. `"API key is invalid"` fails at once without
//! touching the fallbacks.
//!
//! ## Error Handling
//! Credit exhaustion and invalid keys are terminal for the whole run and are
//! reported through [`TideError`]; transport failures surface as
//! [`TideError::Http`].

use crate::{TideExtreme, TideKind};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Public WorldTides v3 endpoint.
pub const WORLDTIDES_ENDPOINT: &str = "https://www.worldtides.info/api/v3";

const ERR_NO_CREDITS: &str = "Not enough credits";
const ERR_INVALID_KEY: &str = "API key is invalid";

/// Errors that can occur while looking up tide extremes.
#[derive(Error, Debug)]
pub enum TideError {
    /// Every key in the ring reported `"Not enough credits"`
    #[error(
        "all provided WorldTides API keys have run out of credits; \
         top up the account or enter a new API key"
    )]
    CreditsExhausted,

    /// The service rejected the key outright
    #[error("the WorldTides API key is invalid; enter a valid API key and try again")]
    InvalidKey,

    /// Any other `error` string from the service
    #[error("tide service error: {0}")]
    Service(String),

    /// HTTP request failed (network, TLS, or protocol error)
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Body was not the expected JSON shape
    #[error("unreadable tide response: {0}")]
    Decode(String),

    #[error("no WorldTides API key configured")]
    NoKeys,
}

/// Response body of the extremes endpoint.
#[derive(Debug, Default, Deserialize)]
pub struct ExtremesResponse {
    #[serde(default)]
    pub status: Option<u16>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub extremes: Option<Vec<RawExtreme>>,
}

/// One entry of the `extremes` array, before conversion.
#[derive(Debug, Deserialize)]
pub struct RawExtreme {
    /// Unix seconds
    #[serde(default)]
    pub dt: Option<i64>,
    /// ISO 8601, e.g. `2021-06-15T11:23+0000`
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub height: Option<f64>,
    #[serde(rename = "type")]
    pub kind: String,
}

/// Ordered credential list; the head is the key in use.
#[derive(Clone, Debug)]
pub struct TideKeyRing {
    keys: VecDeque<String>,
}

impl TideKeyRing {
    pub fn new(primary: impl Into<String>, fallbacks: &[String]) -> Self {
        let mut keys = VecDeque::with_capacity(fallbacks.len() + 1);
        keys.push_back(primary.into());
        keys.extend(fallbacks.iter().filter(|k| !k.is_empty()).cloned());
        keys.retain(|k| !k.is_empty());
        Self { keys }
    }

    pub fn current(&self) -> Option<&str> {
        self.keys.front().map(String::as_str)
    }

    /// Drop the head key if another one remains behind it.
    pub fn advance(&mut self) -> bool {
        if self.keys.len() > 1 {
            self.keys.pop_front();
            true
        } else {
            false
        }
    }

    pub fn remaining(&self) -> usize {
        self.keys.len()
    }
}

/// Build the extremes URL for one day and location.
pub fn extremes_url(endpoint: &str, date: NaiveDate, lat: f64, lon: f64, key: &str) -> String {
    format!(
        "{}?extremes&date={}&lat={}&lon={}&days=1&key={}",
        endpoint.trim_end_matches('/'),
        date.format("%Y-%m-%d"),
        lat,
        lon,
        key
    )
}

/// Last four characters of a key, for logs.
fn key_hint(key: &str) -> &str {
    let start = key
        .char_indices()
        .rev()
        .nth(3)
        .map(|(i, _)| i)
        .unwrap_or(0);
    &key[start..]
}

/// Performs a single GET against the tide service.
#[async_trait]
pub trait TideTransport: Send + Sync {
    async fn get(&self, url: &str) -> Result<ExtremesResponse, TideError>;
}

/// reqwest-backed transport.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self, TideError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl TideTransport for HttpTransport {
    async fn get(&self, url: &str) -> Result<ExtremesResponse, TideError> {
        // Error payloads come with 4xx statuses, so the body is read regardless.
        let body = self.client.get(url).send().await?.text().await?;
        serde_json::from_str(&body).map_err(|e| TideError::Decode(e.to_string()))
    }
}

/// Source of low-tide extremes for the orchestrator.
#[async_trait]
pub trait TideSource: Send {
    /// Low waters predicted for `date` at (`lat`, `lon`), in service order.
    async fn fetch_low_tides(
        &mut self,
        date: NaiveDate,
        lat: f64,
        lon: f64,
    ) -> Result<Vec<TideExtreme>, TideError>;
}

/// WorldTides client with key fallback and optional per-day memoization.
pub struct TidePredictionClient<T: TideTransport> {
    transport: T,
    endpoint: String,
    keys: TideKeyRing,
    cache: Option<HashMap<(NaiveDate, i64, i64), Vec<TideExtreme>>>,
}

impl<T: TideTransport> TidePredictionClient<T> {
    pub fn new(transport: T, endpoint: impl Into<String>, keys: TideKeyRing) -> Self {
        Self {
            transport,
            endpoint: endpoint.into(),
            keys,
            cache: None,
        }
    }

    /// Reuse one lookup for every scene of the same day.
    pub fn with_date_dedupe(mut self, enabled: bool) -> Self {
        self.cache = enabled.then(HashMap::new);
        self
    }

    pub fn keys(&self) -> &TideKeyRing {
        &self.keys
    }

    async fn request(
        &mut self,
        date: NaiveDate,
        lat: f64,
        lon: f64,
    ) -> Result<Vec<TideExtreme>, TideError> {
        loop {
            let key = self.keys.current().ok_or(TideError::NoKeys)?;
            let hint = key_hint(key).to_string();
            let url = extremes_url(&self.endpoint, date, lat, lon, key);
            debug!(%date, key = %hint, "requesting tide extremes");

            let response = self.transport.get(&url).await?;
            match response.error.as_deref() {
                None => return Ok(low_extremes(response, date)),
                Some(ERR_NO_CREDITS) => {
                    if !self.keys.advance() {
                        return Err(TideError::CreditsExhausted);
                    }
                    warn!(key = %hint, remaining = self.keys.remaining(), "tide key out of credits, switching to fallback key");
                }
                Some(ERR_INVALID_KEY) => return Err(TideError::InvalidKey),
                Some(other) => return Err(TideError::Service(other.to_string())),
            }
        }
    }
}

#[async_trait]
impl<T: TideTransport> TideSource for TidePredictionClient<T> {
    async fn fetch_low_tides(
        &mut self,
        date: NaiveDate,
        lat: f64,
        lon: f64,
    ) -> Result<Vec<TideExtreme>, TideError> {
        let cache_key = (date, (lat * 1e6).round() as i64, (lon * 1e6).round() as i64);
        if let Some(hit) = self.cache.as_ref().and_then(|c| c.get(&cache_key)) {
            debug!(%date, "tide extremes served from run cache");
            return Ok(hit.clone());
        }

        let lows = self.request(date, lat, lon).await?;

        if let Some(cache) = self.cache.as_mut() {
            cache.insert(cache_key, lows.clone());
        }
        Ok(lows)
    }
}

/// Convert a successful response to the low waters it lists.
///
/// A body without an `extremes` array is treated as an empty day. Entries
/// whose timestamp cannot be read are skipped.
fn low_extremes(response: ExtremesResponse, date: NaiveDate) -> Vec<TideExtreme> {
    response
        .extremes
        .unwrap_or_default()
        .into_iter()
        .filter(|raw| raw.kind.eq_ignore_ascii_case("low"))
        .filter_map(|raw| {
            let at = raw
                .date
                .as_deref()
                .and_then(parse_timestamp)
                .or_else(|| raw.dt.and_then(|dt| DateTime::from_timestamp(dt, 0)));
            if at.is_none() {
                warn!(?raw, "skipping tide extreme without a readable timestamp");
            }
            Some(TideExtreme {
                kind: TideKind::Low,
                at: at?,
                source_date: date,
                height_m: raw.height,
            })
        })
        .collect()
}

/// Parse the service's ISO 8601 variants into UTC.
fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M%z", "%Y-%m-%dT%H:%M:%S%z"]
        .iter()
        .find_map(|fmt| DateTime::parse_from_str(s, fmt).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;
    use std::sync::{Arc, Mutex};

    /// Replays canned JSON bodies and records every requested URL.
    struct ScriptedTransport {
        bodies: Mutex<VecDeque<&'static str>>,
        urls: Arc<Mutex<Vec<String>>>,
    }

    impl ScriptedTransport {
        fn new(bodies: &[&'static str]) -> (Self, Arc<Mutex<Vec<String>>>) {
            let urls = Arc::new(Mutex::new(Vec::new()));
            let transport = Self {
                bodies: Mutex::new(bodies.iter().copied().collect()),
                urls: Arc::clone(&urls),
            };
            (transport, urls)
        }
    }

    #[async_trait]
    impl TideTransport for ScriptedTransport {
        async fn get(&self, url: &str) -> Result<ExtremesResponse, TideError> {
            self.urls.lock().unwrap().push(url.to_string());
            let body = self
                .bodies
                .lock()
                .unwrap()
                .pop_front()
                .expect("unexpected extra request");
            serde_json::from_str(body).map_err(|e| TideError::Decode(e.to_string()))
        }
    }

    const NO_CREDITS: &str = r#"{"status": 400, "error": "Not enough credits"}"#;
    const INVALID_KEY: &str = r#"{"status": 400, "error": "API key is invalid"}"#;
    const DAY: &str = r#"{
        "status": 200,
        "extremes": [
            {"dt": 1623733620, "date": "2021-06-15T05:07+0000", "height": 1.62, "type": "High"},
            {"dt": 1623756180, "date": "2021-06-15T11:23+0000", "height": -1.41, "type": "Low"},
            {"dt": 1623778800, "date": "2021-06-15T17:40+0000", "height": 1.55, "type": "High"},
            {"dt": 1623801000, "date": "2021-06-15T23:50+0000", "height": -1.30, "type": "Low"}
        ]
    }"#;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2021, 6, 15).unwrap()
    }

    fn ring() -> TideKeyRing {
        TideKeyRing::new("user-key", &["fallback-a".to_string(), "fallback-b".to_string()])
    }

    fn key_of(url: &str) -> &str {
        url.rsplit("key=").next().unwrap()
    }

    #[test]
    fn test_url_layout() {
        let url = extremes_url("https://www.worldtides.info/api/v3/", day(), 53.35293, -6.16435, "k");
        assert_eq!(
            url,
            "https://www.worldtides.info/api/v3?extremes&date=2021-06-15&lat=53.35293&lon=-6.16435&days=1&key=k"
        );
    }

    #[test]
    fn test_key_ring_keeps_order_and_skips_blanks() {
        let mut keys = TideKeyRing::new("a", &["".to_string(), "b".to_string()]);
        assert_eq!(keys.remaining(), 2);
        assert_eq!(keys.current(), Some("a"));
        assert!(keys.advance());
        assert_eq!(keys.current(), Some("b"));
        assert!(!keys.advance());
        assert_eq!(keys.current(), Some("b"));
    }

    #[test]
    fn test_key_hint_is_short() {
        assert_eq!(key_hint("eacc6042-df40"), "df40");
        assert_eq!(key_hint("ab"), "ab");
    }

    #[test]
    fn test_parse_timestamp_variants() {
        let a = parse_timestamp("2021-06-15T11:23+0000").unwrap();
        assert_eq!((a.hour(), a.minute()), (11, 23));
        let b = parse_timestamp("2021-06-15T11:23:00+00:00").unwrap();
        assert_eq!(a, b);
        let c = parse_timestamp("2021-06-15T12:23+0100").unwrap();
        assert_eq!(a, c);
        assert!(parse_timestamp("15/06/2021").is_none());
    }

    #[tokio::test]
    async fn test_success_returns_only_lows() {
        let (transport, urls) = ScriptedTransport::new(&[DAY]);
        let mut client = TidePredictionClient::new(transport, WORLDTIDES_ENDPOINT, ring());

        let lows = client.fetch_low_tides(day(), 53.35, -6.16).await.unwrap();

        assert_eq!(lows.len(), 2);
        assert!(lows.iter().all(TideExtreme::is_low));
        assert_eq!(lows[0].clock_time(), "11:23");
        assert_eq!(lows[0].source_date, day());
        assert_eq!(lows[0].height_m, Some(-1.41));
        assert_eq!(urls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_credit_exhaustion_walks_fallbacks_then_fails() {
        let (transport, urls) = ScriptedTransport::new(&[NO_CREDITS, NO_CREDITS, NO_CREDITS]);
        let mut client = TidePredictionClient::new(transport, WORLDTIDES_ENDPOINT, ring());

        let err = client.fetch_low_tides(day(), 53.35, -6.16).await.unwrap_err();

        assert!(matches!(err, TideError::CreditsExhausted));
        let urls = urls.lock().unwrap();
        let keys: Vec<&str> = urls.iter().map(|u| key_of(u)).collect();
        assert_eq!(keys, vec!["user-key", "fallback-a", "fallback-b"]);
    }

    #[tokio::test]
    async fn test_fallback_key_recovers_and_sticks() {
        let (transport, urls) = ScriptedTransport::new(&[NO_CREDITS, DAY, DAY]);
        let mut client = TidePredictionClient::new(transport, WORLDTIDES_ENDPOINT, ring());

        let lows = client.fetch_low_tides(day(), 53.35, -6.16).await.unwrap();
        assert_eq!(lows.len(), 2);

        // The exhausted key is not reused later in the run.
        let next = day().succ_opt().unwrap();
        client.fetch_low_tides(next, 53.35, -6.16).await.unwrap();

        let urls = urls.lock().unwrap();
        let keys: Vec<&str> = urls.iter().map(|u| key_of(u)).collect();
        assert_eq!(keys, vec!["user-key", "fallback-a", "fallback-a"]);
        assert_eq!(client.keys().remaining(), 2);
    }

    #[tokio::test]
    async fn test_invalid_key_fails_without_fallback() {
        let (transport, urls) = ScriptedTransport::new(&[INVALID_KEY]);
        let mut client = TidePredictionClient::new(transport, WORLDTIDES_ENDPOINT, ring());

        let err = client.fetch_low_tides(day(), 53.35, -6.16).await.unwrap_err();

        assert!(matches!(err, TideError::InvalidKey));
        assert_eq!(urls.lock().unwrap().len(), 1);
        assert_eq!(client.keys().remaining(), 3);
    }

    #[tokio::test]
    async fn test_unknown_service_error_is_reported() {
        let (transport, _) = ScriptedTransport::new(&[r#"{"status": 400, "error": "Invalid date"}"#]);
        let mut client = TidePredictionClient::new(transport, WORLDTIDES_ENDPOINT, ring());

        let err = client.fetch_low_tides(day(), 53.35, -6.16).await.unwrap_err();
        assert!(matches!(err, TideError::Service(ref msg) if msg == "Invalid date"));
    }

    #[tokio::test]
    async fn test_missing_extremes_is_an_empty_day() {
        let (transport, _) = ScriptedTransport::new(&[r#"{"status": 200}"#]);
        let mut client = TidePredictionClient::new(transport, WORLDTIDES_ENDPOINT, ring());

        let lows = client.fetch_low_tides(day(), 53.35, -6.16).await.unwrap();
        assert!(lows.is_empty());
    }

    #[tokio::test]
    async fn test_date_dedupe_skips_repeat_requests() {
        let (transport, urls) = ScriptedTransport::new(&[DAY]);
        let mut client =
            TidePredictionClient::new(transport, WORLDTIDES_ENDPOINT, ring()).with_date_dedupe(true);

        let first = client.fetch_low_tides(day(), 53.35, -6.16).await.unwrap();
        let second = client.fetch_low_tides(day(), 53.35, -6.16).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(urls.lock().unwrap().len(), 1);
    }
}

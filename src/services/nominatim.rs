use super::{BoundaryService, Candidate, GeocodeQuery, GeocodingService, Limits, RateLimiter};
use crate::constants::{
    env_or_default, BOUNDARY_URL_ENV, DEFAULT_BACKOFF_MS, DEFAULT_BOUNDARY_URL,
    DEFAULT_COUNTRY_CODE, DEFAULT_GEOCODER_URL, DEFAULT_MAX_RETRIES, DEFAULT_MIN_DELAY_MS,
    DEFAULT_RESULT_LIMIT, DEFAULT_TIMEOUT_SECS, DEFAULT_USER_AGENT, GEOCODER_URL_ENV,
    USER_AGENT_ENV,
};
use crate::error::{GeoflowError, Result};
use crate::pipeline::CancelToken;
use crate::storage::polygon_from_geojson;
use geo::Polygon;
use metrics::{counter, histogram};
use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value as Json;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};

/// Endpoints and HTTP policy for the lookup services
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub geocoder_url: String,
    pub boundary_url: String,
    pub user_agent: String,
    pub country_code: String,
    pub limit: u32,
    pub timeout: Duration,
    pub max_retries: u32,
    pub backoff: Duration,
    pub min_delay: Duration,
    /// Optional cap on top of the minimum delay
    pub requests_per_min: Option<u64>,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            geocoder_url: env_or_default(GEOCODER_URL_ENV, DEFAULT_GEOCODER_URL),
            boundary_url: env_or_default(BOUNDARY_URL_ENV, DEFAULT_BOUNDARY_URL),
            user_agent: env_or_default(USER_AGENT_ENV, DEFAULT_USER_AGENT),
            country_code: DEFAULT_COUNTRY_CODE.to_string(),
            limit: DEFAULT_RESULT_LIMIT,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            max_retries: DEFAULT_MAX_RETRIES,
            backoff: Duration::from_millis(DEFAULT_BACKOFF_MS),
            min_delay: Duration::from_millis(DEFAULT_MIN_DELAY_MS),
            requests_per_min: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    lat: CoordField,
    lon: CoordField,
    #[serde(default)]
    osm_id: Option<i64>,
    #[serde(default)]
    display_name: Option<String>,
}

// Nominatim returns coordinates as strings; accept numbers too
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CoordField {
    Text(String),
    Number(f64),
}

impl CoordField {
    fn value(&self) -> Option<f64> {
        match self {
            CoordField::Text(s) => s.trim().parse().ok(),
            CoordField::Number(n) => Some(*n),
        }
    }
}

/// Parse a Nominatim `format=json` search response.
pub fn parse_search_response(body: &str) -> Result<Vec<Candidate>> {
    let hits: Vec<SearchHit> = serde_json::from_str(body)
        .map_err(|e| GeoflowError::Service(format!("malformed geocoder response: {}", e)))?;
    Ok(hits
        .into_iter()
        .filter_map(|hit| {
            Some(Candidate {
                lon: hit.lon.value()?,
                lat: hit.lat.value()?,
                osm_id: hit.osm_id,
                display_name: hit.display_name,
            })
        })
        .collect())
}

/// Parse a boundary service body; empty bodies and `None` mean no boundary.
pub fn parse_boundary_response(body: &str) -> Result<Option<Polygon<f64>>> {
    let trimmed = body.trim();
    if trimmed.is_empty() || trimmed == "None" || trimmed == "null" {
        return Ok(None);
    }
    let json: Json = serde_json::from_str(trimmed)
        .map_err(|e| GeoflowError::Service(format!("malformed boundary response: {}", e)))?;
    Ok(polygon_from_geojson(&json))
}

enum Failure {
    Transient(String),
    Fatal(String),
}

/// Blocking client for Nominatim search plus the OSM polygons service
pub struct NominatimClient {
    client: Client,
    settings: ServiceSettings,
    limiter: RateLimiter,
    cancel: CancelToken,
}

// backoff sleeps wake this often to notice a cancelled run
const CANCEL_POLL: Duration = Duration::from_millis(50);

impl NominatimClient {
    pub fn new(settings: ServiceSettings) -> Result<Self> {
        let client = Client::builder()
            .timeout(settings.timeout)
            .user_agent(settings.user_agent.clone())
            .gzip(true)
            .build()?;
        let limiter = RateLimiter::new(Limits {
            min_interval: settings.min_delay,
            requests_per_min: settings.requests_per_min,
        });
        Ok(Self {
            client,
            settings,
            limiter,
            cancel: CancelToken::new(),
        })
    }

    /// Stop retrying as soon as the given run is cancelled.
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn backoff(&self, delay: Duration) -> Result<()> {
        let deadline = Instant::now() + delay;
        loop {
            self.cancel.check()?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            thread::sleep((deadline - now).min(CANCEL_POLL));
        }
    }

    fn attempt(&self, url: &str, params: &[(String, String)]) -> std::result::Result<String, Failure> {
        self.limiter.acquire();
        let started = Instant::now();
        let response = self.client.get(url).query(params).send();
        histogram!("geoflow_lookup_request_duration_seconds").record(started.elapsed().as_secs_f64());

        let response = match response {
            Ok(r) => r,
            Err(e) if e.is_timeout() || e.is_connect() || e.is_request() => {
                return Err(Failure::Transient(e.to_string()))
            }
            Err(e) => return Err(Failure::Fatal(e.to_string())),
        };

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(Failure::Transient(format!("HTTP {}", status)));
        }
        if !status.is_success() {
            return Err(Failure::Fatal(format!("HTTP {}", status)));
        }
        response.text().map_err(|e| Failure::Transient(e.to_string()))
    }

    /// GET with bounded retries and exponential backoff on transient failures.
    fn get_text(&self, url: &str, params: &[(String, String)]) -> Result<String> {
        let mut delay = self.settings.backoff;
        let mut last = String::new();
        for attempt in 0..=self.settings.max_retries {
            self.cancel.check()?;
            match self.attempt(url, params) {
                Ok(body) => {
                    counter!("geoflow_lookup_requests_total", "outcome" => "ok").increment(1);
                    return Ok(body);
                }
                Err(Failure::Fatal(msg)) => {
                    counter!("geoflow_lookup_requests_total", "outcome" => "error").increment(1);
                    return Err(GeoflowError::Service(format!("{}: {}", url, msg)));
                }
                Err(Failure::Transient(msg)) => {
                    counter!("geoflow_lookup_requests_total", "outcome" => "retry").increment(1);
                    warn!(url, attempt, error = %msg, "transient lookup failure");
                    last = msg;
                    if attempt < self.settings.max_retries {
                        self.backoff(delay)?;
                        delay *= 2;
                    }
                }
            }
        }
        Err(GeoflowError::Service(format!(
            "{}: gave up after {} attempts: {}",
            url,
            self.settings.max_retries + 1,
            last
        )))
    }
}

impl GeocodingService for NominatimClient {
    #[instrument(skip(self))]
    fn search(&self, query: &GeocodeQuery) -> Result<Vec<Candidate>> {
        let mut params = query.params();
        params.push(("format".to_string(), "json".to_string()));
        params.push(("countrycodes".to_string(), self.settings.country_code.clone()));
        params.push(("limit".to_string(), self.settings.limit.to_string()));
        let body = self.get_text(&self.settings.geocoder_url, &params)?;
        let candidates = parse_search_response(&body)?;
        debug!(count = candidates.len(), "geocoder candidates");
        Ok(candidates)
    }
}

impl BoundaryService for NominatimClient {
    #[instrument(skip(self))]
    fn boundary(&self, osm_id: i64) -> Result<Option<Polygon<f64>>> {
        let params = vec![
            ("id".to_string(), osm_id.to_string()),
            ("params".to_string(), "0".to_string()),
        ];
        let body = self.get_text(&self.settings.boundary_url, &params)?;
        parse_boundary_response(&body)
    }
}

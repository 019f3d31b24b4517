/// Service endpoints and defaults shared across the codebase

// Public OpenStreetMap endpoints (overridable through the environment)
pub const DEFAULT_GEOCODER_URL: &str = "https://nominatim.openstreetmap.org/search";
pub const DEFAULT_BOUNDARY_URL: &str = "http://polygons.openstreetmap.fr/get_geojson.py";
pub const DEFAULT_USER_AGENT: &str = concat!("geoflow/", env!("CARGO_PKG_VERSION"));

pub const GEOCODER_URL_ENV: &str = "GEOFLOW_GEOCODER_URL";
pub const BOUNDARY_URL_ENV: &str = "GEOFLOW_BOUNDARY_URL";
pub const USER_AGENT_ENV: &str = "GEOFLOW_USER_AGENT";

pub const DEFAULT_COUNTRY_CODE: &str = "US";
pub const DEFAULT_RESULT_LIMIT: u32 = 1;

// Nominatim's usage policy asks for at most one request per second
pub const DEFAULT_MIN_DELAY_MS: u64 = 1000;
pub const DEFAULT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_BACKOFF_MS: u64 = 500;

pub const DEFAULT_CRS: &str = "EPSG:4326";
pub const DEFAULT_FLAG_VALUE: &str = "Yes";

// Width used for text columns whose inferred values are all null
pub const DEFAULT_TEXT_WIDTH: u32 = 254;

/// File extensions picked up when a whole directory is ingested
pub const INPUT_EXTENSIONS: &[&str] = &["txt", "csv"];

/// Read an endpoint from the environment, falling back to the compiled default
pub fn env_or_default(var: &str, default: &str) -> String {
    match std::env::var(var) {
        Ok(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => default.to_string(),
    }
}

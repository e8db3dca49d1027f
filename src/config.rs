use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use std::{env, io};

use secrecy::SecretString;
use serde::Serialize;
use tracing::debug;

use crate::providers::{google, nominatim, opencage, ProviderId};

const DEFAULT_PROVIDER_PRIORITY: &str = "nominatim,opencage,google";
const DEFAULT_CACHE_TTL_SECS: u64 = 30 * 24 * 60 * 60;
const DEFAULT_JOURNAL_BUFFER_MAX_BYTES: u64 = 5 * 1024 * 1024;
const DEFAULT_JOURNAL_BUFFER_MAX_FILES: usize = 5;
const DEFAULT_NOMINATIM_ENDPOINT: &str = "https://nominatim.openstreetmap.org";
const DEFAULT_OPENCAGE_ENDPOINT: &str = "https://api.opencagedata.com/geocode/v1/json";
const DEFAULT_GOOGLE_ENDPOINT: &str = "https://maps.googleapis.com/maps/api/geocode/json";

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub provider_priority: Vec<ProviderId>,
    pub provider_rate_limits: HashMap<ProviderId, u32>,
    pub confidence_threshold: f64,
    pub cache_ttl_secs: u64,
    pub failure_cache_ttl_secs: u64,
    pub cache_capacity: usize,
    pub retry_backoff_ms: u64,
    pub worker_concurrency: usize,
    pub provider_timeout_ms: u64,
    pub rate_limit_cooldown_ms: u64,
    pub country_code: Option<String>,
    pub nominatim_endpoint: String,
    pub nominatim_user_agent: String,
    pub opencage_endpoint: String,
    pub opencage_api_key: Option<SecretString>,
    pub google_geocoding_endpoint: String,
    pub google_geocoding_api_key: Option<SecretString>,
    pub normalizer_rules_path: Option<PathBuf>,
    pub data_dir: PathBuf,
    pub database_file_name: String,
    pub journal_enabled: bool,
    pub journal_batch_size: usize,
    pub journal_buffer_max_bytes: u64,
    pub journal_buffer_max_files: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct PublicAppConfig {
    pub provider_priority: Vec<ProviderId>,
    pub provider_rate_limits: HashMap<ProviderId, u32>,
    pub confidence_threshold: f64,
    pub cache_ttl_secs: u64,
    pub failure_cache_ttl_secs: u64,
    pub cache_capacity: usize,
    pub retry_backoff_ms: u64,
    pub worker_concurrency: usize,
    pub provider_timeout_ms: u64,
    pub rate_limit_cooldown_ms: u64,
    pub country_code: Option<String>,
    pub nominatim_endpoint: String,
    pub opencage_endpoint: String,
    pub google_geocoding_endpoint: String,
    pub data_dir: PathBuf,
    pub database_file_name: String,
    pub journal_enabled: bool,
    pub has_opencage_key: bool,
    pub has_google_geocoding_key: bool,
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from any key lookup. Absent or unparsable
    /// values fall back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(lookup);
        let provider_priority = vars
            .string("PROVIDER_PRIORITY")
            .unwrap_or_else(|| DEFAULT_PROVIDER_PRIORITY.to_string())
            .split(',')
            .filter(|name| !name.trim().is_empty())
            .map(ProviderId::new)
            .collect::<Vec<_>>();

        let provider_rate_limits = provider_priority
            .iter()
            .map(|id| {
                let key = format!("{}_RATE_LIMIT_QPS", id.as_str().to_ascii_uppercase());
                let qps = vars.parse_u32(&key, default_rate_limit(id)).max(1);
                (id.clone(), qps)
            })
            .collect();

        Self {
            provider_priority,
            provider_rate_limits,
            confidence_threshold: vars
                .parse_f64("CONFIDENCE_THRESHOLD", 0.8)
                .clamp(0.0, 1.0),
            cache_ttl_secs: vars.parse_u64("CACHE_TTL_SECS", DEFAULT_CACHE_TTL_SECS),
            failure_cache_ttl_secs: vars.parse_u64("FAILURE_CACHE_TTL_SECS", 300),
            cache_capacity: vars.parse_usize("CACHE_CAPACITY", 10_000),
            retry_backoff_ms: vars.parse_u64("RETRY_BACKOFF_MS", 500),
            worker_concurrency: vars.parse_usize("WORKER_CONCURRENCY", 4).max(1),
            provider_timeout_ms: vars.parse_u64("PROVIDER_TIMEOUT_MS", 10_000).max(1),
            rate_limit_cooldown_ms: vars.parse_u64("RATE_LIMIT_COOLDOWN_MS", 30_000),
            country_code: match vars.string("GEOCODE_COUNTRY_CODE") {
                Some(code) if code.eq_ignore_ascii_case("none") => None,
                Some(code) => Some(code.to_ascii_lowercase()),
                None => Some("co".to_string()),
            },
            nominatim_endpoint: vars
                .string("NOMINATIM_ENDPOINT")
                .unwrap_or_else(|| DEFAULT_NOMINATIM_ENDPOINT.to_string()),
            nominatim_user_agent: vars.string("NOMINATIM_USER_AGENT").unwrap_or_else(|| {
                concat!("geofull/", env!("CARGO_PKG_VERSION")).to_string()
            }),
            opencage_endpoint: vars
                .string("OPENCAGE_ENDPOINT")
                .unwrap_or_else(|| DEFAULT_OPENCAGE_ENDPOINT.to_string()),
            opencage_api_key: vars.secret("OPENCAGE_API_KEY"),
            google_geocoding_endpoint: vars
                .string("GOOGLE_GEOCODING_ENDPOINT")
                .unwrap_or_else(|| DEFAULT_GOOGLE_ENDPOINT.to_string()),
            google_geocoding_api_key: vars.secret("GOOGLE_GEOCODING_API_KEY"),
            normalizer_rules_path: vars.string("NORMALIZER_RULES_PATH").map(PathBuf::from),
            data_dir: vars
                .string("GEOFULL_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".geofull")),
            database_file_name: vars
                .string("DATABASE_FILE_NAME")
                .unwrap_or_else(|| "geofull.db".to_string()),
            journal_enabled: vars.parse_bool("JOURNAL_ENABLED", true),
            journal_batch_size: vars.parse_usize("JOURNAL_BATCH_SIZE", 25).max(1),
            journal_buffer_max_bytes: vars
                .parse_u64("JOURNAL_BUFFER_MAX_BYTES", DEFAULT_JOURNAL_BUFFER_MAX_BYTES),
            journal_buffer_max_files: vars
                .parse_usize("JOURNAL_BUFFER_MAX_FILES", DEFAULT_JOURNAL_BUFFER_MAX_FILES)
                .max(1),
        }
    }

    pub fn rate_limit_qps(&self, id: &ProviderId) -> u32 {
        self.provider_rate_limits
            .get(id)
            .copied()
            .unwrap_or_else(|| default_rate_limit(id))
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn failure_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.failure_cache_ttl_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_millis(self.provider_timeout_ms)
    }

    pub fn rate_limit_cooldown(&self) -> Duration {
        Duration::from_millis(self.rate_limit_cooldown_ms)
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(&self.database_file_name)
    }

    pub fn public_profile(&self) -> PublicAppConfig {
        PublicAppConfig {
            provider_priority: self.provider_priority.clone(),
            provider_rate_limits: self.provider_rate_limits.clone(),
            confidence_threshold: self.confidence_threshold,
            cache_ttl_secs: self.cache_ttl_secs,
            failure_cache_ttl_secs: self.failure_cache_ttl_secs,
            cache_capacity: self.cache_capacity,
            retry_backoff_ms: self.retry_backoff_ms,
            worker_concurrency: self.worker_concurrency,
            provider_timeout_ms: self.provider_timeout_ms,
            rate_limit_cooldown_ms: self.rate_limit_cooldown_ms,
            country_code: self.country_code.clone(),
            nominatim_endpoint: self.nominatim_endpoint.clone(),
            opencage_endpoint: self.opencage_endpoint.clone(),
            google_geocoding_endpoint: self.google_geocoding_endpoint.clone(),
            data_dir: self.data_dir.clone(),
            database_file_name: self.database_file_name.clone(),
            journal_enabled: self.journal_enabled,
            has_opencage_key: self.opencage_api_key.is_some(),
            has_google_geocoding_key: self.google_geocoding_api_key.is_some(),
        }
    }
}

fn default_rate_limit(id: &ProviderId) -> u32 {
    match id.as_str() {
        nominatim::PROVIDER_NAME | opencage::PROVIDER_NAME => 1,
        google::PROVIDER_NAME => 10,
        _ => 1,
    }
}

struct Vars<F>(F);

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn secret(&self, key: &str) -> Option<SecretString> {
        self.string(key).map(SecretString::from)
    }

    fn parse_bool(&self, key: &str, default: bool) -> bool {
        self.string(key)
            .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
            .unwrap_or(default)
    }

    fn parse_u64(&self, key: &str, default: u64) -> u64 {
        self.string(key)
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(default)
    }

    fn parse_usize(&self, key: &str, default: usize) -> usize {
        self.string(key)
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(default)
    }

    fn parse_u32(&self, key: &str, default: u32) -> u32 {
        self.string(key)
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(default)
    }

    fn parse_f64(&self, key: &str, default: f64) -> f64 {
        self.string(key)
            .and_then(|v| v.parse::<f64>().ok())
            .filter(|v| v.is_finite())
            .unwrap_or(default)
    }
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions)
        || env::var("ALLOW_DOTENV")
            .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
            .unwrap_or(false)
}

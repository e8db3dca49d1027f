use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult, ProviderError, ProviderErrorKind};

pub mod google;
pub mod nominatim;
pub mod opencage;

pub use google::GoogleGeocodingProvider;
pub use nominatim::NominatimProvider;
pub use opencage::OpenCageProvider;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderId(String);

impl ProviderId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into().trim().to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single accepted candidate. Immutable once cached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeocodeResult {
    pub suggested_text: String,
    pub latitude: f64,
    pub longitude: f64,
    pub postal_code: Option<String>,
    pub provider: ProviderId,
    pub confidence: f64,
    pub fetched_at: DateTime<Utc>,
}

/// One external geocoding service. Implementations only translate between
/// this contract and the service's wire format; retries, rate limits and
/// caching are handled by the router.
#[async_trait]
pub trait GeocodeProvider: Send + Sync {
    fn id(&self) -> &ProviderId;

    async fn geocode(&self, query: &str) -> Result<GeocodeResult, ProviderError>;
}

/// Builds the fallback chain in configured priority order.
pub fn build_providers(config: &AppConfig) -> AppResult<Vec<Arc<dyn GeocodeProvider>>> {
    let timeout = config.provider_timeout();
    let country = config.country_code.clone();
    let mut chain: Vec<Arc<dyn GeocodeProvider>> = Vec::new();

    for id in &config.provider_priority {
        match id.as_str() {
            nominatim::PROVIDER_NAME => chain.push(Arc::new(NominatimProvider::new(
                config.nominatim_endpoint.clone(),
                &config.nominatim_user_agent,
                country.clone(),
                timeout,
            )?)),
            opencage::PROVIDER_NAME => match config.opencage_api_key.clone() {
                Some(key) => chain.push(Arc::new(OpenCageProvider::new(
                    config.opencage_endpoint.clone(),
                    key,
                    country.clone(),
                    timeout,
                )?)),
                None => warn!(provider = %id, "skipping provider without api key"),
            },
            google::PROVIDER_NAME => match config.google_geocoding_api_key.clone() {
                Some(key) => chain.push(Arc::new(GoogleGeocodingProvider::new(
                    config.google_geocoding_endpoint.clone(),
                    key,
                    country.clone(),
                    timeout,
                )?)),
                None => warn!(provider = %id, "skipping provider without api key"),
            },
            _ => warn!(provider = %id, "ignoring unknown provider in priority list"),
        }
    }

    if chain.is_empty() {
        return Err(AppError::Config(
            "no geocoding provider is available; check PROVIDER_PRIORITY and api keys".into(),
        ));
    }
    debug!(
        providers = ?chain.iter().map(|p| p.id().to_string()).collect::<Vec<_>>(),
        "geocoding provider chain ready"
    );
    Ok(chain)
}

pub(crate) fn http_client(timeout: Duration, user_agent: &str) -> AppResult<Client> {
    Ok(Client::builder()
        .timeout(timeout)
        .user_agent(user_agent)
        .build()?)
}

pub(crate) fn transport_error(provider: &ProviderId, err: reqwest::Error) -> ProviderError {
    let kind = if err.is_timeout() {
        ProviderErrorKind::Timeout
    } else if err.is_decode() {
        ProviderErrorKind::Malformed
    } else {
        ProviderErrorKind::Unavailable
    };
    ProviderError::new(provider.clone(), kind, err.to_string())
}

pub(crate) fn status_error(provider: &ProviderId, response: &Response) -> Option<ProviderError> {
    let status = response.status();
    if status.is_success() {
        return None;
    }
    let message = format!("http status {status}");
    let error = match status {
        StatusCode::TOO_MANY_REQUESTS => {
            ProviderError::rate_limited(provider.clone(), message, retry_after(response))
        }
        StatusCode::NOT_FOUND => {
            ProviderError::new(provider.clone(), ProviderErrorKind::NotFound, message)
        }
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
            ProviderError::new(provider.clone(), ProviderErrorKind::Timeout, message)
        }
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
            ProviderError::new(provider.clone(), ProviderErrorKind::Malformed, message)
        }
        _ => ProviderError::new(provider.clone(), ProviderErrorKind::Unavailable, message),
    };
    Some(error)
}

pub(crate) fn retry_after(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Reads a JSON body, mapping undecodable payloads to `Malformed`.
pub(crate) async fn read_json<T: DeserializeOwned>(
    provider: &ProviderId,
    response: Response,
) -> Result<T, ProviderError> {
    let body = response
        .bytes()
        .await
        .map_err(|err| transport_error(provider, err))?;
    serde_json::from_slice(&body).map_err(|err| {
        ProviderError::new(
            provider.clone(),
            ProviderErrorKind::Malformed,
            format!("undecodable response: {err}"),
        )
    })
}

pub(crate) fn not_found(provider: &ProviderId, query: &str) -> ProviderError {
    ProviderError::new(
        provider.clone(),
        ProviderErrorKind::NotFound,
        format!("no candidates for {query:?}"),
    )
}

pub(crate) fn malformed(provider: &ProviderId, message: impl Into<String>) -> ProviderError {
    ProviderError::new(provider.clone(), ProviderErrorKind::Malformed, message)
}

pub(crate) fn parse_coordinate(provider: &ProviderId, value: &str) -> Result<f64, ProviderError> {
    value
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| malformed(provider, format!("invalid coordinate {value:?}")))
}

pub(crate) fn endpoint_url(endpoint: &str, path: &str) -> String {
    let base = endpoint.trim_end_matches('/');
    if path.is_empty() {
        base.to_string()
    } else {
        format!("{base}/{}", path.trim_start_matches('/'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_ids_are_case_folded() {
        assert_eq!(ProviderId::new(" Nominatim "), ProviderId::new("nominatim"));
        assert_eq!(ProviderId::new("OpenCage").to_string(), "opencage");
    }

    #[test]
    fn joins_endpoint_paths() {
        assert_eq!(
            endpoint_url("http://localhost:8080/", "/search"),
            "http://localhost:8080/search"
        );
        assert_eq!(endpoint_url("http://x/geocode/json", ""), "http://x/geocode/json");
    }

    #[test]
    fn rejects_non_numeric_coordinates() {
        let id = ProviderId::new("mock");
        assert_eq!(parse_coordinate(&id, " 4.60 ").unwrap(), 4.6);
        let err = parse_coordinate(&id, "north").unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::Malformed);
    }

    #[test]
    fn skips_keyless_providers_and_rejects_empty_chain() {
        let config = AppConfig::from_lookup(|key| match key {
            "PROVIDER_PRIORITY" => Some("opencage,google,nominatim".into()),
            _ => None,
        });
        let chain = build_providers(&config).unwrap();
        let ids: Vec<_> = chain.iter().map(|p| p.id().to_string()).collect();
        assert_eq!(ids, vec!["nominatim"]);

        let keyless = AppConfig::from_lookup(|key| match key {
            "PROVIDER_PRIORITY" => Some("opencage,google".into()),
            _ => None,
        });
        assert!(matches!(
            build_providers(&keyless),
            Err(AppError::Config(_))
        ));
    }
}

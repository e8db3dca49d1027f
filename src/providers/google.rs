use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::warn;

use super::{
    endpoint_url, http_client, malformed, not_found, read_json, status_error, transport_error,
    GeocodeProvider, GeocodeResult, ProviderId,
};
use crate::errors::{AppResult, ProviderError, ProviderErrorKind};

pub const PROVIDER_NAME: &str = "google";

const PARTIAL_MATCH_PENALTY: f64 = 0.75;

#[derive(Debug, Deserialize)]
struct GeocodeResponse {
    status: String,
    #[serde(default)]
    results: Vec<GeocodeHit>,
    #[serde(default)]
    error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeocodeHit {
    formatted_address: String,
    geometry: HitGeometry,
    #[serde(default)]
    partial_match: bool,
    #[serde(default)]
    address_components: Vec<AddressComponent>,
}

#[derive(Debug, Deserialize)]
struct HitGeometry {
    location: LatLng,
    location_type: String,
}

#[derive(Debug, Deserialize)]
struct LatLng {
    lat: f64,
    lng: f64,
}

#[derive(Debug, Deserialize)]
struct AddressComponent {
    long_name: String,
    #[serde(default)]
    types: Vec<String>,
}

impl GeocodeHit {
    fn confidence(&self) -> f64 {
        let base = match self.geometry.location_type.as_str() {
            "ROOFTOP" => 1.0,
            "RANGE_INTERPOLATED" => 0.85,
            "GEOMETRIC_CENTER" => 0.6,
            "APPROXIMATE" => 0.4,
            _ => 0.0,
        };
        if self.partial_match {
            base * PARTIAL_MATCH_PENALTY
        } else {
            base
        }
    }

    fn postal_code(&self) -> Option<String> {
        self.address_components
            .iter()
            .find(|component| component.types.iter().any(|t| t == "postal_code"))
            .map(|component| component.long_name.clone())
    }
}

/// Google Maps Geocoding API (paid).
pub struct GoogleGeocodingProvider {
    id: ProviderId,
    http: Client,
    endpoint: String,
    api_key: SecretString,
    country_code: Option<String>,
}

impl GoogleGeocodingProvider {
    pub fn new(
        endpoint: String,
        api_key: SecretString,
        country_code: Option<String>,
        timeout: Duration,
    ) -> AppResult<Self> {
        Ok(Self {
            id: ProviderId::new(PROVIDER_NAME),
            http: http_client(timeout, concat!("geofull/", env!("CARGO_PKG_VERSION")))?,
            endpoint,
            api_key,
            country_code,
        })
    }

    fn status_to_error(&self, status: &str, detail: Option<String>, query: &str) -> ProviderError {
        let message = detail.unwrap_or_else(|| status.to_string());
        match status {
            "ZERO_RESULTS" => not_found(&self.id, query),
            "OVER_QUERY_LIMIT" | "OVER_DAILY_LIMIT" => {
                ProviderError::rate_limited(self.id.clone(), message, None)
            }
            "INVALID_REQUEST" => malformed(&self.id, message),
            "REQUEST_DENIED" => {
                warn!(provider = %self.id, "geocoding request denied; check the api key");
                ProviderError::new(self.id.clone(), ProviderErrorKind::Unavailable, message)
            }
            _ => ProviderError::new(self.id.clone(), ProviderErrorKind::Unavailable, message),
        }
    }
}

#[async_trait]
impl GeocodeProvider for GoogleGeocodingProvider {
    fn id(&self) -> &ProviderId {
        &self.id
    }

    async fn geocode(&self, query: &str) -> Result<GeocodeResult, ProviderError> {
        let mut params = vec![
            ("address", query.to_string()),
            ("key", self.api_key.expose_secret().to_string()),
        ];
        if let Some(country) = &self.country_code {
            params.push(("components", format!("country:{}", country.to_uppercase())));
        }

        let response = self
            .http
            .get(endpoint_url(&self.endpoint, ""))
            .query(&params)
            .send()
            .await
            .map_err(|err| transport_error(&self.id, err))?;
        if let Some(err) = status_error(&self.id, &response) {
            return Err(err);
        }

        let parsed: GeocodeResponse = read_json(&self.id, response).await?;
        if parsed.status != "OK" {
            return Err(self.status_to_error(&parsed.status, parsed.error_message, query));
        }
        let hit = parsed
            .results
            .into_iter()
            .next()
            .ok_or_else(|| not_found(&self.id, query))?;

        Ok(GeocodeResult {
            confidence: hit.confidence(),
            postal_code: hit.postal_code(),
            latitude: hit.geometry.location.lat,
            longitude: hit.geometry.location.lng,
            suggested_text: hit.formatted_address,
            provider: self.id.clone(),
            fetched_at: Utc::now(),
        })
    }
}

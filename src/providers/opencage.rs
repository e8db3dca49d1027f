use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use super::{
    endpoint_url, http_client, not_found, read_json, retry_after, status_error, transport_error,
    GeocodeProvider, GeocodeResult, ProviderId,
};
use crate::errors::{AppResult, ProviderError};

pub const PROVIDER_NAME: &str = "opencage";

#[derive(Debug, Deserialize)]
struct ForwardResponse {
    #[serde(default)]
    results: Vec<ForwardResult>,
}

#[derive(Debug, Deserialize)]
struct ForwardResult {
    formatted: String,
    geometry: Geometry,
    /// 0-10, where 10 is the tightest bounding box.
    #[serde(default)]
    confidence: Option<u8>,
    #[serde(default)]
    components: Components,
}

#[derive(Debug, Deserialize)]
struct Geometry {
    lat: f64,
    lng: f64,
}

#[derive(Debug, Default, Deserialize)]
struct Components {
    postcode: Option<String>,
}

pub struct OpenCageProvider {
    id: ProviderId,
    http: Client,
    endpoint: String,
    api_key: SecretString,
    country_code: Option<String>,
}

impl OpenCageProvider {
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
}

#[async_trait]
impl GeocodeProvider for OpenCageProvider {
    fn id(&self) -> &ProviderId {
        &self.id
    }

    async fn geocode(&self, query: &str) -> Result<GeocodeResult, ProviderError> {
        let mut params = vec![
            ("q", query.to_string()),
            ("key", self.api_key.expose_secret().to_string()),
            ("limit", "1".to_string()),
            ("no_annotations", "1".to_string()),
        ];
        if let Some(country) = &self.country_code {
            params.push(("countrycode", country.clone()));
        }

        let response = self
            .http
            .get(endpoint_url(&self.endpoint, ""))
            .query(&params)
            .send()
            .await
            .map_err(|err| transport_error(&self.id, err))?;
        // 402 means the daily quota is spent; treat it like throttling.
        if response.status() == StatusCode::PAYMENT_REQUIRED {
            return Err(ProviderError::rate_limited(
                self.id.clone(),
                "daily quota exhausted",
                retry_after(&response),
            ));
        }
        if let Some(err) = status_error(&self.id, &response) {
            return Err(err);
        }

        let parsed: ForwardResponse = read_json(&self.id, response).await?;
        let hit = parsed
            .results
            .into_iter()
            .next()
            .ok_or_else(|| not_found(&self.id, query))?;

        Ok(GeocodeResult {
            suggested_text: hit.formatted,
            latitude: hit.geometry.lat,
            longitude: hit.geometry.lng,
            postal_code: hit.components.postcode,
            provider: self.id.clone(),
            confidence: hit
                .confidence
                .map(|score| (f64::from(score) / 10.0).min(1.0))
                .unwrap_or(0.0),
            fetched_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use httptest::matchers::{all_of, contains, request, url_decoded};
    use httptest::responders::{json_encoded, status_code};
    use httptest::{Expectation, Server};
    use serde_json::json;

    use super::*;
    use crate::errors::ProviderErrorKind;

    fn provider(server: &Server) -> OpenCageProvider {
        OpenCageProvider::new(
            server.url_str("/geocode/v1/json"),
            SecretString::from("oc-key".to_string()),
            None,
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn maps_first_result() {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("GET", "/geocode/v1/json"),
                request::query(url_decoded(contains(("key", "oc-key")))),
                request::query(url_decoded(contains(("q", "Calle 45 # 12-30")))),
            ])
            .respond_with(json_encoded(json!({
                "results": [{
                    "formatted": "Calle 45 #12-30, Bogotá, Colombia",
                    "geometry": {"lat": 4.63, "lng": -74.06},
                    "confidence": 9,
                    "components": {"postcode": "111311", "city": "Bogotá"}
                }],
                "status": {"code": 200, "message": "OK"}
            }))),
        );

        let result = provider(&server).geocode("Calle 45 # 12-30").await.unwrap();
        assert_eq!(result.postal_code.as_deref(), Some("111311"));
        assert_eq!(result.provider, ProviderId::new("opencage"));
        assert!((result.confidence - 0.9).abs() < 1e-9);
    }

    #[tokio::test]
    async fn exhausted_quota_is_rate_limited() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/geocode/v1/json"))
                .respond_with(status_code(402)),
        );
        let err = provider(&server).geocode("Calle 1").await.unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::RateLimited);
    }

    #[tokio::test]
    async fn missing_results_is_not_found() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/geocode/v1/json"))
                .respond_with(json_encoded(json!({"results": [], "total_results": 0}))),
        );
        let err = provider(&server).geocode("Calle 1").await.unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::NotFound);
    }
}

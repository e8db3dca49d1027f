use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::Deserialize;
use tracing::trace;

use super::{
    endpoint_url, http_client, not_found, parse_coordinate, read_json, status_error,
    transport_error, GeocodeProvider, GeocodeResult, ProviderId,
};
use crate::errors::{AppResult, ProviderError};

pub const PROVIDER_NAME: &str = "nominatim";

/// Highest `place_rank` Nominatim assigns (a single building).
const MAX_PLACE_RANK: f64 = 30.0;

#[derive(Debug, Deserialize)]
struct SearchHit {
    lat: String,
    lon: String,
    display_name: String,
    #[serde(default)]
    place_rank: Option<u32>,
    #[serde(default)]
    address: Option<HitAddress>,
}

#[derive(Debug, Deserialize)]
struct HitAddress {
    postcode: Option<String>,
}

/// OpenStreetMap Nominatim search. Free, so it usually leads the chain.
pub struct NominatimProvider {
    id: ProviderId,
    http: Client,
    endpoint: String,
    country_code: Option<String>,
}

impl NominatimProvider {
    pub fn new(
        endpoint: String,
        user_agent: &str,
        country_code: Option<String>,
        timeout: Duration,
    ) -> AppResult<Self> {
        Ok(Self {
            id: ProviderId::new(PROVIDER_NAME),
            http: http_client(timeout, user_agent)?,
            endpoint,
            country_code,
        })
    }
}

#[async_trait]
impl GeocodeProvider for NominatimProvider {
    fn id(&self) -> &ProviderId {
        &self.id
    }

    async fn geocode(&self, query: &str) -> Result<GeocodeResult, ProviderError> {
        let mut params = vec![
            ("q", query.to_string()),
            ("format", "jsonv2".to_string()),
            ("addressdetails", "1".to_string()),
            ("limit", "1".to_string()),
        ];
        if let Some(country) = &self.country_code {
            params.push(("countrycodes", country.clone()));
        }

        let response = self
            .http
            .get(endpoint_url(&self.endpoint, "search"))
            .query(&params)
            .send()
            .await
            .map_err(|err| transport_error(&self.id, err))?;
        if let Some(err) = status_error(&self.id, &response) {
            return Err(err);
        }

        let hits: Vec<SearchHit> = read_json(&self.id, response).await?;
        let hit = hits
            .into_iter()
            .next()
            .ok_or_else(|| not_found(&self.id, query))?;
        trace!(rank = ?hit.place_rank, "nominatim candidate");

        let confidence = hit
            .place_rank
            .map(|rank| (f64::from(rank) / MAX_PLACE_RANK).min(1.0))
            .unwrap_or(0.0);
        Ok(GeocodeResult {
            latitude: parse_coordinate(&self.id, &hit.lat)?,
            longitude: parse_coordinate(&self.id, &hit.lon)?,
            suggested_text: hit.display_name,
            postal_code: hit.address.and_then(|address| address.postcode),
            provider: self.id.clone(),
            confidence,
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

    fn provider(server: &Server) -> NominatimProvider {
        NominatimProvider::new(
            server.url_str(""),
            "geofull-tests",
            Some("co".into()),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn maps_search_hit_to_result() {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("GET", "/search"),
                request::query(url_decoded(contains(("q", "Carrera 7 # 45-10, Bogota")))),
                request::query(url_decoded(contains(("countrycodes", "co")))),
            ])
            .respond_with(json_encoded(json!([{
                "lat": "4.6",
                "lon": "-74.07",
                "display_name": "Carrera 7, Bogotá, Colombia",
                "place_rank": 27,
                "address": {"postcode": "110111"}
            }]))),
        );

        let result = provider(&server)
            .geocode("Carrera 7 # 45-10, Bogota")
            .await
            .unwrap();
        assert_eq!(result.latitude, 4.6);
        assert_eq!(result.longitude, -74.07);
        assert_eq!(result.postal_code.as_deref(), Some("110111"));
        assert_eq!(result.provider, ProviderId::new("nominatim"));
        assert!((result.confidence - 0.9).abs() < 1e-9);
    }

    #[tokio::test]
    async fn empty_result_is_not_found() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/search"))
                .respond_with(json_encoded(json!([]))),
        );
        let err = provider(&server).geocode("Calle 1").await.unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::NotFound);
    }

    #[tokio::test]
    async fn too_many_requests_is_rate_limited() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/search"))
                .respond_with(status_code(429).insert_header("Retry-After", "7")),
        );
        let err = provider(&server).geocode("Calle 1").await.unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::RateLimited);
        assert_eq!(err.retry_after, Some(Duration::from_secs(7)));
    }

    #[tokio::test]
    async fn garbage_body_is_malformed() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/search"))
                .respond_with(status_code(200).body("<html>")),
        );
        let err = provider(&server).geocode("Calle 1").await.unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::Malformed);
    }

    #[tokio::test]
    async fn server_error_is_unavailable() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/search"))
                .respond_with(status_code(503)),
        );
        let err = provider(&server).geocode("Calle 1").await.unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::Unavailable);
    }
}

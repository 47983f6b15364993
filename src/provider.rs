use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tracing::trace;

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};
use crate::ingestion::Coordinate;

/// One outbound lookup. `Ok(None)` means the provider answered with zero
/// candidates.
#[async_trait]
pub trait GeocodeProvider: Send + Sync {
    async fn lookup(&self, query: &str) -> AppResult<Option<Coordinate>>;
}

/// Nominatim-compatible search client (`/search?q=..&format=json&limit=1`).
pub struct NominatimClient {
    http: reqwest::Client,
    endpoint: String,
    country: String,
    api_key: Option<SecretString>,
    email: Option<String>,
}

impl NominatimClient {
    pub fn new(config: &AppConfig) -> AppResult<Self> {
        let http = reqwest::Client::builder()
            .user_agent(config.geocoder_user_agent.as_str())
            .timeout(Duration::from_millis(config.geocoder_timeout_ms))
            .build()?;
        Ok(Self {
            http,
            endpoint: config.geocoder_endpoint.clone(),
            country: config.geocoder_country.clone(),
            api_key: config.geocoder_api_key.clone(),
            email: config.geocoder_email.clone(),
        })
    }
}

#[async_trait]
impl GeocodeProvider for NominatimClient {
    async fn lookup(&self, query: &str) -> AppResult<Option<Coordinate>> {
        let mut params = vec![
            ("q", query),
            ("format", "json"),
            ("limit", "1"),
            ("countrycodes", self.country.as_str()),
        ];
        if let Some(key) = &self.api_key {
            params.push(("key", key.expose_secret()));
        }
        if let Some(email) = &self.email {
            params.push(("email", email.as_str()));
        }

        let response = self.http.get(&self.endpoint).query(&params).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(AppError::Provider {
                status: status.as_u16(),
                query: query.to_string(),
            });
        }

        let body = response.text().await?;
        let provider_error = || AppError::Provider {
            status: status.as_u16(),
            query: query.to_string(),
        };
        let parsed: Value = serde_json::from_str(&body).map_err(|_| provider_error())?;
        let candidate = parse_first_candidate(&parsed).ok_or_else(provider_error)?;
        trace!(target: "provider", query, found = candidate.is_some(), "lookup answered");
        Ok(candidate)
    }
}

/// `None` when the body is not a candidate array; `Some(None)` for an empty
/// array.
fn parse_first_candidate(body: &Value) -> Option<Option<Coordinate>> {
    let candidates = body.as_array()?;
    let Some(first) = candidates.first() else {
        return Some(None);
    };
    let lat = number_field(first, "lat")?;
    let lon = number_field(first, "lon")?;
    Some(Some(Coordinate::new(lat, lon)?))
}

fn number_field(candidate: &Value, name: &str) -> Option<f64> {
    match &candidate[name] {
        Value::String(text) => text.trim().parse().ok(),
        Value::Number(number) => number.as_f64(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use httptest::matchers::{all_of, contains, request, url_decoded};
    use httptest::responders::{json_encoded, status_code};
    use httptest::{Expectation, Server};
    use serde_json::json;

    use super::*;

    fn client_for(server: &Server) -> NominatimClient {
        let dir = std::env::temp_dir();
        let mut config = AppConfig::for_tests(&dir);
        config.geocoder_endpoint = server.url("/search").to_string();
        NominatimClient::new(&config).unwrap()
    }

    #[test]
    fn parses_string_and_numeric_candidates() {
        let strings = json!([{ "lat": "-34.59", "lon": "-58.40", "display_name": "x" }]);
        assert_eq!(
            parse_first_candidate(&strings),
            Some(Coordinate::new(-34.59, -58.40))
        );
        let numbers = json!([{ "lat": -34.59, "lon": -58.40 }]);
        assert_eq!(
            parse_first_candidate(&numbers),
            Some(Coordinate::new(-34.59, -58.40))
        );
        assert_eq!(parse_first_candidate(&json!([])), Some(None));
        assert_eq!(parse_first_candidate(&json!({ "error": "x" })), None);
    }

    #[tokio::test]
    async fn sends_country_restricted_single_result_query() {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method("GET"),
                request::path("/search"),
                request::query(url_decoded(contains(("q", "Av. Santa Fe 3253, Palermo")))),
                request::query(url_decoded(contains(("countrycodes", "ar")))),
                request::query(url_decoded(contains(("limit", "1")))),
            ])
            .times(1)
            .respond_with(json_encoded(json!([{ "lat": "-34.59", "lon": "-58.40" }]))),
        );

        let client = client_for(&server);
        let found = client.lookup("Av. Santa Fe 3253, Palermo").await.unwrap();
        assert_eq!(found, Coordinate::new(-34.59, -58.40));
    }

    #[tokio::test]
    async fn empty_candidate_list_is_no_match() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::path("/search"))
                .respond_with(json_encoded(json!([]))),
        );
        let client = client_for(&server);
        assert_eq!(client.lookup("Calle Falsa 123").await.unwrap(), None);
    }

    #[tokio::test]
    async fn non_success_status_is_provider_error() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::path("/search")).respond_with(status_code(503)),
        );
        let client = client_for(&server);
        let err = client.lookup("Corrientes 348").await.unwrap_err();
        assert!(matches!(err, AppError::Provider { status: 503, .. }));
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_network_error() {
        let dir = std::env::temp_dir();
        let mut config = AppConfig::for_tests(&dir);
        config.geocoder_endpoint = "http://127.0.0.1:1/search".into();
        let client = NominatimClient::new(&config).unwrap();
        let err = client.lookup("Corrientes 348").await.unwrap_err();
        assert!(matches!(err, AppError::Network(_)));
    }
}

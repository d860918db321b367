//! REST boundary
//!
//! Bearer-authenticated HTTP client for the station snapshot and the
//! reverse-geocoding proxy. Transient failures are retried with exponential
//! backoff by the middleware. 401 is not transient and is never retried.

use std::future::Future;

use reqwest::{header::AUTHORIZATION, StatusCode, Url};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::{de::DeserializeOwned, Deserialize};
use tracing::{debug, info, warn};

use crate::{
    config::ApiConfig, errors::CommandCenterError, geocode::ReverseGeocoder, models::RawStation,
};

/// Provider of the full station list used to seed the store
pub trait SnapshotSource: Send + Sync + 'static {
    fn fetch_snapshot(
        &self,
    ) -> impl Future<Output = Result<Vec<RawStation>, CommandCenterError>> + Send;
}

#[derive(Debug, Deserialize)]
struct StationsResponse {
    data: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct GeocodeResponse {
    #[serde(default)]
    display_name: Option<String>,
}

/// HTTP client for the dashboard API
#[derive(Clone)]
pub struct ApiClient {
    inner: ClientWithMiddleware,
    snapshot_url: Url,
    geocode_url: Url,
    auth_token: Option<String>,
}

impl ApiClient {
    pub fn new(config: &ApiConfig) -> Result<Self, CommandCenterError> {
        // Without a trailing slash `join` would replace the last path segment
        let mut base_url = Url::parse(&config.base_url)?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(config.max_retries);
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        let inner = ClientBuilder::new(client)
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Ok(Self {
            inner,
            snapshot_url: base_url.join(&config.snapshot_path)?,
            geocode_url: base_url.join(&config.geocode_path)?,
            auth_token: config.auth_token.clone(),
        })
    }

    pub fn snapshot_url(&self) -> &Url {
        &self.snapshot_url
    }

    /// Geocoding endpoint with the coordinate query attached
    pub fn geocode_url(&self, lat: f64, lng: f64) -> Url {
        let mut url = self.geocode_url.clone();
        url.query_pairs_mut()
            .append_pair("lat", &lat.to_string())
            .append_pair("lng", &lng.to_string());
        url
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, CommandCenterError> {
        let endpoint = url.path().to_string();
        debug!("GET {}", url);

        let mut request = self.inner.get(url);
        if let Some(token) = &self.auth_token {
            request = request.header(AUTHORIZATION, format!("Bearer {}", token));
        }

        let response = request.send().await?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(CommandCenterError::Unauthorized(endpoint));
        }
        if !status.is_success() {
            return Err(CommandCenterError::HttpStatus {
                endpoint,
                status: status.as_u16(),
            });
        }

        Ok(response.json::<T>().await?)
    }
}

impl SnapshotSource for ApiClient {
    async fn fetch_snapshot(&self) -> Result<Vec<RawStation>, CommandCenterError> {
        let response: StationsResponse = self.get_json(self.snapshot_url.clone()).await?;
        let stations = parse_stations(response.data);
        info!("Fetched snapshot of {} stations", stations.len());
        Ok(stations)
    }
}

impl ReverseGeocoder for ApiClient {
    async fn reverse_geocode(&self, lat: f64, lng: f64) -> Result<String, CommandCenterError> {
        let response: GeocodeResponse = self.get_json(self.geocode_url(lat, lng)).await?;
        match response.display_name {
            Some(name) if !name.trim().is_empty() => Ok(name),
            _ => Err(CommandCenterError::MalformedGeocode(format!(
                "no display_name for {},{}",
                lat, lng
            ))),
        }
    }
}

/// Decode snapshot entries one by one so a single bad record does not
/// discard the whole snapshot.
fn parse_stations(values: Vec<serde_json::Value>) -> Vec<RawStation> {
    values
        .into_iter()
        .filter_map(|value| match serde_json::from_value::<RawStation>(value) {
            Ok(station) => Some(station),
            Err(e) => {
                warn!("Skipping malformed station in snapshot: {}", e);
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn config(base_url: &str) -> ApiConfig {
        ApiConfig {
            base_url: base_url.to_string(),
            auth_token: Some("secret".to_string()),
            snapshot_path: "api/stations/all".to_string(),
            geocode_path: "api/geocode".to_string(),
            max_retries: 3,
            request_timeout: Duration::from_secs(10),
        }
    }

    #[test]
    fn endpoints_are_joined_to_base_url() {
        let client = ApiClient::new(&config("https://dashboard.example.com/v2")).unwrap();

        assert_eq!(
            client.snapshot_url().as_str(),
            "https://dashboard.example.com/v2/api/stations/all"
        );
        assert_eq!(
            client.geocode_url(16.705, 74.2433).as_str(),
            "https://dashboard.example.com/v2/api/geocode?lat=16.705&lng=74.2433"
        );
    }

    #[test]
    fn relative_base_url_is_rejected() {
        assert!(matches!(
            ApiClient::new(&config("dashboard.example.com")),
            Err(CommandCenterError::InvalidUrl(_))
        ));
    }

    #[test]
    fn malformed_snapshot_entries_are_skipped() {
        let response: StationsResponse = serde_json::from_value(json!({
            "data": [
                {"station_id": "7101", "status": "INSIDE"},
                {"latitude": 16.7},
                {"station_id": "", "status": "INSIDE"},
                {"station_id": "7205"}
            ]
        }))
        .unwrap();

        let stations = parse_stations(response.data);

        let ids: Vec<_> = stations.iter().map(|s| s.station_id.as_str()).collect();
        assert_eq!(ids, vec!["7101", "7205"]);
    }
}

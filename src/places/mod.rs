use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::config::Config;
use crate::model::{PlaceMetadata, MAX_PHOTOS};
use crate::places::model::DetailsResponse;

pub mod model;

const DETAILS_PATH: &str = "maps/api/place/details/json";
/// Only what the pipeline uses; the provider bills by field group.
const DETAILS_FIELDS: &str = "rating,user_ratings_total,photos";

#[derive(Debug, Error)]
pub enum PlacesError {
    #[error("place provider unavailable: {0}")]
    ProviderUnavailable(String),
    #[error("place provider quota exceeded: {0}")]
    ProviderQuotaExceeded(String),
    #[error("no place data: {0}")]
    NoData(String),
}

/// Source of fresh rating, review count and photo references for a location.
#[async_trait]
pub trait PlaceMetadataSource: Send + Sync {
    async fn fetch_metadata(&self, location_id: &str) -> Result<PlaceMetadata, PlacesError>;
}

#[derive(Clone)]
pub struct PlacesClient {
    http: Client,
    base_url: Url,
    api_key: String,
    max_photos: usize,
}

impl fmt::Debug for PlacesClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlacesClient")
            .field("base_url", &self.base_url)
            .field("max_photos", &self.max_photos)
            .finish_non_exhaustive()
    }
}

impl PlacesClient {
    pub fn new(api_key: String, base_url: Url, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .user_agent("location-photos/0.1")
            .timeout(timeout)
            .build()
            .context("failed to build places HTTP client")?;
        Ok(Self {
            http,
            base_url,
            api_key,
            max_photos: MAX_PHOTOS,
        })
    }

    pub fn from_config(cfg: &Config) -> Result<Self> {
        let base_url = Url::parse(&cfg.places.base_url).context("invalid places.base_url")?;
        let client = Self::new(
            cfg.places.api_key.clone(),
            base_url,
            Duration::from_secs(cfg.places.timeout_seconds),
        )?;
        Ok(client.with_max_photos(cfg.places.max_photos))
    }

    pub fn with_max_photos(mut self, max_photos: usize) -> Self {
        self.max_photos = max_photos.clamp(1, MAX_PHOTOS);
        self
    }

    pub fn details_url(&self, place_id: &str) -> Result<Url> {
        let mut url = self
            .base_url
            .join(DETAILS_PATH)
            .context("invalid places base URL")?;
        url.query_pairs_mut()
            .append_pair("place_id", place_id)
            .append_pair("fields", DETAILS_FIELDS)
            .append_pair("key", &self.api_key);
        Ok(url)
    }

    pub fn build_request(&self, place_id: &str) -> Result<reqwest::Request> {
        let url = self.details_url(place_id)?;
        self.http
            .get(url)
            .header("Accept", "application/json")
            .build()
            .context("failed to build places request")
    }

    #[instrument(skip_all, fields(location_id = %place_id))]
    async fn execute_details(&self, place_id: &str) -> Result<PlaceMetadata, PlacesError> {
        let request = self
            .build_request(place_id)
            .map_err(|err| PlacesError::ProviderUnavailable(format!("{err:#}")))?;
        debug!(path = %request.url().path(), "places details request");

        let res = self.http.execute(request).await.map_err(|err| {
            PlacesError::ProviderUnavailable(format!(
                "failed to reach place provider: {}",
                err.without_url()
            ))
        })?;

        let status = res.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let body = res.text().await.unwrap_or_default();
            warn!("rate limited by place provider: {}", body);
            return Err(PlacesError::ProviderQuotaExceeded(format!(
                "received 429: {body}"
            )));
        }
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            warn!(%status, "place provider error: {}", body);
            return Err(PlacesError::ProviderUnavailable(format!(
                "provider error {status}: {body}"
            )));
        }

        let payload: DetailsResponse = res.json().await.map_err(|err| {
            PlacesError::ProviderUnavailable(format!(
                "invalid details response JSON: {}",
                err.without_url()
            ))
        })?;
        let metadata = interpret_details(payload, self.max_photos)?;
        info!(
            photos = metadata.photo_references.len(),
            rating = ?metadata.rating,
            "fetched place metadata"
        );
        Ok(metadata)
    }
}

#[async_trait]
impl PlaceMetadataSource for PlacesClient {
    async fn fetch_metadata(&self, location_id: &str) -> Result<PlaceMetadata, PlacesError> {
        self.execute_details(location_id).await
    }
}

/// Map the provider's `status` field and result body onto metadata or the
/// error taxonomy. At most `max_photos` references are kept, in order.
pub fn interpret_details(
    resp: DetailsResponse,
    max_photos: usize,
) -> Result<PlaceMetadata, PlacesError> {
    let detail = || {
        resp.error_message
            .clone()
            .unwrap_or_else(|| resp.status.clone())
    };
    match resp.status.as_str() {
        "OK" => {}
        "ZERO_RESULTS" | "NOT_FOUND" => return Err(PlacesError::NoData(detail())),
        "OVER_QUERY_LIMIT" => return Err(PlacesError::ProviderQuotaExceeded(detail())),
        _ => return Err(PlacesError::ProviderUnavailable(detail())),
    }

    let Some(result) = resp.result else {
        return Err(PlacesError::NoData("provider returned no result".into()));
    };
    let photo_references: Vec<String> = result
        .photos
        .into_iter()
        .map(|p| p.photo_reference)
        .filter(|r| !r.trim().is_empty())
        .take(max_photos)
        .collect();
    if photo_references.is_empty() {
        return Err(PlacesError::NoData("place has no photos".into()));
    }

    Ok(PlaceMetadata {
        rating: result.rating,
        user_ratings_total: result.user_ratings_total,
        photo_references,
    })
}

//! Photo acquisition: reference → fetchable URL → validated image bytes.
//!
//! Downloads run one at a time with a fixed pause between them so a
//! location never bursts against the provider's image host. A failed photo
//! is logged and dropped; acquisition itself never fails.
use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{header::CONTENT_TYPE, Client, Url};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::config::Config;
use crate::model::{PhotoRef, PhotoSlot, MAX_PHOTOS};

const PHOTO_PATH: &str = "maps/api/place/photo";

#[derive(Debug, Error, PartialEq)]
pub enum AcquireError {
    #[error("download failed: {0}")]
    DownloadFailed(String),
    #[error("invalid content type: {0}")]
    InvalidContentType(String),
}

/// Raw response of one image fetch, before validation.
#[derive(Debug, Clone)]
pub struct FetchedImage {
    pub status: u16,
    pub content_type: Option<String>,
    pub bytes: Bytes,
}

/// Transport used to fetch photo bytes.
#[async_trait]
pub trait ImageFetcher: Send + Sync {
    async fn fetch(&self, url: &Url) -> Result<FetchedImage, AcquireError>;
}

#[derive(Debug, Clone)]
pub struct HttpImageFetcher {
    http: Client,
}

impl HttpImageFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .user_agent("location-photos/0.1")
            .timeout(timeout)
            .build()
            .context("failed to build image HTTP client")?;
        Ok(Self { http })
    }
}

#[async_trait]
impl ImageFetcher for HttpImageFetcher {
    async fn fetch(&self, url: &Url) -> Result<FetchedImage, AcquireError> {
        let res = self
            .http
            .get(url.clone())
            .send()
            .await
            .map_err(|err| AcquireError::DownloadFailed(err.without_url().to_string()))?;
        let status = res.status().as_u16();
        let content_type = res
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let bytes = res
            .bytes()
            .await
            .map_err(|err| AcquireError::DownloadFailed(err.without_url().to_string()))?;
        Ok(FetchedImage {
            status,
            content_type,
            bytes,
        })
    }
}

/// A successfully downloaded photo at its original reference index.
#[derive(Debug, Clone, PartialEq)]
pub struct AcquiredPhoto {
    pub index: usize,
    pub reference: String,
    pub source_url: String,
    pub bytes: Bytes,
    pub content_type: String,
}

impl AcquiredPhoto {
    fn from_slot(slot: PhotoSlot) -> Option<Self> {
        match slot.state {
            PhotoRef::Downloaded {
                bytes,
                content_type,
            } => Some(Self {
                index: slot.index,
                reference: slot.reference,
                source_url: slot.source_url,
                bytes,
                content_type,
            }),
            PhotoRef::Unresolved(_) => None,
        }
    }
}

#[derive(Clone)]
pub struct PhotoAcquirer {
    fetcher: Arc<dyn ImageFetcher>,
    base_url: Url,
    api_key: String,
    max_width: u32,
    delay: Duration,
}

impl PhotoAcquirer {
    pub fn new(
        fetcher: Arc<dyn ImageFetcher>,
        base_url: Url,
        api_key: String,
        max_width: u32,
        delay: Duration,
    ) -> Self {
        Self {
            fetcher,
            base_url,
            api_key,
            max_width,
            delay,
        }
    }

    pub fn from_config(cfg: &Config) -> Result<Self> {
        let fetcher = HttpImageFetcher::new(Duration::from_secs(cfg.places.timeout_seconds))?;
        let base_url = Url::parse(&cfg.places.base_url).context("invalid places.base_url")?;
        Ok(Self::new(
            Arc::new(fetcher),
            base_url,
            cfg.places.api_key.clone(),
            cfg.places.photo_max_width,
            Duration::from_millis(cfg.migration.photo_delay_ms),
        ))
    }

    /// Deterministic fetch URL for one reference.
    pub fn photo_url(&self, reference: &str) -> Result<Url> {
        let mut url = self
            .base_url
            .join(PHOTO_PATH)
            .context("invalid places base URL")?;
        url.query_pairs_mut()
            .append_pair("maxwidth", &self.max_width.to_string())
            .append_pair("photo_reference", reference)
            .append_pair("key", &self.api_key);
        Ok(url)
    }

    /// Unresolved slots for up to ten references, in order.
    pub fn plan(&self, references: &[String]) -> Vec<(PhotoSlot, Option<Url>)> {
        references
            .iter()
            .take(MAX_PHOTOS)
            .enumerate()
            .map(|(index, reference)| match self.photo_url(reference) {
                Ok(url) => (
                    PhotoSlot::unresolved(index, reference.clone(), url.to_string()),
                    Some(url),
                ),
                Err(err) => {
                    warn!(index, ?err, "could not build photo URL");
                    (PhotoSlot::unresolved(index, reference.clone(), String::new()), None)
                }
            })
            .collect()
    }

    /// Download every reference in sequence and return the ones that
    /// succeeded, keeping their original indices.
    #[instrument(skip_all, fields(location_id = %location_id, references = references.len()))]
    pub async fn acquire(&self, location_id: &str, references: &[String]) -> Vec<AcquiredPhoto> {
        let mut acquired = Vec::new();
        for (n, (slot, url)) in self.plan(references).into_iter().enumerate() {
            if n > 0 && !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let Some(url) = url else {
                continue;
            };
            let index = slot.index;
            match self.download(&url).await {
                Ok((bytes, content_type)) => {
                    debug!(index, size = bytes.len(), %content_type, "photo downloaded");
                    if let Some(photo) = AcquiredPhoto::from_slot(slot.resolve(bytes, content_type)) {
                        acquired.push(photo);
                    }
                }
                Err(err) => warn!(index, %err, "dropping photo"),
            }
        }
        acquired
    }

    async fn download(&self, url: &Url) -> Result<(Bytes, String), AcquireError> {
        let fetched = self.fetcher.fetch(url).await?;
        validate_image(fetched)
    }
}

/// Accept only successful responses carrying non-empty `image/*` bodies.
pub fn validate_image(fetched: FetchedImage) -> Result<(Bytes, String), AcquireError> {
    if !(200..300).contains(&fetched.status) {
        return Err(AcquireError::DownloadFailed(format!(
            "photo host returned {}",
            fetched.status
        )));
    }
    let content_type = fetched.content_type.unwrap_or_default();
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    if !essence.starts_with("image/") {
        return Err(AcquireError::InvalidContentType(content_type));
    }
    if fetched.bytes.is_empty() {
        return Err(AcquireError::DownloadFailed("empty body".into()));
    }
    Ok((fetched.bytes, essence))
}

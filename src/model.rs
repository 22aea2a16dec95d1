use bytes::Bytes;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Upper bound on photos kept per location.
pub const MAX_PHOTOS: usize = 10;

static LOCATION_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,256}$").expect("valid location id regex"));

/// Provider place ids are URL-safe tokens; anything else is rejected before it
/// reaches a storage path or a provider query.
pub fn is_valid_location_id(id: &str) -> bool {
    LOCATION_ID_RE.is_match(id)
}

/// The `placeData` sub-document of a location.
///
/// Keys the pipeline does not own are kept in `extra` so that reading and
/// re-serializing a record never drops them.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PlaceData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rating: Option<f64>,
    #[serde(rename = "userRatingsTotal", default, skip_serializing_if = "Option::is_none")]
    pub user_ratings_total: Option<u64>,
    #[serde(rename = "photoReferences", default)]
    pub photo_references: Vec<String>,
    #[serde(rename = "photoUrls", default)]
    pub photo_urls: Vec<String>,
    #[serde(rename = "storedPhotoUrls", default, skip_serializing_if = "Option::is_none")]
    pub stored_photo_urls: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_fetched: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Partial update merged into `placeData`. Only `Some` fields are written.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct PlaceDataUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rating: Option<f64>,
    #[serde(rename = "userRatingsTotal", skip_serializing_if = "Option::is_none")]
    pub user_ratings_total: Option<u64>,
    #[serde(rename = "photoReferences", skip_serializing_if = "Option::is_none")]
    pub photo_references: Option<Vec<String>>,
    #[serde(rename = "photoUrls", skip_serializing_if = "Option::is_none")]
    pub photo_urls: Option<Vec<String>>,
    #[serde(rename = "storedPhotoUrls", skip_serializing_if = "Option::is_none")]
    pub stored_photo_urls: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_fetched: Option<DateTime<Utc>>,
}

/// One venue in the catalog.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LocationRecord {
    pub id: String,
    pub name: String,
    #[serde(rename = "placeData", default)]
    pub place_data: PlaceData,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(rename = "placeData_updated_at", default)]
    pub place_data_updated_at: Option<DateTime<Utc>>,
}

/// Row shape returned by catalog scans.
#[derive(Debug, Clone, PartialEq)]
pub struct LocationSummary {
    pub id: String,
    pub name: String,
    pub place_data: PlaceData,
}

/// Fresh metadata returned by the place provider.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlaceMetadata {
    pub rating: Option<f64>,
    pub user_ratings_total: Option<u64>,
    pub photo_references: Vec<String>,
}

/// State of one photo slot during acquisition.
#[derive(Debug, Clone, PartialEq)]
pub enum PhotoRef {
    Unresolved(String),
    Downloaded { bytes: Bytes, content_type: String },
}

/// A photo at a fixed position in the provider's reference list.
#[derive(Debug, Clone, PartialEq)]
pub struct PhotoSlot {
    pub index: usize,
    pub reference: String,
    pub source_url: String,
    pub state: PhotoRef,
}

impl PhotoSlot {
    pub fn unresolved(index: usize, reference: String, source_url: String) -> Self {
        Self {
            index,
            state: PhotoRef::Unresolved(reference.clone()),
            reference,
            source_url,
        }
    }

    pub fn resolve(self, bytes: Bytes, content_type: String) -> Self {
        Self {
            state: PhotoRef::Downloaded {
                bytes,
                content_type,
            },
            ..self
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunType {
    Scheduled,
    Manual,
}

impl RunType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunType::Scheduled => "scheduled",
            RunType::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "scheduled" => Some(RunType::Scheduled),
            "manual" => Some(RunType::Manual),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Completeness {
    Full,
    Partial,
}

/// The three buckets aggregated into run status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Failed,
    Skipped,
}

/// Why a location landed in its bucket.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeReason {
    AlreadyMigrated,
    NoData,
    QuotaExceeded,
    ProviderUnavailable,
    NoPhotosDownloaded,
    NotFound,
    RepositoryUnavailable,
    UpdateFailed,
    Stored,
    StorageFailed,
}

impl OutcomeReason {
    pub fn outcome(&self) -> Outcome {
        match self {
            OutcomeReason::AlreadyMigrated
            | OutcomeReason::NoData
            | OutcomeReason::QuotaExceeded => Outcome::Skipped,
            OutcomeReason::ProviderUnavailable
            | OutcomeReason::NoPhotosDownloaded
            | OutcomeReason::NotFound
            | OutcomeReason::RepositoryUnavailable
            | OutcomeReason::UpdateFailed => Outcome::Failed,
            // Degraded success still counts as success; `storage_success`
            // on the result tells the two apart.
            OutcomeReason::Stored | OutcomeReason::StorageFailed => Outcome::Success,
        }
    }
}

/// Per-location result of one pipeline pass.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LocationResult {
    pub id: String,
    pub outcome: Outcome,
    pub reason: OutcomeReason,
    pub acquired: usize,
    pub stored: usize,
    pub storage_success: bool,
    /// Original indices whose download or upload failed.
    pub failed_indices: Vec<usize>,
}

impl LocationResult {
    pub fn classified(id: &str, reason: OutcomeReason) -> Self {
        Self {
            id: id.to_string(),
            outcome: reason.outcome(),
            reason,
            acquired: 0,
            stored: 0,
            storage_success: false,
            failed_indices: Vec::new(),
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.outcome == Outcome::Success && !self.storage_success
    }
}

/// Aggregate of one run.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RunSummary {
    pub run_type: RunType,
    pub total_locations: usize,
    pub batches: usize,
    pub success: u64,
    pub failed: u64,
    pub skipped: u64,
    pub degraded: u64,
    pub completeness: Completeness,
    pub duration_seconds: f64,
    pub results: Vec<LocationResult>,
}

impl RunSummary {
    pub fn new(run_type: RunType, total_locations: usize) -> Self {
        Self {
            run_type,
            total_locations,
            batches: 0,
            success: 0,
            failed: 0,
            skipped: 0,
            degraded: 0,
            completeness: Completeness::Full,
            duration_seconds: 0.0,
            results: Vec::new(),
        }
    }

    pub fn push(&mut self, result: LocationResult) {
        match result.outcome {
            Outcome::Success => self.success += 1,
            Outcome::Failed => self.failed += 1,
            Outcome::Skipped => self.skipped += 1,
        }
        if result.is_degraded() {
            self.degraded += 1;
        }
        self.results.push(result);
    }

    pub fn report(&self) -> RunReport {
        RunReport {
            success_delta: self.success,
            failed_delta: self.failed,
            skipped_delta: self.skipped,
            run_type: self.run_type,
            total_locations: self.total_locations as u64,
            duration_seconds: self.duration_seconds,
            completeness: self.completeness,
        }
    }
}

/// Deltas handed to the status recorder at the end of a run.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RunReport {
    pub success_delta: u64,
    pub failed_delta: u64,
    pub skipped_delta: u64,
    pub run_type: RunType,
    pub total_locations: u64,
    pub duration_seconds: f64,
    pub completeness: Completeness,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunInfo {
    pub total_locations: u64,
    pub duration_seconds: f64,
    pub completeness: Completeness,
}

/// Singleton status accumulated across runs.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RunStatus {
    pub success_count: i64,
    pub failed_count: i64,
    pub skipped_count: i64,
    pub last_update: DateTime<Utc>,
    pub last_run_type: RunType,
    pub info: RunInfo,
}

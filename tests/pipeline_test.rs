use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Url;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use location_photos::db::{self, Pool};
use location_photos::model::{Completeness, Outcome, OutcomeReason, PlaceMetadata, RunType};
use location_photos::photos::{AcquireError, FetchedImage, ImageFetcher, PhotoAcquirer};
use location_photos::pipeline::{MigrationSettings, Pipeline};
use location_photos::runner::TaskRunner;
use location_photos::places::{PlaceMetadataSource, PlacesError};
use location_photos::status;
use location_photos::storage::{BlobStore, FsBlobStore, ObjectMeta, PhotoWriter, StorageError};

const CDN: &str = "https://cdn.example.com/blobs";

async fn setup_pool() -> Pool {
    let pool = db::init_pool("sqlite::memory:").await.unwrap();
    db::run_migrations(&pool).await.unwrap();
    pool
}

async fn seed(pool: &Pool, id: &str) {
    db::upsert_location(pool, id, &format!("Venue {id}"), &json!({}))
        .await
        .unwrap();
}

#[derive(Debug, Clone)]
enum Script {
    Photos(Vec<String>),
    NoData,
    Quota,
    Down,
}

#[derive(Clone, Default)]
struct RecordingPlaces {
    scripts: Arc<HashMap<String, Script>>,
    default_refs: Vec<String>,
    latency: Duration,
    calls: Arc<Mutex<Vec<(String, Instant)>>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl RecordingPlaces {
    fn with_refs(refs: &[&str]) -> Self {
        Self {
            default_refs: refs.iter().map(|r| r.to_string()).collect(),
            ..Default::default()
        }
    }

    fn script(mut self, id: &str, script: Script) -> Self {
        let mut scripts = (*self.scripts).clone();
        scripts.insert(id.to_string(), script);
        self.scripts = Arc::new(scripts);
        self
    }

    fn latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    async fn calls(&self) -> Vec<(String, Instant)> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl PlaceMetadataSource for RecordingPlaces {
    async fn fetch_metadata(&self, location_id: &str) -> Result<PlaceMetadata, PlacesError> {
        self.calls
            .lock()
            .await
            .push((location_id.to_string(), Instant::now()));
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let script = self
            .scripts
            .get(location_id)
            .cloned()
            .unwrap_or_else(|| Script::Photos(self.default_refs.clone()));
        match script {
            Script::Photos(photo_references) => Ok(PlaceMetadata {
                rating: Some(4.5),
                user_ratings_total: Some(120),
                photo_references,
            }),
            Script::NoData => Err(PlacesError::NoData("ZERO_RESULTS".into())),
            Script::Quota => Err(PlacesError::ProviderQuotaExceeded("OVER_QUERY_LIMIT".into())),
            Script::Down => Err(PlacesError::ProviderUnavailable("connection refused".into())),
        }
    }
}

/// Serves an image for every reference except the ones listed as broken.
/// JPEG unless `content_type` is set.
#[derive(Default)]
struct StaticFetcher {
    broken: HashSet<String>,
    content_type: Mutex<Option<String>>,
    calls: Mutex<Vec<String>>,
}

impl StaticFetcher {
    fn broken(refs: &[&str]) -> Self {
        Self {
            broken: refs.iter().map(|r| r.to_string()).collect(),
            ..Default::default()
        }
    }
}

#[async_trait]
impl ImageFetcher for StaticFetcher {
    async fn fetch(&self, url: &Url) -> Result<FetchedImage, AcquireError> {
        let reference = url
            .query_pairs()
            .find(|(k, _)| k == "photo_reference")
            .map(|(_, v)| v.into_owned())
            .unwrap_or_default();
        self.calls.lock().await.push(reference.clone());
        if self.broken.contains(&reference) {
            return Err(AcquireError::DownloadFailed("connection reset".into()));
        }
        let content_type = self
            .content_type
            .lock()
            .await
            .clone()
            .unwrap_or_else(|| "image/jpeg".into());
        Ok(FetchedImage {
            status: 200,
            bytes: Bytes::from(format!("{}:{reference}", content_type.trim_start_matches("image/"))),
            content_type: Some(content_type),
        })
    }
}

struct UnavailableStore;

#[async_trait]
impl BlobStore for UnavailableStore {
    async fn put(&self, _path: &str, _bytes: Bytes, _meta: &ObjectMeta) -> Result<(), StorageError> {
        Err(StorageError::StorageUnavailable("bucket offline".into()))
    }

    async fn make_public(&self, _path: &str) -> Result<(), StorageError> {
        Err(StorageError::StorageUnavailable("bucket offline".into()))
    }

    fn public_url(&self, path: &str) -> String {
        format!("{CDN}/{path}")
    }
}

fn settings(batch_size: usize, batch_delay: Duration, time_budget: Option<Duration>) -> MigrationSettings {
    MigrationSettings {
        batch_size,
        batch_delay,
        upload_delay: Duration::ZERO,
        time_budget,
    }
}

fn pipeline(
    pool: &Pool,
    places: RecordingPlaces,
    fetcher: Arc<StaticFetcher>,
    store: Arc<dyn BlobStore>,
    settings: MigrationSettings,
) -> Pipeline {
    let acquirer = PhotoAcquirer::new(
        fetcher,
        Url::parse("https://maps.example.com/").unwrap(),
        "test-key".into(),
        800,
        Duration::ZERO,
    );
    Pipeline::new(
        pool.clone(),
        Arc::new(places),
        acquirer,
        PhotoWriter::new(store, "public, max-age=31536000"),
        settings,
    )
}

fn fs_store(root: &Path) -> Arc<dyn BlobStore> {
    Arc::new(FsBlobStore::new(root.to_path_buf(), CDN))
}

#[tokio::test]
async fn second_run_skips_everything_already_migrated() {
    let pool = setup_pool().await;
    seed(&pool, "loc_a").await;
    seed(&pool, "loc_b").await;
    let td = tempfile::tempdir().unwrap();
    let places = RecordingPlaces::with_refs(&["r0", "r1"]);
    let fetcher = Arc::new(StaticFetcher::default());
    let p = pipeline(
        &pool,
        places.clone(),
        fetcher.clone(),
        fs_store(td.path()),
        settings(5, Duration::ZERO, None),
    );

    let first = p.run_catalog(RunType::Manual, false).await;
    assert_eq!((first.success, first.failed, first.skipped), (2, 0, 0));
    assert_eq!(first.completeness, Completeness::Full);

    let record = db::get_location(&pool, "loc_a").await.unwrap();
    assert_eq!(
        record.place_data.stored_photo_urls,
        Some(vec![
            format!("{CDN}/location-photos/loc_a/photo_0"),
            format!("{CDN}/location-photos/loc_a/photo_1"),
        ])
    );
    assert_eq!(record.place_data.rating, Some(4.5));
    assert_eq!(record.place_data.user_ratings_total, Some(120));
    assert!(record.place_data.last_fetched.is_some());
    assert!(record.place_data_updated_at.is_some());
    let on_disk = std::fs::read(td.path().join("location-photos/loc_a/photo_1")).unwrap();
    assert_eq!(on_disk, b"jpeg:r1");

    let metadata_calls = places.calls().await.len();
    let fetch_calls = fetcher.calls.lock().await.len();

    let second = p.run_catalog(RunType::Scheduled, false).await;
    assert_eq!((second.success, second.failed, second.skipped), (0, 0, 2));
    assert!(second
        .results
        .iter()
        .all(|r| r.reason == OutcomeReason::AlreadyMigrated));
    // Skip check short-circuits before any provider traffic.
    assert_eq!(places.calls().await.len(), metadata_calls);
    assert_eq!(fetcher.calls.lock().await.len(), fetch_calls);

    let status = status::read_status(&pool).await.unwrap().unwrap();
    assert_eq!(status.success_count, 2);
    assert_eq!(status.skipped_count, 2);
    assert_eq!(status.failed_count, 0);
    assert_eq!(status.last_run_type, RunType::Scheduled);
    assert_eq!(status.info.total_locations, 2);
}

#[tokio::test]
async fn stored_urls_follow_successful_photos_in_order() {
    let pool = setup_pool().await;
    seed(&pool, "loc").await;
    let td = tempfile::tempdir().unwrap();
    let p = pipeline(
        &pool,
        RecordingPlaces::with_refs(&["r0", "r1", "r2"]),
        Arc::new(StaticFetcher::broken(&["r1"])),
        fs_store(td.path()),
        settings(5, Duration::ZERO, None),
    );

    let result = p.process_location("loc", false).await;
    assert_eq!(result.outcome, Outcome::Success);
    assert_eq!(result.reason, OutcomeReason::Stored);
    assert_eq!((result.acquired, result.stored), (2, 2));
    assert_eq!(result.failed_indices, vec![1]);
    assert!(result.storage_success);

    let data = db::get_location(&pool, "loc").await.unwrap().place_data;
    let stored = data.stored_photo_urls.unwrap();
    assert_eq!(
        stored,
        vec![
            format!("{CDN}/location-photos/loc/photo_0"),
            format!("{CDN}/location-photos/loc/photo_2"),
        ]
    );
    // Each stored URL lines up with the reference at the same position.
    assert_eq!(data.photo_references, vec!["r0", "r2", "r1"]);
    assert_eq!(data.photo_urls.len(), 3);
    assert!(data.photo_urls[1].contains("photo_reference=r2"));
}

#[tokio::test]
async fn storage_outage_is_degraded_success() {
    let pool = setup_pool().await;
    seed(&pool, "loc").await;
    let p = pipeline(
        &pool,
        RecordingPlaces::with_refs(&["r0", "r1"]),
        Arc::new(StaticFetcher::default()),
        Arc::new(UnavailableStore),
        settings(5, Duration::ZERO, None),
    );

    let summary = p.run_location("loc", false).await;
    assert_eq!((summary.success, summary.failed, summary.skipped), (1, 0, 0));
    assert_eq!(summary.degraded, 1);
    let result = &summary.results[0];
    assert_eq!(result.reason, OutcomeReason::StorageFailed);
    assert!(!result.storage_success);
    assert_eq!((result.acquired, result.stored), (2, 0));
    assert_eq!(result.failed_indices, vec![0, 1]);

    let data = db::get_location(&pool, "loc").await.unwrap().place_data;
    assert_eq!(data.photo_references, vec!["r0", "r1"]);
    assert_eq!(data.photo_urls.len(), 2);
    assert!(data.stored_photo_urls.is_none());
    // Not migrated yet, so the next run retries it.
    assert!(!db::is_already_migrated(&pool, "loc").await.unwrap());
}

#[tokio::test]
async fn merge_keeps_unrelated_place_data_keys() {
    let pool = setup_pool().await;
    db::upsert_location(
        &pool,
        "loc",
        "Corner Cafe",
        &json!({ "address": "1 Main St", "rating": 1.0, "openingHours": ["Mon 9-5"] }),
    )
    .await
    .unwrap();
    let td = tempfile::tempdir().unwrap();
    let p = pipeline(
        &pool,
        RecordingPlaces::with_refs(&["r0"]),
        Arc::new(StaticFetcher::default()),
        fs_store(td.path()),
        settings(5, Duration::ZERO, None),
    );

    p.process_location("loc", false).await;

    let record = db::get_location(&pool, "loc").await.unwrap();
    assert_eq!(record.name, "Corner Cafe");
    assert_eq!(record.place_data.rating, Some(4.5));
    assert_eq!(record.place_data.extra.get("address"), Some(&json!("1 Main St")));
    assert_eq!(
        record.place_data.extra.get("openingHours"),
        Some(&json!(["Mon 9-5"]))
    );
}

#[tokio::test]
async fn provider_outcomes_land_in_their_buckets() {
    let pool = setup_pool().await;
    for id in ["ok", "quota", "empty", "down", "broken"] {
        seed(&pool, id).await;
    }
    let td = tempfile::tempdir().unwrap();
    let places = RecordingPlaces::with_refs(&["r0"])
        .script("quota", Script::Quota)
        .script("empty", Script::NoData)
        .script("down", Script::Down)
        .script("broken", Script::Photos(vec!["bad0".into(), "bad1".into()]));
    let p = pipeline(
        &pool,
        places,
        Arc::new(StaticFetcher::broken(&["bad0", "bad1"])),
        fs_store(td.path()),
        settings(2, Duration::ZERO, None),
    );

    let summary = p.run_catalog(RunType::Manual, false).await;
    assert_eq!((summary.success, summary.failed, summary.skipped), (1, 2, 2));
    assert_eq!(summary.batches, 3);

    let reasons: HashMap<&str, OutcomeReason> = summary
        .results
        .iter()
        .map(|r| (r.id.as_str(), r.reason))
        .collect();
    assert_eq!(reasons["ok"], OutcomeReason::Stored);
    assert_eq!(reasons["quota"], OutcomeReason::QuotaExceeded);
    assert_eq!(reasons["empty"], OutcomeReason::NoData);
    assert_eq!(reasons["down"], OutcomeReason::ProviderUnavailable);
    assert_eq!(reasons["broken"], OutcomeReason::NoPhotosDownloaded);

    // Failed and skipped locations are left untouched.
    let broken = db::get_location(&pool, "broken").await.unwrap();
    assert!(broken.place_data.photo_references.is_empty());
    assert!(broken.place_data_updated_at.is_none());
}

#[tokio::test]
async fn force_reingests_and_unknown_ids_fail() {
    let pool = setup_pool().await;
    seed(&pool, "loc").await;
    let td = tempfile::tempdir().unwrap();
    let places = RecordingPlaces::with_refs(&["r0"]);
    let p = pipeline(
        &pool,
        places.clone(),
        Arc::new(StaticFetcher::default()),
        fs_store(td.path()),
        settings(5, Duration::ZERO, None),
    );

    assert_eq!(p.process_location("loc", false).await.outcome, Outcome::Success);
    assert_eq!(
        p.process_location("loc", false).await.reason,
        OutcomeReason::AlreadyMigrated
    );
    let forced = p.process_location("loc", true).await;
    assert_eq!(forced.reason, OutcomeReason::Stored);
    assert_eq!(places.calls().await.len(), 2);

    let missing = p.run_location("nope", false).await;
    assert_eq!(missing.failed, 1);
    assert_eq!(missing.results[0].reason, OutcomeReason::NotFound);
    assert_eq!(missing.total_locations, 1);

    let status = status::read_status(&pool).await.unwrap().unwrap();
    assert_eq!(status.last_run_type, RunType::Manual);
    assert_eq!(status.failed_count, 1);
}

#[tokio::test]
async fn batches_are_bounded_and_separated_by_delay() {
    let pool = setup_pool().await;
    for i in 0..12 {
        seed(&pool, &format!("loc_{i:02}")).await;
    }
    let td = tempfile::tempdir().unwrap();
    let delay = Duration::from_millis(150);
    let places = RecordingPlaces::with_refs(&["r0"]).latency(Duration::from_millis(20));
    let p = pipeline(
        &pool,
        places.clone(),
        Arc::new(StaticFetcher::default()),
        fs_store(td.path()),
        settings(5, delay, None),
    );

    let summary = p.run_catalog(RunType::Manual, false).await;
    assert_eq!(summary.batches, 3);
    assert_eq!(summary.success, 12);
    assert!(places.max_in_flight.load(Ordering::SeqCst) <= 5);

    let mut times: Vec<Instant> = places.calls().await.into_iter().map(|(_, t)| t).collect();
    times.sort();
    assert_eq!(times.len(), 12);
    assert!(times[5].duration_since(times[4]) >= delay);
    assert!(times[10].duration_since(times[9]) >= delay);
}

#[tokio::test]
async fn time_budget_stops_between_batches() {
    let pool = setup_pool().await;
    for i in 0..6 {
        seed(&pool, &format!("loc_{i}")).await;
    }
    let td = tempfile::tempdir().unwrap();
    let places = RecordingPlaces::with_refs(&["r0"]).latency(Duration::from_millis(300));
    let p = pipeline(
        &pool,
        places.clone(),
        Arc::new(StaticFetcher::default()),
        fs_store(td.path()),
        settings(2, Duration::ZERO, Some(Duration::from_millis(450))),
    );

    let summary = p.run_catalog(RunType::Scheduled, false).await;
    assert_eq!(summary.batches, 2);
    assert_eq!(summary.completeness, Completeness::Partial);
    assert_eq!(summary.success, 4);
    assert_eq!(summary.total_locations, 6);
    assert_eq!(places.calls().await.len(), 4);

    let status = status::read_status(&pool).await.unwrap().unwrap();
    assert_eq!(status.success_count, 4);
    assert_eq!(status.info.completeness, Completeness::Partial);
}

#[tokio::test]
async fn forced_refresh_during_storage_outage_keeps_aligned_arrays() {
    let pool = setup_pool().await;
    db::upsert_location(
        &pool,
        "loc",
        "Old Mill",
        &json!({
            "rating": 3.9,
            "photoReferences": ["old0", "old1"],
            "photoUrls": ["https://p/old0", "https://p/old1"],
            "storedPhotoUrls": ["https://d/old0", "https://d/old1"]
        }),
    )
    .await
    .unwrap();
    let places = RecordingPlaces::with_refs(&["new0", "new1"]);
    let p = pipeline(
        &pool,
        places.clone(),
        Arc::new(StaticFetcher::default()),
        Arc::new(UnavailableStore),
        settings(5, Duration::ZERO, None),
    );

    let result = p.process_location("loc", true).await;
    assert_eq!(result.outcome, Outcome::Success);
    assert_eq!(result.reason, OutcomeReason::StorageFailed);
    assert!(!result.storage_success);
    assert_eq!(places.calls().await.len(), 1);

    let data = db::get_location(&pool, "loc").await.unwrap().place_data;
    assert_eq!(data.photo_references, vec!["old0", "old1"]);
    assert_eq!(data.photo_urls, vec!["https://p/old0", "https://p/old1"]);
    assert_eq!(
        data.stored_photo_urls,
        Some(vec!["https://d/old0".to_string(), "https://d/old1".to_string()])
    );
    assert_eq!(data.rating, Some(4.5));
    assert!(data.last_fetched.is_some());
    assert!(db::is_already_migrated(&pool, "loc").await.unwrap());
}

#[tokio::test]
async fn reingest_with_new_content_type_overwrites_the_slot() {
    let pool = setup_pool().await;
    seed(&pool, "loc").await;
    let td = tempfile::tempdir().unwrap();
    let fetcher = Arc::new(StaticFetcher::default());
    let p = pipeline(
        &pool,
        RecordingPlaces::with_refs(&["r0"]),
        fetcher.clone(),
        fs_store(td.path()),
        settings(5, Duration::ZERO, None),
    );

    p.process_location("loc", false).await;
    let first = db::get_location(&pool, "loc").await.unwrap().place_data;

    *fetcher.content_type.lock().await = Some("image/png".into());
    let forced = p.process_location("loc", true).await;
    assert_eq!(forced.reason, OutcomeReason::Stored);
    let second = db::get_location(&pool, "loc").await.unwrap().place_data;

    assert_eq!(first.stored_photo_urls, second.stored_photo_urls);
    assert_eq!(
        second.stored_photo_urls,
        Some(vec![format!("{CDN}/location-photos/loc/photo_0")])
    );
    let mut names: Vec<String> = std::fs::read_dir(td.path().join("location-photos/loc"))
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    assert_eq!(names, vec!["photo_0", "photo_0.meta.json"]);
    let on_disk = std::fs::read(td.path().join("location-photos/loc/photo_0")).unwrap();
    assert_eq!(on_disk, b"png:r0");
}

#[tokio::test]
async fn schedule_records_scheduled_runs() {
    let pool = setup_pool().await;
    seed(&pool, "loc").await;
    let td = tempfile::tempdir().unwrap();
    let p = pipeline(
        &pool,
        RecordingPlaces::with_refs(&["r0"]),
        Arc::new(StaticFetcher::default()),
        fs_store(td.path()),
        settings(5, Duration::ZERO, None),
    );
    let runner = TaskRunner::new(Arc::new(p));

    let started = Instant::now();
    let period = Duration::from_millis(100);
    let schedule = runner.spawn_schedule(period);

    let mut recorded = None;
    for _ in 0..150 {
        if let Some(status) = status::read_status(&pool).await.unwrap() {
            recorded = Some(status);
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    schedule.abort();

    let status = recorded.expect("scheduled run was never recorded");
    // First tick comes a full period after start.
    assert!(started.elapsed() >= period);
    assert_eq!(status.last_run_type, RunType::Scheduled);
    assert_eq!(status.success_count, 1);
    assert_eq!(status.info.total_locations, 1);
}

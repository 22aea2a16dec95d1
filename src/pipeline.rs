//! Batch orchestration of the photo migration.
//!
//! One location goes through: skip check → metadata → acquisition → durable
//! storage → merge-update of `placeData`. Whole-catalog runs push locations
//! through that path in fixed-size concurrent batches separated by a fixed
//! delay, with an optional wall-clock budget checked between batches.
use anyhow::Result;
use chrono::Utc;
use futures::future::join_all;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, instrument, warn};

use crate::config::Config;
use crate::db::{self, Pool, RepoError};
use crate::model::{
    Completeness, LocationResult, OutcomeReason, PlaceDataUpdate, RunSummary, RunType,
};
use crate::photos::PhotoAcquirer;
use crate::places::{PlaceMetadataSource, PlacesClient, PlacesError};
use crate::status;
use crate::storage::PhotoWriter;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationSettings {
    pub batch_size: usize,
    pub batch_delay: Duration,
    pub upload_delay: Duration,
    pub time_budget: Option<Duration>,
}

impl MigrationSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            batch_size: cfg.migration.batch_size.max(1),
            batch_delay: Duration::from_millis(cfg.migration.batch_delay_ms),
            upload_delay: Duration::from_millis(cfg.migration.upload_delay_ms),
            time_budget: cfg.migration.time_budget(),
        }
    }
}

impl Default for MigrationSettings {
    fn default() -> Self {
        Self {
            batch_size: 5,
            batch_delay: Duration::from_secs(2),
            upload_delay: Duration::from_millis(100),
            time_budget: None,
        }
    }
}

#[derive(Clone)]
pub struct Pipeline {
    pool: Pool,
    places: Arc<dyn PlaceMetadataSource>,
    acquirer: PhotoAcquirer,
    writer: PhotoWriter,
    settings: MigrationSettings,
}

impl Pipeline {
    pub fn new(
        pool: Pool,
        places: Arc<dyn PlaceMetadataSource>,
        acquirer: PhotoAcquirer,
        writer: PhotoWriter,
        settings: MigrationSettings,
    ) -> Self {
        Self {
            pool,
            places,
            acquirer,
            writer,
            settings,
        }
    }

    pub fn from_config(cfg: &Config, pool: Pool) -> Result<Self> {
        Ok(Self::new(
            pool,
            Arc::new(PlacesClient::from_config(cfg)?),
            PhotoAcquirer::from_config(cfg)?,
            PhotoWriter::from_config(cfg),
            MigrationSettings::from_config(cfg),
        ))
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Run every location in the catalog and record the aggregate.
    #[instrument(skip_all, fields(run_type = run_type.as_str(), force = force))]
    pub async fn run_catalog(&self, run_type: RunType, force: bool) -> RunSummary {
        let started = Instant::now();
        let locations = match db::list_all_locations(&self.pool).await {
            Ok(locations) => locations,
            Err(err) => {
                error!(?err, "catalog scan failed; nothing processed");
                let mut summary = RunSummary::new(run_type, 0);
                summary.completeness = Completeness::Partial;
                summary.duration_seconds = started.elapsed().as_secs_f64();
                status::record_run(&self.pool, &summary.report()).await;
                return summary;
            }
        };

        let mut summary = RunSummary::new(run_type, locations.len());
        info!(
            total = locations.len(),
            batch_size = self.settings.batch_size,
            "starting catalog run"
        );

        for (n, batch) in locations.chunks(self.settings.batch_size).enumerate() {
            if n > 0 {
                if let Some(budget) = self.settings.time_budget {
                    if started.elapsed() >= budget {
                        warn!(
                            elapsed_secs = started.elapsed().as_secs_f64(),
                            processed_batches = n,
                            "time budget exhausted; stopping before next batch"
                        );
                        summary.completeness = Completeness::Partial;
                        break;
                    }
                }
                if !self.settings.batch_delay.is_zero() {
                    tokio::time::sleep(self.settings.batch_delay).await;
                }
            }

            let results = join_all(
                batch
                    .iter()
                    .map(|location| self.process_location(&location.id, force)),
            )
            .await;
            summary.batches += 1;
            for result in results {
                summary.push(result);
            }
            info!(
                batch = n + 1,
                success = summary.success,
                failed = summary.failed,
                skipped = summary.skipped,
                "batch complete"
            );
        }

        summary.duration_seconds = started.elapsed().as_secs_f64();
        info!(
            success = summary.success,
            failed = summary.failed,
            skipped = summary.skipped,
            degraded = summary.degraded,
            batches = summary.batches,
            completeness = ?summary.completeness,
            duration_secs = summary.duration_seconds,
            "catalog run finished"
        );
        status::record_run(&self.pool, &summary.report()).await;
        summary
    }

    /// Run a single location and record it as a one-location manual run.
    #[instrument(skip_all, fields(location_id = %id, force = force))]
    pub async fn run_location(&self, id: &str, force: bool) -> RunSummary {
        let started = Instant::now();
        let mut summary = RunSummary::new(RunType::Manual, 1);
        let result = self.process_location(id, force).await;
        summary.batches = 1;
        summary.push(result);
        summary.duration_seconds = started.elapsed().as_secs_f64();
        status::record_run(&self.pool, &summary.report()).await;
        summary
    }

    /// Push one location through the pipeline and classify what happened.
    /// Never fails: every error ends up in one of the three buckets.
    #[instrument(skip_all, fields(location_id = %id))]
    pub async fn process_location(&self, id: &str, force: bool) -> LocationResult {
        let result = self.process_location_inner(id, force).await;
        info!(
            outcome = ?result.outcome,
            reason = ?result.reason,
            acquired = result.acquired,
            stored = result.stored,
            storage_success = result.storage_success,
            "location processed"
        );
        result
    }

    async fn process_location_inner(&self, id: &str, force: bool) -> LocationResult {
        let already_migrated = match db::is_already_migrated(&self.pool, id).await {
            Ok(true) if !force => {
                return LocationResult::classified(id, OutcomeReason::AlreadyMigrated);
            }
            Ok(migrated) => migrated,
            Err(RepoError::NotFound(_)) => {
                return LocationResult::classified(id, OutcomeReason::NotFound);
            }
            Err(err) => {
                warn!(?err, "skip check failed");
                return LocationResult::classified(id, OutcomeReason::RepositoryUnavailable);
            }
        };

        let metadata = match self.places.fetch_metadata(id).await {
            Ok(metadata) => metadata,
            Err(err) => {
                let reason = match &err {
                    PlacesError::NoData(_) => OutcomeReason::NoData,
                    PlacesError::ProviderQuotaExceeded(_) => OutcomeReason::QuotaExceeded,
                    PlacesError::ProviderUnavailable(_) => OutcomeReason::ProviderUnavailable,
                };
                warn!(%err, "metadata fetch did not yield photos");
                return LocationResult::classified(id, reason);
            }
        };
        if metadata.photo_references.is_empty() {
            return LocationResult::classified(id, OutcomeReason::NoData);
        }

        let references = &metadata.photo_references;
        let photos = self.acquirer.acquire(id, references).await;
        if photos.is_empty() {
            let mut result = LocationResult::classified(id, OutcomeReason::NoPhotosDownloaded);
            result.failed_indices = (0..references.len()).collect();
            return result;
        }

        let mut failed_indices: Vec<usize> = (0..references.len())
            .filter(|i| !photos.iter().any(|p| p.index == *i))
            .collect();
        let mut stored: Vec<(usize, String)> = Vec::with_capacity(photos.len());
        for (n, photo) in photos.iter().enumerate() {
            if n > 0 && !self.settings.upload_delay.is_zero() {
                tokio::time::sleep(self.settings.upload_delay).await;
            }
            match self
                .writer
                .store(id, photo.index, photo.bytes.clone(), &photo.content_type)
                .await
            {
                Ok(url) => stored.push((photo.index, url)),
                Err(err) => {
                    warn!(index = photo.index, %err, "durable write failed");
                    failed_indices.push(photo.index);
                }
            }
        }
        failed_indices.sort_unstable();

        let source_urls: Vec<String> = references
            .iter()
            .map(|r| {
                self.acquirer
                    .photo_url(r)
                    .map(|u| u.to_string())
                    .unwrap_or_default()
            })
            .collect();
        let arranged = arrange_for_write(references, &source_urls, &stored);
        let storage_success = !stored.is_empty();
        // A forced refresh that stored nothing must not replace the arrays the
        // existing durable URLs line up with.
        let keep_photo_arrays = already_migrated && !storage_success;
        if keep_photo_arrays {
            warn!("forced refresh stored no photos; keeping existing photo arrays");
        }
        let update = PlaceDataUpdate {
            rating: metadata.rating,
            user_ratings_total: metadata.user_ratings_total,
            photo_references: (!keep_photo_arrays).then_some(arranged.references),
            photo_urls: (!keep_photo_arrays).then_some(arranged.urls),
            stored_photo_urls: storage_success.then_some(arranged.stored_urls),
            last_fetched: Some(Utc::now()),
        };

        if let Err(err) = db::update_place_data(&self.pool, id, &update).await {
            warn!(%err, "record update failed");
            let reason = match err {
                RepoError::NotFound(_) => OutcomeReason::NotFound,
                _ => OutcomeReason::UpdateFailed,
            };
            let mut result = LocationResult::classified(id, reason);
            result.acquired = photos.len();
            result.stored = stored.len();
            result.failed_indices = failed_indices;
            return result;
        }

        let reason = if storage_success {
            OutcomeReason::Stored
        } else {
            OutcomeReason::StorageFailed
        };
        let mut result = LocationResult::classified(id, reason);
        result.acquired = photos.len();
        result.stored = stored.len();
        result.storage_success = storage_success;
        result.failed_indices = failed_indices;
        result
    }
}

/// Photo arrays as written back to the record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArrangedPhotos {
    pub references: Vec<String>,
    pub urls: Vec<String>,
    pub stored_urls: Vec<String>,
}

/// Stored photos first (original order), then the rest (original order), so
/// `stored_urls[i]` always describes `references[i]`. With nothing stored the
/// provider order is kept as is.
pub fn arrange_for_write(
    references: &[String],
    urls: &[String],
    stored: &[(usize, String)],
) -> ArrangedPhotos {
    let mut stored: Vec<&(usize, String)> = stored.iter().collect();
    stored.sort_by_key(|(index, _)| *index);

    let is_stored = |i: usize| stored.iter().any(|(index, _)| *index == i);
    let order: Vec<usize> = stored
        .iter()
        .map(|(index, _)| *index)
        .filter(|i| *i < references.len())
        .chain((0..references.len()).filter(|i| !is_stored(*i)))
        .collect();

    ArrangedPhotos {
        references: order.iter().map(|i| references[*i].clone()).collect(),
        urls: order
            .iter()
            .map(|i| urls.get(*i).cloned().unwrap_or_default())
            .collect(),
        stored_urls: stored.iter().map(|(_, url)| url.clone()).collect(),
    }
}

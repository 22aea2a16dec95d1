//! Singleton run-status record: counters accumulate across runs, the latest
//! run's info replaces the previous one.
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::Row;
use tracing::{error, info, instrument};

use crate::db::Pool;
use crate::model::{RunInfo, RunReport, RunStatus, RunType};

/// Merge a run's deltas into the status record. Failures are logged and
/// swallowed; recording status never fails a run.
#[instrument(skip_all, fields(run_type = report.run_type.as_str()))]
pub async fn record_run(pool: &Pool, report: &RunReport) {
    match try_record_run(pool, report).await {
        Ok(()) => info!(
            success = report.success_delta,
            failed = report.failed_delta,
            skipped = report.skipped_delta,
            "run status recorded"
        ),
        Err(err) => error!(?err, "failed to record run status"),
    }
}

async fn try_record_run(pool: &Pool, report: &RunReport) -> Result<()> {
    let info = RunInfo {
        total_locations: report.total_locations,
        duration_seconds: report.duration_seconds,
        completeness: report.completeness,
    };
    let info = serde_json::to_string(&info)?;
    sqlx::query(
        "INSERT INTO run_status (id, success_count, failed_count, skipped_count, last_update, last_run_type, info) \
         VALUES (1, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(id) DO UPDATE SET \
           success_count = run_status.success_count + excluded.success_count, \
           failed_count = run_status.failed_count + excluded.failed_count, \
           skipped_count = run_status.skipped_count + excluded.skipped_count, \
           last_update = excluded.last_update, \
           last_run_type = excluded.last_run_type, \
           info = excluded.info",
    )
    .bind(report.success_delta as i64)
    .bind(report.failed_delta as i64)
    .bind(report.skipped_delta as i64)
    .bind(Utc::now())
    .bind(report.run_type.as_str())
    .bind(info)
    .execute(pool)
    .await
    .context("failed to upsert run_status")?;
    Ok(())
}

/// Current status, or `None` before the first recorded run.
pub async fn read_status(pool: &Pool) -> Result<Option<RunStatus>> {
    let row = sqlx::query(
        "SELECT success_count, failed_count, skipped_count, last_update, last_run_type, info \
         FROM run_status WHERE id = 1",
    )
    .fetch_optional(pool)
    .await?;
    let Some(row) = row else {
        return Ok(None);
    };

    let run_type: String = row.get("last_run_type");
    let info: String = row.get("info");
    let last_update: DateTime<Utc> = row.get("last_update");
    Ok(Some(RunStatus {
        success_count: row.get("success_count"),
        failed_count: row.get("failed_count"),
        skipped_count: row.get("skipped_count"),
        last_update,
        last_run_type: RunType::parse(&run_type)
            .ok_or_else(|| anyhow!("unknown run type in status: {run_type}"))?,
        info: serde_json::from_str(&info).context("invalid run_status.info")?,
    }))
}

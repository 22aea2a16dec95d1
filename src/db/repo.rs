use super::model::{LocationRow, LocationScanRow};
use crate::model::{LocationRecord, LocationSummary, PlaceDataUpdate};
use anyhow::Result;
use chrono::Utc;
use serde_json::Value;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::{debug, instrument, warn};

pub type Pool = SqlitePool;

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("location {0} not found")]
    NotFound(String),
    #[error("failed to update location {id}: {source}")]
    UpdateFailed {
        id: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("invalid document: {0}")]
    InvalidDocument(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("corrupt placeData: {0}")]
    Corrupt(#[from] serde_json::Error),
}

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    // Every connection to `sqlite::memory:` is its own database, so in-memory
    // pools are pinned to a single connection.
    if normalized.starts_with("sqlite::memory") {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(&normalized)
            .await?;
        return Ok(pool);
    }
    let pool = SqlitePool::connect(&normalized).await?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/`, ensure the parent
/// directory exists and ask SQLite to create the file. Leaves in-memory URLs
/// untouched.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            if let Err(err) = std::fs::create_dir_all(parent) {
                warn!(dir = %parent.display(), %err, "failed to create database directory");
            }
        }
    }

    let query = match query_part {
        Some(q) if q.contains("mode=") => q.to_string(),
        Some(q) => format!("{q}&mode=rwc"),
        None => "mode=rwc".to_string(),
    };
    format!("sqlite://{expanded_path}?{query}")
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Insert a location, or rename it and merge `place_data` into the stored
/// document when it already exists.
#[instrument(skip_all, fields(location_id = %id))]
pub async fn upsert_location(
    pool: &Pool,
    id: &str,
    name: &str,
    place_data: &Value,
) -> Result<(), RepoError> {
    if id.trim().is_empty() {
        return Err(RepoError::InvalidDocument("location id must be non-empty".into()));
    }
    if !place_data.is_object() {
        return Err(RepoError::InvalidDocument(format!(
            "placeData for {id} must be a JSON object"
        )));
    }
    sqlx::query(
        "INSERT INTO locations (id, name, place_data) VALUES (?, ?, json(?)) \
         ON CONFLICT(id) DO UPDATE SET name = excluded.name, \
         place_data = json_patch(locations.place_data, excluded.place_data)",
    )
    .bind(id)
    .bind(name)
    .bind(place_data.to_string())
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all, fields(location_id = %id))]
pub async fn get_location(pool: &Pool, id: &str) -> Result<LocationRecord, RepoError> {
    let row: Option<LocationRow> = sqlx::query_as(
        "SELECT id, name, place_data, updated_at, place_data_updated_at FROM locations WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;
    let row = row.ok_or_else(|| RepoError::NotFound(id.to_string()))?;
    Ok(row.into_record()?)
}

/// True iff `placeData.storedPhotoUrls` exists and is non-empty.
#[instrument(skip_all, fields(location_id = %id))]
pub async fn is_already_migrated(pool: &Pool, id: &str) -> Result<bool, RepoError> {
    let len: Option<Option<i64>> = sqlx::query_scalar(
        "SELECT CASE json_type(place_data, '$.storedPhotoUrls') \
           WHEN 'array' THEN json_array_length(place_data, '$.storedPhotoUrls') \
           ELSE 0 END \
         FROM locations WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;
    match len {
        Some(len) => Ok(len.unwrap_or(0) > 0),
        None => Err(RepoError::NotFound(id.to_string())),
    }
}

/// Full catalog scan in insertion order.
#[instrument(skip_all)]
pub async fn list_all_locations(pool: &Pool) -> Result<Vec<LocationSummary>, RepoError> {
    let rows: Vec<LocationScanRow> =
        sqlx::query_as("SELECT id, name, place_data FROM locations ORDER BY rowid")
            .fetch_all(pool)
            .await?;
    Ok(rows.into_iter().map(LocationScanRow::into_summary).collect())
}

pub async fn count_locations(pool: &Pool) -> Result<i64, RepoError> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM locations")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

/// Merge the keys present in `update` into `placeData`, leaving sibling keys
/// untouched, and stamp both write-time timestamps. The merge runs inside
/// SQLite as one statement, so the per-document write is atomic.
#[instrument(skip_all, fields(location_id = %id))]
pub async fn update_place_data(
    pool: &Pool,
    id: &str,
    update: &PlaceDataUpdate,
) -> Result<(), RepoError> {
    let patch = serde_json::to_string(update)?;
    let now = Utc::now();
    let result = sqlx::query(
        "UPDATE locations SET place_data = json_patch(place_data, ?), \
         updated_at = ?, place_data_updated_at = ? WHERE id = ?",
    )
    .bind(&patch)
    .bind(now)
    .bind(now)
    .bind(id)
    .execute(pool)
    .await
    .map_err(|source| RepoError::UpdateFailed {
        id: id.to_string(),
        source,
    })?;
    if result.rows_affected() == 0 {
        return Err(RepoError::NotFound(id.to_string()));
    }
    debug!(patch = %patch, "placeData merged");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn setup_pool() -> Pool {
        let pool = init_pool("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        pool
    }

    #[test]
    fn prepare_sqlite_url_requests_create_mode() {
        assert_eq!(prepare_sqlite_url("sqlite::memory:"), "sqlite::memory:");
        let td = tempfile::tempdir().unwrap();
        let path = td.path().join("nested/db.sqlite");
        let url = prepare_sqlite_url(&format!("sqlite://{}", path.display()));
        assert!(url.ends_with("db.sqlite?mode=rwc"));
        assert!(td.path().join("nested").exists());
    }

    #[tokio::test]
    async fn uncreatable_database_dir_surfaces_on_connect() {
        let td = tempfile::tempdir().unwrap();
        let blocker = td.path().join("blocker");
        std::fs::write(&blocker, b"not a dir").unwrap();
        let path = blocker.join("db.sqlite");

        let url = prepare_sqlite_url(&format!("sqlite://{}", path.display()));
        assert!(url.ends_with("blocker/db.sqlite?mode=rwc"));
        assert!(init_pool(&format!("sqlite://{}", path.display())).await.is_err());
    }

    #[tokio::test]
    async fn update_merges_without_clobbering_siblings() {
        let pool = setup_pool().await;
        upsert_location(
            &pool,
            "loc-1",
            "Splash Park",
            &json!({ "rating": 4.1, "openingHours": {"sat": "9-5"}, "photoUrls": ["old"] }),
        )
        .await
        .unwrap();

        let update = PlaceDataUpdate {
            photo_urls: Some(vec!["new-a".into(), "new-b".into()]),
            stored_photo_urls: Some(vec!["durable-a".into()]),
            ..Default::default()
        };
        update_place_data(&pool, "loc-1", &update).await.unwrap();

        let rec = get_location(&pool, "loc-1").await.unwrap();
        assert_eq!(rec.place_data.photo_urls, vec!["new-a", "new-b"]);
        assert_eq!(rec.place_data.stored_photo_urls, Some(vec!["durable-a".into()]));
        assert_eq!(rec.place_data.rating, Some(4.1));
        assert_eq!(rec.place_data.extra["openingHours"]["sat"], "9-5");
        assert!(rec.updated_at.is_some());
        assert_eq!(rec.updated_at, rec.place_data_updated_at);
    }

    #[tokio::test]
    async fn migrated_check_reads_stored_urls() {
        let pool = setup_pool().await;
        upsert_location(&pool, "a", "A", &json!({})).await.unwrap();
        upsert_location(&pool, "b", "B", &json!({ "storedPhotoUrls": [] })).await.unwrap();
        upsert_location(&pool, "c", "C", &json!({ "storedPhotoUrls": ["u1", "u2"] }))
            .await
            .unwrap();

        assert!(!is_already_migrated(&pool, "a").await.unwrap());
        assert!(!is_already_migrated(&pool, "b").await.unwrap());
        assert!(is_already_migrated(&pool, "c").await.unwrap());
        assert!(matches!(
            is_already_migrated(&pool, "missing").await,
            Err(RepoError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn missing_location_is_not_found() {
        let pool = setup_pool().await;
        assert!(matches!(
            get_location(&pool, "nope").await,
            Err(RepoError::NotFound(_))
        ));
        let err = update_place_data(&pool, "nope", &PlaceDataUpdate::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RepoError::NotFound(_)));
    }

    #[tokio::test]
    async fn scan_returns_catalog_order_and_upsert_merges() {
        let pool = setup_pool().await;
        for id in ["z", "a", "m"] {
            upsert_location(&pool, id, id, &json!({})).await.unwrap();
        }
        upsert_location(&pool, "a", "Renamed", &json!({ "rating": 3.0 }))
            .await
            .unwrap();

        let all = list_all_locations(&pool).await.unwrap();
        let ids: Vec<_> = all.iter().map(|l| l.id.as_str()).collect();
        assert_eq!(ids, vec!["z", "a", "m"]);
        assert_eq!(all[1].name, "Renamed");
        assert_eq!(all[1].place_data.rating, Some(3.0));
        assert_eq!(count_locations(&pool).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn upsert_rejects_non_object_documents() {
        let pool = setup_pool().await;
        let err = upsert_location(&pool, "x", "X", &json!([1, 2])).await.unwrap_err();
        assert!(matches!(err, RepoError::InvalidDocument(_)));
    }
}

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use serde_json::Value;
use std::path::PathBuf;
use tracing::{info, warn};

use location_photos::config;
use location_photos::db;
use location_photos::model::is_valid_location_id;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Seed or update location records from a JSON array file"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// JSON file: `[{"id": "...", "name": "...", "placeData": {...}}, ...]`
    #[arg(long)]
    input: PathBuf,
}

#[derive(Debug, Deserialize)]
struct ImportEntry {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(rename = "placeData", default)]
    place_data: Option<Value>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let database_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| cfg.default_database_url());
    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    let raw = tokio::fs::read_to_string(&args.input)
        .await
        .with_context(|| format!("failed to read {}", args.input.display()))?;
    let entries: Vec<ImportEntry> =
        serde_json::from_str(&raw).context("input must be a JSON array of locations")?;

    let empty = Value::Object(Default::default());
    let mut imported = 0usize;
    let mut rejected = 0usize;
    for entry in &entries {
        if !is_valid_location_id(&entry.id) {
            warn!(id = %entry.id, "skipping entry with invalid id");
            rejected += 1;
            continue;
        }
        let place_data = entry.place_data.as_ref().unwrap_or(&empty);
        match db::upsert_location(&pool, &entry.id, &entry.name, place_data).await {
            Ok(()) => imported += 1,
            Err(err) => {
                warn!(id = %entry.id, %err, "failed to import location");
                rejected += 1;
            }
        }
    }

    let total = db::count_locations(&pool).await?;
    info!(imported, rejected, catalog_size = total, "import finished");
    Ok(())
}

use anyhow::{bail, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

use location_photos::config;
use location_photos::db;
use location_photos::model::{is_valid_location_id, RunType};
use location_photos::pipeline::Pipeline;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Run the photo migration in the foreground and print the run summary"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Migrate only this location instead of the whole catalog
    #[arg(long)]
    location: Option<String>,

    /// Re-ingest even when the location already has stored photos
    #[arg(long)]
    force: bool,
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

    let pipeline = Pipeline::from_config(&cfg, pool)?;
    let summary = match args.location.as_deref() {
        Some(id) => {
            if !is_valid_location_id(id) {
                bail!("invalid location id: {id:?}");
            }
            info!(location_id = %id, force = args.force, "migrating single location");
            pipeline.run_location(id, args.force).await
        }
        None => {
            let total = db::count_locations(pipeline.pool()).await?;
            info!(total, force = args.force, "migrating whole catalog");
            pipeline.run_catalog(RunType::Manual, args.force).await
        }
    };

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

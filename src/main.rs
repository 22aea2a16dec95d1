use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use location_photos::api::{self, AppState};
use location_photos::auth::AdminAuth;
use location_photos::config;
use location_photos::db;
use location_photos::pipeline::Pipeline;
use location_photos::runner::TaskRunner;

#[derive(Debug, Parser)]
#[command(author, version, about = "Serve photo-migration triggers and run the schedule")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
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

    let pipeline = Arc::new(Pipeline::from_config(&cfg, pool)?);
    let runner = TaskRunner::new(pipeline);

    match cfg.schedule_interval() {
        Some(period) => {
            runner.spawn_schedule(period);
            info!(period_secs = period.as_secs(), "scheduled catalog runs enabled");
        }
        None => warn!("app.schedule_interval_minutes is 0; scheduled runs disabled"),
    }

    let app = api::router(AppState::new(runner, AdminAuth::new(cfg.admin.token.clone())));
    let listener = tokio::net::TcpListener::bind(&cfg.app.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", cfg.app.bind_addr))?;
    info!(addr = %cfg.app.bind_addr, "listening for triggers");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
        })
        .await?;
    Ok(())
}

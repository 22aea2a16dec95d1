//! Detached execution of pipeline runs.
//!
//! Triggers hand work to the runner and return immediately; the spawned
//! task's handle is given back but callers on the request path drop it.
//! Outcomes surface only through logs and the run-status record.
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

use crate::model::{RunSummary, RunType};
use crate::pipeline::Pipeline;

/// A run that has been started in the background.
#[derive(Debug)]
pub struct SpawnedRun {
    pub run_id: Uuid,
    pub handle: JoinHandle<RunSummary>,
}

#[derive(Clone)]
pub struct TaskRunner {
    pipeline: Arc<Pipeline>,
}

impl TaskRunner {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self { pipeline }
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    pub fn spawn_catalog_run(&self, run_type: RunType, force: bool) -> SpawnedRun {
        let run_id = Uuid::new_v4();
        let pipeline = self.pipeline.clone();
        let span = info_span!("catalog_run", %run_id, run_type = run_type.as_str());
        let handle = tokio::spawn(
            async move {
                info!("background catalog run started");
                pipeline.run_catalog(run_type, force).await
            }
            .instrument(span),
        );
        SpawnedRun { run_id, handle }
    }

    pub fn spawn_location_run(&self, location_id: String, force: bool) -> SpawnedRun {
        let run_id = Uuid::new_v4();
        let pipeline = self.pipeline.clone();
        let span = info_span!("location_run", %run_id, location_id = %location_id);
        let handle = tokio::spawn(
            async move {
                info!("background location run started");
                pipeline.run_location(&location_id, force).await
            }
            .instrument(span),
        );
        SpawnedRun { run_id, handle }
    }

    /// Scheduled whole-catalog runs every `period`, first one a full period
    /// after start. Scheduled runs do not overlap each other: a tick that
    /// arrives while the previous scheduled run is still going is skipped.
    /// Manual triggers are not serialized against them.
    pub fn spawn_schedule(&self, period: Duration) -> JoinHandle<()> {
        let pipeline = self.pipeline.clone();
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let run_id = Uuid::new_v4();
                let summary = pipeline
                    .run_catalog(RunType::Scheduled, false)
                    .instrument(info_span!("scheduled_run", %run_id))
                    .await;
                info!(
                    %run_id,
                    success = summary.success,
                    failed = summary.failed,
                    skipped = summary.skipped,
                    "scheduled run finished"
                );
            }
        })
    }
}

//! Background materialization jobs using apalis
//!
//! The entry path pushes a `MaterializeJob` after winning the pending claim
//! for a video; the worker pulls it and runs the pipeline. The job row in
//! `materialization_jobs` is the source of truth for progress, so the handler
//! always acks and failures are visible through `GET /jobs/{video_id}`.

use apalis::prelude::*;
use apalis_sql::postgres::PostgresStorage;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::materialize::{Materializer, Outcome};
use crate::services::error::{AppError, ResultExt};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaterializeJob {
    pub video_id: String,
    pub email: String,
}

/// Hands a job to whatever executes materializations out-of-band.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, job: MaterializeJob) -> Result<(), AppError>;
}

#[derive(Clone)]
pub struct ApalisDispatcher {
    storage: PostgresStorage<MaterializeJob>,
}

impl ApalisDispatcher {
    pub fn new(storage: PostgresStorage<MaterializeJob>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl Dispatcher for ApalisDispatcher {
    async fn dispatch(&self, job: MaterializeJob) -> Result<(), AppError> {
        let mut storage = self.storage.clone();
        storage.push(job).await.storage("Push materialize job")?;
        Ok(())
    }
}

/// Job handler - runs one materialization
async fn process_materialize_job(
    job: MaterializeJob,
    materializer: Data<Arc<Materializer>>,
) -> Result<(), Error> {
    match materializer.run(&job.video_id, &job.email).await {
        Ok(Outcome::Materialized { entry, credits }) => {
            tracing::info!(
                video_id = %job.video_id,
                total_comments = entry.total_comments,
                credits = ?credits,
                "materialize job complete"
            );
        }
        Ok(Outcome::Cached(_)) => {
            tracing::info!(video_id = %job.video_id, "materialize job found cached entry");
        }
        Ok(Outcome::Busy) => {
            tracing::info!(video_id = %job.video_id, "materialize job skipped, claim held elsewhere");
        }
        Err(e) => {
            tracing::error!(video_id = %job.video_id, error = %e, "materialize job failed");
        }
    }
    Ok(())
}

/// Start the materialization worker
pub async fn run_materialize_worker(
    storage: PostgresStorage<MaterializeJob>,
    materializer: Arc<Materializer>,
) {
    tracing::info!("materialize worker starting");

    let worker = WorkerBuilder::new("materialize-worker")
        .data(materializer)
        .backend(storage)
        .build_fn(process_materialize_job);

    if let Err(e) = Monitor::new().register(worker).run().await {
        tracing::error!(error = ?e, "materialize worker monitor failed");
    }
}

// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Job-claiming worker pool.
//!
//! Each worker loops: claim one job under the tenant concurrency caps,
//! drive the pipeline for it, release the lease. A worker that dies
//! mid-run simply stops renewing nothing — its lease lapses and the job
//! becomes claimable again; the restarted pipeline resumes from the
//! persisted event log.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::application::pipeline::Pipeline;
use crate::domain::run::RunState;
use crate::domain::store::Store;

pub struct WorkerPool {
    store: Arc<dyn Store>,
    pipeline: Arc<Pipeline>,
    poll: Duration,
    lease: Duration,
}

impl WorkerPool {
    pub fn new(
        store: Arc<dyn Store>,
        pipeline: Arc<Pipeline>,
        poll: Duration,
        lease: Duration,
    ) -> Self {
        Self { store, pipeline, poll, lease }
    }

    /// Spawn `workers` looping claim-and-run tasks.
    pub fn spawn(self: &Arc<Self>, workers: usize) -> Vec<JoinHandle<()>> {
        (0..workers)
            .map(|i| {
                let pool = Arc::clone(self);
                let worker_id = format!("worker-{i}");
                tokio::spawn(async move {
                    info!(worker_id = %worker_id, "worker started");
                    loop {
                        match pool.run_once(&worker_id).await {
                            Ok(Some(state)) => {
                                info!(worker_id = %worker_id, state = %state, "job finished");
                            }
                            Ok(None) => tokio::time::sleep(pool.poll).await,
                            Err(err) => {
                                error!(worker_id = %worker_id, error = %err, "worker iteration failed");
                                tokio::time::sleep(pool.poll).await;
                            }
                        }
                    }
                })
            })
            .collect()
    }

    /// Claim and process at most one job. Returns the run's final state,
    /// or `None` when nothing was claimable.
    pub async fn run_once(&self, worker_id: &str) -> anyhow::Result<Option<RunState>> {
        let Some(job) = self.store.claim_job(worker_id, self.lease).await? else {
            return Ok(None);
        };

        let mission = match self.store.get_mission(&job.run_id).await? {
            Some(mission) => mission,
            None => {
                warn!(job_id = %job.job_id, run_id = %job.run_id, "job without mission input");
                self.store.release_job(&job.job_id, false).await?;
                return Ok(None);
            }
        };

        // the lease must be released on every exit path, panics included
        let outcome = AssertUnwindSafe(self.pipeline.run(mission)).catch_unwind().await;
        let (ok, state, err_msg) = match &outcome {
            Ok(Ok(state)) => (true, Some(*state), None),
            Ok(Err(err)) => (false, None, Some(err.to_string())),
            Err(_) => (false, None, Some("pipeline panicked".to_string())),
        };

        self.store.release_job(&job.job_id, ok).await?;
        if let Some(message) = err_msg {
            error!(job_id = %job.job_id, run_id = %job.run_id, error = %message, "job failed");
            self.store
                .append_audit(json!({
                    "type": "worker_job_failed",
                    "job_id": job.job_id,
                    "run_id": job.run_id,
                    "worker_id": worker_id,
                    "error": message,
                }))
                .await?;
        }

        match outcome {
            Ok(Ok(_)) => Ok(state),
            Ok(Err(err)) => Err(err),
            Err(payload) => std::panic::resume_unwind(payload),
        }
    }
}

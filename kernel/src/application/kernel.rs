// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Kernel facade: the operations an interface layer (HTTP, CLI, tests)
//! calls. Wires the pipeline, streamer, rate limiter and worker pool over
//! one store and one stream hub.

use std::sync::Arc;

use anyhow::Context as _;
use serde_json::{json, Value};

use crate::application::pipeline::Pipeline;
use crate::application::rate_limiter::RateLimiter;
use crate::application::streamer::{Streamer, Subscription};
use crate::application::worker::WorkerPool;
use crate::domain::approval::{Approval, ApprovalDecision};
use crate::domain::event::{ChainVerification, Event};
use crate::domain::ports::{ContextProvider, PlannerAdapter, RegistryProvider, ToolAdapter};
use crate::domain::run::{MissionInput, Run, RunFilter, RunId, RunState, TaskId};
use crate::domain::store::{Store, StoreError};
use crate::infrastructure::config::KernelConfig;
use crate::infrastructure::stream_hub::StreamHub;

/// Caller-facing mission submission; identity comes from the (external)
/// auth layer.
#[derive(Debug, Clone)]
pub struct MissionDraft {
    pub tenant_id: String,
    pub org_id: Option<String>,
    pub user_id: Option<String>,
    pub roles: Vec<String>,
    pub user_message: String,
    pub task_id: Option<TaskId>,
    pub title: Option<String>,
    pub tags: Vec<String>,
}

pub struct Kernel {
    store: Arc<dyn Store>,
    hub: Arc<StreamHub>,
    registry_provider: Arc<dyn RegistryProvider>,
    pipeline: Arc<Pipeline>,
    streamer: Streamer,
    rate_limiter: RateLimiter,
    config: KernelConfig,
}

impl Kernel {
    pub fn new(
        store: Arc<dyn Store>,
        registry_provider: Arc<dyn RegistryProvider>,
        planner: Arc<dyn PlannerAdapter>,
        context: Arc<dyn ContextProvider>,
        tools: Arc<dyn ToolAdapter>,
        config: KernelConfig,
    ) -> Self {
        let hub = Arc::new(StreamHub::default());
        let pipeline = Arc::new(Pipeline::new(
            Arc::clone(&store),
            Arc::clone(&hub),
            Arc::clone(&registry_provider),
            planner,
            context,
            tools,
            config.step_parallelism,
            config.rate_limit_window_s,
            config.approval_timeout,
        ));
        let streamer =
            Streamer::new(Arc::clone(&store), Arc::clone(&hub), config.heartbeat_interval);
        let rate_limiter = RateLimiter::new(Arc::clone(&store), config.rate_limit_window_s);
        Self { store, hub, registry_provider, pipeline, streamer, rate_limiter, config }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn hub(&self) -> &Arc<StreamHub> {
        &self.hub
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    /// Accept a mission: rate-limit the caller, create the run, queue the
    /// job. Workers pick it up from there.
    pub async fn submit_mission(&self, draft: MissionDraft) -> anyhow::Result<(TaskId, RunId)> {
        let mission = MissionInput {
            task_id: draft.task_id.unwrap_or_else(TaskId::generate),
            tenant_id: draft.tenant_id,
            org_id: draft.org_id,
            user_id: draft.user_id,
            roles: draft.roles,
            user_message: draft.user_message,
            title: draft.title,
            tags: draft.tags,
        };
        mission.validate().map_err(|e| anyhow::anyhow!("invalid mission: {e}"))?;

        let registry =
            self.registry_provider.load_for(&mission).context("loading registry for mission")?;
        self.rate_limiter.check(&mission.run_context(), registry.limits()).await?;

        let run = self.store.create_run(&mission).await?;
        self.store.enqueue_job(&run.run_id, &mission.tenant_id).await?;
        Ok((mission.task_id, run.run_id))
    }

    /// Worker pool over this kernel's pipeline; lease covers several poll
    /// intervals so healthy workers never lose a claim.
    pub fn worker_pool(&self) -> Arc<WorkerPool> {
        Arc::new(WorkerPool::new(
            Arc::clone(&self.store),
            Arc::clone(&self.pipeline),
            self.config.worker_poll,
            self.config.worker_poll * 200,
        ))
    }

    pub async fn subscribe(
        &self,
        run_id: &RunId,
        since_seq: u64,
    ) -> Result<Subscription, StoreError> {
        self.streamer.subscribe(run_id, since_seq).await
    }

    pub async fn approve(
        &self,
        run_id: &RunId,
        decision: ApprovalDecision,
    ) -> Result<Approval, StoreError> {
        self.store.decide_approval(run_id, decision).await
    }

    /// External cancellation; the pipeline honors it at the next safe
    /// boundary.
    pub async fn cancel(&self, run_id: &RunId) -> Result<(), StoreError> {
        self.store.set_run_state(run_id, RunState::Canceled).await
    }

    pub async fn verify_chain(&self, run_id: &RunId) -> Result<ChainVerification, StoreError> {
        self.store.verify_chain(run_id).await
    }

    pub async fn get_run(&self, run_id: &RunId) -> Result<Option<Run>, StoreError> {
        self.store.get_run(run_id).await
    }

    pub async fn list_runs(
        &self,
        tenant_id: &str,
        filter: &RunFilter,
    ) -> Result<Vec<Run>, StoreError> {
        self.store.list_runs(tenant_id, filter).await
    }

    pub async fn get_events(
        &self,
        run_id: &RunId,
        since_seq: u64,
    ) -> Result<Vec<Event>, StoreError> {
        self.store.get_events(run_id, since_seq).await
    }

    pub async fn update_run_metadata(
        &self,
        run_id: &RunId,
        title: Option<String>,
        tags: Option<Vec<String>>,
    ) -> Result<Run, StoreError> {
        self.store.update_run_metadata(run_id, title, tags).await
    }

    pub async fn list_approvals(
        &self,
        tenant_id: &str,
        pending_only: bool,
    ) -> Result<Vec<Approval>, StoreError> {
        self.store.list_approvals(tenant_id, pending_only).await
    }

    /// Full run bundle for audit export.
    pub async fn export_run(&self, run_id: &RunId) -> Result<Value, StoreError> {
        let run = self
            .store
            .get_run(run_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("run {run_id}")))?;
        let events = self.store.get_events(run_id, 0).await?;
        Ok(json!({
            "run": serde_json::to_value(&run)?,
            "events": serde_json::to_value(&events)?,
        }))
    }
}

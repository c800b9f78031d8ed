// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Persistence contract.
//!
//! The store is the only shared mutable state in the kernel. Two backends
//! implement this trait: an in-process map store for dev/tests and a
//! Postgres store for production. Both guarantee:
//!
//! - `append_event` linearizes per run and allocates a dense `seq`
//! - `consume_budget` is an atomic check-and-increment (no partial debits)
//! - `claim_job` honors per-tenant concurrency slots and claim leases
//! - `decide_approval` transitions a pending approval exactly once

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::domain::approval::{Approval, ApprovalDecision};
use crate::domain::event::{ChainVerification, Event, EventPayload};
use crate::domain::job::Job;
use crate::domain::plan::StepResult;
use crate::domain::registry::TenantLimits;
use crate::domain::run::{BudgetDelta, BudgetUsed, MissionInput, Run, RunFilter, RunId, RunState};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("budget exceeded: {metric} limit {limit}")]
    BudgetExceeded { metric: &'static str, limit: u64 },

    #[error("rate limit exceeded for {scope}:{scope_id}, resets in {reset_in_s}s")]
    RateLimited { scope: RateScope, scope_id: String, reset_in_s: u64 },

    #[error("audit key registry: {0}")]
    KeyRegistry(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("backend error: {0}")]
    Backend(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StoreError::NotFound("row not found".into()),
            other => StoreError::Backend(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Scope of a fixed rate-limit window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateScope {
    Tenant,
    Org,
    User,
}

impl RateScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tenant => "tenant",
            Self::Org => "org",
            Self::User => "user",
        }
    }
}

impl std::fmt::Display for RateScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Remaining quota after a successful rate-limit hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateStatus {
    pub remaining: u64,
    pub reset_in_s: u64,
}

#[async_trait]
pub trait Store: Send + Sync {
    // ------------------------------------------------------------------
    // Runs
    // ------------------------------------------------------------------

    /// Create the run for a mission, or load it when the task was already
    /// submitted (mission submission is idempotent per task id).
    async fn create_run(&self, mission: &MissionInput) -> Result<Run, StoreError>;

    async fn get_run(&self, run_id: &RunId) -> Result<Option<Run>, StoreError>;

    async fn set_run_state(&self, run_id: &RunId, state: RunState) -> Result<(), StoreError>;

    async fn update_run_metadata(
        &self,
        run_id: &RunId,
        title: Option<String>,
        tags: Option<Vec<String>>,
    ) -> Result<Run, StoreError>;

    async fn list_runs(&self, tenant_id: &str, filter: &RunFilter) -> Result<Vec<Run>, StoreError>;

    /// The mission input persisted at submission; needed to restart a run.
    async fn get_mission(&self, run_id: &RunId) -> Result<Option<MissionInput>, StoreError>;

    // ------------------------------------------------------------------
    // Event log
    // ------------------------------------------------------------------

    /// Atomically allocate `seq = last_seq + 1`, extend the hash chain,
    /// persist, and bump `last_seq`. Fails with `Conflict` when the run is
    /// gone or a concurrent append races.
    async fn append_event(&self, run_id: &RunId, payload: EventPayload) -> Result<Event, StoreError>;

    /// Events with `seq > since_seq` in ascending order.
    async fn get_events(&self, run_id: &RunId, since_seq: u64) -> Result<Vec<Event>, StoreError>;

    /// Recompute the chain using each event's recorded key id.
    async fn verify_chain(&self, run_id: &RunId) -> Result<ChainVerification, StoreError>;

    // ------------------------------------------------------------------
    // Step cache (side-effect deduplication)
    // ------------------------------------------------------------------

    async fn step_cache_get(&self, idem_key: &str) -> Result<Option<StepResult>, StoreError>;

    async fn step_cache_put(&self, idem_key: &str, result: &StepResult) -> Result<(), StoreError>;

    // ------------------------------------------------------------------
    // Budgets
    // ------------------------------------------------------------------

    /// Atomic check-and-increment against tenant limits. On
    /// `BudgetExceeded` no counter moves.
    async fn consume_budget(
        &self,
        run_id: &RunId,
        delta: &BudgetDelta,
        limits: &TenantLimits,
    ) -> Result<BudgetUsed, StoreError>;

    // ------------------------------------------------------------------
    // Jobs
    // ------------------------------------------------------------------

    async fn enqueue_job(&self, run_id: &RunId, tenant_id: &str) -> Result<Job, StoreError>;

    /// Claim one claimable job under the per-tenant concurrency cap, taking
    /// a lease of `lease`. Returns `None` when nothing is claimable.
    async fn claim_job(&self, worker_id: &str, lease: Duration) -> Result<Option<Job>, StoreError>;

    /// Release a claimed job (done on success, failed otherwise) and free
    /// its tenant slot.
    async fn release_job(&self, job_id: &str, ok: bool) -> Result<(), StoreError>;

    // ------------------------------------------------------------------
    // Approvals
    // ------------------------------------------------------------------

    async fn create_approval(&self, run_id: &RunId) -> Result<Approval, StoreError>;

    async fn get_approval(&self, run_id: &RunId) -> Result<Option<Approval>, StoreError>;

    /// Exactly-once transition of the pending approval; `Conflict` when the
    /// approval was already decided or does not exist.
    async fn decide_approval(
        &self,
        run_id: &RunId,
        decision: ApprovalDecision,
    ) -> Result<Approval, StoreError>;

    async fn list_approvals(
        &self,
        tenant_id: &str,
        pending_only: bool,
    ) -> Result<Vec<Approval>, StoreError>;

    // ------------------------------------------------------------------
    // Rate limits
    // ------------------------------------------------------------------

    /// Increment the fixed-window counter for a scope; errors with
    /// `RateLimited` when the increment crosses the limit.
    async fn rate_hit(
        &self,
        scope: RateScope,
        scope_id: &str,
        limit: u64,
        window_s: u64,
    ) -> Result<RateStatus, StoreError>;

    // ------------------------------------------------------------------
    // Projections & audit
    // ------------------------------------------------------------------

    /// Best-effort compact projection for fast listings.
    async fn snapshot(&self, run_id: &RunId) -> Result<(), StoreError>;

    async fn append_audit(&self, record: Value) -> Result<(), StoreError>;
}

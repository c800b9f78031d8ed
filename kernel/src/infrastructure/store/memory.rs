// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! In-process map-backed store for development and tests.
//!
//! One mutex guards all state: every contract operation that must be
//! atomic (seq allocation, budget check-and-increment, approval decisions,
//! job claims) runs entirely under the lock.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};

use crate::domain::approval::{Approval, ApprovalDecision, ApprovalState};
use crate::domain::event::{ChainVerification, Event, EventPayload};
use crate::domain::job::{Job, JobState};
use crate::domain::plan::StepResult;
use crate::domain::registry::TenantLimits;
use crate::domain::run::{
    BudgetDelta, BudgetUsed, MissionInput, Run, RunFilter, RunId, RunState,
};
use crate::domain::store::{RateScope, RateStatus, Store, StoreError};
use crate::infrastructure::canonical::canonical_json;
use crate::infrastructure::hash_chain::{verify_events, HashChain, KeyRegistry};

#[derive(Default)]
struct Inner {
    runs: HashMap<RunId, Run>,
    missions: HashMap<RunId, MissionInput>,
    events: HashMap<RunId, Vec<Event>>,
    step_cache: HashMap<String, StepResult>,
    approvals: HashMap<RunId, Approval>,
    jobs: Vec<Job>,
    tenant_active: HashMap<String, u32>,
    job_tenant: HashMap<String, String>,
    rate: HashMap<(&'static str, String, i64), u64>,
    snapshots: HashMap<RunId, Value>,
    audit: Vec<Value>,
}

pub struct InMemoryStore {
    chain: HashChain,
    tenant_max_concurrency: u32,
    snapshot_every: u64,
    inner: Mutex<Inner>,
}

impl InMemoryStore {
    pub fn new(keyring: KeyRegistry) -> Self {
        Self::with_limits(keyring, 2, 25)
    }

    pub fn with_limits(keyring: KeyRegistry, tenant_max_concurrency: u32, snapshot_every: u64) -> Self {
        Self {
            chain: HashChain::new(keyring),
            tenant_max_concurrency,
            snapshot_every: snapshot_every.max(1),
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn chain(&self) -> &HashChain {
        &self.chain
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>, StoreError> {
        self.inner.lock().map_err(|_| StoreError::Backend("store mutex poisoned".into()))
    }

    fn write_snapshot(inner: &mut Inner, run_id: &RunId) {
        if let Some(run) = inner.runs.get(run_id) {
            inner.snapshots.insert(
                run_id.clone(),
                json!({
                    "run_id": run.run_id,
                    "tenant_id": run.tenant_id,
                    "state": run.state,
                    "title": run.title,
                    "tags": run.tags,
                    "budget_used": run.budget_used,
                    "last_seq": run.last_seq,
                    "updated_at": run.updated_at,
                }),
            );
        }
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn create_run(&self, mission: &MissionInput) -> Result<Run, StoreError> {
        mission.validate().map_err(StoreError::Conflict)?;
        let mut inner = self.lock()?;
        if let Some(existing) = inner.runs.values().find(|r| r.task_id == mission.task_id) {
            return Ok(existing.clone());
        }
        let now = Utc::now();
        let run_id = RunId::for_task(&mission.task_id);
        let run = Run {
            run_id: run_id.clone(),
            task_id: mission.task_id.clone(),
            tenant_id: mission.tenant_id.clone(),
            org_id: mission.org_id.clone(),
            user_id: mission.user_id.clone(),
            state: RunState::Submitted,
            title: mission.title.clone(),
            tags: mission.tags.clone(),
            budget_used: BudgetUsed::default(),
            last_seq: 0,
            created_at: now,
            updated_at: now,
        };
        inner.runs.insert(run_id.clone(), run.clone());
        inner.missions.insert(run_id.clone(), mission.clone());
        inner.events.entry(run_id).or_default();
        Ok(run)
    }

    async fn get_run(&self, run_id: &RunId) -> Result<Option<Run>, StoreError> {
        Ok(self.lock()?.runs.get(run_id).cloned())
    }

    async fn set_run_state(&self, run_id: &RunId, state: RunState) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let run = inner
            .runs
            .get_mut(run_id)
            .ok_or_else(|| StoreError::NotFound(format!("run {run_id}")))?;
        run.state = state;
        run.updated_at = Utc::now();
        Ok(())
    }

    async fn update_run_metadata(
        &self,
        run_id: &RunId,
        title: Option<String>,
        tags: Option<Vec<String>>,
    ) -> Result<Run, StoreError> {
        let mut inner = self.lock()?;
        let run = inner
            .runs
            .get_mut(run_id)
            .ok_or_else(|| StoreError::NotFound(format!("run {run_id}")))?;
        if let Some(title) = title {
            run.title = Some(title);
        }
        if let Some(tags) = tags {
            run.tags = tags;
        }
        run.updated_at = Utc::now();
        let run = run.clone();
        Self::write_snapshot(&mut inner, run_id);
        Ok(run)
    }

    async fn list_runs(&self, tenant_id: &str, filter: &RunFilter) -> Result<Vec<Run>, StoreError> {
        let inner = self.lock()?;
        let mut runs: Vec<Run> = inner
            .runs
            .values()
            .filter(|r| r.tenant_id == tenant_id)
            .filter(|r| filter.state.map(|s| r.state == s).unwrap_or(true))
            .filter(|r| filter.tag.as_ref().map(|t| r.tags.contains(t)).unwrap_or(true))
            .filter(|r| {
                filter
                    .query
                    .as_ref()
                    .map(|q| {
                        r.run_id.as_str().contains(q.as_str())
                            || r.task_id.as_str().contains(q.as_str())
                            || r.title.as_deref().map(|t| t.contains(q.as_str())).unwrap_or(false)
                    })
                    .unwrap_or(true)
            })
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(runs.into_iter().skip(filter.offset).take(filter.effective_limit()).collect())
    }

    async fn get_mission(&self, run_id: &RunId) -> Result<Option<MissionInput>, StoreError> {
        Ok(self.lock()?.missions.get(run_id).cloned())
    }

    async fn append_event(&self, run_id: &RunId, payload: EventPayload) -> Result<Event, StoreError> {
        let mut inner = self.lock()?;
        let run = inner
            .runs
            .get_mut(run_id)
            .ok_or_else(|| StoreError::Conflict(format!("run {run_id} no longer exists")))?;
        let seq = run.last_seq + 1;
        run.last_seq = seq;
        run.updated_at = Utc::now();

        let mut value = serde_json::to_value(&payload)?;
        value["_seq"] = json!(seq);
        let canonical = canonical_json(&value);
        let prev_hash = inner
            .events
            .get(run_id)
            .and_then(|evs| evs.last())
            .map(|e| e.hash.clone())
            .unwrap_or_default();
        let (hash, key_id) = self
            .chain
            .sign(&prev_hash, &canonical)
            .map_err(|e| StoreError::KeyRegistry(e.to_string()))?;

        let event = Event { seq, ts: Utc::now(), canonical, prev_hash, hash, key_id, payload };
        inner.events.entry(run_id.clone()).or_default().push(event.clone());

        if seq % self.snapshot_every == 0 {
            Self::write_snapshot(&mut inner, run_id);
        }
        Ok(event)
    }

    async fn get_events(&self, run_id: &RunId, since_seq: u64) -> Result<Vec<Event>, StoreError> {
        let inner = self.lock()?;
        Ok(inner
            .events
            .get(run_id)
            .map(|evs| evs.iter().filter(|e| e.seq > since_seq).cloned().collect())
            .unwrap_or_default())
    }

    async fn verify_chain(&self, run_id: &RunId) -> Result<ChainVerification, StoreError> {
        let events = self.get_events(run_id, 0).await?;
        verify_events(&self.chain, &events).map_err(|e| StoreError::KeyRegistry(e.to_string()))
    }

    async fn step_cache_get(&self, idem_key: &str) -> Result<Option<StepResult>, StoreError> {
        Ok(self.lock()?.step_cache.get(idem_key).cloned())
    }

    async fn step_cache_put(&self, idem_key: &str, result: &StepResult) -> Result<(), StoreError> {
        self.lock()?.step_cache.insert(idem_key.to_string(), result.clone());
        Ok(())
    }

    async fn consume_budget(
        &self,
        run_id: &RunId,
        delta: &BudgetDelta,
        limits: &TenantLimits,
    ) -> Result<BudgetUsed, StoreError> {
        let mut inner = self.lock()?;
        let run = inner
            .runs
            .get_mut(run_id)
            .ok_or_else(|| StoreError::NotFound(format!("run {run_id}")))?;

        let tool_calls = run.budget_used.tool_calls + delta.tool_calls;
        let llm_calls = run.budget_used.llm_calls + delta.llm_calls;
        let cost_units = run.budget_used.cost_units + delta.cost_units;
        if tool_calls > limits.max_tool_calls {
            return Err(StoreError::BudgetExceeded {
                metric: "max_tool_calls",
                limit: limits.max_tool_calls,
            });
        }
        if llm_calls > limits.max_llm_calls {
            return Err(StoreError::BudgetExceeded {
                metric: "max_llm_calls",
                limit: limits.max_llm_calls,
            });
        }
        if cost_units > limits.max_cost_units {
            return Err(StoreError::BudgetExceeded {
                metric: "max_cost_units",
                limit: limits.max_cost_units,
            });
        }
        run.budget_used = BudgetUsed { tool_calls, llm_calls, cost_units };
        run.updated_at = Utc::now();
        Ok(run.budget_used)
    }

    async fn enqueue_job(&self, run_id: &RunId, tenant_id: &str) -> Result<Job, StoreError> {
        let job = Job::queued(run_id, tenant_id);
        self.lock()?.jobs.push(job.clone());
        Ok(job)
    }

    async fn claim_job(&self, _worker_id: &str, lease: Duration) -> Result<Option<Job>, StoreError> {
        let mut inner = self.lock()?;
        let now = Utc::now();
        let max = self.tenant_max_concurrency;

        let mut pick = None;
        for (idx, job) in inner.jobs.iter().enumerate() {
            if !job.claimable(now) {
                continue;
            }
            let active = inner.tenant_active.get(&job.tenant_id).copied().unwrap_or(0);
            // an expired claim already holds its slot; only fresh claims
            // need a free one
            let needs_slot = job.state == JobState::Queued;
            if needs_slot && active >= max {
                continue;
            }
            pick = Some((idx, needs_slot));
            break;
        }

        let Some((idx, needs_slot)) = pick else {
            return Ok(None);
        };
        let tenant_id = inner.jobs[idx].tenant_id.clone();
        if needs_slot {
            *inner.tenant_active.entry(tenant_id.clone()).or_insert(0) += 1;
        }
        let job = &mut inner.jobs[idx];
        job.state = JobState::Claimed;
        job.claim_until =
            Some(now + chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::seconds(60)));
        job.attempts += 1;
        let job = job.clone();
        inner.job_tenant.insert(job.job_id.clone(), tenant_id);
        Ok(Some(job))
    }

    async fn release_job(&self, job_id: &str, ok: bool) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let job = inner
            .jobs
            .iter_mut()
            .find(|j| j.job_id == job_id)
            .ok_or_else(|| StoreError::NotFound(format!("job {job_id}")))?;
        job.state = if ok { JobState::Done } else { JobState::Failed };
        job.claim_until = None;
        if let Some(tenant_id) = inner.job_tenant.remove(job_id) {
            if let Some(active) = inner.tenant_active.get_mut(&tenant_id) {
                *active = active.saturating_sub(1);
            }
        }
        Ok(())
    }

    async fn create_approval(&self, run_id: &RunId) -> Result<Approval, StoreError> {
        let mut inner = self.lock()?;
        if !inner.runs.contains_key(run_id) {
            return Err(StoreError::NotFound(format!("run {run_id}")));
        }
        // one approval per run: a decided approval survives restarts
        if let Some(existing) = inner.approvals.get(run_id) {
            return Ok(existing.clone());
        }
        let approval = Approval::pending(run_id);
        inner.approvals.insert(run_id.clone(), approval.clone());
        Ok(approval)
    }

    async fn get_approval(&self, run_id: &RunId) -> Result<Option<Approval>, StoreError> {
        Ok(self.lock()?.approvals.get(run_id).cloned())
    }

    async fn decide_approval(
        &self,
        run_id: &RunId,
        decision: ApprovalDecision,
    ) -> Result<Approval, StoreError> {
        let mut inner = self.lock()?;
        let approval = inner
            .approvals
            .get_mut(run_id)
            .ok_or_else(|| StoreError::NotFound(format!("approval for run {run_id}")))?;
        if !approval.is_pending() {
            return Err(StoreError::Conflict(format!("approval for run {run_id} already decided")));
        }
        approval.state =
            if decision.approved { ApprovalState::Approved } else { ApprovalState::Denied };
        approval.decided_at = Some(Utc::now());
        approval.by = decision.by;
        approval.reason = decision.reason;
        Ok(approval.clone())
    }

    async fn list_approvals(
        &self,
        tenant_id: &str,
        pending_only: bool,
    ) -> Result<Vec<Approval>, StoreError> {
        let inner = self.lock()?;
        let mut out: Vec<Approval> = inner
            .approvals
            .values()
            .filter(|a| {
                inner.runs.get(&a.run_id).map(|r| r.tenant_id == tenant_id).unwrap_or(false)
            })
            .filter(|a| !pending_only || a.is_pending())
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(out)
    }

    async fn rate_hit(
        &self,
        scope: RateScope,
        scope_id: &str,
        limit: u64,
        window_s: u64,
    ) -> Result<RateStatus, StoreError> {
        let mut inner = self.lock()?;
        let now = Utc::now().timestamp();
        let window_start = now - now.rem_euclid(window_s as i64);
        let key = (scope.as_str(), scope_id.to_string(), window_start);
        let count = inner.rate.entry(key).or_insert(0);
        *count += 1;
        let reset_in_s = ((window_start + window_s as i64) - now).max(0) as u64;
        if *count > limit {
            return Err(StoreError::RateLimited {
                scope,
                scope_id: scope_id.to_string(),
                reset_in_s,
            });
        }
        Ok(RateStatus { remaining: limit - *count, reset_in_s })
    }

    async fn snapshot(&self, run_id: &RunId) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        Self::write_snapshot(&mut inner, run_id);
        Ok(())
    }

    async fn append_audit(&self, record: Value) -> Result<(), StoreError> {
        self.lock()?.audit.push(record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::run::TaskId;

    fn store() -> InMemoryStore {
        InMemoryStore::new(KeyRegistry::single("test_secret"))
    }

    fn mission(task: &str, tenant: &str) -> MissionInput {
        MissionInput {
            task_id: TaskId(task.into()),
            tenant_id: tenant.into(),
            org_id: None,
            user_id: None,
            roles: vec!["support_agent".into()],
            user_message: "refund please".into(),
            title: None,
            tags: vec![],
        }
    }

    #[tokio::test]
    async fn seq_is_dense_and_chain_verifies() {
        let store = store();
        let run = store.create_run(&mission("t1", "tenant_demo")).await.unwrap();
        for i in 0..5 {
            store
                .append_event(
                    &run.run_id,
                    EventPayload::status(&run.task_id, &run.run_id, RunState::Working, format!("e{i}")),
                )
                .await
                .unwrap();
        }
        let events = store.get_events(&run.run_id, 0).await.unwrap();
        let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
        assert!(store.verify_chain(&run.run_id).await.unwrap().ok);
    }

    #[tokio::test]
    async fn tampering_with_a_stored_event_breaks_verification() {
        let store = store();
        let run = store.create_run(&mission("t1", "tenant_demo")).await.unwrap();
        for i in 0..3 {
            store
                .append_event(
                    &run.run_id,
                    EventPayload::status(&run.task_id, &run.run_id, RunState::Working, format!("e{i}")),
                )
                .await
                .unwrap();
        }
        {
            let mut inner = store.inner.lock().unwrap();
            let events = inner.events.get_mut(&run.run_id).unwrap();
            events[1].canonical = events[1].canonical.replace("e1", "forged");
        }
        let verdict = store.verify_chain(&run.run_id).await.unwrap();
        assert!(!verdict.ok);
        assert_eq!(verdict.broken_at, Some(2));
    }

    #[tokio::test]
    async fn budget_rejection_does_not_increment() {
        let store = store();
        let run = store.create_run(&mission("t1", "tenant_demo")).await.unwrap();
        let limits = TenantLimits { max_tool_calls: 1, ..Default::default() };

        store.consume_budget(&run.run_id, &BudgetDelta::tool_call(1), &limits).await.unwrap();
        let err = store
            .consume_budget(&run.run_id, &BudgetDelta::tool_call(1), &limits)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::BudgetExceeded { metric: "max_tool_calls", .. }));

        let run = store.get_run(&run.run_id).await.unwrap().unwrap();
        assert_eq!(run.budget_used.tool_calls, 1);
        assert_eq!(run.budget_used.cost_units, 1);
    }

    #[tokio::test]
    async fn tenant_concurrency_caps_claims() {
        let store = InMemoryStore::with_limits(KeyRegistry::single("s"), 1, 25);
        let a = store.create_run(&mission("t1", "tenant_demo")).await.unwrap();
        let b = store.create_run(&mission("t2", "tenant_demo")).await.unwrap();
        store.enqueue_job(&a.run_id, "tenant_demo").await.unwrap();
        store.enqueue_job(&b.run_id, "tenant_demo").await.unwrap();

        let lease = Duration::from_secs(30);
        let first = store.claim_job("w1", lease).await.unwrap().unwrap();
        assert!(store.claim_job("w2", lease).await.unwrap().is_none());

        store.release_job(&first.job_id, true).await.unwrap();
        let second = store.claim_job("w2", lease).await.unwrap().unwrap();
        assert_eq!(second.run_id, b.run_id);
    }

    #[tokio::test]
    async fn expired_lease_makes_job_reclaimable() {
        let store = InMemoryStore::with_limits(KeyRegistry::single("s"), 1, 25);
        let run = store.create_run(&mission("t1", "tenant_demo")).await.unwrap();
        store.enqueue_job(&run.run_id, "tenant_demo").await.unwrap();

        let crashed = store.claim_job("w1", Duration::from_millis(0)).await.unwrap().unwrap();
        // lease of zero expires immediately; another worker picks it up
        tokio::time::sleep(Duration::from_millis(5)).await;
        let reclaimed = store.claim_job("w2", Duration::from_secs(30)).await.unwrap().unwrap();
        assert_eq!(reclaimed.job_id, crashed.job_id);
        assert_eq!(reclaimed.attempts, 2);
    }

    #[tokio::test]
    async fn approval_decides_exactly_once() {
        let store = store();
        let run = store.create_run(&mission("t1", "tenant_demo")).await.unwrap();
        store.create_approval(&run.run_id).await.unwrap();

        store.decide_approval(&run.run_id, ApprovalDecision::approved_by("ops")).await.unwrap();
        let err = store
            .decide_approval(&run.run_id, ApprovalDecision::denied_by("ops", "late"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn rate_window_rejects_over_limit() {
        let store = store();
        store.rate_hit(RateScope::Tenant, "tenant_demo", 2, 60).await.unwrap();
        store.rate_hit(RateScope::Tenant, "tenant_demo", 2, 60).await.unwrap();
        let err = store.rate_hit(RateScope::Tenant, "tenant_demo", 2, 60).await.unwrap_err();
        assert!(matches!(err, StoreError::RateLimited { .. }));
        // other scopes are unaffected
        store.rate_hit(RateScope::User, "u1", 2, 60).await.unwrap();
    }
}

// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! PostgreSQL store backend.
//!
//! Event appends run inside a transaction that locks the run row, so seq
//! allocation is serialized per run and the unique `(run_id, seq)` index
//! turns any race into a conflict instead of a gap. Budget debits use
//! `SELECT … FOR UPDATE`; job claims use `FOR UPDATE SKIP LOCKED` plus
//! per-tenant advisory lock slots; list projections are materialized views
//! refreshed concurrently by a backing-off scheduler, never inside a
//! transaction.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Row};
use tracing::{debug, warn};

use crate::domain::approval::{Approval, ApprovalDecision, ApprovalState};
use crate::domain::event::{ChainVerification, Event, EventPayload};
use crate::domain::job::{Job, JobState};
use crate::domain::plan::StepResult;
use crate::domain::registry::TenantLimits;
use crate::domain::run::{
    BudgetDelta, BudgetUsed, MissionInput, Run, RunFilter, RunId, RunState, TaskId,
};
use crate::domain::store::{RateScope, RateStatus, Store, StoreError};
use crate::infrastructure::canonical::{canonical_json, sha256_hex};
use crate::infrastructure::hash_chain::{verify_events, HashChain, KeyRegistry};

const INIT_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS runs (
  run_id TEXT PRIMARY KEY,
  task_id TEXT UNIQUE NOT NULL,
  tenant_id TEXT NOT NULL,
  org_id TEXT,
  user_id TEXT,
  state TEXT NOT NULL DEFAULT 'submitted',
  title TEXT,
  tags JSONB NOT NULL DEFAULT '[]'::jsonb,
  mission JSONB,
  last_seq BIGINT NOT NULL DEFAULT 0,
  created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
  updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS run_events (
  run_id TEXT NOT NULL REFERENCES runs(run_id) ON DELETE CASCADE,
  seq BIGINT NOT NULL,
  ts TIMESTAMPTZ NOT NULL DEFAULT now(),
  canonical TEXT NOT NULL,
  prev_hash TEXT NOT NULL,
  hash TEXT NOT NULL,
  key_id TEXT NOT NULL,
  payload JSONB NOT NULL,
  PRIMARY KEY (run_id, seq)
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_run_events_run_seq ON run_events(run_id, seq);

CREATE TABLE IF NOT EXISTS budget (
  run_id TEXT PRIMARY KEY REFERENCES runs(run_id) ON DELETE CASCADE,
  tool_calls BIGINT NOT NULL DEFAULT 0,
  llm_calls BIGINT NOT NULL DEFAULT 0,
  cost_units BIGINT NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS step_cache (
  idem_key TEXT PRIMARY KEY,
  payload JSONB NOT NULL,
  created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS approvals (
  approval_id TEXT PRIMARY KEY,
  run_id TEXT UNIQUE NOT NULL REFERENCES runs(run_id) ON DELETE CASCADE,
  state TEXT NOT NULL DEFAULT 'pending',
  created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
  decided_at TIMESTAMPTZ,
  decided_by TEXT,
  reason TEXT
);

CREATE TABLE IF NOT EXISTS jobs (
  job_id TEXT PRIMARY KEY,
  run_id TEXT NOT NULL,
  tenant_id TEXT NOT NULL,
  state TEXT NOT NULL DEFAULT 'queued',
  claim_until TIMESTAMPTZ,
  claimed_by TEXT,
  attempts INT NOT NULL DEFAULT 0,
  created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
  updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE INDEX IF NOT EXISTS idx_jobs_state ON jobs(state, created_at);

CREATE TABLE IF NOT EXISTS rate_limits (
  scope TEXT NOT NULL,
  scope_id TEXT NOT NULL,
  window_start BIGINT NOT NULL,
  count BIGINT NOT NULL DEFAULT 0,
  updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
  PRIMARY KEY (scope, scope_id, window_start)
);

CREATE TABLE IF NOT EXISTS audit_keys (
  kid TEXT PRIMARY KEY,
  secret TEXT NOT NULL,
  active BOOLEAN NOT NULL DEFAULT FALSE,
  created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS audit_log (
  audit_id BIGSERIAL PRIMARY KEY,
  ts TIMESTAMPTZ NOT NULL DEFAULT now(),
  record JSONB NOT NULL
);

CREATE TABLE IF NOT EXISTS run_snapshots (
  run_id TEXT PRIMARY KEY,
  tenant_id TEXT NOT NULL,
  last_seq BIGINT NOT NULL DEFAULT 0,
  state TEXT,
  title TEXT,
  tags JSONB NOT NULL DEFAULT '[]'::jsonb,
  budget_used JSONB NOT NULL DEFAULT '{}'::jsonb,
  updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
"#;

struct HeldSlot {
    conn: sqlx::pool::PoolConnection<Postgres>,
    lock_key: i64,
}

pub struct PostgresStore {
    pool: PgPool,
    chain: HashChain,
    tenant_max_concurrency: u32,
    snapshot_every: u64,
    refresh_mv_every: u64,
    slots: Mutex<HashMap<String, HeldSlot>>,
}

impl PostgresStore {
    pub async fn connect(
        database_url: &str,
        keyring: KeyRegistry,
        config: &crate::infrastructure::config::KernelConfig,
    ) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new().max_connections(10).connect(database_url).await?;
        let store = Self {
            pool,
            chain: HashChain::new(keyring),
            tenant_max_concurrency: config.tenant_max_concurrency,
            snapshot_every: config.snapshot_every.max(1),
            refresh_mv_every: config.refresh_mv_every.max(1),
            slots: Mutex::new(HashMap::new()),
        };
        store.init().await?;
        Ok(store)
    }

    async fn init(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(INIT_SQL).execute(&self.pool).await?;
        self.ensure_projections().await?;
        self.seed_audit_keys().await?;
        Ok(())
    }

    async fn ensure_projections(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(
            r#"
            CREATE MATERIALIZED VIEW IF NOT EXISTS runs_mv AS
            SELECT
              r.run_id, r.task_id, r.tenant_id,
              COALESCE(s.state, r.state) AS state,
              COALESCE(s.title, r.title) AS title,
              COALESCE(s.tags, r.tags) AS tags,
              COALESCE(s.updated_at, r.updated_at) AS updated_at,
              r.created_at AS created_at
            FROM runs r
            LEFT JOIN run_snapshots s ON s.run_id = r.run_id;
            CREATE UNIQUE INDEX IF NOT EXISTS runs_mv_run_id_uidx ON runs_mv(run_id);
            CREATE INDEX IF NOT EXISTS runs_mv_tenant_state_idx ON runs_mv(tenant_id, state, updated_at);

            CREATE MATERIALIZED VIEW IF NOT EXISTS approvals_mv AS
            SELECT approval_id, run_id, state, created_at, decided_at
            FROM approvals;
            CREATE UNIQUE INDEX IF NOT EXISTS approvals_mv_id_uidx ON approvals_mv(approval_id);
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn seed_audit_keys(&self) -> Result<(), StoreError> {
        let ring = self.chain.keyring();
        for key in ring.keys() {
            sqlx::query(
                "INSERT INTO audit_keys(kid, secret, active, created_at) VALUES($1,$2,$3,$4) \
                 ON CONFLICT (kid) DO UPDATE SET secret=EXCLUDED.secret",
            )
            .bind(&key.kid)
            .bind(&key.secret)
            .bind(key.active)
            .bind(key.created_at)
            .execute(&self.pool)
            .await?;
        }
        if let Ok(active) = ring.active() {
            sqlx::query("UPDATE audit_keys SET active = (kid = $1)")
                .bind(&active.kid)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    /// Store a new audit key and make it active. The prior active key is
    /// retained for verification of historical chains.
    pub async fn rotate_audit_key(&self, kid: &str, secret: &str) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO audit_keys(kid, secret, active) VALUES($1,$2,TRUE) \
             ON CONFLICT (kid) DO UPDATE SET secret=EXCLUDED.secret, active=TRUE",
        )
        .bind(kid)
        .bind(secret)
        .execute(&mut *tx)
        .await?;
        sqlx::query("UPDATE audit_keys SET active = (kid = $1)").bind(kid).execute(&mut *tx).await?;
        tx.commit().await?;
        self.chain.rotate(kid, secret);
        self.append_audit(json!({"type": "audit_key_rotated", "kid": kid})).await
    }

    /// Refresh the list projections. Runs outside any transaction;
    /// `CONCURRENTLY` needs the unique index on the projection key.
    pub async fn refresh_projections(&self, concurrently: bool) -> Result<(), StoreError> {
        for view in ["runs_mv", "approvals_mv"] {
            let stmt = if concurrently {
                format!("REFRESH MATERIALIZED VIEW CONCURRENTLY {view}")
            } else {
                format!("REFRESH MATERIALIZED VIEW {view}")
            };
            sqlx::query(&stmt).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Background refresh scheduler: starts at `interval`, doubles on each
    /// failure up to `max_backoff`, resets after a success.
    pub fn spawn_refresh_loop(
        self: &std::sync::Arc<Self>,
        interval: Duration,
        max_backoff: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let store = std::sync::Arc::clone(self);
        tokio::spawn(async move {
            let mut backoff = interval;
            loop {
                tokio::time::sleep(backoff).await;
                match store.refresh_projections(true).await {
                    Ok(()) => {
                        debug!("projection refresh completed");
                        backoff = interval;
                    }
                    Err(err) => {
                        backoff = (backoff * 2).min(max_backoff).max(interval);
                        warn!(error = %err, next_in_s = backoff.as_secs(), "projection refresh failed");
                    }
                }
            }
        })
    }

    fn tenant_lock_key(tenant_id: &str) -> i64 {
        let digest = sha256_hex(tenant_id.as_bytes());
        let bytes: [u8; 8] = hex::decode(&digest[..16])
            .expect("hex digest")
            .try_into()
            .expect("eight bytes");
        (u64::from_be_bytes(bytes) % (i64::MAX as u64 / 2)) as i64
    }

    fn run_from_row(row: &sqlx::postgres::PgRow) -> Result<Run, StoreError> {
        let state: String = row.get("state");
        let tags: Value = row.get("tags");
        Ok(Run {
            run_id: RunId(row.get("run_id")),
            task_id: TaskId(row.get("task_id")),
            tenant_id: row.get("tenant_id"),
            org_id: row.get("org_id"),
            user_id: row.get("user_id"),
            state: state.parse().map_err(StoreError::Serialization)?,
            title: row.get("title"),
            tags: serde_json::from_value(tags)?,
            budget_used: BudgetUsed {
                tool_calls: row.try_get::<i64, _>("tool_calls").unwrap_or(0) as u64,
                llm_calls: row.try_get::<i64, _>("llm_calls").unwrap_or(0) as u64,
                cost_units: row.try_get::<i64, _>("cost_units").unwrap_or(0) as u64,
            },
            last_seq: row.get::<i64, _>("last_seq") as u64,
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }

    fn event_from_row(row: &sqlx::postgres::PgRow) -> Result<Event, StoreError> {
        let payload: Value = row.get("payload");
        Ok(Event {
            seq: row.get::<i64, _>("seq") as u64,
            ts: row.get("ts"),
            canonical: row.get("canonical"),
            prev_hash: row.get("prev_hash"),
            hash: row.get("hash"),
            key_id: row.get("key_id"),
            payload: serde_json::from_value(payload)?,
        })
    }

    fn job_from_row(row: &sqlx::postgres::PgRow) -> Result<Job, StoreError> {
        let state: String = row.get("state");
        let state = match state.as_str() {
            "queued" => JobState::Queued,
            "claimed" => JobState::Claimed,
            "done" => JobState::Done,
            "failed" => JobState::Failed,
            other => return Err(StoreError::Serialization(format!("unknown job state {other}"))),
        };
        Ok(Job {
            job_id: row.get("job_id"),
            run_id: RunId(row.get("run_id")),
            tenant_id: row.get("tenant_id"),
            state,
            claim_until: row.get::<Option<DateTime<Utc>>, _>("claim_until"),
            attempts: row.get::<i32, _>("attempts") as u32,
        })
    }

    const RUN_COLUMNS: &'static str =
        "r.run_id, r.task_id, r.tenant_id, r.org_id, r.user_id, r.state, r.title, r.tags, \
         r.last_seq, r.created_at, r.updated_at, b.tool_calls, b.llm_calls, b.cost_units";

    /// Acquire one of the tenant's advisory slots on a dedicated
    /// connection; the lock lives until `release_job` unlocks it.
    async fn acquire_tenant_slot(&self, job_id: &str, tenant_id: &str) -> Result<bool, StoreError> {
        let base = Self::tenant_lock_key(tenant_id);
        let mut conn = self.pool.acquire().await?;
        for i in 0..self.tenant_max_concurrency as i64 {
            let got: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
                .bind(base + i)
                .fetch_one(&mut *conn)
                .await?;
            if got {
                let mut slots =
                    self.slots.lock().map_err(|_| StoreError::Backend("slot map poisoned".into()))?;
                slots.insert(job_id.to_string(), HeldSlot { conn, lock_key: base + i });
                return Ok(true);
            }
        }
        Ok(false)
    }
}

#[async_trait]
impl Store for PostgresStore {
    async fn create_run(&self, mission: &MissionInput) -> Result<Run, StoreError> {
        mission.validate().map_err(StoreError::Conflict)?;
        let run_id = RunId::for_task(&mission.task_id);
        sqlx::query(
            "INSERT INTO runs(run_id, task_id, tenant_id, org_id, user_id, title, tags, mission) \
             VALUES($1,$2,$3,$4,$5,$6,$7::jsonb,$8::jsonb) \
             ON CONFLICT (task_id) DO NOTHING",
        )
        .bind(run_id.as_str())
        .bind(mission.task_id.as_str())
        .bind(&mission.tenant_id)
        .bind(&mission.org_id)
        .bind(&mission.user_id)
        .bind(&mission.title)
        .bind(serde_json::to_value(&mission.tags)?)
        .bind(serde_json::to_value(mission)?)
        .execute(&self.pool)
        .await?;
        sqlx::query("INSERT INTO budget(run_id) VALUES($1) ON CONFLICT (run_id) DO NOTHING")
            .bind(run_id.as_str())
            .execute(&self.pool)
            .await?;
        self.get_run(&run_id)
            .await?
            .ok_or_else(|| StoreError::Backend(format!("run {run_id} vanished after insert")))
    }

    async fn get_run(&self, run_id: &RunId) -> Result<Option<Run>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM runs r LEFT JOIN budget b ON b.run_id = r.run_id WHERE r.run_id = $1",
            Self::RUN_COLUMNS
        ))
        .bind(run_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::run_from_row).transpose()
    }

    async fn set_run_state(&self, run_id: &RunId, state: RunState) -> Result<(), StoreError> {
        let done = sqlx::query("UPDATE runs SET state=$1, updated_at=now() WHERE run_id=$2")
            .bind(state.as_str())
            .bind(run_id.as_str())
            .execute(&self.pool)
            .await?;
        if done.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("run {run_id}")));
        }
        Ok(())
    }

    async fn update_run_metadata(
        &self,
        run_id: &RunId,
        title: Option<String>,
        tags: Option<Vec<String>>,
    ) -> Result<Run, StoreError> {
        if let Some(title) = title {
            sqlx::query("UPDATE runs SET title=$1, updated_at=now() WHERE run_id=$2")
                .bind(title)
                .bind(run_id.as_str())
                .execute(&self.pool)
                .await?;
        }
        if let Some(tags) = tags {
            sqlx::query("UPDATE runs SET tags=$1::jsonb, updated_at=now() WHERE run_id=$2")
                .bind(serde_json::to_value(tags)?)
                .bind(run_id.as_str())
                .execute(&self.pool)
                .await?;
        }
        self.snapshot(run_id).await?;
        self.get_run(run_id).await?.ok_or_else(|| StoreError::NotFound(format!("run {run_id}")))
    }

    async fn list_runs(&self, tenant_id: &str, filter: &RunFilter) -> Result<Vec<Run>, StoreError> {
        let sql = format!(
            "SELECT {} FROM runs r LEFT JOIN budget b ON b.run_id = r.run_id \
             WHERE r.tenant_id = $1 \
             AND ($2::text IS NULL OR r.state = $2) \
             AND ($3::text IS NULL OR jsonb_exists(r.tags, $3)) \
             AND ($4::text IS NULL OR r.run_id ILIKE $4 OR r.task_id ILIKE $4 \
                  OR COALESCE(r.title,'') ILIKE $4) \
             ORDER BY r.updated_at DESC LIMIT $5 OFFSET $6",
            Self::RUN_COLUMNS
        );

        let rows = sqlx::query(&sql)
            .bind(tenant_id)
            .bind(filter.state.map(|s| s.as_str()))
            .bind(&filter.tag)
            .bind(filter.query.as_ref().map(|q| format!("%{q}%")))
            .bind(filter.effective_limit() as i64)
            .bind(filter.offset as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::run_from_row).collect()
    }

    async fn get_mission(&self, run_id: &RunId) -> Result<Option<MissionInput>, StoreError> {
        let row = sqlx::query("SELECT mission FROM runs WHERE run_id=$1")
            .bind(run_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let mission: Option<Value> = row.get("mission");
                Ok(mission.map(serde_json::from_value).transpose()?)
            }
            None => Ok(None),
        }
    }

    async fn append_event(&self, run_id: &RunId, payload: EventPayload) -> Result<Event, StoreError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT last_seq FROM runs WHERE run_id=$1 FOR UPDATE")
            .bind(run_id.as_str())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StoreError::Conflict(format!("run {run_id} no longer exists")))?;
        let seq = row.get::<i64, _>("last_seq") as u64 + 1;

        let prev_hash: String = sqlx::query_scalar(
            "SELECT hash FROM run_events WHERE run_id=$1 ORDER BY seq DESC LIMIT 1",
        )
        .bind(run_id.as_str())
        .fetch_optional(&mut *tx)
        .await?
        .unwrap_or_default();

        let mut value = serde_json::to_value(&payload)?;
        value["_seq"] = json!(seq);
        let canonical = canonical_json(&value);
        let (hash, key_id) = self
            .chain
            .sign(&prev_hash, &canonical)
            .map_err(|e| StoreError::KeyRegistry(e.to_string()))?;
        let ts = Utc::now();

        sqlx::query(
            "INSERT INTO run_events(run_id, seq, ts, canonical, prev_hash, hash, key_id, payload) \
             VALUES($1,$2,$3,$4,$5,$6,$7,$8::jsonb)",
        )
        .bind(run_id.as_str())
        .bind(seq as i64)
        .bind(ts)
        .bind(&canonical)
        .bind(&prev_hash)
        .bind(&hash)
        .bind(&key_id)
        .bind(serde_json::to_value(&payload)?)
        .execute(&mut *tx)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StoreError::Conflict(format!("concurrent append on run {run_id}"))
            }
            other => other.into(),
        })?;

        sqlx::query("UPDATE runs SET last_seq=$1, updated_at=now() WHERE run_id=$2")
            .bind(seq as i64)
            .bind(run_id.as_str())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        if seq % self.snapshot_every == 0 {
            self.snapshot(run_id).await?;
        }
        if seq % self.refresh_mv_every == 0 {
            if let Err(err) = self.refresh_projections(false).await {
                warn!(run_id = %run_id, error = %err, "best-effort projection refresh failed");
            }
        }
        Ok(Event { seq, ts, canonical, prev_hash, hash, key_id, payload })
    }

    async fn get_events(&self, run_id: &RunId, since_seq: u64) -> Result<Vec<Event>, StoreError> {
        let rows = sqlx::query(
            "SELECT seq, ts, canonical, prev_hash, hash, key_id, payload \
             FROM run_events WHERE run_id=$1 AND seq > $2 ORDER BY seq ASC",
        )
        .bind(run_id.as_str())
        .bind(since_seq as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::event_from_row).collect()
    }

    async fn verify_chain(&self, run_id: &RunId) -> Result<ChainVerification, StoreError> {
        let events = self.get_events(run_id, 0).await?;
        verify_events(&self.chain, &events).map_err(|e| StoreError::KeyRegistry(e.to_string()))
    }

    async fn step_cache_get(&self, idem_key: &str) -> Result<Option<StepResult>, StoreError> {
        let row = sqlx::query("SELECT payload FROM step_cache WHERE idem_key=$1")
            .bind(idem_key)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let payload: Value = row.get("payload");
                Ok(Some(serde_json::from_value(payload)?))
            }
            None => Ok(None),
        }
    }

    async fn step_cache_put(&self, idem_key: &str, result: &StepResult) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO step_cache(idem_key, payload) VALUES($1,$2::jsonb) \
             ON CONFLICT (idem_key) DO UPDATE SET payload=EXCLUDED.payload",
        )
        .bind(idem_key)
        .bind(serde_json::to_value(result)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn consume_budget(
        &self,
        run_id: &RunId,
        delta: &BudgetDelta,
        limits: &TenantLimits,
    ) -> Result<BudgetUsed, StoreError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            "SELECT tool_calls, llm_calls, cost_units FROM budget WHERE run_id=$1 FOR UPDATE",
        )
        .bind(run_id.as_str())
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("budget row for run {run_id}")))?;

        let used = BudgetUsed {
            tool_calls: row.get::<i64, _>("tool_calls") as u64 + delta.tool_calls,
            llm_calls: row.get::<i64, _>("llm_calls") as u64 + delta.llm_calls,
            cost_units: row.get::<i64, _>("cost_units") as u64 + delta.cost_units,
        };
        if used.tool_calls > limits.max_tool_calls {
            return Err(StoreError::BudgetExceeded {
                metric: "max_tool_calls",
                limit: limits.max_tool_calls,
            });
        }
        if used.llm_calls > limits.max_llm_calls {
            return Err(StoreError::BudgetExceeded {
                metric: "max_llm_calls",
                limit: limits.max_llm_calls,
            });
        }
        if used.cost_units > limits.max_cost_units {
            return Err(StoreError::BudgetExceeded {
                metric: "max_cost_units",
                limit: limits.max_cost_units,
            });
        }

        sqlx::query("UPDATE budget SET tool_calls=$1, llm_calls=$2, cost_units=$3 WHERE run_id=$4")
            .bind(used.tool_calls as i64)
            .bind(used.llm_calls as i64)
            .bind(used.cost_units as i64)
            .bind(run_id.as_str())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(used)
    }

    async fn enqueue_job(&self, run_id: &RunId, tenant_id: &str) -> Result<Job, StoreError> {
        let job = Job::queued(run_id, tenant_id);
        sqlx::query(
            "INSERT INTO jobs(job_id, run_id, tenant_id, state) VALUES($1,$2,$3,'queued')",
        )
        .bind(&job.job_id)
        .bind(run_id.as_str())
        .bind(tenant_id)
        .execute(&self.pool)
        .await?;
        Ok(job)
    }

    async fn claim_job(&self, worker_id: &str, lease: Duration) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(
            r#"
            WITH cte AS (
              SELECT job_id FROM jobs
              WHERE state = 'queued' OR (state = 'claimed' AND claim_until < now())
              ORDER BY created_at ASC
              FOR UPDATE SKIP LOCKED
              LIMIT 1
            )
            UPDATE jobs j
            SET state='claimed',
                claim_until = now() + make_interval(secs => $2),
                claimed_by = $1,
                attempts = attempts + 1,
                updated_at = now()
            FROM cte WHERE j.job_id = cte.job_id
            RETURNING j.job_id, j.run_id, j.tenant_id, j.state, j.claim_until, j.attempts
            "#,
        )
        .bind(worker_id)
        .bind(lease.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else { return Ok(None) };
        let job = Self::job_from_row(&row)?;

        if !self.acquire_tenant_slot(&job.job_id, &job.tenant_id).await? {
            // no slot free for this tenant: hand the job back
            sqlx::query(
                "UPDATE jobs SET state='queued', claim_until=NULL, claimed_by=NULL, \
                 attempts = attempts - 1, updated_at=now() WHERE job_id=$1",
            )
            .bind(&job.job_id)
            .execute(&self.pool)
            .await?;
            return Ok(None);
        }
        Ok(Some(job))
    }

    async fn release_job(&self, job_id: &str, ok: bool) -> Result<(), StoreError> {
        sqlx::query("UPDATE jobs SET state=$1, claim_until=NULL, updated_at=now() WHERE job_id=$2")
            .bind(if ok { "done" } else { "failed" })
            .bind(job_id)
            .execute(&self.pool)
            .await?;

        let held = {
            let mut slots =
                self.slots.lock().map_err(|_| StoreError::Backend("slot map poisoned".into()))?;
            slots.remove(job_id)
        };
        if let Some(mut held) = held {
            sqlx::query("SELECT pg_advisory_unlock($1)")
                .bind(held.lock_key)
                .execute(&mut *held.conn)
                .await?;
        }
        Ok(())
    }

    async fn create_approval(&self, run_id: &RunId) -> Result<Approval, StoreError> {
        let approval = Approval::pending(run_id);
        sqlx::query(
            "INSERT INTO approvals(approval_id, run_id, state, created_at) \
             VALUES($1,$2,'pending',$3) \
             ON CONFLICT (run_id) DO UPDATE SET state='pending', decided_at=NULL, \
             decided_by=NULL, reason=NULL \
             WHERE approvals.state = 'pending'",
        )
        .bind(&approval.approval_id)
        .bind(run_id.as_str())
        .bind(approval.created_at)
        .execute(&self.pool)
        .await?;
        self.get_approval(run_id)
            .await?
            .ok_or_else(|| StoreError::Backend(format!("approval for {run_id} vanished")))
    }

    async fn get_approval(&self, run_id: &RunId) -> Result<Option<Approval>, StoreError> {
        let row = sqlx::query(
            "SELECT approval_id, run_id, state, created_at, decided_at, decided_by, reason \
             FROM approvals WHERE run_id=$1",
        )
        .bind(run_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| {
            let state: String = row.get("state");
            let state = match state.as_str() {
                "pending" => ApprovalState::Pending,
                "approved" => ApprovalState::Approved,
                "denied" => ApprovalState::Denied,
                other => {
                    return Err(StoreError::Serialization(format!("unknown approval state {other}")))
                }
            };
            Ok(Approval {
                approval_id: row.get("approval_id"),
                run_id: RunId(row.get("run_id")),
                state,
                created_at: row.get("created_at"),
                decided_at: row.get("decided_at"),
                by: row.get("decided_by"),
                reason: row.get("reason"),
            })
        })
        .transpose()
    }

    async fn decide_approval(
        &self,
        run_id: &RunId,
        decision: ApprovalDecision,
    ) -> Result<Approval, StoreError> {
        let state = if decision.approved { "approved" } else { "denied" };
        let done = sqlx::query(
            "UPDATE approvals SET state=$1, decided_at=now(), decided_by=$2, reason=$3 \
             WHERE run_id=$4 AND state='pending'",
        )
        .bind(state)
        .bind(&decision.by)
        .bind(&decision.reason)
        .bind(run_id.as_str())
        .execute(&self.pool)
        .await?;
        if done.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!(
                "approval for run {run_id} missing or already decided"
            )));
        }
        self.get_approval(run_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("approval for run {run_id}")))
    }

    async fn list_approvals(
        &self,
        tenant_id: &str,
        pending_only: bool,
    ) -> Result<Vec<Approval>, StoreError> {
        let cond = if pending_only { "AND a.state = 'pending'" } else { "" };
        let rows = sqlx::query(&format!(
            "SELECT a.approval_id, a.run_id, a.state, a.created_at, a.decided_at, a.decided_by, a.reason \
             FROM approvals a JOIN runs r ON r.run_id = a.run_id \
             WHERE r.tenant_id = $1 {cond} ORDER BY a.created_at DESC"
        ))
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| {
                let state: String = row.get("state");
                let state = match state.as_str() {
                    "pending" => ApprovalState::Pending,
                    "approved" => ApprovalState::Approved,
                    _ => ApprovalState::Denied,
                };
                Ok(Approval {
                    approval_id: row.get("approval_id"),
                    run_id: RunId(row.get("run_id")),
                    state,
                    created_at: row.get("created_at"),
                    decided_at: row.get("decided_at"),
                    by: row.get("decided_by"),
                    reason: row.get("reason"),
                })
            })
            .collect()
    }

    async fn rate_hit(
        &self,
        scope: RateScope,
        scope_id: &str,
        limit: u64,
        window_s: u64,
    ) -> Result<RateStatus, StoreError> {
        let now = Utc::now().timestamp();
        let window_start = now - now.rem_euclid(window_s as i64);
        let count: i64 = sqlx::query_scalar(
            "INSERT INTO rate_limits(scope, scope_id, window_start, count) VALUES($1,$2,$3,1) \
             ON CONFLICT (scope, scope_id, window_start) \
             DO UPDATE SET count = rate_limits.count + 1, updated_at = now() \
             RETURNING count",
        )
        .bind(scope.as_str())
        .bind(scope_id)
        .bind(window_start)
        .fetch_one(&self.pool)
        .await?;

        let reset_in_s = ((window_start + window_s as i64) - now).max(0) as u64;
        if count as u64 > limit {
            return Err(StoreError::RateLimited {
                scope,
                scope_id: scope_id.to_string(),
                reset_in_s,
            });
        }
        Ok(RateStatus { remaining: limit - count as u64, reset_in_s })
    }

    async fn snapshot(&self, run_id: &RunId) -> Result<(), StoreError> {
        let Some(run) = self.get_run(run_id).await? else {
            return Ok(());
        };
        sqlx::query(
            "INSERT INTO run_snapshots(run_id, tenant_id, last_seq, state, title, tags, budget_used, updated_at) \
             VALUES($1,$2,$3,$4,$5,$6::jsonb,$7::jsonb,now()) \
             ON CONFLICT (run_id) DO UPDATE SET last_seq=EXCLUDED.last_seq, state=EXCLUDED.state, \
             title=EXCLUDED.title, tags=EXCLUDED.tags, budget_used=EXCLUDED.budget_used, updated_at=now()",
        )
        .bind(run.run_id.as_str())
        .bind(&run.tenant_id)
        .bind(run.last_seq as i64)
        .bind(run.state.as_str())
        .bind(&run.title)
        .bind(serde_json::to_value(&run.tags)?)
        .bind(serde_json::to_value(run.budget_used)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append_audit(&self, record: Value) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO audit_log(record) VALUES($1::jsonb)")
            .bind(record)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

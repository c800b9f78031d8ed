// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Signed, append-only run events.
//!
//! Events are the single source of truth for a run: the pipeline persists
//! them before any subscriber sees them, and the stored `canonical` bytes
//! are exactly what the hash chain signed and what the streamer replays.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::run::{RunId, RunState, TaskId};

// ============================================================================
// Payloads
// ============================================================================

/// Kind discriminator for artifact updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactType {
    ContextPack,
    Plan,
    GateReport,
    StepResult,
    Final,
}

impl ArtifactType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ContextPack => "context_pack",
            Self::Plan => "plan",
            Self::GateReport => "gate_report",
            Self::StepResult => "step_result",
            Self::Final => "final",
        }
    }
}

impl std::fmt::Display for ArtifactType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One of the two wire shapes carried by every event.
///
/// Unknown `type` tags fail at parse time, not at use time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventPayload {
    TaskStatusUpdateEvent {
        ts: DateTime<Utc>,
        task_id: TaskId,
        run_id: RunId,
        state: RunState,
        message: String,
        #[serde(default)]
        meta: Value,
    },
    TaskArtifactUpdateEvent {
        ts: DateTime<Utc>,
        task_id: TaskId,
        run_id: RunId,
        artifact_type: ArtifactType,
        artifact: Value,
    },
}

impl EventPayload {
    pub fn status(task_id: &TaskId, run_id: &RunId, state: RunState, message: impl Into<String>) -> Self {
        Self::status_with_meta(task_id, run_id, state, message, Value::Object(Default::default()))
    }

    pub fn status_with_meta(
        task_id: &TaskId,
        run_id: &RunId,
        state: RunState,
        message: impl Into<String>,
        meta: Value,
    ) -> Self {
        Self::TaskStatusUpdateEvent {
            ts: Utc::now(),
            task_id: task_id.clone(),
            run_id: run_id.clone(),
            state,
            message: message.into(),
            meta,
        }
    }

    pub fn artifact(task_id: &TaskId, run_id: &RunId, artifact_type: ArtifactType, artifact: Value) -> Self {
        Self::TaskArtifactUpdateEvent {
            ts: Utc::now(),
            task_id: task_id.clone(),
            run_id: run_id.clone(),
            artifact_type,
            artifact,
        }
    }

    pub fn state(&self) -> Option<RunState> {
        match self {
            Self::TaskStatusUpdateEvent { state, .. } => Some(*state),
            Self::TaskArtifactUpdateEvent { .. } => None,
        }
    }

    pub fn artifact_type(&self) -> Option<ArtifactType> {
        match self {
            Self::TaskArtifactUpdateEvent { artifact_type, .. } => Some(*artifact_type),
            Self::TaskStatusUpdateEvent { .. } => None,
        }
    }
}

// ============================================================================
// Persisted event record
// ============================================================================

/// An immutable, chained event as persisted by the store.
///
/// Invariants:
/// - `seq` is dense per run, starting at 1
/// - `hash = HMAC(secret[key_id], prev_hash | "|" | canonical)`, with
///   `prev_hash = ""` for the first event
/// - `canonical` is the deterministic serialization of the payload with the
///   `_seq` cursor injected; it is the exact byte string subscribers receive
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub seq: u64,
    pub ts: DateTime<Utc>,
    pub canonical: String,
    pub prev_hash: String,
    pub hash: String,
    pub key_id: String,
    pub payload: EventPayload,
}

impl Event {
    /// The frame a subscriber receives; `_seq` is the reconnect cursor.
    pub fn frame(&self) -> &str {
        &self.canonical
    }
}

/// Outcome of a whole-chain verification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainVerification {
    pub ok: bool,
    /// Earliest sequence at which the chain diverges, when `ok` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broken_at: Option<u64>,
    pub checked: u64,
}

impl ChainVerification {
    pub fn intact(checked: u64) -> Self {
        Self { ok: true, broken_at: None, checked }
    }

    pub fn broken(at: u64, checked: u64) -> Self {
        Self { ok: false, broken_at: Some(at), checked }
    }
}

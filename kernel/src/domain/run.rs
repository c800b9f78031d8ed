// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Value Objects: Identifiers
// ============================================================================

/// Opaque, globally unique run identifier (`run_<task_id>`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn for_task(task_id: &TaskId) -> Self {
        Self(format!("run_{}", task_id.0))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Caller-supplied or generated task identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Run state machine
// ============================================================================

/// Observable lifecycle state of a run.
///
/// Transitions are driven exclusively by the pipeline (and the approval
/// handler for `input-required` exits); see the pipeline for the legal
/// transition set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunState {
    Submitted,
    Working,
    InputRequired,
    Completed,
    Failed,
    Canceled,
}

impl RunState {
    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::Working => "working",
            Self::InputRequired => "input-required",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "submitted" => Ok(Self::Submitted),
            "working" => Ok(Self::Working),
            "input-required" => Ok(Self::InputRequired),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "canceled" => Ok(Self::Canceled),
            other => Err(format!("unknown run state: {other}")),
        }
    }
}

// ============================================================================
// Budget counters
// ============================================================================

/// Per-run usage counters, never exceeding tenant limits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetUsed {
    #[serde(default)]
    pub tool_calls: u64,
    #[serde(default)]
    pub llm_calls: u64,
    #[serde(default)]
    pub cost_units: u64,
}

/// Increment applied atomically by `Store::consume_budget`.
#[derive(Debug, Clone, Copy, Default)]
pub struct BudgetDelta {
    pub tool_calls: u64,
    pub llm_calls: u64,
    pub cost_units: u64,
}

impl BudgetDelta {
    pub fn tool_call(cost_units: u64) -> Self {
        Self { tool_calls: 1, llm_calls: 0, cost_units }
    }

    pub fn llm_call(cost_units: u64) -> Self {
        Self { tool_calls: 0, llm_calls: 1, cost_units }
    }
}

// ============================================================================
// Run aggregate
// ============================================================================

/// A single execution of the phase pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub run_id: RunId,
    pub task_id: TaskId,
    pub tenant_id: String,
    #[serde(default)]
    pub org_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    pub state: RunState,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub budget_used: BudgetUsed,
    #[serde(default)]
    pub last_seq: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Validated mission input; one mission instantiates one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MissionInput {
    pub task_id: TaskId,
    pub tenant_id: String,
    #[serde(default)]
    pub org_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    pub user_message: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl MissionInput {
    /// Reject structurally invalid missions before a run is created.
    pub fn validate(&self) -> Result<(), String> {
        if self.tenant_id.trim().is_empty() {
            return Err("tenant_id must not be empty".into());
        }
        if self.user_message.trim().is_empty() {
            return Err("user_message must not be empty".into());
        }
        Ok(())
    }

    /// Caller identity as seen by the policy engine.
    pub fn run_context(&self) -> RunContext {
        RunContext {
            tenant_id: self.tenant_id.clone(),
            org_id: self.org_id.clone(),
            user_id: self.user_id.clone(),
            roles: self.roles.clone(),
        }
    }
}

/// Identity triple plus roles, threaded through policy evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunContext {
    pub tenant_id: String,
    #[serde(default)]
    pub org_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
}

/// Filter for tenant-scoped run listings.
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub query: Option<String>,
    pub state: Option<RunState>,
    pub tag: Option<String>,
    pub limit: usize,
    pub offset: usize,
}

impl RunFilter {
    pub fn effective_limit(&self) -> usize {
        if self.limit == 0 { 50 } else { self.limit }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_state_round_trips_through_serde() {
        let json = serde_json::to_string(&RunState::InputRequired).unwrap();
        assert_eq!(json, "\"input-required\"");
        let back: RunState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, RunState::InputRequired);
    }

    #[test]
    fn terminal_states() {
        assert!(RunState::Completed.is_terminal());
        assert!(RunState::Failed.is_terminal());
        assert!(RunState::Canceled.is_terminal());
        assert!(!RunState::Working.is_terminal());
        assert!(!RunState::InputRequired.is_terminal());
    }

    #[test]
    fn mission_validation_rejects_blank_message() {
        let mission = MissionInput {
            task_id: TaskId::generate(),
            tenant_id: "tenant_demo".into(),
            org_id: None,
            user_id: None,
            roles: vec![],
            user_message: "   ".into(),
            title: None,
            tags: vec![],
        };
        assert!(mission.validate().is_err());
    }
}

// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::run::RunId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalState {
    Pending,
    Approved,
    Denied,
}

/// A human decision gate pausing a run. At most one pending approval exists
/// per run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Approval {
    pub approval_id: String,
    pub run_id: RunId,
    pub state: ApprovalState,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Approval {
    pub fn pending(run_id: &RunId) -> Self {
        Self {
            approval_id: format!("apr_{run_id}"),
            run_id: run_id.clone(),
            state: ApprovalState::Pending,
            created_at: Utc::now(),
            decided_at: None,
            by: None,
            reason: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.state == ApprovalState::Pending
    }
}

/// Decision applied exactly once to a pending approval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalDecision {
    pub approved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ApprovalDecision {
    pub fn approved_by(by: impl Into<String>) -> Self {
        Self { approved: true, by: Some(by.into()), reason: None }
    }

    pub fn denied_by(by: impl Into<String>, reason: impl Into<String>) -> Self {
        Self { approved: false, by: Some(by.into()), reason: Some(reason.into()) }
    }
}

// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::run::RunId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Claimed,
    Done,
    Failed,
}

/// Queue entry driving a run; claimed by a worker under a lease. An expired
/// lease makes the job reclaimable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub run_id: RunId,
    pub tenant_id: String,
    pub state: JobState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub attempts: u32,
}

impl Job {
    pub fn queued(run_id: &RunId, tenant_id: &str) -> Self {
        Self {
            job_id: Uuid::new_v4().simple().to_string(),
            run_id: run_id.clone(),
            tenant_id: tenant_id.to_string(),
            state: JobState::Queued,
            claim_until: None,
            attempts: 0,
        }
    }

    /// A job is claimable when queued, or when a claim lease has lapsed.
    pub fn claimable(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            JobState::Queued => true,
            JobState::Claimed => self.claim_until.map(|t| t < now).unwrap_or(true),
            JobState::Done | JobState::Failed => false,
        }
    }
}

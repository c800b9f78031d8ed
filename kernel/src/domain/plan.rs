// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Plan aggregate: a validated DAG of action invocations.
//!
//! Plans arrive as planner-produced JSON and are parsed into typed
//! structures up front; a plan that fails validation never reaches the
//! executor.
//!
//! # Invariants
//! - step ids are unique within the plan
//! - every `depends_on` references a declared step id
//! - the dependency graph is acyclic

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::domain::error::StepError;

// ============================================================================
// Plan & Step
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanControls {
    #[serde(default)]
    pub requires_approval: bool,
}

/// One action invocation with bound arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub step_id: String,
    pub action_id: String,
    #[serde(default)]
    pub args: Map<String, Value>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_units: Option<u64>,
    #[serde(default)]
    pub continue_on_error: bool,
    /// Ids of plan-phase policies that matched this step; populated by the
    /// gate before the plan artifact is emitted.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub policy_ids: Vec<String>,
}

/// A directed acyclic graph of steps produced by the planner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub plan_id: String,
    #[serde(default)]
    pub controls: PlanControls,
    #[serde(default)]
    pub steps: Vec<Step>,
}

#[derive(Debug, Error, PartialEq)]
pub enum PlanError {
    #[error("plan is not valid JSON for the plan shape: {0}")]
    InvalidShape(String),
    #[error("duplicate step_id '{0}'")]
    DuplicateStepId(String),
    #[error("step '{step_id}' depends on undeclared step '{dependency}'")]
    UnknownDependency { step_id: String, dependency: String },
    #[error("dependency cycle involving step '{0}'")]
    Cycle(String),
}

impl Plan {
    /// Parse planner JSON and enforce the plan invariants.
    pub fn parse(value: Value) -> Result<Self, PlanError> {
        let plan: Plan =
            serde_json::from_value(value).map_err(|e| PlanError::InvalidShape(e.to_string()))?;
        plan.validate()?;
        Ok(plan)
    }

    fn validate(&self) -> Result<(), PlanError> {
        let mut ids = HashSet::new();
        for step in &self.steps {
            if !ids.insert(step.step_id.as_str()) {
                return Err(PlanError::DuplicateStepId(step.step_id.clone()));
            }
        }
        for step in &self.steps {
            for dep in &step.depends_on {
                if !ids.contains(dep.as_str()) {
                    return Err(PlanError::UnknownDependency {
                        step_id: step.step_id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }
        self.waves().map(|_| ())
    }

    pub fn step(&self, step_id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    /// Topological layering: each wave holds indices of steps whose
    /// dependencies are all satisfied by earlier waves. Steps within a wave
    /// are independent and may run in parallel.
    pub fn waves(&self) -> Result<Vec<Vec<usize>>, PlanError> {
        let index: HashMap<&str, usize> =
            self.steps.iter().enumerate().map(|(i, s)| (s.step_id.as_str(), i)).collect();
        let mut indegree = vec![0usize; self.steps.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.steps.len()];
        for (i, step) in self.steps.iter().enumerate() {
            for dep in &step.depends_on {
                let d = index[dep.as_str()];
                indegree[i] += 1;
                dependents[d].push(i);
            }
        }

        let mut ready: Vec<usize> =
            (0..self.steps.len()).filter(|&i| indegree[i] == 0).collect();
        let mut waves = Vec::new();
        let mut placed = 0usize;
        while !ready.is_empty() {
            ready.sort_unstable();
            placed += ready.len();
            let mut next = Vec::new();
            for &i in &ready {
                for &j in &dependents[i] {
                    indegree[j] -= 1;
                    if indegree[j] == 0 {
                        next.push(j);
                    }
                }
            }
            waves.push(std::mem::replace(&mut ready, next));
        }

        if placed != self.steps.len() {
            let stuck = (0..self.steps.len())
                .find(|&i| indegree[i] > 0)
                .map(|i| self.steps[i].step_id.clone())
                .unwrap_or_default();
            return Err(PlanError::Cycle(stuck));
        }
        Ok(waves)
    }
}

// ============================================================================
// Step results
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    Failed,
    Skipped,
}

/// Outcome of a single step execution, cached under its idempotency key and
/// emitted as a `step_result` artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    pub action_id: String,
    pub tool_id: String,
    pub status: StepStatus,
    #[serde(default)]
    pub output: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
    pub attempts: u32,
    pub idempotency_key: String,
    #[serde(default)]
    pub policy_ids: Vec<String>,
    #[serde(default)]
    pub cache_hit: bool,
}

impl StepResult {
    pub fn is_failure(&self) -> bool {
        self.status == StepStatus::Failed
    }
}

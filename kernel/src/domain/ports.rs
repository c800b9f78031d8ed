// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Capability ports the kernel calls out through.
//!
//! These are intentionally narrow `(input) -> output or error` interfaces;
//! the kernel never introspects adapter internals. Concrete transports
//! (in-process stubs, HTTP tool servers, LLM planners) live behind them.

use async_trait::async_trait;
use serde_json::Value;

use crate::domain::error::{ErrorClass, StepError};
use crate::domain::registry::{EffectiveRegistry, RegistryError};
use crate::domain::run::MissionInput;

/// One tool invocation as seen by a transport.
#[derive(Debug, Clone)]
pub struct ToolRequest {
    pub tenant_id: String,
    pub tool_id: String,
    pub action_id: String,
    pub args: Value,
    pub timeout_ms: u64,
}

/// Classified transport failure.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{class}: {message}")]
pub struct ToolFailure {
    pub class: ErrorClass,
    pub message: String,
    /// Server-provided backoff hint; honored for `rate_limited`.
    pub retry_after_ms: Option<u64>,
}

impl ToolFailure {
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self { class, message: message.into(), retry_after_ms: None }
    }
}

impl From<ToolFailure> for StepError {
    fn from(f: ToolFailure) -> Self {
        Self { class: f.class, message: f.message, retry_after_ms: f.retry_after_ms }
    }
}

/// Invokes the external capability behind an action.
#[async_trait]
pub trait ToolAdapter: Send + Sync {
    async fn invoke(&self, request: ToolRequest) -> Result<Value, ToolFailure>;
}

/// Produces plan JSON from a context pack. The kernel validates the JSON
/// against the plan shape; the planner itself is a black box.
#[async_trait]
pub trait PlannerAdapter: Send + Sync {
    async fn build_plan(&self, context_pack: &Value) -> anyhow::Result<Value>;
}

/// Assembles the context pack for a mission (world-node selection plus
/// hydration, in one port).
#[async_trait]
pub trait ContextProvider: Send + Sync {
    async fn build_context(
        &self,
        mission: &MissionInput,
        registry: &EffectiveRegistry,
    ) -> anyhow::Result<Value>;
}

/// Produces the effective registry snapshot for a mission's
/// (org, tenant, user) triple.
pub trait RegistryProvider: Send + Sync {
    fn load_for(&self, mission: &MissionInput) -> Result<EffectiveRegistry, RegistryError>;
}

// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::domain::ports::ContextProvider;
use crate::domain::registry::EffectiveRegistry;
use crate::domain::run::MissionInput;

/// Minimal context pack: a fixed world-node selection plus the action
/// space visible in the effective registry.
pub struct StubContextProvider;

#[async_trait]
impl ContextProvider for StubContextProvider {
    async fn build_context(
        &self,
        mission: &MissionInput,
        registry: &EffectiveRegistry,
    ) -> anyhow::Result<Value> {
        let action_space: Vec<Value> = registry
            .doc()
            .actions
            .iter()
            .map(|a| json!({"action_id": a.action_id, "tool_id": a.tool_id}))
            .collect();
        Ok(json!({
            "pack_id": format!("pack_{}", mission.task_id),
            "tenant_id": mission.tenant_id,
            "task": {"user_message": mission.user_message},
            "node_list": ["SUPPORT/KB/Refunds", "SUPPORT/PLAYBOOKS/RefundFlow", "CUSTOMERS/cust_123"],
            "action_space": action_space,
        }))
    }
}

// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::domain::ports::PlannerAdapter;

/// Deterministic planner used in dev and tests: a fixed lookup → notify
/// plan over the support registry, with an optional approval control.
pub struct StubPlanner {
    requires_approval: bool,
}

impl StubPlanner {
    pub fn new() -> Self {
        Self { requires_approval: false }
    }

    pub fn with_approval() -> Self {
        Self { requires_approval: true }
    }
}

impl Default for StubPlanner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PlannerAdapter for StubPlanner {
    async fn build_plan(&self, context_pack: &Value) -> anyhow::Result<Value> {
        let pack_id =
            context_pack.get("pack_id").and_then(Value::as_str).unwrap_or("pack_unknown");
        Ok(json!({
            "plan_id": format!("plan_{pack_id}"),
            "controls": {"requires_approval": self.requires_approval},
            "steps": [
                {
                    "step_id": "s1",
                    "action_id": "act_crm_get_customer_v1",
                    "args": {"customer_id": "cust_123"}
                },
                {
                    "step_id": "s2",
                    "action_id": "act_email_send_v1",
                    "args": {
                        "to": "$s1.output.email",
                        "subject": "We are on it",
                        "body": "Your refund request is being processed."
                    },
                    "depends_on": ["s1"]
                }
            ]
        }))
    }
}

// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use aether_kernel::application::{Pipeline, Streamer};
use aether_kernel::domain::ports::PlannerAdapter;
use aether_kernel::domain::registry::EffectiveRegistry;
use aether_kernel::domain::run::{MissionInput, TaskId};
use aether_kernel::infrastructure::adapters::{StubContextProvider, StubPlanner, StubToolRunner};
use aether_kernel::infrastructure::hash_chain::KeyRegistry;
use aether_kernel::infrastructure::registry_loader::StaticRegistryProvider;
use aether_kernel::infrastructure::store::InMemoryStore;
use aether_kernel::infrastructure::stream_hub::StreamHub;

pub const HEARTBEAT: Duration = Duration::from_secs(15);

/// Support-domain registry used across the suite; tests append policies
/// or override limits through the two knobs.
pub fn support_registry(policies: Value, limit_overrides: Value) -> Value {
    let mut limits = json!({
        "max_tool_calls": 50,
        "max_llm_calls": 20,
        "max_cost_units": 1000,
        "llm_call_cost_units": 1,
        "tenant_rpm": 600,
        "user_rpm": 120,
        "org_rpm": 600
    });
    if let (Some(base), Some(over)) = (limits.as_object_mut(), limit_overrides.as_object()) {
        for (k, v) in over {
            base.insert(k.clone(), v.clone());
        }
    }
    json!({
        "registry_id": "reg_support_v1",
        "schema_version": "1",
        "tools": [
            {"tool_id": "crm.get_customer"},
            {"tool_id": "email.send"},
            {"tool_id": "ticket.create"}
        ],
        "actions": [
            {
                "action_id": "act_crm_get_customer_v1",
                "tool_id": "crm.get_customer",
                "schema_in": {
                    "required": ["customer_id"],
                    "properties": {"customer_id": {"type": "string"}}
                },
                "retry_class": "transient"
            },
            {
                "action_id": "act_email_send_v1",
                "tool_id": "email.send",
                "side_effect": true,
                "idempotency": {"strategy": "hash"},
                "retry_class": "transient",
                "cost_units": 3
            },
            {
                "action_id": "act_ticket_create_v1",
                "tool_id": "ticket.create",
                "side_effect": true,
                "idempotency": {"strategy": "explicit_key"}
            }
        ],
        "retry": [
            {
                "id": "transient",
                "max_attempts": 3,
                "backoff_ms": [1, 2],
                "retry_on": ["transient_network", "rate_limited"]
            }
        ],
        "roles": {"support_agent": ["runs:read", "runs:write"]},
        "limits": limits,
        "policies": policies
    })
}

pub struct TestBed {
    pub store: Arc<InMemoryStore>,
    pub hub: Arc<StreamHub>,
    pub tools: Arc<StubToolRunner>,
    pub pipeline: Arc<Pipeline>,
    pub streamer: Streamer,
}

pub fn testbed(registry: Value, planner: Arc<dyn PlannerAdapter>) -> TestBed {
    testbed_with_timeout(registry, planner, None)
}

pub fn testbed_with_timeout(
    registry: Value,
    planner: Arc<dyn PlannerAdapter>,
    approval_timeout: Option<Duration>,
) -> TestBed {
    let store = Arc::new(InMemoryStore::new(KeyRegistry::single("test_secret")));
    let store_dyn: Arc<dyn aether_kernel::domain::store::Store> = store.clone();
    let hub = Arc::new(StreamHub::default());
    let tools = Arc::new(StubToolRunner::new());
    let registry = EffectiveRegistry::from_value(registry).expect("test registry parses");
    let pipeline = Arc::new(Pipeline::new(
        Arc::clone(&store_dyn),
        Arc::clone(&hub),
        Arc::new(StaticRegistryProvider::new(registry)),
        planner,
        Arc::new(StubContextProvider),
        tools.clone(),
        4,
        60,
        approval_timeout,
    ));
    let streamer = Streamer::new(Arc::clone(&store_dyn), Arc::clone(&hub), HEARTBEAT);
    TestBed { store, hub, tools, pipeline, streamer }
}

pub fn default_testbed() -> TestBed {
    testbed(support_registry(json!([]), json!({})), Arc::new(StubPlanner::new()))
}

pub fn mission(task: &str) -> MissionInput {
    MissionInput {
        task_id: TaskId(task.into()),
        tenant_id: "tenant_demo".into(),
        org_id: Some("org_acme".into()),
        user_id: Some("user_1".into()),
        roles: vec!["support_agent".into()],
        user_message: "refund for defective unit".into(),
        title: None,
        tags: vec!["support".into()],
    }
}

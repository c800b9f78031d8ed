// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Policy gating at plan and exec time, and obligation enforcement.

mod common;

use serde_json::json;
use std::sync::Arc;

use aether_kernel::domain::error::ErrorClass;
use aether_kernel::domain::event::{ArtifactType, EventPayload};
use aether_kernel::domain::plan::{StepResult, StepStatus};
use aether_kernel::domain::run::{RunId, RunState};
use aether_kernel::domain::store::Store;
use aether_kernel::infrastructure::adapters::StubPlanner;

use common::{mission, support_registry, testbed};

async fn step_results(
    store: &aether_kernel::infrastructure::store::InMemoryStore,
    run_id: &RunId,
) -> Vec<StepResult> {
    store
        .get_events(run_id, 0)
        .await
        .unwrap()
        .iter()
        .filter_map(|e| match &e.payload {
            EventPayload::TaskArtifactUpdateEvent {
                artifact_type: ArtifactType::StepResult,
                artifact,
                ..
            } => serde_json::from_value(artifact.clone()).ok(),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn exec_phase_deny_fails_the_step_and_the_run() {
    let policies = json!([
        {"policy_id": "pol_block_email", "phase": "exec", "priority": 10,
         "when": {"action": "act_email_send_v1"},
         "effect": {"deny": true, "deny_reason": "blocked"}}
    ]);
    let bed = testbed(support_registry(policies, json!({})), Arc::new(StubPlanner::new()));

    let m = mission("t_deny");
    assert_eq!(bed.pipeline.run(m.clone()).await.unwrap(), RunState::Failed);

    let run_id = RunId::for_task(&m.task_id);
    let results = step_results(&bed.store, &run_id).await;
    let email = results.iter().find(|r| r.action_id == "act_email_send_v1").unwrap();
    assert_eq!(email.status, StepStatus::Failed);
    let err = email.error.as_ref().unwrap();
    assert_eq!(err.class, ErrorClass::PolicyDenied);
    assert!(err.message.contains("blocked"));

    // the email tool was never invoked; only the lookup ran
    assert_eq!(bed.tools.calls_for("email.send"), 0);

    // the terminal status carries the deny reason
    let events = bed.store.get_events(&run_id, 0).await.unwrap();
    let last = events.last().unwrap();
    let frame: serde_json::Value = serde_json::from_str(last.frame()).unwrap();
    assert_eq!(frame["state"], "failed");
    assert!(frame["meta"]["message"].as_str().unwrap().contains("blocked"));
}

#[tokio::test]
async fn plan_phase_deny_stops_before_any_execution() {
    let policies = json!([
        {"policy_id": "pol_no_email_plans", "phase": "plan", "priority": 5,
         "when": {"action": "act_email_send_v1"},
         "effect": {"deny": true, "deny_reason": "tenant forbids outbound email"}}
    ]);
    let bed = testbed(support_registry(policies, json!({})), Arc::new(StubPlanner::new()));

    let m = mission("t_plan_deny");
    assert_eq!(bed.pipeline.run(m).await.unwrap(), RunState::Failed);
    assert_eq!(bed.tools.invocation_count(), 0);
}

#[tokio::test]
async fn plan_phase_policy_injects_approval_requirement() {
    let policies = json!([
        {"policy_id": "pol_gate_side_effects", "phase": "plan", "priority": 5,
         "when": {"action": "act_email_send_v1"},
         "effect": {"require_approval": true}}
    ]);
    // planner itself does not ask for approval; the policy does
    let bed = testbed(support_registry(policies, json!({})), Arc::new(StubPlanner::new()));

    let m = mission("t_injected_gate");
    let run_id = RunId::for_task(&m.task_id);
    let pipeline = bed.pipeline.clone();
    let handle = tokio::spawn(async move { pipeline.run(m).await });

    // the run parks awaiting approval
    let mut pending = false;
    for _ in 0..200 {
        if let Some(approval) = bed.store.get_approval(&run_id).await.unwrap() {
            if approval.is_pending() {
                pending = true;
                break;
            }
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert!(pending, "policy-injected approval never materialized");

    bed.store
        .decide_approval(
            &run_id,
            aether_kernel::domain::approval::ApprovalDecision::approved_by("ops"),
        )
        .await
        .unwrap();
    assert_eq!(handle.await.unwrap().unwrap(), RunState::Completed);
}

#[tokio::test]
async fn matched_policy_reference_satisfies_the_obligation() {
    let policies = json!([
        {"policy_id": "pol_email_guard", "phase": "exec", "priority": 10,
         "when": {"action": "act_email_send_v1"},
         "effect": {"obligations": [
             {"type": "must_reference_policy_id", "policy_id": "pol_email_guard"}
         ]}}
    ]);
    let bed = testbed(support_registry(policies, json!({})), Arc::new(StubPlanner::new()));

    let m = mission("t_obligation_ok");
    assert_eq!(bed.pipeline.run(m.clone()).await.unwrap(), RunState::Completed);

    let results = step_results(&bed.store, &RunId::for_task(&m.task_id)).await;
    let email = results.iter().find(|r| r.action_id == "act_email_send_v1").unwrap();
    assert!(email.policy_ids.contains(&"pol_email_guard".to_string()));
}

#[tokio::test]
async fn missing_policy_reference_denies_the_side_effect() {
    let policies = json!([
        {"policy_id": "pol_email_guard", "phase": "exec", "priority": 10,
         "when": {"action": "act_email_send_v1"},
         "effect": {"obligations": [
             {"type": "must_reference_policy_id", "policy_id": "pol_absent"}
         ]}}
    ]);
    let bed = testbed(support_registry(policies, json!({})), Arc::new(StubPlanner::new()));

    let m = mission("t_obligation_missing");
    assert_eq!(bed.pipeline.run(m.clone()).await.unwrap(), RunState::Failed);

    let results = step_results(&bed.store, &RunId::for_task(&m.task_id)).await;
    let email = results.iter().find(|r| r.action_id == "act_email_send_v1").unwrap();
    assert_eq!(email.status, StepStatus::Failed);
    let err = email.error.as_ref().unwrap();
    assert_eq!(err.class, ErrorClass::PolicyDenied);
    assert!(err.message.contains("pol_absent"));
}

#[tokio::test]
async fn artifact_obligations_hold_over_the_event_log() {
    let policies = json!([
        {"policy_id": "pol_must_finalize", "phase": "plan", "priority": 1,
         "when": {"action": "*"},
         "effect": {"obligations": [
             {"type": "must_emit_artifact", "artifact_type": "final"},
             {"type": "must_emit_artifact", "artifact_type": "step_result"}
         ]}}
    ]);
    let bed = testbed(support_registry(policies, json!({})), Arc::new(StubPlanner::new()));

    let m = mission("t_artifact_obligation");
    assert_eq!(bed.pipeline.run(m.clone()).await.unwrap(), RunState::Completed);

    let events = bed.store.get_events(&RunId::for_task(&m.task_id), 0).await.unwrap();
    let artifacts: Vec<ArtifactType> =
        events.iter().filter_map(|e| e.payload.artifact_type()).collect();
    assert!(artifacts.contains(&ArtifactType::Final));
    assert!(artifacts.contains(&ArtifactType::StepResult));
}

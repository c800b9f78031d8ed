// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Policy evaluation.
//!
//! Selects the rules for the requested phase, orders them by priority
//! descending, and folds matching effects into a single [`Verdict`]:
//!
//! - `deny` is sticky: once set, no later rule can re-allow
//! - `require_approval` is the OR across matched rules
//! - `set_cost_units` takes the last matching value
//! - obligations accumulate as a set
//! - `matched_policy_ids` records every rule whose condition matched,
//!   regardless of its effect

use crate::domain::policy::{PolicyPhase, PolicySubject, Verdict};
use crate::domain::registry::EffectiveRegistry;
use crate::domain::run::RunContext;

pub struct PolicyEngine;

impl PolicyEngine {
    pub fn evaluate(
        registry: &EffectiveRegistry,
        ctx: &RunContext,
        phase: PolicyPhase,
        subject: &PolicySubject<'_>,
    ) -> Verdict {
        let mut verdict = Verdict::allow_all();

        for rule in registry.policies_for(phase) {
            if !rule.when.matches(subject, &ctx.roles) {
                continue;
            }
            verdict.matched_policy_ids.push(rule.policy_id.clone());

            let effect = &rule.effect;
            if effect.deny && verdict.allow {
                verdict.allow = false;
                verdict.deny_reason = Some(
                    effect
                        .deny_reason
                        .clone()
                        .unwrap_or_else(|| format!("denied by {}", rule.policy_id)),
                );
            }
            if effect.require_approval {
                verdict.require_approval = true;
            }
            if let Some(cost) = effect.set_cost_units {
                verdict.effective_cost_units = Some(cost);
            }
            for obligation in &effect.obligations {
                if !verdict.obligations.contains(obligation) {
                    verdict.obligations.push(obligation.clone());
                }
            }
        }
        verdict
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::event::ArtifactType;
    use crate::domain::policy::Obligation;
    use crate::domain::registry::EffectiveRegistry;
    use serde_json::json;

    fn registry(policies: serde_json::Value) -> EffectiveRegistry {
        EffectiveRegistry::from_value(json!({ "policies": policies })).unwrap()
    }

    fn ctx(roles: &[&str]) -> RunContext {
        RunContext {
            tenant_id: "tenant_demo".into(),
            org_id: None,
            user_id: None,
            roles: roles.iter().map(|r| r.to_string()).collect(),
        }
    }

    fn subject(action: &str) -> PolicySubject<'_> {
        PolicySubject { action_id: Some(action), tool_id: None }
    }

    #[test]
    fn deny_is_sticky_over_later_allows() {
        let reg = registry(json!([
            {"policy_id": "block_email", "phase": "exec", "priority": 10,
             "when": {"action": "send_email"},
             "effect": {"deny": true, "deny_reason": "blocked"}},
            {"policy_id": "permissive", "phase": "exec", "priority": 1,
             "when": {"action": "*"}, "effect": {}}
        ]));
        let verdict =
            PolicyEngine::evaluate(&reg, &ctx(&["support_agent"]), PolicyPhase::Exec, &subject("send_email"));
        assert!(!verdict.allow);
        assert_eq!(verdict.deny_reason.as_deref(), Some("blocked"));
        // both rules matched and are recorded
        assert_eq!(verdict.matched_policy_ids, vec!["block_email", "permissive"]);
    }

    #[test]
    fn require_approval_is_or_and_cost_is_last_match() {
        let reg = registry(json!([
            {"policy_id": "p_high", "phase": "plan", "priority": 10,
             "when": {"action": "send_*"},
             "effect": {"require_approval": true, "set_cost_units": 7}},
            {"policy_id": "p_low", "phase": "plan", "priority": 1,
             "when": {"action": "*"},
             "effect": {"set_cost_units": 2}}
        ]));
        let verdict =
            PolicyEngine::evaluate(&reg, &ctx(&[]), PolicyPhase::Plan, &subject("send_email"));
        assert!(verdict.allow);
        assert!(verdict.require_approval);
        // lower-priority rule is encountered later and wins the override
        assert_eq!(verdict.effective_cost_units, Some(2));
    }

    #[test]
    fn obligations_accumulate_without_duplicates() {
        let reg = registry(json!([
            {"policy_id": "p1", "phase": "plan", "priority": 2,
             "when": {"action": "*"},
             "effect": {"obligations": [{"type": "must_emit_artifact", "artifact_type": "final"}]}},
            {"policy_id": "p2", "phase": "plan", "priority": 1,
             "when": {"action": "*"},
             "effect": {"obligations": [
                 {"type": "must_emit_artifact", "artifact_type": "final"},
                 {"type": "must_reference_policy_id", "policy_id": "p1"}
             ]}}
        ]));
        let verdict = PolicyEngine::evaluate(&reg, &ctx(&[]), PolicyPhase::Plan, &subject("x"));
        assert_eq!(
            verdict.obligations,
            vec![
                Obligation::MustEmitArtifact { artifact_type: ArtifactType::Final },
                Obligation::MustReferencePolicyId { policy_id: "p1".into() },
            ]
        );
    }

    #[test]
    fn phase_filter_excludes_other_phase_rules() {
        let reg = registry(json!([
            {"policy_id": "exec_only", "phase": "exec", "priority": 1,
             "when": {"action": "*"}, "effect": {"deny": true}}
        ]));
        let verdict = PolicyEngine::evaluate(&reg, &ctx(&[]), PolicyPhase::Plan, &subject("x"));
        assert!(verdict.allow);
        assert!(verdict.matched_policy_ids.is_empty());
    }

    #[test]
    fn role_conditions_gate_on_caller_roles() {
        let reg = registry(json!([
            {"policy_id": "needs_admin", "phase": "exec", "priority": 1,
             "when": {"all": [{"action": "export_*"}, {"not": {"roles_any": ["admin"]}}]},
             "effect": {"deny": true, "deny_reason": "admin only"}}
        ]));
        let denied =
            PolicyEngine::evaluate(&reg, &ctx(&["support_agent"]), PolicyPhase::Exec, &subject("export_data"));
        assert!(!denied.allow);
        let allowed =
            PolicyEngine::evaluate(&reg, &ctx(&["admin"]), PolicyPhase::Exec, &subject("export_data"));
        assert!(allowed.allow);
    }
}

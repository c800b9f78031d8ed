// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Layered registry: tools, actions, policies, roles, limits, retry classes.
//!
//! Documents merge base → org → tenant → user. The list sections
//! (`tools`/`actions`/`policies`) merge by id with later layers replacing
//! whole entries; everything else deep-merges with later layers winning.
//! The merged result is an immutable [`EffectiveRegistry`] snapshot.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::domain::error::ErrorClass;
use crate::domain::policy::{PolicyPhase, PolicyRule};

// ============================================================================
// Registry entries
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolEntry {
    pub tool_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyStrategy {
    Hash,
    ExplicitKey,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencySpec {
    pub strategy: IdempotencyStrategy,
    /// For `hash`: restrict the digest to these arg fields (all when empty).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionSecurity {
    #[serde(default)]
    pub allowed_roles: Vec<String>,
    #[serde(default)]
    pub requires_approval: bool,
}

/// Registry-declared contract for a tool operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionEntry {
    pub action_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub tool_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_in: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_out: Option<Value>,
    #[serde(default)]
    pub side_effect: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_class: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency: Option<IdempotencySpec>,
    #[serde(default)]
    pub security: ActionSecurity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_units: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// Named retry schedule referenced by actions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryClass {
    pub id: String,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff_ms: Vec<u64>,
    #[serde(default)]
    pub jitter: bool,
    #[serde(default)]
    pub retry_on: Vec<ErrorClass>,
}

fn default_max_attempts() -> u32 {
    1
}

impl RetryClass {
    /// Single-attempt class used when an action names no retry class.
    pub fn none() -> Self {
        Self { id: "none".into(), max_attempts: 1, backoff_ms: vec![], jitter: false, retry_on: vec![] }
    }
}

// ============================================================================
// Limits
// ============================================================================

fn unlimited() -> u64 {
    1_000_000_000
}

fn default_llm_cost() -> u64 {
    10
}

fn default_tenant_rpm() -> u64 {
    600
}

fn default_user_rpm() -> u64 {
    120
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantLimits {
    #[serde(default = "unlimited")]
    pub max_tool_calls: u64,
    #[serde(default = "unlimited")]
    pub max_llm_calls: u64,
    #[serde(default = "unlimited")]
    pub max_cost_units: u64,
    #[serde(default = "default_llm_cost")]
    pub llm_call_cost_units: u64,
    #[serde(default = "default_tenant_rpm")]
    pub tenant_rpm: u64,
    #[serde(default = "default_user_rpm")]
    pub user_rpm: u64,
    #[serde(default = "default_tenant_rpm")]
    pub org_rpm: u64,
}

impl Default for TenantLimits {
    fn default() -> Self {
        serde_json::from_value(Value::Object(Default::default())).expect("defaults are total")
    }
}

// ============================================================================
// Document & merge
// ============================================================================

/// A fully merged registry document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistryDoc {
    #[serde(default)]
    pub registry_id: String,
    #[serde(default)]
    pub schema_version: String,
    #[serde(default)]
    pub tools: Vec<ToolEntry>,
    #[serde(default)]
    pub actions: Vec<ActionEntry>,
    #[serde(default)]
    pub policies: Vec<PolicyRule>,
    /// role name → capability set (e.g. `runs:write`, `registry:read`).
    #[serde(default)]
    pub roles: HashMap<String, Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<TenantLimits>,
    #[serde(default)]
    pub retry: Vec<RetryClass>,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry document is malformed: {0}")]
    Malformed(String),
    #[error("failed to read registry layer {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Deep-merge `layer` into `base`; objects merge recursively, everything
/// else is replaced by the layer value.
pub fn deep_merge(base: Value, layer: Value) -> Value {
    match (base, layer) {
        (Value::Object(mut b), Value::Object(l)) => {
            for (k, v) in l {
                let merged = match b.remove(&k) {
                    Some(existing) => deep_merge(existing, v),
                    None => v,
                };
                b.insert(k, merged);
            }
            Value::Object(b)
        }
        (_, layer) => layer,
    }
}

fn merge_indexed_list(base: &[Value], layer: &[Value], key: &str) -> Vec<Value> {
    let mut out: Vec<Value> = Vec::with_capacity(base.len() + layer.len());
    let layer_id = |v: &Value| v.get(key).and_then(Value::as_str).map(str::to_owned);

    for entry in base {
        let replaced = layer_id(entry)
            .and_then(|id| layer.iter().find(|l| layer_id(l).as_deref() == Some(id.as_str())));
        out.push(replaced.cloned().unwrap_or_else(|| entry.clone()));
    }
    for entry in layer {
        let Some(id) = layer_id(entry) else { continue };
        let known = base.iter().any(|b| layer_id(b).as_deref() == Some(id.as_str()));
        if !known {
            out.push(entry.clone());
        }
    }
    out
}

/// Apply one override layer to a base document, both as raw JSON.
pub fn apply_layer(base: Value, layer: &Value) -> Value {
    let Value::Object(layer_obj) = layer else {
        return base;
    };
    let mut out = match base {
        Value::Object(o) => o,
        _ => Default::default(),
    };

    for (section, id_key) in
        [("tools", "tool_id"), ("actions", "action_id"), ("policies", "policy_id")]
    {
        let Some(layer_list) = layer_obj.get(section).and_then(Value::as_array) else {
            continue;
        };
        let base_list = out.get(section).and_then(Value::as_array).cloned().unwrap_or_default();
        out.insert(section.into(), Value::Array(merge_indexed_list(&base_list, layer_list, id_key)));
    }

    for (k, v) in layer_obj {
        if matches!(k.as_str(), "tools" | "actions" | "policies") {
            continue;
        }
        let merged = match out.remove(k) {
            Some(existing) => deep_merge(existing, v.clone()),
            None => v.clone(),
        };
        out.insert(k.clone(), merged);
    }
    Value::Object(out)
}

// ============================================================================
// Effective snapshot
// ============================================================================

/// Immutable merged registry for one (org, tenant, user) triple.
///
/// Updates replace the whole snapshot; nothing here mutates after load.
#[derive(Debug, Clone)]
pub struct EffectiveRegistry {
    doc: RegistryDoc,
    limits: TenantLimits,
}

impl EffectiveRegistry {
    pub fn from_value(merged: Value) -> Result<Self, RegistryError> {
        let doc: RegistryDoc =
            serde_json::from_value(merged).map_err(|e| RegistryError::Malformed(e.to_string()))?;
        Ok(Self::new(doc))
    }

    pub fn new(doc: RegistryDoc) -> Self {
        let limits = doc.limits.clone().unwrap_or_default();
        Self { doc, limits }
    }

    pub fn doc(&self) -> &RegistryDoc {
        &self.doc
    }

    pub fn limits(&self) -> &TenantLimits {
        &self.limits
    }

    pub fn action(&self, action_id: &str) -> Option<&ActionEntry> {
        self.doc.actions.iter().find(|a| a.action_id == action_id)
    }

    pub fn tool(&self, tool_id: &str) -> Option<&ToolEntry> {
        self.doc.tools.iter().find(|t| t.tool_id == tool_id)
    }

    /// Rules for a phase, priority descending (stable for equal priorities).
    pub fn policies_for(&self, phase: PolicyPhase) -> Vec<&PolicyRule> {
        let mut rules: Vec<&PolicyRule> =
            self.doc.policies.iter().filter(|p| p.phase == phase).collect();
        rules.sort_by_key(|p| std::cmp::Reverse(p.priority));
        rules
    }

    pub fn retry_class(&self, id: Option<&str>) -> RetryClass {
        id.and_then(|id| self.doc.retry.iter().find(|rc| rc.id == id))
            .cloned()
            .unwrap_or_else(RetryClass::none)
    }

    pub fn role_capabilities(&self, role: &str) -> &[String] {
        self.doc.roles.get(role).map(Vec::as_slice).unwrap_or(&[])
    }

    /// True when any of the caller's roles grants the capability.
    pub fn has_capability(&self, roles: &[String], capability: &str) -> bool {
        roles.iter().any(|r| {
            self.role_capabilities(r).iter().any(|c| c == capability || c == "*")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn base_doc() -> Value {
        json!({
            "registry_id": "reg_support_v1",
            "schema_version": "1",
            "tools": [
                {"tool_id": "crm.get_customer"},
                {"tool_id": "email.send"}
            ],
            "actions": [
                {"action_id": "act_email_send_v1", "tool_id": "email.send", "side_effect": true, "cost_units": 3}
            ],
            "policies": [
                {"policy_id": "pol_base", "phase": "exec", "priority": 1,
                 "when": {"action": "*"}, "effect": {}}
            ],
            "roles": {"support_agent": ["runs:read", "runs:write"]},
            "limits": {"max_tool_calls": 50}
        })
    }

    #[test]
    fn layer_replaces_entries_by_id() {
        let layer = json!({
            "actions": [
                {"action_id": "act_email_send_v1", "tool_id": "email.send", "side_effect": true, "cost_units": 9}
            ]
        });
        let merged = apply_layer(base_doc(), &layer);
        let reg = EffectiveRegistry::from_value(merged).unwrap();
        assert_eq!(reg.action("act_email_send_v1").unwrap().cost_units, Some(9));
        // untouched sections survive
        assert!(reg.tool("crm.get_customer").is_some());
    }

    #[test]
    fn layer_appends_new_entries_after_base_order() {
        let layer = json!({
            "tools": [{"tool_id": "ticket.create"}]
        });
        let merged = apply_layer(base_doc(), &layer);
        let reg = EffectiveRegistry::from_value(merged).unwrap();
        let ids: Vec<&str> = reg.doc().tools.iter().map(|t| t.tool_id.as_str()).collect();
        assert_eq!(ids, vec!["crm.get_customer", "email.send", "ticket.create"]);
    }

    #[test]
    fn scalar_sections_deep_merge_with_later_layers_winning() {
        let layer = json!({
            "limits": {"max_cost_units": 100},
            "roles": {"support_agent": ["runs:read"]}
        });
        let merged = apply_layer(base_doc(), &layer);
        let reg = EffectiveRegistry::from_value(merged).unwrap();
        assert_eq!(reg.limits().max_tool_calls, 50);
        assert_eq!(reg.limits().max_cost_units, 100);
        assert_eq!(reg.role_capabilities("support_agent"), &["runs:read".to_string()]);
    }

    #[test]
    fn policies_sorted_by_priority_descending() {
        let doc = json!({
            "policies": [
                {"policy_id": "low", "phase": "exec", "priority": 1, "when": {"action": "*"}, "effect": {}},
                {"policy_id": "high", "phase": "exec", "priority": 10, "when": {"action": "*"}, "effect": {}},
                {"policy_id": "plan_only", "phase": "plan", "priority": 99, "when": {"action": "*"}, "effect": {}}
            ]
        });
        let reg = EffectiveRegistry::from_value(doc).unwrap();
        let ids: Vec<&str> =
            reg.policies_for(PolicyPhase::Exec).iter().map(|p| p.policy_id.as_str()).collect();
        assert_eq!(ids, vec!["high", "low"]);
    }
}

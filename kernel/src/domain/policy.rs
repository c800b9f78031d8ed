// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Data-driven policy DSL.
//!
//! Policies are declarative rules shipped in the registry. A rule matches a
//! subject (an action/tool under a phase, plus the caller's roles) through a
//! composable condition tree and contributes an effect. Combination rules
//! live in the policy engine; this module owns the types and the matcher.

use serde::{Deserialize, Serialize};

use crate::domain::event::ArtifactType;

// ============================================================================
// Conditions
// ============================================================================

/// Composable match condition.
///
/// Leaf conditions match the subject's action id, tool id, or the caller's
/// roles; `all`/`any`/`not` compose. The tree shape makes cycles impossible.
/// A condition with an unrecognized keyword deserializes to `Unknown` and
/// never matches (fail closed).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    Action(String),
    Tool(String),
    RolesAny(Vec<String>),
    RolesAll(Vec<String>),
    All(Vec<Condition>),
    Any(Vec<Condition>),
    Not(Box<Condition>),
    #[serde(untagged)]
    Unknown(serde_json::Value),
}

/// Subject a condition is evaluated against.
#[derive(Debug, Clone, Copy, Default)]
pub struct PolicySubject<'a> {
    pub action_id: Option<&'a str>,
    pub tool_id: Option<&'a str>,
}

impl Condition {
    pub fn matches(&self, subject: &PolicySubject<'_>, roles: &[String]) -> bool {
        match self {
            Self::Action(pattern) => {
                subject.action_id.map(|a| wildcard_match(a, pattern)).unwrap_or(false)
            }
            Self::Tool(pattern) => {
                subject.tool_id.map(|t| wildcard_match(t, pattern)).unwrap_or(false)
            }
            Self::RolesAny(wanted) => wanted.iter().any(|r| roles.contains(r)),
            Self::RolesAll(wanted) => wanted.iter().all(|r| roles.contains(r)),
            Self::All(conds) => conds.iter().all(|c| c.matches(subject, roles)),
            Self::Any(conds) => conds.iter().any(|c| c.matches(subject, roles)),
            Self::Not(cond) => !cond.matches(subject, roles),
            Self::Unknown(_) => false,
        }
    }
}

/// Glob match where `*` spans any run of non-separator characters and `:`
/// is significant (`mcp:*` matches `mcp:crm` but not `mcp:crm:export`).
pub fn wildcard_match(value: &str, pattern: &str) -> bool {
    fn rec(v: &[u8], p: &[u8]) -> bool {
        match p.split_first() {
            None => v.is_empty(),
            Some((&b'*', rest)) => {
                if rec(v, rest) {
                    return true;
                }
                let mut i = 0;
                while i < v.len() && v[i] != b':' {
                    i += 1;
                    if rec(&v[i..], rest) {
                        return true;
                    }
                }
                false
            }
            Some((&c, rest)) => !v.is_empty() && v[0] == c && rec(&v[1..], rest),
        }
    }
    rec(value.as_bytes(), pattern.as_bytes())
}

// ============================================================================
// Effects & obligations
// ============================================================================

/// Side condition that must hold before a run may complete.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Obligation {
    /// An artifact of the given type must appear in the event stream.
    MustEmitArtifact { artifact_type: ArtifactType },
    /// Side-effect steps must carry this policy id in their `policy_ids`.
    MustReferencePolicyId { policy_id: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Effect {
    #[serde(default)]
    pub deny: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deny_reason: Option<String>,
    #[serde(default)]
    pub require_approval: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub set_cost_units: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub obligations: Vec<Obligation>,
}

// ============================================================================
// Rules & verdicts
// ============================================================================

/// Phase at which a rule applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyPhase {
    Plan,
    Exec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyRule {
    pub policy_id: String,
    pub phase: PolicyPhase,
    #[serde(default)]
    pub priority: i32,
    pub when: Condition,
    pub effect: Effect,
}

/// Combined outcome of evaluating all matching rules for a subject.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub allow: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deny_reason: Option<String>,
    #[serde(default)]
    pub require_approval: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effective_cost_units: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub obligations: Vec<Obligation>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub matched_policy_ids: Vec<String>,
}

impl Verdict {
    pub fn allow_all() -> Self {
        Self { allow: true, ..Default::default() }
    }

    pub fn requires_policy_reference(&self) -> Option<&str> {
        self.obligations.iter().find_map(|o| match o {
            Obligation::MustReferencePolicyId { policy_id } => Some(policy_id.as_str()),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wildcard_respects_separator() {
        assert!(wildcard_match("send_email", "send_email"));
        assert!(wildcard_match("send_email", "send_*"));
        assert!(wildcard_match("mcp:crm", "mcp:*"));
        assert!(!wildcard_match("mcp:crm:export", "mcp:*"));
        assert!(wildcard_match("mcp:crm:export", "mcp:*:export"));
        assert!(!wildcard_match("smtp:send", "mcp:*"));
        assert!(wildcard_match("anything", "*"));
        assert!(!wildcard_match("a:b", "*"));
    }

    #[test]
    fn condition_composition() {
        let cond: Condition = serde_json::from_value(json!({
            "all": [
                {"action": "send_*"},
                {"not": {"roles_any": ["admin"]}}
            ]
        }))
        .unwrap();

        let subject = PolicySubject { action_id: Some("send_email"), tool_id: None };
        assert!(cond.matches(&subject, &["support_agent".into()]));
        assert!(!cond.matches(&subject, &["admin".into()]));
    }

    #[test]
    fn unknown_condition_keyword_fails_closed() {
        let cond: Condition =
            serde_json::from_value(json!({"time_of_day": "09:00-17:00"})).unwrap();
        assert!(matches!(cond, Condition::Unknown(_)));
        let subject = PolicySubject { action_id: Some("send_email"), tool_id: None };
        assert!(!cond.matches(&subject, &[]));
    }

    #[test]
    fn obligations_parse_tagged() {
        let ob: Obligation = serde_json::from_value(json!({
            "type": "must_emit_artifact", "artifact_type": "final"
        }))
        .unwrap();
        assert_eq!(ob, Obligation::MustEmitArtifact { artifact_type: ArtifactType::Final });

        assert!(serde_json::from_value::<Obligation>(json!({
            "type": "must_call_home"
        }))
        .is_err());
    }
}

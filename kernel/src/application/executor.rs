// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Deterministic step executor.
//!
//! For one step: bind args, gate against exec-phase policy, derive the
//! idempotency key, consult the dedup cache, debit the budget, invoke the
//! tool under its retry class, check obligations, persist. Steps run in
//! topological waves; independent steps share a bounded parallelism
//! budget. A failed step blocks its dependents and, unless it opted into
//! `continue_on_error`, fails the run.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::application::emit::Emitter;
use crate::application::policy_engine::PolicyEngine;
use crate::domain::error::{ErrorClass, StepError};
use crate::domain::event::ArtifactType;
use crate::domain::plan::{Plan, Step, StepResult, StepStatus};
use crate::domain::policy::{PolicyPhase, PolicySubject};
use crate::domain::ports::{ToolAdapter, ToolFailure, ToolRequest};
use crate::domain::registry::{
    ActionEntry, EffectiveRegistry, IdempotencySpec, IdempotencyStrategy, RetryClass,
};
use crate::domain::run::{BudgetDelta, RunContext, RunState};
use crate::domain::store::{RateScope, Store, StoreError};
use crate::infrastructure::canonical::{canonical_json, sha256_hex};

const DEFAULT_TIMEOUT_MS: u64 = 15_000;
const DEFAULT_BACKOFF_MS: u64 = 250;
const MAX_BACKOFF_MS: u64 = 30_000;

/// What the executor hands back to the pipeline after driving the DAG.
#[derive(Debug)]
pub struct ExecutionOutcome {
    pub results: Vec<StepResult>,
    /// First failure of a step that did not opt into `continue_on_error`.
    pub fatal: Option<StepError>,
    /// The run was canceled externally; execution stopped at a wave
    /// boundary.
    pub canceled: bool,
}

pub struct StepExecutor {
    store: Arc<dyn Store>,
    tools: Arc<dyn ToolAdapter>,
    parallelism: usize,
    rate_window_s: u64,
}

impl StepExecutor {
    pub fn new(
        store: Arc<dyn Store>,
        tools: Arc<dyn ToolAdapter>,
        parallelism: usize,
        rate_window_s: u64,
    ) -> Self {
        Self { store, tools, parallelism: parallelism.max(1), rate_window_s: rate_window_s.max(1) }
    }

    /// Tool invocations are privileged operations: every attempt hits the
    /// caller's fixed-window counters. A breach surfaces as a
    /// `rate_limited` failure carrying the window reset as retry-after.
    async fn rate_gate(
        &self,
        ctx: &RunContext,
        registry: &EffectiveRegistry,
    ) -> Result<Option<ToolFailure>, StoreError> {
        let limits = registry.limits();
        let mut hits: Vec<(RateScope, &str, u64)> =
            vec![(RateScope::Tenant, ctx.tenant_id.as_str(), limits.tenant_rpm)];
        if let Some(user_id) = &ctx.user_id {
            hits.push((RateScope::User, user_id, limits.user_rpm));
        }
        if let Some(org_id) = &ctx.org_id {
            hits.push((RateScope::Org, org_id, limits.org_rpm));
        }
        for (scope, scope_id, limit) in hits {
            match self.store.rate_hit(scope, scope_id, limit, self.rate_window_s).await {
                Ok(_) => {}
                Err(StoreError::RateLimited { scope, scope_id, reset_in_s }) => {
                    return Ok(Some(ToolFailure {
                        class: ErrorClass::RateLimited,
                        message: format!("rate limit exceeded for {scope}:{scope_id}"),
                        retry_after_ms: Some(reset_in_s.saturating_mul(1000)),
                    }));
                }
                Err(other) => return Err(other),
            }
        }
        Ok(None)
    }

    /// Drive the whole plan in dependency order, emitting a `step_result`
    /// artifact per step as it lands.
    pub async fn execute_plan(
        &self,
        ctx: &RunContext,
        plan: &Plan,
        registry: &EffectiveRegistry,
        emitter: &Emitter,
    ) -> Result<ExecutionOutcome, StoreError> {
        let waves = plan
            .waves()
            .map_err(|e| StoreError::Conflict(format!("plan failed validation: {e}")))?;

        let semaphore = Arc::new(Semaphore::new(self.parallelism));
        let mut outputs: HashMap<String, Value> = HashMap::new();
        let mut blocked: HashSet<String> = HashSet::new();
        let mut results: Vec<StepResult> = Vec::with_capacity(plan.steps.len());
        let mut fatal: Option<StepError> = None;
        let mut canceled = false;

        'waves: for wave in waves {
            // cancellation is honored between steps, at wave boundaries
            if let Some(run) = self.store.get_run(emitter.run_id()).await? {
                if run.state == RunState::Canceled {
                    canceled = true;
                    break 'waves;
                }
            }

            let mut wave_results: Vec<StepResult> = Vec::with_capacity(wave.len());
            let mut pending = Vec::new();
            for idx in wave {
                let step = &plan.steps[idx];
                if step.depends_on.iter().any(|d| blocked.contains(d.as_str())) {
                    wave_results.push(skipped_result(step));
                    continue;
                }
                let semaphore = Arc::clone(&semaphore);
                let outputs = &outputs;
                let run_id = emitter.run_id();
                pending.push(async move {
                    let _permit = semaphore.acquire().await.expect("executor semaphore closed");
                    self.execute_step(run_id, ctx, registry, step, outputs).await
                });
            }
            for result in futures::future::join_all(pending).await {
                wave_results.push(result?);
            }

            for result in wave_results {
                emitter
                    .artifact(ArtifactType::StepResult, serde_json::to_value(&result)?)
                    .await?;
                match result.status {
                    StepStatus::Succeeded => {
                        outputs.insert(result.step_id.clone(), result.output.clone());
                    }
                    StepStatus::Failed | StepStatus::Skipped => {
                        blocked.insert(result.step_id.clone());
                        let continues = plan
                            .step(&result.step_id)
                            .map(|s| s.continue_on_error)
                            .unwrap_or(false);
                        if result.status == StepStatus::Failed && !continues && fatal.is_none() {
                            fatal = result.error.clone();
                        }
                    }
                }
                results.push(result);
            }

            if fatal.is_some() {
                break 'waves;
            }
        }

        Ok(ExecutionOutcome { results, fatal, canceled })
    }

    async fn execute_step(
        &self,
        run_id: &crate::domain::run::RunId,
        ctx: &RunContext,
        registry: &EffectiveRegistry,
        step: &Step,
        outputs: &HashMap<String, Value>,
    ) -> Result<StepResult, StoreError> {
        let Some(action) = registry.action(&step.action_id) else {
            return Ok(failed_result(
                step,
                "",
                StepError::new(ErrorClass::InvalidInput, format!("unknown action_id: {}", step.action_id)),
                1,
                String::new(),
                step.policy_ids.clone(),
            ));
        };
        let tool_id = action.tool_id.clone();

        // 1. bind args against prior outputs, then shape-check
        let args = resolve_args(&step.args, outputs);
        if let Err(message) = check_input_shape(action, &args) {
            return Ok(failed_result(
                step,
                &tool_id,
                StepError::new(ErrorClass::InvalidInput, message),
                1,
                String::new(),
                step.policy_ids.clone(),
            ));
        }

        // 2. exec-phase gate: step-local RBAC, then policy rules
        if !action.security.allowed_roles.is_empty()
            && !action.security.allowed_roles.iter().any(|r| ctx.roles.contains(r))
        {
            return Ok(failed_result(
                step,
                &tool_id,
                StepError::new(ErrorClass::PolicyDenied, "role not allowed for action"),
                1,
                String::new(),
                step.policy_ids.clone(),
            ));
        }
        let subject = PolicySubject { action_id: Some(&step.action_id), tool_id: Some(&tool_id) };
        let verdict = PolicyEngine::evaluate(registry, ctx, PolicyPhase::Exec, &subject);
        let mut policy_ids = step.policy_ids.clone();
        for id in &verdict.matched_policy_ids {
            if !policy_ids.contains(id) {
                policy_ids.push(id.clone());
            }
        }
        if !verdict.allow {
            let reason = verdict.deny_reason.clone().unwrap_or_else(|| "denied by policy".into());
            return Ok(failed_result(
                step,
                &tool_id,
                StepError::new(ErrorClass::PolicyDenied, reason),
                1,
                String::new(),
                policy_ids,
            ));
        }

        // 3. idempotency key
        let idem_key = match idempotency_key(ctx, action, &args) {
            Ok(key) => key,
            Err(err) => {
                return Ok(failed_result(step, &tool_id, err, 1, String::new(), policy_ids))
            }
        };

        // 4. dedup cache
        if let Some(cached) = self.store.step_cache_get(&idem_key).await? {
            debug!(step_id = %step.step_id, idem_key = %idem_key, "step cache hit");
            return Ok(StepResult {
                step_id: step.step_id.clone(),
                action_id: step.action_id.clone(),
                tool_id,
                status: StepStatus::Succeeded,
                output: cached.output,
                error: None,
                attempts: cached.attempts,
                idempotency_key: idem_key,
                policy_ids,
                cache_hit: true,
            });
        }

        // 5. budget debit
        let cost_units = verdict
            .effective_cost_units
            .or(step.cost_units)
            .or(action.cost_units)
            .unwrap_or(1);
        if let Err(err) = self
            .store
            .consume_budget(run_id, &BudgetDelta::tool_call(cost_units), registry.limits())
            .await
        {
            match err {
                StoreError::BudgetExceeded { metric, limit } => {
                    return Ok(failed_result(
                        step,
                        &tool_id,
                        StepError::new(
                            ErrorClass::BudgetExceeded,
                            format!("{metric} exceeded (limit {limit})"),
                        ),
                        1,
                        idem_key,
                        policy_ids,
                    ));
                }
                other => return Err(other),
            }
        }

        // 6–7. invoke under the action's retry class
        let retry = registry.retry_class(action.retry_class.as_deref());
        let timeout_ms = action.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS);
        let mut attempts = 0u32;
        let invoked: Result<Value, StepError> = loop {
            attempts += 1;
            let outcome = match self.rate_gate(ctx, registry).await? {
                Some(limited) => Err(limited),
                None => {
                    let request = ToolRequest {
                        tenant_id: ctx.tenant_id.clone(),
                        tool_id: tool_id.clone(),
                        action_id: step.action_id.clone(),
                        args: Value::Object(args.clone()),
                        timeout_ms,
                    };
                    match tokio::time::timeout(
                        Duration::from_millis(timeout_ms),
                        self.tools.invoke(request),
                    )
                    .await
                    {
                        Ok(result) => result,
                        Err(_) => Err(ToolFailure::new(
                            ErrorClass::Timeout,
                            format!("step deadline of {timeout_ms}ms exceeded"),
                        )),
                    }
                }
            };
            match outcome {
                Ok(output) => break Ok(output),
                Err(failure) => {
                    let err: StepError = failure.into();
                    if err.class.is_fail_fast() || attempts >= retry.max_attempts {
                        break Err(err);
                    }
                    if !retryable(&retry, err.class) {
                        break Err(err);
                    }
                    let delay_ms = match (err.class, err.retry_after_ms) {
                        (ErrorClass::RateLimited, Some(after)) => after,
                        _ => backoff_ms(&retry, attempts),
                    };
                    let delay_ms = if retry.jitter {
                        delay_ms + rand::random::<u64>() % (delay_ms / 2 + 1)
                    } else {
                        delay_ms
                    };
                    warn!(
                        step_id = %step.step_id,
                        class = %err.class,
                        attempt = attempts,
                        delay_ms,
                        "step attempt failed, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                }
            }
        };

        let output = match invoked {
            Ok(output) => output,
            Err(err) => {
                return Ok(failed_result(step, &tool_id, err, attempts, idem_key, policy_ids))
            }
        };

        // 8. obligation check for side-effect steps
        if action.side_effect {
            if let Some(required) = verdict.requires_policy_reference() {
                if !policy_ids.iter().any(|p| p == required) {
                    return Ok(failed_result(
                        step,
                        &tool_id,
                        StepError::new(
                            ErrorClass::PolicyDenied,
                            format!("side-effect step missing required policy reference '{required}'"),
                        ),
                        attempts,
                        idem_key,
                        policy_ids,
                    ));
                }
            }
        }

        // 9. persist and report
        let result = StepResult {
            step_id: step.step_id.clone(),
            action_id: step.action_id.clone(),
            tool_id,
            status: StepStatus::Succeeded,
            output,
            error: None,
            attempts,
            idempotency_key: idem_key.clone(),
            policy_ids,
            cache_hit: false,
        };
        self.store.step_cache_put(&idem_key, &result).await?;
        Ok(result)
    }
}

fn retryable(retry: &RetryClass, class: ErrorClass) -> bool {
    // a deadline overrun retries under the transient rules unless the
    // class list names timeout explicitly
    let effective = if class == ErrorClass::Timeout && !retry.retry_on.contains(&ErrorClass::Timeout)
    {
        ErrorClass::TransientNetwork
    } else {
        class
    };
    retry.retry_on.contains(&effective)
}

fn backoff_ms(retry: &RetryClass, attempt: u32) -> u64 {
    if retry.backoff_ms.is_empty() {
        let shift = (attempt - 1).min(7);
        (DEFAULT_BACKOFF_MS << shift).min(MAX_BACKOFF_MS)
    } else {
        let idx = ((attempt - 1) as usize).min(retry.backoff_ms.len() - 1);
        retry.backoff_ms[idx]
    }
}

fn skipped_result(step: &Step) -> StepResult {
    StepResult {
        step_id: step.step_id.clone(),
        action_id: step.action_id.clone(),
        tool_id: String::new(),
        status: StepStatus::Skipped,
        output: Value::Null,
        error: None,
        attempts: 0,
        idempotency_key: String::new(),
        policy_ids: step.policy_ids.clone(),
        cache_hit: false,
    }
}

fn failed_result(
    step: &Step,
    tool_id: &str,
    error: StepError,
    attempts: u32,
    idempotency_key: String,
    policy_ids: Vec<String>,
) -> StepResult {
    StepResult {
        step_id: step.step_id.clone(),
        action_id: step.action_id.clone(),
        tool_id: tool_id.to_string(),
        status: StepStatus::Failed,
        output: Value::Null,
        error: Some(error),
        attempts,
        idempotency_key,
        policy_ids,
        cache_hit: false,
    }
}

/// Substitute `$<step_id>.output.<field>` references with prior step
/// outputs. Unresolvable references bind to null.
fn resolve_args(args: &Map<String, Value>, outputs: &HashMap<String, Value>) -> Map<String, Value> {
    args.iter().map(|(k, v)| (k.clone(), resolve_value(v, outputs))).collect()
}

fn resolve_value(value: &Value, outputs: &HashMap<String, Value>) -> Value {
    match value {
        Value::String(s) if s.starts_with('$') => resolve_reference(s, outputs),
        Value::Array(items) => {
            Value::Array(items.iter().map(|v| resolve_value(v, outputs)).collect())
        }
        Value::Object(map) => Value::Object(
            map.iter().map(|(k, v)| (k.clone(), resolve_value(v, outputs))).collect(),
        ),
        other => other.clone(),
    }
}

fn resolve_reference(reference: &str, outputs: &HashMap<String, Value>) -> Value {
    let mut parts = reference[1..].split('.');
    let (Some(step_ref), Some("output")) = (parts.next(), parts.next()) else {
        return Value::String(reference.to_string());
    };
    let Some(mut current) = outputs.get(step_ref) else {
        return Value::Null;
    };
    for field in parts {
        match current.get(field) {
            Some(next) => current = next,
            None => return Value::Null,
        }
    }
    current.clone()
}

/// Light structural check against `schema_in`: required fields must be
/// present, declared property types must match. Full JSON-schema
/// validation is the registry tooling's concern, not the kernel's.
fn check_input_shape(action: &ActionEntry, args: &Map<String, Value>) -> Result<(), String> {
    let Some(schema) = &action.schema_in else {
        return Ok(());
    };
    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for field in required.iter().filter_map(Value::as_str) {
            if !args.contains_key(field) {
                return Err(format!("missing required arg '{field}'"));
            }
        }
    }
    if let Some(props) = schema.get("properties").and_then(Value::as_object) {
        for (field, spec) in props {
            let (Some(value), Some(expected)) =
                (args.get(field), spec.get("type").and_then(Value::as_str))
            else {
                continue;
            };
            let ok = match expected {
                "string" => value.is_string(),
                "integer" => value.is_i64() || value.is_u64(),
                "number" => value.is_number(),
                "boolean" => value.is_boolean(),
                "object" => value.is_object(),
                "array" => value.is_array(),
                _ => true,
            };
            if !ok && !value.is_null() {
                return Err(format!("arg '{field}' is not a {expected}"));
            }
        }
    }
    Ok(())
}

/// Deterministic dedup key.
///
/// `hash` strategy: SHA-256 over `action_id | canonical(args, fields) |
/// tenant_id`. `explicit_key` requires `args.idempotency_key`. A
/// side-effect action with neither is refused before any invocation.
fn idempotency_key(
    ctx: &RunContext,
    action: &ActionEntry,
    args: &Map<String, Value>,
) -> Result<String, StepError> {
    let spec = match &action.idempotency {
        Some(spec) => spec.clone(),
        None if action.side_effect => {
            return Err(StepError::new(
                ErrorClass::Idempotency,
                format!("side-effect action {} declares no idempotency strategy", action.action_id),
            ));
        }
        None => IdempotencySpec { strategy: IdempotencyStrategy::Hash, fields: None },
    };

    match spec.strategy {
        IdempotencyStrategy::ExplicitKey => match args.get("idempotency_key").and_then(Value::as_str)
        {
            Some(key) if !key.is_empty() => Ok(key.to_string()),
            _ => Err(StepError::new(
                ErrorClass::Idempotency,
                "missing args.idempotency_key for explicit_key action",
            )),
        },
        IdempotencyStrategy::Hash => {
            let digest_args: Map<String, Value> = match &spec.fields {
                Some(fields) => args
                    .iter()
                    .filter(|(k, _)| fields.iter().any(|f| f == *k))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
                None => args.clone(),
            };
            let canonical = canonical_json(&Value::Object(digest_args));
            let material = format!("{}|{}|{}", action.action_id, canonical, ctx.tenant_id);
            Ok(format!("idem_{}", &sha256_hex(material.as_bytes())[..32]))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn action(side_effect: bool, idem: Option<IdempotencySpec>) -> ActionEntry {
        ActionEntry {
            action_id: "act_email_send_v1".into(),
            version: None,
            tool_id: "email.send".into(),
            schema_in: None,
            schema_out: None,
            side_effect,
            retry_class: None,
            idempotency: idem,
            security: Default::default(),
            cost_units: None,
            timeout_ms: None,
        }
    }

    fn ctx() -> RunContext {
        RunContext {
            tenant_id: "tenant_demo".into(),
            org_id: None,
            user_id: None,
            roles: vec![],
        }
    }

    #[test]
    fn hash_key_is_stable_and_tenant_scoped() {
        let spec = IdempotencySpec { strategy: IdempotencyStrategy::Hash, fields: None };
        let a = action(true, Some(spec));
        let args: Map<String, Value> =
            serde_json::from_value(json!({"to": "nina@example.com", "body": "hi"})).unwrap();

        let k1 = idempotency_key(&ctx(), &a, &args).unwrap();
        let k2 = idempotency_key(&ctx(), &a, &args).unwrap();
        assert_eq!(k1, k2);

        let other_tenant = RunContext { tenant_id: "tenant_other".into(), ..ctx() };
        let k3 = idempotency_key(&other_tenant, &a, &args).unwrap();
        assert_ne!(k1, k3);
    }

    #[test]
    fn hash_key_respects_field_restriction() {
        let spec = IdempotencySpec {
            strategy: IdempotencyStrategy::Hash,
            fields: Some(vec!["to".into()]),
        };
        let a = action(true, Some(spec));
        let args1: Map<String, Value> =
            serde_json::from_value(json!({"to": "nina@example.com", "body": "hi"})).unwrap();
        let args2: Map<String, Value> =
            serde_json::from_value(json!({"to": "nina@example.com", "body": "different"})).unwrap();
        assert_eq!(
            idempotency_key(&ctx(), &a, &args1).unwrap(),
            idempotency_key(&ctx(), &a, &args2).unwrap()
        );
    }

    #[test]
    fn side_effect_without_strategy_is_refused() {
        let a = action(true, None);
        let err = idempotency_key(&ctx(), &a, &Map::new()).unwrap_err();
        assert_eq!(err.class, ErrorClass::Idempotency);
    }

    #[test]
    fn explicit_key_is_required_when_declared() {
        let spec = IdempotencySpec { strategy: IdempotencyStrategy::ExplicitKey, fields: None };
        let a = action(true, Some(spec));
        let err = idempotency_key(&ctx(), &a, &Map::new()).unwrap_err();
        assert_eq!(err.class, ErrorClass::Idempotency);

        let args: Map<String, Value> =
            serde_json::from_value(json!({"idempotency_key": "idem:email:1"})).unwrap();
        assert_eq!(idempotency_key(&ctx(), &a, &args).unwrap(), "idem:email:1");
    }

    #[test]
    fn references_resolve_through_output_paths() {
        let mut outputs = HashMap::new();
        outputs.insert("s1".to_string(), json!({"email": "nina@example.com", "meta": {"tier": "gold"}}));

        let args: Map<String, Value> = serde_json::from_value(json!({
            "to": "$s1.output.email",
            "tier": "$s1.output.meta.tier",
            "missing": "$s1.output.phone",
            "unknown_step": "$s9.output.email",
            "literal": "plain"
        }))
        .unwrap();
        let resolved = resolve_args(&args, &outputs);
        assert_eq!(resolved["to"], json!("nina@example.com"));
        assert_eq!(resolved["tier"], json!("gold"));
        assert_eq!(resolved["missing"], Value::Null);
        assert_eq!(resolved["unknown_step"], Value::Null);
        assert_eq!(resolved["literal"], json!("plain"));
    }

    #[test]
    fn input_shape_check_enforces_required_and_types() {
        let mut a = action(false, None);
        a.schema_in = Some(json!({
            "required": ["to"],
            "properties": {"to": {"type": "string"}, "retries": {"type": "integer"}}
        }));

        let ok: Map<String, Value> =
            serde_json::from_value(json!({"to": "x@y.z", "retries": 2})).unwrap();
        assert!(check_input_shape(&a, &ok).is_ok());

        let missing: Map<String, Value> = serde_json::from_value(json!({})).unwrap();
        assert!(check_input_shape(&a, &missing).is_err());

        let wrong: Map<String, Value> =
            serde_json::from_value(json!({"to": 42})).unwrap();
        assert!(check_input_shape(&a, &wrong).is_err());
    }

    #[test]
    fn backoff_uses_schedule_then_saturates() {
        let retry = RetryClass {
            id: "transient".into(),
            max_attempts: 4,
            backoff_ms: vec![100, 200],
            jitter: false,
            retry_on: vec![ErrorClass::TransientNetwork],
        };
        assert_eq!(backoff_ms(&retry, 1), 100);
        assert_eq!(backoff_ms(&retry, 2), 200);
        assert_eq!(backoff_ms(&retry, 3), 200);

        let defaulted = RetryClass { backoff_ms: vec![], ..retry };
        assert_eq!(backoff_ms(&defaulted, 1), 250);
        assert_eq!(backoff_ms(&defaulted, 2), 500);
    }

    #[test]
    fn timeout_retries_under_transient_rules() {
        let retry = RetryClass {
            id: "transient".into(),
            max_attempts: 3,
            backoff_ms: vec![10],
            jitter: false,
            retry_on: vec![ErrorClass::TransientNetwork],
        };
        assert!(retryable(&retry, ErrorClass::Timeout));
        assert!(retryable(&retry, ErrorClass::TransientNetwork));
        assert!(!retryable(&retry, ErrorClass::Conflict));
    }
}

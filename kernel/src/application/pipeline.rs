// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Per-run phase state machine.
//!
//! Drives one run from mission input to a terminal state:
//!
//! ```text
//! IngestTask → LoadContext → SelectWorldNodes → Plan → GateApproval
//!           → ExecuteSteps → Synthesize → Complete/Fail
//! ```
//!
//! Every emitted event is persisted before any subscriber sees it. The
//! event log is the source of truth: on restart after a crash the journal
//! is rebuilt from persisted events, completed phases are skipped, and
//! the step cache keeps re-executed side effects from firing twice.
//!
//! Run-state transitions (initial `submitted`):
//! - `submitted → working` entering LoadContext
//! - `working → input-required` when the gate demands approval
//! - `input-required → working | canceled | failed` on approve / deny /
//!   timeout
//! - `working → completed` after Synthesize with obligations satisfied
//! - `working → failed` on any unrecoverable error
//! - `→ canceled` at the next safe boundary after an external cancel

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use crate::application::emit::Emitter;
use crate::application::executor::StepExecutor;
use crate::application::policy_engine::PolicyEngine;
use crate::domain::approval::ApprovalState;
use crate::domain::event::{ArtifactType, Event, EventPayload};
use crate::domain::plan::{Plan, StepResult, StepStatus};
use crate::domain::policy::{Obligation, PolicyPhase, PolicySubject};
use crate::domain::ports::{ContextProvider, PlannerAdapter, RegistryProvider, ToolAdapter};
use crate::domain::registry::EffectiveRegistry;
use crate::domain::run::{BudgetDelta, MissionInput, RunContext, RunState};
use crate::domain::store::Store;
use crate::infrastructure::stream_hub::StreamHub;

const APPROVAL_POLL: Duration = Duration::from_millis(250);

/// Explicit pipeline phase; the tick loop advances until a terminal
/// status has been emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    IngestTask,
    LoadContext,
    SelectWorldNodes,
    Plan,
    GateApproval,
    ExecuteSteps,
    Synthesize,
    Complete,
}

/// In-memory state recovered from the persisted event log; lets a
/// restarted pipeline skip phases that already ran.
#[derive(Debug, Default)]
struct RunJournal {
    submitted: bool,
    working: bool,
    context_pack: Option<Value>,
    plan_artifact: Option<Value>,
    gate_report: bool,
    input_required: bool,
    resumed_after_gate: bool,
    final_artifact: bool,
    terminal: Option<RunState>,
}

impl RunJournal {
    fn from_events(events: &[Event]) -> Self {
        let mut journal = Self::default();
        let mut saw_input_required = false;
        for event in events {
            match &event.payload {
                EventPayload::TaskStatusUpdateEvent { state, .. } => {
                    match state {
                        RunState::Submitted => journal.submitted = true,
                        RunState::Working => {
                            journal.working = true;
                            if saw_input_required {
                                journal.resumed_after_gate = true;
                            }
                        }
                        RunState::InputRequired => {
                            journal.input_required = true;
                            saw_input_required = true;
                        }
                        terminal => journal.terminal = Some(*terminal),
                    };
                }
                EventPayload::TaskArtifactUpdateEvent { artifact_type, artifact, .. } => {
                    match artifact_type {
                        ArtifactType::ContextPack => {
                            journal.context_pack = Some(artifact.clone())
                        }
                        ArtifactType::Plan => journal.plan_artifact = Some(artifact.clone()),
                        ArtifactType::GateReport => journal.gate_report = true,
                        ArtifactType::Final => journal.final_artifact = true,
                        ArtifactType::StepResult => {}
                    }
                }
            }
        }
        journal
    }
}

/// Everything the phases share for one run.
struct RunProgress {
    mission: MissionInput,
    ctx: RunContext,
    emitter: Emitter,
    journal: RunJournal,
    registry: Option<EffectiveRegistry>,
    context_pack: Option<Value>,
    plan: Option<Plan>,
    obligations: Vec<Obligation>,
    needs_approval: bool,
    step_results: Vec<StepResult>,
}

pub struct Pipeline {
    store: Arc<dyn Store>,
    hub: Arc<StreamHub>,
    registry_provider: Arc<dyn RegistryProvider>,
    planner: Arc<dyn PlannerAdapter>,
    context: Arc<dyn ContextProvider>,
    executor: StepExecutor,
    approval_timeout: Option<Duration>,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn Store>,
        hub: Arc<StreamHub>,
        registry_provider: Arc<dyn RegistryProvider>,
        planner: Arc<dyn PlannerAdapter>,
        context: Arc<dyn ContextProvider>,
        tools: Arc<dyn ToolAdapter>,
        step_parallelism: usize,
        rate_limit_window_s: u64,
        approval_timeout: Option<Duration>,
    ) -> Self {
        let executor =
            StepExecutor::new(Arc::clone(&store), tools, step_parallelism, rate_limit_window_s);
        Self { store, hub, registry_provider, planner, context, executor, approval_timeout }
    }

    /// Run (or resume) the pipeline for a mission until a terminal state.
    pub async fn run(&self, mission: MissionInput) -> Result<RunState> {
        mission.validate().map_err(|e| anyhow::anyhow!("invalid mission: {e}"))?;
        let run = self.store.create_run(&mission).await.context("creating run")?;

        let events = self.store.get_events(&run.run_id, 0).await?;
        let journal = RunJournal::from_events(&events);
        if let Some(done) = journal.terminal {
            info!(run_id = %run.run_id, state = %done, "run already terminal, nothing to do");
            return Ok(done);
        }

        let emitter = Emitter::new(
            Arc::clone(&self.store),
            Arc::clone(&self.hub),
            mission.task_id.clone(),
            run.run_id.clone(),
        );
        let mut state = RunProgress {
            ctx: mission.run_context(),
            mission,
            emitter,
            journal,
            registry: None,
            context_pack: None,
            plan: None,
            obligations: Vec::new(),
            needs_approval: false,
            step_results: Vec::new(),
        };

        let mut phase = Phase::IngestTask;
        loop {
            if let Some(terminal) = self.check_external_cancel(&state).await? {
                return Ok(terminal);
            }
            match self.advance(phase, &mut state).await? {
                Next::Phase(next) => phase = next,
                Next::Terminal(final_state) => {
                    self.hub.retire(state.emitter.run_id());
                    return Ok(final_state);
                }
            }
        }
    }

    /// A run canceled from outside stops at the next phase boundary.
    async fn check_external_cancel(&self, state: &RunProgress) -> Result<Option<RunState>> {
        let run = self.store.get_run(state.emitter.run_id()).await?;
        if run.map(|r| r.state == RunState::Canceled).unwrap_or(false) {
            state.emitter.status(RunState::Canceled, "Run canceled").await?;
            return Ok(Some(RunState::Canceled));
        }
        Ok(None)
    }

    async fn advance(&self, phase: Phase, state: &mut RunProgress) -> Result<Next> {
        match phase {
            Phase::IngestTask => {
                if !state.journal.submitted {
                    state.emitter.status(RunState::Submitted, "Task accepted").await?;
                }
                Ok(Next::Phase(Phase::LoadContext))
            }

            Phase::LoadContext => {
                let registry = self
                    .registry_provider
                    .load_for(&state.mission)
                    .context("loading effective registry")?;
                state.registry = Some(registry);
                if !state.journal.working {
                    state.emitter.status(RunState::Working, "Running").await?;
                }
                Ok(Next::Phase(Phase::SelectWorldNodes))
            }

            Phase::SelectWorldNodes => {
                if let Some(pack) = state.journal.context_pack.take() {
                    state.context_pack = Some(pack);
                    return Ok(Next::Phase(Phase::Plan));
                }
                let registry = state.registry.as_ref().expect("registry loaded");
                let llm_cost = registry.limits().llm_call_cost_units;
                if let Err(err) = self
                    .store
                    .consume_budget(
                        state.emitter.run_id(),
                        &BudgetDelta::llm_call(llm_cost),
                        registry.limits(),
                    )
                    .await
                {
                    return self.fail(state, "Budget exceeded", json!({"error": err.to_string()})).await;
                }
                let pack = self
                    .context
                    .build_context(&state.mission, registry)
                    .await
                    .context("building context pack")?;
                state.emitter.artifact(ArtifactType::ContextPack, pack.clone()).await?;
                state.context_pack = Some(pack);
                Ok(Next::Phase(Phase::Plan))
            }

            Phase::Plan => {
                if let Some(artifact) = state.journal.plan_artifact.take() {
                    return self.recover_plan(state, artifact);
                }
                let registry = state.registry.as_ref().expect("registry loaded");
                let llm_cost = registry.limits().llm_call_cost_units;
                if let Err(err) = self
                    .store
                    .consume_budget(
                        state.emitter.run_id(),
                        &BudgetDelta::llm_call(llm_cost),
                        registry.limits(),
                    )
                    .await
                {
                    return self.fail(state, "Budget exceeded", json!({"error": err.to_string()})).await;
                }

                let pack = state.context_pack.as_ref().expect("context pack present");
                let raw = self.planner.build_plan(pack).await.context("planner failed")?;
                let mut plan = match Plan::parse(raw) {
                    Ok(plan) => plan,
                    Err(err) => {
                        return self
                            .fail(state, "Planner produced an invalid plan", json!({"error": err.to_string()}))
                            .await;
                    }
                };

                // plan-phase policy pass over each step
                let mut needs_approval = plan.controls.requires_approval;
                let mut obligations: Vec<Obligation> = Vec::new();
                for step in &mut plan.steps {
                    let action = registry.action(&step.action_id);
                    let tool_id = action.map(|a| a.tool_id.as_str());
                    if let Some(action) = action {
                        if action.security.requires_approval {
                            needs_approval = true;
                        }
                    }
                    let subject =
                        PolicySubject { action_id: Some(&step.action_id), tool_id };
                    let verdict =
                        PolicyEngine::evaluate(registry, &state.ctx, PolicyPhase::Plan, &subject);
                    if !verdict.allow {
                        let reason =
                            verdict.deny_reason.unwrap_or_else(|| "denied by policy".into());
                        return self
                            .fail(
                                state,
                                "Policy gate failed",
                                json!({"step_id": step.step_id, "deny_reason": reason}),
                            )
                            .await;
                    }
                    if verdict.require_approval {
                        needs_approval = true;
                    }
                    if let Some(cost) = verdict.effective_cost_units {
                        step.cost_units = Some(cost);
                    }
                    step.policy_ids = verdict.matched_policy_ids;
                    for obligation in verdict.obligations {
                        if !obligations.contains(&obligation) {
                            obligations.push(obligation);
                        }
                    }
                }
                plan.controls.requires_approval = needs_approval;

                let artifact = json!({
                    "plan": serde_json::to_value(&plan)?,
                    "obligations": serde_json::to_value(&obligations)?,
                });
                state.emitter.artifact(ArtifactType::Plan, artifact).await?;
                state.plan = Some(plan);
                state.obligations = obligations;
                state.needs_approval = needs_approval;
                Ok(Next::Phase(Phase::GateApproval))
            }

            Phase::GateApproval => self.gate_approval(state).await,

            Phase::ExecuteSteps => {
                let registry = state.registry.as_ref().expect("registry loaded");
                let plan = state.plan.as_ref().expect("plan present");
                let outcome = self
                    .executor
                    .execute_plan(&state.ctx, plan, registry, &state.emitter)
                    .await?;
                state.step_results = outcome.results;
                if outcome.canceled {
                    state.emitter.status(RunState::Canceled, "Run canceled").await?;
                    return Ok(Next::Terminal(RunState::Canceled));
                }
                if let Some(err) = outcome.fatal {
                    return self
                        .fail(
                            state,
                            "Execution failed",
                            json!({"class": err.class, "message": err.message}),
                        )
                        .await;
                }
                Ok(Next::Phase(Phase::Synthesize))
            }

            Phase::Synthesize => {
                if state.journal.final_artifact {
                    return Ok(Next::Phase(Phase::Complete));
                }
                let mut statuses = Map::new();
                let mut outputs = Map::new();
                for result in &state.step_results {
                    statuses.insert(
                        result.step_id.clone(),
                        serde_json::to_value(result.status)?,
                    );
                    if result.status == StepStatus::Succeeded {
                        outputs.insert(result.step_id.clone(), result.output.clone());
                    }
                }
                let artifact = json!({
                    "summary": state.mission.user_message,
                    "steps": statuses,
                    "outputs": outputs,
                });
                state.emitter.artifact(ArtifactType::Final, artifact).await?;
                Ok(Next::Phase(Phase::Complete))
            }

            Phase::Complete => {
                // must_emit_artifact obligations hold over the whole log
                let events =
                    self.store.get_events(state.emitter.run_id(), 0).await?;
                let emitted: Vec<ArtifactType> =
                    events.iter().filter_map(|e| e.payload.artifact_type()).collect();
                let missing = unmet_artifact_obligations(&state.obligations, &emitted);
                if !missing.is_empty() {
                    return self
                        .fail(
                            state,
                            "Policy obligations failed",
                            json!({"missing": serde_json::to_value(&missing)?}),
                        )
                        .await;
                }
                state.emitter.status(RunState::Completed, "Done").await?;
                self.store.snapshot(state.emitter.run_id()).await?;
                Ok(Next::Terminal(RunState::Completed))
            }
        }
    }

    /// Restart path: rebuild plan state from the persisted plan artifact.
    fn recover_plan(&self, state: &mut RunProgress, artifact: Value) -> Result<Next> {
        let plan_value = artifact.get("plan").cloned().unwrap_or(artifact.clone());
        let plan = Plan::parse(plan_value).context("persisted plan artifact no longer parses")?;
        let obligations = artifact
            .get("obligations")
            .cloned()
            .map(serde_json::from_value)
            .transpose()?
            .unwrap_or_default();
        state.needs_approval = plan.controls.requires_approval;
        state.obligations = obligations;
        state.plan = Some(plan);
        Ok(Next::Phase(Phase::GateApproval))
    }

    async fn gate_approval(&self, state: &mut RunProgress) -> Result<Next> {
        if !state.journal.gate_report {
            state
                .emitter
                .artifact(
                    ArtifactType::GateReport,
                    json!({
                        "needs_approval": state.needs_approval,
                        "obligations": serde_json::to_value(&state.obligations)?,
                    }),
                )
                .await?;
        }
        if !state.needs_approval || state.journal.resumed_after_gate {
            return Ok(Next::Phase(Phase::ExecuteSteps));
        }

        let approval = self.store.create_approval(state.emitter.run_id()).await?;
        if approval.is_pending() && !state.journal.input_required {
            state
                .emitter
                .status(RunState::InputRequired, "Approval required")
                .await?;
        }

        let deadline = self.approval_timeout.map(|t| tokio::time::Instant::now() + t);
        let decision = loop {
            let approval = self
                .store
                .get_approval(state.emitter.run_id())
                .await?
                .ok_or_else(|| anyhow::anyhow!("approval record disappeared"))?;
            match approval.state {
                ApprovalState::Pending => {}
                decided => break decided,
            }
            if let Some(deadline) = deadline {
                if tokio::time::Instant::now() >= deadline {
                    warn!(run_id = %state.emitter.run_id(), "approval wait timed out");
                    return self
                        .fail(state, "Approval timed out", Value::Object(Default::default()))
                        .await;
                }
            }
            tokio::time::sleep(APPROVAL_POLL).await;
        };

        match decision {
            ApprovalState::Approved => {
                state.emitter.status(RunState::Working, "Approved, continuing").await?;
                Ok(Next::Phase(Phase::ExecuteSteps))
            }
            ApprovalState::Denied => {
                state.emitter.status(RunState::Canceled, "Approval denied").await?;
                Ok(Next::Terminal(RunState::Canceled))
            }
            ApprovalState::Pending => unreachable!("loop exits only on a decision"),
        }
    }

    async fn fail(&self, state: &RunProgress, message: &str, meta: Value) -> Result<Next> {
        state.emitter.status_with_meta(RunState::Failed, message, meta).await?;
        self.store.snapshot(state.emitter.run_id()).await?;
        Ok(Next::Terminal(RunState::Failed))
    }
}

enum Next {
    Phase(Phase),
    Terminal(RunState),
}

/// `must_emit_artifact` obligations not satisfied by the emitted set.
/// `must_reference_policy_id` is enforced per step by the executor.
fn unmet_artifact_obligations<'a>(
    obligations: &'a [Obligation],
    emitted: &[ArtifactType],
) -> Vec<&'a Obligation> {
    obligations
        .iter()
        .filter(|o| match o {
            Obligation::MustEmitArtifact { artifact_type } => !emitted.contains(artifact_type),
            Obligation::MustReferencePolicyId { .. } => false,
        })
        .collect()
}

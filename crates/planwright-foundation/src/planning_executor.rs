//! Plan Executor: the `think` / `analyze_result` loop
//!
//! The executor owns no tools. Every [`think`](PlanExecutor::think) call
//! looks up the plan of the calling thread, (re)builds it when needed and
//! hands back exactly one unit of work as an [`Action`]; the external tool
//! executor runs it and reports the outcome through
//! [`analyze_result`](PlanExecutor::analyze_result).
//!
//! # Lifecycle
//!
//! ```text
//! planning ──► executing ──► completed
//!                 │  ▲   └──► failed
//!                 │  └─────── waiting-input  (provide_input)
//!                 ▼
//!            replanning ──► (new plan) planning
//! ```
//!
//! # Integration Points
//!
//! - [`PlanGenerator`] produces raw steps, normalized and validated here.
//! - A [`Storage`] keyed by thread key holds the plan between calls.
//! - [`ValueExtractor`] is the last-resort argument resolver.
//! - [`PlanTelemetry`] receives [`PlanningEvent`]s; sink errors are logged
//!   and otherwise ignored.

use chrono::Utc;
use planwright_kernel::{
    Action, ActionResult, ActiveUnit, AgentError, AgentResult, AgentThought, Analysis,
    ExecutionContext, ExecutionPlan, MissingInputBehavior, PlanGenerator, PlanRequest,
    PlanStatus, PlanTelemetry, PlanningEvent, ReplanCause, StepStatus, Storage,
    ToolInvocation, ToolOutcome, ToolUnavailableBehavior, ValueExtractor,
};
use serde_json::{Map, Value, json};
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::config::{ExecutionSettings, PlannerConfig};
use crate::normalize::normalize_steps;
use crate::parallel::{self, batch_concurrency, expand_fan_out};
use crate::policy::{FailureClass, FailureDecision, ReplanPolicyEngine, classify_failure};
use crate::resolver::{ArgumentResolver, Resolution, ResolutionScope};
use crate::template::stringify;
use crate::validation::{diagnostic_plan, validate_plan};

/// Key in `metadata.extra` holding the action of the in-flight unit.
const PENDING_ACTION_KEY: &str = "pending_action";
/// Set while waiting on a question whose answer requires a new plan.
const RESUME_REPLAN_KEY: &str = "resume_replan";

/// What `think` does after one pass over the plan.
enum Move {
    Emit(AgentThought),
    Replan,
}

// ---------------------------------------------------------------------------
// Plan Executor
// ---------------------------------------------------------------------------

/// Drives plans one unit of work at a time.
///
/// Calls for the same thread key must be serialized by the caller; calls for
/// different keys may run concurrently.
///
/// # Example
///
/// ```rust,ignore
/// use planwright_foundation::{InMemoryPlanStore, PlanExecutor};
///
/// let executor = PlanExecutor::new(generator, Arc::new(InMemoryPlanStore::new()));
/// let thought = executor.think(&ctx).await;
/// // run thought.action, then:
/// let analysis = executor.analyze_result(&result, &ctx).await;
/// ```
pub struct PlanExecutor {
    generator: Arc<dyn PlanGenerator>,
    store: Arc<dyn Storage<String, ExecutionPlan>>,
    telemetry: Option<Arc<dyn PlanTelemetry>>,
    extractor: Option<Arc<dyn ValueExtractor>>,
    policy: ReplanPolicyEngine,
    settings: ExecutionSettings,
}

impl PlanExecutor {
    pub fn new(
        generator: Arc<dyn PlanGenerator>,
        store: Arc<dyn Storage<String, ExecutionPlan>>,
    ) -> Self {
        Self {
            generator,
            store,
            telemetry: None,
            extractor: None,
            policy: ReplanPolicyEngine::default(),
            settings: ExecutionSettings::default(),
        }
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn PlanTelemetry>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Enable the LLM fallback of argument resolution.
    pub fn with_extractor(mut self, extractor: Arc<dyn ValueExtractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    pub fn with_policy(mut self, policy: ReplanPolicyEngine) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_settings(mut self, settings: ExecutionSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_config(self, config: PlannerConfig) -> Self {
        self.with_policy(ReplanPolicyEngine::new(config.policy))
            .with_settings(config.execution)
    }

    pub fn policy(&self) -> &ReplanPolicyEngine {
        &self.policy
    }

    pub fn settings(&self) -> &ExecutionSettings {
        &self.settings
    }

    /// Key under which `ctx`'s plan is stored.
    pub fn thread_key(&self, ctx: &ExecutionContext) -> String {
        ctx.thread_key(&self.settings.default_thread_key)
    }

    /// The plan currently stored for `key`.
    pub async fn current_plan(&self, key: &str) -> AgentResult<Option<ExecutionPlan>> {
        self.store.load(&key.to_string()).await
    }

    // -----------------------------------------------------------------------
    // think
    // -----------------------------------------------------------------------

    /// Decide the next action for `ctx`'s thread.
    ///
    /// Never fails: internal errors come back as a `final_answer` carrying
    /// the error message.
    pub async fn think(&self, ctx: &ExecutionContext) -> AgentThought {
        match self.think_inner(ctx).await {
            Ok(thought) => thought,
            Err(err) => {
                error!(error = %err, goal = %ctx.goal, "Planning cycle failed");
                AgentThought::new(
                    format!("Planning failed: {err}"),
                    Action::final_answer(format!("Error: {err}")),
                )
                .with_metadata("error", json!(err.to_string()))
            }
        }
    }

    async fn think_inner(&self, ctx: &ExecutionContext) -> AgentResult<AgentThought> {
        let key = self.thread_key(ctx);
        let (mut plan, mut fresh) = match self.store.load(&key).await? {
            Some(plan) if !(plan.is_finished() && plan.goal != ctx.goal) => (plan, false),
            _ => (self.create_plan(&key, ctx, None).await?, true),
        };

        loop {
            if fresh && self.settings.announce_plans && !plan.is_finished() {
                self.store.save(&key, &plan).await?;
                let reasoning = plan
                    .metadata
                    .reasoning
                    .clone()
                    .unwrap_or_else(|| format!("Plan with {} steps ready", plan.steps.len()));
                return Ok(thought(&plan, reasoning, Action::ExecutePlan {
                    plan_id: plan.id.clone(),
                }));
            }

            match self.next_move(&key, &mut plan, ctx, fresh).await? {
                Move::Emit(thought) => {
                    self.store.save(&key, &plan).await?;
                    return Ok(thought);
                }
                Move::Replan => {
                    plan = self.replan(&key, plan, ctx).await?;
                    fresh = true;
                }
            }
        }
    }

    async fn next_move(
        &self,
        key: &str,
        plan: &mut ExecutionPlan,
        ctx: &ExecutionContext,
        fresh: bool,
    ) -> AgentResult<Move> {
        match plan.status {
            PlanStatus::Completed | PlanStatus::Failed => {
                return Ok(Move::Emit(terminal_thought(plan)));
            }
            PlanStatus::WaitingInput => return Ok(Move::Emit(waiting_thought(plan))),
            _ => {}
        }

        if !fresh && self.policy.should_replan(plan, ctx, Utc::now()) {
            return Ok(Move::Replan);
        }

        if plan.status == PlanStatus::Planning {
            if let Some(next) = self.check_signals(plan).await {
                return Ok(next);
            }
            plan.status = PlanStatus::Executing;
            info!(thread_key = %key, plan_id = %plan.id, steps = plan.steps.len(), "Executing plan");
        }

        if plan.metadata.active.is_some() {
            return self.redispatch(plan).map(Move::Emit);
        }

        self.advance(plan, ctx).await
    }

    /// Planner signals are honored once, before the first step runs.
    async fn check_signals(&self, plan: &mut ExecutionPlan) -> Option<Move> {
        let signals = plan.metadata.signals.clone()?;

        let needs: Vec<String> = signals
            .needs
            .iter()
            .filter(|name| !plan.metadata.provided_inputs.contains_key(name.as_str()))
            .cloned()
            .collect();
        if !needs.is_empty() {
            return Some(match self.policy.config().missing_input {
                MissingInputBehavior::AskUser => {
                    let prompt = format!("Please provide: {}", needs.join(", "));
                    self.await_input(plan, needs, prompt).await
                }
                MissingInputBehavior::Replan => {
                    plan.metadata.missing_inputs = needs;
                    plan.request_replan(ReplanCause::MissingInputs);
                    Move::Replan
                }
            });
        }

        if signals.no_discovery_path.is_empty() {
            return None;
        }
        let tools = signals.no_discovery_path;
        Some(match self.policy.config().tool_unavailable {
            ToolUnavailableBehavior::Replan => {
                plan.request_replan(ReplanCause::ToolMissing);
                Move::Replan
            }
            ToolUnavailableBehavior::AskUser => {
                let prompt = format!("No available tool covers: {}", tools.join(", "));
                self.await_tool_answer(plan, tools, prompt).await
            }
            ToolUnavailableBehavior::Fail => {
                let reason = format!("Required tools unavailable: {}", tools.join(", "));
                self.fail_plan(plan, reason).await;
                Move::Emit(terminal_thought(plan))
            }
        })
    }

    /// Re-emit the in-flight unit, e.g. after a retry was scheduled.
    fn redispatch(&self, plan: &mut ExecutionPlan) -> AgentResult<AgentThought> {
        let action: Action = match plan.metadata.extra.get(PENDING_ACTION_KEY) {
            Some(value) => serde_json::from_value(value.clone())?,
            None => {
                return Err(AgentError::Internal(format!(
                    "plan {} has a unit in flight but no pending action",
                    plan.id
                )));
            }
        };
        let retrying = matches!(
            plan.metadata.active,
            Some(ActiveUnit::Single { retry: true, .. })
        );
        if let Some(ActiveUnit::Single { retry, .. }) = plan.metadata.active.as_mut() {
            *retry = false;
        }
        let reasoning = if retrying {
            "Retrying the previous tool call"
        } else {
            "Awaiting the result of the dispatched work"
        };
        Ok(thought(plan, reasoning, action).with_metadata("retry", json!(retrying)))
    }

    /// Complete inline steps until a tool dispatch, a terminal state or a
    /// missing-input stop is reached.
    async fn advance(&self, plan: &mut ExecutionPlan, ctx: &ExecutionContext) -> AgentResult<Move> {
        loop {
            skip_blocked(plan);
            if plan.advance_cursor() {
                self.finish(plan).await;
                return Ok(Move::Emit(terminal_thought(plan)));
            }

            let Some(index) = parallel::next_ready(plan) else {
                let pending: Vec<&str> = plan
                    .steps
                    .iter()
                    .filter(|s| s.status == StepStatus::Pending)
                    .map(|s| s.id.as_str())
                    .collect();
                let reason = format!(
                    "Deadlock: pending steps [{}] can never become ready",
                    pending.join(", ")
                );
                self.fail_plan(plan, reason).await;
                return Ok(Move::Emit(terminal_thought(plan)));
            };

            if !plan.steps[index].has_tool() {
                let step = &mut plan.steps[index];
                let text = Value::String(step.description.clone());
                step.start()?;
                step.complete(text)?;
                let step_id = step.id.clone();
                debug!(plan_id = %plan.id, step_id = %step_id, "Completed step without tool");
                self.emit(PlanningEvent::StepCompleted {
                    plan_id: plan.id.clone(),
                    step_id,
                })
                .await;
                continue;
            }

            let candidates = parallel::batch_candidates(plan, self.settings.lookahead_window);
            if candidates.len() > 1 {
                return self.dispatch_batch(plan, ctx, candidates).await;
            }
            return self.dispatch_single(plan, ctx, index).await;
        }
    }

    fn resolver(&self) -> ArgumentResolver {
        let resolver = ArgumentResolver::new()
            .with_concurrency(self.settings.extraction_concurrency)
            .with_timeout(self.settings.extraction_timeout());
        match &self.extractor {
            Some(extractor) => resolver.with_extractor(extractor.clone()),
            None => resolver,
        }
    }

    async fn dispatch_single(
        &self,
        plan: &mut ExecutionPlan,
        ctx: &ExecutionContext,
        index: usize,
    ) -> AgentResult<Move> {
        let step = &plan.steps[index];
        let tool = step.tool_name().unwrap_or_default().to_string();
        let arguments = step.arguments.clone();

        if let Some(source) = parallel::fan_out_source(plan, index) {
            let resolution = {
                let scope = ResolutionScope::for_plan(plan, ctx);
                self.resolver()
                    .resolve_preserving(&arguments, &scope, &source.template)
                    .await
            };
            if !resolution.is_complete() {
                return Ok(self.handle_missing(plan, index, resolution).await);
            }

            let calls = expand_fan_out(&tool, &resolution.arguments, &source);
            let concurrency = batch_concurrency(calls.len(), self.settings.max_concurrency);
            let invocations = calls.len();
            plan.steps[index].start()?;
            plan.metadata.active = Some(ActiveUnit::FanOut {
                step_index: index,
                invocations,
            });
            let step_id = plan.steps[index].id.clone();
            let action = Action::parallel_tools(calls, concurrency);
            remember_action(plan, &action)?;

            info!(plan_id = %plan.id, step_id = %step_id, invocations, "Fanning out step");
            self.emit(PlanningEvent::BatchDispatched {
                plan_id: plan.id.clone(),
                step_ids: vec![step_id.clone()],
                invocations,
                concurrency,
            })
            .await;
            let reasoning = format!("Running '{tool}' once per element ({invocations} calls)");
            return Ok(Move::Emit(
                thought(plan, reasoning, action).with_metadata("step_id", json!(step_id)),
            ));
        }

        let resolution = {
            let scope = ResolutionScope::for_plan(plan, ctx);
            self.resolver().resolve(&arguments, &scope).await
        };
        if !resolution.is_complete() {
            return Ok(self.handle_missing(plan, index, resolution).await);
        }

        plan.steps[index].start()?;
        plan.metadata.active = Some(ActiveUnit::Single {
            step_index: index,
            retry: false,
        });
        let step_id = plan.steps[index].id.clone();
        let reasoning = format!("Step '{}': {}", step_id, plan.steps[index].description);
        let action = Action::tool_call(tool.clone(), resolution.arguments);
        remember_action(plan, &action)?;

        debug!(plan_id = %plan.id, step_id = %step_id, tool = %tool, "Dispatching step");
        self.emit(PlanningEvent::StepDispatched {
            plan_id: plan.id.clone(),
            step_id: step_id.clone(),
            tool,
        })
        .await;
        Ok(Move::Emit(
            thought(plan, reasoning, action).with_metadata("step_id", json!(step_id)),
        ))
    }

    async fn dispatch_batch(
        &self,
        plan: &mut ExecutionPlan,
        ctx: &ExecutionContext,
        candidates: Vec<usize>,
    ) -> AgentResult<Move> {
        let mut resolved = Vec::with_capacity(candidates.len());
        {
            let scope = ResolutionScope::for_plan(plan, ctx);
            let resolver = self.resolver();
            for &index in &candidates {
                let resolution = resolver.resolve(&plan.steps[index].arguments, &scope).await;
                if resolution.is_complete() {
                    resolved.push((index, resolution.arguments));
                }
            }
        }
        if resolved.len() < 2 {
            // A step with missing inputs surfaces through single dispatch.
            return self.dispatch_single(plan, ctx, candidates[0]).await;
        }

        let mut calls = Vec::with_capacity(resolved.len());
        let mut step_ids = Vec::with_capacity(resolved.len());
        for (index, arguments) in resolved {
            let step = &mut plan.steps[index];
            step.start()?;
            let tool = step.tool_name().unwrap_or_default().to_string();
            calls.push(ToolInvocation::new(tool, arguments));
            step_ids.push(step.id.clone());
        }
        let concurrency = batch_concurrency(calls.len(), self.settings.max_concurrency);
        let invocations = calls.len();
        plan.metadata.active = Some(ActiveUnit::Batch {
            start_index: plan.current_step_index,
            step_ids: step_ids.clone(),
        });
        let action = Action::parallel_tools(calls, concurrency);
        remember_action(plan, &action)?;

        info!(plan_id = %plan.id, steps = ?step_ids, concurrency, "Dispatching parallel batch");
        self.emit(PlanningEvent::BatchDispatched {
            plan_id: plan.id.clone(),
            step_ids: step_ids.clone(),
            invocations,
            concurrency,
        })
        .await;
        let reasoning = format!("Running {invocations} independent steps in parallel");
        Ok(Move::Emit(
            thought(plan, reasoning, action).with_metadata("step_ids", json!(step_ids)),
        ))
    }

    async fn handle_missing(
        &self,
        plan: &mut ExecutionPlan,
        index: usize,
        resolution: Resolution,
    ) -> Move {
        let step = &plan.steps[index];
        info!(
            plan_id = %plan.id,
            step_id = %step.id,
            missing = ?resolution.missing,
            "Step arguments unresolved"
        );
        match self.policy.config().missing_input {
            MissingInputBehavior::AskUser => {
                let prompt = format!(
                    "Step '{}' ({}) needs more information: {}",
                    step.id,
                    step.description,
                    resolution.missing.join(", ")
                );
                self.await_input(plan, resolution.missing, prompt).await
            }
            MissingInputBehavior::Replan => {
                plan.metadata.missing_inputs = resolution.missing;
                plan.request_replan(ReplanCause::MissingInputs);
                Move::Replan
            }
        }
    }

    async fn await_input(
        &self,
        plan: &mut ExecutionPlan,
        missing: Vec<String>,
        prompt: String,
    ) -> Move {
        plan.status = PlanStatus::WaitingInput;
        plan.metadata.missing_inputs = missing.clone();
        plan.metadata
            .extra
            .insert("input_prompt".into(), Value::String(prompt));
        self.emit(PlanningEvent::AwaitingInput {
            plan_id: plan.id.clone(),
            missing,
        })
        .await;
        Move::Emit(waiting_thought(plan))
    }

    /// Park the plan on a question about a missing tool. The answer can only
    /// be used by a new plan, so resuming replans with cause `tool-missing`.
    async fn await_tool_answer(
        &self,
        plan: &mut ExecutionPlan,
        missing: Vec<String>,
        prompt: String,
    ) -> Move {
        plan.metadata
            .extra
            .insert(RESUME_REPLAN_KEY.into(), json!(ReplanCause::ToolMissing));
        self.await_input(plan, missing, prompt).await
    }

    // -----------------------------------------------------------------------
    // Plan creation
    // -----------------------------------------------------------------------

    async fn create_plan(
        &self,
        key: &str,
        ctx: &ExecutionContext,
        previous: Option<&ExecutionPlan>,
    ) -> AgentResult<ExecutionPlan> {
        let strategy = ctx
            .strategy
            .clone()
            .unwrap_or_else(|| self.settings.default_strategy.clone());
        let request = PlanRequest {
            goal: ctx.goal.clone(),
            strategy: strategy.clone(),
            system_prompt: system_prompt(&strategy),
            user_prompt: user_prompt(ctx, previous),
            available_tools: ctx.available_tools.clone(),
        };

        let generated = self.generator.create_plan(request).await?;
        let steps = normalize_steps(&generated.steps);
        let report = validate_plan(&steps);
        for issue in report.warnings() {
            warn!(thread_key = %key, issue = %issue, "Plan lint warning");
        }

        let valid = report.is_valid();
        let mut plan = if valid {
            ExecutionPlan::new(ctx.goal.clone(), strategy).with_steps(steps)
        } else {
            warn!(thread_key = %key, problems = %report.describe(), "Generated plan rejected");
            diagnostic_plan(ctx.goal.clone(), strategy, &report)
        };
        if !generated.reasoning.trim().is_empty() {
            plan.metadata.reasoning = Some(generated.reasoning.trim().to_string());
        }
        if valid {
            plan.metadata.signals = generated.signals.filter(|s| !s.is_empty());
        }

        info!(
            thread_key = %key,
            plan_id = %plan.id,
            steps = plan.steps.len(),
            valid,
            "Plan created"
        );
        self.emit(PlanningEvent::PlanCreated {
            thread_key: key.to_string(),
            plan_id: plan.id.clone(),
            step_count: plan.steps.len(),
            valid,
        })
        .await;
        Ok(plan)
    }

    /// Replace `old` with a freshly generated plan, or fail it once the
    /// replan cap is reached.
    async fn replan(
        &self,
        key: &str,
        mut old: ExecutionPlan,
        ctx: &ExecutionContext,
    ) -> AgentResult<ExecutionPlan> {
        let cause = old.metadata.replan_cause.unwrap_or(ReplanCause::StepFailed);
        if !self.policy.can_replan(&old) {
            let reason = format!(
                "Gave up after {} replans (last cause: {cause})",
                old.metadata.replans_count
            );
            old.metadata.replan_cause = Some(ReplanCause::MaxReplansExceeded);
            self.fail_plan(&mut old, reason).await;
            return Ok(old);
        }

        let replans_count = old.metadata.replans_count + 1;
        info!(thread_key = %key, plan_id = %old.id, cause = %cause, replans_count, "Replanning");
        self.emit(PlanningEvent::ReplanStarted {
            thread_key: key.to_string(),
            previous_plan_id: old.id.clone(),
            cause,
            replans_count,
        })
        .await;

        let mut plan = self.create_plan(key, ctx, Some(&old)).await?;
        plan.metadata.replans_count = replans_count;
        plan.metadata.replan_cause = Some(cause);
        plan.metadata.provided_inputs = old.metadata.provided_inputs;

        self.emit(PlanningEvent::ReplanCompleted {
            thread_key: key.to_string(),
            plan_id: plan.id.clone(),
            replans_count,
        })
        .await;
        Ok(plan)
    }

    // -----------------------------------------------------------------------
    // analyze_result
    // -----------------------------------------------------------------------

    /// Fold the executor's report into the plan.
    pub async fn analyze_result(&self, result: &ActionResult, ctx: &ExecutionContext) -> Analysis {
        match self.analyze_inner(result, ctx).await {
            Ok(analysis) => analysis,
            Err(err) => {
                error!(error = %err, "Result analysis failed");
                Analysis::failed(format!("Error: {err}"))
            }
        }
    }

    async fn analyze_inner(
        &self,
        result: &ActionResult,
        ctx: &ExecutionContext,
    ) -> AgentResult<Analysis> {
        let key = self.thread_key(ctx);
        let Some(mut plan) = self.store.load(&key).await? else {
            return Ok(match result {
                ActionResult::FinalAnswer { text } => Analysis::completed(text.clone()),
                ActionResult::Error { message, .. } => Analysis::failed(message.clone()),
                _ => Analysis::progress(true, "No plan for this thread yet"),
            });
        };
        if plan.is_finished() {
            return Ok(terminal_analysis(&plan));
        }

        let analysis = match result {
            ActionResult::FinalAnswer { text } => {
                plan.mark_completed();
                forget_action(&mut plan);
                self.emit(PlanningEvent::PlanCompleted {
                    plan_id: plan.id.clone(),
                })
                .await;
                Analysis::completed(text.clone())
            }
            ActionResult::Error { message, .. } => self.on_error(&mut plan, message, ctx).await?,
            ActionResult::ToolResult { tool_name, output } => match plan.metadata.active.clone() {
                Some(ActiveUnit::Batch { .. } | ActiveUnit::FanOut { .. }) => {
                    let outcomes = [ToolOutcome::ok(tool_name.clone(), output.clone())];
                    self.on_batch(&mut plan, &outcomes, ctx).await?
                }
                _ => self.on_success(&mut plan, output.clone()).await?,
            },
            ActionResult::ToolResults { results } => self.on_batch(&mut plan, results, ctx).await?,
        };

        self.store.save(&key, &plan).await?;
        Ok(analysis)
    }

    /// The step the report refers to when no batch is in flight.
    fn single_target(plan: &ExecutionPlan) -> Option<usize> {
        match &plan.metadata.active {
            Some(ActiveUnit::Single { step_index, .. }) => Some(*step_index),
            _ => plan
                .steps
                .iter()
                .position(|s| s.status == StepStatus::Executing)
                .or_else(|| {
                    plan.current_step()
                        .filter(|s| s.status == StepStatus::Pending)
                        .map(|_| plan.current_step_index)
                }),
        }
    }

    async fn on_success(&self, plan: &mut ExecutionPlan, output: Value) -> AgentResult<Analysis> {
        let Some(index) = Self::single_target(plan) else {
            debug!(plan_id = %plan.id, "Tool result without a dispatched step, ignoring");
            return Ok(Analysis::progress(true, "No step was waiting for this result"));
        };

        let step = &mut plan.steps[index];
        if step.status == StepStatus::Pending {
            step.start()?;
        }
        step.complete(output)?;
        let step_id = step.id.clone();
        plan.metadata.active = None;
        forget_action(plan);

        self.emit(PlanningEvent::StepCompleted {
            plan_id: plan.id.clone(),
            step_id: step_id.clone(),
        })
        .await;
        Ok(self.settle(plan, true, format!("Step '{step_id}' completed")).await)
    }

    async fn on_error(
        &self,
        plan: &mut ExecutionPlan,
        message: &str,
        ctx: &ExecutionContext,
    ) -> AgentResult<Analysis> {
        let failing: Vec<usize> = match &plan.metadata.active {
            Some(ActiveUnit::Batch { step_ids, .. }) => step_ids
                .iter()
                .filter_map(|id| plan.step_index(id))
                .collect(),
            Some(ActiveUnit::FanOut { step_index, .. }) => vec![*step_index],
            _ => Self::single_target(plan).into_iter().collect(),
        };

        if let [index] = failing.as_slice() {
            let index = *index;
            let single = matches!(plan.metadata.active, Some(ActiveUnit::Single { .. }));
            let step = &mut plan.steps[index];
            if single
                && classify_failure(message) == FailureClass::Transient
                && step.retry_count < self.settings.max_step_retries
            {
                step.retry_count += 1;
                let step_id = step.id.clone();
                let attempt = step.retry_count;
                plan.metadata.active = Some(ActiveUnit::Single {
                    step_index: index,
                    retry: true,
                });
                info!(plan_id = %plan.id, step_id = %step_id, attempt, error = %message, "Retrying step");
                self.emit(PlanningEvent::StepFailed {
                    plan_id: plan.id.clone(),
                    step_id: step_id.clone(),
                    error: message.to_string(),
                    will_retry: true,
                })
                .await;
                return Ok(Analysis::progress(
                    false,
                    format!("Step '{step_id}' failed ({message}); retry {attempt} scheduled"),
                ));
            }
        }

        for &index in &failing {
            let step = &mut plan.steps[index];
            if step.status == StepStatus::Pending {
                step.start()?;
            }
            step.fail(message)?;
            let step_id = step.id.clone();
            self.emit(PlanningEvent::StepFailed {
                plan_id: plan.id.clone(),
                step_id,
                error: message.to_string(),
                will_retry: false,
            })
            .await;
        }
        plan.metadata.active = None;
        forget_action(plan);

        let failed_tool = failing
            .first()
            .and_then(|&i| plan.steps[i].tool_name())
            .map(str::to_string);
        Ok(self.apply_failure(plan, message, failed_tool, ctx).await)
    }

    async fn apply_failure(
        &self,
        plan: &mut ExecutionPlan,
        message: &str,
        failed_tool: Option<String>,
        ctx: &ExecutionContext,
    ) -> Analysis {
        match self.policy.on_failure(message, ctx.iteration) {
            FailureDecision::Replan(cause) => {
                info!(plan_id = %plan.id, cause = %cause, error = %message, "Failure triggers replan");
                plan.request_replan(cause);
                Analysis::progress(false, format!("Step failed ({message}); replanning"))
            }
            FailureDecision::AskUser => {
                let missing = vec![failed_tool.unwrap_or_else(|| message.to_string())];
                let prompt = format!("A required tool is unavailable ({message}). How should I proceed?");
                let Move::Emit(thought) = self.await_tool_answer(plan, missing, prompt).await else {
                    return Analysis::progress(false, message.to_string());
                };
                Analysis::progress(false, format!("Waiting for input: {message}"))
                    .with_suggestion(thought.action)
            }
            FailureDecision::Fail => {
                warn!(plan_id = %plan.id, error = %message, "Unrecoverable step failure");
                self.fail_plan(plan, message.to_string()).await;
                terminal_analysis(plan)
            }
        }
    }

    async fn on_batch(
        &self,
        plan: &mut ExecutionPlan,
        results: &[ToolOutcome],
        ctx: &ExecutionContext,
    ) -> AgentResult<Analysis> {
        let mut failures: Vec<String> = Vec::new();
        let summary = match plan.metadata.active.clone() {
            Some(ActiveUnit::Batch { step_ids, .. }) => {
                self.reconcile_batch(plan, &step_ids, results, &mut failures)
                    .await?
            }
            Some(ActiveUnit::FanOut {
                step_index,
                invocations,
            }) => {
                if results.len() != invocations {
                    debug!(
                        plan_id = %plan.id,
                        expected = invocations,
                        received = results.len(),
                        "Fan-out result count differs"
                    );
                }
                self.reconcile_fan_out(plan, step_index, results, &mut failures)
                    .await?
            }
            Some(ActiveUnit::Single { .. }) | None => {
                let Some(index) = Self::single_target(plan) else {
                    return Ok(Analysis::progress(true, "No step was waiting for these results"));
                };
                self.reconcile_fan_out(plan, index, results, &mut failures)
                    .await?
            }
        };
        plan.metadata.active = None;
        forget_action(plan);

        // Batches are fail-open: only a replan decision interrupts the plan.
        for message in &failures {
            if let FailureDecision::Replan(cause) = self.policy.on_failure(message, ctx.iteration) {
                info!(plan_id = %plan.id, cause = %cause, error = %message, "Batch failure triggers replan");
                plan.request_replan(cause);
                return Ok(Analysis::progress(false, format!("{summary}; replanning")));
            }
        }
        Ok(self.settle(plan, failures.is_empty(), summary).await)
    }

    /// Match each outcome to the first unmatched executing batch step using
    /// the same tool.
    async fn reconcile_batch(
        &self,
        plan: &mut ExecutionPlan,
        step_ids: &[String],
        results: &[ToolOutcome],
        failures: &mut Vec<String>,
    ) -> AgentResult<String> {
        let mut open: Vec<usize> = step_ids
            .iter()
            .filter_map(|id| plan.step_index(id))
            .filter(|&i| plan.steps[i].status == StepStatus::Executing)
            .collect();
        let mut succeeded = 0usize;

        for outcome in results {
            let Some(slot) = open
                .iter()
                .position(|&i| plan.steps[i].tool_name() == Some(outcome.tool_name.as_str()))
            else {
                debug!(plan_id = %plan.id, tool = %outcome.tool_name, "Unmatched batch outcome");
                continue;
            };
            let index = open.remove(slot);
            if outcome.success {
                succeeded += 1;
                self.complete_step(plan, index, outcome.output.clone().unwrap_or(Value::Null))
                    .await?;
            } else {
                let message = outcome
                    .error
                    .clone()
                    .unwrap_or_else(|| format!("{} failed", outcome.tool_name));
                self.fail_step(plan, index, &message).await?;
                failures.push(message);
            }
        }

        for index in open {
            let message = format!("No result reported for step '{}'", plan.steps[index].id);
            self.fail_step(plan, index, &message).await?;
            failures.push(message);
        }

        Ok(format!(
            "Batch finished: {succeeded} succeeded, {} failed",
            failures.len()
        ))
    }

    /// A fan-out succeeds with the array of outputs (null for failed
    /// elements) when at least one element succeeded.
    async fn reconcile_fan_out(
        &self,
        plan: &mut ExecutionPlan,
        index: usize,
        results: &[ToolOutcome],
        failures: &mut Vec<String>,
    ) -> AgentResult<String> {
        let succeeded = results.iter().filter(|o| o.success).count();
        let step_id = plan.steps[index].id.clone();
        if plan.steps[index].status == StepStatus::Pending {
            plan.steps[index].start()?;
        }

        if succeeded == 0 {
            let errors: Vec<&str> = results.iter().filter_map(|o| o.error.as_deref()).collect();
            let message = if errors.is_empty() {
                format!("All invocations of step '{step_id}' failed")
            } else {
                errors.join("; ")
            };
            self.fail_step(plan, index, &message).await?;
            failures.push(message);
            return Ok(format!("Step '{step_id}' failed for every element"));
        }

        let outputs: Vec<Value> = results
            .iter()
            .map(|o| {
                if o.success {
                    o.output.clone().unwrap_or(Value::Null)
                } else {
                    Value::Null
                }
            })
            .collect();
        self.complete_step(plan, index, Value::Array(outputs)).await?;
        Ok(format!(
            "Step '{step_id}' finished: {succeeded} of {} invocations succeeded",
            results.len()
        ))
    }

    async fn complete_step(
        &self,
        plan: &mut ExecutionPlan,
        index: usize,
        output: Value,
    ) -> AgentResult<()> {
        plan.steps[index].complete(output)?;
        self.emit(PlanningEvent::StepCompleted {
            plan_id: plan.id.clone(),
            step_id: plan.steps[index].id.clone(),
        })
        .await;
        Ok(())
    }

    async fn fail_step(&self, plan: &mut ExecutionPlan, index: usize, message: &str) -> AgentResult<()> {
        plan.steps[index].fail(message)?;
        self.emit(PlanningEvent::StepFailed {
            plan_id: plan.id.clone(),
            step_id: plan.steps[index].id.clone(),
            error: message.to_string(),
            will_retry: false,
        })
        .await;
        Ok(())
    }

    /// Move the cursor and finish the plan when every step is terminal.
    async fn settle(&self, plan: &mut ExecutionPlan, successful: bool, feedback: String) -> Analysis {
        skip_blocked(plan);
        if plan.advance_cursor() {
            self.finish(plan).await;
            return terminal_analysis(plan);
        }
        Analysis::progress(successful, feedback)
    }

    // -----------------------------------------------------------------------
    // Terminal states
    // -----------------------------------------------------------------------

    /// All steps are terminal: completed unless nothing succeeded.
    async fn finish(&self, plan: &mut ExecutionPlan) {
        let any_success = plan.steps.iter().any(|s| s.status.is_success());
        if plan.steps.is_empty() || any_success {
            plan.mark_completed();
            forget_action(plan);
            info!(plan_id = %plan.id, "Plan completed");
            self.emit(PlanningEvent::PlanCompleted {
                plan_id: plan.id.clone(),
            })
            .await;
        } else {
            let reasons: Vec<String> = plan
                .steps
                .iter()
                .filter_map(|s| s.error.as_ref().map(|e| format!("{}: {}", s.id, e)))
                .collect();
            self.fail_plan(plan, format!("No step succeeded ({})", reasons.join("; ")))
                .await;
        }
    }

    async fn fail_plan(&self, plan: &mut ExecutionPlan, reason: String) {
        warn!(plan_id = %plan.id, reason = %reason, "Plan failed");
        plan.mark_failed(reason.clone());
        forget_action(plan);
        self.emit(PlanningEvent::PlanFailed {
            plan_id: plan.id.clone(),
            reason,
        })
        .await;
    }

    // -----------------------------------------------------------------------
    // Input resumption
    // -----------------------------------------------------------------------

    /// Supply values for a plan waiting on input and resume it.
    ///
    /// Keys are the identifiers reported as missing: sentinel argument names,
    /// `NEEDS-INPUT` names or whole template strings. A plan paused over a
    /// missing tool resumes by replanning with the inputs carried over.
    /// Returns `false` when no plan under `key` is waiting.
    pub async fn provide_input(&self, key: &str, inputs: Map<String, Value>) -> AgentResult<bool> {
        let key = key.to_string();
        let Some(mut plan) = self.store.load(&key).await? else {
            return Ok(false);
        };
        if plan.status != PlanStatus::WaitingInput {
            return Ok(false);
        }

        let keys: Vec<&String> = inputs.keys().collect();
        info!(plan_id = %plan.id, inputs = ?keys, "Resuming plan with provided input");
        plan.metadata.provided_inputs.extend(inputs);
        plan.metadata.missing_inputs.clear();
        plan.metadata.extra.remove("input_prompt");
        let resume_cause = plan
            .metadata
            .extra
            .remove(RESUME_REPLAN_KEY)
            .and_then(|cause| serde_json::from_value::<ReplanCause>(cause).ok());
        match resume_cause {
            Some(cause) => {
                info!(plan_id = %plan.id, cause = %cause, "Provided input will be used by a new plan");
                plan.request_replan(cause);
            }
            None => plan.status = PlanStatus::Executing,
        }
        self.store.save(&key, &plan).await?;
        Ok(true)
    }

    async fn emit(&self, event: PlanningEvent) {
        let Some(telemetry) = &self.telemetry else {
            return;
        };
        let name = event.name();
        if let Err(err) = telemetry.record(event).await {
            warn!(event = name, error = %err, "Telemetry sink rejected event");
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn thought(plan: &ExecutionPlan, reasoning: impl Into<String>, action: Action) -> AgentThought {
    let kind = action.kind();
    AgentThought::new(reasoning, action)
        .with_metadata("plan_id", json!(plan.id))
        .with_metadata("plan_status", json!(plan.status))
        .with_metadata("action", json!(kind))
}

fn remember_action(plan: &mut ExecutionPlan, action: &Action) -> AgentResult<()> {
    plan.metadata
        .extra
        .insert(PENDING_ACTION_KEY.into(), serde_json::to_value(action)?);
    Ok(())
}

fn forget_action(plan: &mut ExecutionPlan) {
    plan.metadata.extra.remove(PENDING_ACTION_KEY);
}

/// Skip pending steps whose explicit dependencies failed or were skipped,
/// repeating until nothing changes.
fn skip_blocked(plan: &mut ExecutionPlan) {
    loop {
        let blocked: Vec<(usize, String)> = (0..plan.steps.len())
            .filter(|&i| plan.steps[i].status == StepStatus::Pending)
            .filter_map(|i| parallel::blocked_by(plan, i).map(|dep| (i, dep)))
            .collect();
        if blocked.is_empty() {
            return;
        }
        for (index, dependency) in blocked {
            let step = &mut plan.steps[index];
            debug!(step_id = %step.id, dependency = %dependency, "Skipping blocked step");
            // Pending -> Skipped is always legal.
            let _ = step.skip(format!("Dependency '{dependency}' did not complete"));
        }
    }
}

/// Final answer text for a finished plan.
pub fn answer_text(plan: &ExecutionPlan) -> String {
    match plan.status {
        PlanStatus::Failed => plan
            .metadata
            .failure_reason
            .clone()
            .unwrap_or_else(|| "Plan failed".to_string()),
        _ => plan
            .last_result()
            .map(stringify)
            .or_else(|| plan.metadata.reasoning.clone())
            .unwrap_or_else(|| "Plan completed".to_string()),
    }
}

fn terminal_thought(plan: &ExecutionPlan) -> AgentThought {
    let reasoning = match plan.status {
        PlanStatus::Failed => "Plan failed",
        _ => "Plan completed",
    };
    let mut thought = thought(plan, reasoning, Action::final_answer(answer_text(plan)));
    if let Some(cause) = plan.metadata.replan_cause {
        thought = thought.with_metadata("replan_cause", json!(cause));
    }
    thought
}

fn terminal_analysis(plan: &ExecutionPlan) -> Analysis {
    match plan.status {
        PlanStatus::Failed => Analysis::failed(answer_text(plan)),
        _ => Analysis::completed(answer_text(plan)),
    }
}

fn waiting_thought(plan: &ExecutionPlan) -> AgentThought {
    let prompt = plan
        .metadata
        .extra
        .get("input_prompt")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| format!("Please provide: {}", plan.metadata.missing_inputs.join(", ")));
    thought(
        plan,
        "Waiting for user input",
        Action::need_input(prompt, plan.metadata.missing_inputs.clone()),
    )
}

// ---------------------------------------------------------------------------
// Prompts
// ---------------------------------------------------------------------------

fn system_prompt(strategy: &str) -> String {
    format!(
        "You are a planning module. Break the user's goal into a {strategy} plan of tool steps.\n\
         Reply with JSON only: {{\"reasoning\": string, \"steps\": [{{\"id\": string, \
         \"description\": string, \"tool\": string | \"none\", \"arguments\": object, \
         \"dependsOn\": [string]}}], \"signals\": {{\"needs\": [string], \
         \"noDiscoveryPath\": [string]}}}}.\n\
         Reference earlier results as {{{{<stepId>.result.<path>}}}}; write NEEDS-INPUT:<name> \
         for values only the user can supply."
    )
}

fn user_prompt(ctx: &ExecutionContext, previous: Option<&ExecutionPlan>) -> String {
    let mut prompt = format!("Goal: {}\n", ctx.goal);
    if !ctx.available_tools.is_empty() {
        prompt.push_str("\nAvailable tools:\n");
        for tool in &ctx.available_tools {
            let _ = writeln!(prompt, "- {}: {}", tool.name, tool.description);
        }
    }

    if let Some(previous) = previous {
        let cause = previous
            .metadata
            .replan_cause
            .map(|c| c.to_string())
            .unwrap_or_else(|| "unknown".into());
        let _ = writeln!(prompt, "\nThe previous plan was abandoned ({cause}). Its steps:");
        for step in &previous.steps {
            let _ = write!(prompt, "- {} [{:?}] {}", step.id, step.status, step.description);
            if let Some(error) = &step.error {
                let _ = write!(prompt, " (error: {error})");
            }
            prompt.push('\n');
        }
        if !previous.metadata.missing_inputs.is_empty() {
            let _ = writeln!(
                prompt,
                "Unresolved inputs: {}",
                previous.metadata.missing_inputs.join(", ")
            );
        }
        if !previous.metadata.provided_inputs.is_empty() {
            let provided = Value::Object(previous.metadata.provided_inputs.clone());
            let _ = writeln!(prompt, "User-provided inputs: {provided}");
        }
    }
    prompt
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

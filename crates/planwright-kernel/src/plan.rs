//! Plan & Step Model
//!
//! The data entities shared by every planning component:
//!
//! - [`PlanStep`]: one unit of work, optionally bound to an external tool.
//! - [`ExecutionPlan`]: the owning aggregate with a cursor, lifecycle status and
//!   a metadata bag carrying replan bookkeeping and planner signals.
//!
//! Step status only moves forward
//! (`pending → executing → {completed | failed | skipped}`); a finished step is
//! never resurrected. Replanning always produces a new [`ExecutionPlan`] with a
//! fresh id.
//!
//! # Example
//!
//! ```rust,ignore
//! use planwright_kernel::plan::{ExecutionPlan, PlanStep};
//! use serde_json::json;
//!
//! let plan = ExecutionPlan::new("Find the latest release notes", "sequential")
//!     .add_step(PlanStep::new("s1", "Search releases").with_tool("search"))
//!     .add_step(
//!         PlanStep::new("s2", "Fetch the first hit")
//!             .with_tool("fetch")
//!             .with_argument("id", json!("{{s1.result[0].id}}")),
//!     );
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;

use crate::error::{AgentError, AgentResult};

/// Tool name the planner uses for "no tool, conversational step".
pub const NO_TOOL: &str = "none";

// ---------------------------------------------------------------------------
// Step kind and status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    #[default]
    Action,
    Decision,
    Verification,
}

impl StepKind {
    /// Parse a loosely spelled kind tag; unknown tags map to `Action`.
    pub fn from_tag(tag: &str) -> Self {
        match tag.trim().to_ascii_lowercase().as_str() {
            "decision" | "decide" => Self::Decision,
            "verification" | "verify" | "check" => Self::Verification,
            _ => Self::Action,
        }
    }
}

/// Status of a single plan step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    /// Waiting to be dispatched.
    #[default]
    Pending,
    /// Dispatched to the tool executor, result not yet analyzed.
    Executing,
    Completed,
    Failed,
    /// Skipped because a dependency failed or was skipped.
    Skipped,
}

impl StepStatus {
    /// Returns `true` if the step has reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed)
    }

    /// Whether `self → next` respects the forward-only lifecycle.
    pub fn can_transition_to(&self, next: StepStatus) -> bool {
        match (self, next) {
            (Self::Pending, Self::Executing | Self::Failed | Self::Skipped) => true,
            (Self::Executing, Self::Completed | Self::Failed | Self::Skipped) => true,
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Plan Step
// ---------------------------------------------------------------------------

/// A single unit of work within a plan.
///
/// `arguments` values may embed template references such as
/// `{{s1.result[0].id}}`; they are substituted right before dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    /// Unique within the plan, stable across insertion.
    pub id: String,

    /// Human-readable intent, used as fallback response text.
    pub description: String,

    #[serde(default)]
    pub kind: StepKind,

    /// External capability to invoke. `None` or `"none"` means no tool call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,

    #[serde(default)]
    pub arguments: Map<String, Value>,

    /// Step ids that must be `completed` before this step may run.
    #[serde(default)]
    pub dependencies: Vec<String>,

    #[serde(default)]
    pub status: StepStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    /// Failure message recorded when the step ends `failed` or `skipped`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default)]
    pub retry_count: u32,

    /// Plan author's hint that this step is meant to fan out.
    #[serde(default)]
    pub explicit_parallel: bool,
}

impl PlanStep {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            kind: StepKind::Action,
            tool: None,
            arguments: Map::new(),
            dependencies: Vec::new(),
            status: StepStatus::Pending,
            result: None,
            error: None,
            retry_count: 0,
            explicit_parallel: false,
        }
    }

    pub fn with_tool(mut self, tool: impl Into<String>) -> Self {
        self.tool = Some(tool.into());
        self
    }

    pub fn with_kind(mut self, kind: StepKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_argument(mut self, name: impl Into<String>, value: Value) -> Self {
        self.arguments.insert(name.into(), value);
        self
    }

    pub fn with_arguments(mut self, arguments: Map<String, Value>) -> Self {
        self.arguments = arguments;
        self
    }

    /// Add a dependency on another step (duplicates are ignored).
    pub fn depends_on(mut self, step_id: impl Into<String>) -> Self {
        let step_id = step_id.into();
        if !self.dependencies.contains(&step_id) {
            self.dependencies.push(step_id);
        }
        self
    }

    pub fn parallel(mut self) -> Self {
        self.explicit_parallel = true;
        self
    }

    /// The tool to invoke, or `None` for conversational steps.
    pub fn tool_name(&self) -> Option<&str> {
        self.tool
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty() && !t.eq_ignore_ascii_case(NO_TOOL))
    }

    pub fn has_tool(&self) -> bool {
        self.tool_name().is_some()
    }

    /// Returns `true` if every dependency is in `completed_ids`.
    pub fn dependencies_met(&self, completed_ids: &HashSet<&str>) -> bool {
        self.dependencies
            .iter()
            .all(|dep| completed_ids.contains(dep.as_str()))
    }

    /// Move the step to `next`, rejecting backward or sideways transitions.
    pub fn transition(&mut self, next: StepStatus) -> AgentResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(AgentError::invalid_state_transition(self.status, next));
        }
        self.status = next;
        Ok(())
    }

    pub fn start(&mut self) -> AgentResult<()> {
        self.transition(StepStatus::Executing)
    }

    pub fn complete(&mut self, result: Value) -> AgentResult<()> {
        self.transition(StepStatus::Completed)?;
        self.result = Some(result);
        Ok(())
    }

    pub fn fail(&mut self, error: impl Into<String>) -> AgentResult<()> {
        self.transition(StepStatus::Failed)?;
        self.error = Some(error.into());
        Ok(())
    }

    pub fn skip(&mut self, reason: impl Into<String>) -> AgentResult<()> {
        self.transition(StepStatus::Skipped)?;
        self.error = Some(reason.into());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Plan status and metadata
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PlanStatus {
    #[default]
    Planning,
    Executing,
    Replanning,
    Completed,
    Failed,
    /// Quiescent: the plan stays alive until input arrives.
    WaitingInput,
}

impl PlanStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Why a plan was (or is about to be) replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReplanCause {
    FailWindow,
    Ttl,
    Budget,
    ToolMissing,
    MissingInputs,
    MaxReplansExceeded,
    /// Opportunistic replan after a transient step failure.
    StepFailed,
}

impl ReplanCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FailWindow => "fail-window",
            Self::Ttl => "ttl",
            Self::Budget => "budget",
            Self::ToolMissing => "tool-missing",
            Self::MissingInputs => "missing-inputs",
            Self::MaxReplansExceeded => "max-replans-exceeded",
            Self::StepFailed => "step-failed",
        }
    }
}

impl std::fmt::Display for ReplanCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Planner-reported hints attached to a generated plan.
///
/// Field aliases accept the camelCase spelling LLMs tend to produce.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanSignals {
    /// Named inputs the planner could not determine.
    #[serde(default)]
    pub needs: Vec<String>,

    /// Tools the planner wanted but could not find.
    #[serde(default, alias = "noDiscoveryPath")]
    pub no_discovery_path: Vec<String>,

    #[serde(default)]
    pub errors: Vec<String>,

    #[serde(default, alias = "suggestedNextStep", skip_serializing_if = "Option::is_none")]
    pub suggested_next_step: Option<String>,

    #[serde(default, alias = "failurePatterns")]
    pub failure_patterns: Vec<String>,
}

impl PlanSignals {
    pub fn is_empty(&self) -> bool {
        self.needs.is_empty()
            && self.no_discovery_path.is_empty()
            && self.errors.is_empty()
            && self.suggested_next_step.is_none()
            && self.failure_patterns.is_empty()
    }
}

/// The unit of work currently out with the tool executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActiveUnit {
    /// One step dispatched as a `tool_call`. `retry` is set when the next
    /// `think` must re-dispatch the same call.
    Single { step_index: usize, retry: bool },
    /// Several independent steps dispatched as one `parallel_tools` batch.
    Batch {
        start_index: usize,
        step_ids: Vec<String>,
    },
    /// One step expanded into one invocation per array element.
    FanOut { step_index: usize, invocations: usize },
}

/// Free-form bag carried by every plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanMetadata {
    pub start_time: DateTime<Utc>,

    #[serde(default)]
    pub replans_count: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replan_cause: Option<ReplanCause>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signals: Option<PlanSignals>,

    /// Planner's free-text reasoning for this plan.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,

    /// Identifiers still missing after the last resolution attempt.
    #[serde(default)]
    pub missing_inputs: Vec<String>,

    /// Values supplied while the plan was waiting for input, keyed by the
    /// missing identifier they satisfy.
    #[serde(default)]
    pub provided_inputs: Map<String, Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active: Option<ActiveUnit>,

    #[serde(default)]
    pub extra: Map<String, Value>,
}

impl Default for PlanMetadata {
    fn default() -> Self {
        Self {
            start_time: Utc::now(),
            replans_count: 0,
            replan_cause: None,
            signals: None,
            reasoning: None,
            failure_reason: None,
            missing_inputs: Vec::new(),
            provided_inputs: Map::new(),
            active: None,
            extra: Map::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Execution Plan
// ---------------------------------------------------------------------------

/// An ordered set of steps addressing one goal.
///
/// Step order is the default execution sequence; `dependencies` may relax it
/// and the executor may dispatch a later ready step ahead of a blocked one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub id: String,
    pub goal: String,
    pub strategy: String,
    pub steps: Vec<PlanStep>,
    #[serde(default)]
    pub current_step_index: usize,
    #[serde(default)]
    pub status: PlanStatus,
    #[serde(default)]
    pub metadata: PlanMetadata,
}

impl ExecutionPlan {
    /// Create an empty plan with a fresh id.
    pub fn new(goal: impl Into<String>, strategy: impl Into<String>) -> Self {
        Self {
            id: format!("plan-{}", uuid::Uuid::new_v4()),
            goal: goal.into(),
            strategy: strategy.into(),
            steps: Vec::new(),
            current_step_index: 0,
            status: PlanStatus::Planning,
            metadata: PlanMetadata::default(),
        }
    }

    /// Add a step to the plan (builder pattern).
    pub fn add_step(mut self, step: PlanStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_steps(mut self, steps: Vec<PlanStep>) -> Self {
        self.steps = steps;
        self
    }

    pub fn get_step(&self, id: &str) -> Option<&PlanStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn step_index(&self, id: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.id == id)
    }

    /// Map a step identifier to an index: literal ids win, then the
    /// positional alias `step-N` (1-based).
    pub fn resolve_identifier(&self, identifier: &str) -> Option<usize> {
        resolve_step_identifier(&self.steps, identifier)
    }

    pub fn completed_ids(&self) -> HashSet<&str> {
        self.steps
            .iter()
            .filter(|s| s.status.is_success())
            .map(|s| s.id.as_str())
            .collect()
    }

    /// The step under the cursor, if any.
    pub fn current_step(&self) -> Option<&PlanStep> {
        self.steps.get(self.current_step_index)
    }

    /// Move the cursor past every leading terminal step.
    ///
    /// Returns `true` when the cursor reached the end of `steps`.
    pub fn advance_cursor(&mut self) -> bool {
        while self
            .steps
            .get(self.current_step_index)
            .is_some_and(|s| s.status.is_terminal())
        {
            self.current_step_index += 1;
        }
        self.current_step_index >= self.steps.len()
    }

    pub fn is_exhausted(&self) -> bool {
        self.current_step_index >= self.steps.len()
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    /// Record why the plan needs replacing and flip it to `replanning`.
    pub fn request_replan(&mut self, cause: ReplanCause) {
        self.metadata.replan_cause = Some(cause);
        self.status = PlanStatus::Replanning;
    }

    pub fn mark_completed(&mut self) {
        self.status = PlanStatus::Completed;
        self.metadata.active = None;
    }

    pub fn mark_failed(&mut self, reason: impl Into<String>) {
        self.status = PlanStatus::Failed;
        self.metadata.failure_reason = Some(reason.into());
        self.metadata.active = None;
    }

    /// The most recent completed step's result, used as a default answer.
    pub fn last_result(&self) -> Option<&Value> {
        self.steps
            .iter()
            .rev()
            .filter(|s| s.status.is_success())
            .find_map(|s| s.result.as_ref())
    }
}

/// Shared identifier lookup used by validation and resolution.
pub fn resolve_step_identifier(steps: &[PlanStep], identifier: &str) -> Option<usize> {
    if let Some(idx) = steps.iter().position(|s| s.id == identifier) {
        return Some(idx);
    }
    positional_alias(identifier).and_then(|n| (n >= 1 && n <= steps.len()).then(|| n - 1))
}

/// Parse `step-N` / `step_N` into `N`.
pub fn positional_alias(identifier: &str) -> Option<usize> {
    let rest = identifier
        .strip_prefix("step-")
        .or_else(|| identifier.strip_prefix("step_"))?;
    rest.parse().ok()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

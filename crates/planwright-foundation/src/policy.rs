//! Replan Policy Engine
//!
//! Pure decisions over plan age, execution history, budget counters and
//! failure messages:
//!
//! - [`ReplanPolicyEngine::evaluate`] answers "abandon the current plan?" at
//!   the top of every `think`, in fixed precedence (explicit request, failure
//!   window, plan TTL, wall-clock budget, tool-call budget);
//! - [`ReplanPolicyEngine::on_failure`] classifies one failed step.
//!
//! Time is always passed in, so the engine holds no timers.

use chrono::{DateTime, Utc};
use planwright_kernel::{
    ExecutionContext, ExecutionPlan, HistoryEntry, PlanStatus, ReplanCause, ReplanPolicyConfig,
    ToolUnavailableBehavior,
};
use tracing::debug;

const TOOL_UNAVAILABLE_MARKERS: &[&str] = &["tool not found", "unknown tool"];

const UNRECOVERABLE_MARKERS: &[&str] = &[
    "permission denied",
    "not found",
    "invalid credentials",
    "unauthorized",
];

/// Class of a step failure message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    ToolUnavailable,
    Unrecoverable,
    Transient,
}

/// What to do after a step failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDecision {
    Replan(ReplanCause),
    AskUser,
    /// Definitive failure of the plan.
    Fail,
}

pub fn classify_failure(message: &str) -> FailureClass {
    let lower = message.to_lowercase();
    if TOOL_UNAVAILABLE_MARKERS.iter().any(|m| lower.contains(m)) {
        FailureClass::ToolUnavailable
    } else if UNRECOVERABLE_MARKERS.iter().any(|m| lower.contains(m)) {
        FailureClass::Unrecoverable
    } else {
        FailureClass::Transient
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReplanPolicyEngine {
    config: ReplanPolicyConfig,
}

impl ReplanPolicyEngine {
    pub fn new(config: ReplanPolicyConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ReplanPolicyConfig {
        &self.config
    }

    /// Whether another replan is allowed for `plan`.
    pub fn can_replan(&self, plan: &ExecutionPlan) -> bool {
        plan.metadata.replans_count < self.config.max_replans_per_plan
    }

    /// The first replan rule that fires, if any.
    ///
    /// Only history recorded since the plan started counts toward the failure
    /// window, so a fresh plan is not condemned by its predecessor's errors.
    pub fn evaluate(
        &self,
        plan: &ExecutionPlan,
        history: &[HistoryEntry],
        started_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Option<ReplanCause> {
        if plan.status == PlanStatus::Replanning {
            return Some(plan.metadata.replan_cause.unwrap_or(ReplanCause::StepFailed));
        }

        if self.failure_window_exceeded(plan, history) {
            return Some(ReplanCause::FailWindow);
        }

        if let Some(ttl_ms) = self.config.plan_ttl_ms {
            if elapsed_ms(plan.metadata.start_time, now) > ttl_ms {
                return Some(ReplanCause::Ttl);
            }
        }

        let budget = &self.config.budget;
        if let Some(max_ms) = budget.max_ms {
            if elapsed_ms(started_at, now) > max_ms {
                return Some(ReplanCause::Budget);
            }
        }
        if let Some(max_calls) = budget.max_tool_calls {
            let calls = history.iter().filter(|e| e.kind.is_tool_result()).count();
            if calls >= max_calls {
                return Some(ReplanCause::Budget);
            }
        }

        None
    }

    /// [`evaluate`](Self::evaluate) against `ctx`, writing the cause into the
    /// plan when a rule fires.
    pub fn should_replan(
        &self,
        plan: &mut ExecutionPlan,
        ctx: &ExecutionContext,
        now: DateTime<Utc>,
    ) -> bool {
        match self.evaluate(plan, &ctx.history, ctx.started_at, now) {
            Some(cause) => {
                debug!(plan_id = %plan.id, cause = %cause, "Replan rule fired");
                plan.request_replan(cause);
                true
            }
            None => false,
        }
    }

    fn failure_window_exceeded(&self, plan: &ExecutionPlan, history: &[HistoryEntry]) -> bool {
        let window = self.config.window_size;
        if window == 0 || self.config.min_failures == 0 {
            return false;
        }
        let recent: Vec<&HistoryEntry> = history
            .iter()
            .filter(|e| e.at >= plan.metadata.start_time)
            .collect();
        let failures = recent
            .iter()
            .rev()
            .take(window)
            .filter(|e| e.is_error())
            .count();
        failures >= self.config.min_failures
    }

    /// Decide what a failed step means for the plan.
    pub fn on_failure(&self, message: &str, iteration: u32) -> FailureDecision {
        match classify_failure(message) {
            FailureClass::ToolUnavailable => match self.config.tool_unavailable {
                ToolUnavailableBehavior::Replan => FailureDecision::Replan(ReplanCause::ToolMissing),
                ToolUnavailableBehavior::AskUser => FailureDecision::AskUser,
                ToolUnavailableBehavior::Fail => FailureDecision::Fail,
            },
            FailureClass::Unrecoverable => FailureDecision::Fail,
            FailureClass::Transient if iteration < self.config.allow_replan_until_iteration => {
                FailureDecision::Replan(ReplanCause::StepFailed)
            }
            FailureClass::Transient => FailureDecision::Fail,
        }
    }

    pub fn should_replan_on_failure(&self, message: &str, ctx: &ExecutionContext) -> bool {
        matches!(
            self.on_failure(message, ctx.iteration),
            FailureDecision::Replan(_)
        )
    }
}

/// Milliseconds from `since` to `now`, zero when `now` is earlier.
fn elapsed_ms(since: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    u64::try_from((now - since).num_milliseconds()).unwrap_or(0)
}

//! Planning lifecycle events
//!
//! Events are delivered to a [`PlanTelemetry`] sink on a best-effort basis:
//! the executor logs and drops sink errors, so a failing sink never changes
//! plan behavior.

use serde::{Deserialize, Serialize};

use crate::plan::ReplanCause;

/// Events emitted during the plan lifecycle for observability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
#[non_exhaustive]
pub enum PlanningEvent {
    /// A new plan was created (first plan or replacement).
    PlanCreated {
        thread_key: String,
        plan_id: String,
        step_count: usize,
        valid: bool,
    },

    ReplanStarted {
        thread_key: String,
        previous_plan_id: String,
        cause: ReplanCause,
        replans_count: u32,
    },

    ReplanCompleted {
        thread_key: String,
        plan_id: String,
        replans_count: u32,
    },

    StepDispatched {
        plan_id: String,
        step_id: String,
        tool: String,
    },

    BatchDispatched {
        plan_id: String,
        step_ids: Vec<String>,
        invocations: usize,
        concurrency: usize,
    },

    StepCompleted { plan_id: String, step_id: String },

    StepFailed {
        plan_id: String,
        step_id: String,
        error: String,
        will_retry: bool,
    },

    AwaitingInput {
        plan_id: String,
        missing: Vec<String>,
    },

    PlanCompleted { plan_id: String },

    PlanFailed { plan_id: String, reason: String },
}

impl PlanningEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::PlanCreated { .. } => "plan_created",
            Self::ReplanStarted { .. } => "replan_started",
            Self::ReplanCompleted { .. } => "replan_completed",
            Self::StepDispatched { .. } => "step_dispatched",
            Self::BatchDispatched { .. } => "batch_dispatched",
            Self::StepCompleted { .. } => "step_completed",
            Self::StepFailed { .. } => "step_failed",
            Self::AwaitingInput { .. } => "awaiting_input",
            Self::PlanCompleted { .. } => "plan_completed",
            Self::PlanFailed { .. } => "plan_failed",
        }
    }
}

/// Telemetry / session sink.
#[async_trait::async_trait]
pub trait PlanTelemetry: Send + Sync {
    async fn record(&self, event: PlanningEvent) -> crate::error::AgentResult<()>;
}

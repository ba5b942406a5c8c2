//! Tracing-backed telemetry
//!
//! [`TracingTelemetry`] is the default [`PlanTelemetry`] sink: one structured
//! `tracing` event per [`PlanningEvent`], under the `planwright::events`
//! target. [`init_tracing`] installs a formatting subscriber for binaries and
//! examples.

use async_trait::async_trait;
use planwright_kernel::{AgentResult, PlanTelemetry, PlanningEvent};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Install a `fmt` subscriber filtered by `RUST_LOG`, falling back to
/// `default_directive` (e.g. `"planwright_foundation=info"`).
///
/// Returns `false` if a global subscriber was already set.
pub fn init_tracing(default_directive: &str) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok()
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TracingTelemetry;

impl TracingTelemetry {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PlanTelemetry for TracingTelemetry {
    async fn record(&self, event: PlanningEvent) -> AgentResult<()> {
        let name = event.name();
        match &event {
            PlanningEvent::PlanCreated {
                thread_key,
                plan_id,
                step_count,
                valid,
            } => info!(
                target: "planwright::events",
                event = name, %thread_key, %plan_id, step_count, valid,
                "Plan created"
            ),
            PlanningEvent::ReplanStarted {
                thread_key,
                previous_plan_id,
                cause,
                replans_count,
            } => info!(
                target: "planwright::events",
                event = name, %thread_key, %previous_plan_id, %cause, replans_count,
                "Replan started"
            ),
            PlanningEvent::ReplanCompleted {
                thread_key,
                plan_id,
                replans_count,
            } => info!(
                target: "planwright::events",
                event = name, %thread_key, %plan_id, replans_count,
                "Replan completed"
            ),
            PlanningEvent::StepFailed {
                plan_id,
                step_id,
                error,
                will_retry,
            } => warn!(
                target: "planwright::events",
                event = name, %plan_id, %step_id, %error, will_retry,
                "Step failed"
            ),
            PlanningEvent::PlanFailed { plan_id, reason } => warn!(
                target: "planwright::events",
                event = name, %plan_id, %reason,
                "Plan failed"
            ),
            PlanningEvent::PlanCompleted { plan_id } => info!(
                target: "planwright::events",
                event = name, %plan_id,
                "Plan completed"
            ),
            other => debug!(
                target: "planwright::events",
                event = name, details = ?other,
                "Planning event"
            ),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use planwright_kernel::ReplanCause;

    #[tokio::test]
    async fn records_every_event_kind() {
        let sink = TracingTelemetry::new();
        let events = vec![
            PlanningEvent::PlanCreated {
                thread_key: "t".into(),
                plan_id: "p".into(),
                step_count: 2,
                valid: true,
            },
            PlanningEvent::ReplanStarted {
                thread_key: "t".into(),
                previous_plan_id: "p".into(),
                cause: ReplanCause::Ttl,
                replans_count: 0,
            },
            PlanningEvent::AwaitingInput {
                plan_id: "p".into(),
                missing: vec!["email".into()],
            },
        ];
        for event in events {
            sink.record(event).await.unwrap();
        }
    }

    #[test]
    fn init_is_idempotent() {
        init_tracing("planwright_foundation=debug");
        assert!(!init_tracing("planwright_foundation=debug"));
    }
}

use async_trait::async_trait;
use planwright_kernel::{AgentError, AgentResult, PlanTelemetry, PlanningEvent};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::RwLock;

/// Keeps every planning event for later assertions.
#[derive(Clone, Default)]
pub struct RecordingTelemetry {
    pub events: Arc<RwLock<Vec<PlanningEvent>>>,
}

impl RecordingTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<PlanningEvent> {
        self.events.read().await.clone()
    }

    pub async fn names(&self) -> Vec<&'static str> {
        self.events.read().await.iter().map(|e| e.name()).collect()
    }

    /// Number of recorded events named `name` (e.g. `"replan_started"`).
    pub async fn count(&self, name: &str) -> usize {
        self.events
            .read()
            .await
            .iter()
            .filter(|e| e.name() == name)
            .count()
    }
}

#[async_trait]
impl PlanTelemetry for RecordingTelemetry {
    async fn record(&self, event: PlanningEvent) -> AgentResult<()> {
        self.events.write().await.push(event);
        Ok(())
    }
}

/// A sink that rejects every event.
#[derive(Clone, Default)]
pub struct FailingTelemetry {
    attempts: Arc<AtomicUsize>,
}

impl FailingTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PlanTelemetry for FailingTelemetry {
    async fn record(&self, event: PlanningEvent) -> AgentResult<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(AgentError::StorageError(format!(
            "session sink unavailable for {}",
            event.name()
        )))
    }
}

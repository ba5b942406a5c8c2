use async_trait::async_trait;
use planwright_kernel::{AgentError, AgentResult, GeneratedPlan, PlanGenerator, PlanRequest};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::RwLock;

/// A plan generator that hands out predefined plans in order.
///
/// The last scripted plan is repeated for every further request, so a
/// single-plan script answers any number of replans.
#[derive(Clone, Default)]
pub struct ScriptedPlanGenerator {
    plans: Arc<RwLock<VecDeque<GeneratedPlan>>>,
    /// Every request received, in order.
    pub requests: Arc<RwLock<Vec<PlanRequest>>>,
}

impl ScriptedPlanGenerator {
    pub fn new(plans: Vec<GeneratedPlan>) -> Self {
        Self {
            plans: Arc::new(RwLock::new(plans.into())),
            requests: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Script a single plan from raw step objects.
    pub fn with_steps(steps: Vec<Value>) -> Self {
        Self::new(vec![GeneratedPlan::new(steps)])
    }

    pub async fn push(&self, plan: GeneratedPlan) {
        self.plans.write().await.push_back(plan);
    }

    pub async fn call_count(&self) -> usize {
        self.requests.read().await.len()
    }

    pub async fn last_request(&self) -> Option<PlanRequest> {
        self.requests.read().await.last().cloned()
    }
}

#[async_trait]
impl PlanGenerator for ScriptedPlanGenerator {
    async fn create_plan(&self, request: PlanRequest) -> AgentResult<GeneratedPlan> {
        self.requests.write().await.push(request);
        let mut plans = self.plans.write().await;
        if plans.len() > 1 {
            if let Some(plan) = plans.pop_front() {
                return Ok(plan);
            }
        }
        plans
            .front()
            .cloned()
            .ok_or_else(|| AgentError::PlanningFailed("no plan scripted".to_string()))
    }
}

//! In-memory plan repository
//!
//! Thread-safe [`Storage`] of plan snapshots keyed by thread key. Suitable
//! for tests, single-process agents and short-lived sessions; durable
//! deployments plug their own [`Storage`] implementation into the executor.

use async_trait::async_trait;
use planwright_kernel::{AgentResult, ExecutionPlan, Storage};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// # Example
///
/// ```rust,ignore
/// use planwright_foundation::store::InMemoryPlanStore;
///
/// let store = Arc::new(InMemoryPlanStore::new());
/// let executor = PlanExecutor::new(generator, store.clone());
/// ```
#[derive(Clone, Default)]
pub struct InMemoryPlanStore {
    plans: Arc<RwLock<HashMap<String, ExecutionPlan>>>,
}

impl InMemoryPlanStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.plans.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.plans.read().await.is_empty()
    }
}

#[async_trait]
impl Storage<String, ExecutionPlan> for InMemoryPlanStore {
    async fn load(&self, key: &String) -> AgentResult<Option<ExecutionPlan>> {
        Ok(self.plans.read().await.get(key).cloned())
    }

    async fn save(&self, key: &String, value: &ExecutionPlan) -> AgentResult<()> {
        self.plans.write().await.insert(key.clone(), value.clone());
        Ok(())
    }

    async fn delete(&self, key: &String) -> AgentResult<bool> {
        Ok(self.plans.write().await.remove(key).is_some())
    }

    async fn list(&self) -> AgentResult<Vec<String>> {
        let mut keys: Vec<String> = self.plans.read().await.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}

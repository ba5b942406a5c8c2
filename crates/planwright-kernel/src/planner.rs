//! Plan-generating collaborator
//!
//! The planner core does not compose prompts or call models itself; it asks a
//! [`PlanGenerator`] for loosely typed step objects and normalizes them.
//!
//! # Provided implementations
//!
//! - `LlmPlanGenerator` (in `planwright-foundation`) delegates to an
//!   [`LLMProvider`](crate::llm::LLMProvider) and parses a JSON plan.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::ToolDescriptor;
use crate::error::AgentResult;
use crate::plan::PlanSignals;

/// Everything the generator needs for one plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanRequest {
    pub goal: String,
    pub strategy: String,
    pub system_prompt: String,
    pub user_prompt: String,
    pub available_tools: Vec<ToolDescriptor>,
}

/// Raw output of a plan-generating call.
///
/// `steps` stay loosely typed (`id?`, `description|content?`, `type?`, `tool?`,
/// `arguments|args|parameters|argsTemplate?`, `dependsOn?`, `parallel?`) and
/// are normalized by the foundation layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeneratedPlan {
    #[serde(default)]
    pub steps: Vec<Value>,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signals: Option<PlanSignals>,
}

impl GeneratedPlan {
    pub fn new(steps: Vec<Value>) -> Self {
        Self {
            steps,
            reasoning: String::new(),
            signals: None,
        }
    }

    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = reasoning.into();
        self
    }

    pub fn with_signals(mut self, signals: PlanSignals) -> Self {
        self.signals = Some(signals);
        self
    }
}

#[async_trait::async_trait]
pub trait PlanGenerator: Send + Sync {
    /// Produce steps for `request.goal`.
    async fn create_plan(&self, request: PlanRequest) -> AgentResult<GeneratedPlan>;
}

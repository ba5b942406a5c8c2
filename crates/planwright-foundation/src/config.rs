//! Planner configuration
//!
//! ```yaml
//! policy:
//!   window_size: 3
//!   min_failures: 2
//!   max_replans_per_plan: 3
//!   missing_input: ask-user
//! execution:
//!   max_concurrency: 4
//!   announce_plans: true
//! llm:
//!   model: gpt-4o
//! ```
//!
//! Every section and field is optional. Files are loaded through the kernel
//! config loader, so `${VAR}` substitution applies.

use planwright_kernel::config::{self as loader, Format};
use planwright_kernel::llm::LLMProvider;
use planwright_kernel::{AgentResult, ReplanPolicyConfig};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::llm_planner::{DEFAULT_EXTRACTION_MAX_CHARS, LlmPlanGenerator, LlmValueExtractor};
use crate::parallel::clamp_concurrency;
use crate::resolver::{DEFAULT_EXTRACTION_CONCURRENCY, DEFAULT_EXTRACTION_TIMEOUT_MS};

/// Knobs of the execution loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionSettings {
    /// Pending steps past the cursor considered for one batch.
    pub lookahead_window: usize,
    /// Requested batch / fan-out width; clamped to `1..=5`.
    pub max_concurrency: usize,
    pub extraction_concurrency: usize,
    pub extraction_timeout_ms: u64,
    /// Re-dispatches of a step after a transient error.
    pub max_step_retries: u32,
    /// Emit `execute_plan` right after a plan is created.
    pub announce_plans: bool,
    pub default_strategy: String,
    pub default_thread_key: String,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            lookahead_window: 5,
            max_concurrency: 4,
            extraction_concurrency: DEFAULT_EXTRACTION_CONCURRENCY,
            extraction_timeout_ms: DEFAULT_EXTRACTION_TIMEOUT_MS,
            max_step_retries: 1,
            announce_plans: false,
            default_strategy: "sequential".to_string(),
            default_thread_key: "default".to_string(),
        }
    }
}

impl ExecutionSettings {
    pub fn with_lookahead_window(mut self, window: usize) -> Self {
        self.lookahead_window = window;
        self
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max;
        self
    }

    pub fn with_max_step_retries(mut self, retries: u32) -> Self {
        self.max_step_retries = retries;
        self
    }

    pub fn with_announce_plans(mut self, announce: bool) -> Self {
        self.announce_plans = announce;
        self
    }

    pub fn with_extraction_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.extraction_timeout_ms = timeout_ms;
        self
    }

    pub fn effective_concurrency(&self) -> usize {
        clamp_concurrency(self.max_concurrency)
    }

    pub fn extraction_timeout(&self) -> Duration {
        Duration::from_millis(self.extraction_timeout_ms)
    }
}

/// Model settings for the LLM-backed collaborators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmSettings {
    /// Empty means the provider's default model.
    pub model: String,
    pub temperature: f32,
    pub extraction_max_chars: usize,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            model: String::new(),
            temperature: 0.2,
            extraction_max_chars: DEFAULT_EXTRACTION_MAX_CHARS,
        }
    }
}

impl LlmSettings {
    pub fn plan_generator(&self, provider: Arc<dyn LLMProvider>) -> LlmPlanGenerator {
        LlmPlanGenerator::new(provider)
            .with_model(self.model.clone())
            .with_temperature(self.temperature)
    }

    pub fn value_extractor(&self, provider: Arc<dyn LLMProvider>) -> LlmValueExtractor {
        LlmValueExtractor::new(provider)
            .with_model(self.model.clone())
            .with_max_chars(self.extraction_max_chars)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    pub policy: ReplanPolicyConfig,
    pub execution: ExecutionSettings,
    pub llm: LlmSettings,
}

impl PlannerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from a `.yaml`, `.yml`, `.toml` or `.json` file.
    pub fn from_file(path: &str) -> AgentResult<Self> {
        Ok(loader::load_config(path)?)
    }

    /// Load from a file, then apply `PREFIX_SECTION__FIELD` overrides.
    pub fn from_file_with_env(path: &str, env_prefix: &str) -> AgentResult<Self> {
        Ok(loader::load_with_env(path, env_prefix)?)
    }

    pub fn from_yaml_str(content: &str) -> AgentResult<Self> {
        Ok(loader::from_str(content, Format::Yaml)?)
    }

    pub fn with_policy(mut self, policy: ReplanPolicyConfig) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_execution(mut self, execution: ExecutionSettings) -> Self {
        self.execution = execution;
        self
    }

    pub fn with_llm(mut self, llm: LlmSettings) -> Self {
        self.llm = llm;
        self
    }
}

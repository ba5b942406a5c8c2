//! Replan policy configuration
//!
//! Immutable-per-run knobs consumed by the replan policy engine in
//! `planwright-foundation`. All fields carry serde defaults so partial YAML or
//! TOML documents deserialize cleanly.

use serde::{Deserialize, Serialize};

/// What to do when a step still has unresolved inputs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MissingInputBehavior {
    #[default]
    AskUser,
    Replan,
}

/// What to do when a requested tool does not exist.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ToolUnavailableBehavior {
    #[default]
    Replan,
    AskUser,
    Fail,
}

/// Execution budget. `None` means unlimited.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetLimits {
    /// Wall-clock limit measured from the start of the execution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_ms: Option<u64>,
    /// Maximum number of recorded tool-result entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tool_calls: Option<usize>,
}

impl BudgetLimits {
    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn with_max_ms(mut self, max_ms: u64) -> Self {
        self.max_ms = Some(max_ms);
        self
    }

    pub fn with_max_tool_calls(mut self, max_tool_calls: usize) -> Self {
        self.max_tool_calls = Some(max_tool_calls);
        self
    }

    pub fn has_limits(&self) -> bool {
        self.max_ms.is_some() || self.max_tool_calls.is_some()
    }
}

/// Replan policy configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplanPolicyConfig {
    /// Number of most recent history entries inspected for failures.
    pub window_size: usize,
    /// Errors within the window required to trigger a replan.
    pub min_failures: usize,
    /// Plan time-to-live. `None` disables the TTL rule.
    pub plan_ttl_ms: Option<u64>,
    pub max_replans_per_plan: u32,
    /// Opportunistic replans after a failure are allowed only while the
    /// iteration count is below this value.
    pub allow_replan_until_iteration: u32,
    pub missing_input: MissingInputBehavior,
    pub tool_unavailable: ToolUnavailableBehavior,
    pub budget: BudgetLimits,
}

impl Default for ReplanPolicyConfig {
    fn default() -> Self {
        Self {
            window_size: 3,
            min_failures: 2,
            plan_ttl_ms: Some(10 * 60 * 1000),
            max_replans_per_plan: 3,
            allow_replan_until_iteration: 5,
            missing_input: MissingInputBehavior::AskUser,
            tool_unavailable: ToolUnavailableBehavior::Replan,
            budget: BudgetLimits::unlimited(),
        }
    }
}

impl ReplanPolicyConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failure_window(mut self, window_size: usize, min_failures: usize) -> Self {
        self.window_size = window_size;
        self.min_failures = min_failures;
        self
    }

    pub fn with_plan_ttl_ms(mut self, ttl_ms: u64) -> Self {
        self.plan_ttl_ms = Some(ttl_ms);
        self
    }

    pub fn without_plan_ttl(mut self) -> Self {
        self.plan_ttl_ms = None;
        self
    }

    pub fn with_max_replans(mut self, max: u32) -> Self {
        self.max_replans_per_plan = max;
        self
    }

    pub fn with_allow_replan_until_iteration(mut self, iteration: u32) -> Self {
        self.allow_replan_until_iteration = iteration;
        self
    }

    pub fn with_missing_input(mut self, behavior: MissingInputBehavior) -> Self {
        self.missing_input = behavior;
        self
    }

    pub fn with_tool_unavailable(mut self, behavior: ToolUnavailableBehavior) -> Self {
        self.tool_unavailable = behavior;
        self
    }

    pub fn with_budget(mut self, budget: BudgetLimits) -> Self {
        self.budget = budget;
        self
    }
}

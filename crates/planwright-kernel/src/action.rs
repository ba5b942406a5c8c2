//! Actions emitted by the planner and results reported back to it
//!
//! The planner never executes tools itself. Each `think` call produces an
//! [`AgentThought`] whose [`Action`] describes what the external tool executor
//! should do next; the executor later reports an [`ActionResult`] through
//! `analyze_result`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// Produced surface
// ---------------------------------------------------------------------------

/// One tool invocation inside a concurrent batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    #[serde(alias = "toolName")]
    pub tool_name: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
}

impl ToolInvocation {
    pub fn new(tool_name: impl Into<String>, arguments: Map<String, Value>) -> Self {
        Self {
            tool_name: tool_name.into(),
            arguments,
        }
    }
}

/// What the external executor should do next.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    /// Stop and answer the user.
    FinalAnswer { text: String },

    ToolCall {
        name: String,
        arguments: Map<String, Value>,
    },

    /// Run every call concurrently (at most `concurrency` at once) and report
    /// back a single aggregated `tool_results`.
    ParallelTools {
        calls: Vec<ToolInvocation>,
        concurrency: usize,
        fail_fast: bool,
        aggregate_results: bool,
    },

    /// A new plan is ready; the next `think` dispatches its first step.
    ExecutePlan { plan_id: String },

    /// The plan cannot proceed without information from the user.
    NeedInput {
        prompt: String,
        missing: Vec<String>,
    },
}

impl Action {
    pub fn final_answer(text: impl Into<String>) -> Self {
        Self::FinalAnswer { text: text.into() }
    }

    pub fn tool_call(name: impl Into<String>, arguments: Map<String, Value>) -> Self {
        Self::ToolCall {
            name: name.into(),
            arguments,
        }
    }

    /// A fail-open, aggregating batch.
    pub fn parallel_tools(calls: Vec<ToolInvocation>, concurrency: usize) -> Self {
        Self::ParallelTools {
            calls,
            concurrency,
            fail_fast: false,
            aggregate_results: true,
        }
    }

    pub fn need_input(prompt: impl Into<String>, missing: Vec<String>) -> Self {
        Self::NeedInput {
            prompt: prompt.into(),
            missing,
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(self, Self::FinalAnswer { .. })
    }

    /// Short tag used in logs and thought metadata.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::FinalAnswer { .. } => "final_answer",
            Self::ToolCall { .. } => "tool_call",
            Self::ParallelTools { .. } => "parallel_tools",
            Self::ExecutePlan { .. } => "execute_plan",
            Self::NeedInput { .. } => "need_input",
        }
    }
}

/// The planner's answer to one `think` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentThought {
    pub reasoning: String,
    pub action: Action,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl AgentThought {
    pub fn new(reasoning: impl Into<String>, action: Action) -> Self {
        Self {
            reasoning: reasoning.into(),
            action,
            metadata: Map::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

// ---------------------------------------------------------------------------
// Consumed surface
// ---------------------------------------------------------------------------

/// Outcome of one invocation inside an aggregated batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutcome {
    #[serde(alias = "toolName")]
    pub tool_name: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolOutcome {
    pub fn ok(tool_name: impl Into<String>, output: Value) -> Self {
        Self {
            tool_name: tool_name.into(),
            success: true,
            output: Some(output),
            error: None,
        }
    }

    pub fn err(tool_name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            tool_name: tool_name.into(),
            success: false,
            output: None,
            error: Some(error.into()),
        }
    }
}

/// Discriminant of an [`ActionResult`], also stored in execution history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultKind {
    FinalAnswer,
    ToolResult,
    ToolResults,
    Error,
}

impl ResultKind {
    pub fn is_tool_result(&self) -> bool {
        matches!(self, Self::ToolResult | Self::ToolResults)
    }
}

/// What the tool executor reports back after running an [`Action`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionResult {
    FinalAnswer { text: String },
    ToolResult { tool_name: String, output: Value },
    ToolResults { results: Vec<ToolOutcome> },
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_name: Option<String>,
    },
}

impl ActionResult {
    pub fn tool_result(tool_name: impl Into<String>, output: Value) -> Self {
        Self::ToolResult {
            tool_name: tool_name.into(),
            output,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            tool_name: None,
        }
    }

    pub fn kind(&self) -> ResultKind {
        match self {
            Self::FinalAnswer { .. } => ResultKind::FinalAnswer,
            Self::ToolResult { .. } => ResultKind::ToolResult,
            Self::ToolResults { .. } => ResultKind::ToolResults,
            Self::Error { .. } => ResultKind::Error,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }
}

/// The planner's verdict on one [`ActionResult`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    pub is_complete: bool,
    pub is_successful: bool,
    pub feedback: String,
    pub should_continue: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_next_action: Option<Action>,
}

impl Analysis {
    /// The run is over and succeeded.
    pub fn completed(feedback: impl Into<String>) -> Self {
        Self {
            is_complete: true,
            is_successful: true,
            feedback: feedback.into(),
            should_continue: false,
            suggested_next_action: None,
        }
    }

    /// The run is over and failed.
    pub fn failed(feedback: impl Into<String>) -> Self {
        Self {
            is_complete: true,
            is_successful: false,
            feedback: feedback.into(),
            should_continue: false,
            suggested_next_action: None,
        }
    }

    /// Keep going; `is_successful` reflects the last unit of work.
    pub fn progress(is_successful: bool, feedback: impl Into<String>) -> Self {
        Self {
            is_complete: false,
            is_successful,
            feedback: feedback.into(),
            should_continue: true,
            suggested_next_action: None,
        }
    }

    pub fn with_suggestion(mut self, action: Action) -> Self {
        self.suggested_next_action = Some(action);
        self
    }
}

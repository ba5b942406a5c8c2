//! Execution context passed to every `think` / `analyze_result` call
//!
//! The context is owned by the caller (the agent loop driving the planner).
//! It carries the thread/session keys used to look up the owning plan, the
//! execution history consumed by the replan policy, the tools currently
//! callable, and the fixed roots that `CONTEXT.<path>` tokens resolve against.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::action::{ActionResult, ResultKind};

/// One recorded outcome in the execution history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub kind: ResultKind,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

impl HistoryEntry {
    pub fn new(kind: ResultKind) -> Self {
        Self {
            kind,
            at: Utc::now(),
            summary: None,
        }
    }

    pub fn at(mut self, at: DateTime<Utc>) -> Self {
        self.at = at;
        self
    }

    pub fn from_result(result: &ActionResult) -> Self {
        let summary = match result {
            ActionResult::Error { message, .. } => Some(message.clone()),
            ActionResult::ToolResult { tool_name, .. } => Some(tool_name.clone()),
            ActionResult::ToolResults { results } => Some(format!("{} results", results.len())),
            ActionResult::FinalAnswer { .. } => None,
        };
        Self {
            kind: result.kind(),
            at: Utc::now(),
            summary,
        }
    }

    pub fn is_error(&self) -> bool {
        self.kind == ResultKind::Error
    }
}

/// A callable capability advertised by the tool executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
}

impl ToolDescriptor {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema: None,
            output_schema: None,
        }
    }

    pub fn with_input_schema(mut self, schema: Value) -> Self {
        self.input_schema = Some(schema);
        self
    }
}

/// Identity of the agent driving the planner.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentIdentity {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

impl AgentIdentity {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            attributes: Map::new(),
        }
    }

    /// JSON view used as the `CONTEXT.agent` root.
    pub fn to_value(&self) -> Value {
        let mut map = self.attributes.clone();
        map.insert("id".into(), Value::String(self.id.clone()));
        map.insert("name".into(), Value::String(self.name.clone()));
        Value::Object(map)
    }
}

/// Per-call execution context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// The user's request / task input.
    pub goal: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
    /// Number of think cycles already spent on this execution.
    #[serde(default)]
    pub iteration: u32,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    #[serde(default)]
    pub available_tools: Vec<ToolDescriptor>,
    /// `CONTEXT.user` root.
    #[serde(default)]
    pub user_context: Map<String, Value>,
    #[serde(default)]
    pub agent: AgentIdentity,
}

impl ExecutionContext {
    pub fn new(goal: impl Into<String>) -> Self {
        Self {
            thread_id: None,
            correlation_id: None,
            goal: goal.into(),
            strategy: None,
            iteration: 0,
            started_at: Utc::now(),
            history: Vec::new(),
            available_tools: Vec::new(),
            user_context: Map::new(),
            agent: AgentIdentity::default(),
        }
    }

    pub fn with_thread_id(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_strategy(mut self, strategy: impl Into<String>) -> Self {
        self.strategy = Some(strategy.into());
        self
    }

    pub fn with_iteration(mut self, iteration: u32) -> Self {
        self.iteration = iteration;
        self
    }

    pub fn with_started_at(mut self, started_at: DateTime<Utc>) -> Self {
        self.started_at = started_at;
        self
    }

    pub fn with_tool(mut self, tool: ToolDescriptor) -> Self {
        self.available_tools.push(tool);
        self
    }

    pub fn with_user_value(mut self, key: impl Into<String>, value: Value) -> Self {
        self.user_context.insert(key.into(), value);
        self
    }

    pub fn with_agent(mut self, agent: AgentIdentity) -> Self {
        self.agent = agent;
        self
    }

    pub fn with_history(mut self, history: Vec<HistoryEntry>) -> Self {
        self.history = history;
        self
    }

    /// Key of the plan owned by this execution: thread id, then correlation
    /// id, then `default_key`.
    pub fn thread_key(&self, default_key: &str) -> String {
        self.thread_id
            .as_deref()
            .or(self.correlation_id.as_deref())
            .filter(|k| !k.is_empty())
            .unwrap_or(default_key)
            .to_string()
    }

    /// Append a result to the history.
    pub fn record(&mut self, result: &ActionResult) {
        self.history.push(HistoryEntry::from_result(result));
    }

    pub fn tool_call_count(&self) -> usize {
        self.history.iter().filter(|e| e.kind.is_tool_result()).count()
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.available_tools.iter().any(|t| t.name == name)
    }
}

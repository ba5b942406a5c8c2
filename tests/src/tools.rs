use planwright_kernel::{Action, ActionResult, ToolInvocation, ToolOutcome};
use serde_json::{Map, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;

type Stubbed = Result<Value, String>;

/// A mock tool executor standing in for the runtime that runs `tool_call`
/// and `parallel_tools` actions.
///
/// Each tool answers from a queue of stubbed outcomes first, then from its
/// static stub. Unknown tools fail with `Tool not found: <name>`.
#[derive(Clone, Default)]
pub struct MockToolExecutor {
    stubs: Arc<RwLock<HashMap<String, Stubbed>>>,
    queued: Arc<RwLock<HashMap<String, VecDeque<Stubbed>>>>,
    /// Track every invocation, batch members included
    pub call_history: Arc<RwLock<Vec<ToolInvocation>>>,
}

impl MockToolExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the outcome `tool` produces on every call.
    pub async fn stub(&self, tool: &str, outcome: Stubbed) {
        self.stubs.write().await.insert(tool.to_string(), outcome);
    }

    /// Outcomes consumed one per call before the static stub applies.
    pub async fn queue(&self, tool: &str, outcomes: Vec<Stubbed>) {
        self.queued
            .write()
            .await
            .entry(tool.to_string())
            .or_default()
            .extend(outcomes);
    }

    pub async fn history(&self) -> Vec<ToolInvocation> {
        self.call_history.read().await.clone()
    }

    /// Arguments of every call made to `tool`.
    pub async fn calls_to(&self, tool: &str) -> Vec<Map<String, Value>> {
        self.call_history
            .read()
            .await
            .iter()
            .filter(|c| c.tool_name == tool)
            .map(|c| c.arguments.clone())
            .collect()
    }

    pub async fn call_count(&self, tool: &str) -> usize {
        self.call_history
            .read()
            .await
            .iter()
            .filter(|c| c.tool_name == tool)
            .count()
    }

    async fn invoke(&self, tool: &str, arguments: &Map<String, Value>) -> Stubbed {
        self.call_history
            .write()
            .await
            .push(ToolInvocation::new(tool, arguments.clone()));

        if let Some(next) = self
            .queued
            .write()
            .await
            .get_mut(tool)
            .and_then(VecDeque::pop_front)
        {
            return next;
        }
        self.stubs
            .read()
            .await
            .get(tool)
            .cloned()
            .unwrap_or_else(|| Err(format!("Tool not found: {tool}")))
    }

    /// Run a tool action. Other actions produce no result.
    pub async fn execute(&self, action: &Action) -> Option<ActionResult> {
        match action {
            Action::ToolCall { name, arguments } => Some(match self.invoke(name, arguments).await {
                Ok(output) => ActionResult::tool_result(name.clone(), output),
                Err(message) => ActionResult::Error {
                    message,
                    tool_name: Some(name.clone()),
                },
            }),
            Action::ParallelTools { calls, .. } => {
                let mut results = Vec::with_capacity(calls.len());
                for call in calls {
                    results.push(match self.invoke(&call.tool_name, &call.arguments).await {
                        Ok(output) => ToolOutcome::ok(call.tool_name.clone(), output),
                        Err(error) => ToolOutcome::err(call.tool_name.clone(), error),
                    });
                }
                Some(ActionResult::ToolResults { results })
            }
            _ => None,
        }
    }
}

#[macro_export]
macro_rules! assert_tool_called {
    ($tools:expr, $tool:expr, $expected_count:expr) => {
        let count = $tools.call_count($tool).await;
        assert_eq!(
            count, $expected_count,
            "Expected tool '{}' to be called {} times, but was called {} times",
            $tool, $expected_count, count
        );
    };
}

//! A minimal agent loop around [`PlanExecutor`].

use planwright_foundation::PlanExecutor;
use planwright_kernel::{Action, AgentThought, Analysis, ExecutionContext, ToolDescriptor};

use crate::tools::MockToolExecutor;

/// Context for `goal` on `thread_id`, advertising `tools`.
pub fn thread_context(thread_id: &str, goal: &str, tools: &[&str]) -> ExecutionContext {
    tools.iter().fold(
        ExecutionContext::new(goal).with_thread_id(thread_id),
        |ctx, name| ctx.with_tool(ToolDescriptor::new(*name, format!("{name} tool"))),
    )
}

/// Everything observed while driving one thread.
#[derive(Debug, Clone)]
pub struct AgentRun {
    pub thoughts: Vec<AgentThought>,
    pub analyses: Vec<Analysis>,
    /// Context after the run, history included.
    pub context: ExecutionContext,
}

impl AgentRun {
    pub fn last_action(&self) -> Option<&Action> {
        self.thoughts.last().map(|t| &t.action)
    }

    pub fn final_answer(&self) -> Option<&str> {
        match self.last_action() {
            Some(Action::FinalAnswer { text }) => Some(text),
            _ => None,
        }
    }

    /// Missing identifiers when the run stopped on `need_input`.
    pub fn pending_input(&self) -> Option<&[String]> {
        match self.last_action() {
            Some(Action::NeedInput { missing, .. }) => Some(missing),
            _ => None,
        }
    }

    /// Actions of the given kind (`"tool_call"`, `"parallel_tools"`, ...).
    pub fn actions_of(&self, kind: &str) -> Vec<&Action> {
        self.thoughts
            .iter()
            .map(|t| &t.action)
            .filter(|a| a.kind() == kind)
            .collect()
    }
}

/// Alternate `think` and `analyze_result` until a final answer, a request
/// for input, or `max_iterations` think cycles.
pub async fn drive(
    executor: &PlanExecutor,
    tools: &MockToolExecutor,
    mut ctx: ExecutionContext,
    max_iterations: u32,
) -> AgentRun {
    let mut thoughts = Vec::new();
    let mut analyses = Vec::new();

    for _ in 0..max_iterations {
        let thought = executor.think(&ctx).await;
        let result = tools.execute(&thought.action).await;
        let stop = matches!(
            thought.action,
            Action::FinalAnswer { .. } | Action::NeedInput { .. }
        );
        thoughts.push(thought);
        if stop {
            break;
        }

        if let Some(result) = result {
            ctx.record(&result);
            analyses.push(executor.analyze_result(&result, &ctx).await);
        }
        ctx.iteration += 1;
    }

    AgentRun {
        thoughts,
        analyses,
        context: ctx,
    }
}

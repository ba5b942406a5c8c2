//! Parallel execution detection and fan-out expansion
//!
//! Two independent mechanisms decide when more than one tool invocation can
//! go out at once:
//!
//! - **batch detection** picks ready, mutually independent tool steps from a
//!   bounded look-ahead window past the cursor;
//! - **fan-out** expands one step whose arguments reference an array result
//!   (`{{X.result}}`) into one invocation per element.
//!
//! Both only describe work; the external executor runs the invocations with
//! at most [`MAX_PARALLEL_CONCURRENCY`] in flight and reports every outcome,
//! failures included.

use planwright_kernel::{
    ExecutionPlan, PlanStep, StepStatus, ToolInvocation, resolve_step_identifier,
};
use serde_json::{Map, Value};

use crate::search::LayeredSearch;
use crate::template::{self, TemplateRef, substitute_token};

/// Upper bound on concurrent invocations in one batch or fan-out.
pub const MAX_PARALLEL_CONCURRENCY: usize = 5;

pub fn clamp_concurrency(requested: usize) -> usize {
    requested.clamp(1, MAX_PARALLEL_CONCURRENCY)
}

/// Width for a batch of `len` invocations.
pub fn batch_concurrency(len: usize, max_concurrency: usize) -> usize {
    len.min(clamp_concurrency(max_concurrency)).max(1)
}

// ============================================================================
// Readiness
// ============================================================================

/// Steps referenced from `step`'s arguments through template references.
pub fn referenced_steps(step: &PlanStep, steps: &[PlanStep]) -> Vec<usize> {
    let mut indices: Vec<usize> = template::references_in_arguments(&step.arguments)
        .iter()
        .filter_map(|r| resolve_step_identifier(steps, &r.step))
        .collect();
    indices.sort_unstable();
    indices.dedup();
    indices
}

/// A pending step whose explicit dependencies completed and whose referenced
/// steps all reached a terminal state.
pub fn is_ready(plan: &ExecutionPlan, index: usize) -> bool {
    let Some(step) = plan.steps.get(index) else {
        return false;
    };
    if step.status != StepStatus::Pending || !step.dependencies_met(&plan.completed_ids()) {
        return false;
    }
    referenced_steps(step, &plan.steps)
        .into_iter()
        .all(|i| i != index && plan.steps[i].status.is_terminal())
}

/// The first explicit dependency that ended `failed` or `skipped`.
pub fn blocked_by(plan: &ExecutionPlan, index: usize) -> Option<String> {
    let step = plan.steps.get(index)?;
    step.dependencies
        .iter()
        .find(|dep| {
            plan.get_step(dep)
                .is_some_and(|d| matches!(d.status, StepStatus::Failed | StepStatus::Skipped))
        })
        .cloned()
}

/// First ready step at or after the cursor.
pub fn next_ready(plan: &ExecutionPlan) -> Option<usize> {
    (plan.current_step_index..plan.steps.len()).find(|&i| is_ready(plan, i))
}

// ============================================================================
// Batch detection
// ============================================================================

fn mentions_result_of(step: &PlanStep, other: &PlanStep, other_position: usize) -> bool {
    let Ok(serialized) = serde_json::to_string(&step.arguments) else {
        return false;
    };
    let compact: String = serialized.chars().filter(|c| !c.is_whitespace()).collect();
    compact.contains(&format!("{{{{{}.result", other.id))
        || compact.contains(&format!("{{{{step-{}.result", other_position))
        || compact.contains(&format!("{{{{step_{}.result", other_position))
}

/// Ready tool steps in `[cursor, cursor + window)` that can run together.
///
/// Steps that would fan out are left for single dispatch. A candidate that
/// mentions another candidate's result is dropped.
pub fn batch_candidates(plan: &ExecutionPlan, window: usize) -> Vec<usize> {
    let start = plan.current_step_index;
    let end = start.saturating_add(window).min(plan.steps.len());
    let ready: Vec<usize> = (start..end)
        .filter(|&i| is_ready(plan, i))
        .filter(|&i| plan.steps[i].has_tool())
        .filter(|&i| fan_out_source(plan, i).is_none())
        .collect();

    ready
        .iter()
        .copied()
        .filter(|&i| {
            ready.iter().all(|&j| {
                j == i || !mentions_result_of(&plan.steps[i], &plan.steps[j], j + 1)
            })
        })
        .collect()
}

// ============================================================================
// Fan-out
// ============================================================================

/// The array a step fans out over.
#[derive(Debug, Clone, PartialEq)]
pub struct FanOutSource {
    /// Template text replaced by each element.
    pub template: String,
    pub source_index: usize,
    pub items: Vec<Value>,
}

fn distinct_references(step: &PlanStep) -> Vec<TemplateRef> {
    let mut refs: Vec<TemplateRef> = Vec::new();
    for reference in template::references_in_arguments(&step.arguments) {
        if !refs.iter().any(|r| r.raw == reference.raw) {
            refs.push(reference);
        }
    }
    refs
}

/// Exactly one whole-result reference to a completed step holding an array
/// of more than one element. Steps flagged `explicit_parallel` may also fan
/// out over their single sub-path reference.
pub fn fan_out_source(plan: &ExecutionPlan, index: usize) -> Option<FanOutSource> {
    let step = plan.steps.get(index)?;
    if !step.has_tool() {
        return None;
    }
    let refs = distinct_references(step);
    let whole: Vec<&TemplateRef> = refs.iter().filter(|r| r.is_whole_result()).collect();
    let chosen = match whole.as_slice() {
        [only] => *only,
        [] if step.explicit_parallel && refs.len() == 1 => &refs[0],
        _ => return None,
    };

    let source_index = resolve_step_identifier(&plan.steps, &chosen.step)?;
    let source = &plan.steps[source_index];
    if source_index == index || !source.status.is_success() {
        return None;
    }
    let hit = LayeredSearch::new().find(source.result.as_ref()?, &chosen.path)?;
    match hit.value {
        Value::Array(items) if items.len() > 1 => Some(FanOutSource {
            template: chosen.raw.clone(),
            source_index,
            items,
        }),
        _ => None,
    }
}

/// One invocation of `tool` per element of `source`.
pub fn expand_fan_out(
    tool: &str,
    arguments: &Map<String, Value>,
    source: &FanOutSource,
) -> Vec<ToolInvocation> {
    let template = Value::Object(arguments.clone());
    source
        .items
        .iter()
        .map(|item| {
            let arguments = match substitute_token(&template, &source.template, item) {
                Value::Object(map) => map,
                _ => Map::new(),
            };
            ToolInvocation::new(tool, arguments)
        })
        .collect()
}

//! Normalization of generated step objects into [`PlanStep`]s.

use planwright_kernel::{PlanStep, StepKind, positional_alias};
use serde_json::{Map, Value};
use tracing::debug;

fn first_field<'a>(raw: &'a Map<String, Value>, names: &[&str]) -> Option<&'a Value> {
    names
        .iter()
        .find_map(|name| raw.get(*name).filter(|v| !v.is_null()))
}

fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn arguments_of(raw: &Map<String, Value>) -> Map<String, Value> {
    match first_field(raw, &["arguments", "args", "parameters", "argsTemplate"]) {
        Some(Value::Object(map)) => map.clone(),
        Some(Value::String(s)) => serde_json::from_str::<Map<String, Value>>(s).unwrap_or_default(),
        _ => Map::new(),
    }
}

fn dependencies_of(raw: &Map<String, Value>) -> Vec<String> {
    let dependency_text = |value: &Value| match value {
        Value::Number(n) => Some(format!("step-{n}")),
        other => as_text(other),
    };
    match first_field(raw, &["dependsOn", "depends_on", "dependencies"]) {
        Some(Value::Array(items)) => items.iter().filter_map(dependency_text).collect(),
        Some(single) => dependency_text(single).into_iter().collect(),
        None => Vec::new(),
    }
}

/// Normalize one loosely typed step; `position` is 1-based.
///
/// Plain strings become conversational steps. Anything else that is not an
/// object is dropped.
pub fn normalize_step(raw: &Value, position: usize) -> Option<PlanStep> {
    let default_id = format!("step-{position}");
    let map = match raw {
        Value::Object(map) => map,
        Value::String(text) if !text.trim().is_empty() => {
            return Some(PlanStep::new(default_id, text.trim()));
        }
        _ => return None,
    };

    let id = first_field(map, &["id", "stepId", "step_id"])
        .and_then(as_text)
        .unwrap_or(default_id);
    let description = first_field(map, &["description", "content", "title", "name"])
        .and_then(as_text)
        .unwrap_or_else(|| format!("Step {position}"));

    let mut step = PlanStep::new(id, description).with_arguments(arguments_of(map));
    if let Some(kind) = first_field(map, &["type", "kind"]).and_then(Value::as_str) {
        step = step.with_kind(StepKind::from_tag(kind));
    }
    if let Some(tool) = first_field(map, &["tool", "toolName", "tool_name"]).and_then(as_text) {
        step = step.with_tool(tool);
    }
    for dependency in dependencies_of(map) {
        step = step.depends_on(dependency);
    }
    if first_field(map, &["parallel", "explicitParallel", "explicit_parallel"])
        .and_then(Value::as_bool)
        .unwrap_or(false)
    {
        step = step.parallel();
    }
    Some(step)
}

/// Normalize a generated step list.
///
/// Dependencies written as positional aliases are rewritten to the literal
/// id they designate, counting positions in `raw` so dropped entries do not
/// shift them. Unknown ones are kept for validation to report.
pub fn normalize_steps(raw: &[Value]) -> Vec<PlanStep> {
    let normalized: Vec<Option<PlanStep>> = raw
        .iter()
        .enumerate()
        .map(|(i, value)| normalize_step(value, i + 1))
        .collect();
    let raw_ids: Vec<Option<String>> = normalized
        .iter()
        .map(|step| step.as_ref().map(|s| s.id.clone()))
        .collect();
    let mut steps: Vec<PlanStep> = normalized.into_iter().flatten().collect();
    if steps.len() < raw.len() {
        debug!(dropped = raw.len() - steps.len(), "Dropped malformed plan steps");
    }

    let canonical = |dep: &String| -> String {
        if steps.iter().any(|s| &s.id == dep) {
            return dep.clone();
        }
        positional_alias(dep)
            .and_then(|n| n.checked_sub(1))
            .and_then(|i| raw_ids.get(i).cloned().flatten())
            .unwrap_or_else(|| dep.clone())
    };
    let rewritten: Vec<Vec<String>> = steps
        .iter()
        .map(|step| step.dependencies.iter().map(&canonical).collect())
        .collect();
    for (step, dependencies) in steps.iter_mut().zip(rewritten) {
        step.dependencies.clear();
        for dependency in dependencies {
            if !step.dependencies.contains(&dependency) {
                step.dependencies.push(dependency);
            }
        }
    }
    steps
}

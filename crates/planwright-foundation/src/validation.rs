//! Plan graph validation
//!
//! One pass over a freshly generated step list that reports every problem as
//! a typed [`ValidationIssue`]:
//!
//! - duplicate step ids;
//! - `dependencies` entries and `{{<id>.result…}}` references naming steps
//!   that do not exist;
//! - the first dependency cycle found by depth-first search over explicit and
//!   reference-implied edges;
//! - argument strings that look like unfilled author placeholders (warning
//!   only).
//!
//! A plan with errors is never executed; [`diagnostic_plan`] replaces it with
//! a single failed step describing the problems.

use planwright_kernel::{ExecutionPlan, PlanStep, StepKind, resolve_step_identifier};
use regex::Regex;
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::sync::LazyLock;

use crate::template::{self, detect_sentinel};

static PLACEHOLDER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(?:<[^<>]+>|your[_\- ]\w+.*|\[insert[^\]]*\]|todo\b.*|x{3,})\s*$")
        .expect("placeholder pattern is valid")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationIssue {
    DuplicateStepId { step_id: String },
    /// A template reference names a step that does not exist.
    MissingReference { step_id: String, reference: String },
    MissingDependency { step_id: String, dependency: String },
    /// Step ids along the cycle, first id repeated at the end.
    Cycle { path: Vec<String> },
    PlaceholderArgument {
        step_id: String,
        argument: String,
        value: String,
    },
}

impl ValidationIssue {
    pub fn is_error(&self) -> bool {
        !matches!(self, Self::PlaceholderArgument { .. })
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateStepId { step_id } => write!(f, "duplicate step id '{step_id}'"),
            Self::MissingReference { step_id, reference } => {
                write!(f, "step '{step_id}' references unknown step in {reference}")
            }
            Self::MissingDependency {
                step_id,
                dependency,
            } => write!(f, "step '{step_id}' depends on unknown step '{dependency}'"),
            Self::Cycle { path } => write!(f, "dependency cycle: {}", path.join(" -> ")),
            Self::PlaceholderArgument {
                step_id,
                argument,
                value,
            } => write!(
                f,
                "step '{step_id}' argument '{argument}' looks like a placeholder: {value}"
            ),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub issues: Vec<ValidationIssue>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        !self.issues.iter().any(ValidationIssue::is_error)
    }

    pub fn errors(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.issues.iter().filter(|i| i.is_error())
    }

    pub fn warnings(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.issues.iter().filter(|i| !i.is_error())
    }

    /// Human-readable list of every error, one per line.
    pub fn describe(&self) -> String {
        let lines: Vec<String> = self.errors().map(|i| format!("- {i}")).collect();
        format!("The generated plan is invalid:\n{}", lines.join("\n"))
    }
}

pub fn validate_plan(steps: &[PlanStep]) -> ValidationReport {
    let mut issues = Vec::new();

    let mut seen = HashSet::new();
    for step in steps {
        if !seen.insert(step.id.as_str()) {
            issues.push(ValidationIssue::DuplicateStepId {
                step_id: step.id.clone(),
            });
        }
    }

    let mut edges: Vec<Vec<usize>> = vec![Vec::new(); steps.len()];
    for (index, step) in steps.iter().enumerate() {
        for dependency in &step.dependencies {
            match resolve_step_identifier(steps, dependency) {
                Some(target) => edges[index].push(target),
                None => issues.push(ValidationIssue::MissingDependency {
                    step_id: step.id.clone(),
                    dependency: dependency.clone(),
                }),
            }
        }
        for reference in template::references_in_arguments(&step.arguments) {
            match resolve_step_identifier(steps, &reference.step) {
                Some(target) => edges[index].push(target),
                None => issues.push(ValidationIssue::MissingReference {
                    step_id: step.id.clone(),
                    reference: reference.raw,
                }),
            }
        }
        edges[index].dedup();
        lint_placeholders(step, &mut issues);
    }

    if let Some(path) = find_cycle(&edges) {
        issues.push(ValidationIssue::Cycle {
            path: path.into_iter().map(|i| steps[i].id.clone()).collect(),
        });
    }

    ValidationReport { issues }
}

fn lint_placeholders(step: &PlanStep, issues: &mut Vec<ValidationIssue>) {
    fn walk(step: &PlanStep, argument: &str, value: &Value, issues: &mut Vec<ValidationIssue>) {
        match value {
            Value::String(s) if detect_sentinel(s).is_none() && PLACEHOLDER_RE.is_match(s) => {
                issues.push(ValidationIssue::PlaceholderArgument {
                    step_id: step.id.clone(),
                    argument: argument.to_string(),
                    value: s.clone(),
                });
            }
            Value::Array(items) => items.iter().for_each(|v| walk(step, argument, v, issues)),
            Value::Object(map) => map.iter().for_each(|(k, v)| walk(step, k, v, issues)),
            _ => {}
        }
    }
    for (name, value) in &step.arguments {
        walk(step, name, value, issues);
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    OnStack,
    Done,
}

/// First back-edge found by DFS, as the node path around the cycle.
fn find_cycle(edges: &[Vec<usize>]) -> Option<Vec<usize>> {
    fn dfs(
        node: usize,
        edges: &[Vec<usize>],
        marks: &mut [Mark],
        stack: &mut Vec<usize>,
    ) -> Option<Vec<usize>> {
        marks[node] = Mark::OnStack;
        stack.push(node);
        for &next in &edges[node] {
            match marks[next] {
                Mark::OnStack => {
                    let start = stack.iter().position(|&n| n == next).unwrap_or(0);
                    let mut path = stack[start..].to_vec();
                    path.push(next);
                    return Some(path);
                }
                Mark::Unvisited => {
                    if let Some(cycle) = dfs(next, edges, marks, stack) {
                        return Some(cycle);
                    }
                }
                Mark::Done => {}
            }
        }
        stack.pop();
        marks[node] = Mark::Done;
        None
    }

    let mut marks = vec![Mark::Unvisited; edges.len()];
    let mut stack = Vec::new();
    (0..edges.len()).find_map(|start| {
        if marks[start] == Mark::Unvisited {
            dfs(start, edges, &mut marks, &mut stack)
        } else {
            None
        }
    })
}

/// A terminal plan that explains why the generated one was rejected.
pub fn diagnostic_plan(
    goal: impl Into<String>,
    strategy: impl Into<String>,
    report: &ValidationReport,
) -> ExecutionPlan {
    let description = report.describe();
    let mut step =
        PlanStep::new("plan-validation", description.clone()).with_kind(StepKind::Verification);
    // Pending -> Failed is always a legal transition.
    let _ = step.fail(description.clone());

    let mut plan = ExecutionPlan::new(goal, strategy).add_step(step);
    plan.mark_failed(description);
    plan
}

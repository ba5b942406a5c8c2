//! Argument resolution
//!
//! Substitutes template references, `CONTEXT.` lookups and user-provided
//! inputs into a step's arguments right before dispatch. Resolution never
//! fails: anything that cannot be resolved is left in place and reported in
//! [`Resolution::missing`].
//!
//! A pass runs in three phases:
//!
//! 1. collect the distinct template references and evaluate each against the
//!    referenced step's result with [`LayeredSearch`];
//! 2. hand the references no structural strategy could satisfy to the
//!    [`ValueExtractor`], concurrently and bounded by `concurrency`, each call
//!    under `timeout`;
//! 3. walk the argument tree and substitute.

use futures::stream::{self, StreamExt};
use planwright_kernel::{
    AgentIdentity, ExecutionContext, ExecutionPlan, ExtractionFailure, ExtractionRequest,
    PlanStep, StepStatus, ValueExtractor, positional_alias, resolve_step_identifier,
};
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::search::{LayeredSearch, is_empty_result};
use crate::template::{self, Sentinel, TemplateRef};

pub const DEFAULT_EXTRACTION_CONCURRENCY: usize = 4;
pub const DEFAULT_EXTRACTION_TIMEOUT_MS: u64 = 15_000;

// ============================================================================
// Scope
// ============================================================================

/// Everything a resolution pass may read.
#[derive(Debug, Clone)]
pub struct ResolutionScope<'a> {
    steps: &'a [PlanStep],
    provided: &'a Map<String, Value>,
    user: Value,
    plan: Value,
    agent: Value,
}

impl<'a> ResolutionScope<'a> {
    pub fn new(steps: &'a [PlanStep], provided: &'a Map<String, Value>) -> Self {
        Self {
            steps,
            provided,
            user: Value::Null,
            plan: Value::Null,
            agent: Value::Null,
        }
    }

    /// Scope for dispatching a step of `plan` within `ctx`.
    pub fn for_plan(plan: &'a ExecutionPlan, ctx: &ExecutionContext) -> Self {
        let mut meta = plan.metadata.extra.clone();
        meta.insert("plan_id".into(), json!(plan.id));
        meta.insert("goal".into(), json!(plan.goal));
        meta.insert("strategy".into(), json!(plan.strategy));
        meta.insert("replans_count".into(), json!(plan.metadata.replans_count));
        if let Some(signals) = &plan.metadata.signals {
            if let Ok(value) = serde_json::to_value(signals) {
                meta.insert("signals".into(), value);
            }
        }

        Self::new(&plan.steps, &plan.metadata.provided_inputs)
            .with_user_context(&ctx.user_context)
            .with_plan_metadata(Value::Object(meta))
            .with_agent(&ctx.agent)
    }

    pub fn with_user_context(mut self, user: &Map<String, Value>) -> Self {
        self.user = Value::Object(user.clone());
        self
    }

    pub fn with_plan_metadata(mut self, plan: Value) -> Self {
        self.plan = plan;
        self
    }

    pub fn with_agent(mut self, agent: &AgentIdentity) -> Self {
        self.agent = agent.to_value();
        self
    }

    fn context_value(&self, root: &str, path: &[String]) -> Option<Value> {
        let base = match root {
            "user" => &self.user,
            "plan" | "metadata" => &self.plan,
            "agent" => &self.agent,
            _ => return None,
        };
        path.iter()
            .try_fold(base, |node, key| match node {
                Value::Object(map) => map.get(key),
                Value::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
                _ => None,
            })
            .filter(|v| !v.is_null())
            .cloned()
    }
}

// ============================================================================
// Result
// ============================================================================

/// Resolved arguments plus the identifiers that are still missing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resolution {
    pub arguments: Map<String, Value>,
    /// Unresolved template strings (`{{s1.result[0].id}}`), argument names
    /// holding sentinels, `NEEDS-INPUT` names and `CONTEXT.` tokens, in order
    /// of first appearance.
    pub missing: Vec<String>,
}

impl Resolution {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }
}

fn note_missing(missing: &mut Vec<String>, identifier: impl Into<String>) {
    let identifier = identifier.into();
    if !missing.contains(&identifier) {
        missing.push(identifier);
    }
}

#[derive(Debug, Clone)]
enum Outcome {
    Resolved(Value),
    Missing,
    /// Left untouched without being reported.
    Skipped,
}

// ============================================================================
// Resolver
// ============================================================================

pub struct ArgumentResolver {
    search: LayeredSearch,
    extractor: Option<Arc<dyn ValueExtractor>>,
    concurrency: usize,
    timeout: Duration,
}

impl Default for ArgumentResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl ArgumentResolver {
    pub fn new() -> Self {
        Self {
            search: LayeredSearch::new(),
            extractor: None,
            concurrency: DEFAULT_EXTRACTION_CONCURRENCY,
            timeout: Duration::from_millis(DEFAULT_EXTRACTION_TIMEOUT_MS),
        }
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn ValueExtractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn resolve(
        &self,
        arguments: &Map<String, Value>,
        scope: &ResolutionScope<'_>,
    ) -> Resolution {
        self.resolve_inner(arguments, scope, None).await
    }

    /// Like [`resolve`](Self::resolve) but leaves every occurrence of `keep`
    /// in place, for fan-out expansion afterwards.
    pub async fn resolve_preserving(
        &self,
        arguments: &Map<String, Value>,
        scope: &ResolutionScope<'_>,
        keep: &str,
    ) -> Resolution {
        self.resolve_inner(arguments, scope, Some(keep)).await
    }

    async fn resolve_inner(
        &self,
        arguments: &Map<String, Value>,
        scope: &ResolutionScope<'_>,
        keep: Option<&str>,
    ) -> Resolution {
        let mut outcomes: HashMap<String, Outcome> = HashMap::new();
        let mut pending: Vec<ExtractionRequest> = Vec::new();

        for reference in template::references_in_arguments(arguments) {
            if outcomes.contains_key(&reference.raw)
                || pending.iter().any(|r| r.template == reference.raw)
            {
                continue;
            }
            if keep == Some(reference.raw.as_str()) {
                outcomes.insert(reference.raw, Outcome::Skipped);
                continue;
            }
            match self.evaluate_reference(&reference, scope) {
                Ok(outcome) => {
                    outcomes.insert(reference.raw, outcome);
                }
                Err(request) => pending.push(request),
            }
        }

        if !pending.is_empty() {
            outcomes.extend(self.extract_all(pending).await);
        }

        let mut resolution = Resolution::default();
        for (name, value) in arguments {
            let resolved = substitute(value, name, scope, &outcomes, &mut resolution.missing);
            resolution.arguments.insert(name.clone(), resolved);
        }
        if !resolution.missing.is_empty() {
            debug!(missing = ?resolution.missing, "Arguments left unresolved");
        }
        resolution
    }

    /// `Err` carries a request for the extractor.
    fn evaluate_reference(
        &self,
        reference: &TemplateRef,
        scope: &ResolutionScope<'_>,
    ) -> Result<Outcome, ExtractionRequest> {
        if let Some(value) = scope.provided.get(&reference.raw) {
            return Ok(Outcome::Resolved(value.clone()));
        }

        let Some(index) = resolve_step_identifier(scope.steps, &reference.step) else {
            if positional_alias(&reference.step).is_some() {
                debug!(template = %reference.raw, "Positional alias out of range, skipping");
                return Ok(Outcome::Skipped);
            }
            return Ok(Outcome::Missing);
        };

        let step = &scope.steps[index];
        if step.status != StepStatus::Completed {
            return Ok(Outcome::Missing);
        }
        let Some(result) = step.result.as_ref().filter(|r| !is_empty_result(r)) else {
            return Ok(Outcome::Missing);
        };

        if let Some(hit) = self.search.find(result, &reference.path) {
            debug!(template = %reference.raw, strategy = ?hit.strategy, "Resolved reference");
            return Ok(Outcome::Resolved(hit.value));
        }

        if self.extractor.is_none() {
            return Ok(Outcome::Missing);
        }
        Err(ExtractionRequest {
            template: reference.raw.clone(),
            path: reference.path_text(),
            structure: result.clone(),
        })
    }

    async fn extract_all(&self, requests: Vec<ExtractionRequest>) -> Vec<(String, Outcome)> {
        let Some(extractor) = self.extractor.clone() else {
            return requests
                .into_iter()
                .map(|r| (r.template, Outcome::Missing))
                .collect();
        };
        let timeout = self.timeout;

        stream::iter(requests)
            .map(|request| {
                let extractor = extractor.clone();
                async move {
                    let template = request.template.clone();
                    let outcome = match tokio::time::timeout(timeout, extractor.extract(request))
                        .await
                    {
                        Ok(Ok(value)) if !is_empty_result(&value) => Outcome::Resolved(value),
                        Ok(Ok(_)) | Ok(Err(ExtractionFailure::NotFound)) => Outcome::Missing,
                        Ok(Err(e)) => {
                            warn!(template = %template, error = %e, "Value extraction failed");
                            Outcome::Missing
                        }
                        Err(_) => {
                            warn!(
                                template = %template,
                                timeout_ms = timeout.as_millis() as u64,
                                "Value extraction timed out"
                            );
                            Outcome::Missing
                        }
                    };
                    (template, outcome)
                }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await
    }
}

// ============================================================================
// Substitution
// ============================================================================

fn substitute(
    value: &Value,
    param: &str,
    scope: &ResolutionScope<'_>,
    outcomes: &HashMap<String, Outcome>,
    missing: &mut Vec<String>,
) -> Value {
    match value {
        Value::String(text) => substitute_str(text, param, scope, outcomes, missing),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| substitute(item, param, scope, outcomes, missing))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, item)| (key.clone(), substitute(item, key, scope, outcomes, missing)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn substitute_str(
    text: &str,
    param: &str,
    scope: &ResolutionScope<'_>,
    outcomes: &HashMap<String, Outcome>,
    missing: &mut Vec<String>,
) -> Value {
    let mut replacements = Vec::new();

    match template::detect_sentinel(text) {
        Some(Sentinel::Unknown) => {
            if let Some(value) = scope.provided.get(param) {
                return value.clone();
            }
            note_missing(missing, param);
            return Value::String(text.to_string());
        }
        Some(Sentinel::NeedsInput { name, span }) => {
            let key = name.unwrap_or_else(|| param.to_string());
            match scope.provided.get(&key) {
                Some(value) => replacements.push((span, value.clone())),
                None => {
                    note_missing(missing, key);
                    return Value::String(text.to_string());
                }
            }
        }
        None => {}
    }

    for context_ref in template::find_context_refs(text) {
        let value = scope
            .context_value(&context_ref.root, &context_ref.path)
            .or_else(|| scope.provided.get(&context_ref.raw).cloned());
        match value {
            Some(value) => replacements.push((context_ref.span, value)),
            None => note_missing(missing, context_ref.raw),
        }
    }

    for reference in template::find_references(text) {
        match outcomes.get(&reference.raw) {
            Some(Outcome::Resolved(value)) => replacements.push((reference.span, value.clone())),
            Some(Outcome::Skipped) => {}
            Some(Outcome::Missing) | None => note_missing(missing, reference.raw),
        }
    }

    template::splice(text, replacements)
}

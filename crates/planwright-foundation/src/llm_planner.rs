//! LLM-backed collaborators
//!
//! - [`LlmPlanGenerator`] implements [`PlanGenerator`]: it sends the composed
//!   prompts to an [`LLMProvider`] and parses the JSON plan out of the reply.
//! - [`LlmValueExtractor`] implements [`ValueExtractor`]: one bounded prompt
//!   per unresolved reference, answering with the bare value or `NOT_FOUND`.

use std::sync::Arc;

use async_trait::async_trait;
use planwright_kernel::llm::{ChatCompletionRequest, ChatMessage, LLMProvider};
use planwright_kernel::{
    AgentError, AgentResult, ExtractionFailure, ExtractionRequest, GeneratedPlan, PlanGenerator,
    PlanRequest, PlanSignals, ValueExtractor,
};
use serde_json::Value;
use tracing::debug;

/// Longest serialized structure sent in an extraction prompt.
pub const DEFAULT_EXTRACTION_MAX_CHARS: usize = 8_000;

const EXTRACTION_SYSTEM_PROMPT: &str = r#"You extract values from JSON data.
Given a template reference, the path it points at and the data, reply with the value only.
Reply with JSON for objects and arrays, plain text otherwise.
If the value is not present, reply exactly NOT_FOUND."#;

/// Contents of the first markdown code fence, if any.
fn fenced_block(text: &str) -> Option<&str> {
    ["```json", "```"].iter().find_map(|marker| {
        let start = text.find(marker)?;
        let after = &text[start + marker.len()..];
        after.find("```").map(|end| after[..end].trim())
    })
}

/// Extract the JSON payload from a reply that may wrap it in markdown fences
/// or surrounding prose.
pub fn extract_json(text: &str) -> &str {
    let trimmed = text.trim();
    if let Some(block) = fenced_block(trimmed) {
        return block;
    }
    let open = trimmed.find(['{', '[']);
    let close = trimmed.rfind(['}', ']']);
    match (open, close) {
        (Some(start), Some(end)) if end > start => &trimmed[start..=end],
        _ => trimmed,
    }
}

/// Parse a plan reply: either `{"steps": [...], "reasoning"?, "signals"?}`
/// or a bare step array.
pub fn parse_generated_plan(text: &str) -> AgentResult<GeneratedPlan> {
    let raw: Value = serde_json::from_str(extract_json(text))
        .map_err(|e| AgentError::PlanningFailed(format!("Failed to parse plan JSON: {e}")))?;

    match raw {
        Value::Array(steps) => Ok(GeneratedPlan::new(steps)),
        Value::Object(mut map) => {
            let steps = match map.remove("steps").or_else(|| map.remove("plan")) {
                Some(Value::Array(steps)) => steps,
                _ => {
                    return Err(AgentError::PlanningFailed(
                        "Plan JSON has no 'steps' array".into(),
                    ));
                }
            };
            let mut plan = GeneratedPlan::new(steps);
            if let Some(reasoning) = map.get("reasoning").and_then(Value::as_str) {
                plan = plan.with_reasoning(reasoning);
            }
            if let Some(signals) = map.remove("signals") {
                match serde_json::from_value::<PlanSignals>(signals) {
                    Ok(signals) if !signals.is_empty() => plan = plan.with_signals(signals),
                    Ok(_) => {}
                    Err(e) => debug!(error = %e, "Ignoring malformed plan signals"),
                }
            }
            Ok(plan)
        }
        _ => Err(AgentError::PlanningFailed(
            "Plan JSON must be an object or an array".into(),
        )),
    }
}

async fn complete(
    provider: &dyn LLMProvider,
    model: Option<&str>,
    temperature: Option<f32>,
    messages: Vec<ChatMessage>,
) -> AgentResult<String> {
    let model = model.unwrap_or(provider.default_model());
    let mut request = ChatCompletionRequest::new(model);
    request.messages = messages;
    request.temperature = temperature;

    let response = provider
        .chat(request)
        .await
        .map_err(|e| AgentError::LlmFailed(e.to_string()))?;
    response
        .content()
        .map(str::to_string)
        .ok_or_else(|| AgentError::LlmFailed("LLM returned empty response".into()))
}

// ============================================================================
// Plan generation
// ============================================================================

/// # Example
///
/// ```rust,ignore
/// use planwright_foundation::llm_planner::LlmPlanGenerator;
///
/// let generator = LlmPlanGenerator::new(provider)
///     .with_model("gpt-4o")
///     .with_temperature(0.3);
/// ```
pub struct LlmPlanGenerator {
    provider: Arc<dyn LLMProvider>,
    model: Option<String>,
    temperature: Option<f32>,
}

impl LlmPlanGenerator {
    pub fn new(provider: Arc<dyn LLMProvider>) -> Self {
        Self {
            provider,
            model: None,
            temperature: Some(0.2),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into()).filter(|m: &String| !m.is_empty());
        self
    }

    pub fn with_temperature(mut self, temp: f32) -> Self {
        self.temperature = Some(temp);
        self
    }
}

#[async_trait]
impl PlanGenerator for LlmPlanGenerator {
    async fn create_plan(&self, request: PlanRequest) -> AgentResult<GeneratedPlan> {
        let messages = vec![
            ChatMessage::system(request.system_prompt),
            ChatMessage::user(request.user_prompt),
        ];
        let reply = complete(
            self.provider.as_ref(),
            self.model.as_deref(),
            self.temperature,
            messages,
        )
        .await
        .map_err(|e| AgentError::PlanningFailed(e.to_string()))?;
        parse_generated_plan(&reply)
    }
}

// ============================================================================
// Value extraction
// ============================================================================

pub struct LlmValueExtractor {
    provider: Arc<dyn LLMProvider>,
    model: Option<String>,
    max_chars: usize,
}

impl LlmValueExtractor {
    pub fn new(provider: Arc<dyn LLMProvider>) -> Self {
        Self {
            provider,
            model: None,
            max_chars: DEFAULT_EXTRACTION_MAX_CHARS,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into()).filter(|m: &String| !m.is_empty());
        self
    }

    pub fn with_max_chars(mut self, max_chars: usize) -> Self {
        self.max_chars = max_chars;
        self
    }

    fn prompt(&self, request: &ExtractionRequest) -> String {
        let mut data = request.structure.to_string();
        if data.len() > self.max_chars {
            let mut cut = self.max_chars;
            while !data.is_char_boundary(cut) {
                cut -= 1;
            }
            data.truncate(cut);
            data.push_str(" …");
        }
        format!(
            "Template: {}\nPath: {}\nData:\n{}",
            request.template, request.path, data
        )
    }
}

/// Strip fences and quotes from an extraction reply; `None` means not found.
pub fn clean_extraction(reply: &str) -> Option<Value> {
    let reply = reply.trim();
    let body = fenced_block(reply).unwrap_or(reply).trim_matches('`').trim();
    // Prose around a JSON payload is dropped; plain text with brackets is kept.
    let text = if body.starts_with(['{', '[']) {
        body
    } else {
        let slice = extract_json(body);
        if serde_json::from_str::<Value>(slice).is_ok() {
            slice
        } else {
            body
        }
    };
    let unquoted = text.trim_matches(|c| c == '"' || c == '\'').trim();
    if unquoted.is_empty() || unquoted.eq_ignore_ascii_case("NOT_FOUND") {
        return None;
    }
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Null) => None,
        Ok(value) => Some(value),
        Err(_) => Some(Value::String(unquoted.to_string())),
    }
}

#[async_trait]
impl ValueExtractor for LlmValueExtractor {
    async fn extract(&self, request: ExtractionRequest) -> Result<Value, ExtractionFailure> {
        let messages = vec![
            ChatMessage::system(EXTRACTION_SYSTEM_PROMPT),
            ChatMessage::user(self.prompt(&request)),
        ];
        let reply = complete(self.provider.as_ref(), self.model.as_deref(), Some(0.0), messages)
            .await
            .map_err(|e| ExtractionFailure::Failed(e.to_string()))?;
        debug!(template = %request.template, reply = %reply, "Extraction reply");
        clean_extraction(&reply).ok_or(ExtractionFailure::NotFound)
    }
}

use async_trait::async_trait;
use planwright_kernel::llm::{ChatCompletionRequest, ChatCompletionResponse, LLMProvider};
use planwright_kernel::{AgentError, AgentResult};
use std::sync::{Arc, RwLock};

/// A mock chat provider.
///
/// Responses are keyed by a substring of the prompt (all messages joined);
/// the first registered key contained in the prompt wins. This keeps plan
/// generation and extraction calls deterministic without a real model.
#[derive(Clone)]
pub struct MockLLMProvider {
    responses: Arc<RwLock<Vec<(String, String)>>>,
    fallback_response: Option<String>,
    /// Prompts received, in order.
    pub prompts: Arc<RwLock<Vec<String>>>,
}

impl Default for MockLLMProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MockLLMProvider {
    pub fn new() -> Self {
        Self {
            responses: Arc::new(RwLock::new(Vec::new())),
            fallback_response: None,
            prompts: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// If the prompt contains `prompt_key`, reply with `response`.
    pub fn add_mock_response(&self, prompt_key: &str, response: &str) {
        if let Ok(mut responses) = self.responses.write() {
            responses.push((prompt_key.to_string(), response.to_string()));
        }
    }

    /// Reply used when no key matches; without one, unmatched prompts fail.
    pub fn set_fallback_response(&mut self, response: &str) {
        self.fallback_response = Some(response.to_string());
    }

    pub fn call_count(&self) -> usize {
        self.prompts.read().map(|p| p.len()).unwrap_or(0)
    }
}

#[async_trait]
impl LLMProvider for MockLLMProvider {
    fn name(&self) -> &str {
        "mock"
    }

    fn default_model(&self) -> &str {
        "mock-model"
    }

    async fn chat(&self, request: ChatCompletionRequest) -> AgentResult<ChatCompletionResponse> {
        let prompt = request
            .messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        if let Ok(mut prompts) = self.prompts.write() {
            prompts.push(prompt.clone());
        }

        let matched = self.responses.read().ok().and_then(|responses| {
            responses
                .iter()
                .find(|(key, _)| prompt.contains(key.as_str()))
                .map(|(_, response)| response.clone())
        });
        matched
            .or_else(|| self.fallback_response.clone())
            .map(ChatCompletionResponse::from_text)
            .ok_or_else(|| AgentError::LlmFailed("no mock response matches the prompt".into()))
    }
}

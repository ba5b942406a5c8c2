use async_trait::async_trait;

use super::types::*;
use crate::error::AgentResult;

/// Chat-completion provider.
///
/// Only the plan generator and the extraction fallback talk to a model, and
/// both need plain request/response chat; streaming and embeddings are out
/// of scope for the planner.
#[async_trait]
pub trait LLMProvider: Send + Sync {
    /// Provider name
    fn name(&self) -> &str;

    /// Default model
    fn default_model(&self) -> &str {
        ""
    }

    /// Chat request
    async fn chat(&self, request: ChatCompletionRequest) -> AgentResult<ChatCompletionResponse>;
}

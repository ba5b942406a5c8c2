//! Last-resort value extraction
//!
//! When every structural search strategy fails to locate a referenced value,
//! the resolver asks a [`ValueExtractor`] once per unresolved reference. The
//! failure is typed instead of relying on string sentinels.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// One extraction question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionRequest {
    /// The full template text, e.g. `{{s1.result.items[0].id}}`.
    pub template: String,
    /// The path that structural search attempted, e.g. `items[0].id`.
    pub path: String,
    /// The referenced step's raw result.
    pub structure: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractionFailure {
    /// The collaborator answered that the value is not present.
    #[error("value not found")]
    NotFound,

    #[error("extraction timed out after {ms}ms")]
    Timeout { ms: u64 },

    #[error("extraction failed: {0}")]
    Failed(String),
}

#[async_trait::async_trait]
pub trait ValueExtractor: Send + Sync {
    /// Locate `request.path` inside `request.structure`.
    async fn extract(&self, request: ExtractionRequest) -> Result<Value, ExtractionFailure>;
}

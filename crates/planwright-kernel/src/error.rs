//! Error types shared by the kernel and foundation layers
//!
//! Validation problems and unresolved arguments are reported as data on the
//! plan itself; the variants here cover exceptional conditions only.

use std::fmt;
use thiserror::Error;

/// Result alias used across the planner.
pub type AgentResult<T> = Result<T, AgentError>;

/// Planner error type.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Plan not found for a thread key
    #[error("Plan not found: {0}")]
    PlanNotFound(String),

    /// Step not found inside a plan
    #[error("Step not found: {0}")]
    StepNotFound(String),

    #[error("Plan validation failed: {0}")]
    ValidationFailed(String),

    /// The plan-generating collaborator failed or returned garbage
    #[error("Planning failed: {0}")]
    PlanningFailed(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    /// LLM call failed
    #[error("LLM call failed: {0}")]
    LlmFailed(String),

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    /// Invalid step or plan state transition
    #[error("Invalid state transition: from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Operation timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// Plan store read/write failure
    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(String),
}

impl AgentError {
    /// Build a state transition error from two debuggable states.
    pub fn invalid_state_transition(from: impl fmt::Debug, to: impl fmt::Debug) -> Self {
        Self::InvalidStateTransition {
            from: format!("{:?}", from),
            to: format!("{:?}", to),
        }
    }

    pub fn timeout(duration_ms: u64) -> Self {
        Self::Timeout { duration_ms }
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(err: serde_json::Error) -> Self {
        AgentError::SerializationError(err.to_string())
    }
}

impl From<std::io::Error> for AgentError {
    fn from(err: std::io::Error) -> Self {
        AgentError::Internal(err.to_string())
    }
}

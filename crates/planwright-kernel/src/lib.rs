//! Planwright kernel
//!
//! Plan model, replan policy types, agent actions and the collaborator
//! traits (plan generation, value extraction, telemetry, storage, LLM
//! access). Concrete behavior lives in `planwright-foundation`.

// error module
pub mod error;
pub use error::{AgentError, AgentResult};

// plan model
pub mod plan;
pub use plan::*;

// replan policy configuration
pub mod policy;
pub use policy::*;

// actions, thoughts and tool outcomes
pub mod action;
pub use action::*;

// execution context
pub mod context;
pub use context::*;

// collaborator traits
pub mod extraction;
pub mod planner;
pub mod storage;
pub mod telemetry;

pub use extraction::{ExtractionFailure, ExtractionRequest, ValueExtractor};
pub use planner::{GeneratedPlan, PlanGenerator, PlanRequest};
pub use storage::{PlanRepository, Storage};
pub use telemetry::{PlanTelemetry, PlanningEvent};

// LLM provider abstraction
pub mod llm;

// Config loader
#[cfg(feature = "config")]
pub mod config;

//! Planwright foundation
//!
//! The planning core built on `planwright-kernel`: template grammar, layered
//! result search, argument resolution, plan validation, parallel detection,
//! the replan policy engine and the [`PlanExecutor`] loop, plus LLM-backed
//! collaborators, an in-memory plan store and a tracing telemetry sink.

// template references, CONTEXT tokens and sentinels
pub mod template;

// layered search over tool results
pub mod search;

// argument resolution
pub mod resolver;

// plan validation
pub mod validation;

// generated step normalization
pub mod normalize;

// batch detection and fan-out
pub mod parallel;

// replan policy engine
pub mod policy;

// think / analyze_result loop
pub mod planning_executor;

// LLM-backed plan generator and value extractor
pub mod llm_planner;

// plan repository
pub mod store;

// tracing setup and telemetry sink
pub mod telemetry;

// planner configuration
pub mod config;

pub use config::{ExecutionSettings, LlmSettings, PlannerConfig};
pub use llm_planner::{LlmPlanGenerator, LlmValueExtractor};
pub use parallel::MAX_PARALLEL_CONCURRENCY;
pub use planning_executor::PlanExecutor;
pub use policy::{FailureClass, FailureDecision, ReplanPolicyEngine, classify_failure};
pub use resolver::{ArgumentResolver, Resolution, ResolutionScope};
pub use search::LayeredSearch;
pub use store::InMemoryPlanStore;
pub use telemetry::{TracingTelemetry, init_tracing};
pub use validation::{ValidationIssue, ValidationReport, diagnostic_plan, validate_plan};

//! Planwright Testing Framework
//!
//! Deterministic doubles for every collaborator of the planning core, so
//! plans can be driven end to end without live models or tools.

pub mod backend;
pub mod harness;
pub mod planner;
pub mod telemetry;
pub mod tools;

pub use backend::MockLLMProvider;
pub use harness::{AgentRun, drive, thread_context};
pub use planner::ScriptedPlanGenerator;
pub use telemetry::{FailingTelemetry, RecordingTelemetry};
pub use tools::MockToolExecutor;

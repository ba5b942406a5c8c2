//! Minimal LLM surface used by the LLM-backed collaborators.

pub mod provider;
pub mod types;

pub use provider::*;
pub use types::*;

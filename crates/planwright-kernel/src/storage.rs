//! Storage traits for plan snapshots
//!
//! Plans are keyed by execution thread. The executor never keeps a global
//! map: it is handed a [`Storage`] implementation and performs one load and
//! one save per `think` / `analyze_result` call. Callers must serialize calls
//! for the same key.

use crate::error::AgentResult;
use crate::plan::ExecutionPlan;
use async_trait::async_trait;

// ============================================================================
// Generic Storage Trait
// ============================================================================

/// Generic storage trait for key-value operations
///
/// # Example
///
/// ```rust,ignore
/// use planwright_kernel::storage::Storage;
///
/// struct MyStorage {
///     data: Mutex<HashMap<String, ExecutionPlan>>,
/// }
///
/// #[async_trait]
/// impl Storage<String, ExecutionPlan> for MyStorage {
///     async fn load(&self, key: &String) -> AgentResult<Option<ExecutionPlan>> {
///         Ok(self.data.lock().get(key).cloned())
///     }
///     // ...
/// }
/// ```
#[async_trait]
pub trait Storage<K, V>: Send + Sync {
    /// Load a value by key
    ///
    /// Returns `Ok(None)` if the key doesn't exist.
    async fn load(&self, key: &K) -> AgentResult<Option<V>>;

    /// Save a value by key, replacing any previous value.
    async fn save(&self, key: &K, value: &V) -> AgentResult<()>;

    /// Delete a value by key
    ///
    /// Returns `Ok(true)` if the key existed and was deleted.
    async fn delete(&self, key: &K) -> AgentResult<bool>;

    async fn list(&self) -> AgentResult<Vec<K>>;
}

/// The plan repository: thread key → owning plan.
pub type PlanRepository = dyn Storage<String, ExecutionPlan>;

//! ExecutionStore port: persisted executions.
//!
//! The engine never persists linkage objects; it saves executions only.
//! Store failures surface as `EngineError::Store`.

use async_trait::async_trait;

use crate::domain::{EngineResult, Execution, ExecutionId};

#[async_trait]
pub trait ExecutionStore: Send + Sync {
    async fn find_by_id(
        &self,
        tenant_id: Option<&str>,
        id: ExecutionId,
    ) -> EngineResult<Option<Execution>>;

    /// Execution by id whatever its tenant. Ids are unique across tenants;
    /// only the engine's owner of an id reloads it this way.
    async fn load(&self, id: ExecutionId) -> EngineResult<Option<Execution>>;

    /// Executions whose trigger names `parent` as their `executionId`.
    async fn find_children_by_trigger_execution_id(
        &self,
        tenant_id: Option<&str>,
        parent: ExecutionId,
    ) -> EngineResult<Vec<Execution>>;

    /// Restarts a failed or paused execution, optionally on another flow
    /// revision, and returns the restarted execution.
    async fn restart(&self, execution: Execution, revision: Option<u32>) -> EngineResult<Execution>;

    /// Inserts or replaces by id.
    async fn save(&self, execution: Execution) -> EngineResult<()>;
}

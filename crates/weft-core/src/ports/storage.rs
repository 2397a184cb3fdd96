//! StorageContext port: where task outputs are stored.

use crate::domain::{ExecutionId, TaskRunId};

/// Scope the outputs belong to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageGroup {
    pub tenant_id: Option<String>,
    pub namespace: String,
    pub flow_id: String,
    pub execution_id: ExecutionId,
    pub task_id: String,
    pub task_run_id: TaskRunId,
}

pub trait StorageContext: Send + Sync {
    fn base_uri_for(&self, group: &StorageGroup) -> String;
}

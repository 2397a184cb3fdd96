//! Transient linkage between a parent task-run and its child execution.
//!
//! Both types live for one reconciliation step only and are never persisted.

use std::collections::HashMap;

use serde_json::Value;

use super::execution::Execution;
use super::ids::ExecutionId;
use super::state::StateType;
use super::task_run::TaskRun;

/// Identity of the delegating task, as recorded in the child's trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRef {
    pub id: String,
    pub task_type: String,
}

/// A child execution to run on behalf of a parent task-run.
#[derive(Debug, Clone, PartialEq)]
pub struct SubflowExecution {
    pub parent_task: TaskRef,
    /// Parent task-run, already moved to RUNNING.
    pub parent_task_run: TaskRun,
    /// Brand-new or restarted child.
    pub execution: Execution,
}

/// A terminated child folded back into its parent task-run.
#[derive(Debug, Clone, PartialEq)]
pub struct SubflowExecutionResult {
    pub execution_id: ExecutionId,
    pub state: StateType,
    pub parent_task_run: TaskRun,
    pub outputs: HashMap<String, Value>,
}

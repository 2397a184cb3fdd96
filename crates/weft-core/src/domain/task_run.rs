//! One run of one task inside an execution.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ids::{ExecutionId, TaskRunId};
use super::state::{State, StateType};
use crate::tasks::DelegatingTask;

/// Output key holding the child execution id of a delegating task-run.
pub const OUTPUT_EXECUTION_ID: &str = "executionId";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRunAttempt {
    pub state: State,
}

impl TaskRunAttempt {
    pub fn new(state: State) -> Self {
        Self { state }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRun {
    pub id: TaskRunId,
    pub execution_id: ExecutionId,
    pub task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_task_run_id: Option<TaskRunId>,
    /// Correlates a batch item (e.g. the item a `ForEach` iterates on).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration: Option<u32>,
    pub state: State,
    #[serde(default)]
    pub attempts: Vec<TaskRunAttempt>,
    #[serde(default)]
    pub outputs: HashMap<String, Value>,
    /// Task this task-run delegates to, saved with it so any owner can
    /// dispatch it again after a restart.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delegation: Option<DelegatingTask>,
}

impl TaskRun {
    pub fn new(id: TaskRunId, execution_id: ExecutionId, task_id: impl Into<String>) -> Self {
        Self {
            id,
            execution_id,
            task_id: task_id.into(),
            parent_task_run_id: None,
            value: None,
            iteration: None,
            state: State::new(StateType::Created),
            attempts: Vec::new(),
            outputs: HashMap::new(),
            delegation: None,
        }
    }

    pub fn with_state(mut self, state: StateType) -> Self {
        self.state = self.state.with_state(state);
        self
    }

    /// Replaces the whole state, history included.
    pub fn with_full_state(mut self, state: State) -> Self {
        self.state = state;
        self
    }

    pub fn with_value(mut self, value: Option<String>) -> Self {
        self.value = value;
        self
    }

    pub fn with_iteration(mut self, iteration: Option<u32>) -> Self {
        self.iteration = iteration;
        self
    }

    pub fn with_outputs(mut self, outputs: HashMap<String, Value>) -> Self {
        self.outputs = outputs;
        self
    }

    pub fn with_output(mut self, key: impl Into<String>, value: Value) -> Self {
        self.outputs.insert(key.into(), value);
        self
    }

    pub fn with_attempts(mut self, attempts: Vec<TaskRunAttempt>) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn with_attempt(mut self, attempt: TaskRunAttempt) -> Self {
        self.attempts.push(attempt);
        self
    }

    pub fn with_delegation(mut self, task: DelegatingTask) -> Self {
        self.delegation = Some(task);
        self
    }

    /// Child execution id recorded by a previous dispatch, if any.
    pub fn output_execution_id(&self) -> Option<ExecutionId> {
        self.outputs
            .get(OUTPUT_EXECUTION_ID)
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
    }
}

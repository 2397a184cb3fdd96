//! Execution aggregate root.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::flow::FlowCapability;
use super::ids::{ExecutionId, TaskRunId};
use super::label::{self, Label};
use super::state::{State, StateType};
use super::task_run::TaskRun;

// Trigger variables set on a child execution by its parent's dispatch.
pub const TRIGGER_EXECUTION_ID: &str = "executionId";
pub const TRIGGER_NAMESPACE: &str = "namespace";
pub const TRIGGER_FLOW_ID: &str = "flowId";
pub const TRIGGER_FLOW_REVISION: &str = "flowRevision";
pub const TRIGGER_TASK_RUN_ID: &str = "taskRunId";
pub const TRIGGER_TASK_RUN_VALUE: &str = "taskRunValue";
pub const TRIGGER_TASK_RUN_ITERATION: &str = "taskRunIteration";

/// What started an execution: the delegating task plus a flat variables map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionTrigger {
    pub id: String,
    #[serde(rename = "type")]
    pub trigger_type: String,
    #[serde(default)]
    pub variables: BTreeMap<String, Value>,
}

impl ExecutionTrigger {
    pub fn variable(&self, key: &str) -> Option<&Value> {
        self.variables.get(key)
    }

    /// Parent execution, for executions launched by a delegating task.
    pub fn parent_execution_id(&self) -> Option<ExecutionId> {
        self.variable(TRIGGER_EXECUTION_ID)
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
    }

    /// Parent task-run, for executions launched by a delegating task.
    pub fn parent_task_run_id(&self) -> Option<TaskRunId> {
        self.variable(TRIGGER_TASK_RUN_ID)
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
    }

    pub fn task_run_iteration(&self) -> Option<u32> {
        self.variable(TRIGGER_TASK_RUN_ITERATION)
            .and_then(Value::as_u64)
            .and_then(|i| u32::try_from(i).ok())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: ExecutionId,
    /// Id of the first execution of this lineage. Equal to `id` unless the
    /// execution was derived from another one.
    pub original_id: ExecutionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    pub namespace: String,
    pub flow_id: String,
    pub flow_revision: u32,
    pub state: State,
    #[serde(default)]
    pub labels: Vec<Label>,
    #[serde(default)]
    pub task_run_list: Vec<TaskRun>,
    #[serde(default)]
    pub inputs: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<ExecutionTrigger>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_date: Option<DateTime<Utc>>,
    /// Distributed-trace headers (e.g. `traceparent`).
    #[serde(default)]
    pub trace_headers: BTreeMap<String, String>,
}

impl Execution {
    /// Brand-new CREATED execution of `flow`. Labels are deduplicated by key.
    pub fn new_execution(
        id: ExecutionId,
        flow: &dyn FlowCapability,
        inputs: HashMap<String, Value>,
        labels: Vec<Label>,
    ) -> Self {
        Self {
            id,
            original_id: id,
            tenant_id: flow.tenant_id().map(str::to_string),
            namespace: flow.namespace().to_string(),
            flow_id: flow.id().to_string(),
            flow_revision: flow.revision(),
            state: State::new(StateType::Created),
            labels: label::deduplicate(&labels),
            task_run_list: Vec::new(),
            inputs,
            trigger: None,
            schedule_date: None,
            trace_headers: BTreeMap::new(),
        }
    }

    pub fn with_state(mut self, state: StateType) -> Self {
        self.state = self.state.with_state(state);
        self
    }

    pub fn with_trigger(mut self, trigger: ExecutionTrigger) -> Self {
        self.trigger = Some(trigger);
        self
    }

    pub fn with_schedule_date(mut self, schedule_date: Option<DateTime<Utc>>) -> Self {
        self.schedule_date = schedule_date;
        self
    }

    pub fn with_labels(mut self, labels: Vec<Label>) -> Self {
        self.labels = label::deduplicate(&labels);
        self
    }

    pub fn find_task_run_by_task_run_id(&self, id: TaskRunId) -> Option<&TaskRun> {
        self.task_run_list.iter().find(|tr| tr.id == id)
    }

    /// Inserts `task_run`, replacing the entry with the same id in place.
    pub fn with_task_run(mut self, task_run: TaskRun) -> Self {
        match self.task_run_list.iter_mut().find(|tr| tr.id == task_run.id) {
            Some(existing) => *existing = task_run,
            None => self.task_run_list.push(task_run),
        }
        self
    }

    pub fn has_label(&self, label: &Label) -> bool {
        self.labels.contains(label)
    }

    /// Carries the `system.restarted=true` marker.
    pub fn is_restarted(&self) -> bool {
        self.has_label(&Label::new(Label::RESTARTED, "true"))
    }

    /// Whether an incoming update of a task-run may replace the stored one.
    ///
    /// Updates that would move a task-run backwards are refused: an identical
    /// current state, a replay of part of a terminated task-run's history, or
    /// an update whose history is shorter than the stored one. Leaving a
    /// terminal state (RETRYING, RESTARTED) extends the history and is
    /// accepted. Unknown task-runs are always joinable.
    pub fn has_task_run_joinable(&self, task_run: &TaskRun) -> bool {
        let Some(stored) = self.find_task_run_by_task_run_id(task_run.id) else {
            return true;
        };

        if stored.state.current() == task_run.state.current() {
            return false;
        }

        let stored_histories = stored.state.histories();
        let incoming = task_run.state.histories();
        if stored.state.is_terminated()
            && incoming.len() <= stored_histories.len()
            && incoming
                .iter()
                .zip(stored_histories)
                .all(|(i, s)| i.state == s.state)
        {
            return false;
        }

        incoming.len() >= stored_histories.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::flow::Flow;

    fn execution() -> Execution {
        let flow = Flow::new("company.team", "parent");
        Execution::new_execution(ExecutionId::random(), &flow, HashMap::new(), Vec::new())
    }

    fn task_run_with(id: TaskRunId, execution_id: ExecutionId, path: &[StateType]) -> TaskRun {
        let mut tr = TaskRun::new(id, execution_id, "t");
        for t in path {
            tr = tr.with_state(*t);
        }
        tr
    }

    fn joinable(stored: &[StateType], incoming: &[StateType]) -> bool {
        let id = TaskRunId::random();
        let exec = execution();
        let stored = task_run_with(id, exec.id, stored);
        let incoming = task_run_with(id, exec.id, incoming);
        exec.with_task_run(stored).has_task_run_joinable(&incoming)
    }

    use StateType::*;

    #[test]
    fn joinable_when_moving_forward() {
        assert!(joinable(&[Running], &[Running, Failed]));
    }

    #[test]
    fn not_joinable_with_same_state() {
        assert!(!joinable(&[], &[]));
    }

    #[test]
    fn not_joinable_when_stored_failed_and_incoming_running() {
        assert!(!joinable(&[Running, Failed], &[Running]));
    }

    #[test]
    fn joinable_when_leaving_a_failure() {
        assert!(joinable(&[Running, Failed], &[Running, Failed, Retrying]));
        assert!(joinable(&[Running, Failed], &[Running, Failed, Restarted]));
    }

    #[test]
    fn not_joinable_when_replaying_a_terminated_history() {
        assert!(!joinable(&[Running, Failed], &[]));
        assert!(!joinable(&[Running, Success], &[Running]));
    }

    #[test]
    fn not_joinable_when_restarted_and_incoming_is_stale_failure() {
        assert!(!joinable(&[Running, Failed, Created], &[Running, Failed]));
    }

    #[test]
    fn joinable_with_same_length_after_restart() {
        // stored: C R S C (restarted), incoming: C R S S is impossible through
        // with_state, so build the incoming state from its history directly
        let id = TaskRunId::random();
        let exec = execution();
        let stored = task_run_with(id, exec.id, &[Running, Success, Created]);
        let histories = stored.state.histories().to_vec();
        let mut incoming_hist = histories[..3].to_vec();
        incoming_hist.push(crate::domain::state::History::new(Success, histories[3].date));
        let incoming = stored
            .clone()
            .with_full_state(State::of(Success, incoming_hist).unwrap());
        assert!(exec.with_task_run(stored).has_task_run_joinable(&incoming));
    }

    #[test]
    fn joinable_after_restart_progress() {
        assert!(joinable(
            &[Running, Failed, Created],
            &[Running, Failed, Created, Running, Success]
        ));
    }

    #[test]
    fn unknown_task_run_is_joinable() {
        let exec = execution();
        let tr = TaskRun::new(TaskRunId::random(), exec.id, "t");
        assert!(exec.has_task_run_joinable(&tr));
    }

    #[test]
    fn with_task_run_replaces_by_id() {
        let exec = execution();
        let id = TaskRunId::random();
        let exec = exec
            .with_task_run(TaskRun::new(id, ExecutionId::random(), "a"))
            .with_task_run(TaskRun::new(TaskRunId::random(), ExecutionId::random(), "b"))
            .with_task_run(TaskRun::new(id, ExecutionId::random(), "a").with_state(Running));

        assert_eq!(exec.task_run_list.len(), 2);
        assert_eq!(exec.task_run_list[0].state.current(), Running);
        assert_eq!(
            exec.find_task_run_by_task_run_id(id).map(|tr| tr.task_id.as_str()),
            Some("a")
        );
    }

    #[test]
    fn original_id_survives_state_changes() {
        let exec = execution();
        let id = exec.id;
        let restarted = exec.with_state(Restarted).with_state(Paused);
        assert_eq!(restarted.original_id, id);
    }

    #[test]
    fn labels_are_deduplicated() {
        let exec = execution().with_labels(vec![
            Label::new("test", "value1"),
            Label::new("test", "value2"),
        ]);
        assert_eq!(exec.labels, vec![Label::new("test", "value2")]);
        assert!(!exec.is_restarted());
        let exec = exec.with_labels(vec![Label::new(Label::RESTARTED, "true")]);
        assert!(exec.is_restarted());
    }
}

//! Iteration aggregation for batched children.
//!
//! Sibling children report their state changes one at a time and in any
//! relative order. Each change moves one unit from the child's previous
//! state to its current state in the aggregate's `iterations` counters; once
//! the terminal counters add up to `numberOfBatches` the aggregate itself
//! terminates.

use std::collections::{BTreeMap, HashMap};

use serde_json::{Map, Value, json};

use crate::domain::{EngineError, EngineResult, Execution, State, StateType, TaskRun, TaskRunAttempt};
use crate::ports::{StorageContext, StorageGroup};
use crate::tasks::for_each_item::{
    OUTPUT_ITERATIONS, OUTPUT_NUMBER_OF_BATCHES, OUTPUT_SUBFLOW_OUTPUTS_BASE_URI,
};

/// Count of children per state. Counts are signed and never clamped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Iterations(BTreeMap<StateType, i64>);

impl Iterations {
    /// Reads the `iterations` output; missing means no child reported yet.
    pub fn from_outputs(outputs: &HashMap<String, Value>) -> EngineResult<Self> {
        let Some(raw) = outputs.get(OUTPUT_ITERATIONS) else {
            return Ok(Self::default());
        };
        let Value::Object(raw) = raw else {
            return Err(EngineError::invariant(format!(
                "'{OUTPUT_ITERATIONS}' output is not an object: {raw}"
            )));
        };

        let mut counts = BTreeMap::new();
        for (key, count) in raw {
            let state: StateType = key.parse()?;
            let count = count.as_i64().ok_or_else(|| {
                EngineError::invariant(format!("iteration count for {key} is not an integer"))
            })?;
            counts.insert(state, count);
        }
        Ok(Self(counts))
    }

    pub fn get(&self, state: StateType) -> i64 {
        self.get_or(state, 0)
    }

    pub fn get_or(&self, state: StateType, default: i64) -> i64 {
        self.0.get(&state).copied().unwrap_or(default)
    }

    pub fn set(&mut self, state: StateType, count: i64) {
        self.0.insert(state, count);
    }

    /// Children counted in a terminal state.
    pub fn terminated(&self) -> i64 {
        [
            StateType::Success,
            StateType::Failed,
            StateType::Killed,
            StateType::Warning,
            StateType::Cancelled,
        ]
        .into_iter()
        .map(|s| self.get(s))
        .sum()
    }

    pub fn to_value(&self) -> Value {
        Value::Object(
            self.0
                .iter()
                .map(|(state, count)| (state.to_string(), json!(count)))
                .collect::<Map<String, Value>>(),
        )
    }
}

fn number_of_batches(outputs: &HashMap<String, Value>) -> Option<i64> {
    outputs.get(OUTPUT_NUMBER_OF_BATCHES).and_then(Value::as_i64)
}

/// Folds one child state change into the aggregate task-run.
///
/// `task_run` is the report: it carries the aggregate's id, the child's
/// state (with history), the child's iteration, and `numberOfBatches`.
/// Returns the updated aggregate; its state only changes once every batch
/// is terminated.
pub fn manage_iterations(
    storage: &dyn StorageContext,
    task_run: &TaskRun,
    execution: &Execution,
    transmit_failed: bool,
    allow_failure: bool,
    allow_warning: bool,
) -> EngineResult<TaskRun> {
    let Some(aggregate) = execution.find_task_run_by_task_run_id(task_run.id) else {
        return Err(EngineError::invariant(format!(
            "aggregate task-run {} is missing from execution {}",
            task_run.id, execution.id
        )));
    };
    let number_of_batches = number_of_batches(&task_run.outputs)
        .or_else(|| number_of_batches(&aggregate.outputs))
        .ok_or_else(|| {
            EngineError::invariant(format!(
                "aggregate task-run {} has no '{OUTPUT_NUMBER_OF_BATCHES}'",
                task_run.id
            ))
        })?;

    let current = task_run.state.current();
    let previous = task_run.state.previous();

    let mut iterations = Iterations::from_outputs(&aggregate.outputs)?;
    iterations.set(current, iterations.get(current) + 1);

    if let Some(previous) = previous.filter(|p| *p != current) {
        iterations.set(previous, iterations.get_or(previous, number_of_batches) - 1);
        if previous == StateType::Restarted {
            iterations.set(StateType::Failed, 0);
        }
    }

    tracing::debug!(
        execution_id = %execution.id,
        task_run_id = %task_run.id,
        iteration = ?task_run.iteration,
        state = %current,
        iterations = %iterations.to_value(),
        "iteration state changed"
    );

    let aggregate = aggregate.clone().with_iteration(task_run.iteration);

    if iterations.terminated() == number_of_batches {
        let state = if transmit_failed {
            find_terminal_state(&iterations, allow_failure, allow_warning)
        } else {
            StateType::Success
        };
        let base_uri = storage.base_uri_for(&StorageGroup {
            tenant_id: execution.tenant_id.clone(),
            namespace: execution.namespace.clone(),
            flow_id: execution.flow_id.clone(),
            execution_id: execution.id,
            task_id: aggregate.task_id.clone(),
            task_run_id: aggregate.id,
        });

        tracing::info!(
            execution_id = %execution.id,
            task_run_id = %task_run.id,
            state = %state,
            number_of_batches,
            "all iterations terminated"
        );

        return Ok(aggregate
            .with_outputs(HashMap::from([
                (OUTPUT_ITERATIONS.to_string(), iterations.to_value()),
                (OUTPUT_NUMBER_OF_BATCHES.to_string(), json!(number_of_batches)),
                (OUTPUT_SUBFLOW_OUTPUTS_BASE_URI.to_string(), json!(base_uri)),
            ]))
            .with_attempts(vec![TaskRunAttempt::new(
                State::new(StateType::Created).with_state(state),
            )])
            .with_state(state));
    }

    Ok(aggregate.with_outputs(HashMap::from([
        (OUTPUT_ITERATIONS.to_string(), iterations.to_value()),
        (OUTPUT_NUMBER_OF_BATCHES.to_string(), json!(number_of_batches)),
    ])))
}

/// Final state of a group whose children all terminated.
///
/// Any failure goes through the shared failure policy, then any kill wins,
/// then warnings (SUCCESS if allowed); otherwise SUCCESS.
pub fn find_terminal_state(
    iterations: &Iterations,
    allow_failure: bool,
    allow_warning: bool,
) -> StateType {
    if iterations.get(StateType::Failed) > 0 {
        return StateType::fail(allow_failure, allow_warning);
    }
    if iterations.get(StateType::Killed) > 0 {
        return StateType::Killed;
    }
    if iterations.get(StateType::Warning) > 0 {
        return StateType::Warning.with_failure_policy(allow_failure, allow_warning);
    }
    StateType::Success
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ExecutionId, Flow, TaskRunId};
    use crate::impls::LocalStorageContext;
    use rstest::rstest;

    struct Group {
        execution: Execution,
        aggregate_id: TaskRunId,
        storage: LocalStorageContext,
    }

    impl Group {
        fn new(number_of_batches: i64) -> Self {
            let execution = Execution::new_execution(
                ExecutionId::random(),
                &Flow::new("company.team", "parent"),
                HashMap::new(),
                Vec::new(),
            );
            let aggregate = TaskRun::new(TaskRunId::random(), execution.id, "each")
                .with_state(StateType::Running)
                .with_output(OUTPUT_NUMBER_OF_BATCHES, json!(number_of_batches));
            let aggregate_id = aggregate.id;
            Self {
                execution: execution.with_task_run(aggregate),
                aggregate_id,
                storage: LocalStorageContext::new("weft:///"),
            }
        }

        /// Reports a child at `path` (oldest first) and stores the result.
        fn report(&mut self, iteration: u32, path: &[StateType], flags: (bool, bool, bool)) -> TaskRun {
            let mut state = State::new(path[0]);
            for t in &path[1..] {
                state = state.with_state(*t);
            }
            let report = TaskRun::new(self.aggregate_id, self.execution.id, "each")
                .with_full_state(state)
                .with_iteration(Some(iteration))
                .with_output(
                    OUTPUT_NUMBER_OF_BATCHES,
                    self.aggregate().outputs[OUTPUT_NUMBER_OF_BATCHES].clone(),
                );
            let (transmit_failed, allow_failure, allow_warning) = flags;
            let updated = manage_iterations(
                &self.storage,
                &report,
                &self.execution,
                transmit_failed,
                allow_failure,
                allow_warning,
            )
            .unwrap();
            self.execution = self.execution.clone().with_task_run(updated.clone());
            updated
        }

        fn aggregate(&self) -> &TaskRun {
            self.execution
                .find_task_run_by_task_run_id(self.aggregate_id)
                .unwrap()
        }
    }

    const STRICT: (bool, bool, bool) = (true, false, false);

    #[test]
    fn three_first_events_success_terminate_the_group() {
        let mut group = Group::new(3);
        let first = group.report(1, &[StateType::Success], STRICT);
        assert_eq!(first.state.current(), StateType::Running);
        assert_eq!(first.iteration, Some(1));
        assert_eq!(first.outputs[OUTPUT_ITERATIONS], json!({ "SUCCESS": 1 }));
        assert!(!first.outputs.contains_key(OUTPUT_SUBFLOW_OUTPUTS_BASE_URI));

        group.report(2, &[StateType::Success], STRICT);
        let last = group.report(3, &[StateType::Success], STRICT);

        assert_eq!(last.state.current(), StateType::Success);
        assert_eq!(last.iteration, Some(3));
        assert_eq!(last.outputs[OUTPUT_ITERATIONS], json!({ "SUCCESS": 3 }));
        assert_eq!(last.outputs[OUTPUT_NUMBER_OF_BATCHES], json!(3));
        assert!(
            last.outputs[OUTPUT_SUBFLOW_OUTPUTS_BASE_URI]
                .as_str()
                .unwrap()
                .starts_with("weft:///company/team/parent/executions/")
        );
        assert_eq!(last.attempts.len(), 1);
        assert_eq!(last.attempts[0].state.current(), StateType::Success);
        assert_eq!(last.attempts[0].state.histories().len(), 2);
    }

    #[rstest]
    #[case(true, false, false, StateType::Failed)]
    #[case(true, true, false, StateType::Warning)]
    #[case(true, true, true, StateType::Success)]
    #[case(false, false, false, StateType::Success)]
    fn mixed_outcome(
        #[case] transmit_failed: bool,
        #[case] allow_failure: bool,
        #[case] allow_warning: bool,
        #[case] expected: StateType,
    ) {
        let flags = (transmit_failed, allow_failure, allow_warning);
        let mut group = Group::new(3);
        group.report(1, &[StateType::Success], flags);
        group.report(2, &[StateType::Failed], flags);
        let last = group.report(3, &[StateType::Success], flags);
        assert_eq!(last.state.current(), expected);
    }

    #[test]
    fn transitions_move_counts_between_states() {
        let mut group = Group::new(2);
        let tr = group.report(1, &[StateType::Created, StateType::Running], STRICT);
        // CREATED was never seen: it defaults to the batch count before the decrement
        assert_eq!(tr.outputs[OUTPUT_ITERATIONS], json!({ "CREATED": 1, "RUNNING": 1 }));

        let tr = group.report(
            1,
            &[StateType::Created, StateType::Running, StateType::Success],
            STRICT,
        );
        assert_eq!(
            tr.outputs[OUTPUT_ITERATIONS],
            json!({ "CREATED": 1, "RUNNING": 0, "SUCCESS": 1 })
        );
        assert_eq!(tr.state.current(), StateType::Running);
    }

    #[test]
    fn restart_resets_failed_count() {
        let mut group = Group::new(3);
        group.report(1, &[StateType::Failed], STRICT);
        group.report(2, &[StateType::Failed], STRICT);
        let tr = group.report(3, &[StateType::Running], STRICT);
        assert_eq!(tr.outputs[OUTPUT_ITERATIONS]["FAILED"], json!(2));

        let tr = group.report(1, &[StateType::Restarted, StateType::Running], STRICT);
        assert_eq!(tr.outputs[OUTPUT_ITERATIONS]["FAILED"], json!(0));
        assert_eq!(tr.outputs[OUTPUT_ITERATIONS]["RESTARTED"], json!(2));
    }

    #[test]
    fn duplicated_events_are_counted_twice() {
        let mut group = Group::new(2);
        group.report(1, &[StateType::Success], STRICT);
        let tr = group.report(1, &[StateType::Success], STRICT);
        // the second delivery terminates the group: counts are not deduplicated
        assert_eq!(tr.state.current(), StateType::Success);
        assert_eq!(tr.outputs[OUTPUT_ITERATIONS], json!({ "SUCCESS": 2 }));
    }

    #[test]
    fn missing_aggregate_is_an_invariant_violation() {
        let group = Group::new(1);
        let stray = TaskRun::new(TaskRunId::random(), group.execution.id, "each")
            .with_output(OUTPUT_NUMBER_OF_BATCHES, json!(1));
        let err = manage_iterations(&group.storage, &stray, &group.execution, true, false, false)
            .unwrap_err();
        assert!(matches!(err, EngineError::InvariantViolation(_)));
    }

    #[test]
    fn number_of_batches_falls_back_to_the_aggregate() {
        let group = Group::new(1);
        let report = TaskRun::new(group.aggregate_id, group.execution.id, "each")
            .with_full_state(State::new(StateType::Success));
        let tr = manage_iterations(&group.storage, &report, &group.execution, true, false, false)
            .unwrap();
        assert_eq!(tr.state.current(), StateType::Success);
    }

    #[rstest]
    #[case(&[(StateType::Success, 3)], false, false, StateType::Success)]
    #[case(&[(StateType::Failed, 1), (StateType::Killed, 1)], false, false, StateType::Failed)]
    #[case(&[(StateType::Failed, 1)], true, false, StateType::Warning)]
    #[case(&[(StateType::Failed, 1)], true, true, StateType::Success)]
    #[case(&[(StateType::Killed, 1), (StateType::Warning, 1)], true, true, StateType::Killed)]
    #[case(&[(StateType::Warning, 1)], false, false, StateType::Warning)]
    #[case(&[(StateType::Warning, 1)], false, true, StateType::Success)]
    #[case(&[(StateType::Failed, 0), (StateType::Success, 2)], false, false, StateType::Success)]
    fn terminal_state_table(
        #[case] counts: &[(StateType, i64)],
        #[case] allow_failure: bool,
        #[case] allow_warning: bool,
        #[case] expected: StateType,
    ) {
        let mut iterations = Iterations::default();
        for (state, count) in counts {
            iterations.set(*state, *count);
        }
        assert_eq!(find_terminal_state(&iterations, allow_failure, allow_warning), expected);
    }

    #[test]
    fn iterations_read_back_from_outputs() {
        let outputs = HashMap::from([(
            OUTPUT_ITERATIONS.to_string(),
            json!({ "CREATED": 2, "SUCCESS": -1 }),
        )]);
        let iterations = Iterations::from_outputs(&outputs).unwrap();
        assert_eq!(iterations.get(StateType::Created), 2);
        assert_eq!(iterations.get(StateType::Success), -1);
        assert_eq!(iterations.to_value(), json!({ "CREATED": 2, "SUCCESS": -1 }));

        let broken = HashMap::from([(OUTPUT_ITERATIONS.to_string(), json!({ "DONE": 1 }))]);
        assert!(Iterations::from_outputs(&broken).is_err());
    }
}

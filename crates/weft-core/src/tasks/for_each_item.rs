use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::{DelegationKind, DelegationOptions, ExecutableTask, SubflowId};
use crate::domain::state::StateType;
use crate::domain::task_run::TaskRun;

pub const OUTPUT_ITERATIONS: &str = "iterations";
pub const OUTPUT_NUMBER_OF_BATCHES: &str = "numberOfBatches";
pub const OUTPUT_SUBFLOW_OUTPUTS_BASE_URI: &str = "subflowOutputsBaseUri";

/// Splits `items` into batches and runs one child execution per batch.
///
/// All children report into one aggregate task-run whose outputs count how
/// many batches are in each state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForEachItem {
    pub id: String,
    #[serde(flatten)]
    pub target: SubflowId,
    pub items: Vec<Value>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(flatten)]
    pub options: DelegationOptions,
}

fn default_batch_size() -> usize {
    1
}

/// One batch: the task-run identity its child is bound to, plus its items.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch<'a> {
    pub task_run: TaskRun,
    pub items: &'a [Value],
}

impl ForEachItem {
    pub fn new(id: impl Into<String>, target: SubflowId, items: Vec<Value>) -> Self {
        Self {
            id: id.into(),
            target,
            items,
            batch_size: default_batch_size(),
            options: DelegationOptions::default(),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_options(mut self, options: DelegationOptions) -> Self {
        self.options = options;
        self
    }

    pub fn number_of_batches(&self) -> usize {
        self.items.len().div_ceil(self.batch_size.max(1))
    }

    /// Seeds the aggregate: every batch starts out CREATED.
    pub fn start_iterations(&self, aggregate: TaskRun) -> TaskRun {
        let n = self.number_of_batches();
        let mut iterations = serde_json::Map::new();
        iterations.insert(StateType::Created.to_string(), json!(n));

        aggregate.with_outputs(HashMap::from([
            (OUTPUT_NUMBER_OF_BATCHES.to_string(), json!(n)),
            (OUTPUT_ITERATIONS.to_string(), Value::Object(iterations)),
        ]))
    }

    /// One entry per batch; iterations are numbered from 1.
    pub fn batches<'a>(&'a self, aggregate: &TaskRun) -> Vec<Batch<'a>> {
        self.items
            .chunks(self.batch_size.max(1))
            .enumerate()
            .map(|(i, items)| Batch {
                task_run: aggregate.clone().with_iteration(Some(i as u32 + 1)),
                items,
            })
            .collect()
    }
}

impl ExecutableTask for ForEachItem {
    const TYPE: &'static str = "weft.flow.for_each_item.v1";
    const KIND: DelegationKind = DelegationKind::ForEachItem;

    fn id(&self) -> &str {
        &self.id
    }

    fn subflow_id(&self) -> &SubflowId {
        &self.target
    }

    fn options(&self) -> &DelegationOptions {
        &self.options
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ids::{ExecutionId, TaskRunId};
    use rstest::rstest;

    fn task(items: usize, batch_size: usize) -> ForEachItem {
        ForEachItem::new(
            "each",
            SubflowId::new("company.team", "child"),
            (0..items).map(|i| json!(i)).collect(),
        )
        .with_batch_size(batch_size)
    }

    #[rstest]
    #[case(0, 1, 0)]
    #[case(3, 1, 3)]
    #[case(5, 2, 3)]
    #[case(4, 2, 2)]
    #[case(4, 0, 4)]
    fn batch_count(#[case] items: usize, #[case] batch_size: usize, #[case] expected: usize) {
        assert_eq!(task(items, batch_size).number_of_batches(), expected);
    }

    #[test]
    fn start_iterations_marks_every_batch_created() {
        let aggregate = TaskRun::new(TaskRunId::random(), ExecutionId::random(), "each");
        let started = task(5, 2).start_iterations(aggregate);

        assert_eq!(started.outputs[OUTPUT_NUMBER_OF_BATCHES], json!(3));
        assert_eq!(started.outputs[OUTPUT_ITERATIONS], json!({ "CREATED": 3 }));
    }

    #[test]
    fn batches_share_the_aggregate_id_and_number_iterations_from_one() {
        let aggregate = TaskRun::new(TaskRunId::random(), ExecutionId::random(), "each");
        let task = task(5, 2);
        let batches = task.batches(&aggregate);

        assert_eq!(batches.len(), 3);
        assert!(batches.iter().all(|b| b.task_run.id == aggregate.id));
        assert_eq!(
            batches.iter().map(|b| b.task_run.iteration).collect::<Vec<_>>(),
            vec![Some(1), Some(2), Some(3)]
        );
        assert_eq!(batches[2].items, &[json!(4)]);
    }
}

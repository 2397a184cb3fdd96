#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use weft_core::app::{Engine, EngineBuilder, Reconciler};
use weft_core::config::EngineConfig;
use weft_core::domain::{EngineEvent, Execution, ExecutionId, Flow, TaskRunId};
use weft_core::impls::{InMemoryExecutionStore, InMemoryFlowRepository};

pub const NAMESPACE: &str = "company.team";

pub struct Harness {
    pub engine: Engine,
    pub flows: Arc<InMemoryFlowRepository>,
    pub store: Arc<InMemoryExecutionStore>,
}

pub async fn harness(config: EngineConfig) -> Harness {
    let flows = Arc::new(InMemoryFlowRepository::new());
    let store = Arc::new(InMemoryExecutionStore::new());
    flows.put(Flow::new(NAMESPACE, "parent")).await;
    flows.put(Flow::new(NAMESPACE, "child")).await;

    let engine = EngineBuilder::new(config)
        .with_flows(flows.clone())
        .with_execution_store(store.clone())
        .with_in_memory_defaults()
        .build()
        .unwrap();
    Harness {
        engine,
        flows,
        store,
    }
}

pub fn parent_execution() -> Execution {
    execution_of(&Flow::new(NAMESPACE, "parent"))
}

/// Applies `events` and every follow-up they cause, in order, and returns
/// the ids of the executions submitted along the way.
pub async fn drain(reconciler: &mut Reconciler, events: Vec<EngineEvent>) -> Vec<ExecutionId> {
    let mut pending: VecDeque<EngineEvent> = events.into();
    let mut submitted = Vec::new();
    while let Some(event) = pending.pop_front() {
        if let EngineEvent::Submit { execution } = &event {
            submitted.push(execution.id);
        }
        let follow_ups = reconciler.apply(event).await.unwrap();
        pending.extend(follow_ups);
    }
    submitted
}

pub async fn stored(store: &InMemoryExecutionStore, id: ExecutionId) -> Execution {
    use weft_core::ports::ExecutionStore;
    store.find_by_id(None, id).await.unwrap().unwrap()
}

pub async fn stored_task_run(
    store: &InMemoryExecutionStore,
    execution_id: ExecutionId,
    task_run_id: TaskRunId,
) -> weft_core::domain::TaskRun {
    stored(store, execution_id)
        .await
        .find_task_run_by_task_run_id(task_run_id)
        .cloned()
        .unwrap()
}

pub fn execution_of(flow: &Flow) -> Execution {
    Execution::new_execution(ExecutionId::random(), flow, HashMap::new(), Vec::new())
}

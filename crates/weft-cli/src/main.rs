use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;
use tokio::time::{Duration, sleep};
use tracing_subscriber::EnvFilter;

use weft_core::app::EngineBuilder;
use weft_core::config::EngineConfig;
use weft_core::domain::{
    EngineEvent, Execution, ExecutionId, Flow, FlowInput, StateType, TaskRun, TaskRunId,
};
use weft_core::impls::{InMemoryExecutionStore, InMemoryFlowRepository};
use weft_core::ports::ExecutionStore;
use weft_core::tasks::{DelegationOptions, ForEachItem, Subflow, SubflowId};

const NAMESPACE: &str = "demo.weft";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // (A) config: JSON file from the first argument, defaults otherwise
    let config = match std::env::args().nth(1) {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .init();

    // (B) build the engine on in-memory collaborators
    let flows = Arc::new(InMemoryFlowRepository::new());
    let store = Arc::new(InMemoryExecutionStore::new());
    flows.put(Flow::new(NAMESPACE, "orders")).await;
    flows
        .put(Flow::new(NAMESPACE, "ship").with_inputs(vec![FlowInput::optional(
            "batch",
            Some(json!("none")),
        )]))
        .await;

    let engine = EngineBuilder::new(config)
        .with_flows(flows.clone())
        .with_execution_store(store.clone())
        .with_in_memory_defaults()
        .build()?;
    let executor = engine.spawn_executor();

    // (C) submit the parent execution
    let parent = Execution::new_execution(
        ExecutionId::random(),
        &Flow::new(NAMESPACE, "orders"),
        HashMap::new(),
        Vec::new(),
    );
    executor.send(EngineEvent::Submit {
        execution: parent.clone(),
    })?;

    // (D) dispatch a ForEachItem (3 batches) and a Subflow
    let each = TaskRun::new(TaskRunId::random(), parent.id, "ship_each");
    executor.send(EngineEvent::DispatchSubflow {
        execution_id: parent.id,
        task: ForEachItem::new(
            "ship_each",
            SubflowId::new(NAMESPACE, "ship"),
            vec![json!("a"), json!("b"), json!("c"), json!("d"), json!("e")],
        )
        .with_batch_size(2)
        .into(),
        task_run: each.clone(),
    })?;

    let call = TaskRun::new(TaskRunId::random(), parent.id, "ship_one");
    executor.send(EngineEvent::DispatchSubflow {
        execution_id: parent.id,
        task: Subflow::new("ship_one", SubflowId::new(NAMESPACE, "ship"))
            .with_options(DelegationOptions {
                inputs: HashMap::from([(
                    "batch".to_string(),
                    json!("single {{ taskrun.id }}"),
                )]),
                ..DelegationOptions::default()
            })
            .into(),
        task_run: call.clone(),
    })?;

    // (E) once every child runs, finish each of them
    let children = wait_for_children(store.as_ref(), parent.id, 4).await?;
    for (i, child) in children.iter().enumerate() {
        let state = if i == 0 {
            StateType::Warning
        } else {
            StateType::Success
        };
        executor.send(EngineEvent::ExecutionStateChanged {
            execution_id: child.id,
            state,
        })?;
    }

    // (F) wait for both parent task-runs and print them
    let parent = wait_for_task_runs(store.as_ref(), parent.id, &[each.id, call.id]).await?;
    for task_run in &parent.task_run_list {
        println!(
            "task-run {} ({}): state={} outputs={}",
            task_run.task_id,
            task_run.id,
            task_run.state.current(),
            serde_json::to_string(&task_run.outputs)?
        );
    }

    executor.send(EngineEvent::ExecutionStateChanged {
        execution_id: parent.id,
        state: StateType::Success,
    })?;
    sleep(Duration::from_millis(50)).await;

    executor.shutdown_and_join().await;
    tracing::info!("demo finished");
    Ok(())
}

async fn wait_for_children(
    store: &InMemoryExecutionStore,
    parent: ExecutionId,
    n: usize,
) -> Result<Vec<Execution>, Box<dyn std::error::Error>> {
    loop {
        let children = store
            .find_children_by_trigger_execution_id(None, parent)
            .await?;
        if children.len() >= n && children.iter().all(|c| c.state.is_running()) {
            return Ok(children);
        }
        sleep(Duration::from_millis(20)).await;
    }
}

async fn wait_for_task_runs(
    store: &InMemoryExecutionStore,
    execution_id: ExecutionId,
    task_runs: &[TaskRunId],
) -> Result<Execution, Box<dyn std::error::Error>> {
    loop {
        if let Some(execution) = store.find_by_id(None, execution_id).await? {
            let done = task_runs.iter().all(|id| {
                execution
                    .find_task_run_by_task_run_id(*id)
                    .is_some_and(|tr| tr.state.is_terminated())
            });
            if done {
                return Ok(execution);
            }
        }
        sleep(Duration::from_millis(20)).await;
    }
}

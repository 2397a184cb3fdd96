//! Single-writer reconciliation step.
//!
//! A `Reconciler` owns a set of live executions and applies events to them
//! one at a time. It never blocks on other executions: whatever must happen
//! elsewhere (starting a child, notifying a parent, unqueuing the next
//! execution of a flow) is returned as follow-up events for the executor to
//! route to their owners.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Value, json};

use super::concurrency::{ConcurrencyLimiter, unqueue};
use super::iteration::manage_iterations;
use super::subflow::{
    SubflowDispatcher, SubflowRequest, run_variables, subflow_execution_result_from_child,
};
use crate::domain::task_run::OUTPUT_EXECUTION_ID;
use crate::domain::{
    Concurrency, EngineError, EngineEvent, EngineResult, ErrorKind, Execution, ExecutionId,
    FlowVariant, StateType, TaskRun, TaskRunId,
};
use crate::ports::{ExecutionStore, FlowCaller, FlowResolver, StorageContext};
use crate::tasks::for_each_item::{OUTPUT_ITERATIONS, OUTPUT_NUMBER_OF_BATCHES};
use crate::tasks::{DelegatingTask, ForEachItem, Subflow};

/// Collaborators shared by every reconciler of an engine.
pub struct EngineServices {
    pub dispatcher: SubflowDispatcher,
    pub limiter: ConcurrencyLimiter,
    pub flows: Arc<dyn FlowResolver>,
    pub executions: Arc<dyn ExecutionStore>,
    pub storage: Arc<dyn StorageContext>,
    /// Limit for flows that do not declare one.
    pub default_concurrency: Option<Concurrency>,
}

pub struct Reconciler {
    services: Arc<EngineServices>,
    /// Executions this reconciler is working on. Terminated executions with
    /// nothing left to wait on are evicted and reloaded from the store when
    /// an event needs them again.
    executions: HashMap<ExecutionId, Execution>,
}

impl Reconciler {
    pub fn new(services: Arc<EngineServices>) -> Self {
        Self {
            services,
            executions: HashMap::new(),
        }
    }

    /// Takes ownership of an execution that already exists (e.g. reloaded
    /// from the store).
    pub fn adopt(&mut self, execution: Execution) {
        self.executions.insert(execution.id, execution);
    }

    pub fn execution(&self, id: ExecutionId) -> Option<&Execution> {
        self.executions.get(&id)
    }

    pub async fn apply(&mut self, event: EngineEvent) -> EngineResult<Vec<EngineEvent>> {
        match event {
            EngineEvent::Submit { execution } => self.submit(execution).await,
            EngineEvent::Unqueue {
                execution_id,
                state,
            } => {
                let execution = unqueue(self.load(execution_id).await?, state)?;
                self.commit(execution).await
            }
            EngineEvent::ExecutionStateChanged {
                execution_id,
                state,
            } => {
                let execution = self.load(execution_id).await?;
                if execution.state.current() == state {
                    tracing::debug!(execution_id = %execution_id, state = %state, "execution already in state");
                    return Ok(Vec::new());
                }
                self.commit(execution.with_state(state)).await
            }
            EngineEvent::TaskRunChanged {
                execution_id,
                task_run,
            } => self.join_task_run(execution_id, task_run).await,
            EngineEvent::DispatchSubflow {
                execution_id,
                task,
                task_run,
            } => self.dispatch(execution_id, task, task_run).await,
            EngineEvent::ChildStateChanged {
                parent_execution_id,
                child,
            } => self.fold_child(parent_execution_id, child).await,
            EngineEvent::Restart { execution_id } => self.restart(execution_id).await,
        }
    }

    async fn load(&self, id: ExecutionId) -> EngineResult<Execution> {
        if let Some(execution) = self.executions.get(&id) {
            return Ok(execution.clone());
        }
        self.services
            .executions
            .load(id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("execution {id} does not exist")))
    }

    /// Persists `execution`, then keeps it while it may still receive events
    /// and evicts it otherwise.
    async fn save(&mut self, execution: Execution) -> EngineResult<()> {
        self.services.executions.save(execution.clone()).await?;
        if is_settled(&execution) {
            tracing::debug!(execution_id = %execution.id, "evicting settled execution");
            self.executions.remove(&execution.id);
        } else {
            self.adopt(execution);
        }
        Ok(())
    }

    async fn resolve_own_flow(&self, execution: &Execution) -> EngineResult<FlowVariant> {
        self.services
            .flows
            .find_by_id_from_task(
                execution.tenant_id.as_deref(),
                &execution.namespace,
                &execution.flow_id,
                Some(execution.flow_revision),
                FlowCaller {
                    tenant_id: execution.tenant_id.as_deref(),
                    namespace: &execution.namespace,
                    flow_id: &execution.flow_id,
                },
            )
            .await?
            .ok_or_else(|| {
                EngineError::NotFound(format!(
                    "flow '{}'.'{}' revision {} of execution {}",
                    execution.namespace, execution.flow_id, execution.flow_revision, execution.id
                ))
            })
    }

    /// Saves an execution whose state changed and derives the follow-ups:
    /// the next queued execution when a slot frees up, and a notification to
    /// the parent of a child execution.
    async fn commit(&mut self, execution: Execution) -> EngineResult<Vec<EngineEvent>> {
        self.save(execution.clone()).await?;
        tracing::info!(
            execution_id = %execution.id,
            state = %execution.state.current(),
            "execution state changed"
        );

        let mut events = Vec::new();
        if execution.state.is_terminated() {
            if let Some(next) = self.services.limiter.release(&execution).await {
                events.push(EngineEvent::Unqueue {
                    execution_id: next,
                    state: Some(StateType::Running),
                });
            }
        }
        if let Some(parent) = parent_of(&execution) {
            events.push(EngineEvent::ChildStateChanged {
                parent_execution_id: parent,
                child: execution,
            });
        }
        Ok(events)
    }

    async fn submit(&mut self, execution: Execution) -> EngineResult<Vec<EngineEvent>> {
        // a restarted child reports RESTARTED before it runs again
        let mut events = Vec::new();
        if execution.state.current() == StateType::Restarted {
            if let Some(parent) = parent_of(&execution) {
                events.push(EngineEvent::ChildStateChanged {
                    parent_execution_id: parent,
                    child: execution.clone(),
                });
            }
        }

        let concurrency = match self.resolve_own_flow(&execution).await {
            Ok(flow) => flow.flow().concurrency.or(self.services.default_concurrency),
            Err(EngineError::NotFound(_)) => self.services.default_concurrency,
            Err(e) => return Err(e),
        };
        let admitted = self.services.limiter.admit(execution, concurrency).await?;
        events.extend(self.commit(admitted).await?);
        Ok(events)
    }

    async fn join_task_run(
        &mut self,
        execution_id: ExecutionId,
        task_run: TaskRun,
    ) -> EngineResult<Vec<EngineEvent>> {
        let execution = self.load(execution_id).await?;
        if !execution.has_task_run_joinable(&task_run) {
            tracing::debug!(
                execution_id = %execution_id,
                task_run_id = %task_run.id,
                state = %task_run.state.current(),
                "ignoring stale task-run update"
            );
            return Ok(Vec::new());
        }

        // updates from workers do not carry the delegating task
        let mut task_run = task_run;
        if task_run.delegation.is_none() {
            task_run.delegation = execution
                .find_task_run_by_task_run_id(task_run.id)
                .and_then(|stored| stored.delegation.clone());
        }

        self.save(execution.with_task_run(task_run)).await?;
        Ok(Vec::new())
    }

    /// Launches the children of a delegating task-run. A dispatch the
    /// request itself makes impossible (missing, disabled or invalid flow,
    /// bad template) fails the task-run instead of leaving it running.
    async fn dispatch(
        &mut self,
        execution_id: ExecutionId,
        task: DelegatingTask,
        task_run: TaskRun,
    ) -> EngineResult<Vec<EngineEvent>> {
        let execution = self.load(execution_id).await?;
        let task_run = task_run.with_delegation(task.clone());

        let dispatched = match self.resolve_own_flow(&execution).await {
            Ok(flow) => match &task {
                DelegatingTask::Subflow(subflow) => {
                    self.dispatch_subflow(&execution, &flow, subflow, task_run.clone())
                        .await
                }
                DelegatingTask::ForEachItem(each) => {
                    self.dispatch_for_each_item(&execution, &flow, each, task_run.clone())
                        .await
                }
            },
            Err(error) => Err(error.into()),
        };

        let (task_run, events) = match dispatched {
            Ok(dispatched) => dispatched,
            Err(DispatchFailure { error, restarted })
                if matches!(error.kind(), ErrorKind::Rejected | ErrorKind::Missing) =>
            {
                let options = task.options();
                let state = StateType::fail(options.allow_failure, options.allow_warning);
                tracing::warn!(
                    execution_id = %execution_id,
                    task_run_id = %task_run.id,
                    state = %state,
                    error = %error,
                    "subflow dispatch failed"
                );
                // children restarted before the failure will never be submitted
                let events = restarted
                    .into_iter()
                    .map(|child| EngineEvent::ExecutionStateChanged {
                        execution_id: child,
                        state: StateType::Failed,
                    })
                    .collect();
                (task_run.with_state(state), events)
            }
            Err(failure) => return Err(failure.error),
        };

        self.save(execution.with_task_run(task_run)).await?;
        Ok(events)
    }

    async fn dispatch_subflow(
        &self,
        execution: &Execution,
        flow: &FlowVariant,
        task: &Subflow,
        task_run: TaskRun,
    ) -> Result<(TaskRun, Vec<EngineEvent>), DispatchFailure> {
        let variables = run_variables(execution, flow, &task_run);
        let request = SubflowRequest::for_task(execution, flow, task, &task_run, &variables);
        let dispatched = self.services.dispatcher.subflow_execution(request).await?;

        match dispatched {
            Some(subflow) => {
                let parent = subflow
                    .parent_task_run
                    .with_output(OUTPUT_EXECUTION_ID, json!(subflow.execution.id.to_string()));
                Ok((
                    parent,
                    vec![EngineEvent::Submit {
                        execution: subflow.execution,
                    }],
                ))
            }
            None => {
                // the previous child did not fail: fold it back as it stands
                let previous = match task_run.output_execution_id() {
                    Some(id) => {
                        self.services
                            .executions
                            .find_by_id(execution.tenant_id.as_deref(), id)
                            .await?
                    }
                    None => None,
                };
                let events = previous
                    .map(|child| EngineEvent::ChildStateChanged {
                        parent_execution_id: execution.id,
                        child,
                    })
                    .into_iter()
                    .collect();
                Ok((task_run, events))
            }
        }
    }

    async fn dispatch_for_each_item(
        &self,
        execution: &Execution,
        flow: &FlowVariant,
        task: &ForEachItem,
        task_run: TaskRun,
    ) -> Result<(TaskRun, Vec<EngineEvent>), DispatchFailure> {
        let aggregate = if task_run.outputs.contains_key(OUTPUT_ITERATIONS) {
            task_run
        } else {
            task.start_iterations(task_run)
        };

        if task.number_of_batches() == 0 {
            tracing::info!(
                execution_id = %execution.id,
                task_run_id = %aggregate.id,
                "nothing to iterate on"
            );
            return Ok((aggregate.with_state(StateType::Success), Vec::new()));
        }

        let mut children: Vec<Execution> = Vec::new();
        for batch in task.batches(&aggregate) {
            let mut variables = run_variables(execution, flow, &batch.task_run);
            variables["taskrun"]["items"] = Value::Array(batch.items.to_vec());

            let request =
                SubflowRequest::for_task(execution, flow, task, &batch.task_run, &variables);
            match self.services.dispatcher.subflow_execution(request).await {
                Ok(Some(subflow)) => children.push(subflow.execution),
                Ok(None) => {}
                Err(error) => {
                    return Err(DispatchFailure {
                        error,
                        restarted: children
                            .iter()
                            .filter(|child| child.state.current() == StateType::Restarted)
                            .map(|child| child.id)
                            .collect(),
                    });
                }
            }
        }

        let aggregate = if aggregate.state.current() == StateType::Running {
            aggregate
        } else {
            aggregate.with_state(StateType::Running)
        };
        let events = children
            .into_iter()
            .map(|execution| EngineEvent::Submit { execution })
            .collect();
        Ok((aggregate, events))
    }

    async fn fold_child(
        &mut self,
        parent_id: ExecutionId,
        child: Execution,
    ) -> EngineResult<Vec<EngineEvent>> {
        let Some(task_run_id) = child.trigger.as_ref().and_then(|t| t.parent_task_run_id()) else {
            return Err(EngineError::InvalidArgument(format!(
                "execution {} was not started by a task-run",
                child.id
            )));
        };

        let parent = self.load(parent_id).await?;
        let Some(task_run) = parent.find_task_run_by_task_run_id(task_run_id) else {
            tracing::warn!(
                execution_id = %parent_id,
                task_run_id = %task_run_id,
                child_execution_id = %child.id,
                "no task-run waiting for this child"
            );
            return Ok(Vec::new());
        };
        let Some(task) = task_run.delegation.clone() else {
            tracing::warn!(
                execution_id = %parent_id,
                task_run_id = %task_run_id,
                child_execution_id = %child.id,
                "task-run does not delegate to a subflow"
            );
            return Ok(Vec::new());
        };
        if task_run.state.is_terminated() {
            tracing::debug!(
                execution_id = %parent_id,
                task_run_id = %task_run_id,
                child_execution_id = %child.id,
                "delegating task-run already terminated"
            );
            return Ok(Vec::new());
        }

        let updated = match &task {
            DelegatingTask::ForEachItem(each) => {
                fold_iteration(self.services.storage.as_ref(), &parent, each, task_run_id, &child)?
            }
            DelegatingTask::Subflow(subflow) => {
                fold_subflow(&parent, subflow, task_run_id, &child)?
            }
        };
        let Some(updated) = updated else {
            return Ok(Vec::new());
        };

        if updated.state.is_terminated() {
            tracing::info!(
                execution_id = %parent_id,
                task_run_id = %task_run_id,
                state = %updated.state.current(),
                "delegating task-run terminated"
            );
        }

        self.save(parent.with_task_run(updated)).await?;
        Ok(Vec::new())
    }

    async fn restart(&mut self, execution_id: ExecutionId) -> EngineResult<Vec<EngineEvent>> {
        let execution = self.load(execution_id).await?;
        let restarted = self.services.executions.restart(execution, None).await?;

        let redispatch: Vec<EngineEvent> = restarted
            .task_run_list
            .iter()
            .filter(|tr| tr.state.current() == StateType::Restarted)
            .filter_map(|tr| {
                tr.delegation
                    .clone()
                    .map(|task| EngineEvent::DispatchSubflow {
                        execution_id,
                        task,
                        task_run: tr.clone(),
                    })
            })
            .collect();

        let mut events = self.commit(restarted).await?;
        events.push(EngineEvent::ExecutionStateChanged {
            execution_id,
            state: StateType::Running,
        });
        events.extend(redispatch);
        Ok(events)
    }
}

/// Why a dispatch stopped, with the children it had already restarted.
struct DispatchFailure {
    error: EngineError,
    restarted: Vec<ExecutionId>,
}

impl From<EngineError> for DispatchFailure {
    fn from(error: EngineError) -> Self {
        Self {
            error,
            restarted: Vec::new(),
        }
    }
}

/// Terminated, with no delegating task-run still waiting on a child.
fn is_settled(execution: &Execution) -> bool {
    execution.state.is_terminated()
        && execution
            .task_run_list
            .iter()
            .all(|tr| tr.delegation.is_none() || tr.state.is_terminated())
}

fn parent_of(execution: &Execution) -> Option<ExecutionId> {
    execution
        .trigger
        .as_ref()
        .and_then(|t| t.parent_execution_id())
}

/// Aggregate task-run after one batch child changed state; `None` for the
/// child's very first state, which the CREATED seed already accounts for.
fn fold_iteration(
    storage: &dyn StorageContext,
    parent: &Execution,
    task: &ForEachItem,
    aggregate_id: TaskRunId,
    child: &Execution,
) -> EngineResult<Option<TaskRun>> {
    if child.state.histories().len() < 2 {
        return Ok(None);
    }
    let iteration = child.trigger.as_ref().and_then(|t| t.task_run_iteration());
    let report = TaskRun::new(aggregate_id, parent.id, task.id.clone())
        .with_full_state(child.state.clone())
        .with_iteration(iteration)
        .with_output(OUTPUT_NUMBER_OF_BATCHES, json!(task.number_of_batches()));

    let options = &task.options;
    manage_iterations(
        storage,
        &report,
        parent,
        options.transmit_failed,
        options.allow_failure,
        options.allow_warning,
    )
    .map(Some)
}

/// Parent task-run once its child terminated; `None` while it runs or when
/// the child is not the one the task-run currently waits on.
fn fold_subflow(
    parent: &Execution,
    task: &Subflow,
    task_run_id: TaskRunId,
    child: &Execution,
) -> EngineResult<Option<TaskRun>> {
    let task_run = parent
        .find_task_run_by_task_run_id(task_run_id)
        .ok_or_else(|| {
            EngineError::invariant(format!(
                "task-run {task_run_id} waiting on {} is missing from execution {}",
                child.id, parent.id
            ))
        })?;
    if task_run
        .output_execution_id()
        .is_some_and(|expected| expected != child.id)
    {
        tracing::debug!(
            task_run_id = %task_run_id,
            child_execution_id = %child.id,
            "ignoring a child the task-run no longer waits on"
        );
        return Ok(None);
    }

    Ok(
        subflow_execution_result_from_child(&task.options, task_run.clone(), child).map(|result| {
            tracing::info!(
                execution_id = %parent.id,
                task_run_id = %task_run_id,
                child_execution_id = %result.execution_id,
                state = %result.state,
                "subflow execution result"
            );
            result.parent_task_run
        }),
    )
}

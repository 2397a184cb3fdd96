//! Subflow dispatch: launching, resuming and folding back child executions.
//!
//! A delegating task-run either gets a brand-new child execution, or (when
//! its parent execution was restarted) the child it launched before is
//! looked up and restarted if it failed, or left alone if it did not.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde_json::{Value, json};

use crate::domain::execution::{
    TRIGGER_EXECUTION_ID, TRIGGER_FLOW_ID, TRIGGER_FLOW_REVISION, TRIGGER_NAMESPACE,
    TRIGGER_TASK_RUN_ID, TRIGGER_TASK_RUN_ITERATION, TRIGGER_TASK_RUN_VALUE,
};
use crate::domain::label::{self, Label};
use crate::domain::task_run::OUTPUT_EXECUTION_ID;
use crate::domain::{
    EngineError, EngineResult, Execution, ExecutionTrigger, FlowCapability, FlowInput, StateType,
    SubflowExecution, SubflowExecutionResult, TaskRun, TaskRunAttempt,
};
use crate::ports::{
    ExecutionStore, FlowCaller, FlowResolver, IdGenerator, TemplateRenderer, TraceContext,
    TracePropagator,
};
use crate::tasks::{DelegationOptions, ExecutableTask, RestartBehavior};

/// Everything one dispatch needs to know about the parent side.
pub struct SubflowRequest<'a, T> {
    pub execution: &'a Execution,
    pub flow: &'a dyn FlowCapability,
    pub task: &'a T,
    pub task_run: &'a TaskRun,
    /// Input overrides; string values are templates.
    pub inputs: &'a HashMap<String, Value>,
    /// Extra child labels; keys and values are templates.
    pub labels: &'a [Label],
    pub inherit_labels: bool,
    pub schedule_date: Option<&'a str>,
    /// Variables templates are rendered against.
    pub variables: &'a Value,
}

impl<'a, T: ExecutableTask> SubflowRequest<'a, T> {
    /// Request using the overrides declared on the task itself.
    pub fn for_task(
        execution: &'a Execution,
        flow: &'a dyn FlowCapability,
        task: &'a T,
        task_run: &'a TaskRun,
        variables: &'a Value,
    ) -> Self {
        let options = task.options();
        Self {
            execution,
            flow,
            task,
            task_run,
            inputs: &options.inputs,
            labels: &options.labels,
            inherit_labels: options.inherit_labels,
            schedule_date: options.schedule_date.as_deref(),
            variables,
        }
    }
}

/// Template variables of a task-run: its execution, flow and own identity.
pub fn run_variables(execution: &Execution, flow: &dyn FlowCapability, task_run: &TaskRun) -> Value {
    json!({
        "execution": {
            "id": execution.id.to_string(),
            "originalId": execution.original_id.to_string(),
            "state": execution.state.current(),
        },
        "flow": {
            "namespace": flow.namespace(),
            "id": flow.id(),
            "revision": flow.revision(),
            "tenantId": flow.tenant_id(),
        },
        "taskrun": {
            "id": task_run.id.to_string(),
            "value": task_run.value,
            "iteration": task_run.iteration,
        },
        "inputs": execution.inputs,
        "labels": label::to_map(&execution.labels),
    })
}

pub struct SubflowDispatcher {
    flows: Arc<dyn FlowResolver>,
    executions: Arc<dyn ExecutionStore>,
    renderer: Arc<dyn TemplateRenderer>,
    tracer: Arc<dyn TracePropagator>,
    ids: Arc<dyn IdGenerator>,
}

impl SubflowDispatcher {
    pub fn new(
        flows: Arc<dyn FlowResolver>,
        executions: Arc<dyn ExecutionStore>,
        renderer: Arc<dyn TemplateRenderer>,
        tracer: Arc<dyn TracePropagator>,
        ids: Arc<dyn IdGenerator>,
    ) -> Self {
        Self {
            flows,
            executions,
            renderer,
            tracer,
            ids,
        }
    }

    /// Child execution to run for `request.task_run`, or `None` when the
    /// child launched before a restart did not fail and must not run again.
    ///
    /// Nothing is persisted here; the caller saves and starts the child.
    pub async fn subflow_execution<T: ExecutableTask>(
        &self,
        request: SubflowRequest<'_, T>,
    ) -> EngineResult<Option<SubflowExecution>> {
        let SubflowRequest {
            execution,
            task,
            task_run,
            ..
        } = request;

        if execution.is_restarted() && task.restart_behavior() == RestartBehavior::RetryFailed {
            if let Some(existing) = self.find_existing_child(execution, task, task_run).await? {
                if !existing.state.is_failed() {
                    tracing::info!(
                        execution_id = %execution.id,
                        task_run_id = %task_run.id,
                        child_execution_id = %existing.id,
                        child_state = %existing.state.current(),
                        "previous subflow execution did not fail, not relaunching it"
                    );
                    return Ok(None);
                }

                let mut restarted = self.executions.restart(existing, None).await?;
                self.tracer
                    .inject(&TraceContext::child_of(execution), &mut restarted);
                tracing::info!(
                    execution_id = %execution.id,
                    task_run_id = %task_run.id,
                    child_execution_id = %restarted.id,
                    "restarting failed subflow execution"
                );
                return Ok(Some(SubflowExecution {
                    parent_task: task.task_ref(),
                    parent_task_run: task_run.clone().with_state(StateType::Running),
                    execution: restarted,
                }));
            }
        }

        self.fresh_execution(request).await.map(Some)
    }

    /// The child this task-run launched before, when it can be told apart.
    async fn find_existing_child<T: ExecutableTask>(
        &self,
        execution: &Execution,
        task: &T,
        task_run: &TaskRun,
    ) -> EngineResult<Option<Execution>> {
        let tenant_id = execution.tenant_id.as_deref();

        if let Some(child_id) = task_run.output_execution_id() {
            if let Some(child) = self.executions.find_by_id(tenant_id, child_id).await? {
                return Ok(Some(child));
            }
        }

        let target = task.subflow_id();
        let task_run_id = Value::String(task_run.id.to_string());
        let value = task_run.value.clone().map(Value::String);
        let iteration = task_run.iteration.map(Value::from);

        let mut matches: Vec<Execution> = self
            .executions
            .find_children_by_trigger_execution_id(tenant_id, execution.id)
            .await?
            .into_iter()
            .filter(|child| child.namespace == target.namespace && child.flow_id == target.flow_id)
            .filter(|child| {
                let Some(trigger) = &child.trigger else {
                    return false;
                };
                trigger.id == task.id()
                    && trigger.variable(TRIGGER_TASK_RUN_ID) == Some(&task_run_id)
                    && trigger.variable(TRIGGER_TASK_RUN_VALUE) == value.as_ref()
                    && trigger.variable(TRIGGER_TASK_RUN_ITERATION) == iteration.as_ref()
            })
            .collect();

        if matches.len() != 1 {
            if matches.len() > 1 {
                tracing::warn!(
                    execution_id = %execution.id,
                    task_run_id = %task_run.id,
                    candidates = matches.len(),
                    "several previous subflow executions match, launching a new one"
                );
            }
            return Ok(None);
        }
        Ok(matches.pop())
    }

    async fn fresh_execution<T: ExecutableTask>(
        &self,
        request: SubflowRequest<'_, T>,
    ) -> EngineResult<SubflowExecution> {
        let SubflowRequest {
            execution,
            flow,
            task,
            task_run,
            inputs,
            labels,
            inherit_labels,
            schedule_date,
            variables,
        } = request;

        let target = task.subflow_id();
        let namespace = self.renderer.render(&target.namespace, variables)?;
        let flow_id = self.renderer.render(&target.flow_id, variables)?;

        let subflow = self
            .flows
            .find_by_id_from_task(
                execution.tenant_id.as_deref(),
                &namespace,
                &flow_id,
                target.revision,
                FlowCaller {
                    tenant_id: execution.tenant_id.as_deref(),
                    namespace: flow.namespace(),
                    flow_id: flow.id(),
                },
            )
            .await?
            .ok_or_else(|| {
                EngineError::NotFound(format!(
                    "unable to find flow '{namespace}'.'{flow_id}' with revision '{}'",
                    target.revision.unwrap_or(0)
                ))
            })?;

        if subflow.is_disabled() {
            return Err(EngineError::InvalidState(
                "cannot execute a flow which is disabled".to_string(),
            ));
        }
        if let Some(reason) = subflow.invalid_reason() {
            return Err(EngineError::InvalidState(format!(
                "cannot execute an invalid flow: {reason}"
            )));
        }

        let mut child_labels = if inherit_labels {
            execution.labels.clone()
        } else {
            label::system_labels(&execution.labels)
        };
        for extra in labels {
            child_labels.push(Label::new(
                self.renderer.render(&extra.key, variables)?,
                self.renderer.render(&extra.value, variables)?,
            ));
        }

        let mut trigger_variables = BTreeMap::from([
            (TRIGGER_EXECUTION_ID.to_string(), json!(execution.id.to_string())),
            (TRIGGER_NAMESPACE.to_string(), json!(flow.namespace())),
            (TRIGGER_FLOW_ID.to_string(), json!(flow.id())),
            (TRIGGER_FLOW_REVISION.to_string(), json!(flow.revision())),
            (TRIGGER_TASK_RUN_ID.to_string(), json!(task_run.id.to_string())),
        ]);
        if let Some(value) = &task_run.value {
            trigger_variables.insert(TRIGGER_TASK_RUN_VALUE.to_string(), json!(value));
        }
        if let Some(iteration) = task_run.iteration {
            trigger_variables.insert(TRIGGER_TASK_RUN_ITERATION.to_string(), json!(iteration));
        }

        let schedule_date = schedule_date
            .map(|template| self.renderer.render_date(template, variables))
            .transpose()?;

        let child_inputs = self.read_inputs(subflow.inputs(), inputs, variables)?;
        let mut child = Execution::new_execution(
            self.ids.generate_execution_id(),
            &subflow,
            child_inputs,
            child_labels,
        )
        .with_trigger(ExecutionTrigger {
            id: task.id().to_string(),
            trigger_type: T::TYPE.to_string(),
            variables: trigger_variables,
        })
        .with_schedule_date(schedule_date);

        self.tracer.inject(&TraceContext::child_of(execution), &mut child);

        tracing::info!(
            execution_id = %execution.id,
            task_run_id = %task_run.id,
            child_execution_id = %child.id,
            namespace = %child.namespace,
            flow_id = %child.flow_id,
            "subflow execution created"
        );

        Ok(SubflowExecution {
            parent_task: task.task_ref(),
            parent_task_run: task_run.clone().with_state(StateType::Running),
            execution: child,
        })
    }

    /// Values for the declared inputs of the child flow: the rendered
    /// override, else the declared default. Undeclared overrides are dropped.
    fn read_inputs(
        &self,
        declared: &[FlowInput],
        overrides: &HashMap<String, Value>,
        variables: &Value,
    ) -> EngineResult<HashMap<String, Value>> {
        let mut values = HashMap::with_capacity(declared.len());
        for input in declared {
            let value = match overrides.get(&input.id) {
                Some(Value::String(template)) => {
                    Some(Value::String(self.renderer.render(template, variables)?))
                }
                Some(other) => Some(other.clone()),
                None => input.default.clone(),
            };
            match value {
                Some(value) => {
                    values.insert(input.id.clone(), value);
                }
                None if input.required => {
                    return Err(EngineError::InvalidArgument(format!(
                        "missing required input '{}'",
                        input.id
                    )));
                }
                None => {}
            }
        }

        for key in overrides.keys().filter(|k| !declared.iter().any(|i| &i.id == *k)) {
            tracing::debug!(input = %key, "ignoring input not declared by the subflow");
        }
        Ok(values)
    }
}

/// Folds a terminated child into its parent task-run: one new attempt
/// carrying the parent's current state.
pub fn subflow_execution_result(parent_task_run: &TaskRun, child: &Execution) -> SubflowExecutionResult {
    let parent = parent_task_run
        .clone()
        .with_attempt(TaskRunAttempt::new(parent_task_run.state.clone()));
    SubflowExecutionResult {
        execution_id: child.id,
        state: parent_task_run.state.current(),
        parent_task_run: parent,
        outputs: HashMap::new(),
    }
}

/// State a parent task-run adopts once its child terminated.
///
/// Without `transmit_failed` the parent always succeeds. Otherwise a FAILED,
/// PAUSED, KILLED or WARNING child goes through the shared failure policy and
/// anything else is SUCCESS.
pub fn guess_state(
    child: &Execution,
    transmit_failed: bool,
    allow_failure: bool,
    allow_warning: bool,
) -> StateType {
    let current = child.state.current();
    let transmitted = matches!(
        current,
        StateType::Failed | StateType::Paused | StateType::Killed | StateType::Warning
    );
    if transmit_failed && transmitted {
        current.with_failure_policy(allow_failure, allow_warning)
    } else {
        StateType::Success
    }
}

/// Result for a parent task-run whose child reached a terminal state, or
/// `None` while the child is still going.
///
/// The parent task-run records the child id in its outputs and moves to the
/// state [`guess_state`] picks.
pub fn subflow_execution_result_from_child(
    options: &DelegationOptions,
    parent_task_run: TaskRun,
    child: &Execution,
) -> Option<SubflowExecutionResult> {
    if !child.state.is_terminated() {
        return None;
    }

    let state = guess_state(
        child,
        options.transmit_failed,
        options.allow_failure,
        options.allow_warning,
    );
    let parent = parent_task_run
        .with_output(OUTPUT_EXECUTION_ID, json!(child.id.to_string()))
        .with_state(state);

    let mut result = subflow_execution_result(&parent, child);
    result.outputs = parent.outputs.clone();
    Some(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ExecutionId, Flow, TaskRunId};
    use rstest::rstest;
    use std::collections::HashMap;

    fn child_in(state: StateType) -> Execution {
        let exec = Execution::new_execution(
            ExecutionId::random(),
            &Flow::new("ns", "child"),
            HashMap::new(),
            Vec::new(),
        );
        match state {
            StateType::Created => exec,
            other => exec.with_state(StateType::Running).with_state(other),
        }
    }

    #[rstest]
    #[case(StateType::Failed, false, false, false, StateType::Success)]
    #[case(StateType::Failed, true, false, false, StateType::Failed)]
    #[case(StateType::Failed, true, true, false, StateType::Warning)]
    #[case(StateType::Failed, true, true, true, StateType::Success)]
    #[case(StateType::Failed, true, false, true, StateType::Failed)]
    #[case(StateType::Warning, true, false, false, StateType::Warning)]
    #[case(StateType::Warning, true, false, true, StateType::Success)]
    #[case(StateType::Killed, true, true, true, StateType::Killed)]
    #[case(StateType::Paused, true, false, false, StateType::Paused)]
    #[case(StateType::Success, true, false, false, StateType::Success)]
    #[case(StateType::Cancelled, true, false, false, StateType::Success)]
    fn guess_state_table(
        #[case] child: StateType,
        #[case] transmit_failed: bool,
        #[case] allow_failure: bool,
        #[case] allow_warning: bool,
        #[case] expected: StateType,
    ) {
        assert_eq!(
            guess_state(&child_in(child), transmit_failed, allow_failure, allow_warning),
            expected
        );
    }

    #[test]
    fn result_appends_one_attempt_with_the_parent_state() {
        let child = child_in(StateType::Success);
        let parent = TaskRun::new(TaskRunId::random(), ExecutionId::random(), "call")
            .with_state(StateType::Running)
            .with_attempt(TaskRunAttempt::new(crate::domain::State::new(StateType::Running)));

        let result = subflow_execution_result(&parent, &child);
        assert_eq!(result.execution_id, child.id);
        assert_eq!(result.state, StateType::Running);
        assert_eq!(result.parent_task_run.attempts.len(), 2);
        assert_eq!(result.parent_task_run.attempts[1].state, parent.state);
        assert_eq!(parent.attempts.len(), 1);
    }

    #[test]
    fn result_from_child_waits_for_termination() {
        let parent = TaskRun::new(TaskRunId::random(), ExecutionId::random(), "call")
            .with_state(StateType::Running);
        let options = DelegationOptions::default();

        let running = child_in(StateType::Running);
        assert!(subflow_execution_result_from_child(&options, parent.clone(), &running).is_none());

        let failed = child_in(StateType::Failed);
        let result = subflow_execution_result_from_child(&options, parent, &failed).unwrap();
        assert_eq!(result.state, StateType::Failed);
        assert_eq!(result.parent_task_run.state.current(), StateType::Failed);
        assert_eq!(result.parent_task_run.output_execution_id(), Some(failed.id));
        assert_eq!(result.outputs[OUTPUT_EXECUTION_ID], json!(failed.id.to_string()));
    }
}

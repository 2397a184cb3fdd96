//! Events fed to the engine by the executor loop.
//!
//! Every event is routed by [`EngineEvent::routing_id`], so all events that
//! touch one execution are applied by one owner, one at a time.

use super::execution::Execution;
use super::ids::ExecutionId;
use super::state::StateType;
use super::task_run::TaskRun;
use crate::tasks::DelegatingTask;

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// A new execution asks to run; admission control decides whether it
    /// starts, waits in the queue, or is dropped.
    Submit { execution: Execution },

    /// A queued execution leaves the queue (RUNNING when `None`).
    Unqueue {
        execution_id: ExecutionId,
        state: Option<StateType>,
    },

    /// The execution itself changed state (e.g. terminated or was killed).
    ExecutionStateChanged {
        execution_id: ExecutionId,
        state: StateType,
    },

    /// A simple task-run reported progress.
    TaskRunChanged {
        execution_id: ExecutionId,
        task_run: TaskRun,
    },

    /// A task-run delegates to another flow.
    DispatchSubflow {
        execution_id: ExecutionId,
        task: DelegatingTask,
        task_run: TaskRun,
    },

    /// A child execution changed state; folded into its parent.
    ChildStateChanged {
        parent_execution_id: ExecutionId,
        child: Execution,
    },

    /// Restart a failed or paused execution.
    Restart { execution_id: ExecutionId },
}

impl EngineEvent {
    /// Id of the execution whose owner must apply this event.
    pub fn routing_id(&self) -> ExecutionId {
        match self {
            EngineEvent::Submit { execution } => execution.id,
            EngineEvent::ChildStateChanged {
                parent_execution_id,
                ..
            } => *parent_execution_id,
            EngineEvent::Unqueue { execution_id, .. }
            | EngineEvent::ExecutionStateChanged { execution_id, .. }
            | EngineEvent::TaskRunChanged { execution_id, .. }
            | EngineEvent::DispatchSubflow { execution_id, .. }
            | EngineEvent::Restart { execution_id } => *execution_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            EngineEvent::Submit { .. } => "submit",
            EngineEvent::Unqueue { .. } => "unqueue",
            EngineEvent::ExecutionStateChanged { .. } => "execution_state_changed",
            EngineEvent::TaskRunChanged { .. } => "task_run_changed",
            EngineEvent::DispatchSubflow { .. } => "dispatch_subflow",
            EngineEvent::ChildStateChanged { .. } => "child_state_changed",
            EngineEvent::Restart { .. } => "restart",
        }
    }
}

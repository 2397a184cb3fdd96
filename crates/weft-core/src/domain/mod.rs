//! Domain model: ids, states, task-runs, executions, flows, events, errors.

pub mod errors;
pub mod events;
pub mod execution;
pub mod flow;
pub mod ids;
pub mod label;
pub mod state;
pub mod subflow;
pub mod task_run;

pub use self::errors::{EngineError, EngineResult, ErrorKind};
pub use self::events::EngineEvent;
pub use self::execution::{Execution, ExecutionTrigger};
pub use self::flow::{Concurrency, ConcurrencyBehavior, Flow, FlowCapability, FlowInput, FlowVariant};
pub use self::ids::{ExecutionId, TaskRunId};
pub use self::label::Label;
pub use self::state::{History, State, StateType};
pub use self::subflow::{SubflowExecution, SubflowExecutionResult, TaskRef};
pub use self::task_run::{TaskRun, TaskRunAttempt};

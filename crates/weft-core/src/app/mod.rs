//! App - application layer
//!
//! Combines the ports into the engine's behavior.
//!
//! # Components
//! - **concurrency**: admission against flow concurrency limits, `unqueue`
//! - **subflow**: child execution dispatch and result folding
//! - **iteration**: for-each aggregate bookkeeping
//! - **Reconciler**: applies one event to the executions it owns
//! - **ShardedExecutor**: one reconciler per shard, events routed by execution id
//! - **EngineBuilder**: wiring and fail-fast validation

pub mod builder;
pub mod concurrency;
pub mod executor;
pub mod iteration;
pub mod reconciler;
pub mod subflow;

pub use self::builder::{BuildError, Engine, EngineBuilder};
pub use self::concurrency::{ConcurrencyLimiter, unqueue};
pub use self::executor::{Router, ShardedExecutor};
pub use self::iteration::{Iterations, find_terminal_state, manage_iterations};
pub use self::reconciler::{EngineServices, Reconciler};
pub use self::subflow::{
    SubflowDispatcher, SubflowRequest, guess_state, run_variables, subflow_execution_result,
    subflow_execution_result_from_child,
};

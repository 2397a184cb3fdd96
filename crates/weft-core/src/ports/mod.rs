//! Ports: the collaborators the engine talks to.
//!
//! Each trait hides an external system (flow repository, execution store,
//! tracing backend, template engine, output storage) so the engine can run
//! against in-memory implementations in tests and development.

pub mod clock;
pub mod execution_store;
pub mod flow_resolver;
pub mod id_generator;
pub mod storage;
pub mod template;
pub mod trace;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::execution_store::ExecutionStore;
pub use self::flow_resolver::{FlowCaller, FlowResolver};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::storage::{StorageContext, StorageGroup};
pub use self::template::{RenderError, TemplateRenderer};
pub use self::trace::{TraceContext, TracePropagator};

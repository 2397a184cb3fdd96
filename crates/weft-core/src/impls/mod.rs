//! Impls: in-memory and local implementations of the ports.
//!
//! Enough to run the engine in a single process (development, tests and the
//! CLI demo). Durable implementations belong in separate crates.

pub mod inmem_flows;
pub mod inmem_store;
pub mod storage;
pub mod template;
pub mod trace;

pub use self::inmem_flows::InMemoryFlowRepository;
pub use self::inmem_store::InMemoryExecutionStore;
pub use self::storage::LocalStorageContext;
pub use self::template::SimpleTemplateRenderer;
pub use self::trace::{NoopTracePropagator, W3cTracePropagator};

//! weft-core
//!
//! Execution-state reconciliation for a workflow engine: the execution and
//! task-run state machine, flow concurrency admission, subflow dispatch and
//! for-each iteration aggregation.
//!
//! # Modules
//! - **domain**: domain model (ids, state, execution, task_run, flow, label, errors, events)
//! - **tasks**: delegating task definitions (Subflow, ForEachItem)
//! - **ports**: collaborator traits (FlowResolver, ExecutionStore, TemplateRenderer, ...)
//! - **app**: reconciliation logic, executor and builder
//! - **impls**: in-memory implementations for development and tests
//! - **config**: `EngineConfig`

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod ports;
pub mod tasks;

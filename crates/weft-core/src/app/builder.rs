//! EngineBuilder - engine construction and wiring
//!
//! Every collaborator is a port. `build()` fails fast when one is missing
//! instead of failing on the first event that needs it.

use std::sync::Arc;

use super::concurrency::ConcurrencyLimiter;
use super::executor::ShardedExecutor;
use super::reconciler::{EngineServices, Reconciler};
use super::subflow::SubflowDispatcher;
use crate::config::EngineConfig;
use crate::impls::{
    InMemoryExecutionStore, InMemoryFlowRepository, LocalStorageContext, SimpleTemplateRenderer,
    W3cTracePropagator,
};
use crate::ports::{
    Clock, ExecutionStore, FlowResolver, IdGenerator, StorageContext, SystemClock,
    TemplateRenderer, TracePropagator, UlidGenerator,
};

/// Builds an [`Engine`].
///
/// # Example
/// ```ignore
/// let engine = EngineBuilder::new(EngineConfig::default())
///     .with_flows(flows)
///     .with_in_memory_defaults()
///     .build()?;
/// let executor = engine.spawn_executor();
/// ```
pub struct EngineBuilder {
    config: EngineConfig,
    flows: Option<Arc<dyn FlowResolver>>,
    executions: Option<Arc<dyn ExecutionStore>>,
    renderer: Option<Arc<dyn TemplateRenderer>>,
    tracer: Option<Arc<dyn TracePropagator>>,
    ids: Option<Arc<dyn IdGenerator>>,
    storage: Option<Arc<dyn StorageContext>>,
    clock: Option<Arc<dyn Clock>>,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Missing collaborator: {0}. Set it on the builder or call with_in_memory_defaults().")]
    MissingCollaborator(&'static str),
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            flows: None,
            executions: None,
            renderer: None,
            tracer: None,
            ids: None,
            storage: None,
            clock: None,
        }
    }

    pub fn with_flows(mut self, flows: Arc<dyn FlowResolver>) -> Self {
        self.flows = Some(flows);
        self
    }

    pub fn with_execution_store(mut self, executions: Arc<dyn ExecutionStore>) -> Self {
        self.executions = Some(executions);
        self
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn TemplateRenderer>) -> Self {
        self.renderer = Some(renderer);
        self
    }

    pub fn with_tracer(mut self, tracer: Arc<dyn TracePropagator>) -> Self {
        self.tracer = Some(tracer);
        self
    }

    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn with_storage(mut self, storage: Arc<dyn StorageContext>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Fills every collaborator not set yet with its in-process implementation.
    pub fn with_in_memory_defaults(mut self) -> Self {
        let clock = self
            .clock
            .get_or_insert_with(|| Arc::new(SystemClock))
            .clone();
        self.flows
            .get_or_insert_with(|| Arc::new(InMemoryFlowRepository::new()));
        self.executions
            .get_or_insert_with(|| Arc::new(InMemoryExecutionStore::new()));
        self.renderer
            .get_or_insert_with(|| Arc::new(SimpleTemplateRenderer::new()));
        self.tracer
            .get_or_insert_with(|| Arc::new(W3cTracePropagator));
        self.ids
            .get_or_insert_with(|| Arc::new(UlidGenerator::new(clock)));
        let base_uri = self.config.storage_base_uri.clone();
        self.storage
            .get_or_insert_with(|| Arc::new(LocalStorageContext::new(base_uri)));
        self
    }

    pub fn build(self) -> Result<Engine, BuildError> {
        let flows = self.flows.ok_or(BuildError::MissingCollaborator("flows"))?;
        let executions = self
            .executions
            .ok_or(BuildError::MissingCollaborator("execution store"))?;
        let renderer = self
            .renderer
            .ok_or(BuildError::MissingCollaborator("template renderer"))?;
        let tracer = self
            .tracer
            .ok_or(BuildError::MissingCollaborator("trace propagator"))?;
        let ids = self
            .ids
            .ok_or(BuildError::MissingCollaborator("id generator"))?;
        let storage = self
            .storage
            .ok_or(BuildError::MissingCollaborator("storage context"))?;
        let clock = self.clock.ok_or(BuildError::MissingCollaborator("clock"))?;

        let dispatcher = SubflowDispatcher::new(
            Arc::clone(&flows),
            Arc::clone(&executions),
            renderer,
            tracer,
            ids,
        );
        let services = EngineServices {
            dispatcher,
            limiter: ConcurrencyLimiter::new(),
            flows,
            executions,
            storage,
            default_concurrency: self.config.default_concurrency,
        };

        Ok(Engine {
            services: Arc::new(services),
            clock,
            config: self.config,
        })
    }
}

/// A wired engine. Cheap to keep around; executors are spawned from it.
pub struct Engine {
    services: Arc<EngineServices>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

impl Engine {
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn execution_store(&self) -> Arc<dyn ExecutionStore> {
        Arc::clone(&self.services.executions)
    }

    /// A standalone reconciler sharing this engine's collaborators.
    pub fn reconciler(&self) -> Reconciler {
        Reconciler::new(Arc::clone(&self.services))
    }

    pub fn spawn_executor(&self) -> ShardedExecutor {
        ShardedExecutor::spawn(
            self.config.shards,
            Arc::clone(&self.services),
            Arc::clone(&self.clock),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_with_in_memory_defaults() {
        let engine = EngineBuilder::new(EngineConfig::default())
            .with_in_memory_defaults()
            .build();
        assert!(engine.is_ok());
    }

    #[test]
    fn build_keeps_explicit_collaborators() {
        let store = Arc::new(InMemoryExecutionStore::new());
        let engine = EngineBuilder::new(EngineConfig::default())
            .with_execution_store(store.clone())
            .with_in_memory_defaults()
            .build()
            .unwrap();
        let store: Arc<dyn ExecutionStore> = store;
        assert!(Arc::ptr_eq(&engine.execution_store(), &store));
    }

    #[test]
    fn build_without_collaborators_fails() {
        let engine = EngineBuilder::new(EngineConfig::default()).build();
        assert!(matches!(
            engine,
            Err(BuildError::MissingCollaborator("flows"))
        ));
    }

    #[test]
    fn build_reports_the_first_missing_collaborator() {
        let engine = EngineBuilder::new(EngineConfig::default())
            .with_flows(Arc::new(InMemoryFlowRepository::new()))
            .build();
        assert!(matches!(
            engine,
            Err(BuildError::MissingCollaborator("execution store"))
        ));
    }
}

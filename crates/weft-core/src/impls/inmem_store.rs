//! In-memory ExecutionStore (development and tests).

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::domain::execution::TRIGGER_EXECUTION_ID;
use crate::domain::{EngineError, EngineResult, Execution, ExecutionId, Label, StateType};
use crate::ports::ExecutionStore;

#[derive(Debug, Default)]
pub struct InMemoryExecutionStore {
    executions: Mutex<HashMap<ExecutionId, Execution>>,
}

impl InMemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.executions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.executions.lock().await.is_empty()
    }

    pub async fn all(&self) -> Vec<Execution> {
        self.executions.lock().await.values().cloned().collect()
    }
}

fn same_tenant(execution: &Execution, tenant_id: Option<&str>) -> bool {
    execution.tenant_id.as_deref() == tenant_id
}

/// Restarted copy of `execution`: RESTARTED itself, every FAILED task-run
/// RESTARTED, and the `system.restarted=true` marker added once. The id and
/// the original id are kept.
fn restarted(execution: Execution, revision: Option<u32>) -> EngineResult<Execution> {
    if !execution.state.is_restartable() {
        return Err(EngineError::InvalidState(format!(
            "execution {} is {} and cannot be restarted",
            execution.id,
            execution.state.current()
        )));
    }

    let mut execution = execution.with_state(StateType::Restarted);
    if let Some(revision) = revision {
        execution.flow_revision = revision;
    }
    execution.task_run_list = std::mem::take(&mut execution.task_run_list)
        .into_iter()
        .map(|tr| {
            if tr.state.is_failed() {
                tr.with_state(StateType::Restarted)
            } else {
                tr
            }
        })
        .collect();

    let marker = Label::new(Label::RESTARTED, "true");
    if !execution.has_label(&marker) {
        let mut labels = execution.labels.clone();
        labels.push(marker);
        execution = execution.with_labels(labels);
    }
    Ok(execution)
}

#[async_trait]
impl ExecutionStore for InMemoryExecutionStore {
    async fn find_by_id(
        &self,
        tenant_id: Option<&str>,
        id: ExecutionId,
    ) -> EngineResult<Option<Execution>> {
        let executions = self.executions.lock().await;
        Ok(executions
            .get(&id)
            .filter(|e| same_tenant(e, tenant_id))
            .cloned())
    }

    async fn load(&self, id: ExecutionId) -> EngineResult<Option<Execution>> {
        Ok(self.executions.lock().await.get(&id).cloned())
    }

    async fn find_children_by_trigger_execution_id(
        &self,
        tenant_id: Option<&str>,
        parent: ExecutionId,
    ) -> EngineResult<Vec<Execution>> {
        let parent = Value::String(parent.to_string());
        let executions = self.executions.lock().await;
        let mut children: Vec<Execution> = executions
            .values()
            .filter(|e| same_tenant(e, tenant_id))
            .filter(|e| {
                e.trigger
                    .as_ref()
                    .and_then(|t| t.variable(TRIGGER_EXECUTION_ID))
                    == Some(&parent)
            })
            .cloned()
            .collect();
        children.sort_by_key(|e| e.id);
        Ok(children)
    }

    async fn restart(&self, execution: Execution, revision: Option<u32>) -> EngineResult<Execution> {
        let restarted = restarted(execution, revision)?;
        tracing::info!(
            execution_id = %restarted.id,
            namespace = %restarted.namespace,
            flow_id = %restarted.flow_id,
            "execution restarted"
        );
        self.executions
            .lock()
            .await
            .insert(restarted.id, restarted.clone());
        Ok(restarted)
    }

    async fn save(&self, execution: Execution) -> EngineResult<()> {
        self.executions.lock().await.insert(execution.id, execution);
        Ok(())
    }
}

//! In-memory flow repository implementing `FlowResolver`.
//!
//! Access control is namespace based: a caller may reach flows of its own
//! namespace, of any child namespace, and of namespaces explicitly allowed
//! with [`InMemoryFlowRepository::allow`].

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::domain::{EngineResult, FlowCapability, FlowVariant};
use crate::ports::{FlowCaller, FlowResolver};

type FlowKey = (Option<String>, String, String);

#[derive(Debug, Default)]
pub struct InMemoryFlowRepository {
    flows: RwLock<HashMap<FlowKey, Vec<FlowVariant>>>,
    allowed: RwLock<HashSet<(String, String)>>,
}

impl InMemoryFlowRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a revision; revisions of one flow are kept sorted.
    pub async fn put(&self, flow: impl Into<FlowVariant>) {
        let flow = flow.into();
        let key = (
            flow.tenant_id().map(str::to_string),
            flow.namespace().to_string(),
            FlowCapability::id(&flow).to_string(),
        );
        let mut flows = self.flows.write().await;
        let revisions = flows.entry(key).or_default();
        revisions.retain(|f| f.revision() != flow.revision());
        revisions.push(flow);
        revisions.sort_by_key(|f| f.revision());
    }

    /// Lets flows of `caller_namespace` call flows of `target_namespace`.
    pub async fn allow(&self, caller_namespace: &str, target_namespace: &str) {
        self.allowed
            .write()
            .await
            .insert((caller_namespace.to_string(), target_namespace.to_string()));
    }

    async fn is_allowed(&self, caller: &FlowCaller<'_>, namespace: &str) -> bool {
        namespace == caller.namespace
            || namespace.starts_with(&format!("{}.", caller.namespace))
            || self
                .allowed
                .read()
                .await
                .contains(&(caller.namespace.to_string(), namespace.to_string()))
    }
}

#[async_trait]
impl FlowResolver for InMemoryFlowRepository {
    async fn find_by_id_from_task(
        &self,
        tenant_id: Option<&str>,
        namespace: &str,
        flow_id: &str,
        revision: Option<u32>,
        caller: FlowCaller<'_>,
    ) -> EngineResult<Option<FlowVariant>> {
        if caller.tenant_id != tenant_id || !self.is_allowed(&caller, namespace).await {
            tracing::debug!(
                namespace,
                flow_id,
                caller_namespace = caller.namespace,
                caller_flow_id = caller.flow_id,
                "flow lookup denied"
            );
            return Ok(None);
        }

        let key = (
            tenant_id.map(str::to_string),
            namespace.to_string(),
            flow_id.to_string(),
        );
        let flows = self.flows.read().await;
        let Some(revisions) = flows.get(&key) else {
            return Ok(None);
        };
        let found = match revision {
            Some(revision) => revisions.iter().find(|f| f.revision() == revision),
            None => revisions.last(),
        };
        Ok(found.cloned())
    }
}

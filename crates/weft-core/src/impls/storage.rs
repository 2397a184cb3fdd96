//! Local storage context: deterministic URIs under a configured base.

use crate::ports::{StorageContext, StorageGroup};

#[derive(Debug, Clone)]
pub struct LocalStorageContext {
    base_uri: String,
}

impl LocalStorageContext {
    pub fn new(base_uri: impl Into<String>) -> Self {
        let mut base_uri = base_uri.into();
        if !base_uri.ends_with('/') {
            base_uri.push('/');
        }
        Self { base_uri }
    }
}

impl StorageContext for LocalStorageContext {
    /// `<base><tenant/>?<namespace as path>/<flow>/executions/<exec>/tasks/<task>/<taskrun>`
    fn base_uri_for(&self, group: &StorageGroup) -> String {
        let tenant = group
            .tenant_id
            .as_deref()
            .map(|t| format!("{t}/"))
            .unwrap_or_default();
        format!(
            "{}{}{}/{}/executions/{}/tasks/{}/{}",
            self.base_uri,
            tenant,
            group.namespace.replace('.', "/"),
            group.flow_id,
            group.execution_id.as_ulid(),
            group.task_id,
            group.task_run_id.as_ulid(),
        )
    }
}

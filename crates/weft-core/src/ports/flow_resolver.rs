//! FlowResolver port: namespace-aware flow lookup.

use async_trait::async_trait;

use crate::domain::{EngineResult, FlowVariant};

/// The flow asking for the lookup. Implementations use it to decide whether
/// the caller may reach the target namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowCaller<'a> {
    pub tenant_id: Option<&'a str>,
    pub namespace: &'a str,
    pub flow_id: &'a str,
}

#[async_trait]
pub trait FlowResolver: Send + Sync {
    /// Latest revision when `revision` is `None`. `Ok(None)` when no such
    /// flow exists or the caller may not see it.
    async fn find_by_id_from_task(
        &self,
        tenant_id: Option<&str>,
        namespace: &str,
        flow_id: &str,
        revision: Option<u32>,
        caller: FlowCaller<'_>,
    ) -> EngineResult<Option<FlowVariant>>;
}

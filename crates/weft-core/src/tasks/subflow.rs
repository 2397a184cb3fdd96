use serde::{Deserialize, Serialize};

use super::{DelegationKind, DelegationOptions, ExecutableTask, SubflowId};

/// Runs one execution of another flow and waits for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subflow {
    pub id: String,
    #[serde(flatten)]
    pub target: SubflowId,
    #[serde(flatten)]
    pub options: DelegationOptions,
}

impl Subflow {
    pub fn new(id: impl Into<String>, target: SubflowId) -> Self {
        Self {
            id: id.into(),
            target,
            options: DelegationOptions::default(),
        }
    }

    pub fn with_options(mut self, options: DelegationOptions) -> Self {
        self.options = options;
        self
    }
}

impl ExecutableTask for Subflow {
    const TYPE: &'static str = "weft.flow.subflow.v1";
    const KIND: DelegationKind = DelegationKind::Subflow;

    fn id(&self) -> &str {
        &self.id
    }

    fn subflow_id(&self) -> &SubflowId {
        &self.target
    }

    fn options(&self) -> &DelegationOptions {
        &self.options
    }
}

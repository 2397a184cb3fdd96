//! Flow definitions as seen by the engine.
//!
//! A flow reaches the engine in one of several shapes ([`FlowVariant`]); the
//! engine only ever needs the small [`FlowCapability`] view of it.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::label::Label;

/// Declared input of a flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowInput {
    pub id: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl FlowInput {
    pub fn required(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            required: true,
            default: None,
        }
    }

    pub fn optional(id: impl Into<String>, default: Option<Value>) -> Self {
        Self {
            id: id.into(),
            required: false,
            default,
        }
    }
}

/// What happens to a new execution when its flow is at its limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConcurrencyBehavior {
    Queue,
    Cancel,
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Concurrency {
    pub limit: u32,
    pub behavior: ConcurrencyBehavior,
}

/// A fully typed flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flow {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    pub namespace: String,
    pub id: String,
    #[serde(default = "first_revision")]
    pub revision: u32,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub inputs: Vec<FlowInput>,
    #[serde(default)]
    pub labels: Vec<Label>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<Concurrency>,
}

fn first_revision() -> u32 {
    1
}

impl Flow {
    pub fn new(namespace: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            tenant_id: None,
            namespace: namespace.into(),
            id: id.into(),
            revision: first_revision(),
            disabled: false,
            inputs: Vec::new(),
            labels: Vec::new(),
            concurrency: None,
        }
    }

    pub fn with_inputs(mut self, inputs: Vec<FlowInput>) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_concurrency(mut self, concurrency: Concurrency) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    pub fn with_revision(mut self, revision: u32) -> Self {
        self.revision = revision;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.disabled = true;
        self
    }
}

/// The shapes a flow lookup can return.
#[derive(Debug, Clone, PartialEq)]
pub enum FlowVariant {
    Typed(Flow),
    /// Typed flow plus the raw source it was parsed from.
    WithSource { flow: Flow, source: String },
    /// Placeholder for a flow whose source failed to parse or validate.
    WithException {
        flow: Flow,
        source: String,
        exception: String,
    },
    /// Untyped flow: the engine only relies on its identity.
    Generic { flow: Flow, raw: Value },
}

/// The view of a flow the dispatch engine relies on.
pub trait FlowCapability: Send + Sync {
    fn tenant_id(&self) -> Option<&str>;
    fn namespace(&self) -> &str;
    fn id(&self) -> &str;
    fn revision(&self) -> u32;
    fn is_disabled(&self) -> bool;
    /// Parse or validation error for invalid-flow placeholders.
    fn invalid_reason(&self) -> Option<&str>;
    fn inputs(&self) -> &[FlowInput];
}

impl FlowCapability for Flow {
    fn tenant_id(&self) -> Option<&str> {
        self.tenant_id.as_deref()
    }

    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn revision(&self) -> u32 {
        self.revision
    }

    fn is_disabled(&self) -> bool {
        self.disabled
    }

    fn invalid_reason(&self) -> Option<&str> {
        None
    }

    fn inputs(&self) -> &[FlowInput] {
        &self.inputs
    }
}

impl FlowVariant {
    pub fn flow(&self) -> &Flow {
        match self {
            FlowVariant::Typed(flow)
            | FlowVariant::WithSource { flow, .. }
            | FlowVariant::WithException { flow, .. }
            | FlowVariant::Generic { flow, .. } => flow,
        }
    }
}

impl From<Flow> for FlowVariant {
    fn from(flow: Flow) -> Self {
        FlowVariant::Typed(flow)
    }
}

impl FlowCapability for FlowVariant {
    fn tenant_id(&self) -> Option<&str> {
        self.flow().tenant_id()
    }

    fn namespace(&self) -> &str {
        self.flow().namespace()
    }

    fn id(&self) -> &str {
        FlowCapability::id(self.flow())
    }

    fn revision(&self) -> u32 {
        self.flow().revision
    }

    fn is_disabled(&self) -> bool {
        self.flow().disabled
    }

    fn invalid_reason(&self) -> Option<&str> {
        match self {
            FlowVariant::WithException { exception, .. } => Some(exception),
            _ => None,
        }
    }

    fn inputs(&self) -> &[FlowInput] {
        &self.flow().inputs
    }
}

//! Tasks that delegate their work to another flow.
//!
//! A delegating task is declared in the parent flow and launches child
//! executions of a target flow. [`Subflow`] launches exactly one child;
//! [`ForEachItem`] splits its items into batches and launches one child per
//! batch, tracking them through a single aggregate task-run.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::label::Label;
use crate::domain::subflow::TaskRef;

pub mod for_each_item;
pub mod subflow;

pub use self::for_each_item::ForEachItem;
pub use self::subflow::Subflow;

/// What to do with an existing child when the parent execution is restarted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RestartBehavior {
    /// Restart the previous child if it failed, leave it alone otherwise.
    #[default]
    RetryFailed,
    /// Always launch a new child.
    NewExecution,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelegationKind {
    Subflow,
    ForEachItem,
}

/// Target flow of a delegation. `namespace` and `flow_id` are templates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubflowId {
    pub namespace: String,
    pub flow_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<u32>,
}

impl SubflowId {
    pub fn new(namespace: impl Into<String>, flow_id: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            flow_id: flow_id.into(),
            revision: None,
        }
    }
}

/// Settings shared by every delegating task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DelegationOptions {
    /// Input overrides; string values are rendered as templates.
    pub inputs: HashMap<String, Value>,
    /// Extra labels for the child; keys and values are templates.
    pub labels: Vec<Label>,
    pub inherit_labels: bool,
    /// Whether a failed child fails the parent task-run.
    pub transmit_failed: bool,
    pub allow_failure: bool,
    pub allow_warning: bool,
    pub restart_behavior: RestartBehavior,
    /// Date template; the child is held until then.
    pub schedule_date: Option<String>,
}

impl Default for DelegationOptions {
    fn default() -> Self {
        Self {
            inputs: HashMap::new(),
            labels: Vec::new(),
            inherit_labels: false,
            transmit_failed: true,
            allow_failure: false,
            allow_warning: false,
            restart_behavior: RestartBehavior::RetryFailed,
            schedule_date: None,
        }
    }
}

/// A task that runs another flow.
///
/// ```ignore
/// impl ExecutableTask for Subflow {
///     const TYPE: &'static str = "weft.flow.subflow.v1";
///     const KIND: DelegationKind = DelegationKind::Subflow;
///     ...
/// }
/// ```
pub trait ExecutableTask: Serialize + DeserializeOwned + Send + Sync + 'static {
    const TYPE: &'static str;
    const KIND: DelegationKind;

    fn id(&self) -> &str;

    fn subflow_id(&self) -> &SubflowId;

    fn options(&self) -> &DelegationOptions;

    fn restart_behavior(&self) -> RestartBehavior {
        self.options().restart_behavior
    }

    fn task_ref(&self) -> TaskRef {
        TaskRef {
            id: self.id().to_string(),
            task_type: Self::TYPE.to_string(),
        }
    }
}

/// Any delegating task, as stored by the engine while its children run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DelegatingTask {
    #[serde(rename = "weft.flow.subflow.v1")]
    Subflow(Subflow),
    #[serde(rename = "weft.flow.for_each_item.v1")]
    ForEachItem(ForEachItem),
}

impl DelegatingTask {
    pub fn id(&self) -> &str {
        match self {
            DelegatingTask::Subflow(t) => t.id(),
            DelegatingTask::ForEachItem(t) => t.id(),
        }
    }

    pub fn kind(&self) -> DelegationKind {
        match self {
            DelegatingTask::Subflow(_) => Subflow::KIND,
            DelegatingTask::ForEachItem(_) => ForEachItem::KIND,
        }
    }

    pub fn options(&self) -> &DelegationOptions {
        match self {
            DelegatingTask::Subflow(t) => t.options(),
            DelegatingTask::ForEachItem(t) => t.options(),
        }
    }
}

impl From<Subflow> for DelegatingTask {
    fn from(task: Subflow) -> Self {
        DelegatingTask::Subflow(task)
    }
}

impl From<ForEachItem> for DelegatingTask {
    fn from(task: ForEachItem) -> Self {
        DelegatingTask::ForEachItem(task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_defaults_transmit_failures() {
        let options: DelegationOptions = serde_json::from_str("{}").unwrap();
        assert!(options.transmit_failed);
        assert!(!options.inherit_labels);
        assert_eq!(options.restart_behavior, RestartBehavior::RetryFailed);
    }

    #[test]
    fn delegating_task_is_tagged_by_type() {
        let task: DelegatingTask = serde_json::from_value(serde_json::json!({
            "type": "weft.flow.subflow.v1",
            "id": "call",
            "namespace": "company.team",
            "flowId": "child",
            "restartBehavior": "NEW_EXECUTION"
        }))
        .unwrap();

        assert_eq!(task.id(), "call");
        assert_eq!(task.kind(), DelegationKind::Subflow);
        assert_eq!(task.options().restart_behavior, RestartBehavior::NewExecution);
    }
}

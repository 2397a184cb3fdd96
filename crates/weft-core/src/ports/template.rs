//! TemplateRenderer port.
//!
//! Everything a delegating task declares as a template (target namespace,
//! flow id, input overrides, labels, schedule date) is rendered through this
//! port against the variables of the current task-run.

use chrono::{DateTime, Utc};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RenderError {
    #[error("unknown template variable '{0}'")]
    UnknownVariable(String),

    #[error("unterminated expression in '{0}'")]
    Unterminated(String),

    #[error("'{value}' is not a date: {reason}")]
    InvalidDate { value: String, reason: String },
}

pub trait TemplateRenderer: Send + Sync {
    fn render(&self, template: &str, variables: &Value) -> Result<String, RenderError>;

    fn render_date(&self, template: &str, variables: &Value) -> Result<DateTime<Utc>, RenderError>;
}

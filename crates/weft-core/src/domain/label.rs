//! Execution labels.
//!
//! Labels are an ordered list of key/value pairs where duplicate keys are
//! allowed. Keys under [`Label::SYSTEM_PREFIX`] are reserved for the engine.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Label {
    pub key: String,
    pub value: String,
}

impl Label {
    pub const SYSTEM_PREFIX: &'static str = "system.";

    pub const CORRELATION_ID: &'static str = "system.correlationId";
    pub const USERNAME: &'static str = "system.username";
    pub const APP: &'static str = "system.app";
    pub const READ_ONLY: &'static str = "system.readOnly";
    pub const RESTARTED: &'static str = "system.restarted";
    pub const REPLAY: &'static str = "system.replay";
    pub const REPLAYED: &'static str = "system.replayed";
    pub const SIMULATED_EXECUTION: &'static str = "system.simulatedExecution";
    pub const TEST: &'static str = "system.test";

    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn is_system(&self) -> bool {
        self.key.starts_with(Self::SYSTEM_PREFIX)
    }

    /// Parses `key:value`. Anything else yields `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        let mut parts = raw.split(':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(key), Some(value), None) => Some(Self::new(key, value)),
            _ => None,
        }
    }
}

/// Flat key/value view. When a key repeats, the last value wins.
pub fn to_map(labels: &[Label]) -> HashMap<String, String> {
    labels
        .iter()
        .map(|l| (l.key.clone(), l.value.clone()))
        .collect()
}

/// One label per key, positioned at the key's first occurrence and carrying
/// its last value.
pub fn deduplicate(labels: &[Label]) -> Vec<Label> {
    let mut out: Vec<Label> = Vec::with_capacity(labels.len());
    for label in labels {
        match out.iter_mut().find(|l| l.key == label.key) {
            Some(existing) => existing.value = label.value.clone(),
            None => out.push(label.clone()),
        }
    }
    out
}

pub fn system_labels(labels: &[Label]) -> Vec<Label> {
    labels.iter().filter(|l| l.is_system()).cloned().collect()
}

pub fn excluding_system(labels: &[Label]) -> Vec<Label> {
    labels.iter().filter(|l| !l.is_system()).cloned().collect()
}

/// True when every label of `required` is present in `labels`.
pub fn contains_all(labels: &[Label], required: &[Label]) -> bool {
    required.iter().all(|r| labels.contains(r))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<Label> {
        vec![
            Label::new("env", "dev"),
            Label::new(Label::CORRELATION_ID, "c-1"),
            Label::new("team", "data"),
            Label::new("env", "prod"),
        ]
    }

    #[test]
    fn to_map_keeps_last_value() {
        let map = to_map(&sample());
        assert_eq!(map.len(), 3);
        assert_eq!(map["env"], "prod");
    }

    #[test]
    fn deduplicate_keeps_first_position_and_last_value() {
        let deduped = deduplicate(&sample());
        assert_eq!(
            deduped,
            vec![
                Label::new("env", "prod"),
                Label::new(Label::CORRELATION_ID, "c-1"),
                Label::new("team", "data"),
            ]
        );
    }

    #[test]
    fn system_split() {
        let labels = sample();
        assert_eq!(system_labels(&labels), vec![Label::new(Label::CORRELATION_ID, "c-1")]);
        assert_eq!(excluding_system(&labels).len(), 3);
        assert!(Label::new(Label::RESTARTED, "true").is_system());
    }

    #[test]
    fn contains_all_checks_pairs() {
        let labels = sample();
        assert!(contains_all(&labels, &[Label::new("team", "data")]));
        assert!(!contains_all(&labels, &[Label::new("team", "ops")]));
        assert!(contains_all(&labels, &[]));
    }

    #[test]
    fn parse_key_value() {
        assert_eq!(Label::parse("a:b"), Some(Label::new("a", "b")));
        assert_eq!(Label::parse("a"), None);
        assert_eq!(Label::parse("a:b:c"), None);
    }
}

//! Engine configuration, read from a JSON file.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::domain::Concurrency;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    /// Number of single-writer executor workers.
    pub shards: usize,
    /// Default tracing filter, overridden by `RUST_LOG`.
    pub log_level: String,
    /// Prefix of the storage URIs handed out to for-each children.
    pub storage_base_uri: String,
    /// Applied to flows that do not declare a limit.
    pub default_concurrency: Option<Concurrency>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            shards: 4,
            log_level: "info".to_string(),
            storage_base_uri: "weft:///".to_string(),
            default_concurrency: None,
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ConcurrencyBehavior;

    #[test]
    fn empty_object_gives_defaults() {
        let config = EngineConfig::from_json_str("{}").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.shards, 4);
    }

    #[test]
    fn partial_config_keeps_other_defaults() {
        let config = EngineConfig::from_json_str(
            r#"{"shards": 2, "defaultConcurrency": {"limit": 3, "behavior": "QUEUE"}}"#,
        )
        .unwrap();
        assert_eq!(config.shards, 2);
        assert_eq!(config.log_level, "info");
        assert_eq!(
            config.default_concurrency,
            Some(Concurrency {
                limit: 3,
                behavior: ConcurrencyBehavior::Queue
            })
        );
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        let err = EngineConfig::from_json_str("{shards: 2").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = EngineConfig::load("/nonexistent/weft/config.json").unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}

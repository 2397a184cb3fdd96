//! Domain identifiers (strongly-typed IDs).
//!
//! IDs are ULIDs wrapped in a phantom-typed `Id<T>`: they sort by creation
//! time, can be generated on any node without coordination, and an
//! `ExecutionId` can never be passed where a `TaskRunId` is expected.
//!
//! The `Display` form carries a per-type prefix (`exec-…`, `taskrun-…`) and
//! is the form stored in trigger variables and task-run outputs, so `FromStr`
//! accepts exactly that form back.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;
use ulid::Ulid;

/// Marker trait for each ID kind.
pub trait IdMarker: Send + Sync + 'static {
    /// Prefix used by `Display` / `FromStr` (e.g. "exec-").
    fn prefix() -> &'static str;
}

/// Generic ID type. `T` only exists at compile time.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    /// Fresh id from the current time and thread-local randomness.
    /// Engine code goes through `IdGenerator` instead so the clock is injectable.
    pub fn random() -> Self {
        Self::from_ulid(Ulid::new())
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }

    /// Stable shard index in `0..shards`.
    pub fn shard(&self, shards: usize) -> usize {
        if shards == 0 {
            return 0;
        }
        (self.ulid.0 % shards as u128) as usize
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

/// Error returned when an id string is malformed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdParseError {
    #[error("id '{value}' does not start with '{prefix}'")]
    MissingPrefix { value: String, prefix: &'static str },

    #[error("id '{0}' is not a valid ULID")]
    InvalidUlid(String),
}

impl<T: IdMarker> FromStr for Id<T> {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s
            .strip_prefix(T::prefix())
            .ok_or_else(|| IdParseError::MissingPrefix {
                value: s.to_string(),
                prefix: T::prefix(),
            })?;
        Ulid::from_string(raw)
            .map(Self::from_ulid)
            .map_err(|_| IdParseError::InvalidUlid(s.to_string()))
    }
}

// ========================================
// Marker types
// ========================================

/// Marker for executions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Execution {}

impl IdMarker for Execution {
    fn prefix() -> &'static str {
        "exec-"
    }
}

/// Marker for task-runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TaskRun {}

impl IdMarker for TaskRun {
    fn prefix() -> &'static str {
        "taskrun-"
    }
}

/// Identifier of an Execution (one run of one flow).
pub type ExecutionId = Id<Execution>;

/// Identifier of a TaskRun (one run of one task inside an execution).
pub type TaskRunId = Id<TaskRun>;

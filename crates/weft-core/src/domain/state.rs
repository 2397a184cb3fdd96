//! Lifecycle state of an execution or a task-run.
//!
//! A [`State`] is the current [`StateType`] plus the ordered history of every
//! type it went through. Transitions go through [`State::with_state`], which
//! consumes the old value and hands back one owning an extended history, so
//! two live values never share (and mutate) one history.
//!
//! State transitions (typical):
//! - CREATED -> RUNNING -> SUCCESS | WARNING | FAILED | KILLING -> KILLED
//! - CREATED -> QUEUED -> RUNNING | CANCELLED | FAILED
//! - FAILED -> RESTARTED -> RUNNING -> ...
//! - RUNNING -> PAUSED -> RESTARTED -> RUNNING -> ...

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use super::errors::EngineError;

/// The closed set of lifecycle stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StateType {
    Created,
    Running,
    Paused,
    Restarted,
    Killing,
    Success,
    Warning,
    Failed,
    Killed,
    Cancelled,
    Queued,
    Retrying,
    Retried,
    Skipped,
    Breakpoint,
}

impl StateType {
    pub const ALL: [StateType; 15] = [
        StateType::Created,
        StateType::Running,
        StateType::Paused,
        StateType::Restarted,
        StateType::Killing,
        StateType::Success,
        StateType::Warning,
        StateType::Failed,
        StateType::Killed,
        StateType::Cancelled,
        StateType::Queued,
        StateType::Retrying,
        StateType::Retried,
        StateType::Skipped,
        StateType::Breakpoint,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StateType::Created => "CREATED",
            StateType::Running => "RUNNING",
            StateType::Paused => "PAUSED",
            StateType::Restarted => "RESTARTED",
            StateType::Killing => "KILLING",
            StateType::Success => "SUCCESS",
            StateType::Warning => "WARNING",
            StateType::Failed => "FAILED",
            StateType::Killed => "KILLED",
            StateType::Cancelled => "CANCELLED",
            StateType::Queued => "QUEUED",
            StateType::Retrying => "RETRYING",
            StateType::Retried => "RETRIED",
            StateType::Skipped => "SKIPPED",
            StateType::Breakpoint => "BREAKPOINT",
        }
    }

    pub fn is_terminated(self) -> bool {
        matches!(
            self,
            StateType::Failed
                | StateType::Warning
                | StateType::Success
                | StateType::Killed
                | StateType::Cancelled
                | StateType::Retried
                | StateType::Skipped
        )
    }

    pub fn is_terminated_no_fail(self) -> bool {
        matches!(
            self,
            StateType::Warning | StateType::Success | StateType::Retried | StateType::Skipped
        )
    }

    pub fn is_created(self) -> bool {
        matches!(self, StateType::Created | StateType::Restarted)
    }

    pub fn is_running(self) -> bool {
        matches!(self, StateType::Running | StateType::Killing)
    }

    pub fn is_failed(self) -> bool {
        self == StateType::Failed
    }

    pub fn is_paused(self) -> bool {
        self == StateType::Paused
    }

    pub fn is_queued(self) -> bool {
        self == StateType::Queued
    }

    pub fn is_breakpoint(self) -> bool {
        self == StateType::Breakpoint
    }

    pub fn is_retrying(self) -> bool {
        matches!(self, StateType::Retrying | StateType::Retried)
    }

    pub fn is_success(self) -> bool {
        self == StateType::Success
    }

    pub fn is_killed(self) -> bool {
        self == StateType::Killed
    }

    /// Types that end an execution.
    pub fn terminated_types() -> Vec<StateType> {
        Self::ALL.into_iter().filter(|t| t.is_terminated()).collect()
    }

    /// Types of an execution that still occupies a slot (running or about to).
    pub fn running_types() -> Vec<StateType> {
        Self::ALL
            .into_iter()
            .filter(|t| t.is_running() || t.is_created())
            .collect()
    }

    /// Softens a failure outcome according to the task's tolerance flags.
    ///
    /// - FAILED becomes WARNING when `allow_failure`, and SUCCESS when
    ///   `allow_warning` as well.
    /// - WARNING becomes SUCCESS when `allow_warning`.
    /// - Every other type is returned untouched.
    ///
    /// This is the single failure policy shared by [`StateType::fail`], subflow
    /// state guessing and iteration aggregation.
    pub fn with_failure_policy(self, allow_failure: bool, allow_warning: bool) -> StateType {
        match self {
            StateType::Failed if allow_failure => {
                StateType::Warning.with_failure_policy(allow_failure, allow_warning)
            }
            StateType::Warning if allow_warning => StateType::Success,
            other => other,
        }
    }

    /// Final type of a failing task: SUCCESS if both flags are set, WARNING if
    /// only `allow_failure` is, FAILED otherwise.
    pub fn fail(allow_failure: bool, allow_warning: bool) -> StateType {
        StateType::Failed.with_failure_policy(allow_failure, allow_warning)
    }
}

impl fmt::Display for StateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StateType {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StateType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| EngineError::InvalidArgument(format!("unknown state type '{s}'")))
    }
}

/// One entry of a state history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct History {
    pub state: StateType,
    pub date: DateTime<Utc>,
}

impl History {
    pub fn new(state: StateType, date: DateTime<Utc>) -> Self {
        Self { state, date }
    }
}

/// Current lifecycle stage plus its append-only history.
///
/// Invariants:
/// - `histories` is never empty.
/// - `histories.last().state == current`.
/// - history dates are non-decreasing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawState")]
pub struct State {
    current: StateType,
    histories: Vec<History>,
}

#[derive(Deserialize)]
struct RawState {
    current: StateType,
    histories: Vec<History>,
}

impl TryFrom<RawState> for State {
    type Error = EngineError;

    fn try_from(raw: RawState) -> Result<Self, Self::Error> {
        State::of(raw.current, raw.histories)
    }
}

impl Default for State {
    fn default() -> Self {
        Self::new(StateType::Created)
    }
}

impl State {
    /// New state of the given type, stamped now.
    pub fn new(state: StateType) -> Self {
        Self::new_at(state, Utc::now())
    }

    pub fn new_at(state: StateType, at: DateTime<Utc>) -> Self {
        Self {
            current: state,
            histories: vec![History::new(state, at)],
        }
    }

    /// Rebuilds a state from a stored history.
    pub fn of(current: StateType, histories: Vec<History>) -> Result<Self, EngineError> {
        let Some(last) = histories.last() else {
            return Err(EngineError::InvalidArgument(
                "a state history cannot be empty".to_string(),
            ));
        };
        if last.state != current {
            return Err(EngineError::InvalidArgument(format!(
                "last history entry is {} but current state is {current}",
                last.state
            )));
        }
        if histories.windows(2).any(|w| w[1].date < w[0].date) {
            return Err(EngineError::InvalidArgument(
                "state history dates must be non-decreasing".to_string(),
            ));
        }
        Ok(Self { current, histories })
    }

    pub fn current(&self) -> StateType {
        self.current
    }

    pub fn histories(&self) -> &[History] {
        &self.histories
    }

    /// Transitions to `state`, stamped now.
    pub fn with_state(self, state: StateType) -> State {
        self.with_state_at(state, Utc::now())
    }

    /// Transitions to `state`, stamped `at` (clamped so dates never go back).
    ///
    /// A self-transition is a logged no-op that returns `self` unchanged.
    pub fn with_state_at(mut self, state: StateType, at: DateTime<Utc>) -> State {
        if self.current == state {
            tracing::warn!(state = %state, "can't change state, already {state}");
            return self;
        }

        let at = at.max(self.max_date());
        self.histories.push(History::new(state, at));
        self.current = state;
        self
    }

    /// Fresh CREATED state keeping only the original creation timestamp.
    pub fn reset(&self) -> State {
        State::new_at(StateType::Created, self.min_date())
    }

    /// Type of the entry before the current one, if any.
    pub fn previous(&self) -> Option<StateType> {
        let len = self.histories.len();
        (len >= 2).then(|| self.histories[len - 2].state)
    }

    /// Elapsed time from creation to the last transition, or to now while
    /// the history holds a single entry.
    pub fn duration(&self) -> TimeDelta {
        self.duration_at(Utc::now())
    }

    pub fn duration_at(&self, now: DateTime<Utc>) -> TimeDelta {
        let end = if self.histories.len() > 1 {
            self.max_date()
        } else {
            now
        };
        end - self.min_date()
    }

    /// `HH:MM:SS.mmm`
    pub fn human_duration(&self) -> String {
        let millis = self.duration().num_milliseconds().max(0);
        format!(
            "{:02}:{:02}:{:02}.{:03}",
            millis / 3_600_000,
            (millis / 60_000) % 60,
            (millis / 1_000) % 60,
            millis % 1_000
        )
    }

    pub fn start_date(&self) -> DateTime<Utc> {
        self.min_date()
    }

    /// Date of the last transition, only once terminated or paused.
    pub fn end_date(&self) -> Option<DateTime<Utc>> {
        (self.is_terminated() || self.is_paused()).then(|| self.max_date())
    }

    pub fn min_date(&self) -> DateTime<Utc> {
        self.histories
            .first()
            .map(|h| h.date)
            .unwrap_or_else(Utc::now)
    }

    pub fn max_date(&self) -> DateTime<Utc> {
        self.histories
            .last()
            .map(|h| h.date)
            .unwrap_or_else(Utc::now)
    }

    pub fn is_terminated(&self) -> bool {
        self.current.is_terminated()
    }

    pub fn is_terminated_no_fail(&self) -> bool {
        self.current.is_terminated_no_fail()
    }

    pub fn is_running(&self) -> bool {
        self.current.is_running()
    }

    pub fn is_created(&self) -> bool {
        self.current.is_created()
    }

    pub fn is_failed(&self) -> bool {
        self.current.is_failed()
    }

    pub fn is_paused(&self) -> bool {
        self.current.is_paused()
    }

    pub fn is_breakpoint(&self) -> bool {
        self.current.is_breakpoint()
    }

    pub fn is_queued(&self) -> bool {
        self.current.is_queued()
    }

    pub fn is_retrying(&self) -> bool {
        self.current.is_retrying()
    }

    pub fn is_success(&self) -> bool {
        self.current.is_success()
    }

    pub fn is_restartable(&self) -> bool {
        self.is_failed() || self.is_paused()
    }

    pub fn is_resumable(&self) -> bool {
        self.is_paused() || self.is_retrying() || self.is_created()
    }

    /// RESTARTED right after a PAUSED.
    pub fn is_resuming_after_pause(&self) -> bool {
        self.current == StateType::Restarted && self.previous().is_some_and(StateType::is_paused)
    }

    /// RESTARTED right after a FAILED.
    pub fn failed_then_restarted(&self) -> bool {
        self.current == StateType::Restarted && self.previous().is_some_and(StateType::is_failed)
    }
}

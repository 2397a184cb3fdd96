//! Flow-level concurrency admission.
//!
//! - `unqueue` takes a QUEUED execution out of the queue.
//! - `ConcurrencyLimiter` counts running executions per flow and decides, at
//!   submission time, whether a new execution runs, waits, or is dropped.

use std::collections::{HashMap, HashSet, VecDeque};

use tokio::sync::Mutex;

use crate::domain::{
    Concurrency, ConcurrencyBehavior, EngineError, EngineResult, Execution, ExecutionId, StateType,
};

const UNQUEUE_TARGETS: [StateType; 3] = [StateType::Running, StateType::Cancelled, StateType::Failed];

/// Moves a QUEUED execution to `state` (RUNNING when `None`).
///
/// Only RUNNING, CANCELLED and FAILED are accepted targets.
pub fn unqueue(execution: Execution, state: Option<StateType>) -> EngineResult<Execution> {
    if !execution.state.is_queued() {
        return Err(EngineError::InvalidState(
            "only a QUEUED execution can be unqueued".to_string(),
        ));
    }

    let state = state.unwrap_or(StateType::Running);
    if !UNQUEUE_TARGETS.contains(&state) {
        return Err(EngineError::InvalidArgument(format!(
            "an execution can only be unqueued to RUNNING, CANCELLED or FAILED, not {state}"
        )));
    }

    tracing::info!(execution_id = %execution.id, state = %state, "execution unqueued");
    Ok(execution.with_state(state))
}

type FlowKey = (Option<String>, String, String);

fn flow_key(execution: &Execution) -> FlowKey {
    (
        execution.tenant_id.clone(),
        execution.namespace.clone(),
        execution.flow_id.clone(),
    )
}

#[derive(Debug, Default)]
struct Slots {
    running: HashSet<ExecutionId>,
    queued: VecDeque<ExecutionId>,
    limit: u32,
}

/// Running/queued bookkeeping for every flow with a concurrency limit.
#[derive(Debug, Default)]
pub struct ConcurrencyLimiter {
    slots: Mutex<HashMap<FlowKey, Slots>>,
}

impl ConcurrencyLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transitions a new execution according to its flow's limit: RUNNING
    /// while under the limit, otherwise QUEUED, CANCELLED or FAILED depending
    /// on the configured behavior. Flows without a limit always run.
    pub async fn admit(
        &self,
        execution: Execution,
        concurrency: Option<Concurrency>,
    ) -> EngineResult<Execution> {
        let Some(concurrency) = concurrency else {
            return Ok(execution.with_state(StateType::Running));
        };

        let mut slots = self.slots.lock().await;
        let flow = slots.entry(flow_key(&execution)).or_default();
        flow.limit = concurrency.limit;

        if (flow.running.len() as u32) < concurrency.limit {
            flow.running.insert(execution.id);
            return Ok(execution.with_state(StateType::Running));
        }

        let state = match concurrency.behavior {
            ConcurrencyBehavior::Queue => {
                flow.queued.push_back(execution.id);
                StateType::Queued
            }
            ConcurrencyBehavior::Cancel => StateType::Cancelled,
            ConcurrencyBehavior::Fail => StateType::Failed,
        };
        tracing::info!(
            execution_id = %execution.id,
            flow_id = %execution.flow_id,
            limit = concurrency.limit,
            state = %state,
            "flow concurrency limit reached"
        );
        Ok(execution.with_state(state))
    }

    /// Frees the slot held by a terminated execution and hands it to the
    /// oldest queued execution of the same flow, whose id is returned so the
    /// caller can unqueue it.
    pub async fn release(&self, execution: &Execution) -> Option<ExecutionId> {
        let mut slots = self.slots.lock().await;
        let flow = slots.get_mut(&flow_key(execution))?;

        flow.queued.retain(|id| *id != execution.id);
        if !flow.running.remove(&execution.id) {
            return None;
        }
        if (flow.running.len() as u32) >= flow.limit {
            return None;
        }

        let next = flow.queued.pop_front()?;
        flow.running.insert(next);
        Some(next)
    }

    pub async fn running(&self, execution: &Execution) -> usize {
        self.slots
            .lock()
            .await
            .get(&flow_key(execution))
            .map_or(0, |f| f.running.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Flow;
    use rstest::rstest;
    use std::collections::HashMap;

    fn execution() -> Execution {
        Execution::new_execution(
            ExecutionId::random(),
            &Flow::new("company.team", "limited"),
            HashMap::new(),
            Vec::new(),
        )
    }

    fn queued() -> Execution {
        execution().with_state(StateType::Queued)
    }

    #[rstest]
    #[case(None, StateType::Running)]
    #[case(Some(StateType::Running), StateType::Running)]
    #[case(Some(StateType::Cancelled), StateType::Cancelled)]
    #[case(Some(StateType::Failed), StateType::Failed)]
    fn unqueue_to_allowed_targets(#[case] target: Option<StateType>, #[case] expected: StateType) {
        let exec = queued();
        let before = exec.state.histories().len();
        let out = unqueue(exec, target).unwrap();
        assert_eq!(out.state.current(), expected);
        assert_eq!(out.state.histories().len(), before + 1);
    }

    #[rstest]
    #[case(StateType::Skipped)]
    #[case(StateType::Success)]
    #[case(StateType::Paused)]
    fn unqueue_rejects_other_targets(#[case] target: StateType) {
        let err = unqueue(queued(), Some(target)).unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument(_)));
    }

    #[rstest]
    #[case(StateType::Created)]
    #[case(StateType::Running)]
    #[case(StateType::Success)]
    fn unqueue_requires_queued(#[case] current: StateType) {
        let exec = execution().with_state(current);
        let err = unqueue(exec, None).unwrap_err();
        assert!(matches!(err, EngineError::InvalidState(_)));
    }

    #[rstest]
    #[case(ConcurrencyBehavior::Queue, StateType::Queued)]
    #[case(ConcurrencyBehavior::Cancel, StateType::Cancelled)]
    #[case(ConcurrencyBehavior::Fail, StateType::Failed)]
    #[tokio::test]
    async fn admit_at_limit_follows_behavior(
        #[case] behavior: ConcurrencyBehavior,
        #[case] expected: StateType,
    ) {
        let limiter = ConcurrencyLimiter::new();
        let concurrency = Some(Concurrency { limit: 1, behavior });

        let first = limiter.admit(execution(), concurrency).await.unwrap();
        assert_eq!(first.state.current(), StateType::Running);

        let second = limiter.admit(execution(), concurrency).await.unwrap();
        assert_eq!(second.state.current(), expected);
        assert_eq!(limiter.running(&first).await, 1);
    }

    #[tokio::test]
    async fn admit_without_limit_runs() {
        let limiter = ConcurrencyLimiter::new();
        let exec = limiter.admit(execution(), None).await.unwrap();
        assert_eq!(exec.state.current(), StateType::Running);
    }

    #[tokio::test]
    async fn release_hands_the_slot_to_the_oldest_queued() {
        let limiter = ConcurrencyLimiter::new();
        let concurrency = Some(Concurrency {
            limit: 1,
            behavior: ConcurrencyBehavior::Queue,
        });

        let running = limiter.admit(execution(), concurrency).await.unwrap();
        let q1 = limiter.admit(execution(), concurrency).await.unwrap();
        let q2 = limiter.admit(execution(), concurrency).await.unwrap();

        assert_eq!(limiter.release(&running).await, Some(q1.id));
        assert_eq!(limiter.running(&running).await, 1);

        let q1 = unqueue(q1, None).unwrap();
        assert_eq!(limiter.release(&q1).await, Some(q2.id));
        assert_eq!(limiter.release(&q1).await, None);
    }

    #[tokio::test]
    async fn release_of_a_queued_execution_drops_it_from_the_queue() {
        let limiter = ConcurrencyLimiter::new();
        let concurrency = Some(Concurrency {
            limit: 1,
            behavior: ConcurrencyBehavior::Queue,
        });

        let running = limiter.admit(execution(), concurrency).await.unwrap();
        let killed = limiter.admit(execution(), concurrency).await.unwrap();
        assert_eq!(limiter.release(&killed).await, None);
        assert_eq!(limiter.release(&running).await, None);
    }
}

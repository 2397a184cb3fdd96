//! IdGenerator port.
//!
//! Ids are ULIDs whose timestamp part comes from the injected `Clock`, so a
//! `FixedClock` yields ids with a deterministic timestamp (the random part
//! still differs).

use ulid::Ulid;

use crate::domain::ids::{ExecutionId, TaskRunId};
use crate::ports::Clock;

pub trait IdGenerator: Send + Sync {
    fn generate_execution_id(&self) -> ExecutionId;

    fn generate_task_run_id(&self) -> TaskRunId;
}

pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }

    fn next(&self) -> Ulid {
        let timestamp_ms = self.clock.now().timestamp_millis().max(0) as u64;
        Ulid::from_parts(timestamp_ms, rand::random())
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_execution_id(&self) -> ExecutionId {
        ExecutionId::from(self.next())
    }

    fn generate_task_run_id(&self) -> TaskRunId {
        TaskRunId::from(self.next())
    }
}

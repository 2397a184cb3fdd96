//! Sharded single-writer executor.
//!
//! Every execution belongs to exactly one shard (`ExecutionId::shard`). A
//! shard is one tokio task draining its own channel into its own
//! [`Reconciler`], so events of one execution are applied strictly in order
//! while different executions proceed in parallel.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::reconciler::{EngineServices, Reconciler};
use crate::domain::{EngineError, EngineEvent, EngineResult, ErrorKind};
use crate::ports::Clock;

/// Sends events to the shard owning them.
#[derive(Clone)]
pub struct Router {
    shards: Arc<Vec<mpsc::UnboundedSender<EngineEvent>>>,
    clock: Arc<dyn Clock>,
}

impl Router {
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Enqueues `event` on its owner's shard. A `Submit` scheduled in the
    /// future is held back until its schedule date.
    pub fn send(&self, event: EngineEvent) -> EngineResult<()> {
        if let EngineEvent::Submit { execution } = &event {
            if let Some(at) = execution.schedule_date {
                let now = self.clock.now();
                if at > now {
                    let delay = (at - now).to_std().unwrap_or_default();
                    tracing::debug!(
                        execution_id = %execution.id,
                        schedule_date = %at,
                        "holding scheduled execution"
                    );
                    let router = self.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        if let Err(e) = router.deliver(event) {
                            tracing::warn!(error = %e, "dropping scheduled execution");
                        }
                    });
                    return Ok(());
                }
            }
        }
        self.deliver(event)
    }

    fn deliver(&self, event: EngineEvent) -> EngineResult<()> {
        let shard = event.routing_id().shard(self.shards.len());
        self.shards[shard].send(event).map_err(|e| {
            EngineError::InvalidState(format!(
                "shard {shard} is shut down, dropping {}",
                e.0.name()
            ))
        })
    }
}

/// Executor handle.
/// - `request_shutdown()` stops every shard
/// - `shutdown_and_join()` also waits for every shard to exit
pub struct ShardedExecutor {
    router: Router,
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl ShardedExecutor {
    /// Spawn `shards` workers (at least one), each owning a fresh reconciler.
    pub fn spawn(shards: usize, services: Arc<EngineServices>, clock: Arc<dyn Clock>) -> Self {
        let shards = shards.max(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let (senders, receivers): (Vec<_>, Vec<_>) =
            (0..shards).map(|_| mpsc::unbounded_channel()).unzip();
        let router = Router {
            shards: Arc::new(senders),
            clock,
        };

        let mut joins = Vec::with_capacity(shards);
        for (shard_id, rx) in receivers.into_iter().enumerate() {
            let reconciler = Reconciler::new(Arc::clone(&services));
            let router = router.clone();
            let mut shutdown = shutdown_rx.clone();

            joins.push(tokio::spawn(async move {
                shard_loop(shard_id, reconciler, rx, router, &mut shutdown).await;
            }));
        }

        tracing::info!(shards, "executor started");
        Self {
            router,
            shutdown_tx,
            joins,
        }
    }

    pub fn router(&self) -> Router {
        self.router.clone()
    }

    pub fn send(&self, event: EngineEvent) -> EngineResult<()> {
        self.router.send(event)
    }

    /// Stops every shard once its current event is applied. Events still in
    /// the channels are dropped.
    pub fn request_shutdown(&self) {
        // receivers may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for j in self.joins {
            let _ = j.await;
        }
        tracing::info!("executor stopped");
    }
}

async fn shard_loop(
    shard_id: usize,
    mut reconciler: Reconciler,
    mut rx: mpsc::UnboundedReceiver<EngineEvent>,
    router: Router,
    shutdown_rx: &mut watch::Receiver<bool>,
) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let event = tokio::select! {
            changed = shutdown_rx.changed() => {
                // sender dropped: nobody can stop us any more, stop now
                if changed.is_err() {
                    break;
                }
                continue;
            }
            event = rx.recv() => event,
        };
        let Some(event) = event else {
            break;
        };

        let name = event.name();
        let execution_id = event.routing_id();
        match reconciler.apply(event).await {
            Ok(follow_ups) => {
                for follow_up in follow_ups {
                    if let Err(e) = router.send(follow_up) {
                        tracing::warn!(shard_id, error = %e, "follow-up event dropped");
                    }
                }
            }
            Err(e) => match e.kind() {
                ErrorKind::Rejected | ErrorKind::Missing => {
                    tracing::warn!(shard_id, event = name, execution_id = %execution_id, error = %e, "event rejected");
                }
                ErrorKind::Corruption | ErrorKind::Collaborator => {
                    tracing::error!(shard_id, event = name, execution_id = %execution_id, error = %e, "event failed");
                }
            },
        }
    }
    tracing::debug!(shard_id, "shard stopped");
}

// FIFO settlement queue and the background worker that drains it.
//
// Completions that could not settle inline are queued here; a periodic sweep
// also re-queues every match the database still lists as pending, which is
// how settlements interrupted by a crash get repaired.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::task::JoinHandle;

use crate::db::Database;
use crate::metrics;
use crate::settlement::Settler;
use crate::worker_pool::WorkerPool;

/// Upper bound on matches pulled from the database per sweep.
const SWEEP_BATCH: i64 = 100;

#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub depth: usize,
    pub in_flight: usize,
}

#[derive(Debug, Default)]
struct Inner {
    order: VecDeque<String>,
    /// Everything queued or being settled; a match id appears at most once.
    members: HashSet<String>,
}

/// Thread-safe FIFO of match ids awaiting settlement.
#[derive(Debug, Clone, Default)]
pub struct SettlementQueue {
    inner: Arc<Mutex<Inner>>,
}

impl SettlementQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a match to the back of the queue. Returns false if it is already
    /// queued or being settled.
    pub fn enqueue(&self, match_id: &str) -> bool {
        let mut inner = self.lock();
        if !inner.members.insert(match_id.to_string()) {
            return false;
        }
        inner.order.push_back(match_id.to_string());
        metrics::SETTLEMENT_QUEUE_DEPTH.set(inner.order.len() as i64);
        true
    }

    /// Take the next match. It stays a member until `finish` is called.
    pub fn dequeue(&self) -> Option<String> {
        let mut inner = self.lock();
        let next = inner.order.pop_front();
        metrics::SETTLEMENT_QUEUE_DEPTH.set(inner.order.len() as i64);
        next
    }

    pub fn finish(&self, match_id: &str) {
        self.lock().members.remove(match_id);
    }

    pub fn depth(&self) -> usize {
        self.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.depth() == 0
    }

    pub fn status(&self) -> QueueStatus {
        let inner = self.lock();
        QueueStatus {
            depth: inner.order.len(),
            in_flight: inner.members.len() - inner.order.len(),
        }
    }
}

/// Queue every match the database still lists as unsettled.
pub async fn sweep_pending(db: &Database, queue: &SettlementQueue) -> crate::error::Result<usize> {
    let pending = db.count_pending_settlements().await?;
    metrics::PENDING_SETTLEMENTS.set(pending);
    let mut queued = 0;
    for match_id in db.pending_settlement_matches(SWEEP_BATCH).await? {
        if queue.enqueue(&match_id) {
            queued += 1;
        }
    }
    Ok(queued)
}

/// Spawn a background task that settles queued matches on the worker pool
/// and sweeps for stranded settlements every `sweep_interval`.
pub fn spawn_settlement_worker(
    db: Arc<Database>,
    settler: Settler,
    queue: SettlementQueue,
    pool: WorkerPool,
    sweep_interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut last_sweep: Option<Instant> = None;
        loop {
            if last_sweep.map_or(true, |t| t.elapsed() >= sweep_interval) {
                match sweep_pending(&db, &queue).await {
                    Ok(0) => {}
                    Ok(n) => tracing::info!(queued = n, "sweep found unsettled matches"),
                    Err(e) => tracing::error!("settlement sweep failed: {e}"),
                }
                last_sweep = Some(Instant::now());
            }

            while pool.has_capacity() {
                let Some(match_id) = queue.dequeue() else {
                    break;
                };
                let settler = settler.clone();
                let queue = queue.clone();
                pool.spawn(async move {
                    match settler.settle_match(&match_id).await {
                        Ok(report) => tracing::debug!(
                            match_id = %report.match_id,
                            applied = report.applied,
                            "queued settlement done"
                        ),
                        Err(e) if e.is_transient() => {
                            tracing::warn!(%match_id, "settlement deferred to next sweep: {e}")
                        }
                        Err(e) => tracing::error!(%match_id, "settlement failed: {e}"),
                    }
                    queue.finish(&match_id);
                });
            }

            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    })
}

// Bounded pool of settlement tasks.
//
// Tasks run on the tokio runtime; the pool only limits how many run at once.
// Callers check `has_capacity()` before dispatching.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::metrics;

#[derive(Debug, Clone)]
pub struct WorkerPool {
    worker_count: usize,
    active_workers: Arc<AtomicUsize>,
}

/// Releases a worker slot when the task finishes, including by panic.
struct Slot(Arc<AtomicUsize>);

impl Drop for Slot {
    fn drop(&mut self) {
        let now = self.0.fetch_sub(1, Ordering::SeqCst) - 1;
        metrics::SETTLEMENT_WORKERS_ACTIVE.set(now as i64);
    }
}

impl WorkerPool {
    pub fn new(worker_count: usize) -> Self {
        Self {
            worker_count,
            active_workers: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn has_capacity(&self) -> bool {
        self.active_workers.load(Ordering::SeqCst) < self.worker_count
    }

    pub fn active_count(&self) -> usize {
        self.active_workers.load(Ordering::SeqCst)
    }

    /// Run `task` on the runtime. Returns false if the pool is at capacity.
    pub fn spawn<F>(&self, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let claimed = self
            .active_workers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < self.worker_count).then_some(n + 1)
            });
        let Ok(previous) = claimed else {
            return false;
        };
        metrics::SETTLEMENT_WORKERS_ACTIVE.set(previous as i64 + 1);

        let slot = Slot(self.active_workers.clone());
        tokio::spawn(async move {
            let _slot = slot;
            task.await;
        });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    #[test]
    fn test_worker_pool_capacity() {
        let pool = WorkerPool::new(4);
        assert!(pool.has_capacity());
        assert_eq!(pool.active_count(), 0);
    }

    #[test]
    fn test_worker_pool_zero_capacity() {
        let pool = WorkerPool::new(0);
        assert!(!pool.has_capacity());
    }

    #[tokio::test]
    async fn test_slots_are_released() {
        let pool = WorkerPool::new(1);
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let (done_tx, done_rx) = oneshot::channel::<()>();

        assert!(pool.spawn(async move {
            let _ = release_rx.await;
            let _ = done_tx.send(());
        }));
        assert_eq!(pool.active_count(), 1);
        assert!(!pool.spawn(async {}));

        release_tx.send(()).unwrap();
        done_rx.await.unwrap();
        // The slot guard drops right after the task body returns.
        for _ in 0..100 {
            if pool.has_capacity() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(pool.has_capacity());
    }
}

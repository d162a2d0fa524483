//! Bounded worker pool for CPU-heavy PQ operations.
//!
//! Keygen, sign and verify calls are shipped to dedicated threads over
//! per-worker channels so they never stall the network plane. Results come
//! back over oneshot channels; dropping the caller cancels delivery.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use tokio::sync::{mpsc, oneshot};

use crate::error::PqcError;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed-size pool, jobs dispatched round-robin.
pub struct PqcPool {
    workers: Vec<mpsc::Sender<Job>>,
    next: AtomicUsize,
}

impl PqcPool {
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        let mut senders = Vec::with_capacity(workers);
        for i in 0..workers {
            let (tx, mut rx) = mpsc::channel::<Job>(16);
            thread::Builder::new()
                .name(format!("pqc-worker-{i}"))
                .spawn(move || {
                    while let Some(job) = rx.blocking_recv() {
                        job();
                    }
                })
                .expect("spawn pqc worker");
            senders.push(tx);
        }
        Self {
            workers: senders,
            next: AtomicUsize::new(0),
        }
    }

    /// Run `f` on a worker thread and await its result.
    pub async fn run<T, F>(&self, f: F) -> Result<T, PqcError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::new(move || {
            let _ = tx.send(f());
        });
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        self.workers[idx]
            .send(job)
            .await
            .map_err(|_| PqcError::WorkerGone)?;
        rx.await.map_err(|_| PqcError::WorkerGone)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pool_runs_jobs() {
        let pool = PqcPool::new(2);
        let result = pool.run(|| 40 + 2).await.unwrap();
        assert_eq!(result, 42);
    }

    #[tokio::test]
    async fn test_pool_round_robins_many_jobs() {
        let pool = PqcPool::new(2);
        let mut total = 0u64;
        for i in 0..20u64 {
            total += pool.run(move || i * 2).await.unwrap();
        }
        assert_eq!(total, (0..20u64).map(|i| i * 2).sum::<u64>());
    }
}

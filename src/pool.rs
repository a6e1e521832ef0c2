//! Bounded worker pool for hard-refresh tasks.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::debug;

/// Default number of workers draining the queue.
pub const DEFAULT_WORKERS: usize = 8;
/// Default queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Fixed-size worker pool over a bounded queue with a drop-new overflow
/// policy: when the queue is full, new jobs are discarded rather than
/// queued or run inline.
pub struct RefreshPool {
    queue: mpsc::Sender<Job>,
    workers: Vec<JoinHandle<()>>,
}

impl RefreshPool {
    /// Spawn `workers` tasks draining a queue of `queue_capacity` jobs.
    #[must_use]
    pub fn new(workers: usize, queue_capacity: usize) -> Self {
        let (queue, rx) = mpsc::channel::<Job>(queue_capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));

        let workers = (0..workers.max(1))
            .map(|_| {
                let rx = Arc::clone(&rx);
                tokio::spawn(async move {
                    loop {
                        let job = { rx.lock().await.recv().await };
                        match job {
                            Some(job) => job.await,
                            None => break,
                        }
                    }
                })
            })
            .collect();

        Self { queue, workers }
    }

    /// Submit a job. Returns `false` when the queue is full and the job was
    /// dropped.
    pub fn try_run<F>(&self, job: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match self.queue.try_send(Box::pin(job)) {
            Ok(()) => true,
            Err(_) => {
                debug!("worker pool saturated, dropping job");
                false
            }
        }
    }

    /// Stop the workers. Jobs that have not started are discarded.
    pub fn shutdown(&self) {
        for worker in &self.workers {
            worker.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    #[tokio::test]
    async fn jobs_run_to_completion() {
        let pool = RefreshPool::new(2, 8);
        let ran = Arc::new(AtomicU32::new(0));

        for _ in 0..4 {
            let ran = Arc::clone(&ran);
            assert!(pool.try_run(async move {
                ran.fetch_add(1, Ordering::SeqCst);
            }));
        }

        tokio::time::timeout(Duration::from_secs(2), async {
            while ran.load(Ordering::SeqCst) < 4 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        pool.shutdown();
    }

    #[tokio::test]
    async fn saturated_queue_drops_new_jobs() {
        let pool = RefreshPool::new(1, 1);
        let gate = Arc::new(Notify::new());

        // Occupy the single worker.
        let held = Arc::clone(&gate);
        assert!(pool.try_run(async move {
            held.notified().await;
        }));
        // Let the worker pick the blocking job up so the queue is empty again.
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Fill the queue, then overflow it.
        let held = Arc::clone(&gate);
        assert!(pool.try_run(async move {
            held.notified().await;
        }));
        assert!(!pool.try_run(async {}), "overflowing job should be dropped");

        gate.notify_waiters();
        pool.shutdown();
    }
}

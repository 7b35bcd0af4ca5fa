//! Bounded worker pool for concurrent task execution.
//!
//! The pool runs N workers over a queue of depth 2N. Submission applies
//! backpressure: once the queue is full, `submit()` waits until a worker
//! frees a slot. Task failures are recorded but never cancel the pool;
//! the caller decides after [`wait()`](WorkerPool::wait) what a failure
//! means for the run as a whole.
//!
//! # Lifecycle
//!
//! ```text
//! new(N) ──▶ submit()* ──▶ wait()   (seals the queue, drains workers)
//!                │
//!                └──────── stop()   (cancels in-flight tasks promptly)
//! ```
//!
//! Counters (submitted / done / failed) are atomics and feed the
//! progress stream while the pool is draining.

use crate::error::{ReplicationError, Result};
use crate::store::BoxFuture;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// A unit of work executed by the pool.
pub trait Task: Send + Sync + 'static {
    /// Run the task. The receiver flips to `true` when the pool is
    /// stopping; blocking operations should observe it and exit promptly.
    fn execute(&self, cancel: watch::Receiver<bool>) -> BoxFuture<'_, Result<()>>;

    /// Short human-readable description for error reporting.
    fn description(&self) -> String;
}

/// Bounded concurrency primitive.
pub struct WorkerPool {
    queue_tx: Option<mpsc::Sender<Arc<dyn Task>>>,
    workers: Vec<JoinHandle<()>>,
    submitted: Arc<AtomicU64>,
    done: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
    errors: Arc<StdMutex<Vec<String>>>,
    stop_tx: watch::Sender<bool>,
}

impl WorkerPool {
    /// Create a pool with `workers` workers (clamped to at least 1).
    ///
    /// `parent_cancel` is the execution's cancellation signal; it is
    /// forwarded into the pool so a rule cancel stops in-flight copies.
    pub fn new(workers: usize, parent_cancel: watch::Receiver<bool>) -> Self {
        let workers = workers.max(1);
        let (queue_tx, queue_rx) = mpsc::channel::<Arc<dyn Task>>(workers * 2);
        let queue_rx = Arc::new(Mutex::new(queue_rx));
        let (stop_tx, stop_rx) = watch::channel(false);

        // Forward the parent cancel signal into the pool's own stop channel.
        {
            let stop_tx = stop_tx.clone();
            let mut parent = parent_cancel;
            tokio::spawn(async move {
                loop {
                    if *parent.borrow() {
                        let _ = stop_tx.send(true);
                        return;
                    }
                    if parent.changed().await.is_err() {
                        return;
                    }
                }
            });
        }

        let submitted = Arc::new(AtomicU64::new(0));
        let done = Arc::new(AtomicU64::new(0));
        let failed = Arc::new(AtomicU64::new(0));
        let errors = Arc::new(StdMutex::new(Vec::new()));

        let handles = (0..workers)
            .map(|id| {
                let queue_rx = Arc::clone(&queue_rx);
                let stop_rx = stop_rx.clone();
                let done = Arc::clone(&done);
                let failed = Arc::clone(&failed);
                let errors = Arc::clone(&errors);
                tokio::spawn(worker_loop(id, queue_rx, stop_rx, done, failed, errors))
            })
            .collect();

        Self {
            queue_tx: Some(queue_tx),
            workers: handles,
            submitted,
            done,
            failed,
            errors,
            stop_tx,
        }
    }

    /// Submit a task. Waits when the queue is at capacity.
    pub async fn submit(&self, task: Arc<dyn Task>) -> Result<()> {
        let tx = self.queue_tx.as_ref().ok_or_else(|| ReplicationError::InvalidState {
            expected: "accepting submissions".to_string(),
            actual: "sealed".to_string(),
        })?;
        self.submitted.fetch_add(1, Ordering::Relaxed);
        tx.send(task).await.map_err(|_| ReplicationError::Canceled)
    }

    /// Seal the queue, drain all in-flight tasks, and report failures.
    ///
    /// Returns `Ok(())` when every task succeeded; otherwise the first
    /// recorded error, with the rest available via [`errors()`](Self::errors).
    pub async fn wait(&mut self) -> Result<()> {
        if self.queue_tx.take().is_none() {
            return Err(ReplicationError::InvalidState {
                expected: "unsealed pool".to_string(),
                actual: "wait() called twice".to_string(),
            });
        }

        for handle in self.workers.drain(..) {
            if let Err(e) = handle.await {
                warn!(error = %e, "Pool worker panicked");
            }
        }

        let errors = self.errors.lock().expect("pool error lock poisoned");
        match errors.first() {
            None => Ok(()),
            Some(first) => Err(ReplicationError::Pool {
                failed: errors.len() as u64,
                first: first.clone(),
            }),
        }
    }

    /// Cancel the pool: in-flight tasks observe the signal and exit.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Snapshot of (submitted, done, failed) counters.
    pub fn progress(&self) -> (u64, u64, u64) {
        (
            self.submitted.load(Ordering::Relaxed),
            self.done.load(Ordering::Relaxed),
            self.failed.load(Ordering::Relaxed),
        )
    }

    /// All task errors recorded so far.
    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().expect("pool error lock poisoned").clone()
    }
}

/// Resolve once the stop signal turns true. Never resolves otherwise.
async fn stopped(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            // Sender gone without a stop: park forever.
            std::future::pending::<()>().await;
        }
    }
}

async fn worker_loop(
    id: usize,
    queue_rx: Arc<Mutex<mpsc::Receiver<Arc<dyn Task>>>>,
    stop_rx: watch::Receiver<bool>,
    done: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
    errors: Arc<StdMutex<Vec<String>>>,
) {
    let mut stop = stop_rx.clone();
    loop {
        let task = {
            let mut rx = queue_rx.lock().await;
            tokio::select! {
                t = rx.recv() => t,
                _ = stopped(&mut stop) => {
                    debug!(worker = id, "Worker stopping");
                    return;
                }
            }
        };

        let Some(task) = task else {
            // Queue sealed and drained.
            return;
        };

        let mut execute_stop = stop_rx.clone();
        let result = tokio::select! {
            r = task.execute(stop_rx.clone()) => Some(r),
            _ = stopped(&mut execute_stop) => None,
        };

        match result {
            Some(Ok(())) => {
                done.fetch_add(1, Ordering::Relaxed);
            }
            Some(Err(ReplicationError::Canceled)) => {
                done.fetch_add(1, Ordering::Relaxed);
                debug!(worker = id, task = %task.description(), "Task canceled");
            }
            Some(Err(e)) => {
                done.fetch_add(1, Ordering::Relaxed);
                failed.fetch_add(1, Ordering::Relaxed);
                let msg = format!("worker {}: task {} failed: {}", id, task.description(), e);
                warn!(worker = id, task = %task.description(), error = %e, "Task failed");
                errors.lock().expect("pool error lock poisoned").push(msg);
            }
            None => {
                debug!(worker = id, task = %task.description(), "Worker canceled mid-task");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    enum Behavior {
        Succeed,
        Fail,
        BlockUntilCanceled,
    }

    struct TestTask {
        behavior: Behavior,
        runs: Arc<AtomicUsize>,
    }

    impl TestTask {
        fn new(behavior: Behavior, runs: Arc<AtomicUsize>) -> Arc<dyn Task> {
            Arc::new(Self { behavior, runs })
        }
    }

    impl Task for TestTask {
        fn execute(&self, mut cancel: watch::Receiver<bool>) -> BoxFuture<'_, Result<()>> {
            Box::pin(async move {
                self.runs.fetch_add(1, Ordering::SeqCst);
                match self.behavior {
                    Behavior::Succeed => Ok(()),
                    Behavior::Fail => Err(ReplicationError::http("test", 404, "missing")),
                    Behavior::BlockUntilCanceled => {
                        loop {
                            if *cancel.borrow() {
                                return Err(ReplicationError::Canceled);
                            }
                            if cancel.changed().await.is_err() {
                                return Err(ReplicationError::Canceled);
                            }
                        }
                    }
                }
            })
        }

        fn description(&self) -> String {
            "test task".to_string()
        }
    }

    fn parent() -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        // Keep the sender alive for the test duration by leaking it: the
        // forwarder task must not observe a closed channel as a stop.
        std::mem::forget(tx);
        rx
    }

    #[tokio::test]
    async fn test_all_tasks_run() {
        let runs = Arc::new(AtomicUsize::new(0));
        let mut pool = WorkerPool::new(4, parent());

        for _ in 0..20 {
            pool.submit(TestTask::new(Behavior::Succeed, Arc::clone(&runs)))
                .await
                .unwrap();
        }
        pool.wait().await.unwrap();

        assert_eq!(runs.load(Ordering::SeqCst), 20);
        let (submitted, done, failed) = pool.progress();
        assert_eq!(submitted, 20);
        assert_eq!(done, 20);
        assert_eq!(failed, 0);
    }

    #[tokio::test]
    async fn test_failures_do_not_cancel_pool() {
        let runs = Arc::new(AtomicUsize::new(0));
        let mut pool = WorkerPool::new(2, parent());

        pool.submit(TestTask::new(Behavior::Fail, Arc::clone(&runs))).await.unwrap();
        for _ in 0..5 {
            pool.submit(TestTask::new(Behavior::Succeed, Arc::clone(&runs)))
                .await
                .unwrap();
        }

        let err = pool.wait().await.unwrap_err();
        match err {
            ReplicationError::Pool { failed, first } => {
                assert_eq!(failed, 1);
                assert!(first.contains("test task"));
            }
            other => panic!("expected Pool error, got {:?}", other),
        }

        // Every task still ran.
        assert_eq!(runs.load(Ordering::SeqCst), 6);
        let (_, done, failed) = pool.progress();
        assert_eq!(done, 6);
        assert_eq!(failed, 1);
        assert_eq!(pool.errors().len(), 1);
    }

    #[tokio::test]
    async fn test_stop_cancels_blocked_tasks() {
        let runs = Arc::new(AtomicUsize::new(0));
        let mut pool = WorkerPool::new(2, parent());

        pool.submit(TestTask::new(Behavior::BlockUntilCanceled, Arc::clone(&runs)))
            .await
            .unwrap();
        pool.submit(TestTask::new(Behavior::BlockUntilCanceled, Arc::clone(&runs)))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        pool.stop();

        tokio::time::timeout(Duration::from_secs(2), pool.wait())
            .await
            .expect("stop must unblock wait")
            .ok();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_parent_cancel_flows_into_pool() {
        let (parent_tx, parent_rx) = watch::channel(false);
        let runs = Arc::new(AtomicUsize::new(0));
        let mut pool = WorkerPool::new(1, parent_rx);

        pool.submit(TestTask::new(Behavior::BlockUntilCanceled, Arc::clone(&runs)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        parent_tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(2), pool.wait())
            .await
            .expect("parent cancel must unblock wait")
            .ok();
    }

    #[tokio::test]
    async fn test_wait_twice_is_invalid_state() {
        let mut pool = WorkerPool::new(1, parent());
        pool.wait().await.unwrap();
        assert!(matches!(
            pool.wait().await,
            Err(ReplicationError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn test_submit_after_wait_fails() {
        let runs = Arc::new(AtomicUsize::new(0));
        let mut pool = WorkerPool::new(1, parent());
        pool.wait().await.unwrap();
        assert!(pool
            .submit(TestTask::new(Behavior::Succeed, runs))
            .await
            .is_err());
    }
}

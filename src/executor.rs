//! Single-threaded cooperative task execution.
//!
//! Every member endpoint, cluster manager, and the coordinator itself owns a
//! [`TaskExecutor`]: a named scheduler backed by one worker task draining a
//! FIFO queue of jobs and awaiting each to completion before the next. That
//! gives the serialization guarantee the protocol relies on without any
//! locking in the scheduled code, and [`TaskExecutor::run`] is the explicit
//! "run on scheduler X" combinator used to pin lifecycle steps to a specific
//! executor.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use crate::error::{Result, TesseraError};

enum Job {
    Task(BoxFuture<'static, ()>),
    Shutdown,
}

/// A named single-threaded cooperative scheduler.
///
/// Jobs submitted before [`shutdown`](TaskExecutor::shutdown) run to
/// completion in submission order; jobs submitted after fail with
/// [`TesseraError::ExecutorShutdown`]. Scheduled work must not block the
/// worker; long-running waits belong in their own spawned tasks.
pub struct TaskExecutor {
    name: String,
    tx: mpsc::UnboundedSender<Job>,
    open: Arc<AtomicBool>,
}

impl TaskExecutor {
    /// Create a new executor and spawn its worker task.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let worker_name = name.clone();

        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                match job {
                    Job::Task(task) => task.await,
                    Job::Shutdown => break,
                }
            }
            trace!(executor = %worker_name, "Executor worker exited");
        });

        Self {
            name,
            tx,
            open: Arc::new(AtomicBool::new(true)),
        }
    }

    /// The executor's name, used in logs and error messages.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueue a fire-and-forget job.
    pub fn execute<F>(&self, future: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        if !self.open.load(Ordering::Acquire) {
            return Err(TesseraError::ExecutorShutdown(self.name.clone()));
        }
        self.tx
            .send(Job::Task(future.boxed()))
            .map_err(|_| TesseraError::ExecutorShutdown(self.name.clone()))
    }

    /// Run a future on this executor and await its output.
    ///
    /// The future executes on the worker, serialized with every other job;
    /// the caller suspends until it completes.
    pub async fn run<F, T>(&self, future: F) -> Result<T>
    where
        F: std::future::Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.execute(async move {
            let _ = reply_tx.send(future.await);
        })?;
        reply_rx
            .await
            .map_err(|_| TesseraError::ExecutorShutdown(self.name.clone()))
    }

    /// Shut the executor down.
    ///
    /// Jobs already queued drain first; the worker then exits. Idempotent.
    pub fn shutdown(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            debug!(executor = %self.name, "Shutting down executor");
            let _ = self.tx.send(Job::Shutdown);
        }
    }

    pub fn is_shutdown(&self) -> bool {
        !self.open.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for TaskExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskExecutor")
            .field("name", &self.name)
            .field("open", &self.open.load(Ordering::Acquire))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;
    use std::time::Duration;

    #[tokio::test]
    async fn test_run_returns_output() {
        let executor = TaskExecutor::new("test");
        let value = executor.run(async { 40 + 2 }).await.unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn test_jobs_serialize_in_fifo_order() {
        let executor = TaskExecutor::new("test");
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));

        for i in 0..8u64 {
            let log = Arc::clone(&log);
            executor
                .execute(async move {
                    // Yield inside the job; order must still hold because the
                    // worker awaits each job to completion.
                    tokio::task::yield_now().await;
                    log.lock().push(i);
                })
                .unwrap();
        }
        // Barrier: by FIFO, all eight ran before this returns.
        executor.run(async {}).await.unwrap();

        assert_eq!(*log.lock(), (0..8).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_jobs() {
        let executor = TaskExecutor::new("test");
        executor.shutdown();
        executor.shutdown(); // idempotent

        assert!(executor.is_shutdown());
        let result = executor.execute(async {});
        assert!(matches!(result, Err(TesseraError::ExecutorShutdown(_))));
        let result = executor.run(async { 1 }).await;
        assert!(matches!(result, Err(TesseraError::ExecutorShutdown(_))));
    }

    #[tokio::test]
    async fn test_shutdown_drains_queued_jobs() {
        let executor = TaskExecutor::new("test");
        let counter = Arc::new(AtomicU64::new(0));

        for _ in 0..4 {
            let counter = Arc::clone(&counter);
            executor
                .execute(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }
        executor.shutdown();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }
}

//! Bounded executor: a fixed worker set fed by a queue.
//!
//! # Responsibilities
//! - Run submitted tasks on at most `size` workers
//! - Expose running / free / waiting counts (also as gauges)
//! - Stop accepting at shutdown stage 2, drain the queue by stage 3
//!
//! # Design Decisions
//! - Same action-log wrapping as the task runner, with action type `executor`
//! - Rejected submissions return an error instead of spawning unbounded work
//! - Queued tasks still run after `shutdown`; only new submissions are refused

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::future::BoxFuture;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::task::TaskTracker;

use crate::lifecycle::shutdown::{ShutdownSequencer, Stage};
use crate::observability::metrics;
use crate::observability::sink::RecordSink;
use crate::task::failure::install_panic_hook;
use crate::task::runner::{execute_unit, Task};
use crate::trace::TraceScope;

/// Action type of records produced by the executor.
pub const EXECUTOR_ACTION_TYPE: &str = "executor";

type Job = BoxFuture<'static, ()>;

/// Error type for executor submissions.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExecutorError {
    #[error("executor '{0}' is shut down")]
    Shutdown(String),
}

#[derive(Debug)]
struct PoolState {
    name: String,
    size: usize,
    running: AtomicUsize,
    waiting: AtomicUsize,
}

impl PoolState {
    fn publish(&self) {
        let running = self.running.load(Ordering::SeqCst);
        metrics::record_executor_state(
            &self.name,
            running,
            self.size.saturating_sub(running),
            self.waiting.load(Ordering::SeqCst),
        );
    }
}

/// Fixed-size worker pool running tasks under their own action logs.
pub struct Executor {
    sink: Arc<dyn RecordSink>,
    state: Arc<PoolState>,
    queue: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    workers: TaskTracker,
}

impl Executor {
    /// Start `size` workers. Must be called inside a Tokio runtime.
    pub fn new(name: impl Into<String>, size: usize, sink: Arc<dyn RecordSink>) -> Arc<Self> {
        install_panic_hook();
        let size = size.max(1);
        let state = Arc::new(PoolState {
            name: name.into(),
            size,
            running: AtomicUsize::new(0),
            waiting: AtomicUsize::new(0),
        });

        let (tx, rx) = mpsc::unbounded_channel::<Job>();
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let workers = TaskTracker::new();
        for _ in 0..size {
            workers.spawn(work(Arc::clone(&rx), Arc::clone(&state)));
        }
        workers.close();
        state.publish();

        tracing::info!(executor = %state.name, size, "Executor started");
        Arc::new(Self {
            sink,
            state,
            queue: Mutex::new(Some(tx)),
            workers,
        })
    }

    /// Executor name, used as the gauge label.
    pub fn name(&self) -> &str {
        &self.state.name
    }

    /// Tasks currently executing.
    pub fn running(&self) -> usize {
        self.state.running.load(Ordering::SeqCst)
    }

    /// Idle workers.
    pub fn free(&self) -> usize {
        self.state.size.saturating_sub(self.running())
    }

    /// Tasks queued for a worker.
    pub fn waiting(&self) -> usize {
        self.state.waiting.load(Ordering::SeqCst)
    }

    /// Queue `task` under its default action name.
    pub fn submit<T: Task>(&self, parent: &TraceScope, task: T) -> Result<(), ExecutorError> {
        let action = task.name();
        self.submit_named(parent, &action, task)
    }

    /// Queue `task` as `action`, linked to `parent`.
    pub fn submit_named<T: Task>(&self, parent: &TraceScope, action: &str, task: T) -> Result<(), ExecutorError> {
        let job: Job = Box::pin(execute_unit(
            Arc::clone(&self.sink),
            parent.link(),
            action.to_string(),
            EXECUTOR_ACTION_TYPE,
            task,
        ));

        let queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(tx) = queue.as_ref() else {
            return Err(ExecutorError::Shutdown(self.state.name.clone()));
        };

        self.state.waiting.fetch_add(1, Ordering::SeqCst);
        if tx.send(job).is_err() {
            self.state.waiting.fetch_sub(1, Ordering::SeqCst);
            return Err(ExecutorError::Shutdown(self.state.name.clone()));
        }
        self.state.publish();
        Ok(())
    }

    /// Refuse further submissions. Already queued tasks still run.
    pub fn shutdown(&self) {
        if self.queue.lock().unwrap_or_else(PoisonError::into_inner).take().is_some() {
            tracing::info!(executor = %self.state.name, waiting = self.waiting(), "Executor shutting down");
        }
    }

    /// Wait for every worker to exit. Returns `false` if `budget` ran out first.
    pub async fn await_termination(&self, budget: Duration) -> bool {
        match tokio::time::timeout(budget, self.workers.wait()).await {
            Ok(()) => {
                tracing::info!(executor = %self.state.name, "Executor terminated");
                true
            }
            Err(_) => {
                tracing::warn!(
                    executor = %self.state.name,
                    running = self.running(),
                    waiting = self.waiting(),
                    "Executor did not terminate before the deadline"
                );
                false
            }
        }
    }

    /// Register the stage-2 and stage-3 shutdown hooks.
    pub fn register(self: &Arc<Self>, shutdown: &ShutdownSequencer) {
        let executor = Arc::clone(self);
        shutdown.add_async(Stage::StopExecutors, move |_| async move {
            executor.shutdown();
        });
        let executor = Arc::clone(self);
        shutdown.add_async(Stage::AwaitExecutors, move |budget| async move {
            executor.await_termination(budget).await;
        });
    }
}

async fn work(rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Job>>>, state: Arc<PoolState>) {
    loop {
        let job = {
            let mut rx = rx.lock().await;
            rx.recv().await
        };
        let Some(job) = job else {
            break;
        };

        state.waiting.fetch_sub(1, Ordering::SeqCst);
        state.running.fetch_add(1, Ordering::SeqCst);
        state.publish();

        job.await;

        state.running.fetch_sub(1, Ordering::SeqCst);
        state.publish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::sink::MemorySink;
    use crate::task::failure::Failure;
    use crate::task::runner::task_fn;
    use crate::trace::ActionLog;
    use tokio::sync::Semaphore;

    fn gated(gate: Arc<Semaphore>) -> impl Task {
        task_fn(move |_scope| {
            Box::pin(async move {
                let _permit = gate.acquire().await.map_err(Failure::generic)?;
                Ok::<(), Failure>(())
            })
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_counts_running_free_and_waiting() {
        let sink = MemorySink::default();
        let executor = Executor::new("test", 2, Arc::new(sink.clone()));
        let gate = Arc::new(Semaphore::new(0));
        let parent = TraceScope::detached();

        for _ in 0..5 {
            executor.submit_named(&parent, "gated", gated(gate.clone())).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(executor.running(), 2);
        assert_eq!(executor.free(), 0);
        assert_eq!(executor.waiting(), 3);

        gate.add_permits(5);
        executor.shutdown();
        assert!(executor.await_termination(Duration::from_secs(1)).await);

        assert_eq!(executor.running(), 0);
        assert_eq!(executor.free(), 2);
        assert_eq!(executor.waiting(), 0);
        assert_eq!(sink.find("gated").len(), 5);
    }

    #[tokio::test]
    async fn test_records_link_to_parent_with_executor_type() {
        let sink = MemorySink::default();
        let executor = Executor::new("jobs", 1, Arc::new(sink.clone()));
        let parent = ActionLog::begin("job:nightly", "job");

        executor
            .submit_named(parent.scope(), "reindex", task_fn(|scope| {
                Box::pin(async move {
                    scope.stat("documents", 3.0);
                    Ok::<(), Failure>(())
                })
            }))
            .unwrap();
        executor.shutdown();
        executor.await_termination(Duration::from_secs(1)).await;

        let record = &sink.find("job:nightly:task:reindex")[0];
        assert_eq!(record["action_type"], EXECUTOR_ACTION_TYPE);
        assert_eq!(record["ref_id"], parent.id());
        assert_eq!(record["stat.documents"], 3.0);
    }

    #[tokio::test]
    async fn test_rejects_after_shutdown() {
        let executor = Executor::new("closed", 1, Arc::new(MemorySink::default()));
        executor.shutdown();
        let err = executor
            .submit_named(&TraceScope::detached(), "late", gated(Arc::new(Semaphore::new(1))))
            .unwrap_err();
        assert_eq!(err, ExecutorError::Shutdown("closed".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_termination_gives_up_after_budget() {
        let executor = Executor::new("stuck", 1, Arc::new(MemorySink::default()));
        let gate = Arc::new(Semaphore::new(0));
        executor.submit_named(&TraceScope::detached(), "stuck", gated(gate.clone())).unwrap();
        executor.shutdown();

        assert!(!executor.await_termination(Duration::from_millis(100)).await);
        gate.add_permits(1);
        assert!(executor.await_termination(Duration::from_secs(1)).await);
    }
}

//! Task runner: schedules units of work with their own action log.
//!
//! # Flow
//! ```text
//! run_task(parent, supervision, task)
//!     parent.link()                      (id + action only)
//!     → spawn ─┬─ Detached               (tokio::spawn, exempt from drain)
//!              └─ Joined(&TaskTracker)   (tracker.spawn, awaited at shutdown)
//!         ActionLog::begin_child         (<parent>:task:<name>, ref_id = parent id)
//!         task.execute(&mut scope)       (guarded by catch_unwind)
//!         intercept → end → output(sink)
//! ```
//!
//! # Design Decisions
//! - Supervision is a required argument so unsupervised work is visible at the call site
//! - Spawning never blocks the caller
//! - A child never sees its parent's context or stats

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio_util::task::TaskTracker;

use crate::lifecycle::shutdown::{ShutdownSequencer, Stage};
use crate::observability::sink::RecordSink;
use crate::task::failure::{install_panic_hook, intercept, Failure};
use crate::trace::{ActionLog, ScopeLink, TraceScope};

/// Action type of records produced by the runner.
pub const TASK_ACTION_TYPE: &str = "task";

/// How a spawned unit is supervised.
#[derive(Debug, Clone, Copy)]
pub enum Supervision<'a> {
    /// Fire-and-forget. Nobody waits for it, graceful shutdown included.
    Detached,
    /// Spawned on the tracker; whoever owns it can wait for completion.
    Joined(&'a TaskTracker),
}

/// A unit of work that can be scheduled by the runner or an executor.
pub trait Task: Send + 'static {
    /// Action name used when none is given explicitly.
    fn name(&self) -> String {
        action_name(std::any::type_name::<Self>())
    }

    fn execute(self, scope: &mut TraceScope) -> impl Future<Output = Result<(), Failure>> + Send + '_;
}

/// Adapts a closure into a [`Task`].
pub struct FnTask<F> {
    f: F,
}

/// Wrap `f` as a task. The action name is taken from the enclosing function.
pub fn task_fn<F>(f: F) -> FnTask<F>
where
    F: for<'a> FnOnce(&'a mut TraceScope) -> BoxFuture<'a, Result<(), Failure>> + Send + 'static,
{
    FnTask { f }
}

impl<F> Task for FnTask<F>
where
    F: for<'a> FnOnce(&'a mut TraceScope) -> BoxFuture<'a, Result<(), Failure>> + Send + 'static,
{
    fn name(&self) -> String {
        action_name(std::any::type_name::<F>())
    }

    fn execute(self, scope: &mut TraceScope) -> impl Future<Output = Result<(), Failure>> + Send + '_ {
        (self.f)(scope)
    }
}

/// Shorten a type path to an action name.
///
/// `app::jobs::CleanupJob` → `CleanupJob`, `app::jobs::schedule::{{closure}}` → `schedule`.
pub fn action_name(type_name: &str) -> String {
    let path = type_name.split('<').next().unwrap_or(type_name);
    path.rsplit("::")
        .find(|segment| !segment.is_empty() && !segment.starts_with("{{"))
        .unwrap_or(path)
        .to_string()
}

/// Spawns tasks wrapped in action logs.
#[derive(Clone)]
pub struct TaskRunner {
    sink: Arc<dyn RecordSink>,
}

impl TaskRunner {
    /// Create a runner emitting to `sink`.
    pub fn new(sink: Arc<dyn RecordSink>) -> Self {
        install_panic_hook();
        Self { sink }
    }

    /// Spawn `task` under its default action name.
    pub fn run_task<T: Task>(&self, parent: &TraceScope, supervision: Supervision<'_>, task: T) {
        let action = task.name();
        self.run_task_named(parent, supervision, &action, task);
    }

    /// Spawn `task` as `action`, linked to `parent`.
    pub fn run_task_named<T: Task>(
        &self,
        parent: &TraceScope,
        supervision: Supervision<'_>,
        action: &str,
        task: T,
    ) {
        let unit = execute_unit(
            Arc::clone(&self.sink),
            parent.link(),
            action.to_string(),
            TASK_ACTION_TYPE,
            task,
        );
        match supervision {
            Supervision::Detached => {
                tokio::spawn(unit);
            }
            Supervision::Joined(tracker) => {
                tracker.spawn(unit);
            }
        }
    }

    /// Spawn a closure under the enclosing function's name.
    pub fn run_fn<F>(&self, parent: &TraceScope, supervision: Supervision<'_>, f: F)
    where
        F: for<'a> FnOnce(&'a mut TraceScope) -> BoxFuture<'a, Result<(), Failure>> + Send + 'static,
    {
        self.run_task(parent, supervision, task_fn(f));
    }

    /// Spawn a closure as `action`.
    pub fn run_fn_named<F>(&self, parent: &TraceScope, supervision: Supervision<'_>, action: &str, f: F)
    where
        F: for<'a> FnOnce(&'a mut TraceScope) -> BoxFuture<'a, Result<(), Failure>> + Send + 'static,
    {
        self.run_task_named(parent, supervision, action, task_fn(f));
    }
}

/// Close `tracker` at stage 2 and wait for its tasks at stage 3.
pub fn drain_on_shutdown(tracker: TaskTracker, shutdown: &ShutdownSequencer) {
    let closing = tracker.clone();
    shutdown.add_async(Stage::StopExecutors, move |_| async move {
        closing.close();
    });
    shutdown.add_async(Stage::AwaitExecutors, move |budget| async move {
        tracker.close();
        if tokio::time::timeout(budget, tracker.wait()).await.is_err() {
            tracing::warn!(
                pending = tracker.len(),
                budget_ms = budget.as_millis() as u64,
                "Joined tasks did not finish before the deadline"
            );
        }
    });
}

/// Run one task to completion under its own action log.
pub(crate) async fn execute_unit<T: Task>(
    sink: Arc<dyn RecordSink>,
    parent: ScopeLink,
    action: String,
    action_type: &'static str,
    task: T,
) {
    let mut log = ActionLog::begin_child(&parent, &action, action_type);
    tracing::debug!(action = %log.action(), id = %log.id(), "Task started");

    let outcome = AssertUnwindSafe(task.execute(log.scope_mut()))
        .catch_unwind()
        .await;
    intercept(&mut log, outcome);

    log.end();
    log.output(sink.as_ref());
}

//! Shutdown coordination: nine ordered drain stages under one deadline.
//!
//! # Stages
//! ```text
//! 0 StopAcceptingExternal  tell external processors to stop taking new work
//! 1 AwaitExternal          wait for in-flight external requests
//! 2 StopExecutors          stop internal executors / background tasks
//! 3 AwaitExecutors         wait for them to finish
//! 4 StopProducers          stop outbound message producers
//! 5 Application            application shutdown hooks
//! 6 ReleaseClients         close datastore / cache / search clients
//! ──── app:stop action log emitted here ────
//! 7 StopLogShipping        stop the log shipper (after it ships app:stop)
//! 8 StopHttpListener       stop the HTTP listener, last, so health checks keep answering
//! ```
//!
//! # Design Decisions
//! - Stages run in order; hooks within a stage run in registration order
//! - One absolute deadline for the whole drain; each hook gets what is left,
//!   floored to one second
//! - Hooks are not interrupted when they overrun; later stages simply get
//!   the floor budget
//! - The `shutdown` / `after_shutdown_delay` flags are atomics in a
//!   [`ShutdownState`] shared by `Arc` with whoever needs to poll them

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::future::BoxFuture;
use thiserror::Error;
use tokio::time::Instant;

use crate::config::schema::ShutdownConfig;
use crate::observability::metrics;
use crate::observability::sink::RecordSink;
use crate::trace::{ActionLog, TraceScope};

/// Default drain deadline.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(25);

/// Smallest budget handed to any hook.
pub const MIN_BUDGET: Duration = Duration::from_millis(1000);

/// Number of shutdown stages.
pub const STAGE_COUNT: usize = 9;

/// Last stage that runs inside the `app:stop` action log.
const LAST_RECORDED_STAGE: Stage = Stage::ReleaseClients;

/// Shutdown stages, run in ascending order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    StopAcceptingExternal = 0,
    AwaitExternal = 1,
    StopExecutors = 2,
    AwaitExecutors = 3,
    StopProducers = 4,
    Application = 5,
    ReleaseClients = 6,
    StopLogShipping = 7,
    StopHttpListener = 8,
}

impl Stage {
    /// Every stage in execution order.
    pub const ALL: [Stage; STAGE_COUNT] = [
        Stage::StopAcceptingExternal,
        Stage::AwaitExternal,
        Stage::StopExecutors,
        Stage::AwaitExecutors,
        Stage::StopProducers,
        Stage::Application,
        Stage::ReleaseClients,
        Stage::StopLogShipping,
        Stage::StopHttpListener,
    ];

    /// Position of the stage, 0 to 8.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Stage name used in logs.
    pub fn name(self) -> &'static str {
        match self {
            Stage::StopAcceptingExternal => "stop_accepting_external",
            Stage::AwaitExternal => "await_external",
            Stage::StopExecutors => "stop_executors",
            Stage::AwaitExecutors => "await_executors",
            Stage::StopProducers => "stop_producers",
            Stage::Application => "application",
            Stage::ReleaseClients => "release_clients",
            Stage::StopLogShipping => "stop_log_shipping",
            Stage::StopHttpListener => "stop_http_listener",
        }
    }
}

/// Stage index outside 0..=8.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("shutdown stage {0} out of range 0-8")]
pub struct StageError(pub usize);

impl TryFrom<usize> for Stage {
    type Error = StageError;

    fn try_from(index: usize) -> Result<Self, Self::Error> {
        Stage::ALL.get(index).copied().ok_or(StageError(index))
    }
}

/// Process-wide shutdown flags.
#[derive(Debug, Default)]
pub struct ShutdownState {
    shutdown: AtomicBool,
    after_delay: AtomicBool,
}

impl ShutdownState {
    /// Shutdown has started; new work should be refused.
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// The pre-shutdown delay has elapsed; traffic is actually stopping.
    pub fn is_after_shutdown_delay(&self) -> bool {
        self.after_delay.load(Ordering::SeqCst)
    }
}

type Hook = Box<dyn for<'a> FnOnce(&'a mut TraceScope, Duration) -> BoxFuture<'a, ()> + Send>;

/// Runs registered hooks stage by stage when the process terminates.
pub struct ShutdownSequencer {
    stages: Mutex<[Vec<Hook>; STAGE_COUNT]>,
    state: Arc<ShutdownState>,
    timeout: Duration,
    delay: Option<Duration>,
}

impl ShutdownSequencer {
    /// Create a new shutdown coordinator.
    pub fn new(timeout: Duration, delay: Option<Duration>) -> Self {
        Self {
            stages: Mutex::new(Default::default()),
            state: Arc::new(ShutdownState::default()),
            timeout,
            delay,
        }
    }

    /// Build from validated configuration.
    pub fn from_config(config: &ShutdownConfig) -> Self {
        Self::new(
            Duration::from_secs(config.timeout_secs),
            config.delay_secs.map(Duration::from_secs),
        )
    }

    /// Shared handle to the shutdown flags.
    pub fn state(&self) -> Arc<ShutdownState> {
        Arc::clone(&self.state)
    }

    /// Whether `run` has started.
    pub fn is_shutdown(&self) -> bool {
        self.state.is_shutdown()
    }

    /// Whether the pre-shutdown delay has elapsed.
    pub fn is_after_shutdown_delay(&self) -> bool {
        self.state.is_after_shutdown_delay()
    }

    /// Total drain deadline.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Register a hook that needs the stage's trace scope.
    pub fn add<F>(&self, stage: Stage, hook: F)
    where
        F: for<'a> FnOnce(&'a mut TraceScope, Duration) -> BoxFuture<'a, ()> + Send + 'static,
    {
        self.stages.lock().unwrap_or_else(PoisonError::into_inner)[stage.index()].push(Box::new(hook));
    }

    /// Register a hook that only needs its remaining budget.
    pub fn add_async<F, Fut>(&self, stage: Stage, hook: F)
    where
        F: FnOnce(Duration) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.add(stage, move |_, budget| Box::pin(hook(budget)));
    }

    /// Number of hooks currently registered for `stage`.
    pub fn hook_count(&self, stage: Stage) -> usize {
        self.stages.lock().unwrap_or_else(PoisonError::into_inner)[stage.index()].len()
    }

    /// Drain the process. Blocks until every stage has run.
    pub async fn run(&self, sink: &dyn RecordSink) {
        self.state.shutdown.store(true, Ordering::SeqCst);
        tracing::info!(timeout_ms = self.timeout.as_millis() as u64, "Shutdown started");

        if let Some(delay) = self.delay {
            tracing::info!(delay_ms = delay.as_millis() as u64, "Delaying shutdown");
            tokio::time::sleep(delay).await;
        }
        self.state.after_delay.store(true, Ordering::SeqCst);

        let deadline = Instant::now() + self.timeout;

        let mut log = ActionLog::begin("app:stop", "app");
        log.stat("shutdown_timeout_ms", self.timeout.as_millis() as f64);
        for stage in Stage::ALL.into_iter().filter(|s| *s <= LAST_RECORDED_STAGE) {
            self.run_stage(stage, deadline, log.scope_mut()).await;
        }
        log.end();
        log.output(sink);

        let mut detached = TraceScope::detached();
        for stage in Stage::ALL.into_iter().filter(|s| *s > LAST_RECORDED_STAGE) {
            self.run_stage(stage, deadline, &mut detached).await;
        }

        tracing::info!("Shutdown completed");
    }

    async fn run_stage(&self, stage: Stage, deadline: Instant, scope: &mut TraceScope) {
        let hooks = std::mem::take(
            &mut self.stages.lock().unwrap_or_else(PoisonError::into_inner)[stage.index()],
        );
        if hooks.is_empty() {
            return;
        }

        let started = Instant::now();
        let count = hooks.len();
        tracing::info!(stage = stage.index(), name = stage.name(), hooks = count, "Shutdown stage started");

        for hook in hooks {
            let budget = remaining_budget(deadline, Instant::now());
            hook(scope, budget).await;
        }

        let elapsed = started.elapsed();
        scope.stat(&format!("shutdown_stage_{}_hooks", stage.index()), count as f64);
        scope.stat(&format!("shutdown_stage_{}_ms", stage.index()), elapsed.as_millis() as f64);
        metrics::record_shutdown_stage(stage.index(), count);
        tracing::info!(
            stage = stage.index(),
            name = stage.name(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Shutdown stage finished"
        );
    }
}

/// Time left until `deadline`, never less than [`MIN_BUDGET`].
pub fn remaining_budget(deadline: Instant, now: Instant) -> Duration {
    deadline.saturating_duration_since(now).max(MIN_BUDGET)
}

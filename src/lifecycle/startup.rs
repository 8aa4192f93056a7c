//! Startup orchestration.
//!
//! # Phases
//! ```text
//! do_initialize():  Initialize entries          (clients, pools, connections)
//! do_start():       Start entries → StartStage2 (listeners, consumers, schedulers)
//! ```
//!
//! # Design Decisions
//! - Fail fast: the first failing entry aborts its phase and is returned;
//!   callers treat it as fatal
//! - Entries run one at a time, in registration order, exactly once
//! - Listeners go in `Start`/`StartStage2` so traffic only arrives once
//!   every client finished `Initialize`

use std::future::Future;
use std::sync::{Mutex, PoisonError};

use futures_util::future::BoxFuture;
use thiserror::Error;

/// Startup phases, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupPhase {
    Initialize,
    Start,
    StartStage2,
}

impl StartupPhase {
    /// Phase name used in logs and errors.
    pub fn name(self) -> &'static str {
        match self {
            StartupPhase::Initialize => "initialize",
            StartupPhase::Start => "start",
            StartupPhase::StartStage2 => "start_stage2",
        }
    }
}

/// First failing startup entry of a phase.
#[derive(Debug, Error)]
#[error("startup {phase} entry {index} failed: {message}")]
pub struct StartupError {
    pub phase: &'static str,
    pub index: usize,
    pub message: String,
}

type Entry = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), String>> + Send>;

/// Ordered startup entries, each run exactly once.
#[derive(Default)]
pub struct StartupSequencer {
    initialize: Mutex<Vec<Entry>>,
    start: Mutex<Vec<Entry>>,
    start_stage2: Mutex<Vec<Entry>>,
}

impl StartupSequencer {
    /// Create an empty startup sequencer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `task` for `phase`. Errors are reported by their `Display` text.
    pub fn add<F, Fut, E>(&self, phase: StartupPhase, task: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: std::fmt::Display + 'static,
    {
        let entry: Entry = Box::new(move || -> BoxFuture<'static, Result<(), String>> {
            Box::pin(async move { task().await.map_err(|e| e.to_string()) })
        });
        self.list(phase).lock().unwrap_or_else(PoisonError::into_inner).push(entry);
    }

    /// Entries of `phase` not yet run.
    pub fn pending(&self, phase: StartupPhase) -> usize {
        self.list(phase).lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Run the `Initialize` entries.
    pub async fn do_initialize(&self) -> Result<(), StartupError> {
        self.run(StartupPhase::Initialize).await
    }

    /// Run the `Start` entries, then the `StartStage2` entries.
    pub async fn do_start(&self) -> Result<(), StartupError> {
        self.run(StartupPhase::Start).await?;
        self.run(StartupPhase::StartStage2).await
    }

    fn list(&self, phase: StartupPhase) -> &Mutex<Vec<Entry>> {
        match phase {
            StartupPhase::Initialize => &self.initialize,
            StartupPhase::Start => &self.start,
            StartupPhase::StartStage2 => &self.start_stage2,
        }
    }

    async fn run(&self, phase: StartupPhase) -> Result<(), StartupError> {
        let entries = std::mem::take(&mut *self.list(phase).lock().unwrap_or_else(PoisonError::into_inner));
        tracing::info!(phase = phase.name(), entries = entries.len(), "Startup phase started");

        for (index, entry) in entries.into_iter().enumerate() {
            if let Err(message) = entry().await {
                tracing::error!(phase = phase.name(), index, error = %message, "Startup entry failed");
                return Err(StartupError {
                    phase: phase.name(),
                    index,
                    message,
                });
            }
        }
        Ok(())
    }
}

//! Task scheduling subsystem.
//!
//! # Data Flow
//! ```text
//! caller scope ──link──▶ runner.rs   (one tokio task per unit, detached or joined)
//!                   └──▶ executor.rs (fixed worker set, queued)
//!                            │
//!                            ▼
//!                     failure.rs     (Result / panic → error record)
//!                            │
//!                            ▼
//!                     ActionLog::output(sink)
//! ```
//!
//! # Design Decisions
//! - Every unit gets exactly one action log, success or failure
//! - Failures stop at the unit boundary; the worker keeps running

pub mod executor;
pub mod failure;
pub mod runner;

pub use executor::{Executor, ExecutorError};
pub use failure::{record_failure, AppError, Failure};
pub use runner::{drain_on_shutdown, task_fn, Supervision, Task, TaskRunner};

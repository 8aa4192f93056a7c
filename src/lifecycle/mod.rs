//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     register entries → do_initialize (clients) → do_start (Start, StartStage2)
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → ShutdownSequencer::run
//!
//! Shutdown (shutdown.rs):
//!     set shutdown flag → optional delay → stages 0-6 inside app:stop
//!     → emit app:stop → stages 7-8
//! ```
//!
//! # Design Decisions
//! - Ordered startup: clients first, listeners last
//! - Ordered shutdown: stop intake, drain, release, stop logs, stop listener
//! - One deadline for the whole drain; hooks get what is left

pub mod shutdown;
pub mod signals;
pub mod startup;

pub use shutdown::{ShutdownSequencer, ShutdownState, Stage};
pub use startup::{StartupPhase, StartupSequencer};

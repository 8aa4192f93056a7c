//! Action-logged service runtime.
//!
//! Every unit of work (HTTP request, job, spawned task) gets one structured
//! action log. Spawned work links back to its parent. Shutdown runs in nine
//! ordered stages under one deadline.

pub mod config;
pub mod http;
pub mod lifecycle;
pub mod observability;
pub mod task;
pub mod trace;

pub use config::schema::AppConfig;
pub use http::WebServer;
pub use lifecycle::{ShutdownSequencer, StartupSequencer, Stage};
pub use task::{Executor, Failure, TaskRunner};
pub use trace::{ActionLog, TraceScope};

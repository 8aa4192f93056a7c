//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Units of work produce:
//!     → action logs (one JSON record per unit) → sink.rs
//!     → operational events (tracing macros)    → logging.rs
//!     → counters and gauges                    → metrics.rs
//!
//! Consumers:
//!     → stdout / log aggregation
//!     → Prometheus scrape (optional)
//! ```

pub mod logging;
pub mod metrics;
pub mod sink;

pub use sink::{LogShipper, MemorySink, RecordSink, TracingSink};

//! Action tracing subsystem.
//!
//! # Data Flow
//! ```text
//! boundary (http / job / consumer)
//!     → ActionLog::begin         (record.rs, id from id.rs)
//!     → &mut TraceScope          (scope.rs) handed to nested calls
//!         put_context / stat     (masked keys redacted by mask.rs)
//!     → end → output(sink)       (bodies filtered by mask.rs)
//!
//! spawned work:
//!     parent scope → ScopeLink → ActionLog::begin_child (fresh maps, ref_id)
//! ```
//!
//! # Design Decisions
//! - One record per unit of work, emitted exactly once
//! - Scopes are owned by one unit; children never share accumulators
//! - Masking happens at write time for context, at output for bodies

pub mod id;
pub mod mask;
pub mod record;
pub mod scope;

pub use record::{ActionLog, ActionResult};
pub use scope::{ScopeLink, TraceScope};

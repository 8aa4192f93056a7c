//! HTTP boundary.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (axum, health check, graceful stop)
//!     → middleware.rs (web action log, 503 after the shutdown delay, in-flight count)
//!     → application routes
//! ```

pub mod middleware;
pub mod server;

pub use middleware::{WebAction, HEALTH_PATH, WEB_ACTION_TYPE, X_CLIENT, X_REQUEST_ID};
pub use server::WebServer;

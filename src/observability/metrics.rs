//! Metrics collection and exposition.
//!
//! # Metrics
//! - `action_log_emitted_total` (counter): emitted records by result
//! - `executor_running` (gauge): tasks currently executing on the bounded executor
//! - `executor_free` (gauge): idle executor workers
//! - `executor_waiting` (gauge): tasks queued for a worker
//! - `shutdown_stage_hooks_total` (counter): hooks run per shutdown stage
//!
//! # Design Decisions
//! - Recording is a no-op until a recorder is installed
//! - The Prometheus exporter is optional and only installed by the binary

use std::net::SocketAddr;

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus exporter listening on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

/// Count an emitted action log by result.
pub fn record_action_log(result: &'static str) {
    counter!("action_log_emitted_total", "result" => result).increment(1);
}

/// Publish the executor gauges.
pub fn record_executor_state(name: &str, running: usize, free: usize, waiting: usize) {
    let name = name.to_string();
    gauge!("executor_running", "executor" => name.clone()).set(running as f64);
    gauge!("executor_free", "executor" => name.clone()).set(free as f64);
    gauge!("executor_waiting", "executor" => name).set(waiting as f64);
}

/// Count the hooks run by a shutdown stage.
pub fn record_shutdown_stage(stage: usize, hooks: usize) {
    counter!("shutdown_stage_hooks_total", "stage" => stage.to_string()).increment(hooks as u64);
}

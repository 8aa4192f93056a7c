//! Configuration schema definitions.
//!
//! All types derive Serde traits for deserialization from config files.
//! Every section has defaults so an empty file is a valid configuration.

use serde::{Deserialize, Serialize};

/// Root configuration of an application built on the toolkit.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct AppConfig {
    /// Graceful shutdown settings.
    pub shutdown: ShutdownConfig,

    /// Action log settings.
    pub trace: TraceConfig,

    /// Bounded executor settings.
    pub executor: ExecutorConfig,

    /// Diagnostic logging settings.
    pub logging: LoggingConfig,

    /// Metrics exporter settings.
    pub observability: ObservabilityConfig,

    /// HTTP listener settings.
    pub http: HttpConfig,
}

/// Shutdown deadline and pre-drain delay.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Total drain deadline in seconds (`SHUTDOWN_TIMEOUT_IN_SEC`).
    pub timeout_secs: u64,

    /// Optional delay between the shutdown flag and the first stage
    /// (`SHUTDOWN_DELAY_IN_SEC`). Lets load balancers notice the instance
    /// is going away before intake stops.
    pub delay_secs: Option<u64>,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 25,
            delay_secs: None,
        }
    }
}

/// Where action log records are written.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    /// Dedicated stdout shipper, stopped at shutdown stage 7.
    #[default]
    Stdout,
    /// Ordinary `tracing` events on target `action_log`.
    Tracing,
}

/// Action log settings.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct TraceConfig {
    /// Field names whose values are replaced in bodies and context.
    pub masked_fields: Vec<String>,

    pub sink: SinkKind,
}

/// Default executor settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Number of workers of the default executor.
    pub pool_size: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self { pool_size: 4 }
    }
}

/// Output format of diagnostic logs.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

/// Diagnostic logging settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`.
    pub level: String,

    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Json,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Enable the Prometheus exporter.
    pub metrics_enabled: bool,

    /// Exporter bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
        }
    }
}

//! actionkit service binary.
//!
//! # Lifecycle
//!
//! ```text
//! load config ─▶ logging / metrics ─▶ masked fields
//!      │
//!      ▼
//! sink ─▶ runner, executor, web server ─▶ register shutdown hooks
//!      │
//!      ▼
//! startup: Initialize ─▶ Start ─▶ StartStage2 (bind listener)
//!      │
//!      ▼
//! SIGTERM / SIGINT ─▶ shutdown stages 0-8 ─▶ exit
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use serde_json::{json, Value};
use tokio_util::task::TaskTracker;

use actionkit::config::loader::{load_config, parse_config};
use actionkit::config::schema::SinkKind;
use actionkit::http::{WebAction, WebServer};
use actionkit::lifecycle::{signals, ShutdownSequencer, StartupPhase, StartupSequencer};
use actionkit::observability::{logging, metrics, LogShipper, RecordSink, TracingSink};
use actionkit::task::{drain_on_shutdown, AppError, Executor, Failure, Supervision, TaskRunner};
use actionkit::trace::mask::register_masked_fields;

#[derive(Parser)]
#[command(name = "actionkit")]
#[command(about = "Action-logged service with staged graceful shutdown", long_about = None)]
struct Cli {
    /// TOML configuration file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[derive(Clone)]
struct AppState {
    runner: TaskRunner,
    tracker: TaskTracker,
    executor: Arc<Executor>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => parse_config("", |name| std::env::var(name).ok())?,
    };

    logging::init(&config.logging);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "actionkit starting");

    if config.observability.metrics_enabled {
        let addr: SocketAddr = config.observability.metrics_address.parse()?;
        metrics::init_metrics(addr);
    }
    register_masked_fields(&config.trace.masked_fields);

    let shutdown = ShutdownSequencer::from_config(&config.shutdown);
    let sink: Arc<dyn RecordSink> = match config.trace.sink {
        SinkKind::Stdout => {
            let shipper = LogShipper::stdout();
            shipper.register(&shutdown);
            shipper
        }
        SinkKind::Tracing => Arc::new(TracingSink),
    };

    let runner = TaskRunner::new(Arc::clone(&sink));
    let tracker = TaskTracker::new();
    drain_on_shutdown(tracker.clone(), &shutdown);

    let executor = Executor::new("default", config.executor.pool_size, Arc::clone(&sink));
    executor.register(&shutdown);

    let state = AppState {
        runner,
        tracker,
        executor,
    };
    let server = WebServer::new(routes(state), Arc::clone(&sink), shutdown.state());
    server.register(&shutdown);

    let addr: SocketAddr = config.http.bind_address.parse()?;
    let startup = StartupSequencer::new();
    let listener = Arc::clone(&server);
    startup.add(StartupPhase::StartStage2, move || async move {
        listener.serve(addr).await.map(|_| ())
    });
    startup.do_initialize().await?;
    startup.do_start().await?;
    tracing::info!(
        timeout_secs = config.shutdown.timeout_secs,
        delay_secs = ?config.shutdown.delay_secs,
        "actionkit started"
    );

    signals::wait_for_termination().await?;
    shutdown.run(sink.as_ref()).await;

    tracing::info!("Shutdown complete");
    Ok(())
}

fn routes(state: AppState) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/echo", post(echo))
        .with_state(state)
}

async fn status(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "executor": {
            "name": state.executor.name(),
            "running": state.executor.running(),
            "free": state.executor.free(),
            "waiting": state.executor.waiting(),
        },
        "joined_tasks": state.tracker.len(),
    }))
}

/// Echo a JSON body back. Masked fields are redacted in the record, not the reply.
async fn echo(
    State(state): State<AppState>,
    mut action: WebAction,
    body: String,
) -> Result<String, Failure> {
    let parsed: Value = serde_json::from_str(&body).map_err(|e| AppError::bad_request(e.to_string()))?;
    action.set_request_body(body.clone());
    action.set_response_body(body.clone());
    action.stat("body_bytes", body.len() as f64);

    let fields = parsed.as_object().map(|o| o.len()).unwrap_or_default();
    state.runner.run_fn_named(action.scope(), Supervision::Joined(&state.tracker), "audit", move |scope| {
        Box::pin(async move {
            scope.stat("fields", fields as f64);
            Ok::<(), Failure>(())
        })
    });
    Ok(body)
}

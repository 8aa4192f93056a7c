//! HTTP server setup and lifecycle.
//!
//! # Responsibilities
//! - Wrap the application's routes with the tracking middleware
//! - Serve the health check
//! - Bind the listener during startup
//! - Stop accepting, drain and close during shutdown
//!
//! # Shutdown hooks
//! ```text
//! stage 0 StopAcceptingExternal  log; the middleware answers 503 once the delay is over
//! stage 1 AwaitExternal          wait for in-flight requests within budget
//! stage 8 StopHttpListener       graceful axum stop
//! ```

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::http::middleware::{track, InFlight, WebState, HEALTH_PATH};
use crate::lifecycle::{ShutdownSequencer, ShutdownState, Stage};
use crate::observability::sink::RecordSink;

/// HTTP server wrapping application routes with action logging.
pub struct WebServer {
    app: Router,
    state: WebState,
    stop: CancellationToken,
    serving: Mutex<Option<JoinHandle<std::io::Result<()>>>>,
}

impl WebServer {
    /// Wrap `routes` with action logging and the health check.
    pub fn new(routes: Router, sink: Arc<dyn RecordSink>, shutdown: Arc<ShutdownState>) -> Arc<Self> {
        let state = WebState {
            sink,
            shutdown: Arc::clone(&shutdown),
            in_flight: Arc::new(InFlight::default()),
        };

        let app = Router::new()
            .route(
                HEALTH_PATH,
                get(move || {
                    let stopping = shutdown.is_shutdown();
                    async move { Json(json!({ "status": if stopping { "stopping" } else { "ok" } })) }
                }),
            )
            .merge(routes)
            .layer(axum::middleware::from_fn_with_state(state.clone(), track));

        Arc::new(Self {
            app,
            state,
            stop: CancellationToken::new(),
            serving: Mutex::new(None),
        })
    }

    /// The complete router, middleware included.
    pub fn router(&self) -> Router {
        self.app.clone()
    }

    /// Requests currently being handled.
    pub fn in_flight(&self) -> usize {
        self.state.in_flight.current()
    }

    /// Bind `addr` and serve in the background. Returns the bound address.
    pub async fn serve(&self, addr: SocketAddr) -> std::io::Result<SocketAddr> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        tracing::info!(address = %local, "HTTP server starting");

        let app = self.app.clone().into_make_service_with_connect_info::<SocketAddr>();
        let stop = self.stop.clone();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { stop.cancelled().await })
                .await
        });
        *self.serving.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(local)
    }

    /// Wait for in-flight requests. Returns `false` if `budget` ran out first.
    pub async fn await_idle(&self, budget: Duration) -> bool {
        let idle = self.state.in_flight.wait_idle(budget).await;
        if !idle {
            tracing::warn!(
                in_flight = self.in_flight(),
                budget_ms = budget.as_millis() as u64,
                "Requests still in flight at the deadline"
            );
        }
        idle
    }

    /// Stop the listener and wait up to `budget` for axum to finish.
    pub async fn stop(&self, budget: Duration) {
        self.stop.cancel();
        let handle = self.serving.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(handle) = handle else {
            return;
        };
        match tokio::time::timeout(budget, handle).await {
            Ok(Ok(Ok(()))) => tracing::info!("HTTP server stopped"),
            Ok(Ok(Err(e))) => tracing::error!(error = %e, "HTTP server failed"),
            Ok(Err(e)) => tracing::error!(error = %e, "HTTP server task aborted"),
            Err(_) => tracing::warn!("HTTP server did not stop before the deadline"),
        }
    }

    /// Register the stage-0, stage-1 and stage-8 shutdown hooks.
    pub fn register(self: &Arc<Self>, shutdown: &ShutdownSequencer) {
        let server = Arc::clone(self);
        shutdown.add_async(Stage::StopAcceptingExternal, move |_| async move {
            tracing::info!(in_flight = server.in_flight(), "HTTP server refusing new requests");
        });
        let server = Arc::clone(self);
        shutdown.add_async(Stage::AwaitExternal, move |budget| async move {
            server.await_idle(budget).await;
        });
        let server = Arc::clone(self);
        shutdown.add_async(Stage::StopHttpListener, move |budget| async move {
            server.stop(budget).await;
        });
    }
}

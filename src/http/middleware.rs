//! Per-request action logging.
//!
//! # Responsibilities
//! - Begin a `web` record for every request except the health check
//! - Refuse new work with 503 once the pre-shutdown delay has elapsed
//!   (requests arriving during the delay are still served)
//! - Count in-flight requests for the stage-1 drain
//! - Map the response to the record's result (5xx error, 4xx warn)
//!
//! # Data Flow
//! ```text
//! request
//!     → track (begin record, client, request_id, in-flight +1)
//!     → handler (owns the record through WebAction, hands it back on drop)
//!     → track (status, reported failure or panic, in-flight -1)
//!     → record emitted to the sink
//! ```

use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use axum::extract::{ConnectInfo, FromRequestParts, Request, State};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures_util::FutureExt;
use serde_json::json;
use tokio::sync::Notify;

use crate::lifecycle::ShutdownState;
use crate::observability::sink::RecordSink;
use crate::task::failure::{intercept, record_failure, Failure, INTERNAL_ERROR};
use crate::trace::{ActionLog, ActionResult, TraceScope};

/// Action type of request records.
pub const WEB_ACTION_TYPE: &str = "web";

/// Health check route, served even while shutting down and never recorded.
pub const HEALTH_PATH: &str = "/health-check";
/// Request correlation header, copied into `context.request_id`.
pub const X_REQUEST_ID: &str = "x-request-id";
/// Caller name header; the peer address is used when absent.
pub const X_CLIENT: &str = "x-client";

/// Shared state of the tracking middleware.
#[derive(Clone)]
pub struct WebState {
    pub(crate) sink: Arc<dyn RecordSink>,
    pub(crate) shutdown: Arc<ShutdownState>,
    pub(crate) in_flight: Arc<InFlight>,
}

/// Exclusive handle on the current request's record.
///
/// Extracted by handlers. Not `Clone`: whoever holds it is the only writer.
/// Dropping it hands the record back to the middleware. A handle that
/// outlives the response completes and emits the record itself on drop.
/// Work that should run concurrently goes through the task runner from
/// [`WebAction::scope`] and gets its own child record.
pub struct WebAction {
    log: ActionLog,
    slot: Arc<Slot>,
}

impl WebAction {
    /// Id of the request's record.
    pub fn id(&self) -> &str {
        self.log.id()
    }

    /// Action name, `http:<method>:<path>`.
    pub fn action(&self) -> &str {
        self.log.action()
    }

    /// The request's scope, e.g. as the parent of child tasks.
    pub fn scope(&self) -> &TraceScope {
        self.log.scope()
    }

    /// Mutable scope for nested calls made by the handler.
    pub fn scope_mut(&mut self) -> &mut TraceScope {
        self.log.scope_mut()
    }

    /// Append context values to the record.
    pub fn put_context<I, S>(&mut self, key: &str, values: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.log.put_context(key, values);
    }

    /// Overwrite a stat on the record.
    pub fn stat(&mut self, key: &str, value: f64) {
        self.log.stat(key, value);
    }

    /// Request body, masked when the record is emitted.
    pub fn set_request_body(&mut self, body: impl Into<String>) {
        self.log.set_request_body(body);
    }

    /// Response body, masked when the record is emitted.
    pub fn set_response_body(&mut self, body: impl Into<String>) {
        self.log.set_response_body(body);
    }
}

impl Drop for WebAction {
    fn drop(&mut self) {
        let mut log = std::mem::replace(&mut self.log, ActionLog::vacant());
        let mut handoff = self.slot.lock();
        match handoff.pending.take() {
            Some(completion) => {
                drop(handoff);
                completion.apply(&mut log);
            }
            None => handoff.log = Some(log),
        }
    }
}

impl<S: Send + Sync> FromRequestParts<S> for WebAction {
    type Rejection = StatusCode;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let Some(ActionSlot(slot)) = parts.extensions.get::<ActionSlot>().cloned() else {
            tracing::error!("WebAction extracted outside the tracking middleware");
            return Err(StatusCode::INTERNAL_SERVER_ERROR);
        };
        let log = slot.lock().log.take();
        match log {
            Some(log) => Ok(WebAction { log, slot }),
            None => {
                tracing::error!("WebAction extracted twice for one request");
                Err(StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }
}

/// Hand-off point for a request's record between middleware and handler.
/// The lock is held only to move the record in or out, never while writing it.
#[derive(Default)]
struct Slot(Mutex<Handoff>);

#[derive(Default)]
struct Handoff {
    log: Option<ActionLog>,
    pending: Option<Completion>,
}

impl Slot {
    fn lock(&self) -> MutexGuard<'_, Handoff> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Clone)]
struct ActionSlot(Arc<Slot>);

/// How a finished request maps onto its record.
struct Completion {
    sink: Arc<dyn RecordSink>,
    status: StatusCode,
    failure: Option<Arc<Failure>>,
}

impl Completion {
    fn apply(self, log: &mut ActionLog) {
        let status = self.status;
        match self.failure {
            Some(failure) if status.is_server_error() => record_failure(log, &failure),
            Some(failure) => {
                log.put_context("status", [status.as_str()]);
                log.put_context("error_code", [failure.code()]);
            }
            None if log.error_code().is_none() => log.put_context("status", [status.as_str()]),
            None => {}
        }

        if status.is_server_error() {
            log.escalate(ActionResult::Error);
        } else if status.is_client_error() {
            log.escalate(ActionResult::Warn);
        }

        log.end();
        log.output(self.sink.as_ref());
    }
}

/// Failure returned by a handler, handed from the response to the middleware.
#[derive(Clone)]
struct ReportedFailure(Arc<Failure>);

impl IntoResponse for Failure {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let message = match &self {
            Failure::App(e) => e.to_string(),
            Failure::Generic(_) | Failure::Unknown(_) => "internal error".to_string(),
        };
        let mut response = (status, Json(json!({ "error_code": self.code(), "message": message }))).into_response();
        response.extensions_mut().insert(ReportedFailure(Arc::new(self)));
        response
    }
}

/// In-flight request counter.
#[derive(Debug, Default)]
pub(crate) struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

pub(crate) struct InFlightGuard(Arc<InFlight>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

impl InFlight {
    pub(crate) fn enter(self: &Arc<Self>) -> InFlightGuard {
        self.count.fetch_add(1, Ordering::SeqCst);
        InFlightGuard(Arc::clone(self))
    }

    pub(crate) fn current(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Wait until no request is in flight. Returns `false` if `budget` ran out first.
    pub(crate) async fn wait_idle(&self, budget: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + budget;
        loop {
            let idle = self.idle.notified();
            if self.current() == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, idle).await.is_err() {
                return self.current() == 0;
            }
        }
    }
}

pub(crate) async fn track(State(state): State<WebState>, mut request: Request, next: Next) -> Response {
    if request.uri().path() == HEALTH_PATH {
        return next.run(request).await;
    }

    let mut log = ActionLog::begin(
        format!("http:{}:{}", request.method(), request.uri().path()),
        WEB_ACTION_TYPE,
    );
    if let Some(client) = client_of(&request) {
        log.set_client(client);
    }
    if let Some(request_id) = header(&request, X_REQUEST_ID) {
        log.put_context("request_id", [request_id]);
    }

    if state.shutdown.is_after_shutdown_delay() {
        log.put_context("rejected", ["shutdown"]);
        log.end_with(ActionResult::Warn);
        log.output(state.sink.as_ref());
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    let _guard = state.in_flight.enter();
    let slot = Arc::new(Slot::default());
    slot.lock().log = Some(log);
    request.extensions_mut().insert(ActionSlot(Arc::clone(&slot)));

    let outcome = AssertUnwindSafe(next.run(request)).catch_unwind().await;

    let mut handoff = slot.lock();
    let mut log = handoff.log.take();
    let (response, failure) = match outcome {
        Ok(mut response) => {
            let failure = response
                .extensions_mut()
                .remove::<ReportedFailure>()
                .map(|ReportedFailure(failure)| failure);
            (response, failure)
        }
        Err(payload) => {
            let failure = match log.as_mut() {
                Some(log) => {
                    intercept(log, Err(payload));
                    None
                }
                None => Some(Arc::new(Failure::from_panic(payload))),
            };
            let body = json!({ "error_code": INTERNAL_ERROR, "message": "internal error" });
            ((StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response(), failure)
        }
    };

    let completion = Completion {
        sink: Arc::clone(&state.sink),
        status: response.status(),
        failure,
    };
    match log.as_mut() {
        Some(log) => {
            drop(handoff);
            completion.apply(log);
        }
        None => {
            tracing::debug!("Request record still held past the response");
            handoff.pending = Some(completion);
        }
    }
    response
}

fn header(request: &Request, name: &str) -> Option<String> {
    request
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn client_of(request: &Request) -> Option<String> {
    header(request, X_CLIENT).or_else(|| {
        request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string())
    })
}

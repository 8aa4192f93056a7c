//! Failure interception at the unit-of-work boundary.
//!
//! # Failure shapes
//! - [`Failure::App`]: typed application error with code, status and the
//!   location that raised it; surfaced verbatim
//! - [`Failure::Generic`]: any other error, only a message survives
//! - [`Failure::Unknown`]: a panic payload that is not an error
//!
//! Generic and unknown failures are reported as `INTERNAL_ERROR` / 500.
//!
//! # Design Decisions
//! - Interception happens once, at the boundary, and always marks the record
//!   failed; nothing is rethrown past it
//! - Panic stack traces are captured by a process-wide hook at the panic site
//!   and picked up on the same thread right after `catch_unwind`

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::panic::Location;
use std::sync::Once;

use thiserror::Error;

use crate::trace::ActionLog;

/// Error code for failures without an explicit one.
pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";

/// HTTP-style status for failures without an explicit one.
pub const INTERNAL_STATUS: u16 = 500;

/// Typed application error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct AppError {
    code: String,
    status: u16,
    message: String,
    location: String,
}

impl AppError {
    /// Create an error, recording the caller's source location.
    #[track_caller]
    pub fn new(code: impl Into<String>, status: u16, message: impl Into<String>) -> Self {
        let caller = Location::caller();
        Self {
            code: code.into(),
            status,
            message: message.into(),
            location: format!("{}:{}", caller.file(), caller.line()),
        }
    }

    /// 404 `NOT_FOUND` error.
    #[track_caller]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new("NOT_FOUND", 404, message)
    }

    /// 400 `BAD_REQUEST` error.
    #[track_caller]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new("BAD_REQUEST", 400, message)
    }

    /// Error code written to `error_code`.
    pub fn code(&self) -> &str {
        &self.code
    }

    /// HTTP-style status.
    pub fn status(&self) -> u16 {
        self.status
    }

    /// `file:line` that created the error.
    pub fn location(&self) -> &str {
        &self.location
    }
}

/// Anything that can end a unit of work abnormally.
#[derive(Debug, Error)]
pub enum Failure {
    #[error(transparent)]
    App(#[from] AppError),

    #[error("{0}")]
    Generic(String),

    #[error("{0}")]
    Unknown(String),
}

impl Failure {
    /// Wrap any displayable error as a generic failure.
    pub fn generic(err: impl std::fmt::Display) -> Self {
        Failure::Generic(err.to_string())
    }

    /// Convert a caught panic payload. Only an `AppError` payload keeps its
    /// shape; messages and anything else become [`Failure::Unknown`].
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let payload = match payload.downcast::<String>() {
            Ok(message) => return Failure::Unknown(*message),
            Err(payload) => payload,
        };
        match payload.downcast::<&'static str>() {
            Ok(message) => Failure::Unknown((*message).to_string()),
            Err(payload) => match payload.downcast::<AppError>() {
                Ok(app) => Failure::App(*app),
                Err(_) => Failure::Unknown("panic with a non-string payload".to_string()),
            },
        }
    }

    /// Error code written to `error_code`.
    pub fn code(&self) -> &str {
        match self {
            Failure::App(e) => e.code(),
            Failure::Generic(_) | Failure::Unknown(_) => INTERNAL_ERROR,
        }
    }

    /// HTTP-style status.
    pub fn status(&self) -> u16 {
        match self {
            Failure::App(e) => e.status(),
            Failure::Generic(_) | Failure::Unknown(_) => INTERNAL_STATUS,
        }
    }

    /// Source location, known for application errors only.
    pub fn location(&self) -> Option<&str> {
        match self {
            Failure::App(e) => Some(e.location()),
            Failure::Generic(_) | Failure::Unknown(_) => None,
        }
    }
}

impl From<std::io::Error> for Failure {
    fn from(err: std::io::Error) -> Self {
        Failure::generic(err)
    }
}

impl From<serde_json::Error> for Failure {
    fn from(err: serde_json::Error) -> Self {
        Failure::generic(err)
    }
}

thread_local! {
    static PANIC_TRACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

static PANIC_HOOK: Once = Once::new();

/// Chain a panic hook that keeps the panicking thread's stack trace.
pub fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let trace = format!("{}\n{}", info, Backtrace::force_capture());
            PANIC_TRACE.with(|slot| *slot.borrow_mut() = Some(trace));
            previous(info);
        }));
    });
}

fn take_panic_trace() -> Option<String> {
    PANIC_TRACE.with(|slot| slot.borrow_mut().take())
}

/// Mark `log` failed with `failure`, capturing the current stack trace.
pub fn record_failure(log: &mut ActionLog, failure: &Failure) {
    record_failure_with_trace(log, failure, Backtrace::force_capture().to_string());
}

fn record_failure_with_trace(log: &mut ActionLog, failure: &Failure, stack_trace: String) {
    log.put_context("status", [failure.status().to_string()]);
    if let Some(location) = failure.location() {
        log.put_context("location", [location]);
    }
    log.fail(failure.code(), failure.to_string(), stack_trace);

    tracing::warn!(
        action = %log.action(),
        id = %log.id(),
        error_code = %failure.code(),
        error = %failure,
        "Unit of work failed"
    );
}

/// Apply the outcome of a guarded unit body to its record.
pub(crate) fn intercept(
    log: &mut ActionLog,
    outcome: Result<Result<(), Failure>, Box<dyn Any + Send>>,
) {
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(failure)) => record_failure(log, &failure),
        Err(payload) => {
            let trace = take_panic_trace().unwrap_or_else(|| Backtrace::force_capture().to_string());
            record_failure_with_trace(log, &Failure::from_panic(payload), trace);
        }
    }
}

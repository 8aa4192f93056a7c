//! Record sinks: where completed action logs go.
//!
//! # Implementations
//! - [`TracingSink`]: one `tracing` event per record on target `action_log`
//! - [`LogShipper`]: buffered background writer of newline-delimited JSON,
//!   stopped at shutdown stage 7 after flushing what is queued
//! - [`MemorySink`]: keeps parsed records in memory, for tests and tooling
//!
//! # Design Decisions
//! - `emit` never blocks and never fails; a sink that cannot ship falls back
//!   to the tracing sink so records are not silently dropped
//! - The shipper is stopped late so the `app:stop` record still gets shipped

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::lifecycle::shutdown::{ShutdownSequencer, Stage};

/// Extra time granted to the shipper on top of the shutdown budget.
pub const FLUSH_GRACE: Duration = Duration::from_secs(2);

/// Destination for serialized action logs.
pub trait RecordSink: Send + Sync {
    /// Accept one serialized record (a single JSON object, no newline).
    fn emit(&self, record: &str);
}

/// Emits records through the `tracing` subscriber.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl RecordSink for TracingSink {
    fn emit(&self, record: &str) {
        tracing::info!(target: "action_log", "{}", record);
    }
}

/// Buffered newline-delimited JSON writer running on its own task.
pub struct LogShipper {
    tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl LogShipper {
    /// Start shipping to `writer`. Must be called inside a Tokio runtime.
    pub fn spawn<W>(writer: W) -> Arc<Self>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(ship(rx, writer));
        Arc::new(Self {
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Start shipping to the process's standard output.
    pub fn stdout() -> Arc<Self> {
        Self::spawn(tokio::io::stdout())
    }

    /// Stop accepting records and wait for the queue to be written out.
    pub async fn stop(&self, budget: Duration) {
        drop(self.tx.lock().unwrap_or_else(PoisonError::into_inner).take());

        let worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(worker) = worker else {
            return;
        };

        match tokio::time::timeout(budget + FLUSH_GRACE, worker).await {
            Ok(Ok(())) => tracing::info!("Log shipper stopped"),
            Ok(Err(e)) => tracing::error!(error = %e, "Log shipper task failed"),
            Err(_) => tracing::warn!(budget_ms = budget.as_millis() as u64, "Log shipper did not flush in time"),
        }
    }

    /// Register the stage-7 stop hook.
    pub fn register(self: &Arc<Self>, shutdown: &ShutdownSequencer) {
        let shipper = Arc::clone(self);
        shutdown.add_async(Stage::StopLogShipping, move |budget| async move {
            shipper.stop(budget).await;
        });
    }

    /// Whether the writer task is still accepting records.
    pub fn is_running(&self) -> bool {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }
}

impl RecordSink for LogShipper {
    fn emit(&self, record: &str) {
        let guard = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        let undelivered = match guard.as_ref() {
            Some(tx) => tx.send(record.to_string()).err().map(|e| e.0),
            None => Some(record.to_string()),
        };
        drop(guard);

        if let Some(record) = undelivered {
            TracingSink.emit(&record);
        }
    }
}

async fn ship<W>(mut rx: mpsc::UnboundedReceiver<String>, mut writer: W)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    while let Some(mut line) = rx.recv().await {
        line.push('\n');
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            tracing::warn!(error = %e, "Failed to ship action log");
        }
    }
    if let Err(e) = writer.flush().await {
        tracing::warn!(error = %e, "Failed to flush action logs");
    }
}

/// Collects records in memory as parsed JSON values.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<serde_json::Value>>>,
}

impl MemorySink {
    /// Every record emitted so far.
    pub fn records(&self) -> Vec<serde_json::Value> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Records whose `action` equals `action`.
    pub fn find(&self, action: &str) -> Vec<serde_json::Value> {
        self.records()
            .into_iter()
            .filter(|r| r["action"] == action)
            .collect()
    }
}

impl RecordSink for MemorySink {
    fn emit(&self, record: &str) {
        match serde_json::from_str(record) {
            Ok(value) => self
                .records
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(value),
            Err(e) => tracing::warn!(error = %e, "Discarding unparsable record"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shipper_writes_lines_and_flushes_on_stop() {
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        let shipper = LogShipper::spawn(client);

        shipper.emit(r#"{"id":"1"}"#);
        shipper.emit(r#"{"id":"2"}"#);
        shipper.stop(Duration::from_secs(1)).await;
        assert!(!shipper.is_running());

        let mut out = String::new();
        tokio::io::AsyncReadExt::read_to_string(&mut server, &mut out)
            .await
            .unwrap();
        assert_eq!(out, "{\"id\":\"1\"}\n{\"id\":\"2\"}\n");
    }

    #[tokio::test]
    async fn test_shipper_falls_back_after_stop() {
        let shipper = LogShipper::spawn(tokio::io::sink());
        shipper.stop(Duration::from_secs(1)).await;
        // must not panic or block
        shipper.emit(r#"{"id":"late"}"#);
        shipper.stop(Duration::from_secs(1)).await;
    }

    #[test]
    fn test_memory_sink_parses_records() {
        let sink = MemorySink::default();
        sink.emit(r#"{"action":"a"}"#);
        sink.emit("not json");
        assert_eq!(sink.records().len(), 1);
        assert_eq!(sink.find("a").len(), 1);
    }
}

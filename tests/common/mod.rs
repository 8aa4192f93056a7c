//! Shared utilities for integration testing.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use actionkit::lifecycle::{ShutdownSequencer, Stage};
use actionkit::observability::MemorySink;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Ordered log of `(stage, budget)` pairs seen by recording hooks.
pub type Seen = Arc<Mutex<Vec<(Stage, Duration)>>>;

/// Register a hook on every stage that records its budget.
#[allow(dead_code)]
pub fn record_all_stages(shutdown: &ShutdownSequencer) -> Seen {
    let seen: Seen = Arc::default();
    for stage in Stage::ALL {
        let seen = Arc::clone(&seen);
        shutdown.add_async(stage, move |budget| async move {
            seen.lock().unwrap().push((stage, budget));
        });
    }
    seen
}

/// Records of the given action type, in emission order.
#[allow(dead_code)]
pub fn records_of_type(sink: &MemorySink, action_type: &str) -> Vec<Value> {
    sink.records()
        .into_iter()
        .filter(|r| r["action_type"] == action_type)
        .collect()
}

/// Send a raw HTTP/1.1 request and return the status code and body.
#[allow(dead_code)]
pub async fn http_request(addr: std::net::SocketAddr, method: &str, path: &str, body: &str) -> (u16, String) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!(
        "{} {} HTTP/1.1\r\nHost: localhost\r\nX-Client: integration\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        method,
        path,
        body.len(),
        body
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut raw = String::new();
    stream.read_to_string(&mut raw).await.unwrap();

    let status = raw
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or_default();
    let body = raw.split("\r\n\r\n").nth(1).unwrap_or_default().to_string();
    (status, body)
}

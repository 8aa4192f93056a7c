//! HTTP boundary served over a real socket, through shutdown.

mod common;

use std::sync::Arc;
use std::time::Duration;

use actionkit::http::{WebAction, WebServer};
use actionkit::lifecycle::ShutdownSequencer;
use actionkit::observability::MemorySink;
use axum::routing::get;
use axum::Router;

fn routes() -> Router {
    Router::new().route(
        "/slow",
        get(|mut action: WebAction| async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            action.stat("slept_ms", 200.0);
            "done"
        }),
    )
}

#[tokio::test]
async fn test_in_flight_request_finishes_during_shutdown() {
    let sink = MemorySink::default();
    let shutdown = ShutdownSequencer::new(Duration::from_secs(5), None);
    let server = WebServer::new(routes(), Arc::new(sink.clone()), shutdown.state());
    server.register(&shutdown);
    let addr = server.serve("127.0.0.1:0".parse().unwrap()).await.unwrap();

    let (status, body) = common::http_request(addr, "GET", "/health-check", "").await;
    assert_eq!(status, 200);
    assert!(body.contains("ok"));

    let slow = tokio::spawn(common::http_request(addr, "GET", "/slow", ""));
    while server.in_flight() == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    shutdown.run(&sink).await;

    let (status, body) = slow.await.unwrap();
    assert_eq!(status, 200);
    assert_eq!(body, "done");

    let record = &sink.find("http:GET:/slow")[0];
    assert_eq!(record["result"], "ok");
    assert_eq!(record["client"], "integration");
    assert_eq!(record["stat.slept_ms"], 200.0);
    assert!(sink.find("http:GET:/health-check").is_empty());

    // the slow request was recorded before app:stop was emitted
    let actions: Vec<String> = sink.records().iter().map(|r| r["action"].as_str().unwrap().to_string()).collect();
    let slow_at = actions.iter().position(|a| a == "http:GET:/slow").unwrap();
    let stop_at = actions.iter().position(|a| a == "app:stop").unwrap();
    assert!(slow_at < stop_at);

    assert!(tokio::net::TcpStream::connect(addr).await.is_err());
}

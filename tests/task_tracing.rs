//! Record linkage across nested units of work.

mod common;

use std::sync::Arc;
use std::time::Duration;

use actionkit::observability::{LogShipper, MemorySink};
use actionkit::task::{task_fn, AppError, Executor, Failure, Supervision, Task, TaskRunner};
use actionkit::trace::mask::register_masked_fields;
use actionkit::trace::{ActionLog, TraceScope};
use serde_json::Value;
use tokio::io::AsyncReadExt;
use tokio_util::task::TaskTracker;

struct Reindex {
    shards: u32,
}

impl Task for Reindex {
    async fn execute(self, scope: &mut TraceScope) -> Result<(), Failure> {
        for shard in 0..self.shards {
            scope.put_context("shard", [shard.to_string()]);
            scope.increase_stat("shards_done", 1.0);
        }
        if self.shards == 0 {
            return Err(AppError::bad_request("nothing to reindex").into());
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_grandchild_chains_action_and_ref_id() {
    let sink = MemorySink::default();
    let runner = TaskRunner::new(Arc::new(sink.clone()));
    let tracker = TaskTracker::new();
    let root = ActionLog::begin("job:nightly", "job");

    let nested = runner.clone();
    let inner_tracker = tracker.clone();
    runner.run_fn_named(root.scope(), Supervision::Joined(&tracker), "outer", move |scope| {
        Box::pin(async move {
            nested.run_task_named(scope, Supervision::Joined(&inner_tracker), "inner", Reindex { shards: 2 });
            Ok::<(), Failure>(())
        })
    });

    // inner is spawned on the tracker before outer completes
    tracker.close();
    tracker.wait().await;

    let outer = &sink.find("job:nightly:task:outer")[0];
    let inner = &sink.find("job:nightly:task:outer:task:inner")[0];
    assert_eq!(outer["ref_id"], root.id());
    assert_eq!(inner["ref_id"], outer["id"]);
    assert_eq!(inner["context.shard"], serde_json::json!(["0", "1"]));
    assert_eq!(inner["stat.shards_done"], 2.0);
    assert!(outer.get("stat.shards_done").is_none());
}

#[tokio::test]
async fn test_failures_stay_inside_their_unit() {
    let sink = MemorySink::default();
    let executor = Executor::new("isolation", 1, Arc::new(sink.clone()));
    let parent = TraceScope::detached();

    executor.submit_named(&parent, "empty", Reindex { shards: 0 }).unwrap();
    executor
        .submit_named(&parent, "boom", task_fn(|_| {
            Box::pin(async move {
                let shards: Vec<u32> = Vec::new();
                let _ = shards[3];
                Ok::<(), Failure>(())
            })
        }))
        .unwrap();
    executor.submit_named(&parent, "after", Reindex { shards: 1 }).unwrap();
    executor.shutdown();
    assert!(executor.await_termination(Duration::from_secs(1)).await);

    let results: Vec<(String, String)> = sink
        .records()
        .iter()
        .map(|r| (r["action"].as_str().unwrap().to_string(), r["result"].as_str().unwrap().to_string()))
        .collect();
    assert_eq!(
        results,
        vec![
            ("empty".to_string(), "error".to_string()),
            ("boom".to_string(), "error".to_string()),
            ("after".to_string(), "ok".to_string()),
        ]
    );
    assert_eq!(sink.find("empty")[0]["error_code"], "BAD_REQUEST");
    assert_eq!(sink.find("boom")[0]["error_code"], "INTERNAL_ERROR");
}

#[tokio::test]
async fn test_shipper_writes_masked_ndjson() {
    register_masked_fields(["api_key"]);
    let (writer, mut reader) = tokio::io::duplex(64 * 1024);
    let shipper = LogShipper::spawn(writer);

    let mut log = ActionLog::begin("http:POST:/keys", "web");
    log.set_request_body(r#"{"name":"ci","api_key":"sk-123"}"#);
    log.put_context("api_key", ["sk-123"]);
    log.output(shipper.as_ref());
    shipper.stop(Duration::from_secs(1)).await;
    assert!(!shipper.is_running());

    let mut out = String::new();
    reader.read_to_string(&mut out).await.unwrap();
    let lines: Vec<&str> = out.lines().collect();
    assert_eq!(lines.len(), 1);
    assert!(!out.contains("sk-123"));

    let record: Value = serde_json::from_str(lines[0]).unwrap();
    assert_eq!(record["request_body"], r#"{"name":"ci","api_key":"******"}"#);
    assert_eq!(record["context.api_key"], "******");
}

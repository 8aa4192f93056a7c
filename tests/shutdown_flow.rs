//! End-to-end graceful shutdown behavior.

mod common;

use std::sync::Arc;
use std::time::Duration;

use actionkit::lifecycle::shutdown::MIN_BUDGET;
use actionkit::lifecycle::{ShutdownSequencer, Stage};
use actionkit::observability::MemorySink;
use actionkit::task::{drain_on_shutdown, Executor, Failure, Supervision, TaskRunner};
use actionkit::trace::TraceScope;
use tokio_util::task::TaskTracker;

#[tokio::test(start_paused = true)]
async fn test_overrunning_stage_does_not_starve_later_stages() {
    let sink = MemorySink::default();
    let shutdown = ShutdownSequencer::new(Duration::from_secs(2), None);
    let seen = common::record_all_stages(&shutdown);

    // registered after the recording hook, so it runs second within stage 6
    shutdown.add_async(Stage::ReleaseClients, |budget| async move {
        let _ = tokio::time::timeout(budget, tokio::time::sleep(Duration::from_secs(5))).await;
    });

    let started = tokio::time::Instant::now();
    shutdown.run(&sink).await;
    let elapsed = started.elapsed();

    assert!(elapsed >= Duration::from_secs(2));
    assert!(elapsed < Duration::from_secs(4), "took {:?}", elapsed);

    let seen = seen.lock().unwrap();
    let stages: Vec<Stage> = seen.iter().map(|(stage, _)| *stage).collect();
    assert_eq!(stages, Stage::ALL.to_vec());

    let (last, budget) = seen[8];
    assert_eq!(last, Stage::StopHttpListener);
    assert!(budget >= MIN_BUDGET);

    let stop = &sink.find("app:stop")[0];
    assert_eq!(stop["action_type"], "app");
    assert_eq!(stop["stat.shutdown_timeout_ms"], 2000.0);
    assert!(stop.get("stat.shutdown_stage_6_ms").is_some());
    assert_eq!(stop["stat.shutdown_stage_6_hooks"], 2.0);
    assert!(stop.get("stat.shutdown_stage_8_ms").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_delay_runs_before_any_stage() {
    let sink = MemorySink::default();
    let shutdown = Arc::new(ShutdownSequencer::new(Duration::from_secs(5), Some(Duration::from_secs(3))));
    let seen = common::record_all_stages(&shutdown);

    let running = {
        let shutdown = Arc::clone(&shutdown);
        let sink = sink.clone();
        tokio::spawn(async move { shutdown.run(&sink).await })
    };

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(shutdown.is_shutdown());
    assert!(!shutdown.is_after_shutdown_delay());
    assert!(seen.lock().unwrap().is_empty());

    running.await.unwrap();
    assert!(shutdown.is_after_shutdown_delay());
    assert_eq!(seen.lock().unwrap().len(), 9);
}

#[tokio::test]
async fn test_joined_tasks_and_executor_drain_before_release() {
    let sink = MemorySink::default();
    let shutdown = ShutdownSequencer::new(Duration::from_secs(5), None);

    let tracker = TaskTracker::new();
    drain_on_shutdown(tracker.clone(), &shutdown);
    let executor = Executor::new("drain", 2, Arc::new(sink.clone()));
    executor.register(&shutdown);

    let released = sink.clone();
    shutdown.add_async(Stage::ReleaseClients, move |_| async move {
        // everything scheduled earlier has already been recorded
        assert_eq!(common::records_of_type(&released, "task").len(), 3);
        assert_eq!(common::records_of_type(&released, "executor").len(), 4);
    });

    let runner = TaskRunner::new(Arc::new(sink.clone()));
    let parent = TraceScope::detached();
    for i in 0..3 {
        runner.run_fn_named(&parent, Supervision::Joined(&tracker), &format!("joined-{}", i), |_| {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                Ok::<(), Failure>(())
            })
        });
    }
    for i in 0..4 {
        executor
            .submit_named(&parent, &format!("queued-{}", i), actionkit::task::task_fn(|_| {
                Box::pin(async move {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok::<(), Failure>(())
                })
            }))
            .unwrap();
    }

    shutdown.run(&sink).await;

    assert!(sink.find("app:stop")[0].get("stat.shutdown_stage_3_ms").is_some());
    assert!(executor.submit_named(&parent, "late", actionkit::task::task_fn(|_| {
        Box::pin(async move { Ok::<(), Failure>(()) })
    })).is_err());
}

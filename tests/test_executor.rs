mod common;

use common::*;
use parking_lot::Mutex;
use phaseflow::context::RunContext;
use phaseflow::{
    Engine, EngineConfig, EngineContext, EngineError, Graph, GraphExecutor, Phase, ResultCode,
    RunRequest, RuntimeConfig, ThreadManagerMode,
};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;

fn pooled(watchdog_threads: usize, node_threads: usize, max_queued_runs: usize) -> EngineContext {
    let mut config = EngineConfig::default();
    config.threads.mode = ThreadManagerMode::Pooled;
    config.threads.watchdog_threads = Some(watchdog_threads);
    config.threads.node_threads = Some(node_threads);
    config.limits.max_queued_runs = max_queued_runs;
    Engine::init(config).unwrap()
}

fn small_graph(id: &str) -> Arc<Graph> {
    Arc::new(Graph::new(id, id).with_phase(Phase::new(0).with_node(Generator::new("GEN", 10))))
}

#[tokio::test]
async fn test_queue_limit_rejects_synchronously() {
    let context = pooled(1, 4, 10);
    let executor = GraphExecutor::new(&context);

    let blocker = Stalling::new("BLOCKER", 1);
    let blocking_run = executor
        .submit(
            RunRequest::new(Arc::new(
                Graph::new("blocker", "blocker").with_phase(Phase::new(0).with_node(blocker.clone())),
            ))
            .config(quiet_config()),
        )
        .unwrap();
    blocker.started.notified().await;
    assert_eq!(executor.queued_runs(), 0);

    let mut queued = Vec::new();
    for i in 0..10 {
        let graph = small_graph(&format!("queued-{i}"));
        queued.push(
            executor
                .submit(RunRequest::new(graph).config(quiet_config()))
                .unwrap(),
        );
    }
    assert_eq!(executor.queued_runs(), 10);

    let running_nodes = executor.running_nodes();
    let free = executor.free_capacity();
    let err = executor
        .submit(RunRequest::new(small_graph("overflow")).config(quiet_config()))
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::ResourceExhaustion { current: 11, limit: 10, .. }
    ));
    assert_eq!(executor.running_nodes(), running_nodes);
    assert_eq!(executor.free_capacity(), free);
    assert_eq!(executor.queued_runs(), 10);

    blocking_run.abort();
    assert_eq!(blocking_run.wait().await.status, ResultCode::Aborted);
    for handle in queued {
        assert_eq!(handle.wait().await.status, ResultCode::FinishedOk);
    }
    assert_eq!(executor.queued_runs(), 0);
    assert_eq!(executor.stats().total_rejections, 1);
    assert_eq!(executor.free_capacity(), Some(4));
    executor.shutdown_now();
}

#[tokio::test]
async fn test_invalid_graph_starts_nothing() {
    let context = Engine::init(EngineConfig::default()).unwrap();
    let executor = GraphExecutor::new(&context);
    let journal = Arc::new(Mutex::new(Vec::new()));

    let cyclic = Graph::new("cyclic", "cyclic").with_phase(
        Phase::new(0)
            .with_node(Recorder::new("A", &journal))
            .with_node(Recorder::new("B", &journal))
            .with_edge("A", "B")
            .with_edge("B", "A"),
    );
    let err = executor
        .submit(RunRequest::new(Arc::new(cyclic)).config(quiet_config()))
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation { .. }));
    assert_eq!(executor.queued_runs(), 0);

    let bad_config = RuntimeConfig {
        sleep_interval_ms: 0,
        ..RuntimeConfig::bulk()
    };
    let graph = Graph::new("ok", "ok").with_phase(Phase::new(0).with_node(Recorder::new("C", &journal)));
    let err = executor
        .submit(RunRequest::new(Arc::new(graph)).config(bad_config))
        .unwrap_err();
    assert!(matches!(err, EngineError::Configuration { .. }));

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(journal.lock().is_empty());
}

#[tokio::test]
async fn test_resubmission_revalidates_config() {
    let context = Engine::init(EngineConfig::default()).unwrap();
    let executor = GraphExecutor::new(&context);
    let graph = small_graph("again");

    let outcome = executor
        .submit(RunRequest::new(graph.clone()).config(quiet_config()))
        .unwrap()
        .wait()
        .await;
    assert_eq!(outcome.status, ResultCode::FinishedOk);
    assert!(graph.is_initialized());

    let bad_config = RuntimeConfig {
        sleep_interval_ms: 0,
        waiting_smoothing: 7.0,
        ..RuntimeConfig::bulk()
    };
    let err = executor
        .submit(RunRequest::new(graph).config(bad_config))
        .unwrap_err();
    assert!(matches!(err, EngineError::Configuration { .. }));
    assert_eq!(executor.queued_runs(), 0);
    assert_eq!(executor.stats().total_rejections, 0);
}

#[tokio::test]
async fn test_abort_while_waiting_for_node_threads() {
    let context = pooled(2, 1, 10);
    let executor = GraphExecutor::new(&context);

    let holder = Stalling::new("HOLDER", 1);
    let holding_run = executor
        .submit(
            RunRequest::new(Arc::new(
                Graph::new("holder", "holder").with_phase(Phase::new(0).with_node(holder.clone())),
            ))
            .config(quiet_config()),
        )
        .unwrap();
    holder.started.notified().await;
    assert_eq!(executor.free_capacity(), Some(0));

    let waiting_run = executor
        .submit(RunRequest::new(small_graph("starved")).config(quiet_config()))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    waiting_run.abort();

    let outcome = tokio::time::timeout(Duration::from_secs(2), waiting_run.wait())
        .await
        .expect("aborted run must not wait for the other run's threads");
    assert_eq!(outcome.status, ResultCode::Aborted);
    let generator = outcome.tracking.node("GEN").unwrap();
    assert_eq!(generator.total_output_records(), 0);
    assert_ne!(generator.result, ResultCode::FinishedOk);

    // the holder was never disturbed
    assert_eq!(holding_run.status(), ResultCode::Running);
    holding_run.abort();
    assert_eq!(holding_run.wait().await.status, ResultCode::Aborted);
    assert_eq!(executor.free_capacity(), Some(1));
    executor.shutdown_now();
}

#[tokio::test]
async fn test_direct_node_tasks_are_counted() {
    let context = pooled(1, 2, 10);
    let executor = GraphExecutor::new(&context);
    let base = RunContext::new("adhoc", "none");

    let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
    let (started_tx, started_rx) = tokio::sync::oneshot::channel::<()>();
    let first = executor
        .execute_node(base.for_node("FIRST"), async move {
            let _ = started_tx.send(());
            let _ = release_rx.await;
        })
        .unwrap();
    started_rx.await.unwrap();
    assert_eq!(executor.running_nodes(), 1);
    assert_eq!(executor.free_capacity(), Some(1));

    let second = executor
        .execute_node(base.for_node("SECOND"), async {})
        .unwrap();
    second.join().await.unwrap();

    // the budget is back to one held thread, so two more cannot fit
    let (third_tx, third_rx) = tokio::sync::oneshot::channel::<()>();
    let third = executor
        .execute_node(base.for_node("THIRD"), async move {
            let _ = third_tx.send(());
            futures::future::pending::<()>().await
        })
        .unwrap();
    third_rx.await.unwrap();
    let err = executor
        .execute_node(base.for_node("FOURTH"), async {})
        .unwrap_err();
    assert!(matches!(err, EngineError::ResourceExhaustion { .. }));
    assert_eq!(executor.free_capacity(), Some(0));

    third.abort();
    let _ = third.join().await;
    release_tx.send(()).unwrap();
    first.join().await.unwrap();

    assert_eq!(executor.running_nodes(), 0);
    assert_eq!(executor.free_capacity(), Some(2));

    context.threads().release_node_threads(5);
    assert_eq!(executor.free_capacity(), Some(2));
    executor.shutdown_now();
}

#[tokio::test]
async fn test_phase_larger_than_pool_fails() {
    let context = pooled(1, 2, 10);
    let executor = GraphExecutor::new(&context);
    let graph = Graph::new("wide", "wide").with_phase(
        Phase::new(0)
            .with_node(Generator::new("A", 1))
            .with_node(Generator::new("B", 1))
            .with_node(Generator::new("C", 1)),
    );

    let outcome = executor
        .submit(RunRequest::new(Arc::new(graph)).config(quiet_config()))
        .unwrap()
        .wait()
        .await;

    assert_eq!(outcome.status, ResultCode::Error);
    let cause = outcome.cause.unwrap();
    assert_eq!(cause.element(), "phase 0");
    assert!(matches!(
        cause.error().downcast_ref::<EngineError>(),
        Some(EngineError::ResourceExhaustion { .. })
    ));
    assert_eq!(executor.free_capacity(), Some(2));
    executor.shutdown_now();
}

#[tokio::test]
async fn test_runs_share_node_budget() {
    let context = pooled(2, 2, 10);
    let executor = GraphExecutor::new(&context);

    let mut handles = Vec::new();
    for i in 0..2 {
        let graph = Graph::new(format!("g{i}"), "shared").with_phase(
            Phase::new(0)
                .with_node(Generator::lingering("A", 50, Duration::from_millis(30)))
                .with_node(Generator::lingering("B", 50, Duration::from_millis(30))),
        );
        handles.push(
            executor
                .submit(RunRequest::new(Arc::new(graph)).config(quiet_config()))
                .unwrap(),
        );
    }

    for handle in handles {
        let outcome = handle.wait().await;
        assert_eq!(outcome.status, ResultCode::FinishedOk);
        assert_eq!(outcome.tracking.node("A").unwrap().total_output_records(), 50);
    }
    assert_eq!(executor.free_capacity(), Some(2));
    executor.shutdown().await;
}

#[tokio::test]
async fn test_submit_after_shutdown_is_rejected() {
    let context = Engine::init(EngineConfig::default()).unwrap();
    let executor = GraphExecutor::new(&context);
    executor.shutdown().await;

    let err = executor
        .submit(RunRequest::new(small_graph("late")).config(quiet_config()))
        .unwrap_err();
    assert!(matches!(err, EngineError::Rejected { .. }));
    assert_eq!(executor.queued_runs(), 0);
}

//! End-to-end scenarios over the SQLite backend.

#![cfg(feature = "sqlite")]

use std::sync::Arc;
use std::time::Duration;

use flywheel::providers::sqlite::SqliteBackend;
use flywheel::runtime::registry::{ActivityRegistry, WorkflowRegistry};
use flywheel::runtime::{Runtime, RuntimeOptions};
use flywheel::{Client, EventAttributes, WorkflowContext};

fn fast_options() -> RuntimeOptions {
    RuntimeOptions {
        poll_timeout: Duration::from_millis(100),
        idle_sleep: Duration::from_millis(2),
        ..RuntimeOptions::default()
    }
}

async fn start() -> (Arc<Runtime>, Client) {
    let backend = Arc::new(SqliteBackend::new("sqlite::memory:").await.unwrap());

    let activities = ActivityRegistry::builder()
        .register("add", |_ctx, (a, b): (i64, i64)| async move { Ok(a + b) })
        .build()
        .unwrap();
    let workflows = WorkflowRegistry::builder()
        .register("adder", |ctx: WorkflowContext, input: (i64, i64)| async move {
            let sum = ctx.schedule_activity("add", input).await?;
            Ok(sum)
        })
        .register_raw("sleepy", |ctx: WorkflowContext, _input| async move {
            ctx.schedule_timer(Duration::from_millis(5)).await;
            Ok("woke".to_string())
        })
        .register_raw("waitForPing", |ctx: WorkflowContext, _input| async move {
            let payload = ctx.signal_channel("ping").recv().await;
            Ok(payload)
        })
        .build()
        .unwrap();

    let client = Client::new(backend.clone());
    let rt = Runtime::start_with_backend(
        backend,
        Arc::new(activities),
        Arc::new(workflows),
        fast_options(),
    );
    (rt, client)
}

#[tokio::test]
async fn hello_activity_over_sqlite() {
    let (rt, client) = start().await;

    let instance = client.start_workflow("I1", "adder", (2, 3)).await.unwrap();
    let result: i64 = client
        .wait_for_workflow("I1", Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(result, 5);

    let history = client.read_history(&instance).await.unwrap();
    let types: Vec<_> = history.iter().map(|e| e.event_type()).collect();
    assert_eq!(
        types,
        vec![
            "WorkflowExecutionStarted",
            "WorkflowTaskStarted",
            "ActivityScheduled",
            "WorkflowTaskFinished",
            "ActivityCompleted",
            "WorkflowTaskStarted",
            "WorkflowTaskFinished",
            "WorkflowExecutionFinished",
        ]
    );
    let sequences: Vec<u64> = history.iter().map(|e| e.sequence_id).collect();
    assert_eq!(sequences, (1..=8).collect::<Vec<u64>>());

    rt.shutdown().await;
}

#[tokio::test]
async fn timer_over_sqlite() {
    let (rt, client) = start().await;

    let instance = client.start_workflow("T1", "sleepy", ()).await.unwrap();
    let result: String = client
        .wait_for_workflow("T1", Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(result, "woke");

    let history = client.read_history(&instance).await.unwrap();
    assert!(history
        .iter()
        .any(|e| matches!(e.attributes, EventAttributes::TimerFired { .. })));

    rt.shutdown().await;
}

#[tokio::test]
async fn signal_over_sqlite() {
    let (rt, client) = start().await;

    client
        .start_workflow("W1", "waitForPing", ())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    client.signal_workflow("W1", "ping", "hi").await.unwrap();

    let result: String = client
        .wait_for_workflow("W1", Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(result, "hi");

    rt.shutdown().await;
}

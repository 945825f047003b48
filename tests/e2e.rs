//! End-to-end scenarios over the in-memory backend.

use std::sync::Arc;
use std::time::Duration;

use flywheel::providers::in_memory::InMemoryBackend;
use flywheel::runtime::registry::{ActivityRegistry, WorkflowRegistry};
use flywheel::runtime::{Runtime, RuntimeOptions};
use flywheel::{
    Client, Either2, EventAttributes, HistoryEvent, WorkflowContext, WorkflowErrorKind,
};

fn event_types(events: &[HistoryEvent]) -> Vec<&'static str> {
    events.iter().map(|e| e.event_type()).collect()
}

fn fast_options() -> RuntimeOptions {
    RuntimeOptions {
        poll_timeout: Duration::from_millis(100),
        idle_sleep: Duration::from_millis(2),
        ..RuntimeOptions::default()
    }
}

fn registries() -> (Arc<ActivityRegistry>, Arc<WorkflowRegistry>) {
    let activities = ActivityRegistry::builder()
        .register("add", |_ctx, (a, b): (i64, i64)| async move { Ok(a + b) })
        .register("act", |_ctx, x: i64| async move { Ok(x.to_string()) })
        .register("echo", |_ctx, s: String| async move { Ok(s) })
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
        .register_raw("racer", |ctx: WorkflowContext, _input| async move {
            let activity = ctx.schedule_activity("act", 42);
            let timer = ctx.schedule_timer(Duration::from_millis(250));
            match ctx.select2(activity, timer).await {
                Either2::First(result) => result,
                Either2::Second(()) => Ok("timeout".to_string()),
            }
        })
        .register("parent", |ctx: WorkflowContext, x: i64| async move {
            let child = ctx.schedule_sub_workflow_with_id("child", "C1", x);
            let result = child.await?;
            Ok(result)
        })
        .register("child", |_ctx, x: i64| async move { Ok(x + 1) })
        .register_raw("waitForPing", |ctx: WorkflowContext, _input| async move {
            let payload = ctx.signal_channel("ping").recv().await;
            Ok(payload)
        })
        .register_raw("untilCanceled", |ctx: WorkflowContext, _input| async move {
            ctx.cancel_requested().await;
            Ok("canceled".to_string())
        })
        .build()
        .unwrap();

    (Arc::new(activities), Arc::new(workflows))
}

async fn start_runtime(backend: Arc<InMemoryBackend>) -> Arc<Runtime> {
    let (activities, workflows) = registries();
    Runtime::start_with_backend(backend, activities, workflows, fast_options())
}

#[tokio::test]
async fn hello_activity_history_matches_exactly() {
    let backend = Arc::new(InMemoryBackend::new());
    let rt = start_runtime(backend.clone()).await;
    let client = Client::new(backend);

    let instance = client.start_workflow("I1", "adder", (2, 3)).await.unwrap();
    let result: i64 = client
        .wait_for_workflow("I1", Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(result, 5);

    let history = client.read_history(&instance).await.unwrap();
    assert_eq!(
        event_types(&history),
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

    // Sequence ids are gapless from 1.
    let sequences: Vec<u64> = history.iter().map(|e| e.sequence_id).collect();
    assert_eq!(sequences, (1..=8).collect::<Vec<u64>>());

    // Scheduling and completion pair through schedule id 0.
    assert_eq!(history[2].schedule_event_id, Some(0));
    assert_eq!(history[4].schedule_event_id, Some(0));
    match &history[4].attributes {
        EventAttributes::ActivityCompleted { result } => assert_eq!(result, "5"),
        other => panic!("unexpected: {other:?}"),
    }
    match &history[7].attributes {
        EventAttributes::WorkflowExecutionFinished { result, .. } => {
            assert_eq!(result.as_deref(), Some("5"));
        }
        other => panic!("unexpected: {other:?}"),
    }

    rt.shutdown().await;
}

#[tokio::test]
async fn timer_fires_through_future_event() {
    let backend = Arc::new(InMemoryBackend::new());
    let rt = start_runtime(backend.clone()).await;
    let client = Client::new(backend);

    let instance = client.start_workflow("T1", "sleepy", ()).await.unwrap();
    let result: String = client
        .wait_for_workflow("T1", Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(result, "woke");

    let history = client.read_history(&instance).await.unwrap();
    let types = event_types(&history);
    assert!(types.contains(&"TimerScheduled"));
    assert!(types.contains(&"TimerFired"));

    let scheduled_at = history
        .iter()
        .find_map(|e| match &e.attributes {
            EventAttributes::TimerScheduled { fire_at_ms } => Some(*fire_at_ms),
            _ => None,
        })
        .unwrap();
    let fired_at = history
        .iter()
        .find_map(|e| match &e.attributes {
            EventAttributes::TimerFired { fire_at_ms } => Some(*fire_at_ms),
            _ => None,
        })
        .unwrap();
    assert_eq!(scheduled_at, fired_at);

    rt.shutdown().await;
}

#[tokio::test]
async fn selector_cancels_losing_timer() {
    let backend = Arc::new(InMemoryBackend::new());
    let rt = start_runtime(backend.clone()).await;
    let client = Client::new(backend);

    let instance = client.start_workflow("S1", "racer", ()).await.unwrap();
    let result: String = client
        .wait_for_workflow("S1", Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(result, "42");

    let history = client.read_history(&instance).await.unwrap();
    let types = event_types(&history);
    assert!(types.contains(&"TimerCanceled"));
    assert!(!types.contains(&"TimerFired"));

    rt.shutdown().await;
}

#[tokio::test]
async fn sub_workflow_round_trip() {
    let backend = Arc::new(InMemoryBackend::new());
    let rt = start_runtime(backend.clone()).await;
    let client = Client::new(backend);

    let parent = client.start_workflow("P1", "parent", 7).await.unwrap();
    let result: i64 = client
        .wait_for_workflow("P1", Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(result, 8);

    let parent_history = client.read_history(&parent).await.unwrap();
    let scheduled = parent_history
        .iter()
        .find_map(|e| match &e.attributes {
            EventAttributes::SubWorkflowScheduled { instance_id, .. } => Some(instance_id.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(scheduled, "C1");
    let completion = parent_history
        .iter()
        .find(|e| matches!(e.attributes, EventAttributes::SubWorkflowCompleted { .. }))
        .unwrap();
    assert_eq!(completion.schedule_event_id, Some(0));
    match &completion.attributes {
        EventAttributes::SubWorkflowCompleted { result } => assert_eq!(result, "8"),
        other => panic!("unexpected: {other:?}"),
    }

    let child = client.latest_execution("C1").await.unwrap().unwrap();
    let child_history = client.read_history(&child).await.unwrap();
    match &child_history.first().unwrap().attributes {
        EventAttributes::WorkflowExecutionStarted { name, input, .. } => {
            assert_eq!(name, "child");
            assert_eq!(input, "7");
        }
        other => panic!("unexpected: {other:?}"),
    }
    match &child_history.last().unwrap().attributes {
        EventAttributes::WorkflowExecutionFinished { result, .. } => {
            assert_eq!(result.as_deref(), Some("8"));
        }
        other => panic!("unexpected: {other:?}"),
    }

    // Diagnostics sees the parent/child relationship.
    let tree = client.get_instance_tree("P1").await.unwrap().unwrap();
    assert_eq!(tree.instance.instance.instance_id, "P1");
    assert_eq!(tree.children.len(), 1);
    assert_eq!(tree.children[0].instance.instance.instance_id, "C1");

    rt.shutdown().await;
}

#[tokio::test]
async fn signal_wakes_blocked_workflow_once() {
    let backend = Arc::new(InMemoryBackend::new());
    let rt = start_runtime(backend.clone()).await;
    let client = Client::new(backend);

    let instance = client
        .start_workflow("W1", "waitForPing", ())
        .await
        .unwrap();

    // Let the first task run and block on the channel.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        client.get_workflow_status("W1").await.unwrap(),
        flywheel::WorkflowStatus::Running
    );

    client.signal_workflow("W1", "ping", "hi").await.unwrap();
    let result: String = client
        .wait_for_workflow("W1", Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(result, "hi");

    let history = client.read_history(&instance).await.unwrap();
    let signals: Vec<_> = history
        .iter()
        .filter(|e| matches!(e.attributes, EventAttributes::SignalReceived { .. }))
        .collect();
    assert_eq!(signals.len(), 1);
    match &signals[0].attributes {
        EventAttributes::SignalReceived { name, input } => {
            assert_eq!(name, "ping");
            assert_eq!(input, "hi");
        }
        other => panic!("unexpected: {other:?}"),
    }

    rt.shutdown().await;
}

#[tokio::test]
async fn cancellation_is_observed_between_tasks() {
    let backend = Arc::new(InMemoryBackend::new());
    let rt = start_runtime(backend.clone()).await;
    let client = Client::new(backend);

    client
        .start_workflow("C1", "untilCanceled", ())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    client.cancel_workflow_instance("C1").await.unwrap();
    let result: String = client
        .wait_for_workflow("C1", Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(result, "canceled");

    rt.shutdown().await;
}

#[tokio::test]
async fn unknown_activity_fails_the_workflow() {
    let backend = Arc::new(InMemoryBackend::new());
    let activities = Arc::new(ActivityRegistry::builder().build().unwrap());
    let workflows = Arc::new(
        WorkflowRegistry::builder()
            .register_raw("w", |ctx: WorkflowContext, _input| async move {
                let out = ctx.schedule_activity("missing", ()).await?;
                Ok(out)
            })
            .build()
            .unwrap(),
    );
    let rt = Runtime::start_with_backend(backend.clone(), activities, workflows, fast_options());
    let client = Client::new(backend);

    client.start_workflow("U1", "w", ()).await.unwrap();
    let err = client
        .wait_for_workflow::<String>("U1", Duration::from_secs(5))
        .await
        .unwrap_err();
    match err {
        flywheel::ClientError::WorkflowFailed { error } => {
            assert_eq!(error.kind, WorkflowErrorKind::Application);
            assert!(error.message.contains("not registered"));
        }
        other => panic!("unexpected: {other:?}"),
    }

    rt.shutdown().await;
}

#[tokio::test]
async fn diagnostics_page_by_creation_time() {
    let backend = Arc::new(InMemoryBackend::new());
    let rt = start_runtime(backend.clone()).await;
    let client = Client::new(backend);

    for n in 0..5 {
        client
            .start_workflow(format!("L{n}"), "waitForPing", ())
            .await
            .unwrap();
        // Creation times must be distinguishable for ordering.
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    let first_page = client.list_instances(None, 3).await.unwrap();
    assert_eq!(first_page.len(), 3);
    assert_eq!(first_page[0].instance.instance_id, "L4");
    assert_eq!(first_page[2].instance.instance_id, "L2");

    let cursor = first_page.last().unwrap().instance.clone();
    let second_page = client.list_instances(Some(&cursor), 3).await.unwrap();
    assert_eq!(second_page.len(), 2);
    assert_eq!(second_page[0].instance.instance_id, "L1");
    assert_eq!(second_page[1].instance.instance_id, "L0");

    rt.shutdown().await;
}

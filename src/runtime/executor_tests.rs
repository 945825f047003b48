use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::*;
use crate::providers::TaskKind;
use crate::runtime::registry::{WorkflowRegistry, WorkflowRegistryBuilder};
use crate::{Codec, Either2, Json};

fn seal(events: Vec<HistoryEvent>, start_seq: u64) -> Vec<HistoryEvent> {
    events
        .into_iter()
        .enumerate()
        .map(|(i, e)| e.with_sequence(start_seq + i as u64))
        .collect()
}

fn task_for(
    instance: &WorkflowInstance,
    history: Vec<HistoryEvent>,
    new_events: Vec<HistoryEvent>,
) -> WorkflowTask {
    let last_sequence_id = history.last().map(|e| e.sequence_id).unwrap_or(0);
    WorkflowTask {
        instance: instance.clone(),
        kind: TaskKind::Full,
        history,
        new_events,
        last_sequence_id,
        completed_at_ms: None,
        attempt: 1,
        lease_token: "lease".to_string(),
        backend_cursor: 0,
    }
}

fn started(name: &str, input: &str) -> HistoryEvent {
    HistoryEvent::pending(
        None,
        EventAttributes::WorkflowExecutionStarted {
            name: name.to_string(),
            input: input.to_string(),
            parent_instance_id: None,
            parent_execution_id: None,
            parent_schedule_event_id: None,
        },
    )
}

fn activity_completed(schedule_event_id: u64, result: &str) -> HistoryEvent {
    HistoryEvent::pending(
        Some(schedule_event_id),
        EventAttributes::ActivityCompleted {
            result: result.to_string(),
        },
    )
}

fn event_types(events: &[HistoryEvent]) -> Vec<&'static str> {
    events.iter().map(|e| e.event_type()).collect()
}

fn adder_workflows() -> Arc<WorkflowRegistry> {
    let registry = WorkflowRegistry::builder()
        .register("adder", |ctx: WorkflowContext, input: (i64, i64)| async move {
            let sum: String = ctx.schedule_activity("add", input).await?;
            let sum: i64 = Json::decode(&sum).map_err(|e| e.to_string())?;
            Ok(sum)
        })
        .build()
        .unwrap();
    Arc::new(registry)
}

fn raw_registry(build: impl FnOnce(WorkflowRegistryBuilder) -> WorkflowRegistryBuilder) -> Arc<WorkflowRegistry> {
    Arc::new(build(WorkflowRegistry::builder()).build().unwrap())
}

#[test]
fn trivial_workflow_completes_in_first_task() {
    let workflows = raw_registry(|b| {
        b.register_raw("noop", |_ctx, _input| async move { Ok("done".to_string()) })
    });
    let instance = WorkflowInstance::new("i1", "e1");
    let mut executor = WorkflowExecutor::new(workflows, instance.clone());

    let task = task_for(&instance, vec![], vec![started("noop", "")]);
    let effects = executor.execute(&task).unwrap();

    assert_eq!(
        event_types(&effects.new_events),
        vec![
            "WorkflowExecutionStarted",
            "WorkflowTaskStarted",
            "WorkflowTaskFinished",
            "WorkflowExecutionFinished",
        ]
    );
    assert!(executor.is_finished());
    match &effects.new_events.last().unwrap().attributes {
        EventAttributes::WorkflowExecutionFinished { result, error } => {
            assert_eq!(result.as_deref(), Some("done"));
            assert!(error.is_none());
        }
        other => panic!("unexpected terminal event: {other:?}"),
    }
}

#[test]
fn scheduling_an_activity_emits_one_command_event() {
    let instance = WorkflowInstance::new("i1", "e1");
    let mut executor = WorkflowExecutor::new(adder_workflows(), instance.clone());

    let task = task_for(&instance, vec![], vec![started("adder", "[2,3]")]);
    let effects = executor.execute(&task).unwrap();

    assert_eq!(
        event_types(&effects.new_events),
        vec![
            "WorkflowExecutionStarted",
            "WorkflowTaskStarted",
            "ActivityScheduled",
            "WorkflowTaskFinished",
        ]
    );
    assert!(!executor.is_finished());
    assert_eq!(effects.activity_events.len(), 1);
    let scheduled = &effects.activity_events[0];
    assert_eq!(scheduled.schedule_event_id, Some(0));
    match &scheduled.attributes {
        EventAttributes::ActivityScheduled { name, input } => {
            assert_eq!(name, "add");
            assert_eq!(input, "[2,3]");
        }
        other => panic!("unexpected: {other:?}"),
    }
}

#[test]
fn replay_with_activity_result_completes() {
    let instance = WorkflowInstance::new("i1", "e1");

    // First task produces the schedule; replay it with the completion.
    let mut first = WorkflowExecutor::new(adder_workflows(), instance.clone());
    let task1 = task_for(&instance, vec![], vec![started("adder", "[2,3]")]);
    let effects1 = first.execute(&task1).unwrap();
    let history = seal(effects1.new_events, 1);

    let mut executor = WorkflowExecutor::new(adder_workflows(), instance.clone());
    let task2 = task_for(&instance, history, vec![activity_completed(0, "5")]);
    let effects2 = executor.execute(&task2).unwrap();

    assert_eq!(
        event_types(&effects2.new_events),
        vec![
            "ActivityCompleted",
            "WorkflowTaskStarted",
            "WorkflowTaskFinished",
            "WorkflowExecutionFinished",
        ]
    );
    match &effects2.new_events.last().unwrap().attributes {
        EventAttributes::WorkflowExecutionFinished { result, .. } => {
            assert_eq!(result.as_deref(), Some("5"));
        }
        other => panic!("unexpected: {other:?}"),
    }
}

#[test]
fn continuation_task_skips_replay() {
    let instance = WorkflowInstance::new("i1", "e1");
    let mut executor = WorkflowExecutor::new(adder_workflows(), instance.clone());

    let task1 = task_for(&instance, vec![], vec![started("adder", "[2,3]")]);
    let effects1 = executor.execute(&task1).unwrap();
    executor.note_committed(effects1.new_events.len());

    let mut task2 = task_for(&instance, vec![], vec![activity_completed(0, "5")]);
    task2.kind = TaskKind::Continuation;
    task2.last_sequence_id = executor.last_sequence_id();
    assert!(executor.continuation_eligible(&task2));

    let effects2 = executor.execute_continuation(&task2).unwrap();
    assert!(executor.is_finished());
    assert_eq!(
        event_types(&effects2.new_events),
        vec![
            "ActivityCompleted",
            "WorkflowTaskStarted",
            "WorkflowTaskFinished",
            "WorkflowExecutionFinished",
        ]
    );
}

#[test]
fn continuation_requires_matching_sequence() {
    let instance = WorkflowInstance::new("i1", "e1");
    let mut executor = WorkflowExecutor::new(adder_workflows(), instance.clone());
    let task1 = task_for(&instance, vec![], vec![started("adder", "[2,3]")]);
    executor.execute(&task1).unwrap();
    executor.note_committed(4);

    let mut stale = task_for(&instance, vec![], vec![activity_completed(0, "5")]);
    stale.kind = TaskKind::Continuation;
    stale.last_sequence_id = 99;
    assert!(!executor.continuation_eligible(&stale));
    assert!(matches!(
        executor.execute_continuation(&stale),
        Err(ExecutorError::ContinuationMismatch { .. })
    ));
}

#[test]
fn timer_workflow_schedules_future_event() {
    let workflows = raw_registry(|b| {
        b.register_raw("sleepy", |ctx, _input| async move {
            ctx.schedule_timer(Duration::from_millis(5)).await;
            Ok("woke".to_string())
        })
    });
    let instance = WorkflowInstance::new("i1", "e1");
    let mut executor = WorkflowExecutor::new(workflows, instance.clone());

    let before = crate::now_ms();
    let task = task_for(&instance, vec![], vec![started("sleepy", "")]);
    let effects = executor.execute(&task).unwrap();

    assert_eq!(
        event_types(&effects.new_events),
        vec![
            "WorkflowExecutionStarted",
            "WorkflowTaskStarted",
            "TimerScheduled",
            "WorkflowTaskFinished",
        ]
    );
    assert_eq!(effects.timers_to_schedule.len(), 1);
    let future = &effects.timers_to_schedule[0];
    assert_eq!(future.instance, instance);
    assert_eq!(future.event.schedule_event_id, Some(0));
    let visible_at = future.event.visible_at_ms.unwrap();
    assert!(visible_at >= before + 5);
    match &future.event.attributes {
        EventAttributes::TimerFired { fire_at_ms } => assert_eq!(*fire_at_ms, visible_at),
        other => panic!("unexpected: {other:?}"),
    }
}

#[test]
fn selector_emits_both_commands() {
    let workflows = raw_registry(|b| {
        b.register_raw("racer", |ctx: WorkflowContext, _input| async move {
            let activity = ctx.schedule_activity("act", 42);
            let timer = ctx.schedule_timer(Duration::from_millis(10));
            match ctx.select2(activity, timer).await {
                Either2::First(result) => result,
                Either2::Second(()) => Ok("timeout".to_string()),
            }
        })
    });
    let instance = WorkflowInstance::new("i1", "e1");
    let mut executor = WorkflowExecutor::new(workflows, instance.clone());

    let task = task_for(&instance, vec![], vec![started("racer", "")]);
    let effects = executor.execute(&task).unwrap();

    assert_eq!(
        event_types(&effects.new_events),
        vec![
            "WorkflowExecutionStarted",
            "WorkflowTaskStarted",
            "ActivityScheduled",
            "TimerScheduled",
            "WorkflowTaskFinished",
        ]
    );
    assert_eq!(effects.activity_events.len(), 1);
    assert_eq!(effects.timers_to_schedule.len(), 1);
}

#[test]
fn selector_winner_cancels_losing_timer() {
    let workflows = raw_registry(|b| {
        b.register_raw("racer", |ctx: WorkflowContext, _input| async move {
            let activity = ctx.schedule_activity("act", 42);
            let timer = ctx.schedule_timer(Duration::from_millis(10));
            match ctx.select2(activity, timer).await {
                Either2::First(result) => result,
                Either2::Second(()) => Ok("timeout".to_string()),
            }
        })
    });
    let instance = WorkflowInstance::new("i1", "e1");

    let mut first = WorkflowExecutor::new(workflows.clone(), instance.clone());
    let task1 = task_for(&instance, vec![], vec![started("racer", "")]);
    let history = seal(first.execute(&task1).unwrap().new_events, 1);

    let mut executor = WorkflowExecutor::new(workflows, instance.clone());
    let task2 = task_for(&instance, history, vec![activity_completed(0, "won")]);
    let effects = executor.execute(&task2).unwrap();

    assert_eq!(
        event_types(&effects.new_events),
        vec![
            "ActivityCompleted",
            "WorkflowTaskStarted",
            "TimerCanceled",
            "WorkflowTaskFinished",
            "WorkflowExecutionFinished",
        ]
    );
    assert_eq!(effects.timers_to_cancel, vec![1]);
    assert!(executor.is_finished());
}

#[test]
fn canceled_timer_replays_cleanly() {
    let workflows = raw_registry(|b| {
        b.register_raw("racer", |ctx: WorkflowContext, _input| async move {
            let activity = ctx.schedule_activity("act", 42);
            let timer = ctx.schedule_timer(Duration::from_millis(10));
            match ctx.select2(activity, timer).await {
                Either2::First(result) => result,
                Either2::Second(()) => Ok("timeout".to_string()),
            }
        })
    });
    let instance = WorkflowInstance::new("i1", "e1");

    let mut first = WorkflowExecutor::new(workflows.clone(), instance.clone());
    let task1 = task_for(&instance, vec![], vec![started("racer", "")]);
    let mut history = seal(first.execute(&task1).unwrap().new_events, 1);
    let mut second = WorkflowExecutor::new(workflows.clone(), instance.clone());
    let task2 = task_for(&instance, history.clone(), vec![activity_completed(0, "won")]);
    let next = second.execute(&task2).unwrap().new_events;
    let start = history.len() as u64 + 1;
    history.extend(seal(next, start));

    // Full replay of a history containing TimerCanceled must pair exactly.
    let mut replayed = WorkflowExecutor::new(workflows, instance.clone());
    let replay_task = task_for(&instance, history, vec![]);
    let effects = replayed.execute(&replay_task).unwrap();
    assert!(effects.is_empty());
    assert!(replayed.is_finished());
}

#[test]
fn idempotent_replay_produces_no_commands() {
    let instance = WorkflowInstance::new("i1", "e1");

    let mut first = WorkflowExecutor::new(adder_workflows(), instance.clone());
    let task1 = task_for(&instance, vec![], vec![started("adder", "[2,3]")]);
    let mut history = seal(first.execute(&task1).unwrap().new_events, 1);

    let mut second = WorkflowExecutor::new(adder_workflows(), instance.clone());
    let task2 = task_for(&instance, history.clone(), vec![activity_completed(0, "5")]);
    let delta = second.execute(&task2).unwrap().new_events;
    let start = history.len() as u64 + 1;
    history.extend(seal(delta, start));

    let mut replayed = WorkflowExecutor::new(adder_workflows(), instance.clone());
    let replay_task = task_for(&instance, history, vec![]);
    let effects = replayed.execute(&replay_task).unwrap();
    assert!(effects.is_empty());
    assert!(replayed.is_finished());
}

#[test]
fn side_effect_runs_once_and_replays_recorded_value() {
    let calls = Arc::new(AtomicUsize::new(0));
    let calls_in_workflow = calls.clone();
    let workflows = raw_registry(move |b| {
        b.register_raw("effectful", move |ctx: WorkflowContext, _input| {
            let calls = calls_in_workflow.clone();
            async move {
                let token = ctx
                    .side_effect(|| {
                        calls.fetch_add(1, Ordering::SeqCst);
                        "token-1".to_string()
                    })
                    .await;
                let echoed = ctx.schedule_activity("echo", token).await?;
                Ok(echoed)
            }
        })
    });
    let instance = WorkflowInstance::new("i1", "e1");

    let mut first = WorkflowExecutor::new(workflows.clone(), instance.clone());
    let task1 = task_for(&instance, vec![], vec![started("effectful", "")]);
    let effects1 = first.execute(&task1).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        event_types(&effects1.new_events),
        vec![
            "WorkflowExecutionStarted",
            "WorkflowTaskStarted",
            "SideEffectResult",
            "ActivityScheduled",
            "WorkflowTaskFinished",
        ]
    );
    match &effects1.activity_events[0].attributes {
        EventAttributes::ActivityScheduled { input, .. } => assert_eq!(input, "token-1"),
        other => panic!("unexpected: {other:?}"),
    }

    // Replaying must not re-run the closure.
    let history = seal(effects1.new_events, 1);
    let mut replayed = WorkflowExecutor::new(workflows, instance.clone());
    let task2 = task_for(&instance, history, vec![activity_completed(1, "token-1")]);
    let effects2 = replayed.execute(&task2).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(replayed.is_finished());
    match &effects2.new_events.last().unwrap().attributes {
        EventAttributes::WorkflowExecutionFinished { result, .. } => {
            assert_eq!(result.as_deref(), Some("token-1"));
        }
        other => panic!("unexpected: {other:?}"),
    }
}

#[test]
fn signal_unblocks_waiting_workflow() {
    let workflows = raw_registry(|b| {
        b.register_raw("waitForPing", |ctx: WorkflowContext, _input| async move {
            let payload = ctx.signal_channel("ping").recv().await;
            Ok(payload)
        })
    });
    let instance = WorkflowInstance::new("i1", "e1");
    let mut executor = WorkflowExecutor::new(workflows.clone(), instance.clone());

    let task1 = task_for(&instance, vec![], vec![started("waitForPing", "")]);
    let effects1 = executor.execute(&task1).unwrap();
    assert!(!executor.is_finished());
    assert_eq!(
        event_types(&effects1.new_events),
        vec![
            "WorkflowExecutionStarted",
            "WorkflowTaskStarted",
            "WorkflowTaskFinished",
        ]
    );

    let history = seal(effects1.new_events, 1);
    let signal = HistoryEvent::pending(
        None,
        EventAttributes::SignalReceived {
            name: "ping".to_string(),
            input: "hi".to_string(),
        },
    );
    let mut replayed = WorkflowExecutor::new(workflows, instance.clone());
    let task2 = task_for(&instance, history, vec![signal]);
    let effects2 = replayed.execute(&task2).unwrap();
    assert!(replayed.is_finished());
    match &effects2.new_events.last().unwrap().attributes {
        EventAttributes::WorkflowExecutionFinished { result, .. } => {
            assert_eq!(result.as_deref(), Some("hi"));
        }
        other => panic!("unexpected: {other:?}"),
    }
}

#[test]
fn sub_workflow_schedule_targets_new_child() {
    let workflows = raw_registry(|b| {
        b.register_raw("parent", |ctx: WorkflowContext, _input| async move {
            let child = ctx.schedule_sub_workflow_with_id("child", "C1", 7);
            let result = child.await?;
            Ok(result)
        })
    });
    let instance = WorkflowInstance::new("P1", "e1");
    let mut executor = WorkflowExecutor::new(workflows.clone(), instance.clone());

    let task1 = task_for(&instance, vec![], vec![started("parent", "")]);
    let effects1 = executor.execute(&task1).unwrap();

    assert_eq!(effects1.workflow_events.len(), 1);
    let child_start = &effects1.workflow_events[0];
    assert_eq!(child_start.instance.instance_id, "C1");
    assert!(child_start.instance.is_sub_workflow());
    let parent = child_start.instance.parent.as_ref().unwrap();
    assert_eq!(parent.instance_id, "P1");
    assert_eq!(parent.schedule_event_id, 0);
    match &child_start.event.attributes {
        EventAttributes::WorkflowExecutionStarted { name, input, .. } => {
            assert_eq!(name, "child");
            assert_eq!(input, "7");
        }
        other => panic!("unexpected: {other:?}"),
    }

    // Parent resumes on SubWorkflowCompleted.
    let history = seal(effects1.new_events, 1);
    let completion = HistoryEvent::pending(
        Some(0),
        EventAttributes::SubWorkflowCompleted {
            result: "8".to_string(),
        },
    );
    let mut replayed = WorkflowExecutor::new(workflows, instance.clone());
    let task2 = task_for(&instance, history, vec![completion]);
    let effects2 = replayed.execute(&task2).unwrap();
    assert!(replayed.is_finished());
    match &effects2.new_events.last().unwrap().attributes {
        EventAttributes::WorkflowExecutionFinished { result, .. } => {
            assert_eq!(result.as_deref(), Some("8"));
        }
        other => panic!("unexpected: {other:?}"),
    }
}

#[test]
fn child_completion_notifies_parent() {
    let workflows = raw_registry(|b| {
        b.register_raw("child", |_ctx, input: String| async move { Ok(input) })
    });
    let parent_link = ParentLink {
        instance_id: "P1".to_string(),
        execution_id: "pe".to_string(),
        schedule_event_id: 3,
    };
    let instance = WorkflowInstance::sub_workflow("C1", "ce", parent_link);
    let mut executor = WorkflowExecutor::new(workflows, instance.clone());

    let task = task_for(&instance, vec![], vec![started("child", "8")]);
    let effects = executor.execute(&task).unwrap();

    assert!(executor.is_finished());
    assert_eq!(effects.workflow_events.len(), 1);
    let to_parent = &effects.workflow_events[0];
    assert_eq!(to_parent.instance.instance_id, "P1");
    assert_eq!(to_parent.event.schedule_event_id, Some(3));
    match &to_parent.event.attributes {
        EventAttributes::SubWorkflowCompleted { result } => assert_eq!(result, "8"),
        other => panic!("unexpected: {other:?}"),
    }
}

#[test]
fn sub_workflow_cancel_signals_child_without_local_event() {
    let workflows = raw_registry(|b| {
        b.register_raw("supervisor", |ctx: WorkflowContext, _input| async move {
            let child = ctx.schedule_sub_workflow_with_id("child", "C1", 7);
            ctx.signal_channel("abort").recv().await;
            ctx.cancel_sub_workflow(&child);
            let result = child.await?;
            Ok(result)
        })
    });
    let instance = WorkflowInstance::new("P1", "e1");

    let mut executor = WorkflowExecutor::new(workflows.clone(), instance.clone());
    let task1 = task_for(&instance, vec![], vec![started("supervisor", "")]);
    let effects1 = executor.execute(&task1).unwrap();
    let mut history = seal(effects1.new_events, 1);

    let abort = HistoryEvent::pending(
        None,
        EventAttributes::SignalReceived {
            name: "abort".to_string(),
            input: String::new(),
        },
    );
    let mut second = WorkflowExecutor::new(workflows.clone(), instance.clone());
    let task2 = task_for(&instance, history.clone(), vec![abort]);
    let effects2 = second.execute(&task2).unwrap();

    // The cancel produces only the cross-instance message: no scheduled or
    // terminal event lands in the local history.
    assert_eq!(
        event_types(&effects2.new_events),
        vec![
            "SignalReceived",
            "WorkflowTaskStarted",
            "WorkflowTaskFinished",
        ]
    );
    assert_eq!(effects2.workflow_events.len(), 1);
    let cancel = &effects2.workflow_events[0];
    assert_eq!(cancel.instance.instance_id, "C1");
    // Addressed to the latest execution of the child.
    assert!(cancel.instance.execution_id.is_empty());
    match &cancel.event.attributes {
        EventAttributes::SignalReceived { name, input } => {
            assert_eq!(name, crate::CANCEL_SIGNAL);
            assert!(input.is_empty());
        }
        other => panic!("unexpected: {other:?}"),
    }

    // Replaying the committed history must not deliver the cancel again.
    let start = history.len() as u64 + 1;
    history.extend(seal(effects2.new_events, start));
    let mut replayed = WorkflowExecutor::new(workflows, instance.clone());
    let replay_task = task_for(&instance, history, vec![]);
    let effects = replayed.execute(&replay_task).unwrap();
    assert!(effects.workflow_events.is_empty());
    assert!(effects.is_empty());
    assert!(!replayed.is_finished());
}

#[test]
fn unregistered_workflow_fails_the_workflow_not_the_task() {
    let workflows = raw_registry(|b| b);
    let instance = WorkflowInstance::new("i1", "e1");
    let mut executor = WorkflowExecutor::new(workflows, instance.clone());

    let task = task_for(&instance, vec![], vec![started("ghost", "")]);
    let effects = executor.execute(&task).unwrap();
    assert!(executor.is_finished());
    match &effects.new_events.last().unwrap().attributes {
        EventAttributes::WorkflowExecutionFinished { error, .. } => {
            assert_eq!(
                error.as_ref().unwrap().kind,
                crate::WorkflowErrorKind::Unregistered
            );
        }
        other => panic!("unexpected: {other:?}"),
    }
}

#[test]
fn workflow_error_is_recorded_as_failure() {
    let workflows = raw_registry(|b| {
        b.register_raw("failing", |_ctx, _input| async move {
            Err("boom".to_string())
        })
    });
    let instance = WorkflowInstance::new("i1", "e1");
    let mut executor = WorkflowExecutor::new(workflows, instance.clone());

    let task = task_for(&instance, vec![], vec![started("failing", "")]);
    let effects = executor.execute(&task).unwrap();
    assert!(executor.is_finished());
    match &effects.new_events.last().unwrap().attributes {
        EventAttributes::WorkflowExecutionFinished { error, .. } => {
            let error = error.as_ref().unwrap();
            assert_eq!(error.kind, crate::WorkflowErrorKind::Application);
            assert_eq!(error.message, "boom");
        }
        other => panic!("unexpected: {other:?}"),
    }
}

#[test]
fn schedule_mismatch_is_nondeterminism() {
    let workflows = raw_registry(|b| {
        b.register_raw("w", |ctx: WorkflowContext, _input| async move {
            let _ = ctx.schedule_activity("B", "y").await;
            Ok(String::new())
        })
    });
    let instance = WorkflowInstance::new("i1", "e1");

    let history = seal(
        vec![
            started("w", ""),
            HistoryEvent::pending(None, EventAttributes::WorkflowTaskStarted),
            HistoryEvent::pending(
                Some(0),
                EventAttributes::ActivityScheduled {
                    name: "A".to_string(),
                    input: "x".to_string(),
                },
            ),
        ],
        1,
    );
    let mut executor = WorkflowExecutor::new(workflows, instance.clone());
    let task = task_for(&instance, history, vec![]);
    assert!(matches!(
        executor.execute(&task),
        Err(ExecutorError::NonDeterminism(_))
    ));
}

#[test]
fn completion_without_open_schedule_is_nondeterminism() {
    let workflows = raw_registry(|b| {
        b.register_raw("w", |_ctx, _input| async move { Ok(String::new()) })
    });
    let instance = WorkflowInstance::new("i1", "e1");
    let history = seal(vec![started("w", "")], 1);
    let mut executor = WorkflowExecutor::new(workflows, instance.clone());
    let task = task_for(&instance, history, vec![activity_completed(0, "ok")]);
    assert!(matches!(
        executor.execute(&task),
        Err(ExecutorError::NonDeterminism(_))
    ));
}

#[test]
fn completion_kind_mismatch_is_nondeterminism() {
    let workflows = raw_registry(|b| {
        b.register_raw("w", |ctx: WorkflowContext, _input| async move {
            let result = ctx.schedule_activity("A", "x").await?;
            Ok(result)
        })
    });
    let instance = WorkflowInstance::new("i1", "e1");
    let history = seal(
        vec![
            started("w", ""),
            HistoryEvent::pending(None, EventAttributes::WorkflowTaskStarted),
            HistoryEvent::pending(
                Some(0),
                EventAttributes::ActivityScheduled {
                    name: "A".to_string(),
                    input: "x".to_string(),
                },
            ),
            HistoryEvent::pending(None, EventAttributes::WorkflowTaskFinished),
        ],
        1,
    );
    let fired = HistoryEvent::pending(Some(0), EventAttributes::TimerFired { fire_at_ms: 1 });
    let mut executor = WorkflowExecutor::new(workflows, instance.clone());
    let task = task_for(&instance, history, vec![fired]);
    assert!(matches!(
        executor.execute(&task),
        Err(ExecutorError::NonDeterminism(_))
    ));
}

#[test]
fn extra_command_in_finished_task_is_nondeterminism() {
    // History recorded no schedule, but the code now schedules an activity.
    let workflows = raw_registry(|b| {
        b.register_raw("w", |ctx: WorkflowContext, _input| async move {
            let result = ctx.schedule_activity("A", "x").await?;
            Ok(result)
        })
    });
    let instance = WorkflowInstance::new("i1", "e1");
    let history = seal(
        vec![
            started("w", ""),
            HistoryEvent::pending(None, EventAttributes::WorkflowTaskStarted),
            HistoryEvent::pending(None, EventAttributes::WorkflowTaskFinished),
        ],
        1,
    );
    let mut executor = WorkflowExecutor::new(workflows, instance.clone());
    let task = task_for(&instance, history, vec![]);
    assert!(matches!(
        executor.execute(&task),
        Err(ExecutorError::NonDeterminism(_))
    ));
}

#[test]
fn poison_effects_fail_workflow_and_notify_parent() {
    let parent_link = ParentLink {
        instance_id: "P1".to_string(),
        execution_id: "pe".to_string(),
        schedule_event_id: 2,
    };
    let instance = WorkflowInstance::sub_workflow("C1", "ce", parent_link);
    let task = WorkflowTask {
        instance,
        kind: TaskKind::Full,
        history: vec![],
        new_events: vec![started("child", "{}")],
        last_sequence_id: 0,
        completed_at_ms: None,
        attempt: 11,
        lease_token: "lease".to_string(),
        backend_cursor: 0,
    };
    let effects = poison_task_effects(&task, WorkflowError::application("poison"));
    assert!(effects
        .new_events
        .last()
        .map(|e| e.is_terminal())
        .unwrap_or(false));
    assert_eq!(effects.workflow_events.len(), 1);
    match &effects.workflow_events[0].event.attributes {
        EventAttributes::SubWorkflowFailed { error } => assert_eq!(error.message, "poison"),
        other => panic!("unexpected: {other:?}"),
    }
}

//! Workflow task dispatcher.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::Backoff;
use crate::providers::{Backend, TaskKind, WorkflowTask};
use crate::runtime::executor::{poison_task_effects, TaskEffects, WorkflowExecutor};
use crate::runtime::Runtime;
use crate::WorkflowError;

const RETRY_BACKOFF_INITIAL: Duration = Duration::from_millis(50);
const RETRY_BACKOFF_MAX: Duration = Duration::from_secs(5);
const COMPLETE_RETRIES: u32 = 3;

pub(crate) fn start(runtime: Arc<Runtime>) -> JoinHandle<()> {
    let count = runtime.options.workflow_poller_count;
    tokio::spawn(async move {
        let mut pollers = Vec::with_capacity(count);
        for idx in 0..count {
            let rt = runtime.clone();
            let worker_id = format!("wf-{idx}-{}", rt.runtime_id);
            pollers.push(tokio::spawn(poll_loop(rt, worker_id)));
        }
        for poller in pollers {
            let _ = poller.await;
        }
    })
}

async fn poll_loop(rt: Arc<Runtime>, worker_id: String) {
    let mut backoff = Backoff::new(RETRY_BACKOFF_INITIAL, RETRY_BACKOFF_MAX);
    loop {
        if rt.shutdown.is_cancelled() {
            break;
        }
        let fetched = tokio::select! {
            _ = rt.shutdown.cancelled() => break,
            fetched = rt.backend.get_workflow_task(rt.options.poll_timeout) => fetched,
        };
        match fetched {
            Ok(Some(task)) => {
                backoff.reset();
                process_task(&rt, task, &worker_id).await;
            }
            Ok(None) => {
                tokio::time::sleep(rt.options.idle_sleep).await;
            }
            Err(e) if e.is_retryable() => {
                warn!(worker_id, error = %e, "transient error fetching workflow task");
                tokio::time::sleep(backoff.next_delay()).await;
            }
            Err(e) => {
                error!(worker_id, error = %e, "permanent error fetching workflow task");
                tokio::time::sleep(RETRY_BACKOFF_MAX).await;
            }
        }
    }
    debug!(worker_id, "workflow poller stopped");
}

/// Lease metadata clone handed to the heartbeat loop; event payloads stay
/// with the poller.
fn lease_view(task: &WorkflowTask) -> WorkflowTask {
    WorkflowTask {
        instance: task.instance.clone(),
        kind: task.kind,
        history: Vec::new(),
        new_events: Vec::new(),
        last_sequence_id: task.last_sequence_id,
        completed_at_ms: task.completed_at_ms,
        attempt: task.attempt,
        lease_token: task.lease_token.clone(),
        backend_cursor: task.backend_cursor,
    }
}

async fn process_task(rt: &Arc<Runtime>, task: WorkflowTask, worker_id: &str) {
    let instance = task.instance.clone();
    debug!(
        worker_id,
        instance_id = %instance.instance_id,
        execution_id = %instance.execution_id,
        new_events = task.new_events.len(),
        history_len = task.history.len(),
        attempt = task.attempt,
        "processing workflow task"
    );

    let heartbeat_stop = CancellationToken::new();
    let heartbeat = tokio::spawn(heartbeat_loop(
        rt.backend.clone(),
        lease_view(&task),
        rt.options.heartbeat_interval,
        heartbeat_stop.clone(),
    ));

    run_task(rt, task, worker_id).await;

    heartbeat_stop.cancel();
    let _ = heartbeat.await;
}

async fn run_task(rt: &Arc<Runtime>, task: WorkflowTask, worker_id: &str) {
    let instance = task.instance.clone();

    // Terminal instances only need their stray pending events consumed.
    if task.completed_at_ms.is_some() {
        complete(rt, task, TaskEffects::default(), None, worker_id).await;
        return;
    }

    if task.attempt > rt.options.max_task_attempts {
        error!(
            worker_id,
            instance_id = %instance.instance_id,
            attempt = task.attempt,
            "workflow task exceeded max attempts, failing instance"
        );
        let effects = poison_task_effects(
            &task,
            WorkflowError::application(format!(
                "task exceeded {} delivery attempts",
                rt.options.max_task_attempts
            )),
        );
        complete(rt, task, effects, None, worker_id).await;
        return;
    }

    // Resolve an executor: a warm cache entry at the right watermark runs a
    // continuation, anything else replays in full. A busy cache entry is a
    // miss and falls back to a throwaway executor.
    let checkout = rt.cache.checkout_or_insert(&instance, || {
        WorkflowExecutor::new(rt.workflows.clone(), instance.clone())
    });
    match checkout {
        Some(mut guard) => {
            let execution = if guard.continuation_eligible(&task) && guard.is_warm() {
                debug!(
                    worker_id,
                    instance_id = %instance.instance_id,
                    last_sequence_id = task.last_sequence_id,
                    "continuation execution on cached executor"
                );
                guard.execute_continuation(&task)
            } else {
                guard.execute(&task)
            };
            match execution {
                Ok(effects) => complete(rt, task, effects, Some(&mut guard), worker_id).await,
                Err(e) => {
                    // Fatal to the task: no checkpoint, lease expiry retries.
                    error!(
                        worker_id,
                        instance_id = %instance.instance_id,
                        execution_id = %instance.execution_id,
                        error = %e,
                        "workflow task failed, abandoning for redelivery"
                    );
                    drop(guard);
                    rt.cache.remove(&instance);
                }
            }
        }
        None => {
            if task.kind == TaskKind::Continuation {
                // Cannot replay without history; the lease expires and the
                // backend re-delivers a full task.
                warn!(
                    worker_id,
                    instance_id = %instance.instance_id,
                    "continuation task without usable executor, abandoning"
                );
                return;
            }
            let mut executor = WorkflowExecutor::new(rt.workflows.clone(), instance.clone());
            match executor.execute(&task) {
                Ok(effects) => complete(rt, task, effects, None, worker_id).await,
                Err(e) => {
                    error!(
                        worker_id,
                        instance_id = %instance.instance_id,
                        error = %e,
                        "workflow task failed on fallback executor"
                    );
                }
            }
        }
    }
}

async fn complete(
    rt: &Arc<Runtime>,
    task: WorkflowTask,
    effects: TaskEffects,
    mut cached: Option<&mut WorkflowExecutor>,
    worker_id: &str,
) {
    let instance = task.instance.clone();
    let committed_events = effects.new_events.len();
    let TaskEffects {
        new_events,
        workflow_events,
        activity_events,
        timers_to_schedule,
        timers_to_cancel,
    } = effects;

    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let result = rt
            .backend
            .complete_workflow_task(
                task.clone(),
                new_events.clone(),
                workflow_events.clone(),
                activity_events.clone(),
                timers_to_schedule.clone(),
                timers_to_cancel.clone(),
            )
            .await;
        match result {
            Ok(()) => {
                debug!(
                    worker_id,
                    instance_id = %instance.instance_id,
                    execution_id = %instance.execution_id,
                    committed_events,
                    "workflow task committed"
                );
                if let Some(executor) = cached.as_deref_mut() {
                    executor.note_committed(committed_events);
                    executor.mark_warm();
                    if executor.is_finished() {
                        rt.cache.remove(&instance);
                    }
                } else {
                    rt.cache.remove(&instance);
                }
                return;
            }
            Err(e) if e.is_retryable() && attempt <= COMPLETE_RETRIES => {
                warn!(
                    worker_id,
                    instance_id = %instance.instance_id,
                    error = %e,
                    attempt,
                    "retrying workflow task completion"
                );
                tokio::time::sleep(RETRY_BACKOFF_INITIAL * attempt).await;
            }
            Err(e) => {
                // Lease lost or permanent failure: another worker owns the
                // task now (or will after expiry); the cached executor is
                // ahead of the store and must go.
                warn!(
                    worker_id,
                    instance_id = %instance.instance_id,
                    execution_id = %instance.execution_id,
                    error = %e,
                    "workflow task completion failed"
                );
                rt.cache.remove(&instance);
                return;
            }
        }
    }
}

async fn heartbeat_loop(
    backend: Arc<dyn Backend>,
    task: WorkflowTask,
    interval: Duration,
    stop: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = tokio::time::sleep(interval) => {
                if let Err(e) = backend.extend_workflow_task(&task).await {
                    warn!(
                        instance_id = %task.instance.instance_id,
                        execution_id = %task.instance.execution_id,
                        error = %e,
                        "workflow task heartbeat failed"
                    );
                    if !e.is_retryable() {
                        break;
                    }
                }
            }
        }
    }
}

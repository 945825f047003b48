//! Activity task dispatcher.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::Backoff;
use crate::providers::{ActivityTask, Backend};
use crate::runtime::Runtime;
use crate::{ActivityContext, EventAttributes, HistoryEvent, WorkflowError};

const RETRY_BACKOFF_INITIAL: Duration = Duration::from_millis(50);
const RETRY_BACKOFF_MAX: Duration = Duration::from_secs(5);
const COMPLETE_RETRIES: u32 = 3;

pub(crate) fn start(runtime: Arc<Runtime>) -> JoinHandle<()> {
    let count = runtime.options.activity_poller_count;
    tokio::spawn(async move {
        let mut pollers = Vec::with_capacity(count);
        for idx in 0..count {
            let rt = runtime.clone();
            let worker_id = format!("act-{idx}-{}", rt.runtime_id);
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
            fetched = rt.backend.get_activity_task(rt.options.poll_timeout) => fetched,
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
                warn!(worker_id, error = %e, "transient error fetching activity task");
                tokio::time::sleep(backoff.next_delay()).await;
            }
            Err(e) => {
                error!(worker_id, error = %e, "permanent error fetching activity task");
                tokio::time::sleep(RETRY_BACKOFF_MAX).await;
            }
        }
    }
    debug!(worker_id, "activity poller stopped");
}

async fn process_task(rt: &Arc<Runtime>, task: ActivityTask, worker_id: &str) {
    let (name, input) = match &task.event.attributes {
        EventAttributes::ActivityScheduled { name, input } => (name.clone(), input.clone()),
        other => {
            error!(
                worker_id,
                task_id = %task.id,
                event = ?other,
                "activity task without ActivityScheduled event; abandoning"
            );
            return;
        }
    };
    let Some(schedule_event_id) = task.event.schedule_event_id else {
        error!(
            worker_id,
            task_id = %task.id,
            "activity task without schedule_event_id; abandoning"
        );
        return;
    };

    debug!(
        worker_id,
        task_id = %task.id,
        instance_id = %task.instance.instance_id,
        activity_name = %name,
        schedule_event_id,
        "executing activity"
    );

    let heartbeat_stop = CancellationToken::new();
    let heartbeat = tokio::spawn(heartbeat_loop(
        rt.backend.clone(),
        task.id.clone(),
        rt.options.heartbeat_interval,
        heartbeat_stop.clone(),
    ));

    let attributes = match rt.activities.get(&name) {
        Some(handler) => {
            let ctx = ActivityContext::new(
                task.instance.clone(),
                name.clone(),
                schedule_event_id,
                worker_id.to_string(),
                rt.shutdown.child_token(),
            );
            match handler.invoke(ctx, input).await {
                Ok(result) => EventAttributes::ActivityCompleted { result },
                Err(message) => EventAttributes::ActivityFailed {
                    error: classify(message),
                },
            }
        }
        None => {
            warn!(worker_id, activity_name = %name, "unregistered activity");
            EventAttributes::ActivityFailed {
                error: WorkflowError::unregistered(&name),
            }
        }
    };

    heartbeat_stop.cancel();
    let _ = heartbeat.await;

    let completion = HistoryEvent::pending(Some(schedule_event_id), attributes);
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match rt
            .backend
            .complete_activity_task(&task.instance, &task.id, completion.clone())
            .await
        {
            Ok(()) => {
                debug!(worker_id, task_id = %task.id, "activity task completed");
                return;
            }
            Err(e) if e.is_retryable() && attempt <= COMPLETE_RETRIES => {
                warn!(worker_id, task_id = %task.id, error = %e, attempt, "retrying activity completion");
                tokio::time::sleep(RETRY_BACKOFF_INITIAL * attempt).await;
            }
            Err(e) => {
                // Lease lost: another worker owns the redelivered task and
                // will write the single completion.
                warn!(worker_id, task_id = %task.id, error = %e, "activity completion failed");
                return;
            }
        }
    }
}

fn classify(message: String) -> WorkflowError {
    if let Some(rest) = message.strip_prefix("serialization: ") {
        WorkflowError::serialization(rest)
    } else {
        WorkflowError::application(message)
    }
}

async fn heartbeat_loop(
    backend: Arc<dyn Backend>,
    task_id: String,
    interval: Duration,
    stop: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = tokio::time::sleep(interval) => {
                if let Err(e) = backend.extend_activity_task(&task_id).await {
                    warn!(task_id, error = %e, "activity heartbeat failed");
                    if !e.is_retryable() {
                        break;
                    }
                }
            }
        }
    }
}

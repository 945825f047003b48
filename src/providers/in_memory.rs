//! In-memory reference backend.
//!
//! All state lives behind one mutex; every contract operation is a single
//! critical section, which makes the atomicity requirements trivial and the
//! implementation a readable specification of the protocol. Useful for tests
//! and as the template for real stores.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::{
    is_start_event, ActivityTask, Backend, BackendError, DiagnosticsBackend, InstanceRef,
    InstanceState, InstanceTreeNode, TaskKind, WorkflowEvent, WorkflowTask,
};
use crate::{now_ms, EventAttributes, HistoryEvent, WorkflowInstance};

const POLL_GRANULARITY: Duration = Duration::from_millis(5);

type Key = (String, String);

fn key_of(instance: &WorkflowInstance) -> Key {
    (instance.instance_id.clone(), instance.execution_id.clone())
}

struct Lease {
    token: String,
    expires_at_ms: u64,
}

struct InstanceRecord {
    instance: WorkflowInstance,
    workflow_name: String,
    created_at_ms: u64,
    completed_at_ms: Option<u64>,
    history: Vec<HistoryEvent>,
    /// Ordered pending-event stream; the id is the per-instance arrival
    /// counter used as the consumption watermark.
    pending: VecDeque<(u64, HistoryEvent)>,
    next_pending_id: u64,
}

impl InstanceRecord {
    fn push_pending(&mut self, mut event: HistoryEvent) {
        event.visible_at_ms = None;
        self.next_pending_id += 1;
        self.pending.push_back((self.next_pending_id, event));
    }

    fn snapshot(&self) -> InstanceRef {
        InstanceRef {
            instance: self.instance.clone(),
            workflow_name: self.workflow_name.clone(),
            created_at_ms: self.created_at_ms,
            completed_at_ms: self.completed_at_ms,
            state: if self.completed_at_ms.is_some() {
                InstanceState::Finished
            } else {
                InstanceState::Active
            },
        }
    }
}

struct FutureEventRecord {
    target: WorkflowInstance,
    event: HistoryEvent,
}

struct ActivityRecord {
    instance: WorkflowInstance,
    event: HistoryEvent,
    lease_expires_at_ms: Option<u64>,
}

#[derive(Default)]
struct Shared {
    instances: HashMap<Key, InstanceRecord>,
    /// instance_id → (execution_id, created_at_ms) of the latest execution.
    latest: HashMap<String, (String, u64)>,
    /// Keys in creation order, for diagnostics paging.
    creation_order: Vec<Key>,
    /// parent instance_id → child instance_ids.
    children: HashMap<String, Vec<String>>,

    workflow_queue: VecDeque<Key>,
    /// Queued-set: bounds the queue to one entry per active instance.
    workflow_queued: HashSet<Key>,
    workflow_leases: HashMap<Key, Lease>,
    workflow_attempts: HashMap<Key, u32>,

    future_events: Vec<FutureEventRecord>,

    activity_queue: VecDeque<String>,
    activities: HashMap<String, ActivityRecord>,
}

impl Shared {
    fn enqueue_workflow_task(&mut self, key: Key) {
        if self.workflow_queued.insert(key.clone()) {
            self.workflow_queue.push_back(key);
        }
    }

    /// Return expired leases to their queues.
    fn recover_expired(&mut self, now: u64) {
        let expired: Vec<Key> = self
            .workflow_leases
            .iter()
            .filter(|(_, l)| l.expires_at_ms <= now)
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            debug!(instance = ?key, "workflow task lease expired, re-offering");
            self.workflow_leases.remove(&key);
            // The queued-set still holds the key; push the queue entry back.
            self.workflow_queue.push_back(key);
        }

        let expired: Vec<String> = self
            .activities
            .iter()
            .filter(|(_, a)| matches!(a.lease_expires_at_ms, Some(at) if at <= now))
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            debug!(task_id = %id, "activity task lease expired, re-offering");
            if let Some(record) = self.activities.get_mut(&id) {
                record.lease_expires_at_ms = None;
            }
            self.activity_queue.push_back(id);
        }
    }

    /// Move due future events into their pending streams; delete-and-deliver
    /// is one step under the state mutex.
    fn sweep_due(&mut self, now: u64) -> usize {
        let mut moved = 0;
        let drained = std::mem::take(&mut self.future_events);
        let mut remaining = Vec::with_capacity(drained.len());
        for record in drained {
            let due = record.event.visible_at_ms.map(|at| at <= now).unwrap_or(true);
            if !due {
                remaining.push(record);
                continue;
            }
            let key = key_of(&record.target);
            match self.instances.get_mut(&key) {
                Some(instance) => {
                    instance.push_pending(record.event);
                    self.enqueue_workflow_task(key);
                    moved += 1;
                }
                None => {
                    warn!(target = %record.target, "dropping future event for unknown instance");
                }
            }
        }
        self.future_events = remaining;
        moved
    }

    fn create_instance(
        &mut self,
        instance: WorkflowInstance,
        started: HistoryEvent,
        now: u64,
    ) -> Result<(), BackendError> {
        let key = key_of(&instance);
        if self.instances.contains_key(&key) {
            return Err(BackendError::InstanceAlreadyExists(instance.to_string()));
        }
        let workflow_name = match &started.attributes {
            EventAttributes::WorkflowExecutionStarted { name, .. } => name.clone(),
            other => {
                return Err(BackendError::permanent(
                    "create_workflow_instance",
                    format!("expected WorkflowExecutionStarted, got {other:?}"),
                ));
            }
        };

        let mut record = InstanceRecord {
            instance: instance.clone(),
            workflow_name,
            created_at_ms: now,
            completed_at_ms: None,
            history: Vec::new(),
            pending: VecDeque::new(),
            next_pending_id: 0,
        };
        record.push_pending(started);
        self.instances.insert(key.clone(), record);
        self.creation_order.push(key.clone());

        let latest = self
            .latest
            .entry(instance.instance_id.clone())
            .or_insert_with(|| (instance.execution_id.clone(), now));
        if now >= latest.1 {
            *latest = (instance.execution_id.clone(), now);
        }

        if let Some(parent) = &instance.parent {
            self.children
                .entry(parent.instance_id.clone())
                .or_default()
                .push(instance.instance_id.clone());
        }

        self.enqueue_workflow_task(key);
        Ok(())
    }

    fn resolve_target(&self, target: &WorkflowInstance) -> Option<Key> {
        if target.execution_id.is_empty() {
            let (execution_id, _) = self.latest.get(&target.instance_id)?;
            Some((target.instance_id.clone(), execution_id.clone()))
        } else {
            Some(key_of(target))
        }
    }
}

/// Mutex-protected reference implementation of [`Backend`].
pub struct InMemoryBackend {
    visibility_timeout: Duration,
    state: Mutex<Shared>,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::with_visibility_timeout(Duration::from_secs(30))
    }

    pub fn with_visibility_timeout(visibility_timeout: Duration) -> Self {
        Self {
            visibility_timeout,
            state: Mutex::new(Shared::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Shared> {
        self.state.lock().expect("backend state poisoned")
    }

    fn lease_deadline(&self, now: u64) -> u64 {
        now + self.visibility_timeout.as_millis() as u64
    }

    fn try_get_workflow_task(&self) -> Option<WorkflowTask> {
        let mut shared = self.lock();
        let now = now_ms();
        shared.recover_expired(now);
        shared.sweep_due(now);

        while let Some(key) = shared.workflow_queue.pop_front() {
            if !shared.instances.contains_key(&key) {
                shared.workflow_queued.remove(&key);
                continue;
            }
            if matches!(shared.workflow_leases.get(&key), Some(l) if l.expires_at_ms > now) {
                // Actively leased; the completing worker re-enqueues when
                // pending events remain.
                continue;
            }
            let attempt = {
                let count = shared.workflow_attempts.entry(key.clone()).or_insert(0);
                *count += 1;
                *count
            };
            let token = uuid::Uuid::new_v4().to_string();
            let expires_at_ms = self.lease_deadline(now);
            let Some(record) = shared.instances.get(&key) else {
                continue;
            };
            let new_events: Vec<HistoryEvent> =
                record.pending.iter().map(|(_, e)| e.clone()).collect();
            let backend_cursor = record.pending.back().map(|(id, _)| *id).unwrap_or(0);
            let task = WorkflowTask {
                instance: record.instance.clone(),
                kind: TaskKind::Full,
                history: record.history.clone(),
                new_events,
                last_sequence_id: record.history.len() as u64,
                completed_at_ms: record.completed_at_ms,
                attempt,
                lease_token: token.clone(),
                backend_cursor,
            };
            shared
                .workflow_leases
                .insert(key, Lease { token, expires_at_ms });
            return Some(task);
        }
        None
    }

    fn try_get_activity_task(&self) -> Option<ActivityTask> {
        let mut shared = self.lock();
        let now = now_ms();
        shared.recover_expired(now);

        while let Some(id) = shared.activity_queue.pop_front() {
            let deadline = self.lease_deadline(now);
            let Some(record) = shared.activities.get_mut(&id) else {
                continue;
            };
            if matches!(record.lease_expires_at_ms, Some(at) if at > now) {
                continue;
            }
            record.lease_expires_at_ms = Some(deadline);
            return Some(ActivityTask {
                id: id.clone(),
                instance: record.instance.clone(),
                event: record.event.clone(),
            });
        }
        None
    }
}

#[async_trait::async_trait]
impl Backend for InMemoryBackend {
    fn name(&self) -> &str {
        "in-memory"
    }

    async fn create_workflow_instance(
        &self,
        instance: WorkflowInstance,
        started: HistoryEvent,
    ) -> Result<(), BackendError> {
        let mut shared = self.lock();
        shared.create_instance(instance, started, now_ms())
    }

    async fn get_workflow_task(
        &self,
        timeout: Duration,
    ) -> Result<Option<WorkflowTask>, BackendError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(task) = self.try_get_workflow_task() {
                return Ok(Some(task));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POLL_GRANULARITY).await;
        }
    }

    async fn extend_workflow_task(&self, task: &WorkflowTask) -> Result<(), BackendError> {
        let mut shared = self.lock();
        let now = now_ms();
        let deadline = self.lease_deadline(now);
        let key = key_of(&task.instance);
        match shared.workflow_leases.get_mut(&key) {
            Some(lease) if lease.token == task.lease_token && lease.expires_at_ms > now => {
                lease.expires_at_ms = deadline;
                Ok(())
            }
            _ => Err(BackendError::LeaseLost),
        }
    }

    async fn complete_workflow_task(
        &self,
        task: WorkflowTask,
        new_events: Vec<HistoryEvent>,
        workflow_events: Vec<WorkflowEvent>,
        activity_events: Vec<HistoryEvent>,
        timers_to_schedule: Vec<WorkflowEvent>,
        timers_to_cancel: Vec<u64>,
    ) -> Result<(), BackendError> {
        let mut shared = self.lock();
        let now = now_ms();
        let key = key_of(&task.instance);

        // Lease verification is part of the same critical section as the
        // append; there is no pre-check window.
        match shared.workflow_leases.get(&key) {
            Some(lease) if lease.token == task.lease_token && lease.expires_at_ms > now => {}
            _ => return Err(BackendError::LeaseLost),
        }
        shared.workflow_leases.remove(&key);
        shared.workflow_queued.remove(&key);
        shared.workflow_attempts.remove(&key);

        {
            let record = shared
                .instances
                .get_mut(&key)
                .ok_or_else(|| BackendError::InstanceNotFound(task.instance.to_string()))?;

            if record.completed_at_ms.is_some() && !new_events.is_empty() {
                return Err(BackendError::permanent(
                    "complete_workflow_task",
                    format!("append to finished instance {}", task.instance),
                ));
            }

            for event in new_events {
                let sequence_id = record.history.len() as u64 + 1;
                let terminal = event.is_terminal();
                record.history.push(event.with_sequence(sequence_id));
                if terminal {
                    record.completed_at_ms = Some(now);
                }
            }

            while matches!(record.pending.front(), Some((id, _)) if *id <= task.backend_cursor) {
                record.pending.pop_front();
            }
        }

        for event in activity_events {
            let id = uuid::Uuid::new_v4().to_string();
            shared.activities.insert(
                id.clone(),
                ActivityRecord {
                    instance: task.instance.clone(),
                    event,
                    lease_expires_at_ms: None,
                },
            );
            shared.activity_queue.push_back(id);
        }

        for timer in timers_to_schedule {
            shared.future_events.push(FutureEventRecord {
                target: timer.instance,
                event: timer.event,
            });
        }
        for schedule_id in timers_to_cancel {
            shared.future_events.retain(|f| {
                !(key_of(&f.target) == key && f.event.schedule_event_id == Some(schedule_id))
            });
        }

        for delivery in workflow_events {
            if is_start_event(&delivery.event) {
                // Idempotent under task retries: the child may already exist.
                match shared.create_instance(delivery.instance.clone(), delivery.event, now) {
                    Ok(()) | Err(BackendError::InstanceAlreadyExists(_)) => {}
                    Err(e) => return Err(e),
                }
                continue;
            }
            let Some(target_key) = shared.resolve_target(&delivery.instance) else {
                warn!(target = %delivery.instance, "dropping workflow event for unknown instance");
                continue;
            };
            match shared.instances.get_mut(&target_key) {
                Some(record) => {
                    record.push_pending(delivery.event);
                    shared.enqueue_workflow_task(target_key);
                }
                None => {
                    warn!(target = %delivery.instance, "dropping workflow event for unknown instance");
                }
            }
        }

        // Events that arrived while this task was in flight need another
        // turn.
        let has_pending = shared
            .instances
            .get(&key)
            .map(|r| !r.pending.is_empty())
            .unwrap_or(false);
        if has_pending {
            shared.enqueue_workflow_task(key);
        }

        Ok(())
    }

    async fn get_activity_task(
        &self,
        timeout: Duration,
    ) -> Result<Option<ActivityTask>, BackendError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(task) = self.try_get_activity_task() {
                return Ok(Some(task));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POLL_GRANULARITY).await;
        }
    }

    async fn extend_activity_task(&self, task_id: &str) -> Result<(), BackendError> {
        let mut shared = self.lock();
        let now = now_ms();
        let deadline = self.lease_deadline(now);
        match shared.activities.get_mut(task_id) {
            Some(record) if matches!(record.lease_expires_at_ms, Some(at) if at > now) => {
                record.lease_expires_at_ms = Some(deadline);
                Ok(())
            }
            _ => Err(BackendError::LeaseLost),
        }
    }

    async fn complete_activity_task(
        &self,
        instance: &WorkflowInstance,
        task_id: &str,
        event: HistoryEvent,
    ) -> Result<(), BackendError> {
        let mut shared = self.lock();
        // Removing the record is what makes completion exactly-once: a
        // second attempt finds nothing and fails.
        if shared.activities.remove(task_id).is_none() {
            return Err(BackendError::LeaseLost);
        }
        let key = key_of(instance);
        let record = shared
            .instances
            .get_mut(&key)
            .ok_or_else(|| BackendError::InstanceNotFound(instance.to_string()))?;
        record.push_pending(event);
        shared.enqueue_workflow_task(key);
        Ok(())
    }

    async fn signal_workflow(
        &self,
        instance_id: &str,
        event: HistoryEvent,
    ) -> Result<(), BackendError> {
        let mut shared = self.lock();
        let Some((execution_id, _)) = shared.latest.get(instance_id).cloned() else {
            return Err(BackendError::InstanceNotFound(instance_id.to_string()));
        };
        let key = (instance_id.to_string(), execution_id);
        let record = shared
            .instances
            .get_mut(&key)
            .ok_or_else(|| BackendError::InstanceNotFound(instance_id.to_string()))?;
        record.push_pending(event);
        shared.enqueue_workflow_task(key);
        Ok(())
    }

    async fn sweep_future_events(&self) -> Result<usize, BackendError> {
        let mut shared = self.lock();
        Ok(shared.sweep_due(now_ms()))
    }

    async fn remove_workflow_instance(
        &self,
        instance: &WorkflowInstance,
    ) -> Result<(), BackendError> {
        let mut shared = self.lock();
        let key = key_of(instance);
        match shared.instances.get(&key) {
            None => return Err(BackendError::InstanceNotFound(instance.to_string())),
            Some(record) if record.completed_at_ms.is_none() => {
                return Err(BackendError::permanent(
                    "remove_workflow_instance",
                    format!("instance {instance} is still active"),
                ));
            }
            Some(_) => {}
        }
        shared.instances.remove(&key);
        shared.creation_order.retain(|k| *k != key);
        shared.workflow_queue.retain(|k| *k != key);
        shared.workflow_queued.remove(&key);
        shared.workflow_leases.remove(&key);
        shared.workflow_attempts.remove(&key);
        shared.future_events.retain(|f| key_of(&f.target) != key);
        if matches!(shared.latest.get(&key.0), Some((exec, _)) if *exec == key.1) {
            shared.latest.remove(&key.0);
        }
        Ok(())
    }

    async fn read_history(
        &self,
        instance: &WorkflowInstance,
    ) -> Result<Vec<HistoryEvent>, BackendError> {
        let shared = self.lock();
        shared
            .instances
            .get(&key_of(instance))
            .map(|r| r.history.clone())
            .ok_or_else(|| BackendError::InstanceNotFound(instance.to_string()))
    }

    async fn latest_execution(
        &self,
        instance_id: &str,
    ) -> Result<Option<WorkflowInstance>, BackendError> {
        let shared = self.lock();
        let Some((execution_id, _)) = shared.latest.get(instance_id) else {
            return Ok(None);
        };
        let key = (instance_id.to_string(), execution_id.clone());
        Ok(shared.instances.get(&key).map(|r| r.instance.clone()))
    }

    fn as_diagnostics(&self) -> Option<&dyn DiagnosticsBackend> {
        Some(self)
    }
}

#[async_trait::async_trait]
impl DiagnosticsBackend for InMemoryBackend {
    async fn list_instances(
        &self,
        after: Option<&WorkflowInstance>,
        count: usize,
    ) -> Result<Vec<InstanceRef>, BackendError> {
        let shared = self.lock();
        let mut newest_first = shared.creation_order.iter().rev();

        if let Some(after) = after {
            let after_key = key_of(after);
            let mut found = false;
            for key in newest_first.by_ref() {
                if *key == after_key {
                    found = true;
                    break;
                }
            }
            if !found {
                // Unknown cursor pages to an empty result, not an error.
                return Ok(Vec::new());
            }
        }

        Ok(newest_first
            .filter_map(|key| shared.instances.get(key))
            .take(count)
            .map(|r| r.snapshot())
            .collect())
    }

    async fn get_instance(&self, instance_id: &str) -> Result<Option<InstanceRef>, BackendError> {
        let shared = self.lock();
        let Some((execution_id, _)) = shared.latest.get(instance_id) else {
            return Ok(None);
        };
        let key = (instance_id.to_string(), execution_id.clone());
        Ok(shared.instances.get(&key).map(|r| r.snapshot()))
    }

    async fn get_instance_tree(
        &self,
        instance_id: &str,
    ) -> Result<Option<InstanceTreeNode>, BackendError> {
        let shared = self.lock();
        fn build(shared: &Shared, instance_id: &str) -> Option<InstanceTreeNode> {
            let (execution_id, _) = shared.latest.get(instance_id)?;
            let key = (instance_id.to_string(), execution_id.clone());
            let record = shared.instances.get(&key)?;
            let children = shared
                .children
                .get(instance_id)
                .map(|ids| ids.iter().filter_map(|id| build(shared, id)).collect())
                .unwrap_or_default();
            Some(InstanceTreeNode {
                instance: record.snapshot(),
                children,
            })
        }
        Ok(build(&shared, instance_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started_event(name: &str, input: &str) -> HistoryEvent {
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

    #[tokio::test]
    async fn duplicate_instance_creation_fails() {
        let backend = InMemoryBackend::new();
        let instance = WorkflowInstance::new("i1", "e1");
        backend
            .create_workflow_instance(instance.clone(), started_event("w", "{}"))
            .await
            .unwrap();
        let err = backend
            .create_workflow_instance(instance, started_event("w", "{}"))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::InstanceAlreadyExists(_)));
    }

    #[tokio::test]
    async fn single_task_is_invisible_while_leased() {
        let backend = InMemoryBackend::new();
        let instance = WorkflowInstance::new("i1", "e1");
        backend
            .create_workflow_instance(instance, started_event("w", "{}"))
            .await
            .unwrap();

        let first = backend
            .get_workflow_task(Duration::ZERO)
            .await
            .unwrap()
            .expect("task available");
        assert_eq!(first.new_events.len(), 1);

        let second = backend.get_workflow_task(Duration::ZERO).await.unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn expired_lease_is_redelivered_and_stale_completion_fails() {
        let backend = InMemoryBackend::with_visibility_timeout(Duration::from_millis(30));
        let instance = WorkflowInstance::new("i1", "e1");
        backend
            .create_workflow_instance(instance, started_event("w", "{}"))
            .await
            .unwrap();

        let stale = backend
            .get_workflow_task(Duration::ZERO)
            .await
            .unwrap()
            .expect("task available");
        tokio::time::sleep(Duration::from_millis(50)).await;

        let fresh = backend
            .get_workflow_task(Duration::from_millis(200))
            .await
            .unwrap()
            .expect("redelivered after expiry");
        assert_eq!(fresh.attempt, 2);
        assert_ne!(fresh.lease_token, stale.lease_token);

        // The crashed worker's completion must fail; the new owner's wins.
        let err = backend
            .complete_workflow_task(stale, vec![], vec![], vec![], vec![], vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::LeaseLost));
        backend
            .complete_workflow_task(fresh, vec![], vec![], vec![], vec![], vec![])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn sweeper_is_idempotent() {
        let backend = InMemoryBackend::new();
        let instance = WorkflowInstance::new("i1", "e1");
        backend
            .create_workflow_instance(instance.clone(), started_event("w", "{}"))
            .await
            .unwrap();
        let task = backend
            .get_workflow_task(Duration::ZERO)
            .await
            .unwrap()
            .expect("task");

        let due = HistoryEvent::future(Some(0), EventAttributes::TimerFired { fire_at_ms: 1 }, 1);
        backend
            .complete_workflow_task(
                task,
                vec![],
                vec![],
                vec![],
                vec![WorkflowEvent {
                    instance: instance.clone(),
                    event: due,
                }],
                vec![],
            )
            .await
            .unwrap();

        assert_eq!(backend.sweep_future_events().await.unwrap(), 1);
        assert_eq!(backend.sweep_future_events().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unknown_list_cursor_yields_empty_page() {
        let backend = InMemoryBackend::new();
        backend
            .create_workflow_instance(WorkflowInstance::new("i1", "e1"), started_event("w", "{}"))
            .await
            .unwrap();
        let ghost = WorkflowInstance::new("ghost", "e1");
        let page = backend.list_instances(Some(&ghost), 10).await.unwrap();
        assert!(page.is_empty());
    }
}

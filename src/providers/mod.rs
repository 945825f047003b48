//! Pluggable backend contract.
//!
//! A backend persists instances, histories and pending events, runs the task
//! queues with visibility-timeout leases, and commits workflow task results
//! atomically. The runtime computes all workflow semantics; backends are pure
//! storage and must never invent events or ids.
//!
//! # The contract, in short
//!
//! - **History**: append-only per `(instance_id, execution_id)`. Sequence ids
//!   are assigned at commit time and must be gapless, strictly increasing
//!   from 1. Nothing may be appended after a terminal event.
//! - **Pending events**: ordered stream per instance of events that arrived
//!   but have not been folded into history by a completing task.
//! - **Future events**: pending events with `visible_at_ms` set; they join
//!   the pending stream only once due, moved by an idempotent sweep whose
//!   delete-and-deliver is a single atomic step.
//! - **Queues**: one workflow queue (instance-granular, deduplicated by a
//!   queued-set so bursts cannot grow it beyond the number of distinct active
//!   instances) and one activity queue. Every `get_*` takes an exclusive
//!   lease with a visibility timeout; `extend_*` renews it; expiry re-offers
//!   the task.
//! - **Atomic completion**: `complete_workflow_task` verifies the lease and
//!   applies history append, pending-event consumption, activity enqueues,
//!   future-event schedule/cancel and cross-instance delivery in one atomic
//!   step, or fails leaving no partial state.

use std::time::Duration;

use crate::{HistoryEvent, WorkflowInstance};

pub mod in_memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;

/// Whether this workflow task carries full replayable history or only the
/// events that arrived since the last checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// `history` is complete; any worker can execute this task.
    Full,
    /// `history` is empty; valid only for a worker holding a cached executor
    /// whose `last_sequence_id` matches the task's.
    Continuation,
}

/// A unit of workflow progress leased to one worker.
#[derive(Debug, Clone)]
pub struct WorkflowTask {
    pub instance: WorkflowInstance,
    pub kind: TaskKind,
    /// Committed history of the execution, ordered by sequence id. Empty for
    /// continuation tasks.
    pub history: Vec<HistoryEvent>,
    /// Pending events delivered with this task, in arrival order.
    pub new_events: Vec<HistoryEvent>,
    /// Sequence id of the last committed history event (0 for a fresh
    /// instance); the executor resume point.
    pub last_sequence_id: u64,
    /// Set when the instance already reached a terminal state.
    pub completed_at_ms: Option<u64>,
    /// Delivery attempt number, for dead-letter policies.
    pub attempt: u32,
    /// Lease token; completion and extension must present it.
    pub lease_token: String,
    /// Backend-private watermark identifying the consumed pending events.
    pub backend_cursor: u64,
}

/// An activity invocation leased to one worker.
#[derive(Debug, Clone)]
pub struct ActivityTask {
    /// Task id; also the lease key for extend/complete.
    pub id: String,
    pub instance: WorkflowInstance,
    /// The `ActivityScheduled` event being executed.
    pub event: HistoryEvent,
}

/// A message delivered to another (or a future version of the same) instance
/// atomically with the emitting task's commit.
#[derive(Debug, Clone)]
pub struct WorkflowEvent {
    /// Target instance. An empty `execution_id` addresses the latest
    /// execution of `instance_id`.
    pub instance: WorkflowInstance,
    pub event: HistoryEvent,
}

/// State of an instance as reported by diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum InstanceState {
    Active,
    Finished,
}

/// Diagnostics view of one instance.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct InstanceRef {
    pub instance: WorkflowInstance,
    pub workflow_name: String,
    pub created_at_ms: u64,
    pub completed_at_ms: Option<u64>,
    pub state: InstanceState,
}

/// Sub-workflow tree rooted at one instance.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct InstanceTreeNode {
    pub instance: InstanceRef,
    pub children: Vec<InstanceTreeNode>,
}

/// Backend failure classification.
///
/// Dispatchers retry retryable storage errors with backoff; everything else
/// is surfaced. Lease errors are normal operation (another worker won).
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    #[error("lease not held or expired")]
    LeaseLost,
    #[error("workflow instance {0} already exists")]
    InstanceAlreadyExists(String),
    #[error("workflow instance {0} not found")]
    InstanceNotFound(String),
    #[error("storage failure in {operation}: {message}")]
    Storage {
        operation: String,
        message: String,
        retryable: bool,
    },
    #[error("serialization failure: {0}")]
    Serialization(String),
}

impl BackendError {
    /// Transient storage error; the caller may retry.
    pub fn retryable(operation: impl Into<String>, message: impl Into<String>) -> Self {
        BackendError::Storage {
            operation: operation.into(),
            message: message.into(),
            retryable: true,
        }
    }

    /// Permanent storage error (corruption, invariant violation).
    pub fn permanent(operation: impl Into<String>, message: impl Into<String>) -> Self {
        BackendError::Storage {
            operation: operation.into(),
            message: message.into(),
            retryable: false,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            BackendError::Storage { retryable, .. } => *retryable,
            BackendError::LeaseLost
            | BackendError::InstanceAlreadyExists(_)
            | BackendError::InstanceNotFound(_)
            | BackendError::Serialization(_) => false,
        }
    }
}

/// Storage contract any host of the engine must satisfy.
///
/// All methods must be safe under concurrent callers. The runtime depends on
/// every invariant documented on this trait; a store that relaxes any of
/// them breaks exactly-once effect semantics.
#[async_trait::async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Backend name for logs and diagnostics.
    fn name(&self) -> &str {
        "unknown"
    }

    /// Create an instance and enqueue its first workflow task.
    ///
    /// `started` must be a `WorkflowExecutionStarted` pending event. Fails
    /// with [`BackendError::InstanceAlreadyExists`] when the
    /// `(instance_id, execution_id)` pair exists. Updates the
    /// latest-execution mapping for the instance id.
    async fn create_workflow_instance(
        &self,
        instance: WorkflowInstance,
        started: HistoryEvent,
    ) -> Result<(), BackendError>;

    /// Return the next leased workflow task, or `None` once `timeout`
    /// elapses. Runs the future-event sweep. Re-delivery after lease expiry
    /// is idempotent: the task content is rebuilt from durable state.
    async fn get_workflow_task(
        &self,
        timeout: Duration,
    ) -> Result<Option<WorkflowTask>, BackendError>;

    /// Renew the task lease. Fails with [`BackendError::LeaseLost`] when the
    /// lease is no longer held.
    async fn extend_workflow_task(&self, task: &WorkflowTask) -> Result<(), BackendError>;

    /// Atomically commit one workflow task:
    ///
    /// 1. verify the lease (inside the same atomic step as the append);
    /// 2. append `new_events` to history with gapless sequence ids;
    /// 3. consume the delivered pending events;
    /// 4. enqueue `activity_events` as activity tasks;
    /// 5. store `timers_to_schedule` as future events and drop the future
    ///    events named by `timers_to_cancel`;
    /// 6. deliver each of `workflow_events` to its target instance, creating
    ///    the instance for `WorkflowExecutionStarted` events and enqueueing
    ///    the target's workflow task (deduplicated);
    /// 7. mark the instance terminal if a terminal event was appended;
    /// 8. release the lease, re-enqueueing this instance when more pending
    ///    events are already waiting.
    async fn complete_workflow_task(
        &self,
        task: WorkflowTask,
        new_events: Vec<HistoryEvent>,
        workflow_events: Vec<WorkflowEvent>,
        activity_events: Vec<HistoryEvent>,
        timers_to_schedule: Vec<WorkflowEvent>,
        timers_to_cancel: Vec<u64>,
    ) -> Result<(), BackendError>;

    /// Return the next leased activity task, or `None` once `timeout`
    /// elapses.
    async fn get_activity_task(
        &self,
        timeout: Duration,
    ) -> Result<Option<ActivityTask>, BackendError>;

    /// Renew an activity task lease.
    async fn extend_activity_task(&self, task_id: &str) -> Result<(), BackendError>;

    /// Append the completion event to the target instance's pending events
    /// and enqueue its workflow task if not already queued. Exactly one
    /// completion lands even when workers retry: the second attempt fails
    /// with [`BackendError::LeaseLost`].
    async fn complete_activity_task(
        &self,
        instance: &WorkflowInstance,
        task_id: &str,
        event: HistoryEvent,
    ) -> Result<(), BackendError>;

    /// Deliver a `SignalReceived` event to the latest execution of
    /// `instance_id` and enqueue its workflow task.
    async fn signal_workflow(
        &self,
        instance_id: &str,
        event: HistoryEvent,
    ) -> Result<(), BackendError>;

    /// Move due future events into their instances' pending streams and
    /// enqueue the affected workflow tasks. Returns the number of events
    /// moved. Idempotent: a sweep with no due events is a no-op.
    async fn sweep_future_events(&self) -> Result<usize, BackendError>;

    /// Delete a finished instance (retention cleanup). Fails when the
    /// instance is still active.
    async fn remove_workflow_instance(
        &self,
        instance: &WorkflowInstance,
    ) -> Result<(), BackendError>;

    /// Full committed history of one execution, ordered by sequence id.
    async fn read_history(
        &self,
        instance: &WorkflowInstance,
    ) -> Result<Vec<HistoryEvent>, BackendError>;

    /// Latest execution (by creation time) of an instance id, from the
    /// maintained mapping — never a key scan.
    async fn latest_execution(
        &self,
        instance_id: &str,
    ) -> Result<Option<WorkflowInstance>, BackendError>;

    /// Diagnostics capability, when implemented.
    fn as_diagnostics(&self) -> Option<&dyn DiagnosticsBackend> {
        None
    }
}

/// Optional read-side diagnostics.
#[async_trait::async_trait]
pub trait DiagnosticsBackend: Send + Sync {
    /// Page instances by descending creation time. `after` is an exclusive
    /// cursor; an unknown cursor yields an empty page, not an error.
    async fn list_instances(
        &self,
        after: Option<&WorkflowInstance>,
        count: usize,
    ) -> Result<Vec<InstanceRef>, BackendError>;

    /// Latest execution of one instance id, or `None`.
    async fn get_instance(&self, instance_id: &str) -> Result<Option<InstanceRef>, BackendError>;

    /// Sub-workflow tree rooted at the given instance id.
    async fn get_instance_tree(
        &self,
        instance_id: &str,
    ) -> Result<Option<InstanceTreeNode>, BackendError>;
}

/// Start events create their target instance instead of being delivered to
/// an existing pending stream.
pub(crate) fn is_start_event(event: &HistoryEvent) -> bool {
    matches!(
        event.attributes,
        crate::EventAttributes::WorkflowExecutionStarted { .. }
    )
}

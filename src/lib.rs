//! # Flywheel: durable workflow engine
//!
//! Flywheel runs long-running workflows whose progress survives process
//! crashes and restarts. A workflow is ordinary async Rust: deterministic
//! orchestration code that schedules activities, sleeps on timers, waits for
//! signals and spawns sub-workflows. The engine replays orchestration code
//! from a persisted event history, giving exactly-once effect semantics on
//! top of at-least-once task delivery.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use flywheel::providers::in_memory::InMemoryBackend;
//! use flywheel::runtime::registry::{ActivityRegistry, WorkflowRegistry};
//! use flywheel::runtime::{Runtime, RuntimeOptions};
//! use flywheel::{Client, WorkflowContext};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let backend = Arc::new(InMemoryBackend::new());
//!
//! let activities = ActivityRegistry::builder()
//!     .register("add", |_ctx, (a, b): (i64, i64)| async move { Ok(a + b) })
//!     .build()?;
//!
//! let workflows = WorkflowRegistry::builder()
//!     .register("adder", |ctx: WorkflowContext, input: (i64, i64)| async move {
//!         let sum = ctx.schedule_activity("add", input).await?;
//!         Ok(sum)
//!     })
//!     .build()?;
//!
//! let rt = Runtime::start_with_backend(
//!     backend.clone(),
//!     Arc::new(activities),
//!     Arc::new(workflows),
//!     RuntimeOptions::default(),
//! );
//!
//! let client = Client::new(backend);
//! client.start_workflow("job-1", "adder", (2, 3)).await?;
//! let sum: i64 = client
//!     .wait_for_workflow("job-1", std::time::Duration::from_secs(5))
//!     .await?;
//! assert_eq!(sum, 5);
//! rt.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Determinism rules
//!
//! Workflow code must only depend on the context it is given: use
//! [`WorkflowContext::now_ms`] instead of the wall clock,
//! [`WorkflowContext::new_uuid`] instead of random sources and
//! [`WorkflowContext::side_effect`] for any other one-shot nondeterminism.
//! Anything that talks to the outside world belongs in an activity.
//!
//! ## Architecture
//!
//! - Event and command model: [`HistoryEvent`], [`EventAttributes`],
//!   [`Command`] — the persisted vocabulary of the engine.
//! - [`WorkflowContext`] + durable futures ([`futures`]) — the deterministic,
//!   single-threaded surface workflow code runs on.
//! - [`runtime`] — the worker pools, the replaying executor and the executor
//!   cache.
//! - [`providers`] — the pluggable backend contract plus the in-memory and
//!   SQLite reference stores.
//! - [`client`] — starting, signalling and observing workflow instances.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

pub mod client;
pub mod futures;
pub mod logging;
pub mod providers;
pub mod runtime;

pub use client::{Client, ClientError, WorkflowStatus};
pub use runtime::registry::{ActivityRegistry, WorkflowRegistry};
pub use runtime::{Runtime, RuntimeOptions};
pub use self::futures::{
    ActivityFuture, DurableFuture, JoinFuture, Select2Future, Select3Future, SideEffectFuture,
    SignalChannel, SignalFuture, SubWorkflowFuture, TimerFuture,
};

/// Reserved signal channel used to deliver cancellation requests.
///
/// Cancellation rides the ordinary signal path so that it is recorded in
/// history and observed deterministically, only between suspension points.
pub const CANCEL_SIGNAL: &str = "__cancel";

/// Milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ============================================================================
// Payload codec
// ============================================================================

/// Encoding between user values and the string payloads carried by events.
///
/// The engine moves payloads around as strings; the codec sits at the edges
/// (scheduling inputs, handler arguments, results). The default is JSON with
/// one convenience: a payload that is itself a string round-trips without
/// double encoding.
pub trait Codec {
    fn encode<T: Serialize>(value: &T) -> Result<String, String>;
    fn decode<T: serde::de::DeserializeOwned>(payload: &str) -> Result<T, String>;
}

/// Default JSON codec.
pub struct Json;

impl Codec for Json {
    fn encode<T: Serialize>(value: &T) -> Result<String, String> {
        match serde_json::to_value(value) {
            Ok(serde_json::Value::String(s)) => Ok(s),
            Ok(v) => serde_json::to_string(&v).map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        }
    }

    fn decode<T: serde::de::DeserializeOwned>(payload: &str) -> Result<T, String> {
        match serde_json::from_str::<T>(payload) {
            Ok(v) => Ok(v),
            Err(_) => {
                // Raw strings arrive unquoted; retry as a JSON string value.
                serde_json::from_value(serde_json::Value::String(payload.to_string()))
                    .map_err(|e| e.to_string())
            }
        }
    }
}

// ============================================================================
// Instance identity
// ============================================================================

/// Link from a sub-workflow back to the scheduling event in its parent.
///
/// This is data, not ownership: the parent never holds a handle to the child,
/// and all signalling between the two flows through the backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParentLink {
    pub instance_id: String,
    pub execution_id: String,
    pub schedule_event_id: u64,
}

/// Identity of one workflow execution: `(instance_id, execution_id)`.
///
/// An instance id may accumulate several execution ids over its lifetime; the
/// latest by creation time is the current one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub instance_id: String,
    pub execution_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<ParentLink>,
}

impl WorkflowInstance {
    pub fn new(instance_id: impl Into<String>, execution_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            execution_id: execution_id.into(),
            parent: None,
        }
    }

    pub fn sub_workflow(
        instance_id: impl Into<String>,
        execution_id: impl Into<String>,
        parent: ParentLink,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            execution_id: execution_id.into(),
            parent: Some(parent),
        }
    }

    pub fn is_sub_workflow(&self) -> bool {
        self.parent.is_some()
    }
}

impl std::fmt::Display for WorkflowInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.instance_id, self.execution_id)
    }
}

// ============================================================================
// Errors carried by history
// ============================================================================

/// Classification of a recorded workflow/activity error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowErrorKind {
    /// Business-logic failure returned by user code.
    Application,
    /// Payload could not be encoded or decoded.
    Serialization,
    /// The named workflow or activity is not registered.
    Unregistered,
    /// The instance was cancelled.
    Canceled,
}

/// Serializable error recorded in `ActivityFailed`, `SubWorkflowFailed` and
/// `WorkflowExecutionFinished` events and surfaced to waiting callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowError {
    pub message: String,
    pub kind: WorkflowErrorKind,
}

impl WorkflowError {
    pub fn application(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: WorkflowErrorKind::Application,
        }
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: WorkflowErrorKind::Serialization,
        }
    }

    pub fn unregistered(name: &str) -> Self {
        Self {
            message: format!("not registered: {name}"),
            kind: WorkflowErrorKind::Unregistered,
        }
    }

    pub fn canceled(reason: impl Into<String>) -> Self {
        Self {
            message: reason.into(),
            kind: WorkflowErrorKind::Canceled,
        }
    }
}

impl std::fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

// ============================================================================
// History events
// ============================================================================

/// Type-specific payload of a [`HistoryEvent`].
///
/// This union is closed: backends persist it verbatim and the executor
/// dispatches on it during replay. Serialization is stable JSON, snake_case
/// fields, discriminated by the `type` tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventAttributes {
    WorkflowExecutionStarted {
        name: String,
        input: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_instance_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_execution_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_schedule_event_id: Option<u64>,
    },
    WorkflowExecutionFinished {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<WorkflowError>,
    },
    WorkflowTaskStarted,
    WorkflowTaskFinished,
    ActivityScheduled {
        name: String,
        input: String,
    },
    ActivityCompleted {
        result: String,
    },
    ActivityFailed {
        error: WorkflowError,
    },
    TimerScheduled {
        fire_at_ms: u64,
    },
    TimerFired {
        fire_at_ms: u64,
    },
    TimerCanceled,
    SubWorkflowScheduled {
        name: String,
        instance_id: String,
        input: String,
    },
    SubWorkflowCompleted {
        result: String,
    },
    SubWorkflowFailed {
        error: WorkflowError,
    },
    SignalReceived {
        name: String,
        input: String,
    },
    SideEffectResult {
        result: String,
    },
}

/// One immutable entry of a workflow instance history.
///
/// `sequence_id` is the strictly increasing, gapless position in history,
/// assigned by the backend at commit time; pending events carry zero until
/// then. Paired completions reference their scheduling event through
/// `schedule_event_id`. `visible_at_ms` marks future events (timers) that the
/// backend keeps out of the pending stream until their time arrives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEvent {
    pub sequence_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_event_id: Option<u64>,
    pub timestamp_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visible_at_ms: Option<u64>,
    #[serde(flatten)]
    pub attributes: EventAttributes,
}

impl HistoryEvent {
    /// A pending event: timestamped now, sequence assigned at commit.
    pub fn pending(schedule_event_id: Option<u64>, attributes: EventAttributes) -> Self {
        Self {
            sequence_id: 0,
            schedule_event_id,
            timestamp_ms: now_ms(),
            visible_at_ms: None,
            attributes,
        }
    }

    /// A future event that becomes visible once `visible_at_ms` has passed.
    pub fn future(
        schedule_event_id: Option<u64>,
        attributes: EventAttributes,
        visible_at_ms: u64,
    ) -> Self {
        Self {
            sequence_id: 0,
            schedule_event_id,
            timestamp_ms: now_ms(),
            visible_at_ms: Some(visible_at_ms),
            attributes,
        }
    }

    pub fn with_sequence(mut self, sequence_id: u64) -> Self {
        self.sequence_id = sequence_id;
        self
    }

    /// Discriminant name, used by stores for indexing only.
    pub fn event_type(&self) -> &'static str {
        match &self.attributes {
            EventAttributes::WorkflowExecutionStarted { .. } => "WorkflowExecutionStarted",
            EventAttributes::WorkflowExecutionFinished { .. } => "WorkflowExecutionFinished",
            EventAttributes::WorkflowTaskStarted => "WorkflowTaskStarted",
            EventAttributes::WorkflowTaskFinished => "WorkflowTaskFinished",
            EventAttributes::ActivityScheduled { .. } => "ActivityScheduled",
            EventAttributes::ActivityCompleted { .. } => "ActivityCompleted",
            EventAttributes::ActivityFailed { .. } => "ActivityFailed",
            EventAttributes::TimerScheduled { .. } => "TimerScheduled",
            EventAttributes::TimerFired { .. } => "TimerFired",
            EventAttributes::TimerCanceled => "TimerCanceled",
            EventAttributes::SubWorkflowScheduled { .. } => "SubWorkflowScheduled",
            EventAttributes::SubWorkflowCompleted { .. } => "SubWorkflowCompleted",
            EventAttributes::SubWorkflowFailed { .. } => "SubWorkflowFailed",
            EventAttributes::SignalReceived { .. } => "SignalReceived",
            EventAttributes::SideEffectResult { .. } => "SideEffectResult",
        }
    }

    /// Terminal events end the execution; nothing may be appended after one.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.attributes,
            EventAttributes::WorkflowExecutionFinished { .. }
        )
    }
}

// ============================================================================
// Commands
// ============================================================================

/// Operation requested by a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandKind {
    ScheduleActivity {
        name: String,
        input: String,
    },
    ScheduleTimer {
        fire_at_ms: u64,
    },
    /// Cancels an open timer; `Command::id` is the timer's schedule id.
    CancelTimer,
    ScheduleSubWorkflow {
        name: String,
        instance_id: String,
        input: String,
    },
    /// Message-only: delivers a cancel signal to the child instance and
    /// records nothing locally. `Command::id` is the sub-workflow schedule id.
    CancelSubWorkflow {
        instance_id: String,
    },
    /// Result computed exactly once; replay returns the recorded value.
    SideEffect {
        result: String,
    },
    CompleteWorkflow {
        result: Option<String>,
        error: Option<WorkflowError>,
    },
}

/// A proposal emitted by workflow code during one task execution.
///
/// For scheduling commands `id` comes from the per-execution monotonic
/// counter (starting at 0) and becomes the `schedule_event_id` of the
/// produced event; cancel commands reuse the id of the schedule they target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub id: u64,
    pub kind: CommandKind,
}

impl CommandKind {
    /// Whether this command only produces a cross-instance message.
    /// Message-only commands are dropped during replay instead of being
    /// paired against history.
    pub(crate) fn is_message_only(&self) -> bool {
        matches!(self, CommandKind::CancelSubWorkflow { .. })
    }
}

/// Kind of an open schedule, kept for pairing completions against it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ScheduleKind {
    Activity,
    Timer,
    SubWorkflow,
    SideEffect,
}

/// Result delivered to a durable future once its schedule completes.
#[derive(Debug, Clone)]
pub(crate) enum CompletionResult {
    ActivityOk(String),
    ActivityErr(WorkflowError),
    TimerFired,
    TimerCanceled,
    SubWorkflowOk(String),
    SubWorkflowErr(WorkflowError),
    SideEffect(String),
}

// ============================================================================
// Workflow state (per-instance, owned by one executor)
// ============================================================================

pub(crate) type SharedState = Arc<Mutex<WorkflowState>>;

/// Mutable per-instance state driven by the executor and read by durable
/// futures. Single-threaded by construction: the executor polls the root
/// future on one thread and no waker ever fires.
pub(crate) struct WorkflowState {
    pub(crate) instance: WorkflowInstance,
    pub(crate) workflow_name: String,
    pub(crate) replaying: bool,
    /// Logical clock: advances only via event timestamps during replay and
    /// via the task-started stamp at the replay/new frontier.
    pub(crate) clock_ms: u64,
    next_command_id: u64,
    /// Commands issued and not yet paired (replay) or translated (new).
    pub(crate) commands: VecDeque<Command>,
    /// Open schedules awaiting their paired completion.
    pub(crate) open_schedules: HashMap<u64, ScheduleKind>,
    /// Delivered completions, keyed by schedule event id.
    pub(crate) results: HashMap<u64, CompletionResult>,
    /// Signal payloads per channel, in `SignalReceived` history order.
    pub(crate) signal_arrivals: HashMap<String, Vec<String>>,
    /// Next consumption index handed to a newly created signal receiver.
    signal_next_index: HashMap<String, usize>,
    pub(crate) cancel_requested: bool,
}

impl WorkflowState {
    pub(crate) fn new(instance: WorkflowInstance) -> Self {
        Self {
            instance,
            workflow_name: String::new(),
            replaying: true,
            clock_ms: 0,
            next_command_id: 0,
            commands: VecDeque::new(),
            open_schedules: HashMap::new(),
            results: HashMap::new(),
            signal_arrivals: HashMap::new(),
            signal_next_index: HashMap::new(),
            cancel_requested: false,
        }
    }

    pub(crate) fn next_command_id(&mut self) -> u64 {
        let id = self.next_command_id;
        self.next_command_id += 1;
        id
    }

    pub(crate) fn issue(&mut self, command: Command) {
        self.commands.push_back(command);
    }

    pub(crate) fn advance_clock(&mut self, timestamp_ms: u64) {
        if timestamp_ms > self.clock_ms {
            self.clock_ms = timestamp_ms;
        }
    }

    pub(crate) fn deliver(&mut self, schedule_event_id: u64, result: CompletionResult) {
        self.open_schedules.remove(&schedule_event_id);
        self.results.insert(schedule_event_id, result);
    }

    pub(crate) fn deliver_signal(&mut self, name: String, input: String) {
        if name == CANCEL_SIGNAL {
            self.cancel_requested = true;
        }
        self.signal_arrivals.entry(name).or_default().push(input);
    }

    pub(crate) fn claim_signal_index(&mut self, name: &str) -> usize {
        let next = self.signal_next_index.entry(name.to_string()).or_insert(0);
        let index = *next;
        *next += 1;
        index
    }
}

// ============================================================================
// Workflow context
// ============================================================================

/// Deterministic context handed to workflow code.
///
/// Everything a workflow may observe flows through here: scheduling returns
/// durable futures, time comes from the logical clock, randomness from
/// recorded side effects. The context is cheap to clone; clones share the
/// same underlying state.
#[derive(Clone)]
pub struct WorkflowContext {
    pub(crate) state: SharedState,
}

impl WorkflowContext {
    pub(crate) fn new(instance: WorkflowInstance) -> Self {
        Self {
            state: Arc::new(Mutex::new(WorkflowState::new(instance))),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, WorkflowState> {
        // Single-threaded per task; poisoning here means the executor
        // panicked mid-poll and the instance must be replayed fresh anyway.
        self.state.lock().expect("workflow state poisoned")
    }

    /// Schedule an activity by name. The input is encoded with the JSON
    /// codec; the returned future resolves with the activity result payload.
    pub fn schedule_activity<I: Serialize>(&self, name: &str, input: I) -> ActivityFuture {
        let mut state = self.lock();
        let id = state.next_command_id();
        match Json::encode(&input) {
            Ok(encoded) => {
                state.issue(Command {
                    id,
                    kind: CommandKind::ScheduleActivity {
                        name: name.to_string(),
                        input: encoded,
                    },
                });
                state.open_schedules.insert(id, ScheduleKind::Activity);
            }
            Err(e) => {
                // Encoding is deterministic, so failing the future without a
                // command replays identically.
                state.results.insert(
                    id,
                    CompletionResult::ActivityErr(WorkflowError::serialization(e)),
                );
            }
        }
        ActivityFuture::new(id, self.state.clone())
    }

    /// Schedule a timer that fires after `delay` of logical time.
    pub fn schedule_timer(&self, delay: std::time::Duration) -> TimerFuture {
        let mut state = self.lock();
        let id = state.next_command_id();
        let fire_at_ms = state.clock_ms.saturating_add(delay.as_millis() as u64);
        state.issue(Command {
            id,
            kind: CommandKind::ScheduleTimer { fire_at_ms },
        });
        state.open_schedules.insert(id, ScheduleKind::Timer);
        TimerFuture::new(id, self.state.clone())
    }

    /// Cancel a timer that has not fired yet. No-op once the timer has a
    /// recorded outcome.
    pub fn cancel_timer(&self, timer: &TimerFuture) {
        let mut state = self.lock();
        let id = timer.schedule_id();
        if state.results.contains_key(&id) || !state.open_schedules.contains_key(&id) {
            return;
        }
        state.open_schedules.remove(&id);
        state.issue(Command {
            id,
            kind: CommandKind::CancelTimer,
        });
    }

    /// Schedule a sub-workflow with a derived child instance id.
    pub fn schedule_sub_workflow<I: Serialize>(&self, name: &str, input: I) -> SubWorkflowFuture {
        let child_id = {
            let state = self.lock();
            // Derived from the upcoming command id so replay names the same child.
            format!("{}:{}", state.instance.instance_id, state.next_command_id)
        };
        self.schedule_sub_workflow_with_id(name, &child_id, input)
    }

    /// Schedule a sub-workflow under an explicit child instance id.
    pub fn schedule_sub_workflow_with_id<I: Serialize>(
        &self,
        name: &str,
        instance_id: &str,
        input: I,
    ) -> SubWorkflowFuture {
        let mut state = self.lock();
        let id = state.next_command_id();
        match Json::encode(&input) {
            Ok(encoded) => {
                state.issue(Command {
                    id,
                    kind: CommandKind::ScheduleSubWorkflow {
                        name: name.to_string(),
                        instance_id: instance_id.to_string(),
                        input: encoded,
                    },
                });
                state.open_schedules.insert(id, ScheduleKind::SubWorkflow);
            }
            Err(e) => {
                state.results.insert(
                    id,
                    CompletionResult::SubWorkflowErr(WorkflowError::serialization(e)),
                );
            }
        }
        SubWorkflowFuture::new(id, instance_id.to_string(), self.state.clone())
    }

    /// Request cancellation of a running sub-workflow. Delivered as a cancel
    /// signal to the child, atomically with this task's commit.
    pub fn cancel_sub_workflow(&self, sub_workflow: &SubWorkflowFuture) {
        let mut state = self.lock();
        let id = sub_workflow.schedule_id();
        if state.results.contains_key(&id) {
            return;
        }
        let kind = CommandKind::CancelSubWorkflow {
            instance_id: sub_workflow.child_instance_id().to_string(),
        };
        if kind.is_message_only() && state.replaying {
            // Already delivered by the original execution; message-only
            // commands are not re-sent on replay.
            return;
        }
        state.issue(Command { id, kind });
    }

    /// Named signal channel. Receivers consume arrivals in the order their
    /// `SignalReceived` events appear in history.
    pub fn signal_channel(&self, name: &str) -> SignalChannel {
        SignalChannel::new(name.to_string(), self.state.clone())
    }

    /// Record a nondeterministic value once; replay returns the recorded
    /// value without re-running the closure.
    pub fn side_effect<F>(&self, f: F) -> SideEffectFuture
    where
        F: FnOnce() -> String,
    {
        let mut state = self.lock();
        let id = state.next_command_id();
        if state.replaying {
            // Value arrives when the SideEffectResult event is replayed.
            state.issue(Command {
                id,
                kind: CommandKind::SideEffect {
                    result: String::new(),
                },
            });
            state.open_schedules.insert(id, ScheduleKind::SideEffect);
        } else {
            let value = f();
            state.issue(Command {
                id,
                kind: CommandKind::SideEffect {
                    result: value.clone(),
                },
            });
            state
                .results
                .insert(id, CompletionResult::SideEffect(value));
        }
        SideEffectFuture::new(id, self.state.clone())
    }

    /// Replay-stable UUID.
    pub fn new_uuid(&self) -> SideEffectFuture {
        self.side_effect(|| uuid::Uuid::new_v4().to_string())
    }

    /// Logical time in milliseconds since the Unix epoch. Monotonic per
    /// instance; never reads the wall clock during replay.
    pub fn now_ms(&self) -> u64 {
        self.lock().clock_ms
    }

    /// True while the executor is replaying persisted history.
    pub fn is_replaying(&self) -> bool {
        self.lock().replaying
    }

    /// True once a cancellation request has been observed in history.
    pub fn is_cancel_requested(&self) -> bool {
        self.lock().cancel_requested
    }

    /// Future that resolves when a cancellation request arrives.
    pub fn cancel_requested(&self) -> SignalFuture {
        self.signal_channel(CANCEL_SIGNAL).recv()
    }

    /// Race two durable futures; a losing timer is cancelled.
    pub fn select2<A: DurableFuture, B: DurableFuture>(&self, a: A, b: B) -> Select2Future<A, B> {
        Select2Future::new(self.clone(), a, b)
    }

    /// Race three durable futures.
    pub fn select3<A: DurableFuture, B: DurableFuture, C: DurableFuture>(
        &self,
        a: A,
        b: B,
        c: C,
    ) -> Select3Future<A, B, C> {
        Select3Future::new(self.clone(), a, b, c)
    }

    /// Await all futures, results in scheduling order.
    pub fn join<F: DurableFuture>(&self, futures: Vec<F>) -> JoinFuture<F> {
        JoinFuture::new(futures)
    }

    pub fn instance_id(&self) -> String {
        self.lock().instance.instance_id.clone()
    }

    pub fn execution_id(&self) -> String {
        self.lock().instance.execution_id.clone()
    }

    pub fn workflow_name(&self) -> String {
        self.lock().workflow_name.clone()
    }

    /// INFO trace with instance correlation; suppressed during replay.
    pub fn trace_info(&self, message: impl Into<String>) {
        let state = self.lock();
        if state.replaying {
            return;
        }
        tracing::info!(
            target: "flywheel::workflow",
            instance_id = %state.instance.instance_id,
            execution_id = %state.instance.execution_id,
            workflow_name = %state.workflow_name,
            "{}",
            message.into()
        );
    }

    /// WARN trace with instance correlation; suppressed during replay.
    pub fn trace_warn(&self, message: impl Into<String>) {
        let state = self.lock();
        if state.replaying {
            return;
        }
        tracing::warn!(
            target: "flywheel::workflow",
            instance_id = %state.instance.instance_id,
            execution_id = %state.instance.execution_id,
            workflow_name = %state.workflow_name,
            "{}",
            message.into()
        );
    }

    /// ERROR trace with instance correlation; suppressed during replay.
    pub fn trace_error(&self, message: impl Into<String>) {
        let state = self.lock();
        if state.replaying {
            return;
        }
        tracing::error!(
            target: "flywheel::workflow",
            instance_id = %state.instance.instance_id,
            execution_id = %state.instance.execution_id,
            workflow_name = %state.workflow_name,
            "{}",
            message.into()
        );
    }
}

// ============================================================================
// Activity context
// ============================================================================

/// Context handed to activity handlers.
///
/// Activities are leaf work: they may perform real I/O and block, but cannot
/// schedule further work. The context carries correlation metadata and a
/// cooperative cancellation token triggered on runtime shutdown.
#[derive(Clone)]
pub struct ActivityContext {
    instance: WorkflowInstance,
    activity_name: String,
    schedule_event_id: u64,
    worker_id: String,
    cancellation: tokio_util::sync::CancellationToken,
}

impl ActivityContext {
    pub(crate) fn new(
        instance: WorkflowInstance,
        activity_name: String,
        schedule_event_id: u64,
        worker_id: String,
        cancellation: tokio_util::sync::CancellationToken,
    ) -> Self {
        Self {
            instance,
            activity_name,
            schedule_event_id,
            worker_id,
            cancellation,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance.instance_id
    }

    pub fn execution_id(&self) -> &str {
        &self.instance.execution_id
    }

    pub fn activity_name(&self) -> &str {
        &self.activity_name
    }

    pub fn schedule_event_id(&self) -> u64 {
        self.schedule_event_id
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }

    pub fn cancellation_token(&self) -> tokio_util::sync::CancellationToken {
        self.cancellation.clone()
    }

    pub fn trace_info(&self, message: impl Into<String>) {
        tracing::info!(
            target: "flywheel::activity",
            instance_id = %self.instance.instance_id,
            execution_id = %self.instance.execution_id,
            activity_name = %self.activity_name,
            schedule_event_id = %self.schedule_event_id,
            worker_id = %self.worker_id,
            "{}",
            message.into()
        );
    }

    pub fn trace_warn(&self, message: impl Into<String>) {
        tracing::warn!(
            target: "flywheel::activity",
            instance_id = %self.instance.instance_id,
            execution_id = %self.instance.execution_id,
            activity_name = %self.activity_name,
            schedule_event_id = %self.schedule_event_id,
            worker_id = %self.worker_id,
            "{}",
            message.into()
        );
    }

    pub fn trace_error(&self, message: impl Into<String>) {
        tracing::error!(
            target: "flywheel::activity",
            instance_id = %self.instance.instance_id,
            execution_id = %self.instance.execution_id,
            activity_name = %self.activity_name,
            schedule_event_id = %self.schedule_event_id,
            worker_id = %self.worker_id,
            "{}",
            message.into()
        );
    }
}

impl std::fmt::Debug for ActivityContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivityContext")
            .field("instance", &self.instance)
            .field("activity_name", &self.activity_name)
            .field("schedule_event_id", &self.schedule_event_id)
            .field("worker_id", &self.worker_id)
            .finish()
    }
}

// ============================================================================
// Select results
// ============================================================================

/// Outcome of [`WorkflowContext::select2`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Either2<A, B> {
    First(A),
    Second(B),
}

impl<A, B> Either2<A, B> {
    pub fn is_first(&self) -> bool {
        matches!(self, Either2::First(_))
    }

    pub fn is_second(&self) -> bool {
        matches!(self, Either2::Second(_))
    }
}

/// Outcome of [`WorkflowContext::select3`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Either3<A, B, C> {
    First(A),
    Second(B),
    Third(C),
}

#[cfg(test)]
mod model_tests {
    use super::*;

    #[test]
    fn event_json_is_snake_case_and_type_tagged() {
        let event = HistoryEvent::pending(
            Some(0),
            EventAttributes::ActivityScheduled {
                name: "add".to_string(),
                input: "[2,3]".to_string(),
            },
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "ActivityScheduled");
        assert_eq!(json["schedule_event_id"], 0);
        assert_eq!(json["name"], "add");
        assert!(json.get("visible_at_ms").is_none());
    }

    #[test]
    fn event_json_round_trips() {
        let event = HistoryEvent::future(
            Some(3),
            EventAttributes::TimerFired { fire_at_ms: 1234 },
            1234,
        )
        .with_sequence(7);
        let json = serde_json::to_string(&event).unwrap();
        let back: HistoryEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn codec_round_trips_supported_types() {
        let n: i64 = Json::decode(&Json::encode(&42i64).unwrap()).unwrap();
        assert_eq!(n, 42);
        let tup: (i32, i32) = Json::decode(&Json::encode(&(2, 3)).unwrap()).unwrap();
        assert_eq!(tup, (2, 3));
        // Strings stay raw, not double-encoded.
        let raw = Json::encode(&"hi".to_string()).unwrap();
        assert_eq!(raw, "hi");
        let s: String = Json::decode(&raw).unwrap();
        assert_eq!(s, "hi");
    }

    #[test]
    fn command_ids_are_client_assigned_starting_at_zero() {
        let ctx = WorkflowContext::new(WorkflowInstance::new("i", "e"));
        ctx.state.lock().unwrap().replaying = false;
        let a = ctx.schedule_activity("add", (2, 3));
        let t = ctx.schedule_timer(std::time::Duration::from_millis(5));
        assert_eq!(a.schedule_id(), 0);
        assert_eq!(t.schedule_id(), 1);
        let state = ctx.state.lock().unwrap();
        assert_eq!(state.commands.len(), 2);
        assert_eq!(state.commands[0].id, 0);
        assert_eq!(state.commands[1].id, 1);
    }
}

//! Deterministic workflow executor.
//!
//! One executor owns one workflow instance. `execute` replays the committed
//! history through the coroutine runtime, then processes the newly delivered
//! events; `execute_continuation` skips replay for a warm executor. The
//! output of a pass is a [`TaskEffects`]: the history delta plus every
//! cross-instance side effect, handed to the backend for one atomic commit.
//!
//! Replay and first execution run the exact same user code. While replaying,
//! commands issued by user code are paired against the `*Scheduled` events
//! already in history; any mismatch in order, type or key attributes is
//! nondeterminism and fails the task without a checkpoint.

use std::sync::Arc;
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

use futures::future::BoxFuture;
use tracing::debug;

use crate::providers::{WorkflowEvent, WorkflowTask};
use crate::runtime::registry::WorkflowRegistry;
use crate::{
    Command, CommandKind, CompletionResult, EventAttributes, HistoryEvent, ParentLink,
    ScheduleKind, WorkflowContext, WorkflowError, WorkflowInstance,
};

/// Everything a completed workflow task wants persisted, in one atomic
/// commit.
#[derive(Debug, Default)]
pub struct TaskEffects {
    /// History delta, in commit order: consumed pending events, the
    /// task-started stamp, scheduled events, the task-finished stamp, then
    /// terminal events.
    pub new_events: Vec<HistoryEvent>,
    /// Cross-instance messages (sub-workflow starts, parent completions,
    /// cancel signals).
    pub workflow_events: Vec<WorkflowEvent>,
    /// `ActivityScheduled` events to enqueue as activity tasks.
    pub activity_events: Vec<HistoryEvent>,
    /// Future `TimerFired` events addressed at this instance.
    pub timers_to_schedule: Vec<WorkflowEvent>,
    /// Schedule ids of future events to drop.
    pub timers_to_cancel: Vec<u64>,
}

impl TaskEffects {
    pub fn is_empty(&self) -> bool {
        self.new_events.is_empty()
            && self.workflow_events.is_empty()
            && self.activity_events.is_empty()
            && self.timers_to_schedule.is_empty()
            && self.timers_to_cancel.is_empty()
    }
}

/// Failures that are fatal to the task (never checkpointed). The lease
/// expires and the task is re-delivered.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ExecutorError {
    #[error("nondeterminism detected: {0}")]
    NonDeterminism(String),
    #[error("corrupted history: {0}")]
    CorruptedHistory(String),
    #[error("continuation mismatch: executor at {executor}, task at {task}")]
    ContinuationMismatch { executor: u64, task: u64 },
}

fn noop_waker() -> Waker {
    fn clone(_: *const ()) -> RawWaker {
        RawWaker::new(std::ptr::null(), &VTABLE)
    }
    fn wake(_: *const ()) {}
    fn wake_by_ref(_: *const ()) {}
    fn drop(_: *const ()) {}

    static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, wake, wake_by_ref, drop);
    // SAFETY: the vtable functions are all no-ops over a null pointer.
    unsafe { Waker::from_raw(RawWaker::new(std::ptr::null(), &VTABLE)) }
}

/// Replaying executor for a single `(instance, execution)`.
pub struct WorkflowExecutor {
    workflows: Arc<WorkflowRegistry>,
    instance: WorkflowInstance,
    ctx: WorkflowContext,
    /// Root coroutine of the workflow; polled only by this executor, on one
    /// thread, with a waker that never wakes.
    root: Option<BoxFuture<'static, Result<String, String>>>,
    /// Failure to surface as the workflow result without running user code
    /// (unregistered workflow name).
    pending_failure: Option<WorkflowError>,
    /// A `CompleteWorkflow` command has been issued for the root result.
    completion_issued: bool,
    finished: bool,
    /// The executor's state matches the committed store (set by the caller
    /// after a successful commit). Only warm executors take continuations.
    warm: bool,
    last_sequence_id: u64,
}

impl WorkflowExecutor {
    pub fn new(workflows: Arc<WorkflowRegistry>, instance: WorkflowInstance) -> Self {
        let ctx = WorkflowContext::new(instance.clone());
        Self {
            workflows,
            instance,
            ctx,
            root: None,
            pending_failure: None,
            completion_issued: false,
            finished: false,
            warm: false,
            last_sequence_id: 0,
        }
    }

    pub fn instance(&self) -> &WorkflowInstance {
        &self.instance
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn last_sequence_id(&self) -> u64 {
        self.last_sequence_id
    }

    /// A warm executor can take a continuation task only when it sits exactly
    /// at the task's resume point.
    pub fn continuation_eligible(&self, task: &WorkflowTask) -> bool {
        !self.finished && self.last_sequence_id == task.last_sequence_id
    }

    /// Record the committed watermark after a successful completion.
    /// Sequence ids are gapless, so the new watermark is the old one plus the
    /// number of committed events.
    pub fn note_committed(&mut self, committed_events: usize) {
        self.last_sequence_id += committed_events as u64;
    }

    /// The executor's in-memory state now matches the store; continuation
    /// tasks may build on it.
    pub fn mark_warm(&mut self) {
        self.warm = true;
    }

    pub fn is_warm(&self) -> bool {
        self.warm
    }

    fn reset(&mut self) {
        self.ctx = WorkflowContext::new(self.instance.clone());
        self.root = None;
        self.pending_failure = None;
        self.completion_issued = false;
        self.finished = false;
        self.warm = false;
        self.last_sequence_id = 0;
    }

    /// Run a full task: replay `task.history`, then process `task.new_events`
    /// and translate the resulting commands.
    pub fn execute(&mut self, task: &WorkflowTask) -> Result<TaskEffects, ExecutorError> {
        self.reset();
        debug!(
            instance_id = %self.instance.instance_id,
            execution_id = %self.instance.execution_id,
            history_len = task.history.len(),
            new_events = task.new_events.len(),
            "executing workflow task"
        );

        for event in &task.history {
            self.apply_event(event, true)?;
        }
        self.last_sequence_id = task.last_sequence_id;
        self.ctx.state.lock().expect("workflow state poisoned").replaying = false;

        if self.finished {
            // Terminal history: replay reconstructs state and nothing else.
            return Ok(TaskEffects::default());
        }
        self.run_new_phase(task)
    }

    /// Run a continuation task on a warm executor: only the new events are
    /// processed. Callers must check [`Self::continuation_eligible`] first.
    pub fn execute_continuation(&mut self, task: &WorkflowTask) -> Result<TaskEffects, ExecutorError> {
        if task.last_sequence_id != self.last_sequence_id {
            return Err(ExecutorError::ContinuationMismatch {
                executor: self.last_sequence_id,
                task: task.last_sequence_id,
            });
        }
        debug!(
            instance_id = %self.instance.instance_id,
            execution_id = %self.instance.execution_id,
            new_events = task.new_events.len(),
            "executing continuation task"
        );
        if self.finished {
            return Ok(TaskEffects::default());
        }
        self.ctx
            .state
            .lock()
            .expect("workflow state poisoned")
            .replaying = false;
        self.run_new_phase(task)
    }

    fn run_new_phase(&mut self, task: &WorkflowTask) -> Result<TaskEffects, ExecutorError> {
        if task.new_events.is_empty() {
            return Ok(TaskEffects::default());
        }

        let mut delta: Vec<HistoryEvent> = Vec::with_capacity(task.new_events.len() + 3);
        for event in &task.new_events {
            delta.push(event.clone());
            self.apply_event(event, false)?;
        }

        // Frontier between replay and new execution: the task-started stamp
        // moves the logical clock to the backend's notion of now.
        let started = HistoryEvent::pending(None, EventAttributes::WorkflowTaskStarted);
        self.ctx
            .state
            .lock()
            .expect("workflow state poisoned")
            .advance_clock(started.timestamp_ms);
        delta.push(started);
        self.run_scheduler();

        self.translate_commands(delta)
    }

    /// Poll the root coroutine once. Between polls execution is strictly
    /// sequential; durable futures resolve purely from delivered state, so a
    /// single poll drains every runnable continuation.
    fn run_scheduler(&mut self) {
        if self.completion_issued {
            return;
        }
        if let Some(failure) = self.pending_failure.take() {
            self.issue_completion(Err(failure));
            return;
        }
        let Some(root) = self.root.as_mut() else {
            return;
        };
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        if let Poll::Ready(output) = root.as_mut().poll(&mut cx) {
            self.root = None;
            let output = output.map_err(|message| {
                if let Some(rest) = message.strip_prefix("serialization: ") {
                    WorkflowError::serialization(rest)
                } else {
                    WorkflowError::application(message)
                }
            });
            self.issue_completion(output);
        }
    }

    fn issue_completion(&mut self, output: Result<String, WorkflowError>) {
        self.completion_issued = true;
        let mut state = self.ctx.state.lock().expect("workflow state poisoned");
        let id = state.next_command_id();
        let (result, error) = match output {
            Ok(result) => (Some(result), None),
            Err(error) => (None, Some(error)),
        };
        state.issue(Command {
            id,
            kind: CommandKind::CompleteWorkflow { result, error },
        });
    }

    /// Apply one event to workflow state. `replay` marks events read from
    /// committed history, which must pair against the commands user code
    /// re-issues.
    fn apply_event(&mut self, event: &HistoryEvent, replay: bool) -> Result<(), ExecutorError> {
        {
            let mut state = self.ctx.state.lock().expect("workflow state poisoned");
            state.advance_clock(event.timestamp_ms);
        }

        match &event.attributes {
            EventAttributes::WorkflowExecutionStarted { name, input, .. } => {
                {
                    let mut state = self.ctx.state.lock().expect("workflow state poisoned");
                    state.workflow_name = name.clone();
                }
                match self.workflows.get(name) {
                    Some(handler) => {
                        self.root = Some(handler.invoke(self.ctx.clone(), input.clone()));
                    }
                    None => {
                        self.pending_failure = Some(WorkflowError::unregistered(name));
                    }
                }
            }

            EventAttributes::WorkflowTaskStarted => {
                self.run_scheduler();
            }

            EventAttributes::WorkflowTaskFinished => {
                if replay {
                    // Every command of the finished task must have been paired
                    // by now, apart from the terminal completion which pairs
                    // against the following WorkflowExecutionFinished.
                    let state = self.ctx.state.lock().expect("workflow state poisoned");
                    if let Some(cmd) = state
                        .commands
                        .iter()
                        .find(|c| !matches!(c.kind, CommandKind::CompleteWorkflow { .. }))
                    {
                        return Err(ExecutorError::NonDeterminism(format!(
                            "command {:?} has no matching event in the finished task",
                            cmd.kind
                        )));
                    }
                }
            }

            EventAttributes::ActivityScheduled { .. }
            | EventAttributes::TimerScheduled { .. }
            | EventAttributes::TimerCanceled
            | EventAttributes::SubWorkflowScheduled { .. }
            | EventAttributes::SideEffectResult { .. } => {
                self.pair_schedule(event, replay)?;
                if let EventAttributes::SideEffectResult { result } = &event.attributes {
                    // The recorded value resolves the await at the same point
                    // the original execution resolved it, so poll now.
                    let sid = schedule_id(event)?;
                    self.ctx
                        .state
                        .lock()
                        .expect("workflow state poisoned")
                        .deliver(sid, CompletionResult::SideEffect(result.clone()));
                    self.run_scheduler();
                }
                if let EventAttributes::TimerCanceled = &event.attributes {
                    let sid = schedule_id(event)?;
                    self.ctx
                        .state
                        .lock()
                        .expect("workflow state poisoned")
                        .deliver(sid, CompletionResult::TimerCanceled);
                }
            }

            EventAttributes::ActivityCompleted { result } => {
                self.deliver_completion(
                    event,
                    ScheduleKind::Activity,
                    CompletionResult::ActivityOk(result.clone()),
                )?;
            }
            EventAttributes::ActivityFailed { error } => {
                self.deliver_completion(
                    event,
                    ScheduleKind::Activity,
                    CompletionResult::ActivityErr(error.clone()),
                )?;
            }
            EventAttributes::TimerFired { .. } => {
                self.deliver_completion(event, ScheduleKind::Timer, CompletionResult::TimerFired)?;
            }
            EventAttributes::SubWorkflowCompleted { result } => {
                self.deliver_completion(
                    event,
                    ScheduleKind::SubWorkflow,
                    CompletionResult::SubWorkflowOk(result.clone()),
                )?;
            }
            EventAttributes::SubWorkflowFailed { error } => {
                self.deliver_completion(
                    event,
                    ScheduleKind::SubWorkflow,
                    CompletionResult::SubWorkflowErr(error.clone()),
                )?;
            }

            EventAttributes::SignalReceived { name, input } => {
                self.ctx
                    .state
                    .lock()
                    .expect("workflow state poisoned")
                    .deliver_signal(name.clone(), input.clone());
            }

            EventAttributes::WorkflowExecutionFinished { .. } => {
                if replay {
                    let mut state = self.ctx.state.lock().expect("workflow state poisoned");
                    match state.commands.pop_front() {
                        Some(Command {
                            kind: CommandKind::CompleteWorkflow { .. },
                            ..
                        }) => {}
                        Some(cmd) => {
                            return Err(ExecutorError::NonDeterminism(format!(
                                "history finished the workflow but the next command is {:?}",
                                cmd.kind
                            )));
                        }
                        None => {
                            return Err(ExecutorError::NonDeterminism(
                                "history finished the workflow but user code did not complete"
                                    .to_string(),
                            ));
                        }
                    }
                }
                self.finished = true;
            }
        }
        Ok(())
    }

    /// Pair a schedule-class history event with the oldest pending command.
    fn pair_schedule(&mut self, event: &HistoryEvent, replay: bool) -> Result<(), ExecutorError> {
        if !replay {
            return Err(ExecutorError::CorruptedHistory(format!(
                "{} delivered as a pending event",
                event.event_type()
            )));
        }
        let sid = schedule_id(event)?;
        let mut state = self.ctx.state.lock().expect("workflow state poisoned");
        let cmd = state.commands.pop_front().ok_or_else(|| {
            ExecutorError::NonDeterminism(format!(
                "history contains {} #{sid} but user code issued no command",
                event.event_type()
            ))
        })?;
        if cmd.id != sid {
            return Err(ExecutorError::NonDeterminism(format!(
                "command id {} does not match {} #{sid}",
                cmd.id,
                event.event_type()
            )));
        }
        match (&cmd.kind, &event.attributes) {
            (
                CommandKind::ScheduleActivity { name, input },
                EventAttributes::ActivityScheduled {
                    name: hist_name,
                    input: hist_input,
                },
            ) if name == hist_name && input == hist_input => Ok(()),
            (
                CommandKind::ScheduleTimer { fire_at_ms },
                EventAttributes::TimerScheduled {
                    fire_at_ms: hist_at,
                },
            ) if fire_at_ms == hist_at => Ok(()),
            (CommandKind::CancelTimer, EventAttributes::TimerCanceled) => Ok(()),
            (
                CommandKind::ScheduleSubWorkflow {
                    name,
                    instance_id,
                    input,
                },
                EventAttributes::SubWorkflowScheduled {
                    name: hist_name,
                    instance_id: hist_instance,
                    input: hist_input,
                },
            ) if name == hist_name && instance_id == hist_instance && input == hist_input => Ok(()),
            (CommandKind::SideEffect { .. }, EventAttributes::SideEffectResult { .. }) => Ok(()),
            _ => Err(ExecutorError::NonDeterminism(format!(
                "command {:?} does not match history event {} #{sid}",
                cmd.kind,
                event.event_type()
            ))),
        }
    }

    /// Deliver a paired completion, validating it against an open schedule of
    /// the matching kind.
    fn deliver_completion(
        &mut self,
        event: &HistoryEvent,
        expected: ScheduleKind,
        result: CompletionResult,
    ) -> Result<(), ExecutorError> {
        let sid = schedule_id(event)?;
        let mut state = self.ctx.state.lock().expect("workflow state poisoned");
        match state.open_schedules.get(&sid).copied() {
            Some(kind) if kind == expected => {
                state.deliver(sid, result);
                Ok(())
            }
            Some(kind) => Err(ExecutorError::NonDeterminism(format!(
                "{} #{sid} completes a {kind:?} schedule",
                event.event_type()
            ))),
            None if state.results.contains_key(&sid) => Err(ExecutorError::NonDeterminism(
                format!("duplicate completion for schedule #{sid}"),
            )),
            None => Err(ExecutorError::NonDeterminism(format!(
                "{} #{sid} has no open schedule",
                event.event_type()
            ))),
        }
    }

    /// Convert the buffered commands into history events and cross-instance
    /// messages. Scheduled events land between the task markers; terminal
    /// events after them.
    fn translate_commands(&mut self, mut delta: Vec<HistoryEvent>) -> Result<TaskEffects, ExecutorError> {
        let commands: Vec<Command> = {
            let mut state = self.ctx.state.lock().expect("workflow state poisoned");
            state.commands.drain(..).collect()
        };

        let mut effects = TaskEffects::default();
        let mut scheduled: Vec<HistoryEvent> = Vec::new();
        let mut terminal: Vec<HistoryEvent> = Vec::new();

        for cmd in commands {
            match cmd.kind {
                CommandKind::ScheduleActivity { name, input } => {
                    let event = HistoryEvent::pending(
                        Some(cmd.id),
                        EventAttributes::ActivityScheduled { name, input },
                    );
                    effects.activity_events.push(event.clone());
                    scheduled.push(event);
                }

                CommandKind::ScheduleTimer { fire_at_ms } => {
                    scheduled.push(HistoryEvent::pending(
                        Some(cmd.id),
                        EventAttributes::TimerScheduled { fire_at_ms },
                    ));
                    effects.timers_to_schedule.push(WorkflowEvent {
                        instance: self.instance.clone(),
                        event: HistoryEvent::future(
                            Some(cmd.id),
                            EventAttributes::TimerFired { fire_at_ms },
                            fire_at_ms,
                        ),
                    });
                }

                CommandKind::CancelTimer => {
                    scheduled.push(HistoryEvent::pending(
                        Some(cmd.id),
                        EventAttributes::TimerCanceled,
                    ));
                    effects.timers_to_cancel.push(cmd.id);
                    self.ctx
                        .state
                        .lock()
                        .expect("workflow state poisoned")
                        .deliver(cmd.id, CompletionResult::TimerCanceled);
                }

                CommandKind::ScheduleSubWorkflow {
                    name,
                    instance_id,
                    input,
                } => {
                    scheduled.push(HistoryEvent::pending(
                        Some(cmd.id),
                        EventAttributes::SubWorkflowScheduled {
                            name: name.clone(),
                            instance_id: instance_id.clone(),
                            input: input.clone(),
                        },
                    ));
                    // Translation runs exactly once per new command, so a
                    // random execution id here never reaches replay.
                    let child = WorkflowInstance::sub_workflow(
                        instance_id,
                        uuid::Uuid::new_v4().to_string(),
                        ParentLink {
                            instance_id: self.instance.instance_id.clone(),
                            execution_id: self.instance.execution_id.clone(),
                            schedule_event_id: cmd.id,
                        },
                    );
                    effects.workflow_events.push(WorkflowEvent {
                        instance: child.clone(),
                        event: HistoryEvent::pending(
                            None,
                            EventAttributes::WorkflowExecutionStarted {
                                name,
                                input,
                                parent_instance_id: Some(self.instance.instance_id.clone()),
                                parent_execution_id: Some(self.instance.execution_id.clone()),
                                parent_schedule_event_id: Some(cmd.id),
                            },
                        ),
                    });
                }

                CommandKind::CancelSubWorkflow { instance_id } => {
                    effects.workflow_events.push(WorkflowEvent {
                        instance: WorkflowInstance::new(instance_id, ""),
                        event: HistoryEvent::pending(
                            None,
                            EventAttributes::SignalReceived {
                                name: crate::CANCEL_SIGNAL.to_string(),
                                input: String::new(),
                            },
                        ),
                    });
                }

                CommandKind::SideEffect { result } => {
                    scheduled.push(HistoryEvent::pending(
                        Some(cmd.id),
                        EventAttributes::SideEffectResult { result },
                    ));
                }

                CommandKind::CompleteWorkflow { result, error } => {
                    terminal.push(HistoryEvent::pending(
                        Some(cmd.id),
                        EventAttributes::WorkflowExecutionFinished {
                            result: result.clone(),
                            error: error.clone(),
                        },
                    ));
                    if let Some(parent) = &self.instance.parent {
                        let event = match (&result, &error) {
                            (_, Some(err)) => HistoryEvent::pending(
                                Some(parent.schedule_event_id),
                                EventAttributes::SubWorkflowFailed { error: err.clone() },
                            ),
                            (result, None) => HistoryEvent::pending(
                                Some(parent.schedule_event_id),
                                EventAttributes::SubWorkflowCompleted {
                                    result: result.clone().unwrap_or_default(),
                                },
                            ),
                        };
                        effects.workflow_events.push(WorkflowEvent {
                            instance: WorkflowInstance::new(
                                parent.instance_id.clone(),
                                parent.execution_id.clone(),
                            ),
                            event,
                        });
                    }
                    self.finished = true;
                }
            }
        }

        delta.extend(scheduled);
        delta.push(HistoryEvent::pending(
            None,
            EventAttributes::WorkflowTaskFinished,
        ));
        delta.extend(terminal);
        effects.new_events = delta;
        Ok(effects)
    }
}

/// Terminal effects for a task that exhausted its delivery attempts: the
/// workflow fails without running user code.
pub fn poison_task_effects(task: &WorkflowTask, error: WorkflowError) -> TaskEffects {
    let mut delta: Vec<HistoryEvent> = task.new_events.clone();
    delta.push(HistoryEvent::pending(
        None,
        EventAttributes::WorkflowTaskStarted,
    ));
    delta.push(HistoryEvent::pending(
        None,
        EventAttributes::WorkflowTaskFinished,
    ));
    delta.push(HistoryEvent::pending(
        None,
        EventAttributes::WorkflowExecutionFinished {
            result: None,
            error: Some(error.clone()),
        },
    ));

    let mut effects = TaskEffects {
        new_events: delta,
        ..TaskEffects::default()
    };
    if let Some(parent) = &task.instance.parent {
        effects.workflow_events.push(WorkflowEvent {
            instance: WorkflowInstance::new(parent.instance_id.clone(), parent.execution_id.clone()),
            event: HistoryEvent::pending(
                Some(parent.schedule_event_id),
                EventAttributes::SubWorkflowFailed { error },
            ),
        });
    }
    effects
}

fn schedule_id(event: &HistoryEvent) -> Result<u64, ExecutorError> {
    event.schedule_event_id.ok_or_else(|| {
        ExecutorError::CorruptedHistory(format!(
            "{} event without schedule_event_id",
            event.event_type()
        ))
    })
}

#[cfg(test)]
#[path = "executor_tests.rs"]
mod executor_tests;

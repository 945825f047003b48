//! Durable futures: the suspension points of workflow code.
//!
//! Every future here resolves by inspecting the shared workflow state that
//! the executor feeds from history. None of them registers a waker — the
//! executor polls the root future explicitly after delivering events, which
//! is what keeps execution single-threaded and replayable.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::{
    Command, CommandKind, CompletionResult, Either2, Either3, SharedState, WorkflowContext,
    WorkflowState,
};

mod sealed {
    pub trait Sealed {}
}

/// Common surface of all durable futures, used by the select/join
/// combinators. Not implementable outside the crate.
pub trait DurableFuture: Future + Unpin + sealed::Sealed {
    /// The schedule event id this future is bound to.
    fn schedule_id(&self) -> u64;

    /// Hook invoked on select losers. Timers cancel themselves so the
    /// instance does not wake up for a race that is already decided.
    #[doc(hidden)]
    fn on_lost_select(&self, _ctx: &WorkflowContext) {}
}

fn lock(state: &SharedState) -> std::sync::MutexGuard<'_, WorkflowState> {
    state.lock().expect("workflow state poisoned")
}

// ============================================================================
// Leaf futures
// ============================================================================

/// Result of a scheduled activity.
pub struct ActivityFuture {
    id: u64,
    state: SharedState,
}

impl ActivityFuture {
    pub(crate) fn new(id: u64, state: SharedState) -> Self {
        Self { id, state }
    }
}

impl sealed::Sealed for ActivityFuture {}

impl DurableFuture for ActivityFuture {
    fn schedule_id(&self) -> u64 {
        self.id
    }
}

impl Future for ActivityFuture {
    type Output = Result<String, String>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let state = lock(&self.state);
        match state.results.get(&self.id) {
            Some(CompletionResult::ActivityOk(v)) => Poll::Ready(Ok(v.clone())),
            Some(CompletionResult::ActivityErr(e)) => Poll::Ready(Err(e.message.clone())),
            Some(other) => Poll::Ready(Err(format!(
                "unexpected completion for activity {}: {other:?}",
                self.id
            ))),
            None => Poll::Pending,
        }
    }
}

/// Fires when the scheduled timer's logical time arrives. A cancelled timer
/// never resolves.
pub struct TimerFuture {
    id: u64,
    state: SharedState,
}

impl TimerFuture {
    pub(crate) fn new(id: u64, state: SharedState) -> Self {
        Self { id, state }
    }
}

impl sealed::Sealed for TimerFuture {}

impl DurableFuture for TimerFuture {
    fn schedule_id(&self) -> u64 {
        self.id
    }

    fn on_lost_select(&self, ctx: &WorkflowContext) {
        let mut state = ctx.state.lock().expect("workflow state poisoned");
        // Only cancel timers that are still open: a fired or already
        // cancelled timer has a recorded outcome.
        if state.results.contains_key(&self.id) || !state.open_schedules.contains_key(&self.id) {
            return;
        }
        state.open_schedules.remove(&self.id);
        state.issue(Command {
            id: self.id,
            kind: CommandKind::CancelTimer,
        });
    }
}

impl Future for TimerFuture {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let state = lock(&self.state);
        match state.results.get(&self.id) {
            Some(CompletionResult::TimerFired) => Poll::Ready(()),
            Some(CompletionResult::TimerCanceled) => Poll::Pending,
            Some(_) | None => Poll::Pending,
        }
    }
}

/// Result of a scheduled sub-workflow.
pub struct SubWorkflowFuture {
    id: u64,
    child_instance_id: String,
    state: SharedState,
}

impl SubWorkflowFuture {
    pub(crate) fn new(id: u64, child_instance_id: String, state: SharedState) -> Self {
        Self {
            id,
            child_instance_id,
            state,
        }
    }

    /// Instance id of the child this future is waiting on.
    pub fn child_instance_id(&self) -> &str {
        &self.child_instance_id
    }
}

impl sealed::Sealed for SubWorkflowFuture {}

impl DurableFuture for SubWorkflowFuture {
    fn schedule_id(&self) -> u64 {
        self.id
    }
}

impl Future for SubWorkflowFuture {
    type Output = Result<String, String>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let state = lock(&self.state);
        match state.results.get(&self.id) {
            Some(CompletionResult::SubWorkflowOk(v)) => Poll::Ready(Ok(v.clone())),
            Some(CompletionResult::SubWorkflowErr(e)) => Poll::Ready(Err(e.message.clone())),
            Some(other) => Poll::Ready(Err(format!(
                "unexpected completion for sub-workflow {}: {other:?}",
                self.id
            ))),
            None => Poll::Pending,
        }
    }
}

/// Value recorded by [`crate::WorkflowContext::side_effect`].
pub struct SideEffectFuture {
    id: u64,
    state: SharedState,
}

impl SideEffectFuture {
    pub(crate) fn new(id: u64, state: SharedState) -> Self {
        Self { id, state }
    }
}

impl sealed::Sealed for SideEffectFuture {}

impl DurableFuture for SideEffectFuture {
    fn schedule_id(&self) -> u64 {
        self.id
    }
}

impl Future for SideEffectFuture {
    type Output = String;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let state = lock(&self.state);
        match state.results.get(&self.id) {
            Some(CompletionResult::SideEffect(v)) => Poll::Ready(v.clone()),
            _ => Poll::Pending,
        }
    }
}

// ============================================================================
// Signals
// ============================================================================

/// Handle to a named signal channel of the running instance.
pub struct SignalChannel {
    name: String,
    state: SharedState,
}

impl SignalChannel {
    pub(crate) fn new(name: String, state: SharedState) -> Self {
        Self { name, state }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Receive the next signal payload. Each receiver claims its consumption
    /// index at creation, so delivery follows `SignalReceived` history order
    /// no matter how the receivers are awaited.
    pub fn recv(&self) -> SignalFuture {
        let index = lock(&self.state).claim_signal_index(&self.name);
        SignalFuture {
            name: self.name.clone(),
            index,
            state: self.state.clone(),
        }
    }
}

/// One pending receive on a signal channel.
pub struct SignalFuture {
    name: String,
    index: usize,
    state: SharedState,
}

impl sealed::Sealed for SignalFuture {}

impl DurableFuture for SignalFuture {
    fn schedule_id(&self) -> u64 {
        // Signals are matched by name, not by schedule id.
        u64::MAX
    }
}

impl Future for SignalFuture {
    type Output = String;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let state = lock(&self.state);
        match state
            .signal_arrivals
            .get(&self.name)
            .and_then(|a| a.get(self.index))
        {
            Some(payload) => Poll::Ready(payload.clone()),
            None => Poll::Pending,
        }
    }
}

// ============================================================================
// Aggregates
// ============================================================================

/// Race of two durable futures, biased toward the first.
pub struct Select2Future<A, B> {
    ctx: WorkflowContext,
    a: A,
    b: B,
}

impl<A: DurableFuture, B: DurableFuture> Select2Future<A, B> {
    pub(crate) fn new(ctx: WorkflowContext, a: A, b: B) -> Self {
        Self { ctx, a, b }
    }
}

impl<A: DurableFuture, B: DurableFuture> Future for Select2Future<A, B> {
    type Output = Either2<A::Output, B::Output>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Poll::Ready(out) = Pin::new(&mut this.a).poll(cx) {
            this.b.on_lost_select(&this.ctx);
            return Poll::Ready(Either2::First(out));
        }
        if let Poll::Ready(out) = Pin::new(&mut this.b).poll(cx) {
            this.a.on_lost_select(&this.ctx);
            return Poll::Ready(Either2::Second(out));
        }
        Poll::Pending
    }
}

/// Race of three durable futures, biased toward the lowest index.
pub struct Select3Future<A, B, C> {
    ctx: WorkflowContext,
    a: A,
    b: B,
    c: C,
}

impl<A: DurableFuture, B: DurableFuture, C: DurableFuture> Select3Future<A, B, C> {
    pub(crate) fn new(ctx: WorkflowContext, a: A, b: B, c: C) -> Self {
        Self { ctx, a, b, c }
    }
}

impl<A: DurableFuture, B: DurableFuture, C: DurableFuture> Future for Select3Future<A, B, C> {
    type Output = Either3<A::Output, B::Output, C::Output>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Poll::Ready(out) = Pin::new(&mut this.a).poll(cx) {
            this.b.on_lost_select(&this.ctx);
            this.c.on_lost_select(&this.ctx);
            return Poll::Ready(Either3::First(out));
        }
        if let Poll::Ready(out) = Pin::new(&mut this.b).poll(cx) {
            this.a.on_lost_select(&this.ctx);
            this.c.on_lost_select(&this.ctx);
            return Poll::Ready(Either3::Second(out));
        }
        if let Poll::Ready(out) = Pin::new(&mut this.c).poll(cx) {
            this.a.on_lost_select(&this.ctx);
            this.b.on_lost_select(&this.ctx);
            return Poll::Ready(Either3::Third(out));
        }
        Poll::Pending
    }
}

/// Awaits a homogeneous set of durable futures; outputs keep scheduling
/// order regardless of completion order.
pub struct JoinFuture<F: DurableFuture> {
    futures: Vec<F>,
    outputs: Vec<Option<F::Output>>,
}

impl<F: DurableFuture> JoinFuture<F> {
    pub(crate) fn new(futures: Vec<F>) -> Self {
        let outputs = futures.iter().map(|_| None).collect();
        Self { futures, outputs }
    }
}

impl<F: DurableFuture> Future for JoinFuture<F>
where
    F::Output: Unpin,
{
    type Output = Vec<F::Output>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        for (i, fut) in this.futures.iter_mut().enumerate() {
            if this.outputs[i].is_some() {
                continue;
            }
            if let Poll::Ready(out) = Pin::new(fut).poll(cx) {
                this.outputs[i] = Some(out);
            }
        }
        if this.outputs.iter().all(|o| o.is_some()) {
            let outputs = this
                .outputs
                .drain(..)
                .map(|o| o.expect("all join outputs resolved"))
                .collect();
            Poll::Ready(outputs)
        } else {
            Poll::Pending
        }
    }
}

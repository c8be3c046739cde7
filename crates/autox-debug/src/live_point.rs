//! Per-thread pause points.
//!
//! A [`LivePausePoint`] is created when a thread hits a registered debug point and lives until
//! the client steps out with `step-return`, the interpreter reports the flow finished, or the
//! connection goes away. While paused, the owning thread runs [`LivePausePoint::pause`], which
//! serves ad-hoc requests from the client until it is resumed.

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};

use autox_debug_proto::{Confirmation, DebugOp, ServerMessage, SourceLocation};
use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};

use crate::context::{snapshot_context, DebugHost, ExecutionContext};
use crate::error::{panic_message, DebugError, DebugResult};
use crate::outbox::Outbox;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PausePhase {
    Running,
    Paused,
    Released,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RequestKind {
    ExecuteSteps(String),
    Evaluate(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingRequest {
    pub correlation_id: String,
    pub kind: RequestKind,
}

#[derive(Clone, Copy, Debug)]
enum WakeReason {
    Resume(DebugOp),
    Release,
}

#[derive(Debug)]
struct PauseState {
    phase: PausePhase,
    pending_op: Option<DebugOp>,
    wake_reason: Option<WakeReason>,
    requests: VecDeque<PendingRequest>,
    in_flight: usize,
    released: bool,
    last_location: Option<SourceLocation>,
}

pub struct LivePausePoint {
    id: String,
    owner: ThreadId,
    thread_name: String,
    host: Arc<dyn DebugHost>,
    outbox: Arc<Outbox>,
    index: Weak<LivePoints>,
    state: Mutex<PauseState>,
    wake: Condvar,
}

impl std::fmt::Debug for LivePausePoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LivePausePoint")
            .field("id", &self.id)
            .field("thread_name", &self.thread_name)
            .finish_non_exhaustive()
    }
}

impl LivePausePoint {
    /// Create a point owned by the calling thread.
    pub(crate) fn new(
        id: String,
        host: Arc<dyn DebugHost>,
        outbox: Arc<Outbox>,
        index: Weak<LivePoints>,
    ) -> Self {
        let current = thread::current();
        let thread_name = current
            .name()
            .map(str::to_owned)
            .unwrap_or_else(|| format!("{:?}", current.id()));
        Self {
            id,
            owner: current.id(),
            thread_name,
            host,
            outbox,
            index,
            state: Mutex::new(PauseState {
                phase: PausePhase::Running,
                pending_op: None,
                wake_reason: None,
                requests: VecDeque::new(),
                in_flight: 0,
                released: false,
                last_location: None,
            }),
            wake: Condvar::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn thread_name(&self) -> &str {
        &self.thread_name
    }

    pub fn owner(&self) -> ThreadId {
        self.owner
    }

    pub fn phase(&self) -> PausePhase {
        self.state.lock().phase
    }

    pub fn last_location(&self) -> Option<SourceLocation> {
        self.state.lock().last_location.clone()
    }

    pub fn pending_op(&self) -> Option<DebugOp> {
        self.state.lock().pending_op
    }

    pub fn is_released(&self) -> bool {
        self.state.lock().released
    }

    /// Paused with requests queued or still being run.
    pub fn is_request_pending(&self) -> bool {
        let state = self.state.lock();
        state.phase == PausePhase::Paused && (!state.requests.is_empty() || state.in_flight > 0)
    }

    /// Park the calling (owning) thread at `location` until the client resumes it.
    pub(crate) fn pause(
        &self,
        location: &SourceLocation,
        ctx: &dyn ExecutionContext,
    ) -> DebugResult<()> {
        if thread::current().id() != self.owner {
            return Err(self.invalid_state("pause requested from a non-owner thread"));
        }

        let paused = ServerMessage::ExecutionPaused {
            point_id: self.id.clone(),
            thread_name: self.thread_name.clone(),
            location: location.clone(),
            call_stack: ctx.call_stack(),
            context: snapshot_context(ctx),
        };

        let mut state = self.state.lock();
        if state.released {
            // Released by the connection between the hit and the pause.
            tracing::debug!(
                target: "autox.debug",
                point_id = %self.id,
                location = %location,
                "point released before pausing; continuing"
            );
            return Ok(());
        }
        state.phase = PausePhase::Paused;
        state.pending_op = None;
        state.wake_reason = None;
        state.last_location = Some(location.clone());
        self.outbox.enqueue(paused);
        tracing::info!(
            target: "autox.debug",
            point_id = %self.id,
            thread = %self.thread_name,
            location = %location,
            "execution paused"
        );

        let reason = loop {
            if !state.requests.is_empty() {
                let batch: Vec<PendingRequest> = state.requests.drain(..).collect();
                state.in_flight = batch.len();
                MutexGuard::unlocked(&mut state, || {
                    for request in batch {
                        let result = self.run_request(request, ctx);
                        self.outbox.enqueue(result);
                    }
                });
                state.in_flight = 0;
                continue;
            }
            if let Some(reason) = state.wake_reason.take() {
                break reason;
            }
            self.wake.wait(&mut state);
        };
        drop(state);

        // A server-side release already reported itself.
        if let WakeReason::Resume(op) = reason {
            self.outbox.enqueue(ServerMessage::ExecutionReleased {
                point_id: self.id.clone(),
                op: Some(op),
            });
            tracing::info!(
                target: "autox.debug",
                point_id = %self.id,
                op = %op,
                "execution resumed"
            );
        }
        Ok(())
    }

    fn run_request(&self, request: PendingRequest, ctx: &dyn ExecutionContext) -> ServerMessage {
        let PendingRequest {
            correlation_id,
            kind,
        } = request;
        match kind {
            RequestKind::ExecuteSteps(steps) => {
                let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
                    self.host.execute_steps(ctx, &steps)
                }));
                let error = match outcome {
                    Ok(Ok(())) => None,
                    Ok(Err(err)) => Some(format!("{err:#}")),
                    Err(panic) => Some(panic_message(panic.as_ref())),
                };
                if let Some(error) = &error {
                    tracing::warn!(
                        target: "autox.debug",
                        point_id = %self.id,
                        correlation_id = %correlation_id,
                        error = %error,
                        "ad-hoc steps failed"
                    );
                }
                ServerMessage::StepExecuted {
                    correlation_id,
                    success: error.is_none(),
                    context: error.is_none().then(|| snapshot_context(ctx)),
                    error,
                }
            }
            RequestKind::Evaluate(expression) => {
                let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
                    self.host.evaluate(ctx, &expression)
                }));
                let value = match outcome {
                    Ok(Ok(value)) => serde_json::to_string(&value).map_err(|err| err.to_string()),
                    Ok(Err(err)) => Err(format!("{err:#}")),
                    Err(panic) => Err(panic_message(panic.as_ref())),
                };
                match value {
                    Ok(value) => ServerMessage::EvaluationResult {
                        correlation_id,
                        success: true,
                        value: Some(value),
                        error: None,
                    },
                    Err(error) => {
                        tracing::warn!(
                            target: "autox.debug",
                            point_id = %self.id,
                            correlation_id = %correlation_id,
                            error = %error,
                            "expression evaluation failed"
                        );
                        ServerMessage::EvaluationResult {
                            correlation_id,
                            success: false,
                            value: None,
                            error: Some(error),
                        }
                    }
                }
            }
        }
    }

    pub fn queue_step_execution(&self, correlation_id: &str, steps: &str) -> DebugResult<()> {
        self.queue_request(PendingRequest {
            correlation_id: correlation_id.to_owned(),
            kind: RequestKind::ExecuteSteps(steps.to_owned()),
        })
    }

    pub fn queue_evaluation(&self, correlation_id: &str, expression: &str) -> DebugResult<()> {
        self.queue_request(PendingRequest {
            correlation_id: correlation_id.to_owned(),
            kind: RequestKind::Evaluate(expression.to_owned()),
        })
    }

    fn queue_request(&self, request: PendingRequest) -> DebugResult<()> {
        let mut state = self.state.lock();
        if state.phase != PausePhase::Paused {
            drop(state);
            let err = DebugError::NotPaused(self.id.clone());
            let error = Some(err.to_string());
            let failure = match request.kind {
                RequestKind::ExecuteSteps(_) => ServerMessage::StepExecuted {
                    correlation_id: request.correlation_id,
                    success: false,
                    context: None,
                    error,
                },
                RequestKind::Evaluate(_) => ServerMessage::EvaluationResult {
                    correlation_id: request.correlation_id,
                    success: false,
                    value: None,
                    error,
                },
            };
            self.outbox.enqueue(failure);
            return Err(err);
        }
        state.requests.push_back(request);
        self.wake.notify_all();
        Ok(())
    }

    /// Resume the paused thread with `op`. Answers with a confirmation either way.
    pub fn resume(&self, correlation_id: &str, op: DebugOp) -> DebugResult<()> {
        let mut state = self.state.lock();
        if state.phase != PausePhase::Paused {
            drop(state);
            let err = DebugError::NotPaused(self.id.clone());
            self.outbox
                .enqueue(ServerMessage::Confirmation(Confirmation::failure(
                    correlation_id,
                    err.to_string(),
                )));
            return Err(err);
        }

        match op {
            DebugOp::StepReturn => {
                state.released = true;
                state.phase = PausePhase::Released;
                state.pending_op = None;
                if let Some(index) = self.index.upgrade() {
                    index.detach(self.owner, &self.id, state.last_location.clone());
                }
            }
            DebugOp::StepInto | DebugOp::StepOver => {
                state.phase = PausePhase::Running;
                state.pending_op = Some(op);
            }
        }
        state.wake_reason = Some(WakeReason::Resume(op));
        // Confirm before the owner can report the release.
        self.outbox
            .enqueue(ServerMessage::Confirmation(Confirmation::success(correlation_id)));
        self.wake.notify_all();
        Ok(())
    }

    /// Tear the point down without a client operation. Returns `false` if already released.
    pub(crate) fn release(&self) -> bool {
        let mut state = self.state.lock();
        if state.released {
            return false;
        }
        state.released = true;
        state.pending_op = None;
        if state.phase == PausePhase::Paused {
            state.wake_reason = Some(WakeReason::Release);
            self.outbox.enqueue(ServerMessage::ExecutionReleased {
                point_id: self.id.clone(),
                op: None,
            });
        }
        state.phase = PausePhase::Released;
        self.wake.notify_all();
        true
    }

    /// Called by the owning thread at every location reached after a step-into/step-over.
    pub fn check_for_pause(
        &self,
        location: &SourceLocation,
        ctx: &dyn ExecutionContext,
    ) -> DebugResult<()> {
        if thread::current().id() != self.owner {
            return Err(self.invalid_state("check_for_pause called from a non-owner thread"));
        }

        let op = {
            let state = self.state.lock();
            if state.released {
                return Ok(());
            }
            match state.pending_op {
                Some(DebugOp::StepInto) => DebugOp::StepInto,
                Some(DebugOp::StepOver) => {
                    let nested = state
                        .last_location
                        .as_ref()
                        .is_some_and(|last| ctx.is_sub_execution_of(last));
                    if nested {
                        return Ok(());
                    }
                    DebugOp::StepOver
                }
                Some(DebugOp::StepReturn) | None => {
                    return Err(
                        self.invalid_state("check_for_pause called with no pending operation")
                    );
                }
            }
        };

        tracing::debug!(
            target: "autox.debug",
            point_id = %self.id,
            location = %location,
            op = %op,
            "step reached"
        );
        self.pause(location, ctx)
    }

    fn invalid_state(&self, message: &str) -> DebugError {
        tracing::error!(
            target: "autox.debug",
            point_id = %self.id,
            thread = %self.thread_name,
            "{message}"
        );
        DebugError::InvalidState(format!("{message} (point {})", self.id))
    }
}

/// Index of live pause points: at most one per thread, addressable by id.
#[derive(Debug, Default)]
pub struct LivePoints {
    inner: RwLock<LiveIndex>,
    live: AtomicUsize,
    markers: AtomicUsize,
}

#[derive(Debug, Default)]
struct LiveIndex {
    by_thread: HashMap<ThreadId, Arc<LivePausePoint>>,
    by_id: HashMap<String, Arc<LivePausePoint>>,
    /// Location each thread was last released from by step-return.
    reentry: HashMap<ThreadId, SourceLocation>,
    /// Set by `drain`; no point may be inserted afterwards.
    closed: bool,
}

impl LivePoints {
    pub fn new() -> Self {
        Self::default()
    }

    /// No live point and no re-entry marker anywhere.
    pub fn is_idle(&self) -> bool {
        self.live.load(Ordering::Acquire) == 0 && self.markers.load(Ordering::Acquire) == 0
    }

    pub fn len(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register `point` for its owner. Returns `false` once the index has been drained.
    pub(crate) fn insert(&self, point: Arc<LivePausePoint>) -> bool {
        let mut index = self.inner.write();
        if index.closed {
            return false;
        }
        if let Some(previous) = index.by_thread.insert(point.owner, point.clone()) {
            index.by_id.remove(&previous.id);
        }
        index.by_id.insert(point.id.clone(), point);
        self.live.store(index.by_id.len(), Ordering::Release);
        true
    }

    pub fn is_closed(&self) -> bool {
        self.inner.read().closed
    }

    pub fn for_thread(&self, thread: ThreadId) -> Option<Arc<LivePausePoint>> {
        if self.live.load(Ordering::Acquire) == 0 {
            return None;
        }
        self.inner.read().by_thread.get(&thread).cloned()
    }

    pub fn get(&self, id: &str) -> Option<Arc<LivePausePoint>> {
        self.inner.read().by_id.get(id).cloned()
    }

    pub fn all(&self) -> Vec<Arc<LivePausePoint>> {
        let mut points: Vec<_> = self.inner.read().by_id.values().cloned().collect();
        points.sort_by(|a, b| a.id.cmp(&b.id));
        points
    }

    /// Remove `id` (owned by `thread`), optionally leaving a re-entry marker behind.
    pub(crate) fn detach(&self, thread: ThreadId, id: &str, marker: Option<SourceLocation>) {
        let mut index = self.inner.write();
        index.by_id.remove(id);
        if index
            .by_thread
            .get(&thread)
            .is_some_and(|point| point.id == id)
        {
            index.by_thread.remove(&thread);
        }
        match marker {
            Some(location) => {
                index.reentry.insert(thread, location);
            }
            None => {
                index.reentry.remove(&thread);
            }
        }
        self.sync_counts(&index);
    }

    /// Consume `thread`'s re-entry marker. Returns `true` when it matched `location`; a
    /// marker for any other location is discarded.
    pub(crate) fn take_reentry(&self, thread: ThreadId, location: &SourceLocation) -> bool {
        if self.markers.load(Ordering::Acquire) == 0 {
            return false;
        }
        let mut index = self.inner.write();
        let matched = match index.reentry.remove(&thread) {
            Some(marker) => marker == *location,
            None => false,
        };
        self.sync_counts(&index);
        matched
    }

    pub(crate) fn clear_reentry(&self, thread: ThreadId) {
        if self.markers.load(Ordering::Acquire) == 0 {
            return;
        }
        let mut index = self.inner.write();
        index.reentry.remove(&thread);
        self.sync_counts(&index);
    }

    /// Remove and return every live point, clearing all markers. Later inserts are refused.
    pub(crate) fn drain(&self) -> Vec<Arc<LivePausePoint>> {
        let mut index = self.inner.write();
        index.closed = true;
        index.by_thread.clear();
        index.reentry.clear();
        let points: Vec<_> = index.by_id.drain().map(|(_, point)| point).collect();
        self.sync_counts(&index);
        points
    }

    fn sync_counts(&self, index: &LiveIndex) {
        self.live.store(index.by_id.len(), Ordering::Release);
        self.markers.store(index.reentry.len(), Ordering::Release);
    }
}

//! State machine driver
//!
//! [`StateCore`] is owned by a resource's execution queue, so every method
//! here runs on that queue and mutates freely. Work is expressed as
//! [`Step`]s: an acquire walks `Open → Load → AcquireDone`, a release walks
//! `Unload → Close → ReleaseDone`. A step that cannot run yet (the state is
//! busy, or an earlier ticket has not finished) is parked in the deferred
//! queue and reposted onto the execution queue once the state settles.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tracing::{debug, error, trace, warn};

use crate::backend::ResourceBackend;
use crate::execution_queue::QueueHandle;
use crate::monitor::LifecycleStats;
use crate::resource::completion::{
    AcquireReply, CloseCompletion, CloseOutcome, DeleteCallback, LoadCompletion, OpenCompletion,
    ReleaseReply, UnloadCompletion, UnloadOutcome,
};
use crate::resource::types::{LifecycleState, OperationOrigin, StateSnapshot};

pub(crate) struct AcquireOp {
    origin: OperationOrigin,
    order: u64,
    reply: AcquireReply,
}

pub(crate) struct ReleaseOp {
    origin: OperationOrigin,
    order: u64,
    delete: DeleteCallback,
    reply: ReleaseReply,
}

/// Next thing an admitted operation has to do.
pub(crate) enum Step {
    Open(AcquireOp),
    Load(AcquireOp),
    AcquireDone(AcquireOp),
    Unload(ReleaseOp),
    Close(ReleaseOp),
    ReleaseDone(ReleaseOp),
}

impl Step {
    const fn name(&self) -> &'static str {
        match self {
            Self::Open(_) => "retry open",
            Self::Load(_) => "retry load",
            Self::AcquireDone(_) => "retry acquire done",
            Self::Unload(_) => "retry unload",
            Self::Close(_) => "retry close",
            Self::ReleaseDone(_) => "retry release done",
        }
    }
}

pub(crate) struct StateCore<B: ResourceBackend> {
    backend: Arc<B>,
    queue: QueueHandle<Self>,
    resource_type: &'static str,
    short_id: u32,
    state: LifecycleState,
    load_count: u32,
    streaming_count: u32,
    opened_instances: Arc<AtomicU32>,
    creation_op_order: u64,
    done_op_order: u64,
    later: VecDeque<Step>,
    stats: Arc<LifecycleStats>,
}

impl<B: ResourceBackend> StateCore<B> {
    pub(crate) fn new(
        backend: Arc<B>,
        queue: QueueHandle<Self>,
        opened_instances: Arc<AtomicU32>,
        stats: Arc<LifecycleStats>,
    ) -> Self {
        let resource_type = backend.managing_type_name();
        let short_id = backend.short_id();
        trace!(resource_type, short_id, "Created resource state");
        Self {
            backend,
            queue,
            resource_type,
            short_id,
            state: LifecycleState::Closed,
            load_count: 0,
            streaming_count: 0,
            opened_instances,
            creation_op_order: 0,
            done_op_order: 0,
            later: VecDeque::new(),
            stats,
        }
    }

    pub(crate) fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            state: self.state,
            load_count: self.load_count,
            streaming_count: self.streaming_count,
            opened_instances: self.opened_instances.load(Ordering::Acquire),
        }
    }

    fn set_state(&mut self, to: LifecycleState) {
        let from = self.state;
        trace!(
            resource_type = self.resource_type,
            short_id = self.short_id,
            "{from} -> {to}"
        );
        self.state = to;
        self.backend.on_transition(from, to);
    }

    fn can_open(&self) -> bool {
        self.backend.can_open(&self.snapshot())
    }

    fn can_load(&self) -> bool {
        self.backend.can_load(&self.snapshot())
    }

    fn can_unload(&self) -> bool {
        self.backend.can_unload(&self.snapshot())
    }

    fn can_close(&self) -> bool {
        self.backend.can_close(&self.snapshot())
    }

    fn next_ticket(&mut self) -> u64 {
        let order = self.creation_op_order;
        self.creation_op_order += 1;
        order
    }

    pub(crate) fn drive(&mut self, step: Step) {
        match step {
            Step::Open(op) => self.acquire_open(op),
            Step::Load(op) => self.acquire_load(op),
            Step::AcquireDone(op) => self.acquire_done(op),
            Step::Unload(op) => self.release_unload(op),
            Step::Close(op) => self.release_close(op),
            Step::ReleaseDone(op) => self.release_done(op),
        }
    }

    fn defer(&mut self, step: Step) {
        self.later.push_back(step);
    }

    fn process_later_ops(&mut self) {
        let count = self.later.len();
        while let Some(step) = self.later.pop_front() {
            let name = step.name();
            // A closed queue drops the step, which answers its caller with failure.
            let _ = self.queue.async_op(name, move |core| core.drive(step));
        }
        if count > 0 {
            trace!(
                resource_type = self.resource_type,
                short_id = self.short_id,
                count,
                "Reposted deferred operations"
            );
        }
    }

    // Acquire

    pub(crate) fn acquire(&mut self, origin: OperationOrigin, reply: AcquireReply) {
        if self.creation_op_order == 0 {
            trace!(
                resource_type = self.resource_type,
                short_id = self.short_id,
                "Initial loading"
            );
        }

        if origin == OperationOrigin::Streaming {
            self.streaming_count += 1;
        }
        self.load_count += 1;
        trace!(
            resource_type = self.resource_type,
            short_id = self.short_id,
            load_count = self.load_count,
            streaming_count = self.streaming_count,
            "Incremented load count"
        );

        let order = self.next_ticket();
        self.acquire_open(AcquireOp {
            origin,
            order,
            reply,
        });
    }

    fn acquire_open(&mut self, op: AcquireOp) {
        if self.state.is_busy() {
            if self.state == LifecycleState::Closing {
                self.set_state(LifecycleState::WillReopen);
            }
            trace!(
                resource_type = self.resource_type,
                short_id = self.short_id,
                order = op.order,
                "Open deferred"
            );
            self.defer(Step::Open(op));
            return;
        }

        if self.state == LifecycleState::CanReopen {
            self.set_state(LifecycleState::Closed);
        }

        if !self.can_open() {
            self.acquire_load(op);
            return;
        }

        debug_assert_eq!(self.state, LifecycleState::Closed);
        self.set_state(LifecycleState::Opening);

        let queue = self.queue.clone();
        let completion = OpenCompletion::new(self.resource_type, self.short_id, move |opened| {
            let _ = queue.async_op("open finished", move |core| core.open_finished(opened, op));
        });
        Arc::clone(&self.backend).open(completion);
    }

    fn open_finished(&mut self, opened: bool, op: AcquireOp) {
        if !opened {
            self.stats.record_error();
        }
        if self.state == LifecycleState::Opening {
            if opened {
                self.set_state(LifecycleState::Opened);
            } else {
                warn!(
                    resource_type = self.resource_type,
                    short_id = self.short_id,
                    "Opening failed -> Closed"
                );
                self.set_state(LifecycleState::Closed);
            }
        } else {
            error!(
                resource_type = self.resource_type,
                short_id = self.short_id,
                state = %self.state,
                opened,
                "Open finished while not in Opening state"
            );
        }
        self.acquire_load(op);
    }

    fn acquire_load(&mut self, op: AcquireOp) {
        if self.state.is_busy() {
            match self.state {
                // Unreachable in practice: an acquire racing an unload is held at the open step.
                LifecycleState::Unloading => self.set_state(LifecycleState::WillReload),
                LifecycleState::Closing => self.set_state(LifecycleState::WillReopen),
                _ => {}
            }
            trace!(
                resource_type = self.resource_type,
                short_id = self.short_id,
                order = op.order,
                "Load deferred"
            );
            // Restart from the open step: the racing release may close the resource.
            self.defer(Step::Open(op));
            return;
        }

        if self.state == LifecycleState::CanReload {
            self.set_state(LifecycleState::Opened);
        }

        if !self.can_load() {
            self.acquire_done(op);
            return;
        }

        self.set_state(LifecycleState::Loading);

        let queue = self.queue.clone();
        let completion = LoadCompletion::new(self.resource_type, self.short_id, move |loaded| {
            let _ = queue.async_op("load finished", move |core| core.load_finished(loaded, op));
        });
        Arc::clone(&self.backend).load(completion);
    }

    fn load_finished(&mut self, loaded: bool, op: AcquireOp) {
        if !loaded {
            self.stats.record_error();
        }
        if self.state == LifecycleState::Loading {
            if loaded {
                self.set_state(LifecycleState::Loaded);
            } else {
                warn!(
                    resource_type = self.resource_type,
                    short_id = self.short_id,
                    "Loading failed -> Opened"
                );
                self.set_state(LifecycleState::Opened);
            }
        } else {
            error!(
                resource_type = self.resource_type,
                short_id = self.short_id,
                state = %self.state,
                loaded,
                "Load finished while not in Loading state"
            );
        }
        self.acquire_done(op);
    }

    fn acquire_done(&mut self, op: AcquireOp) {
        if op.order < self.done_op_order {
            error!(
                resource_type = self.resource_type,
                short_id = self.short_id,
                order = op.order,
                done_order = self.done_op_order,
                "Acquire finishing after its turn"
            );
        }

        if self.state.is_busy() {
            self.defer(Step::AcquireDone(op));
            return;
        }

        self.process_later_ops();

        if op.order > self.done_op_order {
            trace!(
                resource_type = self.resource_type,
                short_id = self.short_id,
                order = op.order,
                remaining = op.order - self.done_op_order,
                "Acquire done out of order, waiting for its turn"
            );
            self.defer(Step::AcquireDone(op));
            return;
        }

        self.done_op_order += 1;

        let acquired = match op.origin {
            OperationOrigin::Streaming => {
                let loaded = self.state == LifecycleState::Loaded;
                if !loaded {
                    if self.can_load() {
                        warn!(
                            resource_type = self.resource_type,
                            short_id = self.short_id,
                            "Could not load resource for streaming"
                        );
                    } else {
                        trace!(
                            resource_type = self.resource_type,
                            short_id = self.short_id,
                            "Streaming request aborted before load done"
                        );
                    }
                }
                loaded
            }
            OperationOrigin::Normal => {
                let reached = self.state == LifecycleState::Loaded
                    || (self.state == LifecycleState::Opened && !self.can_load())
                    || (self.state == LifecycleState::Closed && !self.can_open());
                if !reached {
                    warn!(
                        resource_type = self.resource_type,
                        short_id = self.short_id,
                        state = %self.state,
                        can_load = self.can_load(),
                        can_open = self.can_open(),
                        "Could not open resource"
                    );
                }
                reached
            }
        };

        trace!(
            resource_type = self.resource_type,
            short_id = self.short_id,
            order = op.order,
            acquired,
            "Done acquiring"
        );
        op.reply.send(acquired);
    }

    // Release

    pub(crate) fn release(
        &mut self,
        origin: OperationOrigin,
        delete: DeleteCallback,
        reply: ReleaseReply,
    ) {
        // Each origin can only undo a hold of its own kind.
        let unbalanced = match origin {
            OperationOrigin::Normal => self.load_count == self.streaming_count,
            OperationOrigin::Streaming => self.streaming_count == 0,
        };
        if unbalanced {
            // No ticket is taken, so later operations are not held back.
            error!(
                resource_type = self.resource_type,
                short_id = self.short_id,
                ?origin,
                load_count = self.load_count,
                streaming_count = self.streaming_count,
                "Release without a matching acquire"
            );
            reply.send();
            return;
        }

        if origin == OperationOrigin::Streaming {
            self.streaming_count -= 1;
        }
        self.load_count -= 1;
        trace!(
            resource_type = self.resource_type,
            short_id = self.short_id,
            load_count = self.load_count,
            streaming_count = self.streaming_count,
            "Decremented load count"
        );

        let order = self.next_ticket();
        self.release_unload(ReleaseOp {
            origin,
            order,
            delete,
            reply,
        });
    }

    fn release_unload(&mut self, op: ReleaseOp) {
        if self.state.is_busy() {
            trace!(
                resource_type = self.resource_type,
                short_id = self.short_id,
                order = op.order,
                "Unload deferred"
            );
            self.defer(Step::Unload(op));
            return;
        }

        if !self.can_unload() {
            self.release_close(op);
            return;
        }

        self.set_state(LifecycleState::Unloading);

        let queue = self.queue.clone();
        let completion = UnloadCompletion::new(self.resource_type, self.short_id, move |outcome| {
            let _ = queue.async_op("unload finished", move |core| {
                core.unload_finished(outcome, op);
            });
        });
        Arc::clone(&self.backend).unload(completion);
    }

    fn unload_finished(&mut self, outcome: UnloadOutcome, op: ReleaseOp) {
        match (outcome, self.state) {
            (UnloadOutcome::Done, LifecycleState::Unloading) => {
                self.set_state(LifecycleState::Opened);
                self.release_close(op);
            }
            (UnloadOutcome::Done, LifecycleState::WillReload) => {
                self.set_state(LifecycleState::CanReload);
                self.process_later_ops();
                self.release_close(op);
            }
            (UnloadOutcome::DoneClosed, LifecycleState::Unloading) => {
                self.set_state(LifecycleState::Closed);
                self.release_close(op);
            }
            (UnloadOutcome::DoneClosed, LifecycleState::WillReload) => {
                self.set_state(LifecycleState::CanReopen);
                self.process_later_ops();
                self.release_close(op);
            }
            (UnloadOutcome::Deferred, LifecycleState::WillReload) => {
                debug!(
                    resource_type = self.resource_type,
                    short_id = self.short_id,
                    "Unload deferred, another user needs this to stay loaded"
                );
                self.set_state(LifecycleState::Loaded);
                self.release_close(op);
            }
            (UnloadOutcome::Deferred, LifecycleState::Unloading) => {
                debug!(
                    resource_type = self.resource_type,
                    short_id = self.short_id,
                    "Unload deferred, retrying"
                );
                self.set_state(LifecycleState::Loaded);
                self.release_unload(op);
            }
            (outcome, state) => {
                error!(
                    resource_type = self.resource_type,
                    short_id = self.short_id,
                    ?outcome,
                    %state,
                    "Unload finished while not in Unloading state"
                );
                self.release_close(op);
            }
        }
    }

    fn release_close(&mut self, op: ReleaseOp) {
        if self.state.is_busy() {
            trace!(
                resource_type = self.resource_type,
                short_id = self.short_id,
                order = op.order,
                "Close deferred"
            );
            self.defer(Step::Close(op));
            return;
        }

        if !self.can_close() {
            self.release_done(op);
            return;
        }

        self.set_state(LifecycleState::Closing);

        let queue = self.queue.clone();
        let completion = CloseCompletion::new(self.resource_type, self.short_id, move |outcome| {
            let _ = queue.async_op("close finished", move |core| {
                core.close_finished(outcome, op);
            });
        });
        Arc::clone(&self.backend).close(completion);
    }

    fn close_finished(&mut self, outcome: CloseOutcome, op: ReleaseOp) {
        match (outcome, self.state) {
            (CloseOutcome::Done, LifecycleState::Closing) => {
                self.set_state(LifecycleState::Closed);
                self.release_done(op);
            }
            (CloseOutcome::Done, LifecycleState::WillReopen) => {
                self.set_state(LifecycleState::CanReopen);
                self.process_later_ops();
                self.release_done(op);
            }
            (CloseOutcome::Deferred, LifecycleState::WillReopen) => {
                debug!(
                    resource_type = self.resource_type,
                    short_id = self.short_id,
                    "Close deferred, another user needs this to stay open"
                );
                self.set_state(LifecycleState::Opened);
                self.release_done(op);
            }
            (CloseOutcome::Deferred, LifecycleState::Closing) => {
                debug!(
                    resource_type = self.resource_type,
                    short_id = self.short_id,
                    "Close deferred, retrying"
                );
                self.set_state(LifecycleState::Opened);
                self.release_close(op);
            }
            (outcome, state) => {
                error!(
                    resource_type = self.resource_type,
                    short_id = self.short_id,
                    ?outcome,
                    %state,
                    "Close finished while not in Closing state"
                );
                self.release_done(op);
            }
        }
    }

    fn release_done(&mut self, op: ReleaseOp) {
        if op.order < self.done_op_order {
            error!(
                resource_type = self.resource_type,
                short_id = self.short_id,
                order = op.order,
                done_order = self.done_op_order,
                "Release finishing after its turn"
            );
        }

        if self.state.is_busy() {
            self.defer(Step::ReleaseDone(op));
            return;
        }

        self.process_later_ops();

        if op.order > self.done_op_order {
            trace!(
                resource_type = self.resource_type,
                short_id = self.short_id,
                order = op.order,
                remaining = op.order - self.done_op_order,
                "Release done out of order, waiting for its turn"
            );
            self.defer(Step::ReleaseDone(op));
            return;
        }

        self.done_op_order += 1;
        let decremented = self
            .opened_instances
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        if decremented.is_err() {
            error!(
                resource_type = self.resource_type,
                short_id = self.short_id,
                "Opened instances already at zero"
            );
        }

        let ReleaseOp {
            origin,
            order,
            delete,
            reply,
        } = op;
        if self.snapshot().is_deletable() {
            trace!(
                resource_type = self.resource_type,
                short_id = self.short_id,
                order,
                ?origin,
                "Done releasing, deleting state"
            );
            delete(reply.into_deleted());
        } else {
            trace!(
                resource_type = self.resource_type,
                short_id = self.short_id,
                order,
                ?origin,
                "Done releasing"
            );
            reply.send();
        }
    }
}

impl<B: ResourceBackend> Drop for StateCore<B> {
    fn drop(&mut self) {
        trace!(
            resource_type = self.resource_type,
            short_id = self.short_id,
            "Dropping resource state"
        );
        if self.load_count > 0 {
            error!(
                resource_type = self.resource_type,
                short_id = self.short_id,
                load_count = self.load_count,
                "Dropping resource state with load count still active"
            );
        }
        if !self.later.is_empty() {
            warn!(
                resource_type = self.resource_type,
                short_id = self.short_id,
                pending = self.later.len(),
                "Dropping resource state with deferred operations, failing them"
            );
        }
    }
}

//! Reference-counted resource states with ordered completion
//!
//! A [`ResourceState`] coordinates any number of concurrent acquire and
//! release requests for one expensive resource. The first acquire opens and
//! loads it through its [`ResourceBackend`]; the release that brings the
//! count back to zero unloads and closes it. Requests arriving while a
//! backend call is in flight wait for it instead of issuing their own, and
//! an acquire racing a release reuses whatever the release has not undone
//! yet.
//!
//! Every admitted request takes a ticket, and callbacks fire strictly in
//! ticket order whatever order the backend completes in.
//!
//! # Example
//!
//! ```rust,ignore
//! use lifecore::resource::{OperationOrigin, ResourceState};
//! use std::sync::Arc;
//!
//! let state = ResourceState::new(Arc::new(backend));
//!
//! if state.acquire(OperationOrigin::Normal).await {
//!     // the resource is open and loaded
//! }
//! // Every acquire, successful or not, is balanced by a release.
//! state.release(OperationOrigin::Normal).await;
//!
//! state.term().await;
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::{error, info, trace, warn};

use crate::backend::ResourceBackend;
use crate::config::{LifecycleConfig, ShutdownSignal};
use crate::execution_queue::ExecutionQueue;
use crate::monitor::{LifecycleStats, OperationTimer};

pub mod completion;
pub(crate) mod lifecycle;
pub mod types;

#[cfg(test)]
mod tests;

pub use completion::{
    CloseCompletion, CloseOutcome, DeleteCallback, LoadCompletion, OpenCompletion, ReleaseReply,
    UnloadCompletion, UnloadOutcome,
};
pub use types::{LifecycleState, OperationOrigin, ReleaseOutcome, StateSnapshot};

use completion::AcquireReply;
use lifecycle::StateCore;

/// Lifecycle state of one managed resource.
///
/// All state lives on a private execution queue. Only the number of opened
/// instances is readable without going through it.
pub struct ResourceState<B: ResourceBackend> {
    backend: Arc<B>,
    resource_type: &'static str,
    short_id: u32,
    queue: ExecutionQueue<StateCore<B>>,
    opened_instances: Arc<AtomicU32>,
    termed: AtomicBool,
    config: LifecycleConfig,
    stats: Arc<LifecycleStats>,
    shutdown: ShutdownSignal,
}

impl<B: ResourceBackend> ResourceState<B> {
    /// Create a state with default configuration and private statistics.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(backend: Arc<B>) -> Self {
        Self::with_monitoring(
            backend,
            LifecycleConfig::default(),
            Arc::new(LifecycleStats::new()),
            ShutdownSignal::new(),
        )
    }

    /// Create a state sharing configuration, statistics and the exit flag
    /// with its siblings.
    pub fn with_monitoring(
        backend: Arc<B>,
        config: LifecycleConfig,
        stats: Arc<LifecycleStats>,
        shutdown: ShutdownSignal,
    ) -> Self {
        let resource_type = backend.managing_type_name();
        let short_id = backend.short_id();
        let opened_instances = Arc::new(AtomicU32::new(0));

        let queue = {
            let backend = Arc::clone(&backend);
            let opened_instances = Arc::clone(&opened_instances);
            let stats = Arc::clone(&stats);
            ExecutionQueue::new(format!("{resource_type} {short_id}"), move |handle| {
                StateCore::new(backend, handle, opened_instances, stats)
            })
        };

        Self {
            backend,
            resource_type,
            short_id,
            queue,
            opened_instances,
            termed: AtomicBool::new(false),
            config,
            stats,
            shutdown,
        }
    }

    /// The backend driven by this state.
    pub const fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// Diagnostic tag of the managed resource.
    pub const fn resource_type(&self) -> &'static str {
        self.resource_type
    }

    /// Identifier of the managed resource.
    pub const fn short_id(&self) -> u32 {
        self.short_id
    }

    /// Statistics this state reports into.
    pub fn stats(&self) -> &Arc<LifecycleStats> {
        &self.stats
    }

    fn timer(&self, operation: &'static str) -> OperationTimer {
        OperationTimer::start(
            Arc::clone(&self.stats),
            self.config.slow_operation_threshold.as_duration(),
            operation,
            self.resource_type,
            self.short_id,
        )
    }

    /// Register one more use and bring the resource as far up as it needs
    /// to go.
    ///
    /// `callback` receives `true` if the resource reached the level the
    /// origin requires. Either way the use is counted and must be balanced
    /// by a release.
    pub fn acquire_async<F>(&self, origin: OperationOrigin, callback: F)
    where
        F: FnOnce(bool) + Send + 'static,
    {
        if self.is_termed() {
            error!(
                resource_type = self.resource_type,
                short_id = self.short_id,
                "Acquire on a terminated state, failing immediately"
            );
            callback(false);
            return;
        }

        let reply = AcquireReply::new(callback, Some(self.timer("acquire")));
        self.opened_instances.fetch_add(1, Ordering::AcqRel);
        if let Err(e) = self
            .queue
            .async_op("acquire", move |core| core.acquire(origin, reply))
        {
            self.opened_instances.fetch_sub(1, Ordering::AcqRel);
            error!(
                resource_type = self.resource_type,
                short_id = self.short_id,
                error = %e,
                "Could not queue acquire"
            );
        }
    }

    /// Awaitable form of [`acquire_async`](Self::acquire_async).
    pub async fn acquire(&self, origin: OperationOrigin) -> bool {
        let (tx, rx) = oneshot::channel();
        self.acquire_async(origin, move |acquired| {
            let _ = tx.send(acquired);
        });
        rx.await.unwrap_or(false)
    }

    /// Undo one use and bring the resource down as far as nobody needs it.
    ///
    /// When the state ends up deletable, `delete` receives the reply and is
    /// responsible for destroying the state and then sending the reply.
    /// Otherwise `callback` gets [`ReleaseOutcome::Retained`] directly.
    pub fn release_async<D, F>(&self, origin: OperationOrigin, delete: D, callback: F)
    where
        D: FnOnce(ReleaseReply) + Send + 'static,
        F: FnOnce(ReleaseOutcome) + Send + 'static,
    {
        if self.is_termed() {
            error!(
                resource_type = self.resource_type,
                short_id = self.short_id,
                "Release on a terminated state, answering immediately"
            );
            callback(ReleaseOutcome::Retained);
            return;
        }

        let reply = ReleaseReply::new(callback, Some(self.timer("release")));
        let delete: DeleteCallback = Box::new(delete);
        if let Err(e) = self
            .queue
            .async_op("release", move |core| core.release(origin, delete, reply))
        {
            error!(
                resource_type = self.resource_type,
                short_id = self.short_id,
                error = %e,
                "Could not queue release"
            );
        }
    }

    /// Awaitable form of [`release_async`](Self::release_async).
    ///
    /// No destruction happens here: [`ReleaseOutcome::Deleted`] only tells
    /// the owner the state may now be terminated and dropped.
    pub async fn release(&self, origin: OperationOrigin) -> ReleaseOutcome {
        let (tx, rx) = oneshot::channel();
        self.release_async(origin, ReleaseReply::send, move |outcome| {
            let _ = tx.send(outcome);
        });
        rx.await.unwrap_or(ReleaseOutcome::Retained)
    }

    /// Acquires admitted and not yet balanced by a finished release.
    pub fn opened_instances(&self) -> u32 {
        self.opened_instances.load(Ordering::Acquire)
    }

    /// Whether [`term`](Self::term) already ran.
    pub fn is_termed(&self) -> bool {
        self.termed.load(Ordering::Acquire)
    }

    /// Read the state from its queue. `None` once the queue is closed.
    pub async fn snapshot(&self) -> Option<StateSnapshot> {
        self.queue
            .async_wait("snapshot", |core| core.snapshot())
            .await
            .ok()
    }

    /// Whether the state may be destroyed right now.
    pub async fn can_delete(&self) -> bool {
        matches!(self.snapshot().await, Some(snapshot) if snapshot.is_deletable())
    }

    /// Shut the state down.
    ///
    /// Waits a bounded number of rounds for in-flight operations, then
    /// closes the queue. Whatever is still outstanding afterwards is leaked
    /// and its callbacks fire with failure.
    pub async fn term(&self) {
        if self.termed.swap(true, Ordering::AcqRel) {
            error!(
                resource_type = self.resource_type,
                short_id = self.short_id,
                "State already terminated"
            );
            return;
        }

        let exiting = self.shutdown.is_exit_requested();
        if self.opened_instances() > 0 {
            let attempts: u32 = self.config.term_drain_attempts.into();
            info!(
                resource_type = self.resource_type,
                short_id = self.short_id,
                attempts,
                "Terminating with active operations, waiting before bailing out"
            );
            if !self.queue.is_running_in_this_context() {
                for _ in 0..attempts {
                    if self.opened_instances() == 0 {
                        break;
                    }
                    let _ = self.queue.async_wait("term wait", |_| ()).await;
                    tokio::time::sleep(self.config.term_wait_interval.as_duration()).await;
                }
            }
            let outstanding = self.opened_instances();
            if outstanding > 0 && exiting {
                trace!(
                    resource_type = self.resource_type,
                    short_id = self.short_id,
                    outstanding,
                    "Terminating with active operations at exit"
                );
            } else if outstanding > 0 {
                error!(
                    resource_type = self.resource_type,
                    short_id = self.short_id,
                    outstanding,
                    "Terminating with active operations, leaking them"
                );
            }
        }

        trace!(
            resource_type = self.resource_type,
            short_id = self.short_id,
            "Terminating"
        );
        if let Some(snapshot) = self.snapshot().await {
            if snapshot.state != LifecycleState::Closed {
                if exiting {
                    trace!(
                        resource_type = self.resource_type,
                        short_id = self.short_id,
                        state = %snapshot.state,
                        "Term unclosed resource state at exit, leaking"
                    );
                } else {
                    warn!(
                        resource_type = self.resource_type,
                        short_id = self.short_id,
                        state = %snapshot.state,
                        "Term unclosed resource state, leaking"
                    );
                }
            }
            if snapshot.load_count != 0 {
                info!(
                    resource_type = self.resource_type,
                    short_id = self.short_id,
                    load_count = snapshot.load_count,
                    "Terminating with load count still active"
                );
            }
        }

        self.queue.close_and_delete();
        self.queue.join().await;
    }
}

impl<B: ResourceBackend> Drop for ResourceState<B> {
    fn drop(&mut self) {
        if !self.is_termed() {
            error!(
                resource_type = self.resource_type,
                short_id = self.short_id,
                "Dropping a resource state that was never terminated"
            );
            self.queue.close_and_delete();
        }
    }
}

impl<B: ResourceBackend> fmt::Debug for ResourceState<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceState")
            .field("resource_type", &self.resource_type)
            .field("short_id", &self.short_id)
            .field("opened_instances", &self.opened_instances())
            .field("termed", &self.is_termed())
            .finish_non_exhaustive()
    }
}

//! Completion handles and reply guards
//!
//! Backends receive one completion handle per call and resolve it exactly
//! once, from any thread. Resolving posts the outcome back onto the
//! resource's execution queue. A handle dropped without being resolved
//! resolves itself with the pessimistic outcome and logs a warning, so a
//! buggy backend can stall a resource but never corrupt it.
//!
//! Callers get the same guarantee through [`ReleaseReply`] and the internal
//! acquire reply: their callback fires exactly once, with failure if the
//! operation is dropped before it finishes (for example when the state is
//! terminated mid-flight).

use std::fmt;

use tracing::warn;

use crate::monitor::OperationTimer;
use crate::resource::types::ReleaseOutcome;

/// Result of a backend unload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnloadOutcome {
    /// Unloaded, the resource is still open.
    Done,
    /// Unloaded and closed in one go.
    DoneClosed,
    /// The backend could not unload yet; the state retries.
    Deferred,
}

/// Result of a backend close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    /// Closed.
    Done,
    /// The backend could not close yet; the state retries.
    Deferred,
}

struct Resolver<T: Copy + Send + 'static> {
    resolve: Option<Box<dyn FnOnce(T) + Send>>,
    fallback: T,
    operation: &'static str,
    resource_type: &'static str,
    short_id: u32,
}

impl<T: Copy + Send + 'static> Resolver<T> {
    fn new<F>(
        operation: &'static str,
        resource_type: &'static str,
        short_id: u32,
        fallback: T,
        resolve: F,
    ) -> Self
    where
        F: FnOnce(T) + Send + 'static,
    {
        Self {
            resolve: Some(Box::new(resolve)),
            fallback,
            operation,
            resource_type,
            short_id,
        }
    }

    fn resolve(&mut self, outcome: T) {
        if let Some(resolve) = self.resolve.take() {
            resolve(outcome);
        }
    }
}

impl<T: Copy + Send + 'static> Drop for Resolver<T> {
    fn drop(&mut self) {
        if self.resolve.is_some() {
            warn!(
                resource_type = self.resource_type,
                short_id = self.short_id,
                operation = self.operation,
                "Backend dropped a completion without resolving it"
            );
            self.resolve(self.fallback);
        }
    }
}

impl<T: Copy + Send + 'static> fmt::Debug for Resolver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("operation", &self.operation)
            .field("resource_type", &self.resource_type)
            .field("short_id", &self.short_id)
            .field("resolved", &self.resolve.is_none())
            .finish()
    }
}

/// Completion of a backend open. Dropping it counts as a failure.
#[derive(Debug)]
pub struct OpenCompletion(Resolver<bool>);

impl OpenCompletion {
    pub(crate) fn new<F>(resource_type: &'static str, short_id: u32, resolve: F) -> Self
    where
        F: FnOnce(bool) + Send + 'static,
    {
        Self(Resolver::new("open", resource_type, short_id, false, resolve))
    }

    /// The resource is open.
    pub fn succeeded(mut self) {
        self.0.resolve(true);
    }

    /// The resource could not be opened.
    pub fn failed(mut self) {
        self.0.resolve(false);
    }
}

/// Completion of a backend load. Dropping it counts as a failure.
#[derive(Debug)]
pub struct LoadCompletion(Resolver<bool>);

impl LoadCompletion {
    pub(crate) fn new<F>(resource_type: &'static str, short_id: u32, resolve: F) -> Self
    where
        F: FnOnce(bool) + Send + 'static,
    {
        Self(Resolver::new("load", resource_type, short_id, false, resolve))
    }

    /// The resource is loaded.
    pub fn succeeded(mut self) {
        self.0.resolve(true);
    }

    /// The resource could not be loaded.
    pub fn failed(mut self) {
        self.0.resolve(false);
    }
}

/// Completion of a backend unload. Dropping it counts as done.
#[derive(Debug)]
pub struct UnloadCompletion(Resolver<UnloadOutcome>);

impl UnloadCompletion {
    pub(crate) fn new<F>(resource_type: &'static str, short_id: u32, resolve: F) -> Self
    where
        F: FnOnce(UnloadOutcome) + Send + 'static,
    {
        Self(Resolver::new(
            "unload",
            resource_type,
            short_id,
            UnloadOutcome::Done,
            resolve,
        ))
    }

    /// Unloaded; the resource stays open.
    pub fn done(mut self) {
        self.0.resolve(UnloadOutcome::Done);
    }

    /// Unloaded, and the backend also closed the resource.
    pub fn done_and_closed(mut self) {
        self.0.resolve(UnloadOutcome::DoneClosed);
    }

    /// Not unloadable right now; the state decides whether to retry.
    pub fn defer(mut self) {
        self.0.resolve(UnloadOutcome::Deferred);
    }
}

/// Completion of a backend close. Dropping it counts as done.
#[derive(Debug)]
pub struct CloseCompletion(Resolver<CloseOutcome>);

impl CloseCompletion {
    pub(crate) fn new<F>(resource_type: &'static str, short_id: u32, resolve: F) -> Self
    where
        F: FnOnce(CloseOutcome) + Send + 'static,
    {
        Self(Resolver::new(
            "close",
            resource_type,
            short_id,
            CloseOutcome::Done,
            resolve,
        ))
    }

    /// Closed.
    pub fn done(mut self) {
        self.0.resolve(CloseOutcome::Done);
    }

    /// Not closable right now; the state decides whether to retry.
    pub fn defer(mut self) {
        self.0.resolve(CloseOutcome::Deferred);
    }
}

/// Answer to an acquire. Fires `false` if dropped unsent.
pub(crate) struct AcquireReply {
    callback: Option<Box<dyn FnOnce(bool) + Send>>,
    timer: Option<OperationTimer>,
}

impl AcquireReply {
    pub(crate) fn new<F>(callback: F, timer: Option<OperationTimer>) -> Self
    where
        F: FnOnce(bool) + Send + 'static,
    {
        Self {
            callback: Some(Box::new(callback)),
            timer,
        }
    }

    pub(crate) fn send(mut self, acquired: bool) {
        self.fire(acquired);
    }

    fn fire(&mut self, acquired: bool) {
        // Stats are settled before the caller observes the result.
        drop(self.timer.take());
        if let Some(callback) = self.callback.take() {
            callback(acquired);
        }
    }
}

impl Drop for AcquireReply {
    fn drop(&mut self) {
        self.fire(false);
    }
}

/// Answer to a release.
///
/// Handed to the delete callback when the state became deletable; the
/// callback destroys the state and then calls [`send`](Self::send). A reply
/// dropped unsent fires anyway.
pub struct ReleaseReply {
    callback: Option<Box<dyn FnOnce(ReleaseOutcome) + Send>>,
    timer: Option<OperationTimer>,
    outcome: ReleaseOutcome,
}

impl ReleaseReply {
    pub(crate) fn new<F>(callback: F, timer: Option<OperationTimer>) -> Self
    where
        F: FnOnce(ReleaseOutcome) + Send + 'static,
    {
        Self {
            callback: Some(Box::new(callback)),
            timer,
            outcome: ReleaseOutcome::Retained,
        }
    }

    pub(crate) fn into_deleted(mut self) -> Self {
        self.outcome = ReleaseOutcome::Deleted;
        self
    }

    pub(crate) fn into_retained(mut self) -> Self {
        self.outcome = ReleaseOutcome::Retained;
        self
    }

    /// Outcome the caller will observe.
    pub const fn outcome(&self) -> ReleaseOutcome {
        self.outcome
    }

    /// Report the release as finished.
    pub fn send(mut self) {
        self.fire();
    }

    fn fire(&mut self) {
        drop(self.timer.take());
        if let Some(callback) = self.callback.take() {
            callback(self.outcome);
        }
    }
}

impl Drop for ReleaseReply {
    fn drop(&mut self) {
        self.fire();
    }
}

impl fmt::Debug for ReleaseReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReleaseReply")
            .field("outcome", &self.outcome)
            .field("sent", &self.callback.is_none())
            .finish()
    }
}

/// Destroys a deletable state, then answers the release.
pub type DeleteCallback = Box<dyn FnOnce(ReleaseReply) + Send>;

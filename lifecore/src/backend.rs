//! Backend interface driven by a resource state.
//!
//! A backend owns the expensive part of a resource: it knows how to open,
//! load, unload and close it, and decides when each step applies. Every
//! operation is asynchronous; the state hands the backend a completion
//! handle and the backend resolves it whenever the work is done, on any
//! thread.
//!
//! The capability predicates default to the usual rules (see
//! [`StateSnapshot`]'s `default_*` helpers). A resource without a load step
//! simply answers `false` from [`can_load`](ResourceBackend::can_load).

use std::sync::Arc;

use crate::resource::{
    CloseCompletion, LifecycleState, LoadCompletion, OpenCompletion, StateSnapshot,
    UnloadCompletion,
};

pub mod file;

pub use file::{FileBackend, FileLoader};

/// Operations and capability predicates of a managed resource.
///
/// Backend methods are called from the resource's execution queue and must
/// not block it; long work belongs on a spawned task.
pub trait ResourceBackend: Send + Sync + 'static {
    /// Diagnostic tag naming the kind of resource.
    fn managing_type_name(&self) -> &'static str;

    /// Opaque numeric identifier, used in logs.
    fn short_id(&self) -> u32;

    /// Whether the resource is streamed: loaded only while streaming users
    /// exist.
    fn is_streamed(&self) -> bool {
        false
    }

    /// Whether the state should open the resource now.
    fn can_open(&self, snapshot: &StateSnapshot) -> bool {
        snapshot.default_can_open()
    }

    /// Whether the state should load the resource now.
    fn can_load(&self, snapshot: &StateSnapshot) -> bool {
        snapshot.default_can_load(self.is_streamed())
    }

    /// Whether the state should unload the resource now.
    fn can_unload(&self, snapshot: &StateSnapshot) -> bool {
        snapshot.default_can_unload(self.is_streamed())
    }

    /// Whether the state should close the resource now.
    fn can_close(&self, snapshot: &StateSnapshot) -> bool {
        snapshot.default_can_close()
    }

    /// Called after every state change, from the execution queue.
    fn on_transition(&self, _from: LifecycleState, _to: LifecycleState) {}

    /// Open the resource and resolve `completion`.
    fn open(self: Arc<Self>, completion: OpenCompletion);

    /// Load the opened resource and resolve `completion`.
    fn load(self: Arc<Self>, completion: LoadCompletion);

    /// Unload the resource and resolve `completion`.
    fn unload(self: Arc<Self>, completion: UnloadCompletion);

    /// Close the resource and resolve `completion`.
    fn close(self: Arc<Self>, completion: CloseCompletion);
}

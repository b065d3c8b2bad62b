//! Owner of the id → state map.
//!
//! The registry creates a [`ResourceState`] on the first acquire for an id
//! and destroys it when a release leaves it deletable. Creation and
//! destruction both happen under the map lock, and an acquire is admitted
//! (its opened instance counted) before the lock is released, so a state
//! is never removed while an acquire for it is on its way.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::backend::ResourceBackend;
use crate::config::{LifecycleConfig, ShutdownSignal};
use crate::monitor::{LifecycleStats, ResourceLeakDetector};
use crate::resource::{OperationOrigin, ReleaseOutcome, ReleaseReply, ResourceState};

type StateMap<B> = HashMap<u32, Arc<ResourceState<B>>>;

/// Live resource states keyed by id.
pub struct ResourceRegistry<B: ResourceBackend> {
    states: Arc<Mutex<StateMap<B>>>,
    config: LifecycleConfig,
    stats: Arc<LifecycleStats>,
    shutdown: ShutdownSignal,
    leak_detector: Arc<ResourceLeakDetector>,
}

fn state_key(resource_type: &str, id: u32) -> String {
    format!("{resource_type}:{id}")
}

impl<B: ResourceBackend> ResourceRegistry<B> {
    /// Create an empty registry with default configuration.
    pub fn new() -> Self {
        Self::with_config(LifecycleConfig::default())
    }

    /// Create an empty registry.
    pub fn with_config(config: LifecycleConfig) -> Self {
        Self {
            states: Arc::new(Mutex::new(HashMap::new())),
            config,
            stats: Arc::new(LifecycleStats::new()),
            shutdown: ShutdownSignal::new(),
            leak_detector: Arc::new(ResourceLeakDetector::new()),
        }
    }

    /// Acquire resource `id`, creating its state with `make_backend` if it
    /// has none.
    pub fn acquire_async<M, F>(&self, id: u32, origin: OperationOrigin, make_backend: M, callback: F)
    where
        M: FnOnce() -> B,
        F: FnOnce(bool) + Send + 'static,
    {
        let mut states = self.states.lock();
        let state = states.entry(id).or_insert_with(|| {
            let state = ResourceState::with_monitoring(
                Arc::new(make_backend()),
                self.config.clone(),
                Arc::clone(&self.stats),
                self.shutdown.clone(),
            );
            debug!(
                resource_type = state.resource_type(),
                short_id = id,
                "Creating resource state"
            );
            self.leak_detector
                .register_creation(&state_key(state.resource_type(), id), state.resource_type());
            Arc::new(state)
        });
        state.acquire_async(origin, callback);
    }

    /// Awaitable form of [`acquire_async`](Self::acquire_async).
    pub async fn acquire<M>(&self, id: u32, origin: OperationOrigin, make_backend: M) -> bool
    where
        M: FnOnce() -> B,
    {
        let (tx, rx) = oneshot::channel();
        self.acquire_async(id, origin, make_backend, move |acquired| {
            let _ = tx.send(acquired);
        });
        rx.await.unwrap_or(false)
    }

    /// Release resource `id`, destroying its state if it ends up deletable.
    pub fn release_async<F>(&self, id: u32, origin: OperationOrigin, callback: F)
    where
        F: FnOnce(ReleaseOutcome) + Send + 'static,
    {
        let Some(state) = self.get(id) else {
            error!(short_id = id, "Release of an unknown resource");
            callback(ReleaseOutcome::Retained);
            return;
        };

        let states = Arc::clone(&self.states);
        let detector = Arc::clone(&self.leak_detector);
        let weak = Arc::downgrade(&state);
        state.release_async(
            origin,
            move |reply| delete_state(&states, &detector, id, &weak, reply),
            callback,
        );
    }

    /// Awaitable form of [`release_async`](Self::release_async).
    pub async fn release(&self, id: u32, origin: OperationOrigin) -> ReleaseOutcome {
        let (tx, rx) = oneshot::channel();
        self.release_async(id, origin, move |outcome| {
            let _ = tx.send(outcome);
        });
        rx.await.unwrap_or(ReleaseOutcome::Retained)
    }

    /// The live state for `id`.
    pub fn get(&self, id: u32) -> Option<Arc<ResourceState<B>>> {
        self.states.lock().get(&id).cloned()
    }

    /// Whether `id` has a live state.
    pub fn contains(&self, id: u32) -> bool {
        self.states.lock().contains_key(&id)
    }

    /// Number of live states.
    pub fn len(&self) -> usize {
        self.states.lock().len()
    }

    /// Whether no state is live.
    pub fn is_empty(&self) -> bool {
        self.states.lock().is_empty()
    }

    /// Statistics shared by every state of this registry.
    pub const fn stats(&self) -> &Arc<LifecycleStats> {
        &self.stats
    }

    /// Tracker of live states.
    pub const fn leak_detector(&self) -> &Arc<ResourceLeakDetector> {
        &self.leak_detector
    }

    /// Exit flag shared with every state of this registry.
    pub const fn shutdown_signal(&self) -> &ShutdownSignal {
        &self.shutdown
    }

    /// Mark the coming shutdown as intentional. States terminated from now
    /// on log leftovers quietly.
    pub fn request_exit(&self) {
        self.shutdown.request_exit();
    }

    /// Terminate and forget every live state.
    pub async fn term_all(&self) {
        let states: Vec<_> = self.states.lock().drain().collect();
        if states.is_empty() {
            return;
        }
        info!(count = states.len(), "Terminating all resource states");

        join_all(states.iter().map(|(_, state)| state.term())).await;
        for (id, state) in &states {
            self.leak_detector
                .register_destruction(&state_key(state.resource_type(), *id));
        }
    }
}

fn delete_state<B: ResourceBackend>(
    states: &Mutex<StateMap<B>>,
    detector: &ResourceLeakDetector,
    id: u32,
    weak: &Weak<ResourceState<B>>,
    reply: ReleaseReply,
) {
    let removed = weak.upgrade().and_then(|state| {
        let mut states = states.lock();
        let current = states.get(&id)?;
        // An acquire admitted since the release finished keeps the state alive.
        if Arc::ptr_eq(current, &state) && state.opened_instances() == 0 {
            states.remove(&id)
        } else {
            None
        }
    });

    let Some(state) = removed else {
        debug!(short_id = id, "State revived before deletion, keeping it");
        reply.into_retained().send();
        return;
    };

    debug!(
        resource_type = state.resource_type(),
        short_id = id,
        "Deleting resource state"
    );
    detector.register_destruction(&state_key(state.resource_type(), id));
    tokio::spawn(async move {
        state.term().await;
        drop(state);
        reply.send();
    });
}

impl<B: ResourceBackend> Default for ResourceRegistry<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: ResourceBackend> Drop for ResourceRegistry<B> {
    fn drop(&mut self) {
        let live = self.states.lock().len();
        if live > 0 {
            warn!(live, "Dropping resource registry with live states");
        }
    }
}

impl<B: ResourceBackend> fmt::Debug for ResourceRegistry<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceRegistry")
            .field("live_states", &self.len())
            .field("exit_requested", &self.shutdown.is_exit_requested())
            .finish_non_exhaustive()
    }
}
